//! Tollgate - attempt limiting and subscription lifecycle service
//!
//! This crate locks out (user, action) pairs after repeated attempts and
//! drives paid subscriptions through checkout, gateway webhooks and
//! cancellation. State lives behind versioned store traits so concurrent
//! writers retry instead of overwriting each other.

pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod ratelimit;
pub mod store;
pub mod subscription;

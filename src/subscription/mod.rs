//! Subscription lifecycle: plans, billing status and gateway webhooks.

mod events;
mod machine;
mod model;
mod service;
pub mod signature;

pub use events::{parse_webhook, PaymentFailure, PaymentReceipt, WebhookEnvelope, WebhookEvent};
pub use machine::{apply, BillingPolicy, Transition};
pub use model::{PaymentHistory, PaymentStatus, PlanType, Subscription, SubscriptionStatus};
pub use service::{CreateSubscription, SubscriptionService, SubscriptionView, WebhookOutcome};

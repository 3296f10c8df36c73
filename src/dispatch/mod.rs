//! Outbound delivery
//! Mission: Decisions reach webhooks, chat, and paging without touching the hot path

pub mod alerts;
pub mod webhooks;

pub use alerts::AlertManager;
pub use webhooks::{WebhookDispatcher, WebhookStore};

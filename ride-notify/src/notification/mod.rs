//! Rider notifications: the bus handler and its message templates.

mod handler;
pub mod templates;

pub use handler::{
    Audience, NotificationRule, RideNotificationHandler, dedupe_key, default_rules,
};
pub use templates::MessageTemplates;

//! Domain value objects.

mod backoff;
mod priority;

pub use backoff::BackoffPolicy;
pub use priority::NotificationPriority;

//! Domain layer: rides, events, notifications and their value objects.

pub mod events;
pub mod notification;
pub mod receipt;
pub mod ride;
pub mod value_objects;

pub use events::{DomainEvent, DomainEventKind};
pub use notification::{
    FailureSource, NewNotification, NotificationChannel, NotificationItem, NotificationMetadata,
    NotificationStatus, RetryHistoryEntry,
};
pub use receipt::{DeliveryReceipt, ProviderStatus, ReceiptStatus};
pub use ride::RideDocument;
pub use value_objects::*;

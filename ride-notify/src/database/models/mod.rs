//! Database models.

pub mod checkpoint;
pub mod notification;
pub mod ride;

pub use checkpoint::ChangeFeedCheckpointDbModel;
pub use notification::{NotificationItemDbModel, StatusCounts};
pub use ride::{RideChangeDbModel, RideDbModel};

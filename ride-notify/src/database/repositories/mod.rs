//! Repository layer for database access.

pub mod checkpoint;
pub mod notification;
pub mod ride;

pub use checkpoint::*;
pub use notification::*;
pub use ride::*;

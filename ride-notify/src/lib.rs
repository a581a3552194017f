//! ride-notify library crate.
//!
//! Watches ride records for status changes, turns them into rider
//! notifications, and delivers those through a durable priority queue with
//! retries and bounded concurrency.

pub mod api;
pub mod bus;
pub mod change_feed;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod logging;
pub mod notification;
pub mod panic_hook;
pub mod queue;
pub mod reconciler;
pub mod scheduler;
pub mod sender;
pub mod services;
pub mod translator;

pub use error::{Error, Result};

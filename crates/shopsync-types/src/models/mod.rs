//! Data models shared across shopsync crates

pub mod message;
pub mod notification;

pub use message::{MessageRecord, SenderRole};
pub use notification::{DerivedNotificationView, NotificationSnapshot, RemoteNotificationItem};

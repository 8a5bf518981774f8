//! shopsync-types - Shared data types for shopsync
//!
//! This crate contains pure data structures without heavy dependencies.
//! No tokio, no async runtime - just serde-serializable types.
//!
//! Used by:
//! - shopsync-core (cache, push channel, reconciliation)
//! - shopsync (command-line front end)

pub mod models;

pub use models::{
    DerivedNotificationView, MessageRecord, NotificationSnapshot, RemoteNotificationItem,
    SenderRole,
};

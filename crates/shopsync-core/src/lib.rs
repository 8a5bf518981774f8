//! shopsync-core - Client-side data synchronization core for shopsync
//!
//! Provides the response cache, fetch orchestration, the push channel,
//! persisted notification flags, notification reconciliation and message
//! merging.

pub mod auth;
pub mod cache;
pub mod channel;
pub mod client;
pub mod error;
pub mod event;
pub mod fetch;
pub mod flags;
pub mod messages;
pub mod notifications;
pub mod storage;

pub use auth::{identity_channel, Credential, IdentitySignal};
pub use cache::{CacheConfig, CacheStats, ResponseCache, TtlClass};
pub use channel::{
    ChannelConfig, ChannelState, ChannelStatus, Connection, Connector, HeartbeatConfig,
    PushChannel, WsConnector,
};
pub use client::{SyncClient, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use event::{ChannelEvent, Delivery, EventBus, PushEvent};
pub use fetch::{Backend, BatchResult, FetchConfig, FetchRequest, Fetcher, RestBackend};
pub use flags::{FlagKind, FlagStore};
pub use messages::{MergeOutcome, MergerConfig, MessageMerger};
pub use notifications::{NotificationCenter, NOTIFICATIONS_ENDPOINT};
pub use storage::{FileStorage, MemoryStorage, SharedMemoryStorage, StorageArea, StorageChange};

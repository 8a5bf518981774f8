//! Caching layer for shopsync-core
//!
//! Memory-only response cache with class-based TTLs. Nothing here survives a
//! process restart.

pub mod key;
pub mod response_cache;

pub use key::fingerprint;
pub use response_cache::{CacheConfig, CacheStats, ResponseCache, TtlClass, DEFAULT_TTL_CLASS};

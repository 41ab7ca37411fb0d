//! Data layer
//!
//! - `models`: database entities and ID types
//! - `database`: SQLite store (sqlx)
//! - `cache`: in-memory TTL caches for remote actors and capabilities

mod cache;
mod database;
mod models;

pub use cache::{CacheStats, CapabilityCache, RemoteActor, RemoteActorCache};
pub use database::Database;
pub use models::{
    ActivityType, ActivityTypeCount, ActorKeyPair, DeliveryLogRecord, DeliveryLogSummary,
    DeliveryStats, DeliveryStatus, EntityId, Profile,
};

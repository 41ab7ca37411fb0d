//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Delivery status
// =============================================================================

/// Status of a delivery log record
///
/// PENDING persists across retries; DELIVERED and FAILED are terminal
/// except for an explicit operator retry (FAILED -> PENDING).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    /// Parse from stored string; unknown values map to None.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

// =============================================================================
// Activity types
// =============================================================================

/// The activity families this subsystem delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Follow,
    UndoFollow,
    Like,
    UndoLike,
    EmojiReact,
    UndoEmojiReact,
    CreateComment,
    DirectMessage,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::UndoFollow => "undo_follow",
            Self::Like => "like",
            Self::UndoLike => "undo_like",
            Self::EmojiReact => "emoji_react",
            Self::UndoEmojiReact => "undo_emoji_react",
            Self::CreateComment => "create_comment",
            Self::DirectMessage => "direct_message",
        }
    }

    /// Parse from stored string; unknown values map to None.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "follow" => Some(Self::Follow),
            "undo_follow" => Some(Self::UndoFollow),
            "like" => Some(Self::Like),
            "undo_like" => Some(Self::UndoLike),
            "emoji_react" => Some(Self::EmojiReact),
            "undo_emoji_react" => Some(Self::UndoEmojiReact),
            "create_comment" => Some(Self::CreateComment),
            "direct_message" => Some(Self::DirectMessage),
            _ => None,
        }
    }
}

// =============================================================================
// Actor key pair
// =============================================================================

/// Signing key pair for a local actor
///
/// Exactly one active pair exists per actor. Never regenerated silently:
/// rotating a key invalidates every signature remote peers have verified.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActorKeyPair {
    /// Local actor ID this pair belongs to
    pub actor_id: String,
    /// RSA public key (SPKI PEM)
    pub public_key_pem: String,
    /// RSA private key (PKCS#8 PEM); at-rest protection is handled by the
    /// platform's secrets collaborator
    pub private_key_pem: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Profiles
// =============================================================================

/// Minimal actor profile used for WebFinger lookups and admin enrichment
///
/// Local actors have an empty `domain`; remote actors carry theirs.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    /// Empty string for local actors, remote domain otherwise
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Whether this profile belongs to a local actor
    pub fn is_local(&self) -> bool {
        self.domain.is_empty()
    }
}

// =============================================================================
// Delivery log
// =============================================================================

/// Durable audit record for one delivery to one inbox
///
/// Append-only: records are never hard-deleted. The payload holds the exact
/// bytes accepted for delivery and stays byte-stable across retries so a
/// replay reproduces the originally intended side effect.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryLogRecord {
    pub id: String,
    /// Local actor that sent the activity
    pub sender_id: String,
    /// Target inbox URL
    pub inbox_url: String,
    /// Activity family tag (see [`ActivityType`])
    pub activity_type: String,
    /// Exact serialized activity bytes, frozen at accept time
    pub payload: Vec<u8>,
    /// pending | delivered | failed
    pub status: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    /// Job ID in the external delivery queue, for cross-referencing
    pub queue_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryLogRecord {
    /// Create a fresh PENDING record for one inbox
    pub fn new(
        sender_id: &str,
        inbox_url: &str,
        activity_type: ActivityType,
        payload: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            sender_id: sender_id.to_string(),
            inbox_url: inbox_url.to_string(),
            activity_type: activity_type.as_str().to_string(),
            payload,
            status: DeliveryStatus::Pending.as_str().to_string(),
            attempt_count: 0,
            last_error: None,
            queue_job_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Parsed status, if the stored value is known
    pub fn delivery_status(&self) -> Option<DeliveryStatus> {
        DeliveryStatus::parse(&self.status)
    }
}

/// Delivery log row without the payload, for list views
///
/// The full payload is large and sensitive; it is only exposed through
/// single-record fetches.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryLogSummary {
    pub id: String,
    pub sender_id: String,
    pub inbox_url: String,
    pub activity_type: String,
    pub status: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub queue_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate delivery counts for operator dashboards
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryStats {
    pub pending: i64,
    pub delivered: i64,
    pub failed: i64,
    pub total: i64,
    pub by_type: Vec<ActivityTypeCount>,
}

/// Per-activity-type record count
#[derive(Debug, Clone, Serialize)]
pub struct ActivityTypeCount {
    pub activity_type: String,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_status_round_trips_known_values() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("queued"), None);
    }

    #[test]
    fn activity_type_round_trips_known_values() {
        for activity_type in [
            ActivityType::Follow,
            ActivityType::UndoFollow,
            ActivityType::Like,
            ActivityType::UndoLike,
            ActivityType::EmojiReact,
            ActivityType::UndoEmojiReact,
            ActivityType::CreateComment,
            ActivityType::DirectMessage,
        ] {
            assert_eq!(ActivityType::parse(activity_type.as_str()), Some(activity_type));
        }
        assert_eq!(ActivityType::parse("announce"), None);
    }

    #[test]
    fn new_record_starts_pending_with_zero_attempts() {
        let record = DeliveryLogRecord::new(
            "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "https://remote.example/users/bob/inbox",
            ActivityType::Follow,
            br#"{"type":"Follow"}"#.to_vec(),
        );

        assert_eq!(record.delivery_status(), Some(DeliveryStatus::Pending));
        assert_eq!(record.attempt_count, 0);
        assert!(record.last_error.is_none());
        assert!(record.queue_job_id.is_none());
    }
}

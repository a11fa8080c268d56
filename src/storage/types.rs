use crate::quota::{PlanTier, Quota, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Sender::User),
            "assistant" => Some(Sender::Assistant),
            _ => None,
        }
    }
}

/// Delivery status of a chat message
///
/// `Incomplete` marks an assistant reply cut short by a client
/// disconnect or an upstream fault; the stored content is exactly what
/// the client received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Complete,
    Incomplete,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Complete => "complete",
            MessageStatus::Incomplete => "incomplete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(MessageStatus::Complete),
            "incomplete" => Some(MessageStatus::Incomplete),
            _ => None,
        }
    }
}

/// Lifecycle state of a knowledge store
///
/// `active -> expiring -> expired -> recreating -> active(new)`, with
/// `deleted` terminal and reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreStatus {
    Active,
    Expiring,
    Expired,
    Recreating,
    Deleted,
}

impl StoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStatus::Active => "active",
            StoreStatus::Expiring => "expiring",
            StoreStatus::Expired => "expired",
            StoreStatus::Recreating => "recreating",
            StoreStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(StoreStatus::Active),
            "expiring" => Some(StoreStatus::Expiring),
            "expired" => Some(StoreStatus::Expired),
            "recreating" => Some(StoreStatus::Recreating),
            "deleted" => Some(StoreStatus::Deleted),
            _ => None,
        }
    }
}

/// One conversation between an account and an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    /// Unique identifier for the session
    pub id: String,
    /// Account that owns the session
    pub owner_id: String,
    /// Which configured agent the session talks to
    pub agent_slug: String,
    /// Opaque external conversation handle; immutable once set
    pub thread_ref: String,
    /// User-friendly title (or summary)
    pub title: String,
    /// When the session was created
    pub created_at: DateTime<Utc>,
}

/// One turn in a session, appended only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub sender: Sender,
    pub content: String,
    /// Whether attachments were uploaded with this message
    pub has_files: bool,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// One uploaded file linked to a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    /// Provider-assigned file handle
    pub file_handle: String,
    /// Original filename
    pub name: String,
    /// Uploaded size in bytes (post-compression for compressed images)
    pub size: u64,
    pub mime_type: String,
    /// Knowledge store indexing this file, for text-like files
    pub store_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A provider-side searchable file collection with a bounded lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeStore {
    pub id: String,
    /// Provider-assigned store handle referenced by completion calls
    pub store_handle: String,
    pub owner_id: String,
    pub session_id: Option<String>,
    pub file_count: i64,
    /// Provider-enforced expiry this system tracks and reacts to
    pub expires_at: DateTime<Utc>,
    pub status: StoreStatus,
    /// Handle of the replacement store once this one was recreated
    pub successor_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An account profile with its embedded usage ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    /// Bearer token presented by clients; issuance is out of scope
    pub api_token: String,
    pub plan: PlanTier,
    pub is_active: bool,
    pub quota: Quota,
    pub usage: Usage,
    pub quota_last_reset: Option<DateTime<Utc>>,
}

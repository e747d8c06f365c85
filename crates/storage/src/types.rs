use super::ids::{BackgroundId, MessageId, SessionId, SummaryId};

/// Storage-local message role, intentionally decoupled from prompt-layer role strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

/// One node of the conversation tree. `parent_id == None` means the node
/// sits on the main branch; a `Some` parent establishes a tree edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub parent_id: Option<MessageId>,
    pub created_at_unix_ms: i64,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub parent_id: Option<MessageId>,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, parent_id: Option<MessageId>) -> Self {
        Self {
            role,
            content: content.into(),
            parent_id,
        }
    }
}

/// Append-only compaction record. The underlying messages are never
/// altered; the summary is consumed only when building model context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRecord {
    pub id: SummaryId,
    pub summary_text: String,
    pub start_message_id: MessageId,
    pub end_message_id: MessageId,
    pub message_ids: Vec<MessageId>,
    pub created_at_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSummary {
    pub summary_text: String,
    pub start_message_id: MessageId,
    pub end_message_id: MessageId,
    pub message_ids: Vec<MessageId>,
}

/// Rolling user-profile summary, independent of any single branch.
/// Versions are append-only; only the highest version is read by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundRecord {
    pub id: BackgroundId,
    pub summary_text: String,
    pub source_message_ids: Vec<MessageId>,
    pub updated_at_unix_ms: i64,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBackground {
    pub summary_text: String,
    pub source_message_ids: Vec<MessageId>,
}

/// The single per-device cursor. `current_message_id == None` means the
/// main branch is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub current_message_id: Option<MessageId>,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
}

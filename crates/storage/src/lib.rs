pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{BackgroundId, MessageId, SessionId, SummaryId};
pub use sqlite::SqliteStorage;
pub use types::{
    BackgroundRecord, MessageRecord, MessageRole, NewBackground, NewMessage, NewSummary,
    SessionRecord, SummaryRecord,
};

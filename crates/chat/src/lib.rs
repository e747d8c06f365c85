pub mod branch;
pub mod context;
pub mod controller;
pub mod error;
pub mod prompt;

pub use branch::{MessageTree, active_branch_messages};
pub use context::{ContextPolicy, SUMMARY_MARKER};
pub use controller::{ChatConfig, ChatController, TurnOutcome};
pub use error::{ChatError, ChatResult};

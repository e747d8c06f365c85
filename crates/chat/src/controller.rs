use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mindcoach_llm::{
    CompletionRequest, CompletionService, RetryPolicy, Turn, TurnRole, complete_with_retry,
};
use mindcoach_storage::{
    BackgroundRecord, MessageId, MessageRecord, MessageRole, NewBackground, NewMessage, NewSummary,
    SessionId, SqliteStorage,
};
use snafu::{OptionExt, ResultExt, ensure};

use crate::branch::{MessageTree, active_branch_messages};
use crate::context::{ContextPolicy, exceeds_budget, split_for_compaction, summary_context_text};
use crate::error::{
    ChatResult, CompletionSnafu, EmptyMessageSnafu, StorageSnafu, TurnInProgressSnafu,
};
use crate::prompt;

/// How many completed turns pass between background profile refreshes.
pub const DEFAULT_BACKGROUND_REFRESH_INTERVAL: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct ChatConfig {
    pub context: ContextPolicy,
    pub retry: RetryPolicy,
    /// Zero disables background refreshes entirely.
    pub background_refresh_interval: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            context: ContextPolicy::default(),
            retry: RetryPolicy::default(),
            background_refresh_interval: DEFAULT_BACKGROUND_REFRESH_INTERVAL,
        }
    }
}

/// Both persisted halves of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub user_message: MessageRecord,
    pub assistant_message: MessageRecord,
}

/// The exact id set flipped by the last delete. Undo restores this set
/// and nothing else, so nodes that were already deleted beforehand stay
/// deleted.
#[derive(Debug, Clone)]
struct DeletedCascade {
    root: MessageId,
    message_ids: Vec<MessageId>,
}

/// Orchestrates one conversation: persists turns, resolves the active
/// branch, compacts oversized context, calls the completion service with
/// retry, and maintains the cursor and the rolling user background.
pub struct ChatController {
    storage: SqliteStorage,
    service: Arc<dyn CompletionService>,
    config: ChatConfig,
    session_id: SessionId,
    in_flight: AtomicBool,
    turns_since_background: AtomicU32,
    undo_buffer: Mutex<Option<DeletedCascade>>,
}

impl ChatController {
    pub async fn new(
        storage: SqliteStorage,
        service: Arc<dyn CompletionService>,
        config: ChatConfig,
    ) -> ChatResult<Self> {
        let session = storage.load_or_create_session().await.context(StorageSnafu {
            stage: "controller-open-session",
        })?;

        Ok(Self {
            storage,
            service,
            config,
            session_id: session.id,
            in_flight: AtomicBool::new(false),
            turns_since_background: AtomicU32::new(0),
            undo_buffer: Mutex::new(None),
        })
    }

    /// Runs one full turn: persists the user message, builds the model
    /// context from the active branch, obtains a reply with retry, and
    /// persists the assistant message. `parent_message_id` decides where
    /// the turn lands: `None` appends to the main branch, `Some` deepens
    /// the branch under that message.
    pub async fn send_message(
        &self,
        text: &str,
        parent_message_id: Option<MessageId>,
    ) -> ChatResult<TurnOutcome> {
        let content = text.trim();
        ensure!(
            !content.is_empty(),
            EmptyMessageSnafu {
                stage: "send-validate-content",
            }
        );

        let _turn = InFlightGuard::acquire(&self.in_flight).context(TurnInProgressSnafu {
            stage: "send-acquire-turn",
        })?;

        let user_message = self
            .storage
            .append_message(NewMessage::new(MessageRole::User, content, parent_message_id))
            .await
            .context(StorageSnafu {
                stage: "send-persist-user",
            })?;

        let live = self.storage.list_messages(false).await.context(StorageSnafu {
            stage: "send-list-live",
        })?;
        let session = self
            .storage
            .load_or_create_session()
            .await
            .context(StorageSnafu {
                stage: "send-load-session",
            })?;

        let mut branch = self.resolve_branch(&live, session.current_message_id);
        // The freshly written user node must reach the model even when the
        // cursor points somewhere that does not contain it.
        if !branch.iter().any(|message| message.id == user_message.id) {
            branch.push(user_message.clone());
            branch.sort_by_key(|message| (message.created_at_unix_ms, message.id));
        }

        let context_messages = self.compact_context(branch).await;

        let background = self.current_background().await;
        let request = CompletionRequest::new(
            turns_for(&context_messages),
            prompt::coach_system_prompt(
                background
                    .as_ref()
                    .map(|background| background.summary_text.as_str()),
            ),
        );

        let reply = complete_with_retry(self.service.as_ref(), request, self.config.retry)
            .await
            .context(CompletionSnafu {
                stage: "send-complete",
            })?;

        // A branch reply hangs off the user node; a main-line reply stays flat.
        let assistant_parent = parent_message_id.map(|_| user_message.id);
        let assistant_message = self
            .storage
            .append_message(NewMessage::new(
                MessageRole::Assistant,
                reply.trim(),
                assistant_parent,
            ))
            .await
            .context(StorageSnafu {
                stage: "send-persist-assistant",
            })?;

        let refreshed = self.storage.list_messages(false).await.context(StorageSnafu {
            stage: "send-refresh-live",
        })?;

        if parent_message_id.is_some() {
            let tree = MessageTree::build(&refreshed);
            let branch_root = tree
                .branch_root_of(user_message.id)
                .unwrap_or(user_message.id);
            self.storage
                .set_session_cursor(self.session_id, Some(branch_root))
                .await
                .context(StorageSnafu {
                    stage: "send-set-cursor",
                })?;
        } else if session.current_message_id.is_some() {
            self.storage
                .set_session_cursor(self.session_id, None)
                .await
                .context(StorageSnafu {
                    stage: "send-clear-cursor",
                })?;
        }

        self.maybe_refresh_background(&refreshed).await;

        Ok(TurnOutcome {
            user_message,
            assistant_message,
        })
    }

    /// Messages visible under the current cursor, oldest first. A cursor
    /// pointing at nothing visible falls back to the main branch.
    pub async fn current_branch(&self) -> ChatResult<Vec<MessageRecord>> {
        let live = self.storage.list_messages(false).await.context(StorageSnafu {
            stage: "branch-list-live",
        })?;
        let session = self
            .storage
            .load_or_create_session()
            .await
            .context(StorageSnafu {
                stage: "branch-load-session",
            })?;

        Ok(self.resolve_branch(&live, session.current_message_id))
    }

    pub async fn cursor(&self) -> ChatResult<Option<MessageId>> {
        let session = self
            .storage
            .load_or_create_session()
            .await
            .context(StorageSnafu {
                stage: "cursor-load-session",
            })?;
        Ok(session.current_message_id)
    }

    /// Moves the cursor into the branch containing `from_message_id`. The
    /// cursor lands on the branch root, or on the message itself when it
    /// sits on the main branch. Pointing at a missing message is a no-op.
    pub async fn enter_branch(&self, from_message_id: MessageId) -> ChatResult<()> {
        let Some(message) = self
            .storage
            .get_message(from_message_id)
            .await
            .context(StorageSnafu {
                stage: "enter-branch-get-message",
            })?
        else {
            tracing::warn!(message_id = %from_message_id, "cannot enter a branch from a missing message");
            return Ok(());
        };

        let cursor = if message.parent_id.is_none() {
            message.id
        } else {
            let live = self.storage.list_messages(false).await.context(StorageSnafu {
                stage: "enter-branch-list-live",
            })?;
            let tree = MessageTree::build(&live);
            tree.branch_root_of(message.id).unwrap_or(message.id)
        };

        self.storage
            .set_session_cursor(self.session_id, Some(cursor))
            .await
            .context(StorageSnafu {
                stage: "enter-branch-set-cursor",
            })
    }

    pub async fn return_to_main(&self) -> ChatResult<()> {
        self.storage
            .set_session_cursor(self.session_id, None)
            .await
            .context(StorageSnafu {
                stage: "return-to-main-clear-cursor",
            })
    }

    /// Soft-deletes a message and its whole visible subtree, remembering
    /// the exact id set for a later undo. Returns how many rows were
    /// actually flipped.
    pub async fn delete_message(&self, message_id: MessageId) -> ChatResult<u64> {
        let live = self.storage.list_messages(false).await.context(StorageSnafu {
            stage: "delete-list-live",
        })?;
        let tree = MessageTree::build(&live);
        if tree.get(message_id).is_none() {
            tracing::warn!(message_id = %message_id, "delete target is missing or already deleted");
            return Ok(0);
        }

        let mut cascade = vec![message_id];
        cascade.extend(tree.subtree(message_id).iter().map(|message| message.id));

        let flipped = self
            .storage
            .set_messages_deleted(&cascade, true)
            .await
            .context(StorageSnafu {
                stage: "delete-apply",
            })?;

        *self.undo_slot() = Some(DeletedCascade {
            root: message_id,
            message_ids: cascade.clone(),
        });

        self.rebuild_background_if_affected(&cascade).await;

        Ok(flipped)
    }

    /// Restores exactly the set removed by the last delete. Only the root
    /// id of that delete is accepted; anything else is a no-op.
    pub async fn undo_delete(&self, message_id: MessageId) -> ChatResult<u64> {
        let cascade = {
            let mut slot = self.undo_slot();
            match slot.as_ref() {
                Some(cascade) if cascade.root == message_id => slot.take(),
                _ => None,
            }
        };
        let Some(cascade) = cascade else {
            tracing::warn!(message_id = %message_id, "no buffered delete matches this undo");
            return Ok(0);
        };

        let restored = self
            .storage
            .set_messages_deleted(&cascade.message_ids, false)
            .await
            .context(StorageSnafu {
                stage: "undo-apply",
            })?;

        // Restored messages change what the background should say, so any
        // existing background gets regenerated.
        if self.current_background().await.is_some() {
            self.rebuild_background_from_live().await;
        }

        Ok(restored)
    }

    fn resolve_branch(
        &self,
        live: &[MessageRecord],
        cursor: Option<MessageId>,
    ) -> Vec<MessageRecord> {
        let branch = active_branch_messages(live, cursor);
        if branch.is_empty() && cursor.is_some() {
            tracing::warn!("cursor points at no visible message; falling back to the main branch");
            return active_branch_messages(live, None);
        }
        branch
    }

    /// Replaces the older part of an oversized branch with a single
    /// summary message. Any failure along the way leaves the branch
    /// untouched; compaction is an optimization, not a requirement.
    async fn compact_context(&self, branch: Vec<MessageRecord>) -> Vec<MessageRecord> {
        if !exceeds_budget(&branch, self.config.context.token_budget) {
            return branch;
        }

        let (older, recent) = split_for_compaction(&branch, self.config.context.keep_recent);
        let (Some(first), Some(last)) = (older.first(), older.last()) else {
            return branch;
        };

        let request = CompletionRequest::new(
            vec![Turn::new(
                TurnRole::User,
                prompt::conversation_summary_prompt(older),
            )],
            prompt::CONVERSATION_SUMMARY_INSTRUCTION,
        );
        let summary = match self.service.complete(request).await {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            Ok(_) => {
                tracing::warn!("context summary came back blank; sending the full branch");
                return branch;
            }
            Err(error) => {
                tracing::warn!(error = %error, "context summarization failed; sending the full branch");
                return branch;
            }
        };

        let inserted = self
            .storage
            .insert_summary(NewSummary {
                summary_text: summary.clone(),
                start_message_id: first.id,
                end_message_id: last.id,
                message_ids: older.iter().map(|message| message.id).collect(),
            })
            .await;
        if let Err(error) = inserted {
            tracing::warn!(error = %error, "failed to persist context summary; sending the full branch");
            return branch;
        }

        // Synthetic carrier for the summary; it exists only in the model
        // context and is never persisted as a message.
        let summary_message = MessageRecord {
            id: MessageId::new_v7(),
            role: MessageRole::Assistant,
            content: summary_context_text(&summary),
            parent_id: None,
            created_at_unix_ms: last.created_at_unix_ms,
            is_deleted: false,
        };

        let mut compacted = Vec::with_capacity(recent.len() + 1);
        compacted.push(summary_message);
        compacted.extend(recent.iter().cloned());
        compacted
    }

    async fn maybe_refresh_background(&self, live: &[MessageRecord]) {
        let interval = self.config.background_refresh_interval;
        if interval == 0 {
            return;
        }

        let turns = self.turns_since_background.fetch_add(1, Ordering::Relaxed) + 1;
        if turns < interval {
            return;
        }

        if self.refresh_background(live).await {
            self.turns_since_background.store(0, Ordering::Relaxed);
        }
    }

    /// Produces the next background version from the given messages.
    /// Every failure is swallowed; the background is derived data and the
    /// next refresh will try again.
    async fn refresh_background(&self, messages: &[MessageRecord]) -> bool {
        if messages.is_empty() {
            return false;
        }

        let previous = match self.storage.latest_background().await {
            Ok(previous) => previous,
            Err(error) => {
                tracing::warn!(error = %error, "failed to load previous background; skipping refresh");
                return false;
            }
        };

        let request = CompletionRequest::new(
            vec![Turn::new(
                TurnRole::User,
                prompt::background_extraction_prompt(
                    messages,
                    previous
                        .as_ref()
                        .map(|background| background.summary_text.as_str()),
                ),
            )],
            prompt::BACKGROUND_EXTRACTION_INSTRUCTION,
        );

        let summary = match self.service.complete(request).await {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            Ok(_) => {
                tracing::warn!("background extraction came back blank; skipping refresh");
                return false;
            }
            Err(error) => {
                tracing::warn!(error = %error, "background extraction failed; skipping refresh");
                return false;
            }
        };

        let inserted = self
            .storage
            .insert_background(NewBackground {
                summary_text: summary,
                source_message_ids: messages.iter().map(|message| message.id).collect(),
            })
            .await;
        match inserted {
            Ok(background) => {
                tracing::debug!(version = background.version, "user background refreshed");
                true
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to persist refreshed background");
                false
            }
        }
    }

    /// Regenerates the background when a delete touched messages it was
    /// derived from. Best-effort like every other background write.
    async fn rebuild_background_if_affected(&self, changed_ids: &[MessageId]) {
        let Some(latest) = self.current_background().await else {
            return;
        };
        if !latest
            .source_message_ids
            .iter()
            .any(|source| changed_ids.contains(source))
        {
            return;
        }

        self.rebuild_background_from_live().await;
    }

    async fn rebuild_background_from_live(&self) {
        match self.storage.list_messages(false).await {
            Ok(remaining) => {
                self.refresh_background(&remaining).await;
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to list messages for a background rebuild");
            }
        }
    }

    async fn current_background(&self) -> Option<BackgroundRecord> {
        match self.storage.latest_background().await {
            Ok(latest) => latest,
            Err(error) => {
                tracing::warn!(error = %error, "failed to load the latest background");
                None
            }
        }
    }

    fn undo_slot(&self) -> MutexGuard<'_, Option<DeletedCascade>> {
        self.undo_buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn turns_for(messages: &[MessageRecord]) -> Vec<Turn> {
    messages
        .iter()
        .filter(|message| !message.content.trim().is_empty())
        .map(|message| {
            let role = match message.role {
                MessageRole::User => TurnRole::User,
                MessageRole::Assistant => TurnRole::Assistant,
            };
            Turn::new(role, message.content.clone())
        })
        .collect()
}

/// Releases the turn slot even when the turn future is dropped mid-way.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

use mindcoach_storage::MessageRecord;

/// Marker prefix on the synthetic message that carries a compaction
/// summary into the model context.
pub const SUMMARY_MARKER: &str = "[Previous conversation summary]";

pub const DEFAULT_TOKEN_BUDGET: usize = 640_000;
pub const DEFAULT_KEEP_RECENT: usize = 10;

/// Compaction knobs: when the estimated context crosses `token_budget`,
/// everything but the newest `keep_recent` messages is summarized away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextPolicy {
    pub token_budget: usize,
    pub keep_recent: usize,
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self {
            token_budget: DEFAULT_TOKEN_BUDGET,
            keep_recent: DEFAULT_KEEP_RECENT,
        }
    }
}

/// Rough token estimate: one token per four characters. Deliberately
/// crude; the budget is sized with plenty of slack for the error.
pub fn estimate_text_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Token estimate for a message sequence, counting a single joining
/// space between adjacent contents.
pub fn estimate_message_tokens(messages: &[MessageRecord]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let content_chars: usize = messages
        .iter()
        .map(|message| message.content.chars().count())
        .sum();
    (content_chars + messages.len() - 1) / 4
}

pub fn exceeds_budget(messages: &[MessageRecord], token_budget: usize) -> bool {
    estimate_message_tokens(messages) > token_budget
}

/// Splits a chronologically ordered sequence into the part to summarize
/// and the newest `keep_recent` messages to keep verbatim.
pub fn split_for_compaction(
    messages: &[MessageRecord],
    keep_recent: usize,
) -> (&[MessageRecord], &[MessageRecord]) {
    let cut = messages.len().saturating_sub(keep_recent);
    messages.split_at(cut)
}

pub fn summary_context_text(summary: &str) -> String {
    format!("{SUMMARY_MARKER}\n{summary}")
}

#[cfg(test)]
mod tests {
    use mindcoach_storage::{MessageId, MessageRole};

    use super::*;

    fn message(content: &str, created_at_unix_ms: i64) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            role: MessageRole::User,
            content: content.to_string(),
            parent_id: None,
            created_at_unix_ms,
            is_deleted: false,
        }
    }

    #[test]
    fn estimate_counts_characters_not_bytes() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcdefg"), 1);
        // Four multi-byte characters still estimate as one token.
        assert_eq!(estimate_text_tokens("日本語だ"), 1);
    }

    #[test]
    fn message_estimate_includes_joining_separators() {
        let messages = vec![message("ab", 1), message("cd", 2), message("ef", 3)];
        // 6 content chars + 2 separators = 8 chars -> 2 tokens.
        assert_eq!(estimate_message_tokens(&messages), 2);
        assert_eq!(estimate_message_tokens(&[]), 0);
    }

    #[test]
    fn estimate_never_shrinks_as_messages_are_appended() {
        let mut messages = Vec::new();
        let mut previous = 0;
        for index in 0..40 {
            messages.push(message(&"x".repeat(index % 7 + 1), index as i64));
            let current = estimate_message_tokens(&messages);
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn budget_check_is_a_strict_comparison() {
        let messages = vec![message(&"x".repeat(40), 1)];
        assert_eq!(estimate_message_tokens(&messages), 10);
        assert!(!exceeds_budget(&messages, 10));
        assert!(exceeds_budget(&messages, 9));
    }

    #[test]
    fn split_keeps_the_newest_messages_verbatim() {
        let messages: Vec<MessageRecord> = (0..15)
            .map(|index| message(&format!("m{index}"), index))
            .collect();

        let (older, recent) = split_for_compaction(&messages, 10);
        assert_eq!(older.len(), 5);
        assert_eq!(recent.len(), 10);
        assert_eq!(older.last().map(|m| m.content.as_str()), Some("m4"));
        assert_eq!(recent.first().map(|m| m.content.as_str()), Some("m5"));
    }

    #[test]
    fn split_with_few_messages_summarizes_nothing() {
        let messages: Vec<MessageRecord> =
            (0..3).map(|index| message("short", index)).collect();

        let (older, recent) = split_for_compaction(&messages, 10);
        assert!(older.is_empty());
        assert_eq!(recent.len(), 3);
    }

    #[test]
    fn summary_text_carries_the_marker_prefix() {
        let text = summary_context_text("we talked about work stress");
        assert!(text.starts_with(SUMMARY_MARKER));
        assert!(text.ends_with("we talked about work stress"));
    }
}

use mindcoach_storage::{MessageRecord, MessageRole};

const COACH_PROMPT: &str = "\
You are a professional, empathetic mind coach.

Principles:
1. Understand the user's state of mind deeply and respond with warmth, \
never with judgment or criticism.
2. Acknowledge and validate feelings before anything else. Use open \
questions and guide the user toward their own insights instead of \
prescribing solutions.
3. Never provide medical diagnoses, prescriptions, or legal advice. If \
there is any sign of risk of harm to self or others, gently but clearly \
recommend contacting a mental health professional or a local crisis \
line right away.
4. Keep replies conversational and focused on what the user just shared.";

const BACKGROUND_HEADER: &str = "=== What you know about this user ===";

pub const BACKGROUND_EXTRACTION_INSTRUCTION: &str = "\
You read coaching conversations and maintain a concise profile of the \
user. You merge new facts into the existing profile instead of starting \
over, and you never invent details that were not stated.";

pub const CONVERSATION_SUMMARY_INSTRUCTION: &str = "\
You summarize coaching conversations concisely while preserving the \
information and context a coach would need to continue naturally.";

/// System prompt for a coaching turn, with the rolling user background
/// appended when one exists.
pub fn coach_system_prompt(background_summary: Option<&str>) -> String {
    match background_summary.map(str::trim).filter(|text| !text.is_empty()) {
        Some(background) => {
            format!("{COACH_PROMPT}\n\n{BACKGROUND_HEADER}\n{background}")
        }
        None => COACH_PROMPT.to_string(),
    }
}

/// User-side prompt asking the model to refresh the background profile
/// from the full conversation, merged with the previous profile.
pub fn background_extraction_prompt(
    messages: &[MessageRecord],
    previous_background: Option<&str>,
) -> String {
    let previous = previous_background
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or("(none yet)");

    format!(
        "Update the user profile from the conversation so far.\n\n\
         Previous profile:\n{previous}\n\n\
         Conversation:\n{}\n\n\
         Respond with the updated profile only, structured as:\n\
         - Key facts (occupation, relationships, circumstances)\n\
         - Current emotional state\n\
         - Main concerns\n\
         - Other context worth remembering\n\n\
         Keep it concise.",
        transcript(messages)
    )
}

/// User-side prompt asking the model to compact older turns into a
/// summary that can replace them in the model context.
pub fn conversation_summary_prompt(messages: &[MessageRecord]) -> String {
    format!(
        "Summarize the conversation below so a coach could pick it up \
         without reading the original turns.\n\n\
         {}\n\n\
         Cover:\n\
         - Main topics and concerns\n\
         - Important facts and context\n\
         - The user's emotional state and how it changed\n\n\
         Keep only the essentials.",
        transcript(messages)
    )
}

fn transcript(messages: &[MessageRecord]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .filter(|message| !message.content.trim().is_empty())
        .map(|message| {
            let speaker = match message.role {
                MessageRole::User => "User",
                MessageRole::Assistant => "Coach",
            };
            format!("{speaker}: {}", message.content.trim())
        })
        .collect();

    lines.join("\n\n")
}

#[cfg(test)]
mod tests {
    use mindcoach_storage::MessageId;

    use super::*;

    fn message(role: MessageRole, content: &str, created_at_unix_ms: i64) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            role,
            content: content.to_string(),
            parent_id: None,
            created_at_unix_ms,
            is_deleted: false,
        }
    }

    #[test]
    fn system_prompt_appends_background_only_when_present() {
        let bare = coach_system_prompt(None);
        assert!(!bare.contains(BACKGROUND_HEADER));
        assert_eq!(coach_system_prompt(Some("   ")), bare);

        let with_background = coach_system_prompt(Some("works as a nurse"));
        assert!(with_background.starts_with(&bare));
        assert!(with_background.contains(BACKGROUND_HEADER));
        assert!(with_background.ends_with("works as a nurse"));
    }

    #[test]
    fn background_prompt_covers_the_whole_conversation() {
        let messages: Vec<MessageRecord> = (0..8)
            .map(|index| message(MessageRole::User, &format!("turn {index}"), index))
            .collect();

        let prompt = background_extraction_prompt(&messages, None);
        assert!(prompt.contains("turn 0"));
        assert!(prompt.contains("turn 7"));
        assert!(prompt.contains("(none yet)"));
    }

    #[test]
    fn background_prompt_carries_the_previous_profile() {
        let messages = vec![message(MessageRole::User, "hello", 1)];
        let prompt = background_extraction_prompt(&messages, Some("likes hiking"));
        assert!(prompt.contains("likes hiking"));
        assert!(!prompt.contains("(none yet)"));
    }

    #[test]
    fn transcript_labels_speakers_and_skips_blank_turns() {
        let messages = vec![
            message(MessageRole::User, "I feel stuck", 1),
            message(MessageRole::Assistant, "  ", 2),
            message(MessageRole::Assistant, "Tell me more", 3),
        ];

        let prompt = conversation_summary_prompt(&messages);
        assert!(prompt.contains("User: I feel stuck"));
        assert!(prompt.contains("Coach: Tell me more"));
        assert!(!prompt.contains("Coach: \n"));
    }
}

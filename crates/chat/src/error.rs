use mindcoach_llm::ProviderError;
use mindcoach_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("message content must not be empty"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("a reply is already being generated"))]
    TurnInProgress { stage: &'static str },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("completion failed on `{stage}`: {source}"))]
    Completion {
        stage: &'static str,
        source: ProviderError,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    /// One displayable sentence per failure category. Transport details
    /// never leak through here.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::EmptyMessage { .. } => "Please enter a message.",
            Self::TurnInProgress { .. } => {
                "A reply is still being written. Please wait for it to finish."
            }
            Self::Storage { .. } => {
                "Something went wrong while saving the conversation. Please try again."
            }
            Self::Completion { source, .. } => completion_user_message(source),
        }
    }
}

fn completion_user_message(error: &ProviderError) -> &'static str {
    if error.is_network_unreachable() {
        return "No internet connection. Please check your network and try again.";
    }
    if error.is_timeout() {
        return "The request timed out. Please try again.";
    }

    match error {
        ProviderError::RateLimited { .. } => {
            "Too many requests right now. Please wait a moment and try again."
        }
        ProviderError::Unauthorized { .. } | ProviderError::MissingApiKey { .. } => {
            "The API key was rejected. Please check your key."
        }
        ProviderError::NoContent { .. } => "No reply was received. Please try again.",
        _ => "Something went wrong while generating a reply. Please try again.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_category_maps_to_a_distinct_sentence() {
        let empty = ChatError::EmptyMessage { stage: "test" };
        let busy = ChatError::TurnInProgress { stage: "test" };
        let rate = ChatError::Completion {
            stage: "test",
            source: ProviderError::RateLimited { stage: "test" },
        };
        let auth = ChatError::Completion {
            stage: "test",
            source: ProviderError::Unauthorized { stage: "test" },
        };

        assert_eq!(empty.user_message(), "Please enter a message.");
        assert!(busy.user_message().contains("still being written"));
        assert!(rate.user_message().contains("Too many requests"));
        assert!(auth.user_message().contains("API key"));
    }

    #[test]
    fn unknown_completion_failures_fall_back_to_a_generic_sentence() {
        let error = ChatError::Completion {
            stage: "test",
            source: ProviderError::InvalidResponse { stage: "test" },
        };
        assert!(error.user_message().contains("generating a reply"));
    }
}

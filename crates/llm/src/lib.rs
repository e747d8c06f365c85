pub mod credentials;
pub mod gemini;
pub mod provider;
pub mod retry;

pub use credentials::{API_KEY_ENV_VAR, CredentialError, CredentialResult, CredentialStore};
pub use gemini::{DEFAULT_GEMINI_MODEL, GeminiClient};
pub use provider::{
    BoxFuture, CompletionRequest, CompletionService, ProviderError, ProviderResult, Turn, TurnRole,
};
pub use retry::{RetryPolicy, complete_with_retry};

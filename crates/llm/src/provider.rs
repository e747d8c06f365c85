use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;

/// Role of a single turn as the completion service sees it. Intentionally
/// decoupled from the storage-layer role enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
}

impl Turn {
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub turns: Vec<Turn>,
    pub system_instruction: String,
}

impl CompletionRequest {
    pub fn new(turns: Vec<Turn>, system_instruction: impl Into<String>) -> Self {
        Self {
            turns,
            system_instruction: system_instruction.into(),
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("completion client has no API key"))]
    MissingApiKey { stage: &'static str },
    #[snafu(display("completion request carries no sendable turns"))]
    EmptyTurnSet { stage: &'static str },
    #[snafu(display("completion endpoint returned an unexpected response"))]
    InvalidResponse { stage: &'static str },
    #[snafu(display("completion endpoint rate limit exceeded"))]
    RateLimited { stage: &'static str },
    #[snafu(display("completion endpoint rejected the credential"))]
    Unauthorized { stage: &'static str },
    #[snafu(display("completion endpoint rejected the request: {details}"))]
    BadRequest {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("completion endpoint failed with server status {status}"))]
    ServerError { stage: &'static str, status: u16 },
    #[snafu(display("completion endpoint returned no usable content"))]
    NoContent { stage: &'static str },
    #[snafu(display("failed to decode completion response"))]
    Decode {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("completion transport failed on `{stage}`: {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
}

impl ProviderError {
    /// Whether the retry loop may attempt this call again. Rate limits and
    /// server-side failures are transient; everything else fails fast.
    /// A blank success body is handled by the retry loop itself as
    /// `NoContent`, which is why that variant is retryable here.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::NoContent { .. } => true,
            Self::Http { source, .. } => source.is_connect() || source.is_timeout(),
            _ => false,
        }
    }

    /// Whether the failure came from the transport never reaching the host.
    pub fn is_network_unreachable(&self) -> bool {
        matches!(self, Self::Http { source, .. } if source.is_connect())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http { source, .. } if source.is_timeout())
    }
}

/// Black-box text-completion collaborator. The conversation core only ever
/// sends ordered role/text turns plus a system instruction and reads back
/// one text body.
pub trait CompletionService: Send + Sync {
    fn complete<'a>(&'a self, request: CompletionRequest) -> BoxFuture<'a, ProviderResult<String>>;
}

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use super::provider::{
    BoxFuture, CompletionRequest, CompletionService, DecodeSnafu, EmptyTurnSetSnafu, HttpSnafu,
    MissingApiKeySnafu, NoContentSnafu, ProviderError, ProviderResult, Turn, TurnRole,
};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-pro";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the Gemini `generateContent` endpoint.
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> ProviderResult<Self> {
        let api_key = api_key.into().trim().to_string();
        ensure!(
            !api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "gemini-client-new",
            }
        );

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context(HttpSnafu {
                stage: "gemini-client-build",
            })?;

        Ok(Self {
            client,
            api_key,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn generate(&self, request: CompletionRequest) -> ProviderResult<String> {
        let contents: Vec<Content> = request
            .turns
            .iter()
            .filter(|turn| !turn.text.trim().is_empty())
            .map(turn_to_content)
            .collect();
        ensure!(
            !contents.is_empty(),
            EmptyTurnSetSnafu {
                stage: "gemini-generate-filter-turns",
            }
        );

        let body = GenerateContentRequest {
            contents,
            system_instruction: Some(Content {
                role: "system".to_string(),
                parts: vec![Part {
                    text: request.system_instruction,
                }],
            }),
            generation_config: GenerationConfig::default(),
        };

        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context(HttpSnafu {
                stage: "gemini-generate-send",
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(map_http_status(status, error_body));
        }

        let parsed: GenerateContentResponse = response.json().await.context(DecodeSnafu {
            stage: "gemini-generate-decode",
        })?;

        extract_text(parsed)
    }
}

impl CompletionService for GeminiClient {
    fn complete<'a>(&'a self, request: CompletionRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.generate(request))
    }
}

fn turn_to_content(turn: &Turn) -> Content {
    // Gemini names the assistant side "model".
    let role = match turn.role {
        TurnRole::User => "user",
        TurnRole::Assistant => "model",
    };

    Content {
        role: role.to_string(),
        parts: vec![Part {
            text: turn.text.clone(),
        }],
    }
}

fn map_http_status(status: StatusCode, body: String) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            stage: "gemini-http-status",
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized {
            stage: "gemini-http-status",
        },
        StatusCode::BAD_REQUEST => ProviderError::BadRequest {
            stage: "gemini-http-status",
            details: extract_error_message(&body),
        },
        _ if status.is_server_error() => ProviderError::ServerError {
            stage: "gemini-http-status",
            status: status.as_u16(),
        },
        _ => ProviderError::InvalidResponse {
            stage: "gemini-http-status",
        },
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<ErrorWrapper>(body)
        .ok()
        .and_then(|wrapper| wrapper.error.message)
        .unwrap_or_else(|| body.to_string())
}

fn extract_text(response: GenerateContentResponse) -> ProviderResult<String> {
    response
        .candidates
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .and_then(|content| content.parts.into_iter().find_map(|part| part.text))
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| {
            NoContentSnafu {
                stage: "gemini-extract-text",
            }
            .build()
        })
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "topK")]
    top_k: u32,
    #[serde(rename = "topP")]
    top_p: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            max_output_tokens: 8_192,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_reads_first_candidate_part() {
        let payload = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [{"text": "hello there"}],
                        "role": "model"
                    },
                    "finishReason": "STOP"
                }
            ],
            "usageMetadata": {"promptTokenCount": 4, "totalTokenCount": 9}
        }"#;

        let parsed: GenerateContentResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(extract_text(parsed).unwrap(), "hello there");
    }

    #[test]
    fn extract_text_treats_missing_candidates_as_no_content() {
        let parsed: GenerateContentResponse = serde_json::from_str("{}").unwrap();
        assert!(matches!(
            extract_text(parsed),
            Err(ProviderError::NoContent { .. })
        ));
    }

    #[test]
    fn extract_text_treats_blank_text_as_no_content() {
        let payload = r#"{"candidates": [{"content": {"parts": [{"text": "   "}]}}]}"#;
        let parsed: GenerateContentResponse = serde_json::from_str(payload).unwrap();
        assert!(matches!(
            extract_text(parsed),
            Err(ProviderError::NoContent { .. })
        ));
    }

    #[test]
    fn request_body_uses_gemini_wire_names() {
        let body = GenerateContentRequest {
            contents: vec![turn_to_content(&Turn::new(TurnRole::Assistant, "hi"))],
            system_instruction: Some(Content {
                role: "system".to_string(),
                parts: vec![Part {
                    text: "be kind".to_string(),
                }],
            }),
            generation_config: GenerationConfig::default(),
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][0]["role"], "model");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be kind");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 8_192);
        assert_eq!(json["generationConfig"]["topK"], 40);
    }

    #[test]
    fn error_message_prefers_structured_body() {
        let body = r#"{"error": {"code": 400, "message": "contents are required", "status": "INVALID_ARGUMENT"}}"#;
        assert_eq!(extract_error_message(body), "contents are required");
        assert_eq!(extract_error_message("plain failure"), "plain failure");
    }
}

//! Thin relay to the AI provider for summaries, quizzes and flashcards.
//!
//! Input is validated locally; the provider's JSON is returned untouched.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use studybuddy_types::api::{AiArtifact, AiRequest};

use crate::error::{ApiError, ApiResult};
use crate::extract::JsonBody;
use crate::identity::Caller;
use crate::state::AppState;

pub const MAX_TEXT_CHARS: usize = 15_000;
const KEY_PREFIX: &str = "sk-";
const MIN_KEY_LEN: usize = 20;
const MAX_KEY_LEN: usize = 200;

#[derive(Clone)]
pub struct AiClient {
    http: reqwest::Client,
    endpoint: String,
}

impl AiClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    /// POST `{endpoint}/{artifact}` with the caller's provider key.
    pub async fn generate(&self, artifact: AiArtifact, text: &str, provider_key: &str) -> ApiResult<Value> {
        let response = self
            .http
            .post(format!("{}/{}", self.endpoint, artifact_name(artifact)))
            .bearer_auth(provider_key)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| {
                error!("AI provider request failed: {}", e);
                ApiError::UpstreamFailure("AI provider is unreachable".into())
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("AI provider rate limited the caller");
            return Err(ApiError::RateLimited);
        }
        if !status.is_success() {
            error!("AI provider returned {}", status);
            return Err(ApiError::UpstreamFailure(format!("AI provider returned {}", status)));
        }

        response.json::<Value>().await.map_err(|e| {
            error!("AI provider sent malformed JSON: {}", e);
            ApiError::UpstreamFailure("AI provider sent an unreadable response".into())
        })
    }
}

fn artifact_name(artifact: AiArtifact) -> &'static str {
    match artifact {
        AiArtifact::Summary => "summary",
        AiArtifact::Quiz => "quiz",
        AiArtifact::Flashcards => "flashcards",
    }
}

pub fn validate_request(req: &AiRequest) -> ApiResult<()> {
    if req.text.trim().is_empty() {
        return Err(ApiError::bad_request("text is required"));
    }
    if req.text.chars().count() > MAX_TEXT_CHARS {
        return Err(ApiError::bad_request(format!(
            "text is limited to {} characters",
            MAX_TEXT_CHARS
        )));
    }
    if !is_well_formed_key(&req.provider_key) {
        return Err(ApiError::bad_request("malformed provider key"));
    }
    Ok(())
}

fn is_well_formed_key(key: &str) -> bool {
    (MIN_KEY_LEN..=MAX_KEY_LEN).contains(&key.len())
        && key.starts_with(KEY_PREFIX)
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// POST /ai/{artifact}
pub async fn generate_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(artifact): Path<AiArtifact>,
    JsonBody(req): JsonBody<AiRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_request(&req)?;

    info!("user {} requested {}", caller.user_id, artifact_name(artifact));
    let body = state.ai.generate(artifact, &req.text, &req.provider_key).await?;
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::post};

    fn request(text: &str, key: &str) -> AiRequest {
        AiRequest {
            text: text.to_string(),
            provider_key: key.to_string(),
        }
    }

    const KEY: &str = "sk-test_0123456789abcdef";

    #[test]
    fn accepts_reasonable_input() {
        assert!(validate_request(&request("Photosynthesis converts light.", KEY)).is_ok());
    }

    #[test]
    fn rejects_text_outside_bounds() {
        assert!(matches!(validate_request(&request("  ", KEY)), Err(ApiError::BadRequest(_))));
        let long = "a".repeat(MAX_TEXT_CHARS + 1);
        assert!(matches!(validate_request(&request(&long, KEY)), Err(ApiError::BadRequest(_))));
        let exact = "a".repeat(MAX_TEXT_CHARS);
        assert!(validate_request(&request(&exact, KEY)).is_ok());
    }

    #[test]
    fn rejects_malformed_keys() {
        for key in ["", "sk-short", "pk-0123456789abcdefghij", "sk-0123456789 abcdefghij", "sk-0123456789abcdef$ghij"] {
            assert!(!is_well_formed_key(key), "{key:?} should be rejected");
        }
        assert!(is_well_formed_key(KEY));
    }

    async fn spawn_provider(status: StatusCode) -> String {
        let app = Router::new().route(
            "/v1/{artifact}",
            post(move |Path(artifact): Path<String>| async move {
                (status, Json(json!({ "artifact": artifact, "cards": [] })))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}/v1", addr)
    }

    #[tokio::test]
    async fn provider_json_passes_through() {
        let client = AiClient::new(&spawn_provider(StatusCode::OK).await);
        let body = client.generate(AiArtifact::Flashcards, "cells", KEY).await.unwrap();
        assert_eq!(body["artifact"], "flashcards");
    }

    #[tokio::test]
    async fn provider_429_is_rate_limited() {
        let client = AiClient::new(&spawn_provider(StatusCode::TOO_MANY_REQUESTS).await);
        let err = client.generate(AiArtifact::Quiz, "cells", KEY).await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited));
    }

    #[tokio::test]
    async fn provider_failure_is_upstream_failure() {
        let client = AiClient::new(&spawn_provider(StatusCode::INTERNAL_SERVER_ERROR).await);
        let err = client.generate(AiArtifact::Summary, "cells", KEY).await.unwrap_err();
        assert!(matches!(err, ApiError::UpstreamFailure(_)));
    }
}

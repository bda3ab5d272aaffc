//! Relay for attachment and avatar uploads to the object storage collaborator.
//!
//! Size and type checks run before any bytes leave the server. Objects are
//! content-addressed under `{kind}/{user_id}/{sha256}` so re-uploading the
//! same file is harmless.

use axum::{
    Extension, Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use studybuddy_types::api::{UploadKind, UploadQuery, UploadResponse};

use crate::error::{ApiError, ApiResult};
use crate::extract::QueryParams;
use crate::identity::Caller;
use crate::state::AppState;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// PUT-based client for the external blob store.
#[derive(Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    base_url: String,
    public_url: String,
    token: Option<String>,
}

impl StorageClient {
    pub fn new(base_url: &str, public_url: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    /// Store `body` under `key` and return its public URL.
    pub async fn put(&self, key: &str, body: Bytes, content_type: &str) -> ApiResult<String> {
        let mut request = self
            .http
            .put(format!("{}/{}", self.base_url, key))
            .header(header::CONTENT_TYPE, content_type)
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            error!("storage PUT {} failed: {}", key, e);
            ApiError::UpstreamFailure("storage is unreachable".into())
        })?;

        let status = response.status();
        if !status.is_success() {
            error!("storage PUT {} returned {}", key, status);
            return Err(ApiError::UpstreamFailure(format!("storage rejected the upload ({})", status)));
        }
        Ok(format!("{}/{}", self.public_url, key))
    }
}

pub fn validate_upload(kind: UploadKind, content_type: &str, len: usize) -> ApiResult<()> {
    if len == 0 {
        return Err(ApiError::bad_request("empty upload"));
    }
    if len > kind.max_bytes() {
        return Err(ApiError::PayloadTooLarge(format!(
            "{} uploads are limited to {} MB",
            kind.as_str(),
            kind.max_bytes() / (1024 * 1024)
        )));
    }
    if kind == UploadKind::Avatar && !content_type.starts_with("image/") {
        return Err(ApiError::bad_request("avatars must be images"));
    }
    Ok(())
}

pub fn object_key(kind: UploadKind, user_id: i64, body: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(body));
    format!("{}/{}/{}", kind.as_str(), user_id, digest)
}

/// POST /uploads?kind=attachment|avatar
pub async fn upload_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    QueryParams(query): QueryParams<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();

    validate_upload(query.kind, &content_type, body.len())?;

    let key = object_key(query.kind, caller.user_id, &body);
    let size = body.len();
    let url = state.storage.put(&key, body, &content_type).await?;

    info!("user {} uploaded {} ({} bytes)", caller.user_id, key, size);
    Ok((StatusCode::CREATED, Json(UploadResponse { url })))
}

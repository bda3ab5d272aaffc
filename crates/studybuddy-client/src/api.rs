use std::future::Future;

use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use studybuddy_types::api::{ErrorBody, SendMessageRequest, UploadKind, UploadResponse};
use studybuddy_types::models::Message;

use crate::error::{ClientError, ClientResult};

/// What the message board needs from the server. Implemented over HTTP in
/// production and by in-process fakes in tests.
pub trait BoardApi: Send + Sync {
    /// Most recent first, skipping `offset`.
    fn list_recent(
        &self,
        group_id: Option<i64>,
        offset: u32,
        limit: u32,
    ) -> impl Future<Output = ClientResult<Vec<Message>>> + Send;

    fn send_message(&self, req: SendMessageRequest) -> impl Future<Output = ClientResult<Message>> + Send;

    fn delete_message(&self, message_id: i64) -> impl Future<Output = ClientResult<()>> + Send;

    /// Upload through the storage relay and return the public URL.
    fn upload(
        &self,
        kind: UploadKind,
        content_type: &str,
        body: Bytes,
    ) -> impl Future<Output = ClientResult<String>> + Send;
}

#[derive(Clone)]
pub struct HttpBoardApi {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpBoardApi {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, request: RequestBuilder) -> ClientResult<Response> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let bytes = response.bytes().await?;
        let message = serde_json::from_slice::<ErrorBody>(&bytes)
            .map(|body| body.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClientResult<T> {
        let bytes = self.execute(request).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl BoardApi for HttpBoardApi {
    async fn list_recent(&self, group_id: Option<i64>, offset: u32, limit: u32) -> ClientResult<Vec<Message>> {
        let mut query = vec![
            ("order", "desc".to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(group_id) = group_id {
            query.push(("group_id", group_id.to_string()));
        }
        self.json(self.http.get(self.url("/messages")).query(&query)).await
    }

    async fn send_message(&self, req: SendMessageRequest) -> ClientResult<Message> {
        self.json(self.http.post(self.url("/messages")).json(&req)).await
    }

    async fn delete_message(&self, message_id: i64) -> ClientResult<()> {
        self.execute(self.http.delete(self.url(&format!("/messages/{}", message_id))))
            .await?;
        Ok(())
    }

    async fn upload(&self, kind: UploadKind, content_type: &str, body: Bytes) -> ClientResult<String> {
        let request = self
            .http
            .post(self.url("/uploads"))
            .query(&[("kind", kind.as_str())])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body);
        let uploaded: UploadResponse = self.json(request).await?;
        Ok(uploaded.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{delete, get};
    use axum::{Json, Router};

    const TOKEN: &str = "session-token";

    async fn list(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Response {
        let bearer = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
        if bearer != Some("Bearer session-token") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let offset: i64 = params.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
        let message = Message {
            id: 100 + offset,
            group_id: params.get("group_id").and_then(|v| v.parse().ok()),
            author_id: 1,
            author_name: "ana".to_string(),
            author_avatar_url: None,
            message: Some(format!("{} {}", params["order"], params["limit"])),
            attachment_url: None,
            created_at: chrono::Utc::now(),
        };
        Json(vec![message]).into_response()
    }

    async fn spawn_server() -> String {
        let app = Router::new()
            .route(
                "/messages",
                get(list).post(|| async { (StatusCode::BAD_GATEWAY, "upstream proxy timed out") }),
            )
            .route(
                "/messages/{id}",
                delete(|| async {
                    let body = ErrorBody {
                        error: "forbidden".to_string(),
                        message: "only the author can delete this message".to_string(),
                    };
                    (StatusCode::FORBIDDEN, Json(body))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn list_recent_sends_token_and_paging() {
        let api = HttpBoardApi::new(&spawn_server().await, TOKEN);

        let page = api.list_recent(Some(4), 20, 10).await.unwrap();

        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, 120);
        assert_eq!(page[0].group_id, Some(4));
        assert_eq!(page[0].message.as_deref(), Some("desc 10"));
    }

    #[tokio::test]
    async fn error_bodies_surface_their_message() {
        let api = HttpBoardApi::new(&spawn_server().await, TOKEN);

        match api.delete_message(9).await {
            Err(ClientError::Status { status, message }) => {
                assert_eq!(status, 403);
                assert_eq!(message, "only the author can delete this message");
            }
            other => panic!("expected a status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn plain_text_errors_are_kept_verbatim() {
        let api = HttpBoardApi::new(&spawn_server().await, TOKEN);
        let req = SendMessageRequest {
            group_id: None,
            message: Some("hi".to_string()),
            attachment_url: None,
        };

        match api.send_message(req).await {
            Err(ClientError::Status { status, message }) => {
                assert_eq!(status, 502);
                assert_eq!(message, "upstream proxy timed out");
            }
            other => panic!("expected a status error, got {:?}", other),
        }
    }
}

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, WebSocketUpgrade},
    http::HeaderMap,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use studybuddy_gateway::connection;
use studybuddy_types::api::UploadKind;

use crate::error::{ApiError, ApiResult};
use crate::extract::QueryParams;
use crate::identity::authenticate;
use crate::middleware::{bearer_token, require_auth};
use crate::state::AppState;
use crate::{ai, groups, messages, profile, uploads};

/// Headroom over the largest upload so oversized bodies reach our own check.
const UPLOAD_BODY_SLACK: usize = 64 * 1024;

/// Build the full HTTP surface, including the gateway upgrade.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/groups", get(groups::list_all_groups_handler))
        .route("/groups/{id}", get(groups::get_group_handler))
        .route("/gateway", get(gateway_upgrade));

    let protected_routes = Router::new()
        .route(
            "/me",
            get(profile::get_profile_handler).patch(profile::update_profile_handler),
        )
        .route("/me/groups", get(groups::list_user_groups_handler))
        .route("/groups", post(groups::create_group_handler))
        .route("/groups/discover", get(groups::discover_groups_handler))
        .route(
            "/groups/{id}",
            delete(groups::delete_group_handler).patch(groups::update_group_handler),
        )
        .route("/groups/{id}/join", post(groups::join_group_handler))
        .route("/groups/{id}/leave", post(groups::leave_group_handler))
        .route("/groups/{id}/members", get(groups::list_members_handler))
        .route("/groups/{id}/owner", post(groups::transfer_ownership_handler))
        .route(
            "/messages",
            get(messages::list_messages_handler).post(messages::send_message_handler),
        )
        .route("/messages/{id}", delete(messages::delete_message_handler))
        .route(
            "/uploads",
            post(uploads::upload_handler).layer(DefaultBodyLimit::max(
                UploadKind::Attachment.max_bytes() + UPLOAD_BODY_SLACK,
            )),
        )
        .route("/ai/{artifact}", post(ai::generate_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// GET /gateway?token=
///
/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// come in the query string instead.
async fn gateway_upgrade(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let token = query
        .token
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| ApiError::unauthorized("missing session token"))?;

    let caller = authenticate(&state, &token).await?;

    let dispatcher = state.dispatcher.clone();
    let db = state.db.clone();
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, dispatcher, db, caller.user_id)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use studybuddy_db::Database;
    use studybuddy_gateway::Dispatcher;

    use crate::ai::AiClient;
    use crate::identity::issue_token;
    use crate::state::AppStateInner;
    use crate::uploads::StorageClient;

    const SECRET: &str = "router-test-secret";

    fn test_state() -> AppState {
        Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            dispatcher: Dispatcher::new(),
            auth_secret: SECRET.to_string(),
            storage: StorageClient::new("http://127.0.0.1:9", "http://127.0.0.1:9", None),
            ai: AiClient::new("http://127.0.0.1:9"),
            default_page_size: 20,
        })
    }

    fn app() -> Router {
        router(test_state())
    }

    fn token(subject: &str) -> String {
        issue_token(SECRET, subject, &format!("{}@uni.edu", subject))
    }

    async fn call(app: &Router, method: &str, uri: &str, auth: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = auth {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_is_public() {
        let (status, body) = call(&app(), "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn protected_routes_need_a_valid_token() {
        let app = app();
        let (status, body) = call(&app, "GET", "/me/groups", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let forged = issue_token("wrong-secret", "u1", "u1@uni.edu");
        let (status, _) = call(&app, "GET", "/me", Some(&forged), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn group_and_message_flow() {
        let app = app();
        let u1 = token("u1");
        let u2 = token("u2");

        let (status, group) = call(&app, "POST", "/groups", Some(&u1), Some(json!({ "name": "CS101" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let group_id = group["id"].as_i64().unwrap();

        // Public listing needs no token.
        let (status, listed) = call(&app, "GET", "/groups?search=cs1", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, discover) = call(&app, "GET", "/groups/discover", Some(&u2), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(discover[0]["name"], "CS101");

        let uri = format!("/messages?group_id={}", group_id);
        let (status, body) = call(&app, "GET", &uri, Some(&u2), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = call(&app, "POST", &format!("/groups/{}/join", group_id), Some(&u2), None).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&app, "POST", &format!("/groups/{}/join", group_id), Some(&u2), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let send = json!({ "group_id": group_id, "message": "hello" });
        let (status, sent) = call(&app, "POST", "/messages", Some(&u2), Some(send)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sent["message"], "hello");

        let (status, page) = call(&app, "GET", &uri, Some(&u1), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page.as_array().unwrap().len(), 1);

        let delete_uri = format!("/messages/{}", sent["id"]);
        let (status, _) = call(&app, "DELETE", &delete_uri, Some(&u1), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app, "DELETE", &delete_uri, Some(&u2), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn owner_only_mutations_over_http() {
        let app = app();
        let u1 = token("u1");
        let u2 = token("u2");
        let (_, group) = call(&app, "POST", "/groups", Some(&u1), Some(json!({ "name": "CS101" }))).await;
        let group_uri = format!("/groups/{}", group["id"]);
        call(&app, "POST", &format!("{}/join", group_uri), Some(&u2), None).await;

        let rename = json!({ "name": "CS101 Fall" });
        let (status, _) = call(&app, "PATCH", &group_uri, Some(&u2), Some(rename.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = call(&app, "PATCH", &group_uri, Some(&u1), Some(rename)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "CS101 Fall");

        let (status, _) = call(&app, "POST", &format!("{}/leave", group_uri), Some(&u1), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, "DELETE", &group_uri, Some(&u1), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", &group_uri, None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_ai_key_is_rejected_before_any_call() {
        let body = json!({ "text": "mitosis", "provider_key": "not-a-key" });
        let (status, _) = call(&app(), "POST", "/ai/summary", Some(&token("u1")), Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn gateway_rejects_missing_token() {
        // Neither a handshake nor a token: the connection is never upgraded.
        let request = Request::builder().uri("/gateway").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_ne!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    }
    #[tokio::test]
    async fn malformed_bodies_get_a_json_bad_request() {
        let app = app();
        let u1 = token("u1");

        let (status, body) =
            call(&app, "POST", "/groups", Some(&u1), Some(json!({ "description": "no name" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
        assert!(body["message"].as_str().unwrap().contains("name"));

        let (status, body) =
            call(&app, "POST", "/messages", Some(&u1), Some(json!({ "group_id": 1, "text": "x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn bad_query_and_non_json_bodies_get_a_json_bad_request() {
        let app = app();
        let u1 = token("u1");

        let (status, body) = call(&app, "GET", "/messages?limit=lots", Some(&u1), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");

        let request = Request::builder()
            .method("POST")
            .uri("/groups")
            .header(header::AUTHORIZATION, format!("Bearer {}", u1))
            .body(Body::from("name=CS101"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "bad_request");
    }

    mod gateway {
        use super::*;
        use futures_util::{SinkExt, StreamExt};
        use studybuddy_types::events::{GatewayCommand, GatewayEvent};
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        type Socket = tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >;

        async fn serve(state: AppState) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move { axum::serve(listener, router(state)).await.unwrap() });
            addr.to_string()
        }

        async fn connect(addr: &str, token: &str) -> Socket {
            let url = format!("ws://{}/gateway?token={}", addr, token);
            let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            socket
        }

        async fn command(socket: &mut Socket, cmd: GatewayCommand) {
            let json = serde_json::to_string(&cmd).unwrap();
            socket.send(WsMessage::Text(json.into())).await.unwrap();
        }

        async fn next_event(socket: &mut Socket) -> GatewayEvent {
            loop {
                let frame = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
                    .await
                    .expect("gateway event in time")
                    .unwrap()
                    .unwrap();
                if let WsMessage::Text(text) = frame {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        }

        /// Skip events until one matches. Broadcasts and targeted events
        /// travel on different queues, so their relative order is not fixed.
        async fn wait_for(socket: &mut Socket, wanted: impl Fn(&GatewayEvent) -> bool) -> GatewayEvent {
            loop {
                let event = next_event(socket).await;
                if wanted(&event) {
                    return event;
                }
            }
        }

        #[tokio::test]
        async fn members_get_presence_and_change_signals() {
            let state = test_state();
            let now = chrono::Utc::now();
            let u1 = state.db.resolve_identity("u1", "u1@uni.edu", now).unwrap().user_id().unwrap();
            state.db.resolve_identity("u2", "u2@uni.edu", now).unwrap();
            let group = state.db.create_group(u1, "CS101", None, false, now).unwrap();
            let addr = serve(state).await;

            let mut member = connect(&addr, &token("u1")).await;
            assert_eq!(next_event(&mut member).await, GatewayEvent::Ready { user_id: u1 });
            command(&mut member, GatewayCommand::Subscribe { group_id: group.id }).await;
            command(&mut member, GatewayCommand::Track { group_id: group.id }).await;
            let sync = wait_for(&mut member, |e| matches!(e, GatewayEvent::PresenceSync { .. })).await;
            assert_eq!(sync, GatewayEvent::PresenceSync { group_id: group.id, user_ids: vec![u1] });

            let mut outsider = connect(&addr, &token("u2")).await;
            assert!(matches!(next_event(&mut outsider).await, GatewayEvent::Ready { .. }));
            command(&mut outsider, GatewayCommand::Subscribe { group_id: group.id }).await;
            assert!(matches!(next_event(&mut outsider).await, GatewayEvent::Error { .. }));

            let response = reqwest::Client::new()
                .post(format!("http://{}/messages", addr))
                .bearer_auth(token("u1"))
                .json(&json!({ "group_id": group.id, "message": "hello" }))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), 201);

            let changed = wait_for(&mut member, |e| matches!(e, GatewayEvent::MessagesChanged { .. })).await;
            assert_eq!(changed, GatewayEvent::MessagesChanged { group_id: group.id });
        }

        /// Everything that arrives within `window`.
        async fn drain(socket: &mut Socket, window: std::time::Duration) -> Vec<GatewayEvent> {
            let mut events = Vec::new();
            while let Ok(Some(Ok(frame))) = tokio::time::timeout(window, socket.next()).await {
                if let WsMessage::Text(text) = frame {
                    events.push(serde_json::from_str(&text).unwrap());
                }
            }
            events
        }

        /// Owner `u1` and member `u2` of one group, both connected, subscribed
        /// and tracked. Returns (addr, group_id, u2, owner socket, member socket).
        async fn two_members_online() -> (String, i64, i64, Socket, Socket) {
            let state = test_state();
            let now = chrono::Utc::now();
            let u1 = state.db.resolve_identity("u1", "u1@uni.edu", now).unwrap().user_id().unwrap();
            let u2 = state.db.resolve_identity("u2", "u2@uni.edu", now).unwrap().user_id().unwrap();
            let group = state.db.create_group(u1, "CS101", None, false, now).unwrap();
            state.db.add_member(u2, group.id, now).unwrap();
            let addr = serve(state).await;

            let mut owner = connect(&addr, &token("u1")).await;
            command(&mut owner, GatewayCommand::Subscribe { group_id: group.id }).await;
            command(&mut owner, GatewayCommand::Track { group_id: group.id }).await;
            wait_for(&mut owner, |e| matches!(e, GatewayEvent::PresenceSync { .. })).await;

            let mut member = connect(&addr, &token("u2")).await;
            command(&mut member, GatewayCommand::Subscribe { group_id: group.id }).await;
            command(&mut member, GatewayCommand::Track { group_id: group.id }).await;
            wait_for(&mut member, |e| matches!(e, GatewayEvent::PresenceSync { .. })).await;

            let joined = wait_for(&mut owner, |e| matches!(e, GatewayEvent::PresenceJoin { .. })).await;
            assert_eq!(joined, GatewayEvent::PresenceJoin { group_id: group.id, user_id: u2 });

            (addr, group.id, u2, owner, member)
        }

        #[tokio::test]
        async fn dropped_socket_announces_presence_leave() {
            let (_addr, group_id, u2, mut owner, member) = two_members_online().await;

            drop(member);

            let left = wait_for(&mut owner, |e| matches!(e, GatewayEvent::PresenceLeave { .. })).await;
            assert_eq!(left, GatewayEvent::PresenceLeave { group_id, user_id: u2 });
        }

        #[tokio::test]
        async fn leaving_a_group_revokes_subscription_and_presence() {
            let (addr, group_id, u2, mut owner, mut member) = two_members_online().await;
            let http = reqwest::Client::new();

            let response = http
                .post(format!("http://{}/groups/{}/leave", addr, group_id))
                .bearer_auth(token("u2"))
                .send()
                .await
                .unwrap();
            assert!(response.status().is_success());

            let left = wait_for(&mut owner, |e| matches!(e, GatewayEvent::PresenceLeave { .. })).await;
            assert_eq!(left, GatewayEvent::PresenceLeave { group_id, user_id: u2 });

            let response = http
                .post(format!("http://{}/messages", addr))
                .bearer_auth(token("u1"))
                .json(&json!({ "group_id": group_id, "message": "after you left" }))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), 201);

            let changed = wait_for(&mut owner, |e| matches!(e, GatewayEvent::MessagesChanged { .. })).await;
            assert_eq!(changed, GatewayEvent::MessagesChanged { group_id });

            let seen = drain(&mut member, std::time::Duration::from_millis(300)).await;
            assert!(
                !seen.iter().any(|e| matches!(e, GatewayEvent::MessagesChanged { .. })),
                "former member still received {:?}",
                seen
            );
        }

        #[tokio::test]
        async fn upgrade_without_valid_token_is_refused() {
            let addr = serve(test_state()).await;
            let url = format!("ws://{}/gateway?token=garbage", addr);
            assert!(tokio_tungstenite::connect_async(url).await.is_err());
        }
    }
}

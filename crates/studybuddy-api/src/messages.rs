use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use studybuddy_db::{Database, MessageScope};
use studybuddy_types::api::{MessageOrder, MessageQuery, SendMessageRequest};
use studybuddy_types::models::Message;

use crate::error::{ApiError, ApiResult};
use crate::extract::{JsonBody, QueryParams};
use crate::guard::require_member;
use crate::identity::Caller;
use crate::state::AppState;

pub const MAX_PAGE_SIZE: u32 = 200;
const MAX_MESSAGE_CHARS: usize = 4000;

/// Which slice of the log a caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    /// Newest first, skipping `offset`.
    Recent { offset: u32, limit: u32 },
    /// Everything, oldest first.
    Full,
}

impl Page {
    pub fn from_query(query: &MessageQuery, default_limit: u32) -> Self {
        match query.order {
            MessageOrder::Asc => Page::Full,
            MessageOrder::Desc => Page::Recent {
                offset: query.offset,
                limit: query.limit.unwrap_or(default_limit).clamp(1, MAX_PAGE_SIZE),
            },
        }
    }
}

fn scope_for(db: &Database, caller: Caller, group_id: Option<i64>) -> ApiResult<MessageScope> {
    match group_id {
        Some(group_id) => {
            require_member(db, caller.user_id, group_id)?;
            Ok(MessageScope::Group(group_id))
        }
        None => Ok(MessageScope::Personal(caller.user_id)),
    }
}

// -- Service --

pub fn list_messages(
    db: &Database,
    caller: Caller,
    group_id: Option<i64>,
    page: Page,
) -> ApiResult<Vec<Message>> {
    let scope = scope_for(db, caller, group_id)?;
    let messages = match page {
        Page::Recent { offset, limit } => db.list_messages_desc(scope, offset, limit)?,
        Page::Full => db.list_messages_asc(scope)?,
    };
    Ok(messages)
}

pub fn send_message(
    db: &Database,
    caller: Caller,
    req: &SendMessageRequest,
    now: DateTime<Utc>,
) -> ApiResult<Message> {
    let text = req.message.as_deref().filter(|s| !s.trim().is_empty());
    let attachment = req.attachment_url.as_deref().map(str::trim).filter(|s| !s.is_empty());

    if text.is_none() && attachment.is_none() {
        return Err(ApiError::bad_request("a message needs text or an attachment"));
    }
    if text.is_some_and(|t| t.chars().count() > MAX_MESSAGE_CHARS) {
        return Err(ApiError::bad_request(format!(
            "messages are limited to {} characters",
            MAX_MESSAGE_CHARS
        )));
    }

    let scope = scope_for(db, caller, req.group_id)?;
    let group_id = match scope {
        MessageScope::Group(id) => Some(id),
        MessageScope::Personal(_) => None,
    };

    let message = db.insert_message(group_id, caller.user_id, text, attachment, now)?;
    debug!("user {} posted message {} to {:?}", caller.user_id, message.id, group_id);
    Ok(message)
}

/// Returns the deleted message so the caller can notify the right audience.
pub fn delete_message(db: &Database, caller: Caller, message_id: i64) -> ApiResult<Message> {
    let message = db
        .get_message(message_id)?
        .ok_or_else(|| ApiError::not_found(format!("message {} not found", message_id)))?;

    if message.author_id != caller.user_id {
        warn!("user {} tried to delete message {} by {}", caller.user_id, message_id, message.author_id);
        return Err(ApiError::forbidden("only the author can delete a message"));
    }
    // Membership may have lapsed since the message was written.
    if let Some(group_id) = message.group_id {
        require_member(db, caller.user_id, group_id)?;
    }

    if !db.delete_message(message_id)? {
        return Err(ApiError::not_found(format!("message {} not found", message_id)));
    }
    Ok(message)
}

// -- Handlers --

/// GET /messages?group_id=&order=&offset=&limit=
pub async fn list_messages_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    QueryParams(query): QueryParams<MessageQuery>,
) -> ApiResult<impl IntoResponse> {
    let page = Page::from_query(&query, state.default_page_size);
    let group_id = query.group_id;
    let messages = state
        .blocking(move |db| list_messages(db, caller, group_id, page))
        .await?;
    Ok(Json(messages))
}

/// POST /messages
pub async fn send_message_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    JsonBody(req): JsonBody<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .blocking(move |db| send_message(db, caller, &req, Utc::now()))
        .await?;
    state
        .dispatcher
        .notify_messages_changed(message.group_id, caller.user_id)
        .await;
    Ok((StatusCode::CREATED, Json(message)))
}

/// DELETE /messages/{id}
pub async fn delete_message_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(message_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .blocking(move |db| delete_message(db, caller, message_id))
        .await?;
    state
        .dispatcher
        .notify_messages_changed(message.group_id, message.author_id)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};

use crate::error::{ApiError, ApiResult};
use crate::identity::authenticate;
use crate::state::AppState;

/// Bearer token from the Authorization header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

/// Resolve the caller from the bearer token and attach it as an extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> ApiResult<Response> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

    let caller = authenticate(&state, &token).await?;

    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

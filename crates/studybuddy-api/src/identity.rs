//! Identity resolution: external session token -> internal numeric user id.
//!
//! There is no fallback identity. A missing, malformed or expired token, or
//! one without a subject, is rejected as `Unauthorized`.

use chrono::Utc;
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{info, warn};

use studybuddy_db::{Database, ResolveOutcome};
use studybuddy_types::api::Claims;

use crate::error::{ApiError, ApiResult};
use crate::state::AppStateInner;

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
}

/// Validate the provider's HS256 token and return its claims.
pub fn decode_claims(token: &str, secret: &str) -> ApiResult<Claims> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        warn!("Rejected session token: {}", e);
        ApiError::unauthorized("invalid or expired session")
    })?;

    let claims = token_data.claims;
    if claims.sub.trim().is_empty() {
        return Err(ApiError::unauthorized("session has no subject"));
    }
    if claims.email.trim().is_empty() {
        return Err(ApiError::unauthorized("session has no email"));
    }
    Ok(claims)
}

/// Map claims to an internal user, creating the mapping at first login.
pub fn resolve_caller(db: &Database, claims: &Claims) -> ApiResult<Caller> {
    match db.resolve_identity(&claims.sub, &claims.email, Utc::now())? {
        ResolveOutcome::Existing(user_id) => Ok(Caller { user_id }),
        ResolveOutcome::Created(user_id) => {
            info!("Registered user {} for new subject", user_id);
            Ok(Caller { user_id })
        }
        ResolveOutcome::EmailTaken => Err(ApiError::Conflict(format!(
            "email {} is already registered to another account",
            claims.email
        ))),
    }
}

/// Full pipeline used by the REST middleware and the gateway upgrade.
pub async fn authenticate(state: &AppStateInner, token: &str) -> ApiResult<Caller> {
    let claims = decode_claims(token, &state.auth_secret)?;
    state.blocking(move |db| resolve_caller(db, &claims)).await
}

/// Issue a token the way the external provider does. Test-only.
#[cfg(test)]
pub(crate) fn issue_token(secret: &str, subject: &str, email: &str) -> String {
    use jsonwebtoken::{EncodingKey, Header, encode};

    let claims = Claims {
        sub: subject.to_string(),
        email: email.to_string(),
        exp: (Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .expect("token encodes")
}

use axum::{Extension, Json, extract::State, response::IntoResponse};

use studybuddy_db::Database;
use studybuddy_types::api::UpdateProfileRequest;
use studybuddy_types::models::User;

use crate::error::{ApiError, ApiResult};
use crate::extract::JsonBody;
use crate::identity::Caller;
use crate::state::AppState;

const MAX_DISPLAY_NAME_CHARS: usize = 64;

pub fn get_profile(db: &Database, caller: Caller) -> ApiResult<User> {
    db.get_user(caller.user_id)?
        .ok_or_else(|| ApiError::not_found("user not found"))
}

pub fn update_profile(db: &Database, caller: Caller, req: &UpdateProfileRequest) -> ApiResult<User> {
    if req.name.is_none() && req.avatar_url.is_none() {
        return Err(ApiError::bad_request("no fields to update"));
    }

    let name = match req.name.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::bad_request("name cannot be blank")),
        Some(n) if n.chars().count() > MAX_DISPLAY_NAME_CHARS => {
            return Err(ApiError::bad_request(format!(
                "name is limited to {} characters",
                MAX_DISPLAY_NAME_CHARS
            )));
        }
        other => other,
    };

    db.update_profile(caller.user_id, name, req.avatar_url.as_deref())?
        .ok_or_else(|| ApiError::not_found("user not found"))
}

/// GET /me
pub async fn get_profile_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<impl IntoResponse> {
    let user = state.blocking(move |db| get_profile(db, caller)).await?;
    Ok(Json(user))
}

/// PATCH /me
pub async fn update_profile_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    JsonBody(req): JsonBody<UpdateProfileRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = state
        .blocking(move |db| update_profile(db, caller, &req))
        .await?;
    Ok(Json(user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn setup() -> (Database, Caller) {
        let db = Database::open_in_memory().unwrap();
        let user_id = db.resolve_identity("s", "ana@uni.edu", Utc::now()).unwrap().user_id().unwrap();
        (db, Caller { user_id })
    }

    #[test]
    fn new_user_is_named_after_email() {
        let (db, caller) = setup();
        let user = get_profile(&db, caller).unwrap();
        assert_eq!(user.name, "ana");
        assert_eq!(user.email, "ana@uni.edu");
    }

    #[test]
    fn partial_update_keeps_other_fields() {
        let (db, caller) = setup();
        let req = UpdateProfileRequest { name: Some(" Ana P ".into()), avatar_url: None };
        let user = update_profile(&db, caller, &req).unwrap();
        assert_eq!(user.name, "Ana P");
        assert_eq!(user.avatar_url, None);

        let req = UpdateProfileRequest { name: None, avatar_url: Some("https://cdn.example/avatar/1/x".into()) };
        let user = update_profile(&db, caller, &req).unwrap();
        assert_eq!(user.name, "Ana P");
        assert!(user.avatar_url.is_some());
    }

    #[test]
    fn invalid_updates_are_rejected() {
        let (db, caller) = setup();
        let none = UpdateProfileRequest { name: None, avatar_url: None };
        assert!(matches!(update_profile(&db, caller, &none), Err(ApiError::BadRequest(_))));

        let blank = UpdateProfileRequest { name: Some("  ".into()), avatar_url: None };
        assert!(matches!(update_profile(&db, caller, &blank), Err(ApiError::BadRequest(_))));

        let long = UpdateProfileRequest { name: Some("x".repeat(65)), avatar_url: None };
        assert!(matches!(update_profile(&db, caller, &long), Err(ApiError::BadRequest(_))));
    }
}

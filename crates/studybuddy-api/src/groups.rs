use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use tracing::info;

use studybuddy_db::{Database, GroupChanges, is_constraint_violation};
use studybuddy_types::api::{
    CreateGroupRequest, GroupSearchQuery, MemberResponse, TransferOwnershipRequest,
    UpdateGroupRequest,
};
use studybuddy_types::models::{Group, Membership, Role};

use crate::error::{ApiError, ApiResult};
use crate::extract::{JsonBody, QueryParams};
use crate::guard::{require_member, require_owner};
use crate::identity::Caller;
use crate::state::AppState;

const MAX_NAME_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 1000;

// -- Service --

pub fn list_all_groups(db: &Database, search: Option<&str>) -> ApiResult<Vec<Group>> {
    Ok(db.list_groups(search)?)
}

pub fn list_user_groups(db: &Database, caller: Caller) -> ApiResult<Vec<Group>> {
    Ok(db.list_user_groups(caller.user_id)?)
}

pub fn get_group(db: &Database, group_id: i64) -> ApiResult<Group> {
    db.get_group(group_id)?
        .ok_or_else(|| ApiError::not_found(format!("group {} not found", group_id)))
}

pub fn create_group(
    db: &Database,
    caller: Caller,
    req: &CreateGroupRequest,
    now: DateTime<Utc>,
) -> ApiResult<Group> {
    let name = validate_name(&req.name)?;
    let description = validate_description(req.description.as_deref())?;

    // Group row and owner membership commit together or not at all.
    let group = db.create_group(caller.user_id, name, description, req.is_private, now)?;
    info!("user {} created group {} ({})", caller.user_id, group.id, group.name);
    Ok(group)
}

pub fn update_group(
    db: &Database,
    caller: Caller,
    group_id: i64,
    req: &UpdateGroupRequest,
) -> ApiResult<Group> {
    require_owner(db, caller.user_id, group_id)?;

    if req.is_empty() {
        return Err(ApiError::bad_request("no fields to update"));
    }

    let name = req.name.as_deref().map(validate_name).transpose()?;
    let description = match req.description.as_deref() {
        Some(raw) => Some(validate_description(Some(raw))?),
        None => None,
    };

    let changes = GroupChanges {
        name,
        description,
        is_private: req.is_private,
    };
    db.update_group(group_id, changes)?
        .ok_or_else(|| ApiError::not_found(format!("group {} not found", group_id)))
}

pub fn delete_group(db: &Database, caller: Caller, group_id: i64) -> ApiResult<()> {
    require_owner(db, caller.user_id, group_id)?;

    if !db.delete_group(group_id)? {
        return Err(ApiError::not_found(format!("group {} not found", group_id)));
    }
    info!("user {} deleted group {}", caller.user_id, group_id);
    Ok(())
}

pub fn discover_groups(db: &Database, caller: Caller) -> ApiResult<Vec<Group>> {
    Ok(db.discover_groups(caller.user_id)?)
}

pub fn join_group(
    db: &Database,
    caller: Caller,
    group_id: i64,
    now: DateTime<Utc>,
) -> ApiResult<Membership> {
    get_group(db, group_id)?;

    if db.membership_role(caller.user_id, group_id)?.is_some() {
        return Err(ApiError::bad_request("already a member of this group"));
    }

    db.add_member(caller.user_id, group_id, now).map_err(|e| {
        // Lost a race with a concurrent join of the same user.
        if is_constraint_violation(&e) {
            ApiError::bad_request("already a member of this group")
        } else {
            ApiError::Internal(e)
        }
    })
}

/// Owners cannot leave: they must transfer ownership or delete the group.
pub fn leave_group(db: &Database, caller: Caller, group_id: i64) -> ApiResult<()> {
    match db.membership_role(caller.user_id, group_id)? {
        None => Err(ApiError::not_found("not a member of this group")),
        Some(Role::Owner) => Err(ApiError::forbidden(
            "the owner cannot leave; transfer ownership or delete the group first",
        )),
        Some(Role::Member) => {
            db.remove_member(caller.user_id, group_id)?;
            Ok(())
        }
    }
}

pub fn list_members(db: &Database, caller: Caller, group_id: i64) -> ApiResult<Vec<MemberResponse>> {
    require_member(db, caller.user_id, group_id)?;
    Ok(db.list_members(group_id)?)
}

pub fn transfer_ownership(
    db: &Database,
    caller: Caller,
    group_id: i64,
    new_owner: i64,
) -> ApiResult<Group> {
    require_owner(db, caller.user_id, group_id)?;

    if new_owner == caller.user_id {
        return Err(ApiError::bad_request("already the owner"));
    }
    if db.membership_role(new_owner, group_id)?.is_none() {
        return Err(ApiError::bad_request("new owner must be a member of the group"));
    }

    let group = db.transfer_ownership(group_id, caller.user_id, new_owner)?;
    info!("group {} ownership moved from {} to {}", group_id, caller.user_id, new_owner);
    Ok(group)
}

fn validate_name(raw: &str) -> ApiResult<&str> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("group name is required"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(ApiError::bad_request(format!(
            "group name is limited to {} characters",
            MAX_NAME_CHARS
        )));
    }
    Ok(name)
}

/// Blank descriptions are stored as no description.
fn validate_description(raw: Option<&str>) -> ApiResult<Option<&str>> {
    let Some(description) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(ApiError::bad_request(format!(
            "description is limited to {} characters",
            MAX_DESCRIPTION_CHARS
        )));
    }
    Ok(Some(description))
}

// -- Handlers --

/// GET /groups?search=
pub async fn list_all_groups_handler(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<GroupSearchQuery>,
) -> ApiResult<impl IntoResponse> {
    let groups = state
        .blocking(move |db| list_all_groups(db, query.search.as_deref()))
        .await?;
    Ok(Json(groups))
}

/// GET /groups/{id}
pub async fn get_group_handler(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let group = state.blocking(move |db| get_group(db, group_id)).await?;
    Ok(Json(group))
}

/// GET /me/groups
pub async fn list_user_groups_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<impl IntoResponse> {
    let groups = state.blocking(move |db| list_user_groups(db, caller)).await?;
    Ok(Json(groups))
}

/// GET /groups/discover
pub async fn discover_groups_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<impl IntoResponse> {
    let groups = state.blocking(move |db| discover_groups(db, caller)).await?;
    Ok(Json(groups))
}

/// POST /groups
pub async fn create_group_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    JsonBody(req): JsonBody<CreateGroupRequest>,
) -> ApiResult<impl IntoResponse> {
    let group = state
        .blocking(move |db| create_group(db, caller, &req, Utc::now()))
        .await?;
    Ok((StatusCode::CREATED, Json(group)))
}

/// PATCH /groups/{id}
pub async fn update_group_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(group_id): Path<i64>,
    JsonBody(req): JsonBody<UpdateGroupRequest>,
) -> ApiResult<impl IntoResponse> {
    let group = state
        .blocking(move |db| update_group(db, caller, group_id, &req))
        .await?;
    state.dispatcher.notify_group_changed(group_id);
    Ok(Json(group))
}

/// DELETE /groups/{id}
pub async fn delete_group_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(group_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state
        .blocking(move |db| delete_group(db, caller, group_id))
        .await?;
    state.dispatcher.notify_group_deleted(group_id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /groups/{id}/join
pub async fn join_group_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(group_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let membership = state
        .blocking(move |db| join_group(db, caller, group_id, Utc::now()))
        .await?;
    state.dispatcher.notify_group_changed(group_id);
    Ok((StatusCode::CREATED, Json(membership)))
}

/// POST /groups/{id}/leave
pub async fn leave_group_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(group_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state
        .blocking(move |db| leave_group(db, caller, group_id))
        .await?;
    state.dispatcher.notify_group_changed(group_id);
    state.dispatcher.revoke_access(caller.user_id, group_id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /groups/{id}/members
pub async fn list_members_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(group_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let members = state
        .blocking(move |db| list_members(db, caller, group_id))
        .await?;
    Ok(Json(members))
}

/// POST /groups/{id}/owner
pub async fn transfer_ownership_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(group_id): Path<i64>,
    JsonBody(req): JsonBody<TransferOwnershipRequest>,
) -> ApiResult<impl IntoResponse> {
    let group = state
        .blocking(move |db| transfer_ownership(db, caller, group_id, req.user_id))
        .await?;
    state.dispatcher.notify_group_changed(group_id);
    Ok(Json(group))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(db: &Database, subject: &str) -> Caller {
        let email = format!("{}@uni.edu", subject);
        let user_id = db.resolve_identity(subject, &email, Utc::now()).unwrap().user_id().unwrap();
        Caller { user_id }
    }

    fn create(db: &Database, owner: Caller, name: &str) -> Group {
        let req = CreateGroupRequest {
            name: name.to_string(),
            description: None,
            is_private: false,
        };
        create_group(db, owner, &req, Utc::now()).unwrap()
    }

    fn owner_rows(db: &Database, group_id: i64) -> Vec<i64> {
        db.list_members(group_id)
            .unwrap()
            .into_iter()
            .filter(|m| m.role == Role::Owner)
            .map(|m| m.user_id)
            .collect()
    }

    #[test]
    fn member_sees_joined_group_in_their_list() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        let u2 = user(&db, "u2");
        let group = create(&db, u1, "CS101");

        join_group(&db, u2, group.id, Utc::now()).unwrap();

        let names: Vec<String> = list_user_groups(&db, u2).unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["CS101"]);
    }

    #[test]
    fn second_join_is_rejected_and_count_stays_one() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        let u2 = user(&db, "u2");
        let group = create(&db, u1, "CS101");

        join_group(&db, u2, group.id, Utc::now()).unwrap();
        assert!(matches!(join_group(&db, u2, group.id, Utc::now()), Err(ApiError::BadRequest(_))));

        let rows = db.list_members(group.id).unwrap().into_iter().filter(|m| m.user_id == u2.user_id).count();
        assert_eq!(rows, 1);
    }

    #[test]
    fn join_missing_group_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        assert!(matches!(join_group(&db, u1, 77, Utc::now()), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn only_owner_can_rename() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        let u2 = user(&db, "u2");
        let group = create(&db, u1, "CS101");
        join_group(&db, u2, group.id, Utc::now()).unwrap();

        let rename = UpdateGroupRequest {
            name: Some("CS101 Fall".into()),
            ..Default::default()
        };
        assert_eq!(update_group(&db, u1, group.id, &rename).unwrap().name, "CS101 Fall");
        assert!(matches!(update_group(&db, u2, group.id, &rename), Err(ApiError::Forbidden(_))));
    }

    #[test]
    fn update_without_fields_is_bad_request() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        let group = create(&db, u1, "CS101");
        let empty = UpdateGroupRequest::default();
        assert!(matches!(update_group(&db, u1, group.id, &empty), Err(ApiError::BadRequest(_))));
        assert!(matches!(update_group(&db, u1, 999, &empty), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn blank_name_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        let req = CreateGroupRequest { name: "   ".into(), description: None, is_private: false };
        assert!(matches!(create_group(&db, u1, &req, Utc::now()), Err(ApiError::BadRequest(_))));
        assert!(list_all_groups(&db, None).unwrap().is_empty());
    }

    #[test]
    fn exactly_one_owner_row_matches_owner_id() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        let u2 = user(&db, "u2");
        let u3 = user(&db, "u3");
        let group = create(&db, u1, "CS101");
        join_group(&db, u2, group.id, Utc::now()).unwrap();
        join_group(&db, u3, group.id, Utc::now()).unwrap();
        assert_eq!(owner_rows(&db, group.id), vec![u1.user_id]);

        let group = transfer_ownership(&db, u1, group.id, u2.user_id).unwrap();
        assert_eq!(group.owner_id, u2.user_id);
        assert_eq!(owner_rows(&db, group.id), vec![u2.user_id]);
    }

    #[test]
    fn transfer_requires_owner_and_member_target() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        let u2 = user(&db, "u2");
        let outsider = user(&db, "u3");
        let group = create(&db, u1, "CS101");
        join_group(&db, u2, group.id, Utc::now()).unwrap();

        assert!(matches!(
            transfer_ownership(&db, u2, group.id, u2.user_id),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            transfer_ownership(&db, u1, group.id, outsider.user_id),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn owner_cannot_leave_but_members_can() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        let u2 = user(&db, "u2");
        let group = create(&db, u1, "CS101");
        join_group(&db, u2, group.id, Utc::now()).unwrap();

        assert!(matches!(leave_group(&db, u1, group.id), Err(ApiError::Forbidden(_))));
        leave_group(&db, u2, group.id).unwrap();
        assert!(matches!(leave_group(&db, u2, group.id), Err(ApiError::NotFound(_))));
        assert_eq!(owner_rows(&db, group.id), vec![u1.user_id]);
    }

    #[test]
    fn delete_is_owner_only_and_cascades() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        let u2 = user(&db, "u2");
        let group = create(&db, u1, "CS101");
        join_group(&db, u2, group.id, Utc::now()).unwrap();
        db.insert_message(Some(group.id), u2.user_id, Some("hi"), None, Utc::now()).unwrap();

        assert!(matches!(delete_group(&db, u2, group.id), Err(ApiError::Forbidden(_))));
        delete_group(&db, u1, group.id).unwrap();

        assert!(matches!(get_group(&db, group.id), Err(ApiError::NotFound(_))));
        assert!(db.list_members(group.id).unwrap().is_empty());
        assert!(list_user_groups(&db, u2).unwrap().is_empty());
    }

    #[test]
    fn roster_is_member_only() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        let outsider = user(&db, "u2");
        let group = create(&db, u1, "CS101");

        assert_eq!(list_members(&db, u1, group.id).unwrap().len(), 1);
        assert!(matches!(list_members(&db, outsider, group.id), Err(ApiError::Unauthorized(_))));
    }

    #[test]
    fn discover_hides_joined_groups() {
        let db = Database::open_in_memory().unwrap();
        let u1 = user(&db, "u1");
        let u2 = user(&db, "u2");
        let group = create(&db, u1, "CS101");

        assert_eq!(discover_groups(&db, u2).unwrap().len(), 1);
        assert!(discover_groups(&db, u1).unwrap().is_empty());
        join_group(&db, u2, group.id, Utc::now()).unwrap();
        assert!(discover_groups(&db, u2).unwrap().is_empty());
    }
}

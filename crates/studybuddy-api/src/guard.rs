//! Membership authorization checks shared by the group and message services.
//!
//! A failed check is always an error, never an empty result.

use studybuddy_db::Database;
use studybuddy_types::models::{Group, Role};

use crate::error::{ApiError, ApiResult};

pub fn is_member(db: &Database, user_id: i64, group_id: i64) -> ApiResult<bool> {
    Ok(db.membership_role(user_id, group_id)?.is_some())
}

pub fn is_owner(db: &Database, user_id: i64, group_id: i64) -> ApiResult<bool> {
    Ok(db.membership_role(user_id, group_id)? == Some(Role::Owner))
}

/// Fails with `Unauthorized` unless the user belongs to the group.
pub fn require_member(db: &Database, user_id: i64, group_id: i64) -> ApiResult<Role> {
    db.membership_role(user_id, group_id)?
        .ok_or_else(|| ApiError::unauthorized(format!("not a member of group {}", group_id)))
}

/// Loads the group and fails with `Forbidden` unless the user owns it.
pub fn require_owner(db: &Database, user_id: i64, group_id: i64) -> ApiResult<Group> {
    let group = db
        .get_group(group_id)?
        .ok_or_else(|| ApiError::not_found(format!("group {} not found", group_id)))?;

    if group.owner_id != user_id || !is_owner(db, user_id, group_id)? {
        return Err(ApiError::forbidden("only the group owner can do this"));
    }
    Ok(group)
}

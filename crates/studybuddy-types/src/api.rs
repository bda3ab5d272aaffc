use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Role;

// -- Auth --

/// Session token claims issued by the external auth provider.
/// Shared by the REST middleware and the gateway upgrade handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub exp: usize,
}

// -- Profile --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

// -- Groups --

#[derive(Debug, Default, Deserialize)]
pub struct GroupSearchQuery {
    pub search: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateGroupRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_private: Option<bool>,
}

impl UpdateGroupRequest {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.is_private.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferOwnershipRequest {
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberResponse {
    pub user_id: i64,
    pub name: String,
    pub avatar_url: Option<String>,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

// -- Messages --

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrder {
    /// Most recent first, windowed by offset/limit.
    #[default]
    Desc,
    /// The whole log, oldest first.
    Asc,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MessageQuery {
    pub group_id: Option<i64>,
    #[serde(default)]
    pub order: MessageOrder,
    #[serde(default)]
    pub offset: u32,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub group_id: Option<i64>,
    pub message: Option<String>,
    pub attachment_url: Option<String>,
}

// -- Uploads --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    Attachment,
    Avatar,
}

impl UploadKind {
    /// Size ceiling enforced before the storage collaborator is called.
    pub fn max_bytes(&self) -> usize {
        match self {
            UploadKind::Avatar => 5 * 1024 * 1024,
            UploadKind::Attachment => 10 * 1024 * 1024,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadKind::Attachment => "attachment",
            UploadKind::Avatar => "avatar",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub kind: UploadKind,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub url: String,
}

// -- AI relay --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiArtifact {
    Summary,
    Quiz,
    Flashcards,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiRequest {
    pub text: String,
    pub provider_key: String,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

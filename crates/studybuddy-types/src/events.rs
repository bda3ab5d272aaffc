use serde::{Deserialize, Serialize};

/// Events sent over the WebSocket gateway.
///
/// Change events carry no row data: clients treat them as "refetch" signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the connection is authenticated
    Ready { user_id: i64 },

    /// The message log of a group changed (insert or delete)
    MessagesChanged { group_id: i64 },

    /// The caller's personal notes changed
    PersonalMessagesChanged,

    /// Group metadata or roster changed
    GroupChanged { group_id: i64 },

    /// The group no longer exists
    GroupDeleted { group_id: i64 },

    /// Full set of users currently viewing a group
    PresenceSync { group_id: i64, user_ids: Vec<i64> },

    /// A user started viewing a group
    PresenceJoin { group_id: i64, user_id: i64 },

    /// A user stopped viewing a group (including disconnects)
    PresenceLeave { group_id: i64, user_id: i64 },

    /// A command from this connection was rejected
    Error { message: String },
}

impl GatewayEvent {
    /// Returns the group_id if this event is only for subscribers of that group.
    /// `None` means the event is targeted or connection-local.
    pub fn group_id(&self) -> Option<i64> {
        match self {
            Self::MessagesChanged { group_id }
            | Self::GroupChanged { group_id }
            | Self::GroupDeleted { group_id }
            | Self::PresenceSync { group_id, .. }
            | Self::PresenceJoin { group_id, .. }
            | Self::PresenceLeave { group_id, .. } => Some(*group_id),
            Self::Ready { .. } | Self::PersonalMessagesChanged | Self::Error { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Receive change events for a group
    Subscribe { group_id: i64 },

    /// Stop receiving change events for a group
    Unsubscribe { group_id: i64 },

    /// Announce this user as viewing a group
    Track { group_id: i64 },

    /// Stop announcing presence in a group
    Untrack { group_id: i64 },
}

//! Client side of the StudyBuddy message board: an infinite-scroll log with
//! optimistic deletes, a composer that uploads before it sends, presence for
//! the open group, and the realtime session that drives refetches.

pub mod api;
pub mod board;
pub mod error;
pub mod presence;
pub mod realtime;

pub use api::{BoardApi, HttpBoardApi};
pub use board::{Attachment, MessageBoard};
pub use error::ClientError;
pub use presence::PresenceSet;
pub use realtime::{GroupChannel, RealtimeClient};

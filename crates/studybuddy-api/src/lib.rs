pub mod ai;
pub mod error;
pub mod extract;
pub mod groups;
pub mod guard;
pub mod identity;
pub mod messages;
pub mod middleware;
pub mod profile;
pub mod routes;
pub mod state;
pub mod uploads;

pub use error::{ApiError, ApiResult};
pub use state::{AppState, AppStateInner};

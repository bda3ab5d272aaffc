use std::sync::Arc;

use anyhow::anyhow;
use tracing::error;

use studybuddy_db::Database;
use studybuddy_gateway::Dispatcher;

use crate::ai::AiClient;
use crate::error::{ApiError, ApiResult};
use crate::uploads::StorageClient;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    /// HS256 secret shared with the external auth provider.
    pub auth_secret: String,
    pub storage: StorageClient,
    pub ai: AiClient,
    pub default_page_size: u32,
}

impl AppStateInner {
    /// Run blocking store work off the async runtime.
    pub async fn blocking<F, T>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&Database) -> ApiResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                ApiError::Internal(anyhow!("blocking task failed"))
            })?
    }
}

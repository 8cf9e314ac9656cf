use std::sync::Arc;

use crate::cache::InvestigationCache;
use crate::config::EngineConfig;
use crate::storage::SqliteStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub cache: Arc<InvestigationCache<SqliteStore>>,
}

impl AppState {
    pub fn new(config: EngineConfig, cache: InvestigationCache<SqliteStore>) -> Self {
        Self {
            config: Arc::new(config),
            cache: Arc::new(cache),
        }
    }
}

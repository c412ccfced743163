use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::Settings;
use crate::indexer::Indexer;

/// Cap on searches running at once; excess callers wait.
pub const MAX_CONCURRENT_SEARCHES: usize = 8;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub indexer: Arc<Indexer>,
    pub search_permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(settings: Arc<Settings>, indexer: Arc<Indexer>) -> Self {
        Self {
            settings,
            indexer,
            search_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_SEARCHES)),
        }
    }
}

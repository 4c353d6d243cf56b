use std::sync::Arc;

use crate::config::Config;
use crate::mempool::MempoolTracker;
use crate::store::Store;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub mempool: Arc<MempoolTracker>,
}

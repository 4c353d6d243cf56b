pub mod api;
pub mod chain;
pub mod config;
pub mod doge;
pub mod indexer;
pub mod mempool;
pub mod spv;
pub mod state;
pub mod store;
pub mod tip;
pub mod walker;

#[cfg(test)]
pub mod tests;

pub use api::ApiError;
pub use chain::{Blockchain, ChainError, CoreRpcClient};
pub use config::Config;
pub use indexer::Indexer;
pub use mempool::MempoolTracker;
pub use state::AppState;
pub use store::{MemStore, PgStore, Store};
pub use walker::{BlockWalker, ChainEvent};

pub mod config;
pub mod db;
pub mod error;
pub mod image_fetcher;
pub mod notifier;
pub mod search_client;
pub mod sync_engine;

pub use error::{SyncError, SyncResult};
pub use sync_engine::{LoadState, SyncEngine};

pub mod error;
pub mod config;
pub mod store;
pub mod file_store;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use file_store::FileStore;
pub use store::{DurableStore, MemoryStore};

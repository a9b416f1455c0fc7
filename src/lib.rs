pub mod cli;
pub mod collection;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
mod metrics;
pub mod provider;
pub mod reconcile;
pub mod scanner;
pub mod search;
mod server;
pub mod utils;

pub use collection::{Collection, CollectionBuilder, CollectionConfig};
pub use config::Opts;
pub use error::{EmbeddingError, ReconcileError, SearchError};
pub use provider::EmbeddingProvider;

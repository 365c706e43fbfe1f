pub mod config;
pub mod error;
pub mod models;
pub mod staleness;
pub mod store;

pub use config::ClusterConfig;
pub use error::{ConfigError, StoreError};
pub use store::{Reconciliation, Store};

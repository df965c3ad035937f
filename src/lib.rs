pub mod config;
pub mod connection;
pub mod duckdb_load;
pub mod error;
pub mod file_load;
pub mod pool;

#[cfg(feature = "python")]
mod duckdb_postgis;

pub use config::{CancelHandle, IfExists, LoadOptions, TransactionMode};
pub use connection::ConnectionDescriptor;
pub use duckdb_load::core_processor::{
    process_file, process_file_pooled, process_file_with, LoadResult, LoadState,
};
pub use error::{ErrorKind, LoadError};
pub use pool::SessionPool;

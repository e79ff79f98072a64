pub mod config;
pub mod db;
pub mod dimensions;
pub mod error;
pub mod facts;
pub mod ledger;
pub mod pipeline;
pub mod progress;
pub mod queries;
pub mod registry;
pub mod schema;
pub mod source;
pub mod types;

pub use config::{ConnectionSettings, LoaderConfig, RetryPolicy};
pub use error::{LoadError, Result};
pub use pipeline::{LoadReport, LoadStatus, WarehouseLoader};
pub use progress::{LoadProgress, ProgressSink, TracingProgress};

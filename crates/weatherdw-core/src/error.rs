// crates/weatherdw-core/src/error.rs

use thiserror::Error;

use crate::registry::{SurrogateId, Unresolved};
use crate::types::Dimension;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("could not connect to the warehouse after {attempts} attempt(s): {source}")]
    ConnectionFailure {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("schema conflict on {table}: {reason}")]
    SchemaConflict { table: String, reason: String },

    #[error("{dimension} natural key {key} registered twice (existing surrogate id {existing})")]
    DuplicateNaturalKey {
        dimension: Dimension,
        key: String,
        existing: SurrogateId,
    },

    #[error("{dimension} surrogate id {id} is already registered for {existing_key}, not {key}")]
    SurrogateIdReused {
        dimension: Dimension,
        id: SurrogateId,
        existing_key: String,
        key: String,
    },

    #[error("source line {line}: {source}")]
    UnresolvedReference {
        line: u64,
        #[source]
        source: Unresolved,
    },

    #[error("source line {line}, column {column}: {reason}")]
    MalformedRow {
        line: u64,
        column: String,
        reason: String,
    },

    #[error("{dimension} {key} has conflicting attributes: {reason}")]
    AttributeConflict {
        dimension: Dimension,
        key: String,
        reason: String,
    },

    #[error("load cancelled after committing {committed_rows} fact rows")]
    Cancelled { committed_rows: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("database query failed: {0}")]
    Database(#[from] sqlx::Error),
}

impl LoadError {
    pub(crate) fn malformed(line: u64, column: &str, reason: impl Into<String>) -> Self {
        Self::MalformedRow {
            line,
            column: column.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors caused by the source data or a registry inconsistency. These are never retried.
    pub fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNaturalKey { .. }
                | Self::SurrogateIdReused { .. }
                | Self::UnresolvedReference { .. }
                | Self::MalformedRow { .. }
                | Self::AttributeConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;

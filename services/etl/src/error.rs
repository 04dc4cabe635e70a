use crate::warehouse::WarehouseError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the ETL pipeline.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("Staging directory does not exist: {0}")]
    StagingDirMissing(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("State serialization failed: {0}")]
    State(#[from] serde_json::Error),

    #[error("Warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),

    #[error("Transformation failed: {0}")]
    Transform(String),
}

pub type Result<T, E = EtlError> = std::result::Result<T, E>;

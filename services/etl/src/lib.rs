//! Detection ETL
//!
//! Moves staged detection CSV files into the warehouse table. Video batches
//! are cut on a time window, image batches on a pending-row threshold. Every
//! load deduplicates against the `detection_id`s already stored, and the
//! persisted state only records a file as processed after its load
//! succeeded, so a failed or repeated run never loses or doubles rows.
//!
//! ## Architecture
//!
//! ```text
//! staging/*.csv                                                 PostgreSQL
//! ┌──────────────┐   ┌───────────┐   ┌─────────────┐   ┌────────┐   ┌────────────┐
//! │ video_*.csv  │──▶│ Extractor │──▶│ Transformer │──▶│ Loader │──▶│ detections │
//! │ image_*.csv  │   └───────────┘   └─────────────┘   └────────┘   └────────────┘
//! └──────────────┘         ▲                               │
//!                          │                               ▼
//!                   ┌──────────────┐                ┌──────────────┐
//!                   │ BatchManager │◀───commit──────│ EtlPipeline  │
//!                   │ (state file) │                │ / Scheduler  │
//!                   └──────────────┘                └──────────────┘
//! ```

pub mod batch_manager;
pub mod config;
pub mod error;
pub mod extractor;
pub mod loader;
pub mod pipeline;
pub mod scheduler;
pub mod state;
pub mod table;
pub mod transformer;
pub mod warehouse;

#[cfg(test)]
mod testing;

pub use batch_manager::{BatchManager, BatchStatistics};
pub use config::{Config, ConfigValidationError};
pub use error::{EtlError, Result};
pub use extractor::{DataExtractor, ExtractedBatch, FileMetadata, StagedFile, StagingReport, StagingScan};
pub use loader::WarehouseLoader;
pub use pipeline::{EtlPipeline, RunOutcome};
pub use scheduler::{BatchScheduler, StopHandle};
pub use state::{PipelineState, StateStore, Statistics};
pub use table::{Row, TabularBatch};
pub use transformer::{DataTransformer, TransformStats, Transformer};
pub use warehouse::{PgWarehouse, TableStats, Warehouse, WarehouseError};

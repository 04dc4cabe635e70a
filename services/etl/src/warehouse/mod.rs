//! Warehouse table: fixed schema and the storage backend trait.

mod postgres;

#[cfg(test)]
pub(crate) mod memory;

pub use postgres::PgWarehouse;

use crate::table::TabularBatch;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Declared type of a warehouse column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Double,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
        }
    }

    /// Convert a cell to this type. Values that do not convert become null.
    pub fn coerce(&self, value: &Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (ColumnType::Text, Value::String(s)) => Value::String(s.clone()),
            (ColumnType::Text, other) => Value::String(other.to_string()),
            (ColumnType::Integer, Value::Number(n)) => match n.as_i64() {
                Some(i) => Value::from(i),
                None => n
                    .as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| Value::from(f as i64))
                    .unwrap_or(Value::Null),
            },
            (ColumnType::Integer, Value::String(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(Value::from)
                    .unwrap_or(Value::Null)
            }
            (ColumnType::Double, Value::Number(n)) => n.as_f64().map(Value::from).unwrap_or(Value::Null),
            (ColumnType::Double, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::from)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

/// One warehouse column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

/// Canonical column list, in write order.
pub const WAREHOUSE_COLUMNS: [Column; 37] = [
    col("detection_id", ColumnType::Text),
    col("source_type", ColumnType::Text),
    col("source_file", ColumnType::Text),
    col("source_filename", ColumnType::Text),
    col("detection_timestamp", ColumnType::Text),
    col("frame_number", ColumnType::Integer),
    col("frame_timestamp", ColumnType::Double),
    col("class_id", ColumnType::Integer),
    col("class_name", ColumnType::Text),
    col("confidence", ColumnType::Double),
    col("bbox_x1", ColumnType::Double),
    col("bbox_y1", ColumnType::Double),
    col("bbox_x2", ColumnType::Double),
    col("bbox_y2", ColumnType::Double),
    col("bbox_width", ColumnType::Double),
    col("bbox_height", ColumnType::Double),
    col("bbox_area", ColumnType::Double),
    col("center_x", ColumnType::Double),
    col("center_y", ColumnType::Double),
    col("normalized_x1", ColumnType::Double),
    col("normalized_y1", ColumnType::Double),
    col("normalized_x2", ColumnType::Double),
    col("normalized_y2", ColumnType::Double),
    col("aspect_ratio", ColumnType::Double),
    col("relative_area", ColumnType::Double),
    col("image_width", ColumnType::Integer),
    col("image_height", ColumnType::Integer),
    col("detection_index", ColumnType::Integer),
    col("size_category", ColumnType::Text),
    col("confidence_category", ColumnType::Text),
    col("horizontal_position", ColumnType::Text),
    col("vertical_position", ColumnType::Text),
    col("extracted_at", ColumnType::Text),
    col("processed_at", ColumnType::Text),
    col("loaded_at", ColumnType::Text),
    col("source_csv_file", ColumnType::Text),
    col("processing_date", ColumnType::Text),
];

/// Largest multi-row insert that stays under PostgreSQL's 65535 bind
/// parameter limit.
pub const MAX_INSERT_ROWS: usize = u16::MAX as usize / WAREHOUSE_COLUMNS.len();

pub fn column_names() -> Vec<&'static str> {
    WAREHOUSE_COLUMNS.iter().map(|c| c.name).collect()
}

/// Rows per class name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassCount {
    pub class_name: String,
    pub count: i64,
}

/// Warehouse table summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub total_rows: i64,
    pub by_source_type: BTreeMap<String, i64>,
    /// Most frequent classes, most frequent first
    pub top_classes: Vec<ClassCount>,
}

/// Errors raised by a warehouse backend.
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bulk load failed: {0}")]
    BulkLoad(String),

    #[error("Failed to encode rows: {0}")]
    Encode(String),

    #[error("Invalid table name: {0}")]
    InvalidTable(String),
}

/// Storage backend for the detections table.
///
/// Batches handed to the write methods are already aligned to
/// [`WAREHOUSE_COLUMNS`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the table if it does not exist.
    async fn ensure_schema(&self) -> Result<(), WarehouseError>;

    /// Every `detection_id` currently stored.
    async fn existing_detection_ids(&self) -> Result<HashSet<String>, WarehouseError>;

    /// Fast path: write the whole batch in one bulk operation.
    async fn bulk_load(&self, batch: &TabularBatch) -> Result<u64, WarehouseError>;

    /// Write the batch as a single multi-row insert statement.
    async fn insert_rows(&self, batch: &TabularBatch) -> Result<u64, WarehouseError>;

    async fn table_stats(&self) -> Result<TableStats, WarehouseError>;

    /// Delete rows whose `processing_date` is before `date`.
    async fn delete_before(&self, date: NaiveDate) -> Result<u64, WarehouseError>;
}

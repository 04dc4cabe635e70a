//! Cleaning and enrichment of extracted batches.
//!
//! The loader relies on three guarantees from any [`Transformer`]: every row
//! meets the confidence floor, no two rows share a `detection_id`, and every
//! row carries a `detection_id`.

use crate::config::TransformConfig;
use crate::error::Result;
use crate::table::{Row, TabularBatch};
use chrono::Utc;
use detection_classifier::generate_detection_id;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info};

pub const PROCESSED_AT_COLUMN: &str = "_processed_at";

/// Row counts before and after a transformation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TransformStats {
    pub rows_before: usize,
    pub rows_after: usize,
    pub rows_removed: usize,
    pub removal_percentage: f64,
}

impl TransformStats {
    pub fn new(rows_before: usize, rows_after: usize) -> Self {
        let rows_removed = rows_before.saturating_sub(rows_after);
        let removal_percentage = if rows_before == 0 {
            0.0
        } else {
            (rows_removed as f64 / rows_before as f64 * 10_000.0).round() / 100.0
        };
        Self {
            rows_before,
            rows_after,
            rows_removed,
            removal_percentage,
        }
    }
}

/// Turns a raw extracted batch into a validated one.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    fn transform(&self, batch: TabularBatch) -> Result<(TabularBatch, TransformStats)>;
}

/// Default cleaning and enrichment of detection batches.
#[derive(Debug, Clone)]
pub struct DataTransformer {
    min_confidence: f64,
    remove_duplicates: bool,
}

impl DataTransformer {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            remove_duplicates: config.remove_duplicates,
        }
    }

    fn ensure_detection_ids(batch: &mut TabularBatch) -> usize {
        let mut derived = 0;
        batch.set_column("detection_id", |row| match row.get("detection_id") {
            Some(Value::String(id)) if !id.is_empty() => Value::String(id.clone()),
            _ => {
                derived += 1;
                Value::String(derive_detection_id(row))
            }
        });
        derived
    }

    fn enrich(batch: &mut TabularBatch) {
        batch.set_column("size_category", |row| {
            number(TabularBatch::value(row, "relative_area"))
                .map(|area| Value::from(size_category(area)))
                .unwrap_or(Value::Null)
        });
        batch.set_column("confidence_category", |row| {
            number(TabularBatch::value(row, "confidence"))
                .map(|c| Value::from(confidence_category(c)))
                .unwrap_or(Value::Null)
        });
        batch.set_column("horizontal_position", |row| {
            center(row, "normalized_x1", "normalized_x2")
                .map(|x| Value::from(third(x, ["left", "center", "right"])))
                .unwrap_or(Value::Null)
        });
        batch.set_column("vertical_position", |row| {
            center(row, "normalized_y1", "normalized_y2")
                .map(|y| Value::from(third(y, ["top", "middle", "bottom"])))
                .unwrap_or(Value::Null)
        });

        let processed_at = Utc::now().to_rfc3339();
        batch.set_column(PROCESSED_AT_COLUMN, |_| Value::String(processed_at.clone()));
    }
}

impl Transformer for DataTransformer {
    fn name(&self) -> &str {
        "detections"
    }

    fn transform(&self, mut batch: TabularBatch) -> Result<(TabularBatch, TransformStats)> {
        let rows_before = batch.len();

        let min_confidence = self.min_confidence;
        batch.retain(|row| {
            number(TabularBatch::value(row, "confidence"))
                .map(|c| (0.0..=1.0).contains(&c) && c >= min_confidence)
                .unwrap_or(false)
        });
        let after_confidence = batch.len();

        let derived = Self::ensure_detection_ids(&mut batch);

        if self.remove_duplicates {
            let mut seen = HashSet::new();
            batch.retain(|row| match row.get("detection_id") {
                Some(Value::String(id)) => seen.insert(id.clone()),
                _ => true,
            });
        }

        Self::enrich(&mut batch);

        let stats = TransformStats::new(rows_before, batch.len());
        debug!(
            below_confidence = rows_before - after_confidence,
            duplicates = after_confidence - batch.len(),
            derived_ids = derived,
            "Transformation details"
        );
        info!(
            rows_before = stats.rows_before,
            rows_after = stats.rows_after,
            removal_percentage = stats.removal_percentage,
            "Batch transformed"
        );
        Ok((batch, stats))
    }
}

fn derive_detection_id(row: &Row) -> String {
    let text = |column: &str| match TabularBatch::value(row, column) {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    let frame_number = number(TabularBatch::value(row, "frame_number")).map(|f| f as i64);
    let index = number(TabularBatch::value(row, "detection_index")).map_or(0, |i| i as i64);

    generate_detection_id(&text("source_file"), frame_number, &text("timestamp"), index)
}

/// Numeric cell value, accepting numbers and numeric strings.
pub(crate) fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn center(row: &Row, low: &str, high: &str) -> Option<f64> {
    let a = number(TabularBatch::value(row, low))?;
    let b = number(TabularBatch::value(row, high))?;
    Some((a + b) / 2.0)
}

fn size_category(relative_area: f64) -> &'static str {
    if relative_area < 0.01 {
        "small"
    } else if relative_area < 0.1 {
        "medium"
    } else {
        "large"
    }
}

fn confidence_category(confidence: f64) -> &'static str {
    if confidence < 0.5 {
        "low"
    } else if confidence < 0.75 {
        "medium"
    } else {
        "high"
    }
}

fn third(position: f64, labels: [&'static str; 3]) -> &'static str {
    if position < 1.0 / 3.0 {
        labels[0]
    } else if position < 2.0 / 3.0 {
        labels[1]
    } else {
        labels[2]
    }
}

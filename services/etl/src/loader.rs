//! Deduplicated loading into the warehouse table.
//!
//! Every load first reads the full set of stored `detection_id`s and drops
//! batch rows already present, so re-running a load over the same staged
//! files never writes a row twice. The read is proportional to table size,
//! which is the scaling ceiling of this approach.

use crate::error::Result;
use crate::table::TabularBatch;
use crate::warehouse::{column_names, TableStats, Warehouse, WAREHOUSE_COLUMNS};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Alternate column names mapped to their warehouse names.
pub const COLUMN_RENAMES: [(&str, &str); 6] = [
    ("timestamp", "detection_timestamp"),
    ("filename", "source_filename"),
    ("_extracted_at", "extracted_at"),
    ("_processed_at", "processed_at"),
    ("_loaded_at", "loaded_at"),
    ("_source_file", "source_csv_file"),
];

/// Writes validated batches to a [`Warehouse`].
#[derive(Clone)]
pub struct WarehouseLoader {
    warehouse: Arc<dyn Warehouse>,
    insert_chunk_size: usize,
}

impl WarehouseLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, insert_chunk_size: usize) -> Self {
        Self {
            warehouse,
            insert_chunk_size: insert_chunk_size.max(1),
        }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Create the warehouse table if needed.
    pub async fn init_warehouse(&self) -> Result<()> {
        self.warehouse.ensure_schema().await?;
        Ok(())
    }

    /// Rename, stamp and align a batch to the warehouse schema.
    ///
    /// The result has exactly the warehouse columns in canonical order, with
    /// null for anything the input lacked and every cell coerced to its
    /// column type.
    pub fn prepare_batch(&self, mut batch: TabularBatch, loaded_at: DateTime<Utc>) -> TabularBatch {
        for (from, to) in COLUMN_RENAMES {
            batch.rename_column(from, to);
        }

        let loaded_at_text = loaded_at.to_rfc3339();
        batch.set_column("loaded_at", |_| Value::String(loaded_at_text.clone()));

        let load_date = loaded_at.date_naive();
        batch.set_column("processing_date", |row| {
            let date = ["detection_timestamp", "timestamp"]
                .iter()
                .find_map(|c| TabularBatch::value(row, c).as_str().and_then(parse_date))
                .unwrap_or(load_date);
            Value::String(date.format("%Y-%m-%d").to_string())
        });

        let mut aligned = batch.select(&column_names());
        for column in WAREHOUSE_COLUMNS.iter() {
            aligned.set_column(column.name, |row| column.ty.coerce(TabularBatch::value(row, column.name)));
        }
        aligned
    }

    /// Write an aligned batch.
    ///
    /// Tries the bulk path first. If that fails the batch is written as
    /// multi-row inserts of `insert_chunk_size` rows; a failed chunk is
    /// logged and skipped. Returns the number of rows written.
    #[instrument(skip(self, batch), fields(rows = batch.len()))]
    pub async fn load_batch(&self, batch: &TabularBatch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        match self.warehouse.bulk_load(batch).await {
            Ok(rows) => {
                info!(rows, "Bulk load complete");
                return Ok(rows);
            }
            Err(e) => warn!(error = %e, "Bulk load failed, falling back to chunked inserts"),
        }

        let mut written = 0;
        for (index, chunk) in batch.chunks(self.insert_chunk_size).enumerate() {
            match self.warehouse.insert_rows(&chunk).await {
                Ok(rows) => {
                    debug!(chunk = index, rows, "Inserted chunk");
                    written += rows;
                }
                Err(e) => {
                    warn!(chunk = index, rows = chunk.len(), error = %e, "Chunk insert failed, skipping");
                    metrics::counter!("etl.insert_chunks.failed").increment(1);
                }
            }
        }

        info!(rows = written, "Chunked insert complete");
        Ok(written)
    }

    /// Load only rows whose `detection_id` is not yet stored.
    ///
    /// Failing to read the stored ids fails the load.
    #[instrument(skip(self, batch), fields(rows = batch.len()))]
    pub async fn load_with_deduplication(&self, mut batch: TabularBatch) -> Result<u64> {
        let existing = self.warehouse.existing_detection_ids().await?;

        let before = batch.len();
        batch.retain(|row| match TabularBatch::value(row, "detection_id").as_str() {
            Some(id) => !existing.contains(id),
            None => true,
        });
        let duplicates = before - batch.len();

        if duplicates > 0 {
            metrics::counter!("etl.rows.duplicates").increment(duplicates as u64);
        }
        info!(
            existing = existing.len(),
            duplicates,
            new_rows = batch.len(),
            "Deduplicated against warehouse"
        );

        if batch.is_empty() {
            return Ok(0);
        }

        let prepared = self.prepare_batch(batch, Utc::now());
        let loaded = self.load_batch(&prepared).await?;
        metrics::counter!("etl.rows.loaded").increment(loaded);
        Ok(loaded)
    }

    pub async fn table_stats(&self) -> Result<TableStats> {
        Ok(self.warehouse.table_stats().await?)
    }

    /// Delete rows processed more than `days_to_keep` days ago.
    pub async fn cleanup_old_data(&self, days_to_keep: u32) -> Result<u64> {
        let cutoff = Utc::now().date_naive() - Duration::days(i64::from(days_to_keep));
        let deleted = self.warehouse.delete_before(cutoff).await?;
        info!(%cutoff, deleted, "Old warehouse rows removed");
        Ok(deleted)
    }
}

/// Calendar day of a timestamp string.
fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.date_naive());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts.date());
        }
    }
    value
        .get(..10)
        .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Row;
    use crate::warehouse::{MockWarehouse, WarehouseError};
    use serde_json::json;
    use std::collections::HashSet;

    fn row(id: &str) -> Row {
        json!({
            "detection_id": id,
            "source_type": "image",
            "timestamp": "2024-01-01T10:00:00",
            "filename": "a.jpg",
            "confidence": 0.9,
            "frame_number": null,
            "_source_file": "image_a_20240101_100000.csv",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn batch(ids: &[&str]) -> TabularBatch {
        TabularBatch::from_rows(ids.iter().map(|id| row(id)).collect())
    }

    fn ids(set: &[&str]) -> HashSet<String> {
        set.iter().map(|s| s.to_string()).collect()
    }

    fn loader(mock: MockWarehouse, chunk: usize) -> WarehouseLoader {
        WarehouseLoader::new(Arc::new(mock), chunk)
    }

    #[tokio::test]
    async fn test_dedup_writes_only_new_rows() {
        let mut mock = MockWarehouse::new();
        mock.expect_existing_detection_ids()
            .times(1)
            .returning(|| Ok(ids(&["a"])));
        mock.expect_bulk_load()
            .withf(|b: &TabularBatch| {
                b.len() == 1 && TabularBatch::value(&b.rows()[0], "detection_id") == "b"
            })
            .times(1)
            .returning(|b| Ok(b.len() as u64));

        let loaded = loader(mock, 100).load_with_deduplication(batch(&["a", "b"])).await.unwrap();
        assert_eq!(loaded, 1);
    }

    #[tokio::test]
    async fn test_fully_known_batch_writes_nothing() {
        let mut mock = MockWarehouse::new();
        mock.expect_existing_detection_ids()
            .returning(|| Ok(ids(&["a", "b"])));
        mock.expect_bulk_load().times(0);
        mock.expect_insert_rows().times(0);

        let loaded = loader(mock, 100).load_with_deduplication(batch(&["a", "b"])).await.unwrap();
        assert_eq!(loaded, 0);
    }

    #[tokio::test]
    async fn test_id_read_failure_is_fatal() {
        let mut mock = MockWarehouse::new();
        mock.expect_existing_detection_ids()
            .returning(|| Err(WarehouseError::BulkLoad("connection reset".to_string())));
        mock.expect_bulk_load().times(0);

        let result = loader(mock, 100).load_with_deduplication(batch(&["a"])).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fallback_to_chunked_inserts() {
        let mut mock = MockWarehouse::new();
        mock.expect_bulk_load()
            .times(1)
            .returning(|_| Err(WarehouseError::BulkLoad("COPY rejected".to_string())));
        mock.expect_insert_rows()
            .times(3)
            .returning(|b| Ok(b.len() as u64));

        let l = loader(mock, 2);
        let prepared = l.prepare_batch(batch(&["a", "b", "c", "d", "e"]), Utc::now());
        assert_eq!(l.load_batch(&prepared).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_failed_chunk_is_skipped() {
        let mut mock = MockWarehouse::new();
        mock.expect_bulk_load()
            .returning(|_| Err(WarehouseError::BulkLoad("COPY rejected".to_string())));
        mock.expect_insert_rows()
            .withf(|b: &TabularBatch| TabularBatch::value(&b.rows()[0], "detection_id") == "c")
            .returning(|_| Err(WarehouseError::Encode("bad value".to_string())));
        mock.expect_insert_rows()
            .withf(|b: &TabularBatch| TabularBatch::value(&b.rows()[0], "detection_id") != "c")
            .times(2)
            .returning(|b| Ok(b.len() as u64));

        let l = loader(mock, 2);
        let prepared = l.prepare_batch(batch(&["a", "b", "c", "d", "e"]), Utc::now());
        assert_eq!(l.load_batch(&prepared).await.unwrap(), 3);
    }

    #[test]
    fn test_prepare_batch_aligns_schema() {
        let l = loader(MockWarehouse::new(), 100);
        let prepared = l.prepare_batch(batch(&["a"]), Utc::now());

        assert_eq!(prepared.columns(), column_names().as_slice());
        let r = &prepared.rows()[0];
        assert_eq!(r.len(), WAREHOUSE_COLUMNS.len());
        assert_eq!(r["detection_timestamp"], "2024-01-01T10:00:00");
        assert_eq!(r["source_filename"], "a.jpg");
        assert_eq!(r["source_csv_file"], "image_a_20240101_100000.csv");
        assert_eq!(r["processing_date"], "2024-01-01");
        assert!(r["loaded_at"].is_string());
        assert_eq!(r["bbox_x1"], Value::Null);
        assert_eq!(r["frame_number"], Value::Null);
        assert!(r.get("timestamp").is_none());
    }

    #[test]
    fn test_processing_date_falls_back_to_load_date() {
        let l = loader(MockWarehouse::new(), 100);
        let mut input = row("a");
        input.remove("timestamp");
        let loaded_at = DateTime::parse_from_rfc3339("2024-03-05T08:00:00Z").unwrap().with_timezone(&Utc);

        let prepared = l.prepare_batch(TabularBatch::from_rows(vec![input]), loaded_at);
        assert_eq!(prepared.rows()[0]["processing_date"], "2024-03-05");
    }

    #[test]
    fn test_parse_date() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(parse_date("2024-01-02T03:04:05.123456"), Some(day));
        assert_eq!(parse_date("2024-01-02T03:04:05+02:00"), Some(day));
        assert_eq!(parse_date("2024-01-02 03:04:05"), Some(day));
        assert_eq!(parse_date("2024-01-02"), Some(day));
        assert_eq!(parse_date("yesterday"), None);
    }

    #[tokio::test]
    async fn test_cleanup_uses_retention_cutoff() {
        let expected = Utc::now().date_naive() - Duration::days(30);
        let mut mock = MockWarehouse::new();
        mock.expect_delete_before()
            .withf(move |date: &NaiveDate| *date == expected)
            .times(1)
            .returning(|_| Ok(12));

        assert_eq!(loader(mock, 100).cleanup_old_data(30).await.unwrap(), 12);
    }
}

//! In-memory warehouse used by pipeline tests.

use super::{ClassCount, TableStats, Warehouse, WarehouseError};
use crate::table::{Row, TabularBatch};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct MemoryWarehouse {
    rows: Mutex<Vec<Row>>,
    /// Fail the fast path so writes go through `insert_rows`
    pub fail_bulk_load: AtomicBool,
    /// Fail reads of the stored ids
    pub fail_id_reads: AtomicBool,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<Row> {
        self.rows.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn write(&self, batch: &TabularBatch) -> Result<u64, WarehouseError> {
        self.rows.lock().unwrap().extend(batch.rows().iter().cloned());
        Ok(batch.len() as u64)
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_schema(&self) -> Result<(), WarehouseError> {
        Ok(())
    }

    async fn existing_detection_ids(&self) -> Result<HashSet<String>, WarehouseError> {
        if self.fail_id_reads.load(Ordering::SeqCst) {
            return Err(WarehouseError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r.get("detection_id").and_then(|v| v.as_str()).map(str::to_string))
            .collect())
    }

    async fn bulk_load(&self, batch: &TabularBatch) -> Result<u64, WarehouseError> {
        if self.fail_bulk_load.load(Ordering::SeqCst) {
            return Err(WarehouseError::BulkLoad("bulk path disabled".to_string()));
        }
        self.write(batch)
    }

    async fn insert_rows(&self, batch: &TabularBatch) -> Result<u64, WarehouseError> {
        self.write(batch)
    }

    async fn table_stats(&self) -> Result<TableStats, WarehouseError> {
        let rows = self.rows.lock().unwrap();
        let mut by_source_type = BTreeMap::new();
        let mut classes: HashMap<String, i64> = HashMap::new();
        for row in rows.iter() {
            let source = TabularBatch::value(row, "source_type").as_str().unwrap_or_default();
            *by_source_type.entry(source.to_string()).or_insert(0) += 1;
            let class = TabularBatch::value(row, "class_name").as_str().unwrap_or_default();
            *classes.entry(class.to_string()).or_insert(0) += 1;
        }

        let mut top_classes: Vec<ClassCount> = classes
            .into_iter()
            .map(|(class_name, count)| ClassCount { class_name, count })
            .collect();
        top_classes.sort_by(|a, b| b.count.cmp(&a.count).then(a.class_name.cmp(&b.class_name)));
        top_classes.truncate(10);

        Ok(TableStats {
            total_rows: rows.len() as i64,
            by_source_type,
            top_classes,
        })
    }

    async fn delete_before(&self, date: NaiveDate) -> Result<u64, WarehouseError> {
        let cutoff = date.format("%Y-%m-%d").to_string();
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| match TabularBatch::value(r, "processing_date").as_str() {
            Some(d) => d >= cutoff.as_str(),
            None => true,
        });
        Ok((before - rows.len()) as u64)
    }
}

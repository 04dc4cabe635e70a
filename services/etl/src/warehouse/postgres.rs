use super::{ClassCount, ColumnType, TableStats, Warehouse, WarehouseError, WAREHOUSE_COLUMNS};
use crate::config::{is_valid_identifier, WarehouseConfig};
use crate::table::TabularBatch;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolCopyExt, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashSet;
use tracing::{debug, info, instrument};

/// Detections table in PostgreSQL.
pub struct PgWarehouse {
    pool: PgPool,
    table: String,
}

impl PgWarehouse {
    /// Create a warehouse with a connection pool.
    pub async fn connect(config: &WarehouseConfig) -> Result<Self, WarehouseError> {
        if !is_valid_identifier(&config.table_name) {
            return Err(WarehouseError::InvalidTable(config.table_name.clone()));
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!(table = %config.table_name, "Connected to warehouse");

        Ok(Self {
            pool,
            table: config.table_name.clone(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn ensure_schema(&self) -> Result<(), WarehouseError> {
        for statement in schema_sql(&self.table) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        info!(table = %self.table, "Warehouse table ready");
        Ok(())
    }

    async fn existing_detection_ids(&self) -> Result<HashSet<String>, WarehouseError> {
        let sql = format!(
            "SELECT DISTINCT detection_id FROM {} WHERE detection_id IS NOT NULL",
            self.table
        );
        let ids: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        debug!(count = ids.len(), "Fetched existing detection ids");
        Ok(ids.into_iter().collect())
    }

    #[instrument(skip(self, batch), fields(rows = batch.len()))]
    async fn bulk_load(&self, batch: &TabularBatch) -> Result<u64, WarehouseError> {
        let data = encode_csv(batch)?;

        let mut copy = self.pool.copy_in_raw(&copy_sql(&self.table)).await?;
        let sent = copy.send(data).await.map(|_| ());
        if let Err(e) = sent {
            copy.abort(e.to_string()).await?;
            return Err(WarehouseError::BulkLoad(e.to_string()));
        }
        let rows = copy.finish().await?;

        debug!(rows, "COPY completed");
        Ok(rows)
    }

    async fn insert_rows(&self, batch: &TabularBatch) -> Result<u64, WarehouseError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix(&self.table));
        builder.push_values(batch.rows(), |mut b, row| {
            for column in WAREHOUSE_COLUMNS.iter() {
                let value = TabularBatch::value(row, column.name);
                match column.ty {
                    ColumnType::Integer => b.push_bind(value.as_i64()),
                    ColumnType::Double => b.push_bind(value.as_f64()),
                    ColumnType::Text => b.push_bind(text_cell(value)),
                };
            }
        });

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn table_stats(&self) -> Result<TableStats, WarehouseError> {
        let total_rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;

        let by_source: Vec<(Option<String>, i64)> = sqlx::query_as(&format!(
            "SELECT source_type, COUNT(*) FROM {} GROUP BY source_type",
            self.table
        ))
        .fetch_all(&self.pool)
        .await?;

        let top: Vec<(Option<String>, i64)> = sqlx::query_as(&format!(
            "SELECT class_name, COUNT(*) AS n FROM {} GROUP BY class_name ORDER BY n DESC LIMIT 10",
            self.table
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(TableStats {
            total_rows,
            by_source_type: by_source
                .into_iter()
                .map(|(source, n)| (source.unwrap_or_default(), n))
                .collect(),
            top_classes: top
                .into_iter()
                .map(|(class_name, count)| ClassCount {
                    class_name: class_name.unwrap_or_default(),
                    count,
                })
                .collect(),
        })
    }

    #[instrument(skip(self))]
    async fn delete_before(&self, date: NaiveDate) -> Result<u64, WarehouseError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE processing_date < $1", self.table))
            .bind(date.format("%Y-%m-%d").to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn column_list() -> String {
    WAREHOUSE_COLUMNS
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Statements creating the table and its lookup indexes.
fn schema_sql(table: &str) -> Vec<String> {
    let columns = WAREHOUSE_COLUMNS
        .iter()
        .map(|c| format!("    {} {}", c.name, c.ty.sql_type()))
        .collect::<Vec<_>>()
        .join(",\n");

    vec![
        format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n)", table, columns),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_detection_id_idx ON {table} (detection_id)",
            table = table
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_processing_date_idx ON {table} (processing_date)",
            table = table
        ),
    ]
}

fn copy_sql(table: &str) -> String {
    format!("COPY {} ({}) FROM STDIN WITH (FORMAT csv)", table, column_list())
}

fn insert_prefix(table: &str) -> String {
    format!("INSERT INTO {} ({}) ", table, column_list())
}

fn text_cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        // COPY reads an unquoted empty field as NULL; the insert path must agree.
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Encode rows as CSV in canonical column order. Nulls and empty strings are
/// empty fields.
fn encode_csv(batch: &TabularBatch) -> Result<Vec<u8>, WarehouseError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());

    for row in batch.rows() {
        let record: Vec<String> = WAREHOUSE_COLUMNS
            .iter()
            .map(|c| text_cell(TabularBatch::value(row, c.name)).unwrap_or_default())
            .collect();
        writer
            .write_record(&record)
            .map_err(|e| WarehouseError::Encode(e.to_string()))?;
    }

    writer
        .into_inner()
        .map_err(|e| WarehouseError::Encode(e.to_string()))
}

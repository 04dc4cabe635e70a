//! Extract, transform and load orchestration for one source type at a time.
//!
//! ```text
//! CHECK_TRIGGER ──not ready──▶ stop
//!       │ ready
//!       ▼
//!    EXTRACT ──empty──▶ stop
//!       │
//!       ▼
//!   TRANSFORM ──▶ LOAD ──▶ UPDATE_STATE ──▶ stop
//! ```
//!
//! State is only updated after a successful load. If any step fails the
//! staged files stay pending and the next run retries them; the loader's
//! deduplication keeps the retry from writing rows twice.

use crate::batch_manager::BatchManager;
use crate::error::Result;
use crate::extractor::{DataExtractor, StagedFile};
use crate::loader::WarehouseLoader;
use crate::transformer::{TransformStats, Transformer};
use detection_classifier::SourceType;
use tracing::{error, info, instrument};

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The batch trigger did not fire
    NotReady,
    /// Trigger fired but no unprocessed files exist
    NoPendingFiles,
    /// No rows could be read from the pending files
    NothingExtracted,
    /// A batch was loaded and committed
    Loaded {
        files: Vec<String>,
        rows_extracted: usize,
        rows_loaded: u64,
        stats: TransformStats,
    },
}

impl RunOutcome {
    pub fn rows_loaded(&self) -> u64 {
        match self {
            RunOutcome::Loaded { rows_loaded, .. } => *rows_loaded,
            _ => 0,
        }
    }
}

/// Runs the ETL state machine.
pub struct EtlPipeline {
    batch_manager: BatchManager,
    extractor: DataExtractor,
    transformer: Box<dyn Transformer>,
    loader: WarehouseLoader,
}

impl EtlPipeline {
    pub fn new(
        batch_manager: BatchManager,
        extractor: DataExtractor,
        transformer: Box<dyn Transformer>,
        loader: WarehouseLoader,
    ) -> Self {
        Self {
            batch_manager,
            extractor,
            transformer,
            loader,
        }
    }

    pub fn batch_manager(&self) -> &BatchManager {
        &self.batch_manager
    }

    pub fn batch_manager_mut(&mut self) -> &mut BatchManager {
        &mut self.batch_manager
    }

    pub fn extractor(&self) -> &DataExtractor {
        &self.extractor
    }

    pub fn loader(&self) -> &WarehouseLoader {
        &self.loader
    }

    /// Run the pipeline for one source type.
    ///
    /// `force` skips the trigger check.
    pub async fn run(&mut self, source_type: SourceType, force: bool) -> Result<RunOutcome> {
        let result = self.run_once(source_type, force).await;
        if let Err(e) = &result {
            error!(source_type = %source_type, error = %e, "Pipeline run failed, state left unchanged");
            metrics::counter!("etl.runs.failed", "source_type" => source_type.as_str()).increment(1);
        }
        result
    }

    #[instrument(skip(self, source_type), fields(source_type = %source_type))]
    async fn run_once(&mut self, source_type: SourceType, force: bool) -> Result<RunOutcome> {
        if !force && source_type == SourceType::Video && !self.batch_manager.should_process_video_batch() {
            info!("Video batch window has not elapsed");
            return Ok(RunOutcome::NotReady);
        }

        let processed = self.batch_manager.processed_files();
        let pending = self.extractor.scan_staging()?.pending(source_type, &processed);

        if !force && source_type == SourceType::Image {
            let pending_count: usize = pending.iter().map(|f| f.row_count).sum();
            if !self.batch_manager.should_process_image_batch(pending_count) {
                let names = file_names(&pending);
                self.batch_manager.track_pending_images(&names)?;
                info!(
                    pending_files = pending.len(),
                    pending_count,
                    batch_size = self.batch_manager.image_batch_size(),
                    "Not enough pending images for a batch"
                );
                return Ok(RunOutcome::NotReady);
            }
        }

        if pending.is_empty() {
            info!("No pending files");
            return Ok(RunOutcome::NoPendingFiles);
        }

        let extracted = self.extractor.extract(&pending);
        if extracted.batch.is_empty() {
            info!(files = pending.len(), "No rows extracted");
            return Ok(RunOutcome::NothingExtracted);
        }
        let rows_extracted = extracted.batch.len();

        let (batch, stats) = self.transformer.transform(extracted.batch)?;
        let rows_loaded = self.loader.load_with_deduplication(batch).await?;

        self.batch_manager
            .commit_batch(source_type, &extracted.files_read, rows_loaded as usize)?;

        info!(
            files = extracted.files_read.len(),
            rows_extracted,
            rows_loaded,
            "Pipeline run complete"
        );

        Ok(RunOutcome::Loaded {
            files: extracted.files_read,
            rows_extracted,
            rows_loaded,
            stats,
        })
    }
}

fn file_names(files: &[StagedFile]) -> Vec<String> {
    files.iter().map(|f| f.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformConfig;
    use crate::state::StateStore;
    use crate::testing::{sample_records, write_staged};
    use crate::transformer::DataTransformer;
    use crate::warehouse::memory::MemoryWarehouse;
    use chrono::Duration;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        staging: PathBuf,
        state_file: PathBuf,
        warehouse: Arc<MemoryWarehouse>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let staging = dir.path().join("staging");
            std::fs::create_dir_all(&staging).unwrap();
            Self {
                state_file: dir.path().join("state.json"),
                staging,
                _dir: dir,
                warehouse: Arc::new(MemoryWarehouse::new()),
            }
        }

        fn pipeline(&self) -> EtlPipeline {
            let store = StateStore::load(&self.state_file).unwrap();
            EtlPipeline::new(
                BatchManager::with_store(store, Duration::seconds(300), 100),
                DataExtractor::new(&self.staging).unwrap(),
                Box::new(DataTransformer::new(&TransformConfig::default())),
                WarehouseLoader::new(self.warehouse.clone(), 100),
            )
        }

        fn stage(&self, name: &str, source_type: SourceType, source: &str, rows: usize) {
            write_staged(&self.staging, name, &sample_records(source_type, source, rows));
        }
    }

    #[tokio::test]
    async fn test_image_batch_waits_for_threshold() {
        let fx = Fixture::new();
        fx.stage("video_a_20240101_100000.csv", SourceType::Video, "a.mp4", 50);
        fx.stage("image_b_20240101_100000.csv", SourceType::Image, "b.jpg", 60);
        let mut pipeline = fx.pipeline();

        let outcome = pipeline.run(SourceType::Image, false).await.unwrap();
        assert_eq!(outcome, RunOutcome::NotReady);
        assert!(pipeline.batch_manager().processed_files().is_empty());
        assert_eq!(pipeline.batch_manager().state().pending_images, vec!["image_b_20240101_100000.csv"]);
        assert_eq!(fx.warehouse.len(), 0);

        fx.stage("image_c_20240101_100500.csv", SourceType::Image, "c.jpg", 45);

        let outcome = pipeline.run(SourceType::Image, false).await.unwrap();
        match outcome {
            RunOutcome::Loaded { files, rows_extracted, rows_loaded, .. } => {
                assert_eq!(files.len(), 2);
                assert_eq!(rows_extracted, 105);
                assert_eq!(rows_loaded, 105);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let state = pipeline.batch_manager().state();
        assert!(state.is_processed("image_b_20240101_100000.csv"));
        assert!(state.is_processed("image_c_20240101_100500.csv"));
        assert!(!state.is_processed("video_a_20240101_100000.csv"));
        assert!(state.pending_images.is_empty());
        assert_eq!(state.statistics.image_batches, 1);
        assert_eq!(fx.warehouse.len(), 105);
    }

    #[tokio::test]
    async fn test_not_ready_image_run_only_records_pending_list() {
        let fx = Fixture::new();
        fx.stage("image_b_20240101_100000.csv", SourceType::Image, "b.jpg", 10);
        let mut pipeline = fx.pipeline();

        assert_eq!(pipeline.run(SourceType::Image, false).await.unwrap(), RunOutcome::NotReady);

        let reloaded = StateStore::load(&fx.state_file).unwrap();
        let state = reloaded.state();
        assert_eq!(state.pending_images, vec!["image_b_20240101_100000.csv"]);
        assert!(state.processed_files.is_empty());
        assert_eq!(state.statistics, Default::default());
        assert!(state.last_run.is_none());
        assert!(state.last_video_batch_time.is_none());
    }

    #[tokio::test]
    async fn test_second_run_loads_nothing() {
        let fx = Fixture::new();
        fx.stage("video_a_20240101_100000.csv", SourceType::Video, "a.mp4", 50);
        let mut pipeline = fx.pipeline();

        let first = pipeline.run(SourceType::Video, false).await.unwrap();
        assert_eq!(first.rows_loaded(), 50);

        let second = pipeline.run(SourceType::Video, true).await.unwrap();
        assert_eq!(second, RunOutcome::NoPendingFiles);
        assert_eq!(fx.warehouse.len(), 50);
    }

    #[tokio::test]
    async fn test_reprocessing_after_reset_is_deduplicated() {
        let fx = Fixture::new();
        fx.stage("video_a_20240101_100000.csv", SourceType::Video, "a.mp4", 20);
        let mut pipeline = fx.pipeline();

        pipeline.run(SourceType::Video, false).await.unwrap();
        pipeline.batch_manager_mut().reset_state().unwrap();

        let again = pipeline.run(SourceType::Video, false).await.unwrap();
        match again {
            RunOutcome::Loaded { rows_extracted, rows_loaded, .. } => {
                assert_eq!(rows_extracted, 20);
                assert_eq!(rows_loaded, 0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fx.warehouse.len(), 20);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_state_untouched() {
        let fx = Fixture::new();
        fx.stage("video_a_20240101_100000.csv", SourceType::Video, "a.mp4", 10);
        let mut pipeline = fx.pipeline();

        fx.warehouse.fail_id_reads.store(true, Ordering::SeqCst);
        assert!(pipeline.run(SourceType::Video, false).await.is_err());
        assert!(pipeline.batch_manager().processed_files().is_empty());
        assert!(pipeline.batch_manager().state().last_video_batch_time.is_none());

        // A fresh pipeline over the same state file retries the same files.
        fx.warehouse.fail_id_reads.store(false, Ordering::SeqCst);
        let mut retry = fx.pipeline();
        let outcome = retry.run(SourceType::Video, false).await.unwrap();
        assert_eq!(outcome.rows_loaded(), 10);
        assert!(retry.batch_manager().state().is_processed("video_a_20240101_100000.csv"));
    }

    #[tokio::test]
    async fn test_video_window_blocks_until_elapsed() {
        let fx = Fixture::new();
        fx.stage("video_a_20240101_100000.csv", SourceType::Video, "a.mp4", 5);
        let mut pipeline = fx.pipeline();
        pipeline.run(SourceType::Video, false).await.unwrap();

        fx.stage("video_b_20240101_100100.csv", SourceType::Video, "b.mp4", 5);
        assert_eq!(pipeline.run(SourceType::Video, false).await.unwrap(), RunOutcome::NotReady);

        let forced = pipeline.run(SourceType::Video, true).await.unwrap();
        assert_eq!(forced.rows_loaded(), 5);
        assert_eq!(pipeline.batch_manager().state().statistics.video_batches, 2);
    }

    #[tokio::test]
    async fn test_fallback_path_loads_everything() {
        let fx = Fixture::new();
        fx.stage("image_a_20240101_100000.csv", SourceType::Image, "a.jpg", 150);
        fx.warehouse.fail_bulk_load.store(true, Ordering::SeqCst);
        let mut pipeline = fx.pipeline();

        let outcome = pipeline.run(SourceType::Image, false).await.unwrap();
        assert_eq!(outcome.rows_loaded(), 150);
        assert_eq!(fx.warehouse.len(), 150);
    }

    #[tokio::test]
    async fn test_unknown_files_are_ignored() {
        let fx = Fixture::new();
        fx.stage("detections_20240101_100000.csv", SourceType::Image, "x.jpg", 200);
        let mut pipeline = fx.pipeline();

        let outcome = pipeline.run(SourceType::Image, true).await.unwrap();
        assert_eq!(outcome, RunOutcome::NoPendingFiles);
    }

    #[tokio::test]
    async fn test_loaded_rows_match_warehouse_schema() {
        let fx = Fixture::new();
        fx.stage("image_a_20240101_100000.csv", SourceType::Image, "a.jpg", 1);
        let mut pipeline = fx.pipeline();
        pipeline.run(SourceType::Image, true).await.unwrap();

        let rows = fx.warehouse.rows();
        let row = &rows[0];
        assert_eq!(row.len(), crate::warehouse::WAREHOUSE_COLUMNS.len());
        assert_eq!(row["source_csv_file"], "image_a_20240101_100000.csv");
        assert_eq!(row["processing_date"], "2024-01-01");
        assert_eq!(row["source_type"], "image");
        assert!(row["size_category"].is_string());
    }
}

//! Batch triggers and the single state-update step.
//!
//! Video batches are time triggered: whatever has accumulated is processed
//! once the window since the last video batch has elapsed. Image batches are
//! count triggered: they wait until enough detections are pending. The two
//! policies are independent.

use crate::config::{BatchingConfig, MAX_VIDEO_TIME_WINDOW_SECS};
use crate::error::Result;
use crate::state::{PipelineState, Statistics, StateStore};
use chrono::{DateTime, Duration, Utc};
use detection_classifier::SourceType;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, instrument};

/// Point-in-time view of the pipeline state for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatistics {
    #[serde(flatten)]
    pub counters: Statistics,
    pub processed_files_count: usize,
    pub pending_images_count: usize,
    pub last_run: Option<DateTime<Utc>>,
    pub last_video_batch: Option<DateTime<Utc>>,
    pub minutes_since_last_run: Option<f64>,
    pub seconds_until_next_video_batch: Option<f64>,
}

/// Owns the persisted state and decides when a batch is ready.
#[derive(Debug)]
pub struct BatchManager {
    store: StateStore,
    video_time_window: Duration,
    image_batch_size: usize,
}

impl BatchManager {
    /// Load the state file named in the config.
    pub fn new(config: &BatchingConfig) -> Result<Self> {
        let store = StateStore::load(&config.state_file)?;
        Ok(Self::with_store(
            store,
            Duration::seconds(config.video_time_window_secs.min(MAX_VIDEO_TIME_WINDOW_SECS) as i64),
            config.image_batch_size,
        ))
    }

    pub fn with_store(store: StateStore, video_time_window: Duration, image_batch_size: usize) -> Self {
        info!(
            video_window_secs = video_time_window.num_seconds(),
            image_batch_size,
            "Batch manager initialized"
        );
        Self {
            store,
            video_time_window,
            image_batch_size,
        }
    }

    pub fn state(&self) -> &PipelineState {
        self.store.state()
    }

    pub fn video_time_window(&self) -> Duration {
        self.video_time_window
    }

    pub fn image_batch_size(&self) -> usize {
        self.image_batch_size
    }

    /// Names of every staged file already loaded.
    pub fn processed_files(&self) -> HashSet<String> {
        self.state().processed_set()
    }

    pub fn should_process_video_batch(&self) -> bool {
        self.should_process_video_batch_at(Utc::now())
    }

    /// True when no video batch has run yet or the window has elapsed at `now`.
    pub fn should_process_video_batch_at(&self, now: DateTime<Utc>) -> bool {
        match self.state().last_video_batch_time {
            None => true,
            Some(last) => {
                let elapsed = now - last;
                debug!(
                    elapsed_secs = elapsed.num_seconds(),
                    window_secs = self.video_time_window.num_seconds(),
                    "Checking video batch window"
                );
                elapsed >= self.video_time_window
            }
        }
    }

    /// True when at least `image_batch_size` detections are pending.
    pub fn should_process_image_batch(&self, pending_count: usize) -> bool {
        pending_count >= self.image_batch_size
    }

    /// Remember which image files are waiting for the next image batch.
    ///
    /// Only persists when the list actually changed.
    pub fn track_pending_images(&mut self, files: &[String]) -> Result<()> {
        if self.state().pending_images.as_slice() == files {
            return Ok(());
        }
        self.store.commit(|state| state.pending_images = files.to_vec())
    }

    pub fn commit_batch(&mut self, source_type: SourceType, files: &[String], records_loaded: usize) -> Result<()> {
        self.commit_batch_at(source_type, files, records_loaded, Utc::now())
    }

    /// Record a successfully loaded batch.
    ///
    /// Marks the files processed, bumps the counters and advances the
    /// trigger for `source_type`, all in one persisted commit.
    #[instrument(skip(self, files), fields(files = files.len()))]
    pub fn commit_batch_at(
        &mut self,
        source_type: SourceType,
        files: &[String],
        records_loaded: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let added = self.store.commit(|state| {
            let added = state.mark_processed(files.iter().map(String::as_str));

            let stats = &mut state.statistics;
            stats.total_batches += 1;
            stats.total_records += records_loaded as u64;
            match source_type {
                SourceType::Video => {
                    stats.video_batches += 1;
                    state.last_video_batch_time = Some(now);
                }
                SourceType::Image => {
                    stats.image_batches += 1;
                    state.pending_images.clear();
                }
            }
            state.last_run = Some(now);
            added
        })?;

        metrics::counter!("etl.batches.committed", "source_type" => source_type.as_str()).increment(1);
        info!(
            source_type = %source_type,
            files_marked = added,
            records_loaded,
            "Batch committed"
        );
        Ok(())
    }

    pub fn statistics(&self) -> BatchStatistics {
        self.statistics_at(Utc::now())
    }

    pub fn statistics_at(&self, now: DateTime<Utc>) -> BatchStatistics {
        let state = self.state();

        let minutes_since_last_run = state
            .last_run
            .map(|last| (now - last).num_seconds() as f64 / 60.0);
        let seconds_until_next_video_batch = state.last_video_batch_time.map(|last| {
            let remaining = self.video_time_window - (now - last);
            remaining.num_seconds().max(0) as f64
        });

        BatchStatistics {
            counters: state.statistics.clone(),
            processed_files_count: state.processed_files.len(),
            pending_images_count: state.pending_images.len(),
            last_run: state.last_run,
            last_video_batch: state.last_video_batch_time,
            minutes_since_last_run,
            seconds_until_next_video_batch,
        }
    }

    /// Forget all processed files and counters.
    pub fn reset_state(&mut self) -> Result<()> {
        self.store.reset()?;
        info!(path = %self.store.path().display(), "Pipeline state reset");
        Ok(())
    }
}

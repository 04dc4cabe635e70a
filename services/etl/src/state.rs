//! Persisted pipeline state.
//!
//! The state file is the only shared mutable resource of the ETL. It is owned
//! by a single [`StateStore`]; every change goes through
//! [`StateStore::commit`], which applies the change to a copy and atomically
//! replaces the file before the new state becomes visible.

use crate::error::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Running counters kept across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Statistics {
    pub total_batches: u64,
    pub total_records: u64,
    pub video_batches: u64,
    pub image_batches: u64,
}

/// Pipeline state as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Staged files already loaded, in the order they were marked
    #[serde(default)]
    pub processed_files: Vec<String>,
    /// When the last video batch was committed
    #[serde(default, rename = "last_video_batch", deserialize_with = "lenient_timestamp")]
    pub last_video_batch_time: Option<DateTime<Utc>>,
    /// Image files waiting for the next image batch
    #[serde(default)]
    pub pending_images: Vec<String>,
    /// When any batch was last committed
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub statistics: Statistics,
}

/// Accept RFC 3339 timestamps as well as offset-less ISO-8601 ones, which are
/// read as UTC.
fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    raw.parse::<NaiveDateTime>()
        .map(|naive| Some(naive.and_utc()))
        .map_err(|e| de::Error::custom(format!("invalid timestamp {:?}: {}", raw, e)))
}

impl PipelineState {
    pub fn is_processed(&self, file_name: &str) -> bool {
        self.processed_files.iter().any(|f| f == file_name)
    }

    pub fn processed_set(&self) -> HashSet<String> {
        self.processed_files.iter().cloned().collect()
    }

    /// Append file names not already present. Never removes entries.
    pub fn mark_processed<'a>(&mut self, files: impl IntoIterator<Item = &'a str>) -> usize {
        let mut known = self.processed_set();
        let mut added = 0;
        for file in files {
            if known.insert(file.to_string()) {
                self.processed_files.push(file.to_string());
                added += 1;
            }
        }
        added
    }
}

/// File-backed owner of the pipeline state.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: PipelineState,
}

impl StateStore {
    /// Load state from `path`.
    ///
    /// A missing file yields the default state. An unreadable or corrupt file
    /// is logged and replaced by the default state; reprocessing is safe
    /// because the loader deduplicates against the warehouse.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let state = if path.exists() {
            match Self::read(&path) {
                Ok(state) => {
                    info!(path = %path.display(), "Loaded pipeline state");
                    state
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read state, using empty state");
                    PipelineState::default()
                }
            }
        } else {
            debug!(path = %path.display(), "No state file, starting from empty state");
            PipelineState::default()
        };

        Ok(Self { path, state })
    }

    fn read(path: &Path) -> Result<PipelineState> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Apply a change and persist it.
    ///
    /// The change is made on a copy; the in-memory state is only replaced
    /// once the file has been written, so a failed write leaves both
    /// untouched.
    pub fn commit<T>(&mut self, change: impl FnOnce(&mut PipelineState) -> T) -> Result<T> {
        let mut next = self.state.clone();
        let output = change(&mut next);
        self.persist(&next)?;
        self.state = next;
        Ok(output)
    }

    /// Replace the state with the empty default.
    pub fn reset(&mut self) -> Result<()> {
        self.commit(|state| *state = PipelineState::default())
    }

    fn persist(&self, state: &PipelineState) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "State saved");
        Ok(())
    }
}

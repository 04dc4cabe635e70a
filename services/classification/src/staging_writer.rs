//! Staging area writer.
//!
//! Detection records are persisted as CSV files named
//! `{video|image}_{stem}_{YYYYMMDD_HHMMSS}.csv`. Files are never modified
//! after creation; the ETL only reads them.

use crate::record::{DetectionRecord, SourceType};
use crate::ClassificationError;
use chrono::Local;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Timestamp layout embedded in staged file names.
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Summary of the staging directory contents.
#[derive(Debug, Clone, Serialize)]
pub struct StagingSummary {
    pub staging_directory: String,
    pub csv_files: usize,
    pub total_detections: usize,
    pub files: Vec<String>,
}

/// Writes detection records to the staging area.
pub struct StagingWriter {
    staging_dir: PathBuf,
    buffer_size: usize,
    buffer: Vec<DetectionRecord>,
    files_created: Vec<PathBuf>,
}

impl StagingWriter {
    /// Create a writer, creating the staging directory if needed.
    pub fn new(staging_dir: impl Into<PathBuf>, buffer_size: usize) -> Result<Self, ClassificationError> {
        let staging_dir = staging_dir.into();
        fs::create_dir_all(&staging_dir)?;

        info!(staging_dir = %staging_dir.display(), "Staging writer initialized");

        Ok(Self {
            staging_dir,
            buffer_size: buffer_size.max(1),
            buffer: Vec::new(),
            files_created: Vec::new(),
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Files written by this writer, oldest first.
    pub fn created_files(&self) -> &[PathBuf] {
        &self.files_created
    }

    /// Number of buffered detections not yet written.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer detections, flushing once the buffer is full.
    pub fn add_detections(
        &mut self,
        detections: impl IntoIterator<Item = DetectionRecord>,
    ) -> Result<Option<PathBuf>, ClassificationError> {
        self.buffer.extend(detections);
        debug!(buffered = self.buffer.len(), "Detections buffered");

        if self.buffer.len() >= self.buffer_size {
            return self.flush(None);
        }
        Ok(None)
    }

    /// Write the buffer to a new file.
    ///
    /// Named `{name}_{timestamp}.csv` when a name is given, otherwise
    /// `detections_{timestamp with microseconds}.csv`.
    pub fn flush(&mut self, source_name: Option<&str>) -> Result<Option<PathBuf>, ClassificationError> {
        if self.buffer.is_empty() {
            debug!("Buffer empty, nothing to flush");
            return Ok(None);
        }

        let now = Local::now();
        let filename = match source_name {
            Some(name) => format!("{}_{}.csv", name, now.format(FILE_TIMESTAMP_FORMAT)),
            None => format!("detections_{}.csv", now.format("%Y%m%d_%H%M%S%6f")),
        };

        let records = std::mem::take(&mut self.buffer);
        let path = self.write_file(&filename, &records)?;
        Ok(Some(path))
    }

    /// Write all detections of a video into one staged file.
    pub fn write_video_detections(
        &mut self,
        video_name: &str,
        detections: &[DetectionRecord],
    ) -> Result<Option<PathBuf>, ClassificationError> {
        self.write_source(SourceType::Video, video_name, detections)
    }

    /// Write the detections of a single image into one staged file.
    pub fn write_image_detections(
        &mut self,
        image_name: &str,
        detections: &[DetectionRecord],
    ) -> Result<Option<PathBuf>, ClassificationError> {
        self.write_source(SourceType::Image, image_name, detections)
    }

    fn write_source(
        &mut self,
        source_type: SourceType,
        source_name: &str,
        detections: &[DetectionRecord],
    ) -> Result<Option<PathBuf>, ClassificationError> {
        if detections.is_empty() {
            warn!(source = %source_name, source_type = %source_type, "No detections to stage");
            return Ok(None);
        }

        let filename = staged_file_name(source_type, source_name, &Local::now().naive_local());
        let path = self.write_file(&filename, detections)?;
        Ok(Some(path))
    }

    fn write_file(&mut self, filename: &str, records: &[DetectionRecord]) -> Result<PathBuf, ClassificationError> {
        let path = self.staging_dir.join(filename);

        let mut writer = csv::Writer::from_path(&path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;

        info!(file = %filename, detections = records.len(), "Staged detections");
        self.files_created.push(path.clone());

        Ok(path)
    }

    /// Count staged CSV files and the detections they hold.
    pub fn staging_summary(&self) -> Result<StagingSummary, ClassificationError> {
        let mut files = Vec::new();
        let mut total_detections = 0;

        for entry in fs::read_dir(&self.staging_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }

            match csv::Reader::from_path(&path) {
                Ok(mut reader) => total_detections += reader.records().count(),
                Err(e) => warn!(file = %path.display(), error = %e, "Failed to read staged file"),
            }
            if let Some(name) = path.file_name() {
                files.push(name.to_string_lossy().into_owned());
            }
        }

        Ok(StagingSummary {
            staging_directory: self.staging_dir.display().to_string(),
            csv_files: files.len(),
            total_detections,
            files,
        })
    }
}

/// Build the staged file name for a source.
pub fn staged_file_name(
    source_type: SourceType,
    source_name: &str,
    created_at: &chrono::NaiveDateTime,
) -> String {
    let stem = Path::new(source_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| source_name.to_string());

    format!(
        "{}{}_{}.csv",
        source_type.prefix(),
        stem,
        created_at.format(FILE_TIMESTAMP_FORMAT)
    )
}

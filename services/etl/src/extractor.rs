//! Staging area scanning and extraction.

use crate::error::{EtlError, Result};
use crate::table::{Row, TabularBatch};
use chrono::{DateTime, NaiveDateTime, Utc};
use detection_classifier::{DetectionRecord, SourceType, FILE_TIMESTAMP_FORMAT};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Column tagging each row with the staged file it came from.
pub const SOURCE_FILE_COLUMN: &str = "_source_file";
/// Column tagging each row with the extraction time.
pub const EXTRACTED_AT_COLUMN: &str = "_extracted_at";

/// Width of the `YYYYMMDD_HHMMSS` segment in staged file names.
const NAME_TIMESTAMP_LEN: usize = 15;

/// One staged CSV file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedFile {
    pub name: String,
    pub path: PathBuf,
    /// `None` for files matching neither prefix
    pub source_type: Option<SourceType>,
    /// Creation time encoded in the name
    pub created_at: Option<NaiveDateTime>,
    /// Number of data rows
    pub row_count: usize,
}

/// Staged files grouped by source type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagingScan {
    pub video: Vec<StagedFile>,
    pub image: Vec<StagedFile>,
    pub unknown: Vec<StagedFile>,
}

impl StagingScan {
    pub fn files(&self, source_type: SourceType) -> &[StagedFile] {
        match source_type {
            SourceType::Video => &self.video,
            SourceType::Image => &self.image,
        }
    }

    /// Files of `source_type` not yet in `processed`, in scan order.
    pub fn pending(&self, source_type: SourceType, processed: &HashSet<String>) -> Vec<StagedFile> {
        self.files(source_type)
            .iter()
            .filter(|f| !processed.contains(&f.name))
            .cloned()
            .collect()
    }

    pub fn total(&self) -> usize {
        self.video.len() + self.image.len() + self.unknown.len()
    }
}

/// Rows read from a set of staged files.
#[derive(Debug, Clone, Default)]
pub struct ExtractedBatch {
    pub batch: TabularBatch,
    /// Files read successfully, in read order
    pub files_read: Vec<String>,
    /// Files skipped because they could not be read
    pub files_failed: Vec<String>,
}

/// Overview of the staging area.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StagingReport {
    pub staging_directory: String,
    pub video_files: usize,
    pub image_files: usize,
    pub unknown_files: usize,
    pub total_files: usize,
    pub video_rows: usize,
    pub image_rows: usize,
    pub total_size_bytes: u64,
}

/// Size and timing details of one staged file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMetadata {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub row_count: usize,
    pub created_at: Option<NaiveDateTime>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Reads staged detection files.
#[derive(Debug, Clone)]
pub struct DataExtractor {
    staging_dir: PathBuf,
}

impl DataExtractor {
    /// Fails when the staging directory does not exist.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Result<Self> {
        let staging_dir = staging_dir.into();
        if !staging_dir.is_dir() {
            return Err(EtlError::StagingDirMissing(staging_dir));
        }
        info!(staging_dir = %staging_dir.display(), "Data extractor initialized");
        Ok(Self { staging_dir })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// List every staged CSV file, classified by name prefix.
    ///
    /// Files are listed in file name order.
    #[instrument(skip(self))]
    pub fn scan_staging(&self) -> Result<StagingScan> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.staging_dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("csv") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut scan = StagingScan::default();
        for path in paths {
            let file = self.staged_file(path);
            match file.source_type {
                Some(SourceType::Video) => scan.video.push(file),
                Some(SourceType::Image) => scan.image.push(file),
                None => scan.unknown.push(file),
            }
        }

        if !scan.unknown.is_empty() {
            debug!(count = scan.unknown.len(), "Ignoring staged files with unknown prefix");
        }
        info!(
            video = scan.video.len(),
            image = scan.image.len(),
            unknown = scan.unknown.len(),
            "Scanned staging directory"
        );
        Ok(scan)
    }

    fn staged_file(&self, path: PathBuf) -> StagedFile {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let row_count = count_rows(&path).unwrap_or_else(|e| {
            warn!(file = %name, error = %e, "Failed to count rows");
            0
        });

        StagedFile {
            source_type: SourceType::from_file_name(&name),
            created_at: parse_name_timestamp(&name),
            row_count,
            name,
            path,
        }
    }

    /// Pending files of one source type.
    pub fn pending_files(&self, source_type: SourceType, processed: &HashSet<String>) -> Result<Vec<StagedFile>> {
        Ok(self.scan_staging()?.pending(source_type, processed))
    }

    /// Read and concatenate files into one batch.
    ///
    /// Each row is tagged with its file name and the extraction time. A file
    /// that cannot be read is logged and skipped; a row that does not form a
    /// valid detection is logged and dropped.
    #[instrument(skip(self, files), fields(files = files.len()))]
    pub fn extract(&self, files: &[StagedFile]) -> ExtractedBatch {
        let extracted_at = Utc::now().to_rfc3339();
        let mut result = ExtractedBatch::default();

        for file in files {
            match read_records(&file.path) {
                Ok(records) => {
                    debug!(file = %file.name, rows = records.len(), "Extracted file");
                    for record in records {
                        let mut row = record_to_row(&record);
                        row.insert(EXTRACTED_AT_COLUMN.to_string(), Value::String(extracted_at.clone()));
                        row.insert(SOURCE_FILE_COLUMN.to_string(), Value::String(file.name.clone()));
                        result.batch.push_row(row);
                    }
                    result.files_read.push(file.name.clone());
                }
                Err(e) => {
                    warn!(file = %file.name, error = %e, "Failed to extract file, skipping");
                    metrics::counter!("etl.files.failed").increment(1);
                    result.files_failed.push(file.name.clone());
                }
            }
        }

        info!(
            rows = result.batch.len(),
            files_read = result.files_read.len(),
            files_failed = result.files_failed.len(),
            "Extraction complete"
        );
        result
    }

    /// Extract every file whose name timestamp lies in `[start, end]`.
    pub fn extract_by_time_window(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        source_type: Option<SourceType>,
    ) -> Result<ExtractedBatch> {
        let scan = self.scan_staging()?;
        let candidates: Vec<StagedFile> = match source_type {
            Some(t) => scan.files(t).to_vec(),
            None => scan.video.into_iter().chain(scan.image).collect(),
        };

        let selected: Vec<StagedFile> = candidates
            .into_iter()
            .filter(|f| matches!(f.created_at, Some(ts) if ts >= start && ts <= end))
            .collect();

        info!(%start, %end, files = selected.len(), "Selected files in time window");
        Ok(self.extract(&selected))
    }

    pub fn staging_summary(&self) -> Result<StagingReport> {
        let scan = self.scan_staging()?;

        let mut total_size_bytes = 0;
        for file in scan.video.iter().chain(&scan.image).chain(&scan.unknown) {
            total_size_bytes += fs::metadata(&file.path).map(|m| m.len()).unwrap_or(0);
        }

        Ok(StagingReport {
            staging_directory: self.staging_dir.display().to_string(),
            video_files: scan.video.len(),
            image_files: scan.image.len(),
            unknown_files: scan.unknown.len(),
            total_files: scan.total(),
            video_rows: scan.video.iter().map(|f| f.row_count).sum(),
            image_rows: scan.image.iter().map(|f| f.row_count).sum(),
            total_size_bytes,
        })
    }

    pub fn file_metadata(&self, path: &Path) -> Result<FileMetadata> {
        let meta = fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(FileMetadata {
            created_at: parse_name_timestamp(&name),
            row_count: count_rows(path)?,
            size_bytes: meta.len(),
            modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            path: path.to_path_buf(),
            name,
        })
    }
}

/// Parse the first `YYYYMMDD_HHMMSS` segment of a file name.
pub fn parse_name_timestamp(name: &str) -> Option<NaiveDateTime> {
    let bytes = name.as_bytes();
    if bytes.len() < NAME_TIMESTAMP_LEN {
        return None;
    }

    (0..=bytes.len() - NAME_TIMESTAMP_LEN).find_map(|start| {
        let window = &bytes[start..start + NAME_TIMESTAMP_LEN];
        let shaped = window.iter().enumerate().all(|(i, b)| {
            if i == 8 {
                *b == b'_'
            } else {
                b.is_ascii_digit()
            }
        });
        if !shaped {
            return None;
        }
        // Window is pure ASCII so the slice is valid UTF-8.
        std::str::from_utf8(window)
            .ok()
            .and_then(|s| NaiveDateTime::parse_from_str(s, FILE_TIMESTAMP_FORMAT).ok())
    })
}

fn count_rows(path: &Path) -> Result<usize> {
    let mut reader = csv::Reader::from_path(path)?;
    Ok(reader.records().count())
}

fn read_records(path: &Path) -> Result<Vec<DetectionRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    reader.headers()?;

    let mut records = Vec::new();
    for (line, result) in reader.deserialize::<DetectionRecord>().enumerate() {
        match result {
            Ok(record) => records.push(record),
            Err(e) => warn!(file = %path.display(), row = line + 1, error = %e, "Skipping invalid row"),
        }
    }
    Ok(records)
}

fn record_to_row(record: &DetectionRecord) -> Row {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => map,
        _ => Row::new(),
    }
}

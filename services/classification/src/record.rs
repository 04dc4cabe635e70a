//! Detection record data model shared by the detection stage and the ETL.
//!
//! Field names match the staged CSV column names one to one, so a record
//! round-trips through a staged file without any renaming.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of source a detection was produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Frame sampled from a video file
    Video,
    /// Single still image
    Image,
}

impl SourceType {
    pub const ALL: [SourceType; 2] = [SourceType::Video, SourceType::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Video => "video",
            SourceType::Image => "image",
        }
    }

    /// Staged file name prefix for this source type.
    pub fn prefix(&self) -> &'static str {
        match self {
            SourceType::Video => "video_",
            SourceType::Image => "image_",
        }
    }

    /// Classify a staged file name by its prefix.
    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| name.starts_with(t.prefix()))
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "video" => Ok(SourceType::Video),
            "image" => Ok(SourceType::Image),
            other => Err(format!("unknown source type: {}", other)),
        }
    }
}

/// One detected object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Content-derived id, see [`generate_detection_id`]
    pub detection_id: String,
    pub source_type: SourceType,
    /// Path of the video or image the detection came from
    pub source_file: String,
    /// File name of the source, when known
    #[serde(default)]
    pub filename: Option<String>,
    /// ISO-8601 timestamp of the detection run
    pub timestamp: String,
    /// Frame number within a video (absent for images)
    #[serde(default)]
    pub frame_number: Option<i64>,
    /// Seconds from the start of the video
    #[serde(default)]
    pub frame_timestamp: Option<f64>,

    pub class_id: i64,
    pub class_name: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,

    // Absolute bounding box
    pub bbox_x1: f64,
    pub bbox_y1: f64,
    pub bbox_x2: f64,
    pub bbox_y2: f64,
    pub bbox_width: f64,
    pub bbox_height: f64,
    pub bbox_area: f64,
    pub center_x: f64,
    pub center_y: f64,

    // Bounding box normalized to 0-1
    pub normalized_x1: f64,
    pub normalized_y1: f64,
    pub normalized_x2: f64,
    pub normalized_y2: f64,

    pub aspect_ratio: f64,
    /// Box area over image area
    pub relative_area: f64,

    pub image_width: i64,
    pub image_height: i64,
    /// Index of the detection within its frame
    pub detection_index: i64,
}

/// Derive the deterministic id of a detection.
///
/// Identical inputs always produce the same 32 character hex digest; the
/// loader's deduplication relies on this, so the input layout
/// `source:frame:timestamp:index` must never change. A missing frame number
/// is rendered as `0`.
pub fn generate_detection_id(
    source: &str,
    frame_number: Option<i64>,
    timestamp: &str,
    detection_index: i64,
) -> String {
    let key = format!(
        "{}:{}:{}:{}",
        source,
        frame_number.unwrap_or(0),
        timestamp,
        detection_index
    );
    format!("{:x}", Md5::digest(key.as_bytes()))
}

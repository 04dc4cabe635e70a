//! Detection Classifier
//!
//! Detection stage of the detections platform. Video frames and still images
//! are run through an object detection model, every detected box is enriched
//! into a [`DetectionRecord`] with a deterministic id, and the records are
//! staged as CSV files for the ETL to pick up.
//!
//! ## Architecture
//!
//! ```text
//! FrameSource ──▶ VideoSampler ──▶ ObjectDetector ──▶ StagingWriter ──▶ staging/*.csv
//!                                        ▲
//! Image frame ───────────────────────────┘
//! ```
//!
//! The model ([`ObjectModel`]) and frame decoding ([`FrameSource`]) are
//! supplied by the caller.

pub mod detector;
pub mod record;
pub mod sampling;
pub mod staging_writer;

pub use detector::{extract_attributes, Frame, ObjectDetector, ObjectModel, RawDetection, SourceInfo};
pub use record::{generate_detection_id, DetectionRecord, SourceType};
pub use sampling::{classify_image, classify_video, FrameSource, StreamInfo, VideoSampler};
pub use staging_writer::{staged_file_name, StagingSummary, StagingWriter, FILE_TIMESTAMP_FORMAT};

use thiserror::Error;

/// Errors that can occur in the detection stage.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Model inference failed: {0}")]
    Model(String),

    #[error("Frame decoding failed: {0}")]
    Decode(String),
}

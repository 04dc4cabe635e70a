//! Frame sampling for video sources and per-source classification drivers.
//!
//! Decoding is external: a [`FrameSource`] hands over decoded frames in
//! order. This module decides which frames are run through the detector and
//! stamps them with the source metadata that detection ids are derived from.

use crate::detector::{round_to, Frame, ObjectDetector, ObjectModel, SourceInfo};
use crate::record::{DetectionRecord, SourceType};
use crate::staging_writer::StagingWriter;
use crate::ClassificationError;
use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Stream metadata reported by a frame source.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub fps: f64,
    pub total_frames: u64,
    pub width: u32,
    pub height: u32,
}

/// Ordered source of decoded video frames.
pub trait FrameSource {
    fn info(&self) -> StreamInfo;

    /// Next decoded frame, `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>, ClassificationError>;
}

/// Frame sampling settings.
#[derive(Debug, Clone)]
pub struct VideoSampler {
    /// Process 1 of every N frames (1 = every frame)
    pub frame_skip: u64,
    /// Stop after this many processed frames
    pub max_frames: Option<u64>,
}

impl Default for VideoSampler {
    fn default() -> Self {
        Self {
            frame_skip: 1,
            max_frames: None,
        }
    }
}

impl VideoSampler {
    pub fn new(frame_skip: u64, max_frames: Option<u64>) -> Self {
        Self {
            frame_skip: frame_skip.max(1),
            max_frames,
        }
    }

    /// Whether the frame with this sequence number is sampled.
    pub fn is_sampled(&self, frame_number: u64) -> bool {
        frame_number % self.frame_skip == 0
    }

    /// Number of frames that will be processed for a stream.
    pub fn expected_frames(&self, total_frames: u64) -> u64 {
        let sampled = total_frames / self.frame_skip;
        match self.max_frames {
            Some(max) => sampled.min(max),
            None => sampled,
        }
    }

    /// Run detection over a video stream.
    ///
    /// Every sampled frame shares `run_timestamp`, so re-running detection
    /// with the same timestamp reproduces the same detection ids.
    pub fn sample<S, M>(
        &self,
        source: &mut S,
        detector: &ObjectDetector<M>,
        video_path: &Path,
        run_timestamp: &str,
    ) -> Result<Vec<DetectionRecord>, ClassificationError>
    where
        S: FrameSource,
        M: ObjectModel,
    {
        let info = source.info();
        let filename = file_name(video_path);

        info!(
            video = %filename,
            width = info.width,
            height = info.height,
            fps = info.fps,
            total_frames = info.total_frames,
            frame_skip = self.frame_skip,
            "Processing video"
        );

        let mut detections = Vec::new();
        let mut frame_number: u64 = 0;
        let mut processed: u64 = 0;

        while let Some(frame) = source.next_frame()? {
            if self.is_sampled(frame_number) {
                let frame_timestamp = if info.fps > 0.0 {
                    round_to(frame_number as f64 / info.fps, 3)
                } else {
                    0.0
                };

                let source_info = SourceInfo {
                    source_type: SourceType::Video,
                    source: video_path.display().to_string(),
                    filename: filename.clone(),
                    timestamp: run_timestamp.to_string(),
                    frame_number: Some(frame_number as i64),
                    frame_timestamp: Some(frame_timestamp),
                };

                detections.extend(detector.detect(&frame, &source_info)?);
                processed += 1;

                if let Some(max) = self.max_frames {
                    if processed >= max {
                        info!(max_frames = max, "Reached frame limit");
                        break;
                    }
                }
            }
            frame_number += 1;
        }

        info!(
            video = %filename,
            processed_frames = processed,
            total_frames = info.total_frames,
            detections = detections.len(),
            "Video processed"
        );

        Ok(detections)
    }
}

/// Detect objects in a whole video and stage the result.
///
/// Returns the staged file path, or `None` when nothing was detected.
pub fn classify_video<S, M>(
    source: &mut S,
    video_path: &Path,
    detector: &ObjectDetector<M>,
    sampler: &VideoSampler,
    writer: &mut StagingWriter,
) -> Result<Option<PathBuf>, ClassificationError>
where
    S: FrameSource,
    M: ObjectModel,
{
    let run_timestamp = Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
    let detections = sampler.sample(source, detector, video_path, &run_timestamp)?;
    writer.write_video_detections(&file_name(video_path), &detections)
}

/// Detect objects in a single image and stage the result.
pub fn classify_image<M: ObjectModel>(
    frame: &Frame,
    image_path: &Path,
    detector: &ObjectDetector<M>,
    writer: &mut StagingWriter,
) -> Result<Option<PathBuf>, ClassificationError> {
    let filename = file_name(image_path);
    let source_info = SourceInfo {
        source_type: SourceType::Image,
        source: image_path.display().to_string(),
        filename: filename.clone(),
        timestamp: Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        frame_number: None,
        frame_timestamp: None,
    };

    let detections = detector.detect(frame, &source_info)?;
    if detections.is_empty() {
        warn!(image = %filename, "No detections for image");
    }
    writer.write_image_detections(&filename, &detections)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

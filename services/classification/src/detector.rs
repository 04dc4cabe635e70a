//! Object detection contract and attribute extraction.
//!
//! The model itself is a black box behind [`ObjectModel`]. This module turns
//! its raw boxes into fully described [`DetectionRecord`]s.

use crate::record::{generate_detection_id, DetectionRecord, SourceType};
use crate::ClassificationError;
use bytes::Bytes;
use tracing::debug;

/// A decoded frame ready for inference.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Decoded pixel data, layout owned by the model
    pub data: Bytes,
}

/// Where a frame came from.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub source_type: SourceType,
    /// Full path of the video or image
    pub source: String,
    /// File name of the video or image
    pub filename: String,
    /// ISO-8601 timestamp of the detection run
    pub timestamp: String,
    /// Frame sequence number (videos only)
    pub frame_number: Option<i64>,
    /// Seconds from the start of the video (videos only)
    pub frame_timestamp: Option<f64>,
}

/// A single box as returned by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_id: i64,
    pub class_name: String,
    pub confidence: f64,
    /// Bounding box [x1, y1, x2, y2] in pixels
    pub bbox: [f64; 4],
}

/// Black-box detection model.
pub trait ObjectModel: Send + Sync {
    fn predict(&self, frame: &Frame) -> Result<Vec<RawDetection>, ClassificationError>;
}

/// Detector that enriches raw model output into detection records.
pub struct ObjectDetector<M> {
    model: M,
    confidence: f64,
}

impl<M: ObjectModel> ObjectDetector<M> {
    pub fn new(model: M, confidence: f64) -> Self {
        Self { model, confidence }
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Run detection on a frame.
    ///
    /// Boxes under the confidence threshold are dropped before enrichment;
    /// the detection index used for the id is the position among the boxes
    /// the model returned, so it is stable for a given model output.
    pub fn detect(
        &self,
        frame: &Frame,
        source: &SourceInfo,
    ) -> Result<Vec<DetectionRecord>, ClassificationError> {
        let raw = self.model.predict(frame)?;

        let detections: Vec<DetectionRecord> = raw
            .iter()
            .enumerate()
            .filter(|(_, d)| d.confidence >= self.confidence)
            .map(|(idx, d)| extract_attributes(d, frame.width, frame.height, source, idx as i64))
            .collect();

        debug!(
            source = %source.source,
            frame_number = ?source.frame_number,
            count = detections.len(),
            "Detected objects"
        );

        Ok(detections)
    }
}

/// Build a full detection record from a raw box.
pub fn extract_attributes(
    detection: &RawDetection,
    image_width: u32,
    image_height: u32,
    source: &SourceInfo,
    detection_index: i64,
) -> DetectionRecord {
    let [x1, y1, x2, y2] = detection.bbox;
    let width = x2 - x1;
    let height = y2 - y1;
    let area = width * height;

    let img_w = image_width as f64;
    let img_h = image_height as f64;

    let aspect_ratio = if height > 0.0 { width / height } else { 0.0 };
    let ratio = |v: f64, total: f64| if total > 0.0 { v / total } else { 0.0 };

    DetectionRecord {
        detection_id: generate_detection_id(
            &source.source,
            source.frame_number,
            &source.timestamp,
            detection_index,
        ),
        source_type: source.source_type,
        source_file: source.source.clone(),
        filename: Some(source.filename.clone()),
        timestamp: source.timestamp.clone(),
        frame_number: source.frame_number,
        frame_timestamp: source.frame_timestamp,
        class_id: detection.class_id,
        class_name: detection.class_name.clone(),
        confidence: round_to(detection.confidence, 4),
        bbox_x1: round_to(x1, 2),
        bbox_y1: round_to(y1, 2),
        bbox_x2: round_to(x2, 2),
        bbox_y2: round_to(y2, 2),
        bbox_width: round_to(width, 2),
        bbox_height: round_to(height, 2),
        bbox_area: round_to(area, 2),
        center_x: round_to((x1 + x2) / 2.0, 2),
        center_y: round_to((y1 + y2) / 2.0, 2),
        normalized_x1: round_to(ratio(x1, img_w), 4),
        normalized_y1: round_to(ratio(y1, img_h), 4),
        normalized_x2: round_to(ratio(x2, img_w), 4),
        normalized_y2: round_to(ratio(y2, img_h), 4),
        aspect_ratio: round_to(aspect_ratio, 4),
        relative_area: round_to(ratio(area, img_w * img_h), 6),
        image_width: image_width as i64,
        image_height: image_height as i64,
        detection_index,
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct FixedModel(pub Vec<RawDetection>);

    impl ObjectModel for FixedModel {
        fn predict(&self, _frame: &Frame) -> Result<Vec<RawDetection>, ClassificationError> {
            Ok(self.0.clone())
        }
    }

    struct FailingModel;

    impl ObjectModel for FailingModel {
        fn predict(&self, _frame: &Frame) -> Result<Vec<RawDetection>, ClassificationError> {
            Err(ClassificationError::Model("inference backend down".to_string()))
        }
    }

    pub(crate) fn raw(class_name: &str, confidence: f64, bbox: [f64; 4]) -> RawDetection {
        RawDetection {
            class_id: 0,
            class_name: class_name.to_string(),
            confidence,
            bbox,
        }
    }

    pub(crate) fn frame() -> Frame {
        Frame {
            width: 640,
            height: 480,
            data: Bytes::new(),
        }
    }

    fn image_source() -> SourceInfo {
        SourceInfo {
            source_type: SourceType::Image,
            source: "data/images/test.jpg".to_string(),
            filename: "test.jpg".to_string(),
            timestamp: "2024-01-01T00:00:00".to_string(),
            frame_number: None,
            frame_timestamp: None,
        }
    }

    #[test]
    fn test_extract_attributes_geometry() {
        let record = extract_attributes(
            &raw("person", 0.95, [10.0, 20.0, 50.0, 80.0]),
            640,
            480,
            &image_source(),
            0,
        );

        assert_eq!(record.class_name, "person");
        assert_eq!(record.bbox_width, 40.0);
        assert_eq!(record.bbox_height, 60.0);
        assert_eq!(record.bbox_area, 2400.0);
        assert_eq!(record.center_x, 30.0);
        assert_eq!(record.center_y, 50.0);
        assert_eq!(record.normalized_x1, 0.0156);
        assert_eq!(record.normalized_y2, 0.1667);
        assert_eq!(record.aspect_ratio, 0.6667);
        assert_eq!(record.relative_area, 0.007813);
        assert_eq!(record.image_width, 640);
        assert_eq!(record.detection_index, 0);
        assert_eq!(record.detection_id.len(), 32);
    }

    #[test]
    fn test_zero_height_box_has_zero_aspect_ratio() {
        let record = extract_attributes(
            &raw("line", 0.5, [10.0, 20.0, 50.0, 20.0]),
            640,
            480,
            &image_source(),
            0,
        );
        assert_eq!(record.aspect_ratio, 0.0);
    }

    #[test]
    fn test_detect_filters_low_confidence_and_keeps_model_index() {
        let detector = ObjectDetector::new(
            FixedModel(vec![
                raw("person", 0.1, [0.0, 0.0, 10.0, 10.0]),
                raw("car", 0.9, [0.0, 0.0, 10.0, 10.0]),
            ]),
            0.25,
        );

        let records = detector.detect(&frame(), &image_source()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].class_name, "car");
        assert_eq!(records[0].detection_index, 1);
    }

    #[test]
    fn test_detect_ids_are_unique_per_index() {
        let detector = ObjectDetector::new(
            FixedModel(vec![
                raw("person", 0.9, [0.0, 0.0, 10.0, 10.0]),
                raw("person", 0.9, [0.0, 0.0, 10.0, 10.0]),
            ]),
            0.25,
        );

        let records = detector.detect(&frame(), &image_source()).unwrap();
        assert_ne!(records[0].detection_id, records[1].detection_id);
    }

    #[test]
    fn test_detect_propagates_model_error() {
        let detector = ObjectDetector::new(FailingModel, 0.25);
        let result = detector.detect(&frame(), &image_source());
        assert!(matches!(result, Err(ClassificationError::Model(_))));
    }
}

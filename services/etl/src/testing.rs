//! Fixtures shared by the unit tests of this crate.

use detection_classifier::{extract_attributes, DetectionRecord, RawDetection, SourceInfo, SourceType};
use std::path::{Path, PathBuf};

/// `count` detections from one frame of `source`, with ids derived the usual way.
pub(crate) fn sample_records(source_type: SourceType, source: &str, count: usize) -> Vec<DetectionRecord> {
    let info = SourceInfo {
        source_type,
        source: source.to_string(),
        filename: source.to_string(),
        timestamp: "2024-01-01T10:00:00".to_string(),
        frame_number: match source_type {
            SourceType::Video => Some(30),
            SourceType::Image => None,
        },
        frame_timestamp: match source_type {
            SourceType::Video => Some(1.0),
            SourceType::Image => None,
        },
    };

    (0..count)
        .map(|i| {
            let offset = (i % 50) as f64 * 10.0;
            let raw = RawDetection {
                class_id: (i % 3) as i64,
                class_name: ["person", "car", "dog"][i % 3].to_string(),
                confidence: 0.9,
                bbox: [offset, offset, offset + 64.0, offset + 48.0],
            };
            extract_attributes(&raw, 640, 480, &info, i as i64)
        })
        .collect()
}

/// Write records as a staged CSV file named `name` inside `dir`.
pub(crate) fn write_staged(dir: &Path, name: &str, records: &[DetectionRecord]) -> PathBuf {
    let path = dir.join(name);
    let mut writer = csv::Writer::from_path(&path).unwrap();
    for record in records {
        writer.serialize(record).unwrap();
    }
    writer.flush().unwrap();
    path
}

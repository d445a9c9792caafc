//! Persisting collected results: the raw dump and the detection table.

use crate::detection::{ClassLabels, ImageDetections, ImageInfo};
use crate::GatherError;
use itertools::Itertools;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const OUTPUT_EXTENSION: &str = "bin";

pub const CSV_HEADER: [&str; 7] = ["ImageID", "LabelName", "Score", "XMin", "YMin", "XMax", "YMax"];

/// Reject an output path that would not hold a results dump.
pub fn validate_output_path(path: &Path) -> Result<(), GatherError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext == OUTPUT_EXTENSION => Ok(()),
        _ => Err(GatherError::Config(format!(
            "output file must end in .{}: {}",
            OUTPUT_EXTENSION,
            path.display()
        ))),
    }
}

pub fn csv_path_for(out: &Path) -> PathBuf {
    out.with_extension("csv")
}

pub fn dump_results<R: Serialize>(path: &Path, outputs: &[R]) -> Result<(), GatherError> {
    validate_output_path(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serde::encode_into_std_write(outputs, &mut writer, bincode::config::standard())?;
    writer.flush()?;
    Ok(())
}

pub fn load_results<R: DeserializeOwned>(path: &Path) -> Result<Vec<R>, GatherError> {
    let mut reader = BufReader::new(File::open(path)?);
    Ok(bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())?)
}

/// One box of the detection table, coordinates relative to image size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRow {
    pub image_id: String,
    pub label_name: String,
    pub score: f32,
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

/// Flatten collected detections into rows: dataset order, then class order,
/// then box order.
pub fn detection_rows(
    outputs: &[ImageDetections],
    infos: &[ImageInfo],
    labels: &ClassLabels,
) -> Result<Vec<DetectionRow>, GatherError> {
    if outputs.len() != infos.len() {
        return Err(GatherError::Config(format!(
            "{} results for {} images",
            outputs.len(),
            infos.len()
        )));
    }

    let mut rows = Vec::new();
    for (detections, info) in outputs.iter().zip(infos) {
        if detections.num_classes() != labels.len() {
            return Err(GatherError::Config(format!(
                "{} has detections for {} classes but {} labels are configured",
                info.filename,
                detections.num_classes(),
                labels.len()
            )));
        }
        if info.width == 0 || info.height == 0 {
            return Err(GatherError::Config(format!(
                "{} has zero width or height",
                info.filename
            )));
        }
        let w = info.width as f32;
        let h = info.height as f32;
        for (label, boxes) in labels.iter().zip(&detections.per_class) {
            rows.extend(boxes.iter().map(|b| DetectionRow {
                image_id: info.image_id().to_string(),
                label_name: label.to_string(),
                score: b.score,
                x_min: b.x_min / w,
                y_min: b.y_min / h,
                x_max: b.x_max / w,
                y_max: b.y_max / h,
            }));
        }
    }
    Ok(rows)
}

/// Order rows by descending score within each image, keeping image order.
pub fn rank_rows(rows: &mut [DetectionRow]) {
    for group in rows.chunk_by_mut(|a, b| a.image_id == b.image_id) {
        group.sort_by(|a, b| b.score.total_cmp(&a.score));
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn write_csv(path: &Path, rows: &[DetectionRow]) -> Result<(), GatherError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{}", CSV_HEADER.iter().join(","))?;
    for row in rows {
        let fields = [
            csv_field(&row.image_id),
            csv_field(&row.label_name),
            row.score.to_string(),
            row.x_min.to_string(),
            row.y_min.to_string(),
            row.x_max.to_string(),
            row.y_max.to_string(),
        ];
        writeln!(writer, "{}", fields.iter().join(","))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use std::fs;

    fn info(name: &str, width: u32, height: u32) -> ImageInfo {
        ImageInfo {
            filename: name.to_string(),
            width,
            height,
        }
    }

    fn labels() -> ClassLabels {
        ClassLabels::new(vec!["/m/cat".to_string(), "/m/dog".to_string()])
    }

    #[test]
    fn test_output_path_must_be_bin() {
        assert!(validate_output_path(Path::new("out/results.bin")).is_ok());
        assert!(matches!(
            validate_output_path(Path::new("out/results.pkl")),
            Err(GatherError::Config(_))
        ));
        assert!(validate_output_path(Path::new("results")).is_err());
        assert_eq!(csv_path_for(Path::new("a/r.bin")), PathBuf::from("a/r.csv"));
    }

    #[test]
    fn test_rows_are_normalised_and_ordered() {
        let outputs = vec![
            ImageDetections {
                per_class: vec![
                    vec![BBox::from_array([10.0, 20.0, 50.0, 40.0, 0.4])],
                    vec![BBox::from_array([0.0, 0.0, 100.0, 80.0, 0.9])],
                ],
            },
            ImageDetections::empty(2),
        ];
        let infos = vec![info("img1.jpg", 100, 80), info("img2.jpg", 10, 10)];
        let rows = detection_rows(&outputs, &infos, &labels()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].label_name, "/m/cat");
        assert_eq!(rows[0].image_id, "img1");
        assert_eq!(rows[0].x_min, 0.1);
        assert_eq!(rows[0].y_min, 0.25);
        assert_eq!(rows[0].x_max, 0.5);
        assert_eq!(rows[0].y_max, 0.5);
        assert_eq!(rows[1].label_name, "/m/dog");
        assert_eq!(rows[1].x_max, 1.0);
    }

    #[test]
    fn test_rank_rows_sorts_within_image() {
        let outputs = vec![
            ImageDetections {
                per_class: vec![
                    vec![BBox::from_array([0.0, 0.0, 1.0, 1.0, 0.2])],
                    vec![BBox::from_array([0.0, 0.0, 1.0, 1.0, 0.7])],
                ],
            },
            ImageDetections {
                per_class: vec![vec![BBox::from_array([0.0, 0.0, 1.0, 1.0, 0.99])], vec![]],
            },
        ];
        let infos = vec![info("a.jpg", 1, 1), info("b.jpg", 1, 1)];
        let mut rows = detection_rows(&outputs, &infos, &labels()).unwrap();
        rank_rows(&mut rows);
        let order: Vec<(&str, f32)> = rows.iter().map(|r| (r.image_id.as_str(), r.score)).collect();
        assert_eq!(order, vec![("a", 0.7), ("a", 0.2), ("b", 0.99)]);
    }

    #[test]
    fn test_label_count_mismatch_is_rejected() {
        let outputs = vec![ImageDetections::empty(3)];
        let infos = vec![info("a.jpg", 1, 1)];
        assert!(detection_rows(&outputs, &infos, &labels()).is_err());
    }

    #[test]
    fn test_csv_and_dump_written() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("results.bin");
        let outputs = vec![ImageDetections {
            per_class: vec![vec![BBox::from_array([0.0, 0.0, 2.0, 2.0, 0.5])], vec![]],
        }];
        dump_results(&out, &outputs).unwrap();
        let loaded: Vec<ImageDetections> = load_results(&out).unwrap();
        assert_eq!(loaded, outputs);

        let rows = detection_rows(&outputs, &[info("x,y.png", 4, 4)], &labels()).unwrap();
        let csv = csv_path_for(&out);
        write_csv(&csv, &rows).unwrap();
        let text = fs::read_to_string(&csv).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ImageID,LabelName,Score,XMin,YMin,XMax,YMax");
        assert_eq!(lines[1], "\"x,y\",/m/cat,0.5,0,0,0.5,0.5");
    }
}

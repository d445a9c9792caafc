//! Detection results, image metadata and the compute step that produces them.
//!
//! The model itself lives outside this crate. [`Detector`] is the seam; the
//! bundled [`ManifestDetector`] replays detections recorded in a JSON manifest.

use crate::GatherError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Axis-aligned box in pixel coordinates with its confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
    pub score: f32,
}

impl BBox {
    /// `[x_min, y_min, x_max, y_max, score]`
    pub fn from_array(values: [f32; 5]) -> Self {
        Self {
            x_min: values[0],
            y_min: values[1],
            x_max: values[2],
            y_max: values[3],
            score: values[4],
        }
    }
}

/// Boxes for one image, indexed by class.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageDetections {
    pub per_class: Vec<Vec<BBox>>,
}

impl ImageDetections {
    pub fn empty(num_classes: usize) -> Self {
        Self {
            per_class: vec![Vec::new(); num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.per_class.len()
    }

    pub fn num_boxes(&self) -> usize {
        self.per_class.iter().map(Vec::len).sum()
    }

    /// Keep boxes scoring at least `threshold`, then the best `max_boxes`
    /// across all classes.
    pub fn filtered(mut self, threshold: f32, max_boxes: Option<usize>) -> Self {
        for boxes in &mut self.per_class {
            boxes.retain(|b| b.score >= threshold);
        }
        if let Some(limit) = max_boxes {
            if self.num_boxes() > limit {
                let mut ranked: Vec<(usize, usize, f32)> = self
                    .per_class
                    .iter()
                    .enumerate()
                    .flat_map(|(class, boxes)| {
                        boxes.iter().enumerate().map(move |(i, b)| (class, i, b.score))
                    })
                    .collect();
                ranked.sort_by(|a, b| b.2.total_cmp(&a.2));

                let mut keep: Vec<Vec<bool>> =
                    self.per_class.iter().map(|boxes| vec![false; boxes.len()]).collect();
                for &(class, i, _) in ranked.iter().take(limit) {
                    keep[class][i] = true;
                }
                for (boxes, flags) in self.per_class.iter_mut().zip(keep) {
                    let mut flags = flags.into_iter();
                    boxes.retain(|_| flags.next().unwrap_or(false));
                }
            }
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub filename: String,
    pub width: u32,
    pub height: u32,
}

impl ImageInfo {
    /// File name without directories, up to the first `.`.
    pub fn image_id(&self) -> &str {
        let name = self.filename.rsplit('/').next().unwrap_or(&self.filename);
        name.split('.').next().unwrap_or(name)
    }
}

/// Class names, fixed for the life of a job and shared by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabels(Arc<[String]>);

impl ClassLabels {
    pub fn new(labels: Vec<String>) -> Self {
        Self(labels.into())
    }

    /// Labels stored with the checkpoint win over the dataset's own list.
    pub fn resolve(checkpoint: Option<Vec<String>>, dataset: Vec<String>) -> Self {
        Self::new(checkpoint.unwrap_or(dataset))
    }

    /// Read a JSON array of names, or one name per line.
    pub fn load(path: &Path) -> Result<Self, GatherError> {
        let text = fs::read_to_string(path)?;
        if text.trim_start().starts_with('[') {
            let labels: Vec<String> = serde_json::from_str(&text)?;
            return Ok(Self::new(labels));
        }
        Ok(Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn name(&self, class: usize) -> Option<&str> {
        self.0.get(class).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// The per-image compute step.
pub trait Detector {
    fn detect(&mut self, image: &ImageInfo) -> Result<ImageDetections, GatherError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(flatten)]
    pub image: ImageInfo,
    /// Per class, a list of `[x_min, y_min, x_max, y_max, score]`.
    #[serde(default)]
    pub detections: Vec<Vec<[f32; 5]>>,
}

/// Dataset description plus recorded detections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub classes: Vec<String>,
    pub images: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, GatherError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn image_infos(&self) -> Vec<ImageInfo> {
        self.images.iter().map(|entry| entry.image.clone()).collect()
    }
}

/// Detector that looks up recorded detections by file name.
#[derive(Debug, Clone)]
pub struct ManifestDetector {
    recorded: Arc<HashMap<String, ImageDetections>>,
    num_classes: usize,
    score_threshold: f32,
    max_per_image: Option<usize>,
}

impl ManifestDetector {
    pub fn new(manifest: &Manifest) -> Self {
        let recorded: HashMap<String, ImageDetections> = manifest
            .images
            .iter()
            .map(|entry| {
                let per_class = entry
                    .detections
                    .iter()
                    .map(|boxes| boxes.iter().copied().map(BBox::from_array).collect())
                    .collect();
                (entry.image.filename.clone(), ImageDetections { per_class })
            })
            .collect();
        Self {
            recorded: Arc::new(recorded),
            num_classes: manifest.classes.len(),
            score_threshold: 0.0,
            max_per_image: None,
        }
    }

    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    pub fn with_max_per_image(mut self, max: Option<usize>) -> Self {
        self.max_per_image = max;
        self
    }
}

impl Detector for ManifestDetector {
    fn detect(&mut self, image: &ImageInfo) -> Result<ImageDetections, GatherError> {
        let recorded = self.recorded.get(&image.filename).ok_or_else(|| {
            GatherError::Compute(format!("no recorded detections for {}", image.filename))
        })?;
        let mut detections = recorded.clone();
        if detections.per_class.len() < self.num_classes {
            detections.per_class.resize(self.num_classes, Vec::new());
        }
        Ok(detections.filtered(self.score_threshold, self.max_per_image))
    }
}

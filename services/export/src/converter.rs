//! Single-frame annotation conversion.
//!
//! Single-frame formats only need pixel-space shapes per image. A
//! [`FrameConverter`] turns one datarow's fragment into such shapes without
//! doing any I/O.

use crate::annotation::Fragment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConvertError {
    #[error("Object {object} has malformed {kind} data: {reason}")]
    InvalidGeometry {
        object: String,
        kind: String,
        reason: String,
    },

    #[error("Frame object {0} has no sequence-level record")]
    UnknownObject(String),

    #[error("Image has zero size ({width}x{height})")]
    ZeroDimensions { width: u32, height: u32 },
}

/// Class name to contiguous class id, growing as unknown classes appear
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassMap {
    names: Vec<String>,
    ids: HashMap<String, usize>,
}

impl ClassMap {
    pub fn from_names(names: &[String]) -> Self {
        let mut map = Self::default();
        for name in names {
            map.id_or_insert(name);
        }
        map
    }

    /// Id of `name`, appending it when not yet known
    pub fn id_or_insert(&mut self, name: &str) -> usize {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    /// Class names ordered by id
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One shape of one image in pixel space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertedRecord {
    pub class_id: usize,
    pub class_name: String,
    /// `[x_min, y_min, width, height]`
    pub bbox: [f64; 4],
    /// Flattened `x, y` polygon rings; empty for plain boxes
    pub segmentation: Vec<Vec<f64>>,
    pub area: f64,
}

impl ConvertedRecord {
    /// Normalized `[center_x, center_y, width, height]`
    pub fn normalized_box(&self, width: u32, height: u32) -> Result<[f64; 4], ConvertError> {
        if width == 0 || height == 0 {
            return Err(ConvertError::ZeroDimensions { width, height });
        }
        let (w, h) = (f64::from(width), f64::from(height));
        let [x, y, bw, bh] = self.bbox;
        Ok([(x + bw / 2.0) / w, (y + bh / 2.0) / h, bw / w, bh / h])
    }
}

/// Converts one datarow's annotation fragment into pixel-space records.
///
/// The class map is threaded through so ids stay stable across the whole
/// export; classes not yet in the map are appended.
pub trait FrameConverter: Send + Sync {
    fn convert(
        &self,
        fragment: &Fragment,
        sensor_name: &str,
        width: u32,
        height: u32,
        classes: ClassMap,
    ) -> Result<(Vec<ConvertedRecord>, ClassMap), ConvertError>;
}

/// Reads `bbox` (`[cx, cy, w, h]`) and `poly2d` (`[x0, y0, x1, y1, ...]`)
/// object data of the fragment's frame
#[derive(Debug, Clone, Copy, Default)]
pub struct BoxConverter;

impl BoxConverter {
    fn coordinates(uuid: &str, kind: &str, entry: &Value) -> Result<Vec<f64>, ConvertError> {
        let invalid = |reason: &str| ConvertError::InvalidGeometry {
            object: uuid.to_string(),
            kind: kind.to_string(),
            reason: reason.to_string(),
        };
        entry
            .get("val")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("missing val array"))?
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| invalid("non-numeric coordinate")))
            .collect()
    }

    fn from_box(uuid: &str, entry: &Value) -> Result<([f64; 4], Vec<Vec<f64>>), ConvertError> {
        match Self::coordinates(uuid, "bbox", entry)?.as_slice() {
            [cx, cy, w, h] => Ok(([cx - w / 2.0, cy - h / 2.0, *w, *h], Vec::new())),
            _ => Err(ConvertError::InvalidGeometry {
                object: uuid.to_string(),
                kind: "bbox".to_string(),
                reason: "expected 4 values".to_string(),
            }),
        }
    }

    fn from_polygon(uuid: &str, entry: &Value) -> Result<([f64; 4], Vec<Vec<f64>>), ConvertError> {
        let points = Self::coordinates(uuid, "poly2d", entry)?;
        if points.len() < 6 || points.len() % 2 != 0 {
            return Err(ConvertError::InvalidGeometry {
                object: uuid.to_string(),
                kind: "poly2d".to_string(),
                reason: "expected at least 3 x/y pairs".to_string(),
            });
        }
        let xs = points.iter().step_by(2);
        let ys = points.iter().skip(1).step_by(2);
        let (x_min, x_max) = xs.fold((f64::MAX, f64::MIN), |(lo, hi), x| (lo.min(*x), hi.max(*x)));
        let (y_min, y_max) = ys.fold((f64::MAX, f64::MIN), |(lo, hi), y| (lo.min(*y), hi.max(*y)));
        Ok(([x_min, y_min, x_max - x_min, y_max - y_min], vec![points]))
    }
}

/// Shoelace area of a flattened ring
fn polygon_area(points: &[f64]) -> f64 {
    let n = points.len() / 2;
    let twice: f64 = (0..n)
        .map(|i| {
            let j = (i + 1) % n;
            points[2 * i] * points[2 * j + 1] - points[2 * j] * points[2 * i + 1]
        })
        .sum();
    twice.abs() / 2.0
}

impl FrameConverter for BoxConverter {
    fn convert(
        &self,
        fragment: &Fragment,
        sensor_name: &str,
        _width: u32,
        _height: u32,
        mut classes: ClassMap,
    ) -> Result<(Vec<ConvertedRecord>, ClassMap), ConvertError> {
        let Some(frame) = fragment.frames.values().next() else {
            return Ok((Vec::new(), classes));
        };

        let mut records = Vec::new();
        for (uuid, object) in &frame.objects {
            let class_name = fragment
                .objects
                .get(uuid)
                .map(|record| record.kind.as_str())
                .ok_or_else(|| ConvertError::UnknownObject(uuid.clone()))?;

            for (kind, entries) in &object.object_data {
                for entry in entries {
                    let stream = entry.get("stream").and_then(Value::as_str);
                    if stream.is_some_and(|stream| stream != sensor_name) {
                        continue;
                    }
                    let (bbox, segmentation) = match kind.as_str() {
                        "bbox" => Self::from_box(uuid, entry)?,
                        "poly2d" => Self::from_polygon(uuid, entry)?,
                        _ => continue,
                    };
                    let area = segmentation
                        .first()
                        .map(|ring| polygon_area(ring))
                        .unwrap_or(bbox[2] * bbox[3]);
                    records.push(ConvertedRecord {
                        class_id: classes.id_or_insert(class_name),
                        class_name: class_name.to_string(),
                        bbox,
                        segmentation,
                        area,
                    });
                }
            }
        }
        Ok((records, classes))
    }
}

//! Typed annotation fragment schema.
//!
//! A fragment is the per-datarow annotation document: `frames` keyed by
//! zero-padded frame number, sequence-level `objects`/`contexts` whose data
//! pointers declare the frame intervals they apply to, sensor `streams`, and
//! optional run-length-encoded `tags`. Fields the exporter does not interpret
//! are carried through untouched in `extra`.

pub mod frame;
pub mod merge;
pub mod tags;

use crate::interval::FrameInterval;
use crate::model::Datarow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub use frame::{
    aggregate_frame, aggregate_sequence, rewrite_stream_uri, AggregatedFrame, AggregationError,
};
pub use merge::{collect_static, combine_static_dynamic, DynamicMap, StaticMap};
pub use tags::{decode_rle, TagError, TagReindexer};

/// Annotation source name selecting ground truth
pub const GROUND_TRUTH: &str = "groundtruth";

/// Schema version stamped on aggregated documents
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Per-type data lists of one object or context on one frame (`bbox`, `poly2d`, `binary`, ...)
pub type DataMap = BTreeMap<String, Vec<Value>>;

/// Zero-padded frame key used in `frames`
pub fn frame_key(frame: i64) -> String {
    format!("{:012}", frame)
}

/// Which annotation set of a datarow is exported
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnnotationSource {
    GroundTruth,
    /// Predictions of a named model
    Model(String),
}

impl AnnotationSource {
    pub fn from_name(name: &str) -> Self {
        if name.is_empty() || name == GROUND_TRUTH {
            AnnotationSource::GroundTruth
        } else {
            AnnotationSource::Model(name.to_string())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AnnotationSource::GroundTruth => GROUND_TRUTH,
            AnnotationSource::Model(name) => name,
        }
    }
}

/// Annotation sets attached to a datarow
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatarowItems {
    #[serde(default)]
    pub ground_truths: Option<Fragment>,
    #[serde(default)]
    pub predictions: BTreeMap<String, Fragment>,
}

impl DatarowItems {
    /// Fragment for the source, ignoring empty documents
    pub fn get(&self, source: &AnnotationSource) -> Option<&Fragment> {
        let fragment = match source {
            AnnotationSource::GroundTruth => self.ground_truths.as_ref(),
            AnnotationSource::Model(name) => self.predictions.get(name),
        };
        fragment.filter(|f| !f.is_empty())
    }
}

/// One annotation document in the platform's nested schema
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Fragment {
    #[serde(default)]
    pub frames: BTreeMap<String, Frame>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frame_intervals: Vec<FrameInterval>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub objects: BTreeMap<String, ObjectRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, ContextRecord>,
    #[serde(default)]
    pub streams: BTreeMap<String, Stream>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinate_systems: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Fragment {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
            && self.objects.is_empty()
            && self.contexts.is_empty()
            && self.streams.is_empty()
            && self.tags.is_empty()
    }

    /// Stand-in fragment for a datarow without annotations.
    ///
    /// It documents only the datarow's stream so every exported frame still
    /// appears in the aggregated document.
    pub fn placeholder(datarow: &Datarow) -> Self {
        let stream_ref = StreamRef {
            uri: datarow.url.clone(),
            original_file_name: None,
            extra: Map::new(),
        };
        let frame = Frame {
            frame_properties: FrameProperties {
                streams: BTreeMap::from([(datarow.sensor_name.clone(), stream_ref)]),
                ..FrameProperties::default()
            },
            ..Frame::default()
        };
        let stream = Stream {
            kind: datarow.kind.stream_type().to_string(),
            uri: Some(datarow.url.clone()),
            extra: Map::new(),
        };

        Self {
            frames: BTreeMap::from([(frame_key(datarow.frame_id), frame)]),
            streams: BTreeMap::from([(datarow.sensor_name.clone(), stream)]),
            ..Self::default()
        }
    }

    /// Local class vocabulary of the first tag, if any
    pub fn tag_classes(&self) -> Option<&[String]> {
        let tag = self.tags.values().next()?;
        let classes = &tag.tag_data.as_ref()?.vec.first()?.val;
        (!classes.is_empty()).then_some(classes.as_slice())
    }
}

/// Top-level document wrapper
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisionAiDocument {
    pub visionai: Fragment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub schema_version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            extra: Map::new(),
        }
    }
}

/// Annotations of a single frame
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub objects: BTreeMap<String, FrameObject>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, FrameContext>,
    #[serde(default)]
    pub frame_properties: FrameProperties,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FrameProperties {
    #[serde(default)]
    pub streams: BTreeMap<String, StreamRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-frame pointer to a sensor's media file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StreamRef {
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Sequence-level sensor description
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Stream {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Object data observed on one frame
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FrameObject {
    #[serde(default)]
    pub object_data: DataMap,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Context data observed on one frame
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FrameContext {
    #[serde(default)]
    pub context_data: DataMap,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Declares the frame intervals a named piece of element data applies to
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DataPointer {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub frame_intervals: Vec<FrameInterval>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Sequence-level object
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ObjectRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub frame_intervals: Vec<FrameInterval>,
    #[serde(default)]
    pub object_data_pointers: BTreeMap<String, DataPointer>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Sequence-level context
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ContextRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub frame_intervals: Vec<FrameInterval>,
    #[serde(default)]
    pub context_data_pointers: BTreeMap<String, DataPointer>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Tag {
    #[serde(default)]
    pub ontology_uid: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_data: Option<TagData>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TagData {
    #[serde(default)]
    pub vec: Vec<TagVector>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TagVector {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub val: Vec<String>,
}

/// Element whose data is keyed per frame and declared through data pointers.
///
/// Implemented by [`ObjectRecord`] and [`ContextRecord`], which differ only in
/// the serialized names of their fields.
pub trait PointerRecord: Clone {
    /// Per-frame counterpart of this record
    type FrameData: FrameData;

    fn data_pointers(&self) -> &BTreeMap<String, DataPointer>;

    fn with_data_pointers(self, pointers: BTreeMap<String, DataPointer>) -> Self;

    fn with_frame_intervals(self, intervals: Vec<FrameInterval>) -> Self;

    /// Records of this kind in a fragment
    fn section(fragment: &Fragment) -> &BTreeMap<String, Self>;

    /// Per-frame data of this kind in a frame
    fn frame_section(frame: &Frame) -> &BTreeMap<String, Self::FrameData>;
}

impl PointerRecord for ObjectRecord {
    type FrameData = FrameObject;

    fn data_pointers(&self) -> &BTreeMap<String, DataPointer> {
        &self.object_data_pointers
    }

    fn with_data_pointers(self, pointers: BTreeMap<String, DataPointer>) -> Self {
        Self {
            object_data_pointers: pointers,
            ..self
        }
    }

    fn with_frame_intervals(self, intervals: Vec<FrameInterval>) -> Self {
        Self {
            frame_intervals: intervals,
            ..self
        }
    }

    fn section(fragment: &Fragment) -> &BTreeMap<String, Self> {
        &fragment.objects
    }

    fn frame_section(frame: &Frame) -> &BTreeMap<String, FrameObject> {
        &frame.objects
    }
}

impl PointerRecord for ContextRecord {
    type FrameData = FrameContext;

    fn data_pointers(&self) -> &BTreeMap<String, DataPointer> {
        &self.context_data_pointers
    }

    fn with_data_pointers(self, pointers: BTreeMap<String, DataPointer>) -> Self {
        Self {
            context_data_pointers: pointers,
            ..self
        }
    }

    fn with_frame_intervals(self, intervals: Vec<FrameInterval>) -> Self {
        Self {
            frame_intervals: intervals,
            ..self
        }
    }

    fn section(fragment: &Fragment) -> &BTreeMap<String, Self> {
        &fragment.contexts
    }

    fn frame_section(frame: &Frame) -> &BTreeMap<String, FrameContext> {
        &frame.contexts
    }
}

/// Per-frame element data that can be merged across sensors
pub trait FrameData: Clone {
    fn data(&self) -> &DataMap;

    fn with_data(self, data: DataMap) -> Self;

    /// Concatenate `other`'s per-type data lists onto this one's
    fn merged_with(self, other: &Self) -> Self {
        let mut data = self.data().clone();
        for (kind, values) in other.data() {
            data.entry(kind.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
        self.with_data(data)
    }
}

impl FrameData for FrameObject {
    fn data(&self) -> &DataMap {
        &self.object_data
    }

    fn with_data(self, data: DataMap) -> Self {
        Self {
            object_data: data,
            ..self
        }
    }
}

impl FrameData for FrameContext {
    fn data(&self) -> &DataMap {
        &self.context_data
    }

    fn with_data(self, data: DataMap) -> Self {
        Self {
            context_data: data,
            ..self
        }
    }
}

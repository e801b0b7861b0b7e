//! Sequence-wide reindexing of run-length-encoded segmentation tags.
//!
//! Each datarow carries its own class vocabulary and an RLE string of
//! `<pixel_count>V<class_index>` segments joined by `#`. A sequence document
//! needs a single vocabulary, so every frame's indices are rewritten against
//! the union of all local vocabularies.

use super::{DataMap, Fragment, Frame, FrameData, FrameObject, Tag, TagData, TagVector};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use uuid::Uuid;

/// Tag type emitted for the sequence vocabulary
pub const RLE_TAG_TYPE: &str = "semantic_segmentation_RLE";

const BINARY_DATA_KEY: &str = "binary";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TagError {
    #[error("Malformed RLE segment: {0:?}")]
    MalformedSegment(String),

    #[error("Class index {index} is outside the local vocabulary of {len} classes")]
    UnknownLocalIndex { index: usize, len: usize },

    #[error("Class {0:?} is missing from the sequence vocabulary")]
    UnknownClass(String),
}

/// Sequence-global class vocabulary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagReindexer {
    classes: Vec<String>,
    index: HashMap<String, usize>,
}

impl TagReindexer {
    /// Union local vocabularies in order of first appearance.
    ///
    /// Returns `None` when no vocabulary carries a class.
    pub fn from_vocabularies<'a, I>(vocabularies: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a [String]>,
    {
        let mut classes = Vec::new();
        let mut index = HashMap::new();
        for class in vocabularies.into_iter().flatten() {
            if !index.contains_key(class) {
                index.insert(class.clone(), classes.len());
                classes.push(class.clone());
            }
        }
        (!classes.is_empty()).then_some(Self { classes, index })
    }

    /// Build the vocabulary from the first tag of every fragment
    pub fn from_fragments<'a, I>(fragments: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Fragment>,
    {
        Self::from_vocabularies(fragments.into_iter().filter_map(Fragment::tag_classes))
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Rewrite class indices of an RLE string from `local` to the global vocabulary.
    ///
    /// Separators and pixel counts are kept verbatim. Empty segments (such as
    /// the one before a leading `#`) pass through unchanged.
    pub fn reindex_rle(&self, rle: &str, local: &[String]) -> Result<String, TagError> {
        let segments = rle
            .split('#')
            .map(|segment| -> Result<String, TagError> {
                if segment.is_empty() {
                    return Ok(segment.to_string());
                }
                let (count, local_index) = parse_segment(segment)?;
                let class = local.get(local_index).ok_or(TagError::UnknownLocalIndex {
                    index: local_index,
                    len: local.len(),
                })?;
                let global = self
                    .index
                    .get(class)
                    .ok_or_else(|| TagError::UnknownClass(class.clone()))?;
                Ok(format!("{}V{}", count, global))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(segments.join("#"))
    }

    /// Rewrite every `binary` RLE value of every object in a frame
    pub fn reindex_frame(&self, frame: &Frame, local: &[String]) -> Result<Frame, TagError> {
        let objects: BTreeMap<String, FrameObject> = frame
            .objects
            .iter()
            .map(|(uuid, object)| {
                let data = self.reindex_data(object.data(), local)?;
                Ok((uuid.clone(), object.clone().with_data(data)))
            })
            .collect::<Result<_, TagError>>()?;
        Ok(Frame {
            objects,
            ..frame.clone()
        })
    }

    fn reindex_data(&self, data: &DataMap, local: &[String]) -> Result<DataMap, TagError> {
        let mut rewritten = data.clone();
        if let Some(entries) = rewritten.get_mut(BINARY_DATA_KEY) {
            for entry in entries.iter_mut() {
                if let Some(Value::String(rle)) = entry.get_mut("val") {
                    *rle = self.reindex_rle(rle, local)?;
                }
            }
        }
        Ok(rewritten)
    }

    /// Sequence-level tag under a fresh uuid carrying the global vocabulary
    pub fn sequence_tag(&self) -> (String, Tag) {
        let tag = Tag {
            ontology_uid: String::new(),
            kind: RLE_TAG_TYPE.to_string(),
            tag_data: Some(TagData {
                vec: vec![TagVector {
                    name: String::new(),
                    kind: "values".to_string(),
                    val: self.classes.clone(),
                }],
            }),
            extra: Default::default(),
        };
        (Uuid::new_v4().to_string(), tag)
    }
}

fn parse_segment(segment: &str) -> Result<(&str, usize), TagError> {
    let malformed = || TagError::MalformedSegment(segment.to_string());
    let (count, class) = segment.split_once('V').ok_or_else(malformed)?;
    count.parse::<u64>().map_err(|_| malformed())?;
    let class = class.parse::<usize>().map_err(|_| malformed())?;
    Ok((count, class))
}

/// Decode an RLE string into `(pixel_count, class_name)` runs
pub fn decode_rle<'a>(
    rle: &str,
    vocabulary: &'a [String],
) -> Result<Vec<(u64, &'a str)>, TagError> {
    rle.split('#')
        .filter(|segment| !segment.is_empty())
        .map(|segment| -> Result<(u64, &'a str), TagError> {
            let (count, index) = parse_segment(segment)?;
            let class = vocabulary.get(index).ok_or(TagError::UnknownLocalIndex {
                index,
                len: vocabulary.len(),
            })?;
            let count = count
                .parse()
                .map_err(|_| TagError::MalformedSegment(segment.to_string()))?;
            Ok((count, class.as_str()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vocab(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_vocabulary_first_appearance_order() {
        let a = vocab(&["road", "car"]);
        let b = vocab(&["sky", "car", "person"]);
        let reindexer = TagReindexer::from_vocabularies([a.as_slice(), b.as_slice()]).unwrap();
        assert_eq!(reindexer.classes(), &vocab(&["road", "car", "sky", "person"])[..]);
    }

    #[test]
    fn test_no_vocabulary_means_no_tags() {
        assert!(TagReindexer::from_vocabularies(std::iter::empty::<&[String]>()).is_none());
        assert!(TagReindexer::from_fragments([&Fragment::default()]).is_none());
    }

    #[test]
    fn test_reindex_preserves_counts() {
        let a = vocab(&["road", "car"]);
        let b = vocab(&["car", "sky"]);
        let reindexer = TagReindexer::from_vocabularies([a.as_slice(), b.as_slice()]).unwrap();

        assert_eq!(reindexer.reindex_rle("0012V0#7V1", &b).unwrap(), "0012V1#7V2");
        assert_eq!(reindexer.reindex_rle("#3V1", &a).unwrap(), "#3V1");
    }

    #[test]
    fn test_reindex_round_trip() {
        let local = vocab(&["sky", "car", "person"]);
        let other = vocab(&["road", "person"]);
        let reindexer =
            TagReindexer::from_vocabularies([other.as_slice(), local.as_slice()]).unwrap();

        let original = "10V0#5V2#7V1#1V0";
        let reindexed = reindexer.reindex_rle(original, &local).unwrap();

        assert_eq!(
            decode_rle(&reindexed, reindexer.classes()).unwrap(),
            decode_rle(original, &local).unwrap()
        );
    }

    #[test]
    fn test_reindex_rejects_bad_input() {
        let local = vocab(&["road"]);
        let reindexer = TagReindexer::from_vocabularies([local.as_slice()]).unwrap();

        assert_eq!(
            reindexer.reindex_rle("5V3", &local),
            Err(TagError::UnknownLocalIndex { index: 3, len: 1 })
        );
        assert!(matches!(
            reindexer.reindex_rle("5X0", &local),
            Err(TagError::MalformedSegment(_))
        ));
    }

    #[test]
    fn test_reindex_frame_rewrites_binary_values() {
        let local = vocab(&["car", "road"]);
        let global = vocab(&["road", "car"]);
        let reindexer = TagReindexer::from_vocabularies([global.as_slice()]).unwrap();

        let frame = Frame {
            objects: [(
                "seg".to_string(),
                FrameObject {
                    object_data: DataMap::from([(
                        "binary".to_string(),
                        vec![json!({"name": "mask", "encoding": "rle", "val": "4V0#2V1"})],
                    )]),
                    ..FrameObject::default()
                },
            )]
            .into(),
            ..Frame::default()
        };

        let rewritten = reindexer.reindex_frame(&frame, &local).unwrap();
        assert_eq!(rewritten.objects["seg"].object_data["binary"][0]["val"], json!("4V1#2V0"));
        assert_eq!(frame.objects["seg"].object_data["binary"][0]["val"], json!("4V0#2V1"));
    }

    #[test]
    fn test_sequence_tag_shape() {
        let classes = vocab(&["road"]);
        let reindexer = TagReindexer::from_vocabularies([classes.as_slice()]).unwrap();
        let (uuid, tag) = reindexer.sequence_tag();
        assert!(Uuid::parse_str(&uuid).is_ok());
        assert_eq!(
            serde_json::to_value(&tag).unwrap(),
            json!({
                "ontology_uid": "",
                "type": "semantic_segmentation_RLE",
                "tag_data": {"vec": [{"name": "", "type": "values", "val": ["road"]}]}
            })
        );
    }
}

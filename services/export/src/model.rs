//! Records returned by the curation backend.

use crate::annotation::{AnnotationSource, DatarowItems, Fragment};
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;

/// Kind of media a datarow points at
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Image,
    #[serde(rename = "pcd", alias = "point_cloud")]
    PointCloud,
    #[serde(other)]
    Other,
}

impl MediaKind {
    /// Stream type used in annotation documents
    pub fn stream_type(&self) -> &'static str {
        match self {
            MediaKind::PointCloud => "lidar",
            MediaKind::Image | MediaKind::Other => "camera",
        }
    }
}

/// One sensor capture for one frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datarow {
    pub id: i64,
    /// Frame number inside the source sequence
    #[serde(deserialize_with = "number_or_string")]
    pub frame_id: i64,
    #[serde(default)]
    pub sensor_name: String,
    /// Download URL of the media
    pub url: String,
    /// URL the media was uploaded from, used for naming
    #[serde(default)]
    pub original_url: String,
    #[serde(default)]
    pub image_width: u32,
    #[serde(default)]
    pub image_height: u32,
    #[serde(rename = "type", default)]
    pub kind: MediaKind,
    #[serde(default)]
    pub frame_datarow_id: Option<i64>,
    #[serde(default)]
    pub sequence_datarow_id: Option<i64>,
    #[serde(default)]
    pub items: DatarowItems,
    #[serde(default)]
    pub vlm_items: Option<serde_json::Value>,
}

impl Datarow {
    /// Annotation fragment for the given source, or the empty placeholder
    /// fragment when the source has nothing for this datarow.
    pub fn fragment(&self, source: &AnnotationSource) -> Cow<'_, Fragment> {
        match self.items.get(source) {
            Some(fragment) => Cow::Borrowed(fragment),
            None => Cow::Owned(Fragment::placeholder(self)),
        }
    }

    /// Last path segment of the original upload URL
    pub fn original_file_name(&self) -> Option<&str> {
        let name = file_name_of(&self.original_url);
        (!name.is_empty()).then_some(name)
    }
}

/// Sequence/frame linkage of a datarow in a dataslice
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlatParent {
    pub id: i64,
    #[serde(default)]
    pub sequence_datarow_id: Option<i64>,
    #[serde(deserialize_with = "number_or_string")]
    pub frame_datarow_id: i64,
}

/// Records paginated by ascending id
pub trait Keyed {
    fn key(&self) -> i64;
}

impl Keyed for Datarow {
    fn key(&self) -> i64 {
        self.id
    }
}

impl Keyed for FlatParent {
    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntologyClass {
    pub name: String,
    #[serde(default)]
    pub rank: Option<i64>,
    #[serde(default)]
    pub extended_class: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Ontology {
    #[serde(default)]
    pub classes: Vec<OntologyClass>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    #[serde(default)]
    pub ontology: Ontology,
}

impl Project {
    /// Question text keyed by class rank, for question-based ontologies
    pub fn question_map(&self) -> std::collections::BTreeMap<i64, String> {
        self.ontology
            .classes
            .iter()
            .filter_map(|class| {
                let rank = class.rank?;
                let question = class
                    .extended_class
                    .as_ref()?
                    .get("question")?
                    .as_str()?
                    .to_string();
                Some((rank, question))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataslice {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub project: Project,
}

impl Dataslice {
    /// Ontology class names in project order
    pub fn class_names(&self) -> Vec<String> {
        self.project
            .ontology
            .classes
            .iter()
            .map(|class| class.name.clone())
            .collect()
    }

    /// Datarow type used to filter the flat-parent listing.
    ///
    /// Anything other than an image or point-cloud slice is listed as `base`.
    pub fn flat_parent_kind(&self) -> &'static str {
        match self.kind.as_str() {
            "image" => "image",
            "pcd" => "pcd",
            _ => "base",
        }
    }
}

/// Last `/`-separated segment of a URL or path, without any query string
pub fn file_name_of(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query.rsplit('/').next().unwrap_or(without_query)
}

fn number_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

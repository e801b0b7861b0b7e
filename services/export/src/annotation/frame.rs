//! Frame and sequence aggregation.
//!
//! Datarows of one output frame (one per sensor) are folded into a single
//! frame record, then all frames of a sequence are folded into one document.

use super::merge::{collect_static, combine_static_dynamic, DynamicMap};
use super::tags::{TagError, TagReindexer};
use super::{
    frame_key, AnnotationSource, ContextRecord, Fragment, Frame, FrameContext, FrameData,
    FrameObject, Metadata, ObjectRecord, Stream, StreamRef,
};
use crate::interval::gen_intervals;
use crate::model::Datarow;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("Datarow {datarow_id} annotation has no frame entry")]
    MissingFrame { datarow_id: i64 },

    #[error("Failed to reindex tags of datarow {datarow_id}: {source}")]
    Tag {
        datarow_id: i64,
        #[source]
        source: TagError,
    },
}

/// Re-root a media URI under `folder`, keeping its last three path segments.
///
/// `https://host/datasets/x/data/000000000004/data/camera1/000000000000.jpg`
/// under `/out/000000000002/` becomes
/// `/out/000000000002/data/camera1/000000000000.jpg`.
pub fn rewrite_stream_uri(uri: &str, folder: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let segments: Vec<&str> = path.split('/').collect();
    let tail = segments[segments.len().saturating_sub(3)..].join("/");
    format!("{}/{}", folder.trim_end_matches('/'), tail)
}

/// One output frame folded from the datarows of every sensor
#[derive(Debug, Clone, Default)]
pub struct AggregatedFrame {
    pub frame_number: i64,
    pub frame: Frame,
    /// Sequence-level stream entries, first seen per sensor
    pub streams: BTreeMap<String, Stream>,
    pub coordinate_systems: Option<Value>,
}

fn merge_elements<D: FrameData>(
    merged: &mut BTreeMap<String, D>,
    incoming: &BTreeMap<String, D>,
) {
    for (uuid, data) in incoming {
        let combined = match merged.remove(uuid) {
            Some(existing) => existing.merged_with(data),
            None => data.clone(),
        };
        merged.insert(uuid.clone(), combined);
    }
}

/// Fold the datarows sharing one output frame.
///
/// `tags` is the sequence vocabulary; when present, each datarow's RLE
/// values are rewritten against it before merging.
pub fn aggregate_frame(
    datarows: &[&Datarow],
    folder: &str,
    source: &AnnotationSource,
    tags: Option<&TagReindexer>,
) -> Result<AggregatedFrame, AggregationError> {
    let mut aggregated = AggregatedFrame::default();
    let mut objects: BTreeMap<String, FrameObject> = BTreeMap::new();
    let mut contexts: BTreeMap<String, FrameContext> = BTreeMap::new();

    for datarow in datarows {
        let fragment = datarow.fragment(source);
        let frame = fragment
            .frames
            .values()
            .next()
            .ok_or(AggregationError::MissingFrame {
                datarow_id: datarow.id,
            })?;

        let frame = match (tags, fragment.tag_classes()) {
            (Some(reindexer), Some(local)) => {
                Cow::Owned(reindexer.reindex_frame(frame, local).map_err(|source| {
                    AggregationError::Tag {
                        datarow_id: datarow.id,
                        source,
                    }
                })?)
            }
            _ => Cow::Borrowed(frame),
        };

        merge_elements(&mut objects, &frame.objects);
        merge_elements(&mut contexts, &frame.contexts);

        let properties = &mut aggregated.frame.frame_properties;
        if properties.timestamp.is_none() {
            properties.timestamp = frame.frame_properties.timestamp.clone();
        }
        let original_file_name = datarow.original_file_name().map(str::to_string);
        for (sensor, stream) in &frame.frame_properties.streams {
            let rewritten = StreamRef {
                uri: rewrite_stream_uri(&stream.uri, folder),
                original_file_name: original_file_name.clone(),
                ..stream.clone()
            };
            properties.streams.insert(sensor.clone(), rewritten);
        }

        if aggregated.coordinate_systems.is_none() {
            aggregated.coordinate_systems = fragment.coordinate_systems.clone();
        }
        for (sensor, stream) in &fragment.streams {
            aggregated
                .streams
                .entry(sensor.clone())
                .or_insert_with(|| Stream {
                    uri: stream.uri.as_deref().map(|uri| rewrite_stream_uri(uri, folder)),
                    ..stream.clone()
                });
        }

        aggregated.frame_number = datarow.frame_id;
    }

    aggregated.frame.objects = objects;
    aggregated.frame.contexts = contexts;
    Ok(aggregated)
}

/// Fold the frames of one sequence into an annotation document.
///
/// `frame_groups` holds one entry per output frame, each listing that frame's
/// datarows. Stream URIs are re-rooted under `folder`.
pub fn aggregate_sequence(
    frame_groups: &[Vec<&Datarow>],
    folder: &str,
    source: &AnnotationSource,
) -> Result<Fragment, AggregationError> {
    let datarows: Vec<&Datarow> = frame_groups.iter().flatten().copied().collect();
    let fragments: Vec<(i64, Cow<'_, Fragment>)> = datarows
        .iter()
        .map(|datarow| (datarow.frame_id, datarow.fragment(source)))
        .collect();

    let tags = TagReindexer::from_fragments(fragments.iter().map(|(_, f)| f.as_ref()));

    let mut frames = BTreeMap::new();
    let mut streams: BTreeMap<String, Stream> = BTreeMap::new();
    let mut coordinate_systems = None;
    let mut dynamic_objects = DynamicMap::new();
    let mut dynamic_contexts = DynamicMap::new();

    for group in frame_groups {
        let aggregated = aggregate_frame(group, folder, source, tags.as_ref())?;
        for uuid in aggregated.frame.objects.keys() {
            dynamic_objects
                .entry(uuid.clone())
                .or_default()
                .insert(aggregated.frame_number);
        }
        for uuid in aggregated.frame.contexts.keys() {
            dynamic_contexts
                .entry(uuid.clone())
                .or_default()
                .insert(aggregated.frame_number);
        }
        for (sensor, stream) in aggregated.streams {
            streams.entry(sensor).or_insert(stream);
        }
        if coordinate_systems.is_none() {
            coordinate_systems = aggregated.coordinate_systems;
        }
        frames.insert(frame_key(aggregated.frame_number), aggregated.frame);
    }

    let valid_frames: BTreeSet<i64> = frames
        .keys()
        .filter_map(|key: &String| key.parse().ok())
        .collect();
    let frame_numbers: Vec<i64> = valid_frames.iter().copied().collect();

    let pinned = fragments.iter().map(|(frame, f)| (*frame, f.as_ref()));
    let static_objects = collect_static::<ObjectRecord, _>(pinned.clone());
    let static_contexts = collect_static::<ContextRecord, _>(pinned);

    let objects = combine_static_dynamic(&static_objects, &dynamic_objects, &valid_frames);
    let contexts = combine_static_dynamic(&static_contexts, &dynamic_contexts, &valid_frames);

    let tags = tags
        .map(|reindexer| BTreeMap::from([reindexer.sequence_tag()]))
        .unwrap_or_default();

    trace!(
        frames = frames.len(),
        objects = objects.len(),
        contexts = contexts.len(),
        "Aggregated sequence"
    );

    Ok(Fragment {
        frames,
        frame_intervals: gen_intervals(&frame_numbers),
        objects,
        contexts,
        streams,
        tags,
        coordinate_systems,
        metadata: Some(Metadata::default()),
        extra: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{datarow, with_items};
    use serde_json::json;

    fn gt() -> AnnotationSource {
        AnnotationSource::GroundTruth
    }

    fn annotated(
        id: i64,
        frame: i64,
        sensor: &str,
        object: &str,
        rle: Option<(&str, &[&str])>,
    ) -> Datarow {
        let mut object_data = json!({"bbox": [{"name": "shape", "val": [10, 10, 4, 4]}]});
        let mut tags = json!({});
        if let Some((val, classes)) = rle {
            object_data["binary"] = json!([{"name": "mask", "val": val}]);
            tags = json!({"tag-1": {"ontology_uid": "", "type": "semantic_segmentation_RLE",
                "tag_data": {"vec": [{"name": "", "type": "values", "val": classes}]}}});
        }
        let key = frame_key(frame);
        let mut frames = serde_json::Map::new();
        frames.insert(
            key,
            json!({
                "objects": {object: {"object_data": object_data}},
                "frame_properties": {"streams": {sensor: {"uri": format!("https://s3/bucket/data/000000000009/data/{sensor}/{frame:012}.jpg")}}}
            }),
        );
        let mut objects = serde_json::Map::new();
        objects.insert(
            object.to_string(),
            json!({"name": object, "type": "car", "frame_intervals": [],
                "object_data_pointers": {"shape": {"type": "bbox", "frame_intervals": []}}}),
        );
        let mut streams = serde_json::Map::new();
        streams.insert(
            sensor.to_string(),
            json!({"type": "camera", "uri": format!("https://s3/bucket/data/000000000009/data/{sensor}/{frame:012}.jpg")}),
        );
        with_items(
            datarow(id, frame, sensor),
            json!({"ground_truths": {
                "frames": frames,
                "objects": objects,
                "streams": streams,
                "tags": tags,
                "coordinate_systems": {"iso8855": {"type": "local_cs"}}
            }}),
        )
    }

    /// Datarow carrying one `weather` text context whose value names the sensor
    fn with_weather(id: i64, frame: i64, sensor: &str) -> Datarow {
        let uri = format!("https://s3/bucket/data/000000000009/data/{sensor}/{frame:012}.jpg");
        let mut frames = serde_json::Map::new();
        frames.insert(
            frame_key(frame),
            json!({
                "contexts": {"ctx-1": {"context_data": {"text": [{"name": "weather", "val": sensor}]}}},
                "frame_properties": {"streams": {sensor: {"uri": uri}}}
            }),
        );
        let mut streams = serde_json::Map::new();
        streams.insert(sensor.to_string(), json!({"type": "camera", "uri": uri}));
        with_items(
            datarow(id, frame, sensor),
            json!({"ground_truths": {
                "frames": frames,
                "contexts": {"ctx-1": {"name": "scene", "type": "*tagging", "frame_intervals": [],
                    "context_data_pointers": {"weather": {"type": "text", "frame_intervals": []}}}},
                "streams": streams
            }}),
        )
    }

    #[test]
    fn test_sequence_contexts_across_sensors_and_placeholder() {
        let front_0 = with_weather(1, 0, "camera1");
        let rear_0 = with_weather(2, 0, "camera2");
        let front_1 = with_weather(3, 1, "camera1");
        let rear_1 = datarow(4, 1, "camera2");
        let groups = vec![vec![&front_0, &rear_0], vec![&front_1, &rear_1]];

        let doc = aggregate_sequence(&groups, "/out/000000000000/", &gt()).unwrap();

        let first = &doc.frames[&frame_key(0)];
        assert_eq!(
            first.contexts["ctx-1"].context_data["text"],
            vec![
                json!({"name": "weather", "val": "camera1"}),
                json!({"name": "weather", "val": "camera2"})
            ]
        );

        let second = &doc.frames[&frame_key(1)];
        assert_eq!(
            second.contexts["ctx-1"].context_data["text"],
            vec![json!({"name": "weather", "val": "camera1"})]
        );
        let streams = &second.frame_properties.streams;
        assert_eq!(streams["camera1"].uri, "/out/000000000000/data/camera1/000000000001.jpg");
        assert_eq!(streams["camera2"].uri, "/out/000000000000/data/camera2/000000000001.jpg");

        let context = &doc.contexts["ctx-1"];
        assert_eq!(context.frame_intervals, gen_intervals(&[0, 1]));
        assert_eq!(
            context.context_data_pointers["weather"].frame_intervals,
            gen_intervals(&[0, 1])
        );
        assert_eq!(doc.frame_intervals, gen_intervals(&[0, 1]));
    }

    #[test]
    fn test_rewrite_stream_uri() {
        assert_eq!(
            rewrite_stream_uri(
                "https://host/upload/datasets/x/data/000000000004/data/camera1/000000000000.jpg?sig=1",
                "/out/000000000002/"
            ),
            "/out/000000000002/data/camera1/000000000000.jpg"
        );
        assert_eq!(rewrite_stream_uri("a/b.jpg", "/out"), "/out/a/b.jpg");
    }

    #[test]
    fn test_missing_frame_is_an_error() {
        let row = with_items(
            datarow(5, 0, "camera1"),
            json!({"ground_truths": {"streams": {"camera1": {"type": "camera"}}}}),
        );
        let result = aggregate_frame(&[&row], "/out", &gt(), None);
        assert!(matches!(result, Err(AggregationError::MissingFrame { datarow_id: 5 })));
    }

    #[test]
    fn test_frame_merges_sensors() {
        let front = annotated(1, 3, "camera1", "obj-1", None);
        let rear = annotated(2, 3, "camera2", "obj-1", None);
        let aggregated =
            aggregate_frame(&[&front, &rear], "/out/000000000000", &gt(), None).unwrap();

        assert_eq!(aggregated.frame_number, 3);
        assert_eq!(aggregated.frame.objects["obj-1"].object_data["bbox"].len(), 2);
        let streams = &aggregated.frame.frame_properties.streams;
        assert_eq!(streams.len(), 2);
        assert_eq!(
            streams["camera2"].uri,
            "/out/000000000000/data/camera2/000000000003.jpg"
        );
        assert_eq!(streams["camera1"].original_file_name.as_deref(), Some("000000000003.jpg"));
        assert_eq!(aggregated.streams.len(), 2);
    }

    #[test]
    fn test_unannotated_datarow_gets_placeholder_frame() {
        let row = datarow(7, 4, "lidar1");
        let aggregated = aggregate_frame(&[&row], "/out/000000000001/", &gt(), None).unwrap();
        assert!(aggregated.frame.objects.is_empty());
        assert_eq!(
            aggregated.frame.frame_properties.streams["lidar1"].uri,
            "/out/000000000001/data/lidar1/000000000004.jpg"
        );
        let doc = serde_json::to_value(&aggregated.frame).unwrap();
        assert!(doc.get("objects").is_none());
        assert!(doc.get("contexts").is_none());
    }

    #[test]
    fn test_sequence_document() {
        let rows: Vec<Datarow> = (0..3)
            .map(|frame| annotated(10 + frame, frame, "camera1", "obj-1", None))
            .collect();
        let groups: Vec<Vec<&Datarow>> = rows.iter().map(|row| vec![row]).collect();

        let doc = aggregate_sequence(&groups, "/out/000000000000/", &gt()).unwrap();
        assert_eq!(doc.frames.len(), 3);
        assert_eq!(doc.frame_intervals, gen_intervals(&[0, 1, 2]));
        assert_eq!(doc.objects["obj-1"].frame_intervals, gen_intervals(&[0, 1, 2]));
        assert_eq!(
            doc.objects["obj-1"].object_data_pointers["shape"].frame_intervals,
            gen_intervals(&[0, 1, 2])
        );
        assert!(doc.tags.is_empty());
        assert_eq!(doc.metadata.as_ref().map(|m| m.schema_version.as_str()), Some("1.0.0"));
        assert!(doc.coordinate_systems.is_some());
        assert_eq!(
            doc.streams["camera1"].uri.as_deref(),
            Some("/out/000000000000/data/camera1/000000000000.jpg")
        );
    }

    #[test]
    fn test_sequence_tags_reindexed_across_frames() {
        let first = annotated(1, 0, "camera1", "seg-1", Some(("4V0#2V1", &["road", "car"][..])));
        let second = annotated(2, 1, "camera1", "seg-2", Some(("3V0#1V1", &["sky", "road"][..])));
        let groups = vec![vec![&first], vec![&second]];

        let doc = aggregate_sequence(&groups, "/out/000000000000/", &gt()).unwrap();
        assert_eq!(doc.tags.len(), 1);
        let tag = doc.tags.values().next().unwrap();
        assert_eq!(
            tag.tag_data.as_ref().unwrap().vec[0].val,
            vec!["road", "car", "sky"]
        );
        let second_frame = &doc.frames[&frame_key(1)];
        assert_eq!(
            second_frame.objects["seg-2"].object_data["binary"][0]["val"],
            json!("3V2#1V0")
        );
        let first_frame = &doc.frames[&frame_key(0)];
        assert_eq!(
            first_frame.objects["seg-1"].object_data["binary"][0]["val"],
            json!("4V0#2V1")
        );
    }
}

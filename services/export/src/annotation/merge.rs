//! Static/dynamic element merging.
//!
//! Sequence-level objects and contexts arrive once per datarow, each copy
//! describing a single frame ("static"). Per-frame entries only tell on which
//! frames an element exists ("dynamic"). Merging produces one record per
//! element whose pointer intervals are clipped to the frames that survived
//! re-sequencing.

use super::{DataPointer, Fragment, PointerRecord};
use crate::interval::{expand_intervals, gen_intervals, FrameInterval};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Element uuid to every `(frame, record)` observation
pub type StaticMap<R> = BTreeMap<String, Vec<(i64, R)>>;

/// Element uuid to the frames it was seen on without sequence-level data
pub type DynamicMap = BTreeMap<String, BTreeSet<i64>>;

/// Collect the sequence-level records of type `R` from per-frame fragments.
///
/// Every pointer of a collected record is pinned to the fragment's frame, so
/// later merging can rebuild intervals from the observations alone.
pub fn collect_static<'a, R, I>(fragments: I) -> StaticMap<R>
where
    R: PointerRecord + 'a,
    I: IntoIterator<Item = (i64, &'a Fragment)>,
{
    let mut collected: StaticMap<R> = BTreeMap::new();
    for (frame, fragment) in fragments {
        for (uuid, record) in R::section(fragment) {
            let pointers = record
                .data_pointers()
                .iter()
                .map(|(name, pointer)| {
                    let pinned = DataPointer {
                        frame_intervals: vec![FrameInterval::single(frame)],
                        ..pointer.clone()
                    };
                    (name.clone(), pinned)
                })
                .collect();
            collected
                .entry(uuid.clone())
                .or_default()
                .push((frame, record.clone().with_data_pointers(pointers)));
        }
    }
    collected
}

/// Merge static observations and dynamic presence into one record per uuid.
///
/// Pointer intervals are concatenated across observations, then clipped to
/// `valid_frames`. An element with any pointer left without a valid frame is
/// dropped. The element's own `frame_intervals` is the union of its static and
/// dynamic frames. Uuids known only from the dynamic map have no record to
/// emit and are skipped.
pub fn combine_static_dynamic<R: PointerRecord>(
    static_map: &StaticMap<R>,
    dynamic: &DynamicMap,
    valid_frames: &BTreeSet<i64>,
) -> BTreeMap<String, R> {
    static_map
        .iter()
        .filter_map(|(uuid, observations)| {
            let (_, first) = observations.first()?;

            let concatenated = observations.iter().skip(1).fold(
                first.data_pointers().clone(),
                |mut pointers, (_, record)| {
                    for (name, pointer) in record.data_pointers() {
                        pointers
                            .entry(name.clone())
                            .and_modify(|existing| {
                                existing
                                    .frame_intervals
                                    .extend(pointer.frame_intervals.iter().copied())
                            })
                            .or_insert_with(|| pointer.clone());
                    }
                    pointers
                },
            );

            let mut clipped = BTreeMap::new();
            for (name, pointer) in concatenated {
                let frames: Vec<i64> = expand_intervals(&pointer.frame_intervals)
                    .intersection(valid_frames)
                    .copied()
                    .collect();
                if frames.is_empty() {
                    debug!(uuid = %uuid, pointer = %name, "Dropping element without valid frames");
                    return None;
                }
                let pointer = DataPointer {
                    frame_intervals: gen_intervals(&frames),
                    ..pointer
                };
                clipped.insert(name, pointer);
            }

            let mut frames: Vec<i64> = observations.iter().map(|(frame, _)| *frame).collect();
            if let Some(seen) = dynamic.get(uuid) {
                frames.extend(seen.iter().copied());
            }

            let record = first
                .clone()
                .with_data_pointers(clipped)
                .with_frame_intervals(gen_intervals(&frames));
            Some((uuid.clone(), record))
        })
        .collect()
}

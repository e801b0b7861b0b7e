//! Sequence map construction.
//!
//! The backend lists `(datarow, sequence parent, frame parent)` triples. They
//! are grouped into sequences and frames in first-seen order, then given dense
//! zero-based sequence orders according to the export's sequential flag.

use crate::model::FlatParent;
use futures::{Stream, TryStreamExt};
use std::collections::HashMap;
use tracing::debug;

/// Sequence parent of a datarow, with datarows lacking one grouped together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceKey {
    Parent(i64),
    /// Datarows with a null sequence parent. Frames under it are always
    /// exported as singleton sequences.
    Unsequenced,
}

impl From<Option<i64>> for SequenceKey {
    fn from(id: Option<i64>) -> Self {
        id.map_or(SequenceKey::Unsequenced, SequenceKey::Parent)
    }
}

/// Datarows sharing one frame parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameGroup {
    pub frame_datarow_id: i64,
    pub datarow_ids: Vec<i64>,
}

/// One output sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub order: usize,
    pub frames: Vec<FrameGroup>,
}

impl Sequence {
    pub fn datarow_count(&self) -> usize {
        self.frames.iter().map(|frame| frame.datarow_ids.len()).sum()
    }
}

/// Flat-parent records grouped by sequence key then frame parent, both in
/// first-seen order
#[derive(Debug, Default)]
pub struct SequenceGrouping {
    sequences: Vec<(SequenceKey, Vec<FrameGroup>)>,
    sequence_index: HashMap<SequenceKey, usize>,
    frame_index: HashMap<(SequenceKey, i64), usize>,
}

impl SequenceGrouping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, parent: &FlatParent) {
        let key = SequenceKey::from(parent.sequence_datarow_id);
        let sequence_slot = *self.sequence_index.entry(key).or_insert_with(|| {
            self.sequences.push((key, Vec::new()));
            self.sequences.len() - 1
        });
        let frames = &mut self.sequences[sequence_slot].1;

        let frame_slot = *self
            .frame_index
            .entry((key, parent.frame_datarow_id))
            .or_insert_with(|| {
                frames.push(FrameGroup {
                    frame_datarow_id: parent.frame_datarow_id,
                    datarow_ids: Vec::new(),
                });
                frames.len() - 1
            });
        frames[frame_slot].datarow_ids.push(parent.id);
    }

    /// Number of distinct sequence keys seen
    pub fn sequence_key_count(&self) -> usize {
        self.sequences.len()
    }

    /// Assign dense sequence orders.
    ///
    /// Without `is_sequential` every frame becomes its own sequence. With it,
    /// each sequence key becomes one sequence, except [`SequenceKey::Unsequenced`]
    /// whose frames stay singletons.
    pub fn into_sequence_map(self, is_sequential: bool) -> SequenceMap {
        let mut sequences: Vec<Sequence> = Vec::new();
        for (key, frames) in self.sequences {
            if is_sequential && key != SequenceKey::Unsequenced {
                sequences.push(Sequence {
                    order: sequences.len(),
                    frames,
                });
                continue;
            }
            for frame in frames {
                sequences.push(Sequence {
                    order: sequences.len(),
                    frames: vec![frame],
                });
            }
        }
        SequenceMap { sequences }
    }
}

/// `sequence order -> frame parent -> datarow ids`, ordered by sequence order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceMap {
    sequences: Vec<Sequence>,
}

impl SequenceMap {
    pub fn iter(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter()
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.sequences.iter().map(|s| s.frames.len()).sum()
    }

    pub fn datarow_count(&self) -> usize {
        self.sequences.iter().map(Sequence::datarow_count).sum()
    }
}

impl<'a> IntoIterator for &'a SequenceMap {
    type Item = &'a Sequence;
    type IntoIter = std::slice::Iter<'a, Sequence>;

    fn into_iter(self) -> Self::IntoIter {
        self.sequences.iter()
    }
}

/// Drain paginated flat-parent records into a sequence map.
///
/// The first page error is returned and no partial map is produced.
pub async fn build_sequence_map<S, E>(pages: S, is_sequential: bool) -> Result<SequenceMap, E>
where
    S: Stream<Item = Result<Vec<FlatParent>, E>>,
{
    let grouping = pages
        .try_fold(SequenceGrouping::new(), |mut grouping, page| async move {
            for parent in &page {
                grouping.push(parent);
            }
            Ok(grouping)
        })
        .await?;

    let sequence_keys = grouping.sequence_key_count();
    let map = grouping.into_sequence_map(is_sequential);
    debug!(
        sequence_keys,
        sequences = map.len(),
        frames = map.frame_count(),
        datarows = map.datarow_count(),
        is_sequential,
        "Built sequence map"
    );
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::collections::HashSet;

    fn parent(id: i64, sequence: Option<i64>, frame: i64) -> FlatParent {
        FlatParent {
            id,
            sequence_datarow_id: sequence,
            frame_datarow_id: frame,
        }
    }

    /// Two sequences of two frames, an unsequenced pair of frames, and a
    /// second sensor on one frame
    fn fixture() -> Vec<Vec<FlatParent>> {
        vec![
            vec![
                parent(1, Some(100), 10),
                parent(2, Some(100), 11),
                parent(3, None, 50),
            ],
            vec![
                parent(4, Some(200), 20),
                parent(5, Some(100), 10),
                parent(6, None, 51),
                parent(7, Some(200), 21),
            ],
        ]
    }

    async fn build(is_sequential: bool) -> SequenceMap {
        let pages = stream::iter(fixture().into_iter().map(Ok::<_, std::io::Error>));
        build_sequence_map(pages, is_sequential).await.unwrap()
    }

    fn orders(map: &SequenceMap) -> Vec<usize> {
        map.iter().map(|s| s.order).collect()
    }

    #[tokio::test]
    async fn test_flattened_one_sequence_per_frame() {
        let map = build(false).await;
        let frames: HashSet<i64> = fixture()
            .iter()
            .flatten()
            .map(|p| p.frame_datarow_id)
            .collect();

        assert_eq!(map.len(), frames.len());
        assert_eq!(orders(&map), (0..frames.len()).collect::<Vec<_>>());
        assert_eq!(map.datarow_count(), 7);

        let first = map.iter().next().unwrap();
        assert_eq!(first.frames[0].frame_datarow_id, 10);
        assert_eq!(first.frames[0].datarow_ids, vec![1, 5]);
    }

    #[tokio::test]
    async fn test_sequential_keeps_sequences_and_splits_unsequenced() {
        let map = build(true).await;

        // 100, then the two unsequenced frames, then 200
        assert_eq!(map.len(), 4);
        assert_eq!(orders(&map), vec![0, 1, 2, 3]);

        let sequences: Vec<&Sequence> = map.iter().collect();
        let frame_ids = |s: &Sequence| -> Vec<i64> {
            s.frames.iter().map(|f| f.frame_datarow_id).collect()
        };
        assert_eq!(frame_ids(sequences[0]), vec![10, 11]);
        assert_eq!(frame_ids(sequences[1]), vec![50]);
        assert_eq!(frame_ids(sequences[2]), vec![51]);
        assert_eq!(frame_ids(sequences[3]), vec![20, 21]);
    }

    #[tokio::test]
    async fn test_pagination_error_propagates() {
        let pages = stream::iter(vec![
            Ok(vec![parent(1, Some(1), 1)]),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")),
        ]);
        let result = build_sequence_map(pages, true).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_sequence_key_from_option() {
        assert_eq!(SequenceKey::from(None), SequenceKey::Unsequenced);
        assert_eq!(SequenceKey::from(Some(3)), SequenceKey::Parent(3));
    }
}

//! Frame interval arithmetic.
//!
//! Turns sets of frame numbers into sorted, non-overlapping, non-adjacent
//! closed ranges and back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Closed frame range `[frame_start, frame_end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameInterval {
    pub frame_start: i64,
    pub frame_end: i64,
}

impl FrameInterval {
    pub fn new(frame_start: i64, frame_end: i64) -> Self {
        Self {
            frame_start,
            frame_end,
        }
    }

    /// Interval covering a single frame
    pub fn single(frame: i64) -> Self {
        Self::new(frame, frame)
    }

    /// Iterate every frame number covered by this interval
    pub fn frames(&self) -> impl Iterator<Item = i64> {
        self.frame_start..=self.frame_end
    }
}

/// Build canonical intervals from a list of frame numbers.
///
/// `[0, 1, 2, 3, 5, 8, 9, 12]` becomes `[(0, 3), (5, 5), (8, 9), (12, 12)]`.
/// Duplicates are ignored. An empty input yields an empty list.
pub fn gen_intervals(frames: &[i64]) -> Vec<FrameInterval> {
    let mut sorted = frames.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut intervals: Vec<FrameInterval> = Vec::new();
    for frame in sorted {
        match intervals.last_mut() {
            Some(last) if frame - last.frame_end == 1 => last.frame_end = frame,
            Some(last) if last.frame_start - frame == 1 => last.frame_start = frame,
            _ => intervals.push(FrameInterval::single(frame)),
        }
    }

    if intervals.len() <= 1 {
        return intervals;
    }
    merge_intervals(intervals)
}

/// Merge intervals given in any order, collapsing overlaps and gaps of at most one frame.
///
/// `[(3, 5), (0, 3), (8, 9), (12, 12)]` becomes `[(0, 5), (8, 9), (12, 12)]`.
pub fn merge_intervals(mut intervals: Vec<FrameInterval>) -> Vec<FrameInterval> {
    intervals.sort_by_key(|interval| (interval.frame_start, interval.frame_end));

    let mut merged: Vec<FrameInterval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if interval.frame_start - last.frame_end <= 1 => {
                last.frame_end = last.frame_end.max(interval.frame_end);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// Expand intervals into the explicit set of frame numbers they cover
pub fn expand_intervals(intervals: &[FrameInterval]) -> BTreeSet<i64> {
    intervals.iter().flat_map(FrameInterval::frames).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(intervals: &[FrameInterval]) -> Vec<(i64, i64)> {
        intervals
            .iter()
            .map(|i| (i.frame_start, i.frame_end))
            .collect()
    }

    #[test]
    fn test_gen_intervals_example() {
        let intervals = gen_intervals(&[0, 1, 2, 3, 5, 8, 9, 12]);
        assert_eq!(pairs(&intervals), vec![(0, 3), (5, 5), (8, 9), (12, 12)]);
    }

    #[test]
    fn test_gen_intervals_unsorted_with_duplicates() {
        let intervals = gen_intervals(&[9, 3, 2, 2, 8, 4]);
        assert_eq!(pairs(&intervals), vec![(2, 4), (8, 9)]);
    }

    #[test]
    fn test_gen_intervals_single_and_empty() {
        assert_eq!(pairs(&gen_intervals(&[7])), vec![(7, 7)]);
        assert!(gen_intervals(&[]).is_empty());
    }

    #[test]
    fn test_gen_intervals_recreates_input_and_is_minimal() {
        let inputs: Vec<Vec<i64>> = vec![
            vec![0, 2, 4, 6],
            vec![-3, -2, -1, 1, 2],
            vec![10, 11, 12, 13],
            vec![100, 1, 50, 51, 2, 99],
        ];
        for input in inputs {
            let intervals = gen_intervals(&input);
            let expected: BTreeSet<i64> = input.iter().copied().collect();
            assert_eq!(expand_intervals(&intervals), expected);
            for pair in intervals.windows(2) {
                assert!(pair[1].frame_start - pair[0].frame_end > 1, "{:?}", pair);
            }
        }
    }

    #[test]
    fn test_merge_intervals_collapses_touching_ranges() {
        let merged = merge_intervals(vec![
            FrameInterval::new(8, 9),
            FrameInterval::new(3, 5),
            FrameInterval::new(0, 3),
            FrameInterval::new(6, 6),
            FrameInterval::new(7, 7),
            FrameInterval::new(12, 12),
        ]);
        assert_eq!(pairs(&merged), vec![(0, 9), (12, 12)]);
    }

    #[test]
    fn test_merge_intervals_keeps_missing_frame_gap() {
        let merged = merge_intervals(vec![
            FrameInterval::new(8, 9),
            FrameInterval::new(0, 3),
            FrameInterval::new(4, 6),
            FrameInterval::new(12, 12),
        ]);
        assert_eq!(pairs(&merged), vec![(0, 6), (8, 9), (12, 12)]);
    }

    #[test]
    fn test_merge_intervals_idempotent() {
        let input = vec![
            FrameInterval::new(4, 4),
            FrameInterval::new(0, 1),
            FrameInterval::new(20, 25),
            FrameInterval::new(2, 2),
            FrameInterval::new(22, 30),
        ];
        let once = merge_intervals(input);
        let twice = merge_intervals(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_interval_serde_shape() {
        let json = serde_json::to_value(FrameInterval::new(0, 2)).unwrap();
        assert_eq!(json, serde_json::json!({"frame_start": 0, "frame_end": 2}));
    }
}

//! Flattening of a [`LoadSpec`] tree into ordered, atomic segments.
//!
//! Traversal is depth-first pre-order: for each repetition of a node, its own
//! segment comes first, then each child's complete sequence in order. The
//! iterator keeps an explicit frame stack, so nesting depth never touches the
//! call stack and each call to [`sequence`] starts from scratch.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::core::errors::{Result, SlgError};
use crate::core::units::TimeUnit;
use crate::load::resources::ResourceLoad;
use crate::load::spec::LoadSpec;

/// One node's own load for one repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub cpu: u8,
    pub memory_bytes: u64,
    pub disk_input_bps: u64,
    pub disk_output_bps: u64,
    pub duration: u64,
    pub time_unit: TimeUnit,
}

impl Segment {
    fn of(spec: &LoadSpec) -> Self {
        Self {
            cpu: spec.cpu(),
            memory_bytes: spec.memory_bytes(),
            disk_input_bps: spec.disk_input_bps(),
            disk_output_bps: spec.disk_output_bps(),
            duration: spec.duration(),
            time_unit: spec.time_unit(),
        }
    }

    /// The delta this segment applies to the aggregate.
    #[must_use]
    pub fn load(&self) -> ResourceLoad {
        ResourceLoad {
            cpu: u64::from(self.cpu),
            memory_bytes: self.memory_bytes,
            disk_input_bps: self.disk_input_bps,
            disk_output_bps: self.disk_output_bps,
        }
    }

    #[must_use]
    pub fn hold_duration(&self) -> Duration {
        Duration::from_millis(self.duration.saturating_mul(self.time_unit.millis_per_unit()))
    }
}

#[derive(Debug)]
struct Frame {
    spec: LoadSpec,
    rep: u32,
    next_child: usize,
    emitted_own: bool,
}

impl Frame {
    const fn new(spec: LoadSpec) -> Self {
        Self {
            spec,
            rep: 0,
            next_child: 0,
            emitted_own: false,
        }
    }
}

/// Lazy, finite iterator over the segments of one spec.
#[derive(Debug)]
pub struct SegmentSequence {
    stack: Vec<Frame>,
}

impl Iterator for SegmentSequence {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        loop {
            let frame = self.stack.last_mut()?;
            if frame.rep >= frame.spec.repetitions() {
                self.stack.pop();
                continue;
            }
            if !frame.emitted_own {
                frame.emitted_own = true;
                return Some(Segment::of(&frame.spec));
            }
            if let Some(child) = frame.spec.children().get(frame.next_child).cloned() {
                frame.next_child += 1;
                self.stack.push(Frame::new(child));
                continue;
            }
            frame.rep += 1;
            frame.next_child = 0;
            frame.emitted_own = false;
        }
    }
}

/// Fresh segment iterator for `spec`.
#[must_use]
pub fn sequence(spec: &LoadSpec) -> SegmentSequence {
    SegmentSequence {
        stack: vec![Frame::new(spec.clone())],
    }
}

/// Exact number of segments `spec` expands to, or `None` on `u64` overflow.
///
/// Computed bottom-up over an explicit post-order so deep trees are safe.
/// Counts are memoised per node, so a subtree shared by several parents is
/// counted once.
#[must_use]
pub fn segment_count(spec: &LoadSpec) -> Option<u64> {
    let mut counts: HashMap<usize, u64> = HashMap::new();
    // (node, children_expanded)
    let mut stack: Vec<(&LoadSpec, bool)> = vec![(spec, false)];
    while let Some((node, expanded)) = stack.pop() {
        let id = node.node_id();
        if counts.contains_key(&id) {
            continue;
        }
        if expanded {
            let child_total = node
                .children()
                .iter()
                .try_fold(0u64, |acc, child| acc.checked_add(*counts.get(&child.node_id())?))?;
            let per_rep = child_total.checked_add(1)?;
            counts.insert(id, per_rep.checked_mul(u64::from(node.repetitions()))?);
        } else {
            stack.push((node, true));
            stack.extend(node.children().iter().map(|child| (child, false)));
        }
    }
    counts.get(&spec.node_id()).copied()
}

/// Like [`sequence`], but rejects trees deeper than `max_depth` or larger
/// than `max_segments` before anything runs.
pub fn sequence_with_limits(
    spec: &LoadSpec,
    max_segments: u64,
    max_depth: usize,
) -> Result<SegmentSequence> {
    if spec.depth() > max_depth {
        return Err(SlgError::DepthExceeded { max_depth });
    }
    match segment_count(spec) {
        Some(count) if count <= max_segments => Ok(sequence(spec)),
        _ => Err(SlgError::TooManySegments {
            limit: max_segments,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(cpu: u32, secs: u64) -> LoadSpec {
        LoadSpec::new()
            .with_cpu(cpu)
            .unwrap()
            .lasting(secs, TimeUnit::Seconds)
            .unwrap()
    }

    #[test]
    fn repeated_leaf_yields_identical_segments() {
        let spec = leaf(50, 5).repeat(3);
        let segments: Vec<Segment> = sequence(&spec).collect();
        assert_eq!(segments.len(), 3);
        for segment in segments {
            assert_eq!(segment.cpu, 50);
            assert_eq!(segment.hold_duration(), Duration::from_secs(5));
        }
    }

    #[test]
    fn own_segment_precedes_children() {
        let a = leaf(1, 1);
        let b = leaf(2, 2);
        let root = leaf(9, 0).add_loads(&[a, b]).unwrap();
        let cpus: Vec<u8> = sequence(&root).map(|s| s.cpu).collect();
        assert_eq!(cpus, vec![9, 1, 2]);
    }

    #[test]
    fn whole_group_repeats() {
        let root = leaf(9, 0).add_load(&leaf(1, 1).repeat(2)).unwrap().repeat(2);
        let cpus: Vec<u8> = sequence(&root).map(|s| s.cpu).collect();
        assert_eq!(cpus, vec![9, 1, 1, 9, 1, 1]);
        assert_eq!(segment_count(&root), Some(6));
    }

    #[test]
    fn zero_repetitions_disable_the_subtree() {
        let muted = leaf(1, 1).add_load(&leaf(2, 1)).unwrap().repeat(0);
        let root = leaf(9, 0).add_loads(&[muted, leaf(3, 1)]).unwrap();
        let cpus: Vec<u8> = sequence(&root).map(|s| s.cpu).collect();
        assert_eq!(cpus, vec![9, 3]);
        assert_eq!(sequence(&leaf(1, 1).repeat(0)).count(), 0);
    }

    #[test]
    fn sequencing_is_restartable() {
        let root = leaf(9, 0).add_load(&leaf(1, 1)).unwrap().repeat(3);
        let first: Vec<Segment> = sequence(&root).collect();
        let second: Vec<Segment> = sequence(&root).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn segment_count_detects_overflow() {
        let mut spec = leaf(0, 0).repeat(u32::MAX);
        for _ in 0..4 {
            spec = LoadSpec::new().add_load(&spec).unwrap().repeat(u32::MAX);
        }
        assert_eq!(segment_count(&spec), None);
        assert!(matches!(
            sequence_with_limits(&spec, u64::MAX, 64),
            Err(SlgError::TooManySegments { .. })
        ));
    }

    #[test]
    fn limits_reject_large_and_deep_trees() {
        let spec = leaf(1, 1).repeat(10);
        assert!(sequence_with_limits(&spec, 10, 8).is_ok());
        assert!(matches!(
            sequence_with_limits(&spec, 9, 8),
            Err(SlgError::TooManySegments { limit: 9 })
        ));
        let nested = LoadSpec::new().add_load(&spec).unwrap();
        assert!(matches!(
            sequence_with_limits(&nested, 100, 1),
            Err(SlgError::DepthExceeded { max_depth: 1 })
        ));
    }

    #[test]
    fn shared_towers_are_rejected_without_walking_every_path() {
        let started = std::time::Instant::now();
        let mut tower = leaf(1, 0);
        for _ in 0..40 {
            tower = LoadSpec::new().add_loads(&[tower.clone(), tower]).unwrap();
        }
        assert_eq!(segment_count(&tower), Some((1u64 << 41) - 1));
        assert!(matches!(
            sequence_with_limits(&tower, 1_000_000, 64),
            Err(SlgError::TooManySegments { limit: 1_000_000 })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn shared_children_count_once_per_occurrence() {
        let shared = leaf(1, 1).repeat(2);
        let root = leaf(9, 0).add_loads(&[shared.clone(), shared]).unwrap();
        assert_eq!(segment_count(&root), Some(5));
        assert_eq!(sequence(&root).count(), 5);
    }
}

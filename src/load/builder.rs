//! Mutable, shareable builder for load trees.
//!
//! Unlike [`LoadSpec`], a builder node is edited in place and every clone of
//! a [`LoadSpecBuilder`] refers to the same node. That makes "add `b` under
//! `a`, then add `a` under `b`" expressible, so composition is checked
//! against the live graph before each edge is added.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::errors::{Result, SlgError};
use crate::core::units::{ByteUnit, TimeUnit};
use crate::load::spec::{LoadSpec, validate_cpu};

/// Default nesting limit used by [`LoadSpecBuilder::build`].
pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Debug)]
struct BuilderNode {
    duration: u64,
    time_unit: TimeUnit,
    repetitions: u32,
    cpu: u8,
    memory_bytes: u64,
    disk_input_bps: u64,
    disk_output_bps: u64,
    children: Vec<LoadSpecBuilder>,
}

/// Handle to a shared, editable load node.
#[derive(Debug, Clone)]
pub struct LoadSpecBuilder {
    node: Arc<Mutex<BuilderNode>>,
}

impl Default for LoadSpecBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSpecBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            node: Arc::new(Mutex::new(BuilderNode {
                duration: 0,
                time_unit: TimeUnit::Seconds,
                repetitions: 1,
                cpu: 0,
                memory_bytes: 0,
                disk_input_bps: 0,
                disk_output_bps: 0,
                children: Vec::new(),
            })),
        }
    }

    pub fn lasting(&self, duration: u64, unit: TimeUnit) -> Result<&Self> {
        unit.to_duration(duration)?;
        let mut node = self.node.lock();
        node.duration = duration;
        node.time_unit = unit;
        Ok(self)
    }

    pub fn repeat(&self, repetitions: u32) -> &Self {
        self.node.lock().repetitions = repetitions;
        self
    }

    pub fn cpu(&self, pct: u32) -> Result<&Self> {
        let cpu = validate_cpu(pct)?;
        self.node.lock().cpu = cpu;
        Ok(self)
    }

    pub fn memory(&self, amount: u64, unit: ByteUnit) -> Result<&Self> {
        let bytes = unit.to_bytes("memory", amount)?;
        self.node.lock().memory_bytes = bytes;
        Ok(self)
    }

    pub fn disk_input(&self, rate: u64, unit: ByteUnit) -> Result<&Self> {
        let bps = unit.to_bytes("disk_input", rate)?;
        self.node.lock().disk_input_bps = bps;
        Ok(self)
    }

    pub fn disk_output(&self, rate: u64, unit: ByteUnit) -> Result<&Self> {
        let bps = unit.to_bytes("disk_output", rate)?;
        self.node.lock().disk_output_bps = bps;
        Ok(self)
    }

    /// Attach `child` under this node.
    ///
    /// Fails with `CyclicComposition` if `child` is this node or already
    /// reaches it through its own descendants.
    pub fn add_load(&self, child: &Self) -> Result<&Self> {
        if child.contains(self) {
            return Err(SlgError::CyclicComposition {
                details: if child.same_node(self) {
                    "a load cannot be added to itself".to_string()
                } else {
                    "the added load already contains the receiving load".to_string()
                },
            });
        }
        self.node.lock().children.push(child.clone());
        Ok(self)
    }

    #[must_use]
    pub fn same_node(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Whether `other` is reachable from this node (including itself).
    ///
    /// Only one node lock is held at a time.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        let mut stack = vec![self.clone()];
        let mut seen: Vec<*const Mutex<BuilderNode>> = Vec::new();
        while let Some(current) = stack.pop() {
            if current.same_node(other) {
                return true;
            }
            let ptr = Arc::as_ptr(&current.node);
            if seen.contains(&ptr) {
                continue;
            }
            seen.push(ptr);
            let children = current.node.lock().children.clone();
            stack.extend(children);
        }
        false
    }

    /// Freeze into an immutable [`LoadSpec`] using [`DEFAULT_MAX_DEPTH`].
    pub fn build(&self) -> Result<LoadSpec> {
        self.build_with_max_depth(DEFAULT_MAX_DEPTH)
    }

    /// Freeze into an immutable [`LoadSpec`]. Builder nodes referenced from
    /// several parents stay shared in the result.
    pub fn build_with_max_depth(&self, max_depth: usize) -> Result<LoadSpec> {
        let mut built = HashMap::new();
        self.freeze(1, max_depth, &mut built).map(|(spec, _)| spec)
    }

    /// Returns the frozen node and the height of its subtree.
    fn freeze(
        &self,
        depth: usize,
        max_depth: usize,
        built: &mut HashMap<usize, (LoadSpec, usize)>,
    ) -> Result<(LoadSpec, usize)> {
        if depth > max_depth {
            return Err(SlgError::DepthExceeded { max_depth });
        }
        let key = Arc::as_ptr(&self.node) as usize;
        if let Some((spec, height)) = built.get(&key) {
            // A shared node first frozen nearer the root may not fit here.
            if depth + height - 1 > max_depth {
                return Err(SlgError::DepthExceeded { max_depth });
            }
            return Ok((spec.clone(), *height));
        }

        let (own, children) = {
            let node = self.node.lock();
            let own = LoadSpec::new()
                .lasting(node.duration, node.time_unit)?
                .repeat(node.repetitions)
                .with_cpu(u32::from(node.cpu))?
                .with_memory(node.memory_bytes, ByteUnit::Bytes)?
                .with_disk_input(node.disk_input_bps, ByteUnit::Bytes)?
                .with_disk_output(node.disk_output_bps, ByteUnit::Bytes)?;
            (own, node.children.clone())
        };

        let mut frozen_children = Vec::with_capacity(children.len());
        let mut height = 1;
        for child in &children {
            let (frozen, child_height) = child.freeze(depth + 1, max_depth, built)?;
            height = height.max(child_height + 1);
            frozen_children.push(frozen);
        }
        let spec = own.add_loads(&frozen_children)?;
        built.insert(key, (spec.clone(), height));
        Ok((spec, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::sequencer::sequence;

    #[test]
    fn builder_edits_are_visible_through_clones() {
        let a = LoadSpecBuilder::new();
        let alias = a.clone();
        alias.cpu(30).unwrap().lasting(2, TimeUnit::Seconds).unwrap();
        let spec = a.build().unwrap();
        assert_eq!(spec.cpu(), 30);
        assert_eq!(spec.duration(), 2);
    }

    #[test]
    fn self_addition_is_rejected() {
        let a = LoadSpecBuilder::new();
        assert!(matches!(
            a.add_load(&a),
            Err(SlgError::CyclicComposition { .. })
        ));
    }

    #[test]
    fn mutual_addition_is_rejected() {
        let a = LoadSpecBuilder::new();
        let b = LoadSpecBuilder::new();
        a.add_load(&b).unwrap();
        assert!(matches!(
            b.add_load(&a),
            Err(SlgError::CyclicComposition { .. })
        ));
    }

    #[test]
    fn transitive_cycle_is_rejected() {
        let a = LoadSpecBuilder::new();
        let b = LoadSpecBuilder::new();
        let c = LoadSpecBuilder::new();
        a.add_load(&b).unwrap();
        b.add_load(&c).unwrap();
        assert!(c.add_load(&a).is_err());
    }

    #[test]
    fn invalid_cpu_fails_fast() {
        assert!(LoadSpecBuilder::new().cpu(150).is_err());
    }

    #[test]
    fn shared_children_stay_shared_after_build() {
        let shared = LoadSpecBuilder::new();
        shared.cpu(5).unwrap();
        let root = LoadSpecBuilder::new();
        root.add_load(&shared).unwrap().add_load(&shared).unwrap();
        let spec = root.build().unwrap();
        assert_eq!(spec.children().len(), 2);
        assert!(spec.children()[0].same_node(&spec.children()[1]));
        assert_eq!(sequence(&spec).count(), 3);
    }

    #[test]
    fn depth_limit_is_enforced() {
        let root = LoadSpecBuilder::new();
        let mut tip = root.clone();
        for _ in 0..5 {
            let next = LoadSpecBuilder::new();
            tip.add_load(&next).unwrap();
            tip = next;
        }
        assert!(root.build_with_max_depth(6).is_ok());
        assert!(matches!(
            root.build_with_max_depth(5),
            Err(SlgError::DepthExceeded { max_depth: 5 })
        ));
    }

    #[test]
    fn shared_node_reused_deeper_still_respects_depth_limit() {
        let shared = LoadSpecBuilder::new();
        shared.add_load(&LoadSpecBuilder::new()).unwrap();
        let outer = LoadSpecBuilder::new();
        let inner = LoadSpecBuilder::new();
        outer.add_load(&inner).unwrap();
        inner.add_load(&shared).unwrap();
        let root = LoadSpecBuilder::new();
        // `shared` is frozen at depth 2 first, then reached again at depth 4.
        root.add_load(&shared).unwrap().add_load(&outer).unwrap();

        assert!(matches!(
            root.build_with_max_depth(4),
            Err(SlgError::DepthExceeded { max_depth: 4 })
        ));
        let spec = root.build_with_max_depth(5).unwrap();
        assert_eq!(spec.depth(), 5);
    }
}

//! Immutable, composable load specifications.
//!
//! A [`LoadSpec`] is a tree: the node's own load runs for its duration, then
//! each child runs in order, and that whole group repeats `repetitions` times.
//! Every combinator returns a new value; nodes are shared behind `Arc` and
//! never mutated, so subtrees can be reused freely.
//!
//! Node identity matters for composition: [`LoadSpec::add_load`] refuses to
//! attach a tree that already contains the receiving node.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::errors::{Result, SlgError};
use crate::core::units::{ByteUnit, TimeUnit};
use crate::load::resources::ResourceLoad;

/// Upper bound of the CPU percentage.
pub const MAX_CPU_PCT: u32 = 100;

#[derive(Debug, Clone)]
struct LoadNode {
    duration: u64,
    time_unit: TimeUnit,
    repetitions: u32,
    cpu: u8,
    memory_bytes: u64,
    disk_input_bps: u64,
    disk_output_bps: u64,
    children: Vec<LoadSpec>,
}

impl Default for LoadNode {
    fn default() -> Self {
        Self {
            duration: 0,
            time_unit: TimeUnit::Seconds,
            repetitions: 1,
            cpu: 0,
            memory_bytes: 0,
            disk_input_bps: 0,
            disk_output_bps: 0,
            children: Vec::new(),
        }
    }
}

/// One load instruction plus its nested children.
#[derive(Clone, Default)]
pub struct LoadSpec {
    node: Arc<LoadNode>,
}

impl LoadSpec {
    /// A zero load lasting zero seconds, executed once.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn derive(&self, edit: impl FnOnce(&mut LoadNode)) -> Self {
        let mut node = (*self.node).clone();
        edit(&mut node);
        Self {
            node: Arc::new(node),
        }
    }

    /// Set how long this node's own load is held per repetition.
    pub fn lasting(&self, duration: u64, unit: TimeUnit) -> Result<Self> {
        unit.to_duration(duration)?;
        Ok(self.derive(|node| {
            node.duration = duration;
            node.time_unit = unit;
        }))
    }

    /// Set the repetition count. Zero disables the node and its children.
    #[must_use]
    pub fn repeat(&self, repetitions: u32) -> Self {
        self.derive(|node| node.repetitions = repetitions)
    }

    /// Set the CPU percentage (0..=100).
    pub fn with_cpu(&self, pct: u32) -> Result<Self> {
        let cpu = validate_cpu(pct)?;
        Ok(self.derive(|node| node.cpu = cpu))
    }

    /// Set the memory footprint.
    pub fn with_memory(&self, amount: u64, unit: ByteUnit) -> Result<Self> {
        let bytes = unit.to_bytes("memory", amount)?;
        Ok(self.derive(|node| node.memory_bytes = bytes))
    }

    /// Set the disk read rate per second.
    pub fn with_disk_input(&self, rate: u64, unit: ByteUnit) -> Result<Self> {
        let bps = unit.to_bytes("disk_input", rate)?;
        Ok(self.derive(|node| node.disk_input_bps = bps))
    }

    /// Set the disk write rate per second.
    pub fn with_disk_output(&self, rate: u64, unit: ByteUnit) -> Result<Self> {
        let bps = unit.to_bytes("disk_output", rate)?;
        Ok(self.derive(|node| node.disk_output_bps = bps))
    }

    /// Append one child, refusing compositions that would make a node its own descendant.
    pub fn add_load(&self, child: &Self) -> Result<Self> {
        self.check_composable(child)?;
        Ok(self.derive(|node| node.children.push(child.clone())))
    }

    /// Append several children in order.
    pub fn add_loads(&self, children: &[Self]) -> Result<Self> {
        for child in children {
            self.check_composable(child)?;
        }
        Ok(self.derive(|node| node.children.extend(children.iter().cloned())))
    }

    fn check_composable(&self, child: &Self) -> Result<()> {
        if child.contains(self) {
            let details = if child.same_node(self) {
                "a load cannot be added to itself".to_string()
            } else {
                "the added load already contains the receiving load".to_string()
            };
            return Err(SlgError::CyclicComposition { details });
        }
        Ok(())
    }

    /// Whether `other` is this node or any node beneath it, compared by identity.
    ///
    /// Walks the tree with an explicit stack, so arbitrarily deep trees are
    /// safe, and visits a shared subtree once.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        let mut seen = HashSet::new();
        let mut stack: Vec<&Self> = vec![self];
        while let Some(current) = stack.pop() {
            if current.same_node(other) {
                return true;
            }
            if seen.insert(current.node_id()) {
                stack.extend(current.node.children.iter());
            }
        }
        false
    }

    /// Identity comparison: true only for handles to the same node.
    #[must_use]
    pub fn same_node(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Stable identity of the underlying node, shared by all clones.
    pub(crate) fn node_id(&self) -> usize {
        Arc::as_ptr(&self.node) as usize
    }

    /// Height of the tree; a leaf has depth 1.
    ///
    /// Heights are memoised per node, so shared subtrees cost one visit.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut heights: HashMap<usize, usize> = HashMap::new();
        // (node, children_expanded)
        let mut stack: Vec<(&Self, bool)> = vec![(self, false)];
        while let Some((current, expanded)) = stack.pop() {
            let id = current.node_id();
            if heights.contains_key(&id) {
                continue;
            }
            if expanded {
                let below = current
                    .node
                    .children
                    .iter()
                    .filter_map(|child| heights.get(&child.node_id()).copied())
                    .max()
                    .unwrap_or(0);
                heights.insert(id, below + 1);
            } else {
                stack.push((current, true));
                stack.extend(current.node.children.iter().map(|child| (child, false)));
            }
        }
        heights.get(&self.node_id()).copied().unwrap_or(1)
    }

    /// Number of distinct nodes in the tree; a shared subtree counts once.
    #[must_use]
    pub fn node_count(&self) -> usize {
        let mut seen = HashSet::new();
        let mut stack: Vec<&Self> = vec![self];
        while let Some(current) = stack.pop() {
            if seen.insert(current.node_id()) {
                stack.extend(current.node.children.iter());
            }
        }
        seen.len()
    }

    #[must_use]
    pub fn duration(&self) -> u64 {
        self.node.duration
    }

    #[must_use]
    pub fn time_unit(&self) -> TimeUnit {
        self.node.time_unit
    }

    /// Hold time of one repetition of this node's own load.
    #[must_use]
    pub fn hold_duration(&self) -> Duration {
        // Validated at construction, so the multiplication cannot overflow.
        Duration::from_millis(
            self.node
                .duration
                .saturating_mul(self.node.time_unit.millis_per_unit()),
        )
    }

    #[must_use]
    pub fn repetitions(&self) -> u32 {
        self.node.repetitions
    }

    #[must_use]
    pub fn cpu(&self) -> u8 {
        self.node.cpu
    }

    #[must_use]
    pub fn memory_bytes(&self) -> u64 {
        self.node.memory_bytes
    }

    #[must_use]
    pub fn disk_input_bps(&self) -> u64 {
        self.node.disk_input_bps
    }

    #[must_use]
    pub fn disk_output_bps(&self) -> u64 {
        self.node.disk_output_bps
    }

    #[must_use]
    pub fn children(&self) -> &[Self] {
        &self.node.children
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.node.children.is_empty()
    }

    /// This node's own contribution, excluding children.
    #[must_use]
    pub fn own_load(&self) -> ResourceLoad {
        ResourceLoad {
            cpu: u64::from(self.node.cpu),
            memory_bytes: self.node.memory_bytes,
            disk_input_bps: self.node.disk_input_bps,
            disk_output_bps: self.node.disk_output_bps,
        }
    }

    fn same_own_fields(&self, other: &Self) -> bool {
        let (a, b) = (&*self.node, &*other.node);
        a.duration == b.duration
            && a.time_unit == b.time_unit
            && a.repetitions == b.repetitions
            && a.cpu == b.cpu
            && a.memory_bytes == b.memory_bytes
            && a.disk_input_bps == b.disk_input_bps
            && a.disk_output_bps == b.disk_output_bps
            && a.children.len() == b.children.len()
    }
}

/// Structural equality, walked iteratively. Each pair of nodes is compared once.
impl PartialEq for LoadSpec {
    fn eq(&self, other: &Self) -> bool {
        let mut compared = HashSet::new();
        let mut stack: Vec<(&Self, &Self)> = vec![(self, other)];
        while let Some((left, right)) = stack.pop() {
            if left.same_node(right) || !compared.insert((left.node_id(), right.node_id())) {
                continue;
            }
            if !left.same_own_fields(right) {
                return false;
            }
            stack.extend(left.node.children.iter().zip(right.node.children.iter()));
        }
        true
    }
}

impl Eq for LoadSpec {}

impl fmt::Debug for LoadSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadSpec")
            .field("duration", &self.node.duration)
            .field("time_unit", &self.node.time_unit)
            .field("repetitions", &self.node.repetitions)
            .field("cpu", &self.node.cpu)
            .field("memory_bytes", &self.node.memory_bytes)
            .field("disk_input_bps", &self.node.disk_input_bps)
            .field("disk_output_bps", &self.node.disk_output_bps)
            .field("children", &self.node.children.len())
            .finish()
    }
}

pub(crate) fn validate_cpu(pct: u32) -> Result<u8> {
    if pct > MAX_CPU_PCT {
        return Err(SlgError::validation(
            "cpu",
            format!("must be in [0, {MAX_CPU_PCT}], got {pct}"),
        ));
    }
    u8::try_from(pct).map_err(|_| SlgError::validation("cpu", format!("{pct} out of range")))
}

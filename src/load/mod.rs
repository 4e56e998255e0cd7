//! Load specifications: the immutable tree, its mutable builder, textual
//! descriptions, and flattening into executable segments.

#![allow(missing_docs)]

pub mod builder;
pub mod description;
pub mod resources;
pub mod sequencer;
pub mod spec;

pub use builder::LoadSpecBuilder;
pub use resources::ResourceLoad;
pub use sequencer::{Segment, SegmentSequence, segment_count, sequence, sequence_with_limits};
pub use spec::LoadSpec;

//! Flattening laws for arbitrary load trees.

use proptest::prelude::*;

use system_load_generator::core::units::TimeUnit;
use system_load_generator::load::sequencer::{Segment, segment_count, sequence};
use system_load_generator::load::spec::LoadSpec;

fn arb_spec() -> impl Strategy<Value = LoadSpec> {
    let leaf = (0u32..=100, 0u64..5, 0u32..4).prop_map(|(cpu, ms, reps)| {
        LoadSpec::new()
            .with_cpu(cpu)
            .unwrap()
            .lasting(ms, TimeUnit::Milliseconds)
            .unwrap()
            .repeat(reps)
    });
    leaf.prop_recursive(3, 32, 4, |inner| {
        (0u32..=100, 0u32..4, prop::collection::vec(inner, 0..4)).prop_map(
            |(cpu, reps, children)| {
                LoadSpec::new()
                    .with_cpu(cpu)
                    .unwrap()
                    .repeat(reps)
                    .add_loads(&children)
                    .unwrap()
            },
        )
    })
}

fn expected_len(spec: &LoadSpec) -> u64 {
    u64::from(spec.repetitions()) * (1 + spec.children().iter().map(expected_len).sum::<u64>())
}

fn reference_cpus(spec: &LoadSpec, out: &mut Vec<u8>) {
    for _ in 0..spec.repetitions() {
        out.push(spec.cpu());
        for child in spec.children() {
            reference_cpus(child, out);
        }
    }
}

proptest! {
    #[test]
    fn length_follows_repetition_law(spec in arb_spec()) {
        let produced = sequence(&spec).count() as u64;
        prop_assert_eq!(produced, expected_len(&spec));
        prop_assert_eq!(segment_count(&spec), Some(produced));
    }

    #[test]
    fn order_is_pre_order_per_repetition(spec in arb_spec()) {
        let mut expected = Vec::new();
        reference_cpus(&spec, &mut expected);
        let produced: Vec<u8> = sequence(&spec).map(|segment| segment.cpu).collect();
        prop_assert_eq!(produced, expected);
    }

    #[test]
    fn sequencing_is_restartable(spec in arb_spec()) {
        let first: Vec<Segment> = sequence(&spec).collect();
        let second: Vec<Segment> = sequence(&spec).collect();
        prop_assert_eq!(first, second);
    }
}

#[test]
fn repeated_leaf_yields_identical_segments() {
    let spec = LoadSpec::new()
        .lasting(5, TimeUnit::Seconds)
        .unwrap()
        .with_cpu(50)
        .unwrap()
        .repeat(3);
    let segments: Vec<Segment> = sequence(&spec).collect();
    assert_eq!(segments.len(), 3);
    assert!(segments.iter().all(|segment| *segment == segments[0]));
    assert_eq!(segments[0].cpu, 50);
    assert_eq!(segments[0].duration, 5);
    assert_eq!(segments[0].time_unit, TimeUnit::Seconds);
}

#[test]
fn root_precedes_children_in_declaration_order() {
    let a = LoadSpec::new().lasting(1, TimeUnit::Seconds).unwrap();
    let b = LoadSpec::new().lasting(2, TimeUnit::Seconds).unwrap();
    let root = LoadSpec::new()
        .lasting(3, TimeUnit::Seconds)
        .unwrap()
        .add_load(&a)
        .unwrap()
        .add_load(&b)
        .unwrap();
    let durations: Vec<u64> = sequence(&root).map(|segment| segment.duration).collect();
    assert_eq!(durations, vec![3, 1, 2]);
}

#[test]
fn zero_repetitions_prune_the_subtree() {
    let muted = LoadSpec::new()
        .with_cpu(9)
        .unwrap()
        .repeat(0)
        .add_load(&LoadSpec::new().with_cpu(8).unwrap())
        .unwrap();
    let root = LoadSpec::new().with_cpu(1).unwrap().add_load(&muted).unwrap().repeat(2);
    let cpus: Vec<u8> = sequence(&root).map(|segment| segment.cpu).collect();
    assert_eq!(cpus, vec![1, 1]);
}

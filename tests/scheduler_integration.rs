//! Executor and ledger behaviour through the public API: conservation under
//! concurrency, admission at the CPU ceiling, rollback, cancellation and
//! composition checks.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use system_load_generator::core::config::ExecutorConfig;
use system_load_generator::core::errors::{Dimension, SlgError};
use system_load_generator::core::units::TimeUnit;
use system_load_generator::engine::aggregate::{LoadAggregator, LoadSink, NullSink};
use system_load_generator::engine::executor::{ExecutionOutcome, ExecutionState, Executor};
use system_load_generator::load::builder::LoadSpecBuilder;
use system_load_generator::load::resources::ResourceLoad;
use system_load_generator::load::spec::LoadSpec;
use system_load_generator::logger::activity::{ActivityEvent, ActivityLoggerHandle};

#[derive(Default)]
struct PeakSink {
    peak_cpu: Mutex<u64>,
    pushes: Mutex<u64>,
}

impl LoadSink for PeakSink {
    fn push(&self, total: ResourceLoad) {
        let mut peak = self.peak_cpu.lock();
        *peak = (*peak).max(total.cpu);
        *self.pushes.lock() += 1;
    }
}

fn executor() -> Executor {
    Executor::with_sink(
        Arc::new(NullSink),
        &ExecutorConfig::default(),
        ActivityLoggerHandle::disabled(),
    )
}

fn cpu_leaf(cpu: u32, ms: u64) -> LoadSpec {
    LoadSpec::new()
        .with_cpu(cpu)
        .unwrap()
        .lasting(ms, TimeUnit::Milliseconds)
        .unwrap()
}

fn wait_for_cpu(exec: &Executor, cpu: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while exec.aggregate().cpu != cpu {
        assert!(Instant::now() < deadline, "aggregate never reached cpu={cpu}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn concurrent_submissions_conserve_the_aggregate() {
    let sink = Arc::new(PeakSink::default());
    let exec = Executor::with_sink(
        Arc::clone(&sink) as Arc<dyn LoadSink>,
        &ExecutorConfig::default(),
        ActivityLoggerHandle::disabled(),
    );
    // Per-submission peak is 15, six submissions: the total may never pass 90.
    let handles: Vec<_> = (0..6u32)
        .map(|i| {
            let spec = cpu_leaf(5 + i % 3 * 5, 3)
                .repeat(4)
                .add_load(&cpu_leaf(15, 2))
                .unwrap()
                .with_memory(1 + u64::from(i), system_load_generator::core::units::ByteUnit::KiB)
                .unwrap();
            exec.execute_async(&spec).unwrap()
        })
        .collect();
    for handle in handles {
        assert!(matches!(
            handle.wait().unwrap(),
            ExecutionOutcome::Completed { segments: 8 }
        ));
    }
    assert!(exec.aggregate().is_zero());
    assert!(*sink.peak_cpu.lock() <= 90);
    assert!(*sink.pushes.lock() > 0);
}

#[test]
fn admission_boundary_through_the_ledger() {
    let ledger = LoadAggregator::detached();
    let cpu = |pct| ResourceLoad {
        cpu: pct,
        ..ResourceLoad::ZERO
    };
    ledger.increase_by(&cpu(90)).unwrap();
    match ledger.increase_by(&cpu(11)) {
        Err(SlgError::Admission {
            dimension,
            attempted,
            limit,
        }) => {
            assert_eq!(dimension, Dimension::Cpu);
            assert_eq!(attempted, 101);
            assert_eq!(limit, 100);
        }
        other => panic!("expected admission error, got {other:?}"),
    }
    ledger.increase_by(&cpu(10)).unwrap();
    assert_eq!(ledger.current().cpu, 100);
    assert!(ledger.increase_by(&cpu(1)).is_err());
}

#[test]
fn failed_submission_leaves_no_partial_load() {
    let exec = executor();
    let background = exec.execute_async(&cpu_leaf(50, 30_000)).unwrap();
    wait_for_cpu(&exec, 50);
    let before = exec.aggregate();

    let siblings: Vec<LoadSpec> = [10, 20, 60, 10, 10]
        .into_iter()
        .map(|cpu| cpu_leaf(cpu, 5))
        .collect();
    let composite = LoadSpec::new().add_loads(&siblings).unwrap();
    let err = exec.execute(&composite).unwrap_err();
    assert!(matches!(
        err,
        SlgError::Admission {
            dimension: Dimension::Cpu,
            attempted: 110,
            limit: 100,
        }
    ));
    assert_eq!(exec.aggregate(), before);

    background.cancel();
    background.wait().unwrap();
    assert!(exec.aggregate().is_zero());
}

#[test]
fn cancellation_releases_the_in_flight_segment() {
    let exec = executor();
    let spec = LoadSpec::new()
        .with_cpu(25)
        .unwrap()
        .with_memory(64, system_load_generator::core::units::ByteUnit::MiB)
        .unwrap()
        .with_disk_output(10, system_load_generator::core::units::ByteUnit::MiB)
        .unwrap()
        .lasting(10, TimeUnit::Seconds)
        .unwrap();
    let handle = exec.execute_async(&spec).unwrap();
    wait_for_cpu(&exec, 25);
    thread::sleep(Duration::from_millis(100));

    let cancelled_at = Instant::now();
    handle.cancel();
    let outcome = handle.wait().unwrap();
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    assert_eq!(
        outcome,
        ExecutionOutcome::Cancelled {
            segments_completed: 0
        }
    );
    assert!(exec.aggregate().is_zero());
}

#[test]
fn cancelled_handle_ends_completed() {
    let exec = executor();
    let handle = exec.execute_async(&cpu_leaf(5, 10_000)).unwrap();
    wait_for_cpu(&exec, 5);
    handle.cancel();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(handle.state(), ExecutionState::Completed);
}

#[test]
fn segments_run_in_sequence_order() {
    let (logger, events) = ActivityLoggerHandle::detached(1024);
    let exec = Executor::with_sink(Arc::new(NullSink), &ExecutorConfig::default(), logger);
    let spec = cpu_leaf(1, 1)
        .add_load(&cpu_leaf(2, 1).repeat(2))
        .unwrap()
        .add_load(&cpu_leaf(3, 1))
        .unwrap();
    exec.execute(&spec).unwrap();

    let started: Vec<(u64, u64)> = events
        .try_iter()
        .filter_map(|event| match event {
            ActivityEvent::SegmentStarted { index, load, .. } => Some((index, load.cpu)),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![(0, 1), (1, 2), (2, 2), (3, 3)]);
}

#[test]
fn cyclic_composition_is_rejected() {
    let a = cpu_leaf(1, 1);
    assert!(matches!(
        a.add_load(&a),
        Err(SlgError::CyclicComposition { .. })
    ));
    let b = LoadSpec::new().add_load(&a).unwrap();
    assert!(matches!(
        a.add_load(&b),
        Err(SlgError::CyclicComposition { .. })
    ));

    let x = LoadSpecBuilder::new();
    let y = LoadSpecBuilder::new();
    x.add_load(&y).unwrap();
    assert!(matches!(
        y.add_load(&x),
        Err(SlgError::CyclicComposition { .. })
    ));
}

#[test]
fn blocking_execute_reports_segment_count() {
    let exec = executor();
    let spec = cpu_leaf(10, 1).repeat(3);
    assert_eq!(
        exec.execute(&spec).unwrap(),
        ExecutionOutcome::Completed { segments: 3 }
    );
}

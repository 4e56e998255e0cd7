//! Controller behaviour with real simulator threads, a mock platform and
//! scripted CPU readings. Sizes and intervals are kept tiny.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use system_load_generator::core::config::Config;
use system_load_generator::core::units::TimeUnit;
use system_load_generator::engine::controller::Controller;
use system_load_generator::engine::executor::{ExecutionOutcome, Executor};
use system_load_generator::load::resources::ResourceLoad;
use system_load_generator::load::spec::LoadSpec;
use system_load_generator::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use system_load_generator::monitor::cpu_usage::ScriptedCpuSource;
use system_load_generator::monitor::feedback::ConvergenceState;
use system_load_generator::platform::pal::{MockPlatform, Platform};
use system_load_generator::simulator::backing;

fn small_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.controller.interval_ms = 20;
    config.controller.cpu_workers = 2;
    config.controller.respawn_limit = 1;
    config.cpu.window_ms = 20;
    config.memory.chunk_bytes = 16 * 1024;
    config.disk.directory = dir.join("disk");
    config.disk.input_file_bytes = 32 * 1024;
    config.disk.output_file_bytes = 32 * 1024;
    config.disk.io_chunk_bytes = 8 * 1024;
    config
}

fn start(config: &Config, readings: &ScriptedCpuSource) -> (Controller, Receiver<ActivityEvent>) {
    let platform: Arc<dyn Platform> = Arc::new(MockPlatform::new(2));
    let (logger, events) = ActivityLoggerHandle::detached(4096);
    let controller =
        Controller::start(config, &platform, Box::new(readings.clone()), logger).unwrap();
    (controller, events)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn cpu_target(cpu: u64) -> ResourceLoad {
    ResourceLoad {
        cpu,
        ..ResourceLoad::ZERO
    }
}

#[test]
fn dead_memory_simulator_is_respawned_then_given_up() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.memory.max_bytes = 64 * 1024;
    let readings = ScriptedCpuSource::new([]);
    let (controller, events) = start(&config, &readings);

    controller.sink().push(ResourceLoad {
        memory_bytes: 1024 * 1024,
        ..ResourceLoad::ZERO
    });

    let mut seen = Vec::new();
    let gave_up = wait_until(|| {
        seen.extend(events.try_iter());
        seen.iter()
            .any(|event| matches!(event, ActivityEvent::SimulatorFailed { simulator, .. } if simulator == "memory"))
    });
    assert!(gave_up, "no SimulatorFailed event: {seen:?}");
    assert!(seen.iter().any(|event| matches!(
        event,
        ActivityEvent::SimulatorRestarted { simulator, restarts: 1, .. } if simulator == "memory"
    )));
    assert_eq!(controller.snapshot().restarts, 1);
    assert_eq!(controller.snapshot().memory_allocated, 0);
    controller.shutdown();
}

#[test]
fn given_up_memory_simulator_recovers_after_window() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.controller.respawn_window_secs = 1;
    config.memory.max_bytes = 64 * 1024;
    let readings = ScriptedCpuSource::new([]);
    let (controller, events) = start(&config, &readings);

    controller.sink().push(ResourceLoad {
        memory_bytes: 1024 * 1024,
        ..ResourceLoad::ZERO
    });
    let mut seen = Vec::new();
    assert!(wait_until(|| {
        seen.extend(events.try_iter());
        seen.iter()
            .any(|event| matches!(event, ActivityEvent::SimulatorFailed { simulator, .. } if simulator == "memory"))
    }));

    controller.sink().push(ResourceLoad {
        memory_bytes: 32 * 1024,
        ..ResourceLoad::ZERO
    });
    assert!(
        wait_until(|| controller.snapshot().memory_allocated == 32 * 1024),
        "feasible memory target never simulated: {:?}",
        controller.snapshot()
    );
    assert!(controller.snapshot().restarts >= 2);
    seen.extend(events.try_iter());
    assert!(seen.iter().any(|event| matches!(
        event,
        ActivityEvent::SimulatorRestarted { simulator, reason, .. }
            if simulator == "memory" && reason == "respawn window elapsed"
    )));
    controller.shutdown();
}

#[test]
fn memory_target_beyond_available_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    let platform: Arc<dyn Platform> = Arc::new(
        MockPlatform::new(2)
            .with_memory(1 << 30, 64 * 1024)
            .with_rss(3 * 4096),
    );
    let (logger, events) = ActivityLoggerHandle::detached(4096);
    let controller = Controller::start(
        &config,
        &platform,
        Box::new(ScriptedCpuSource::new([])),
        logger,
    )
    .unwrap();
    assert_eq!(controller.snapshot().process_rss_bytes, Some(3 * 4096));

    controller.sink().push(ResourceLoad {
        memory_bytes: 128 * 1024,
        ..ResourceLoad::ZERO
    });
    let mut seen = Vec::new();
    assert!(wait_until(|| {
        seen.extend(events.try_iter());
        seen.iter().any(|event| {
            matches!(
                event,
                ActivityEvent::MemoryPressure {
                    target_bytes: 131_072,
                    available_bytes: 65_536,
                }
            )
        })
    }));
    // Pressure is reported, not enforced.
    assert!(wait_until(|| controller.snapshot().memory_allocated == 128 * 1024));

    controller.sink().push(ResourceLoad {
        memory_bytes: 32 * 1024,
        ..ResourceLoad::ZERO
    });
    assert!(wait_until(|| controller.snapshot().memory_allocated == 32 * 1024));
    seen.extend(events.try_iter());
    let reports = seen
        .iter()
        .filter(|event| matches!(event, ActivityEvent::MemoryPressure { .. }))
        .count();
    assert_eq!(reports, 1);
    controller.shutdown();
}

#[test]
fn low_readings_nudge_workers_up() {
    let dir = tempfile::tempdir().unwrap();
    let readings = ScriptedCpuSource::new([10.0]);
    let (controller, events) = start(&small_config(dir.path()), &readings);

    controller.sink().push(cpu_target(30));
    assert!(wait_until(|| controller.snapshot().setpoints.iter().all(|pct| *pct > 30)));
    let adjusted = events.try_iter().find_map(|event| match event {
        ActivityEvent::ControllerAdjusted {
            desired_cpu,
            direction,
            ..
        } => Some((desired_cpu, direction)),
        _ => None,
    });
    assert_eq!(adjusted, Some((30, 1)));
    controller.sink().push(ResourceLoad::ZERO);
    assert!(wait_until(|| controller.snapshot().setpoints == vec![0, 0]));
    controller.shutdown();
}

#[test]
fn high_readings_nudge_workers_down() {
    let dir = tempfile::tempdir().unwrap();
    let readings = ScriptedCpuSource::new([90.0]);
    let (controller, _events) = start(&small_config(dir.path()), &readings);

    controller.sink().push(cpu_target(30));
    assert!(wait_until(|| controller.snapshot().setpoints.iter().all(|pct| *pct < 30)));
    controller.shutdown();
}

#[test]
fn matching_readings_converge() {
    let dir = tempfile::tempdir().unwrap();
    let readings = ScriptedCpuSource::new([20.0]);
    let (controller, _events) = start(&small_config(dir.path()), &readings);

    controller.sink().push(cpu_target(20));
    assert!(wait_until(|| controller.snapshot().convergence == ConvergenceState::Converged));
    assert_eq!(controller.snapshot().setpoints, vec![20, 20]);
    controller.shutdown();
}

#[test]
fn disk_input_provisions_and_reads_backing_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    let (controller, _events) = start(&config, &ScriptedCpuSource::new([]));

    controller.sink().push(ResourceLoad {
        disk_input_bps: 48 * 1024,
        ..ResourceLoad::ZERO
    });
    assert!(wait_until(|| controller.snapshot().disk_read_bytes >= 48 * 1024));
    let backing_file = backing::input_path(&config.disk);
    assert_eq!(std::fs::metadata(backing_file).unwrap().len(), 32 * 1024);
    controller.shutdown();
}

#[test]
fn executor_drives_controller_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    let (controller, _events) = start(&config, &ScriptedCpuSource::new([]));
    let executor = Executor::with_controller(
        controller,
        &config.executor,
        ActivityLoggerHandle::disabled(),
    );

    let spec = LoadSpec::new()
        .with_memory(256, system_load_generator::core::units::ByteUnit::KiB)
        .unwrap()
        .lasting(400, TimeUnit::Milliseconds)
        .unwrap();
    let handle = executor.execute_async(&spec).unwrap();
    assert!(wait_until(|| executor
        .controller_snapshot()
        .is_some_and(|snapshot| snapshot.memory_allocated == 256 * 1024)));
    assert_eq!(
        handle.wait().unwrap(),
        ExecutionOutcome::Completed { segments: 1 }
    );
    assert!(wait_until(|| executor
        .controller_snapshot()
        .is_some_and(|snapshot| snapshot.memory_allocated == 0)));
    executor.shutdown();
    assert!(executor.controller_snapshot().is_none());
}

use layerstream::config::{Config, SyntheticConfig};
use layerstream::error::ErrorKind;
use layerstream::hardware::plc::SimulatedPlc;
use layerstream::hardware::simulated::{ScannerEvent, ScannerJournal, SimulatedBehavior, SimulatedScannerFactory};
use layerstream::slice_file::{SliceFile, write_slice_file};
use layerstream::synthetic::{HATCH_TAG, OUTLINE_TAG, SyntheticSource};
use layerstream::{RunOutcome, StreamError, StreamOrchestrator};
use layerstream_shared::{BuildStyle, ControllerTag, GeometrySource, LaserMode, ProcessMode, RunState, StyleMap};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.scanner.status_poll_interval_ms = 1;
    config.controller.ready_timeout_ms = 100;
    config.controller.ready_poll_interval_ms = 5;
    config.handshake.poll_interval_ms = 2;
    config
}

fn orchestrator(
    config: Config,
    behavior: SimulatedBehavior,
    plc: Arc<SimulatedPlc>,
) -> (StreamOrchestrator, ScannerJournal) {
    let factory = SimulatedScannerFactory::with_behavior(behavior);
    let journal = factory.journal();
    let orchestrator = StreamOrchestrator::new(config, Arc::new(factory), plc).unwrap();
    (orchestrator, journal)
}

fn production_styles() -> StyleMap {
    let style = |id, power| BuildStyle {
        id,
        laser_power_w: power,
        mark_speed: 1000.0,
        jump_speed: 5000.0,
        mode: LaserMode::Continuous,
        focus_offset_mm: 0.0,
    };
    let mut styles = StyleMap::with_fallback(style(0, 100.0));
    styles.insert(style(OUTLINE_TAG, 150.0)).unwrap();
    styles.insert(style(HATCH_TAG, 250.0)).unwrap();
    styles
}

fn source(layers: u32) -> Box<dyn GeometrySource> {
    Box::new(SyntheticSource::new(0.03, layers, SyntheticConfig::default()))
}

fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

fn assert_laser_left_off(journal: &ScannerJournal) {
    let events = journal.events();
    let last_off = events.iter().rposition(|e| *e == ScannerEvent::LaserDisabled);
    let last_on = events.iter().rposition(|e| *e == ScannerEvent::LaserEnabled);
    assert!(last_off.is_some());
    assert!(last_on < last_off);
    assert_eq!(events.last(), Some(&ScannerEvent::Closed));
}

#[test]
fn test_synthetic_run_completes() {
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO));
    let (mut orchestrator, journal) = orchestrator(fast_config(), SimulatedBehavior::default(), plc.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        orchestrator.on_progress(move |done, total| seen.lock().unwrap().push((done, total)));
    }

    let id = orchestrator.start_synthetic(0.03, 3).unwrap();
    assert_eq!(orchestrator.run_id(), Some(id));
    let summary = orchestrator.wait().unwrap();

    assert_eq!(summary.run_id, id);
    assert_eq!(summary.mode, ProcessMode::Test);
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!((summary.layers_done, summary.layers_total), (3, 3));
    assert_eq!(summary.queue.produced, 3);
    assert_eq!(summary.queue.consumed, 3);
    assert_eq!(summary.queue.max_depth, 1);
    assert_eq!(summary.commands_executed, journal.executed_commands() as u64);
    assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);

    assert_eq!(orchestrator.state(), RunState::Idle);
    assert_eq!(orchestrator.run_id(), None);
    assert!(orchestrator.last_error().is_none());
    // Test runs never touch the controller and never arm the laser
    assert!(plc.writes().is_empty());
    assert_eq!(journal.count(|e| *e == ScannerEvent::LaserEnabled), 0);
    assert!(journal.errors().is_empty());
    assert_laser_left_off(&journal);
}

#[test]
fn test_production_run_from_slice_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("part.slices");
    let generator = SyntheticSource::new(0.03, 3, SyntheticConfig::default());
    let layers: Vec<_> = (0..3).map(|i| generator.layer(i)).collect();
    write_slice_file(&path, &layers).unwrap();

    let plc = Arc::new(SimulatedPlc::new(Duration::from_millis(5)));
    let (mut orchestrator, journal) = orchestrator(fast_config(), SimulatedBehavior::default(), plc.clone());
    let source = SliceFile::open(&path).unwrap();
    orchestrator.start(Box::new(source), Arc::new(production_styles())).unwrap();
    let summary = orchestrator.wait().unwrap();

    assert_eq!(summary.mode, ProcessMode::Production);
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.layers_done, 3);
    assert_eq!(plc.requests(), 3);
    assert_eq!(plc.layers_prepared(), 3);
    assert_eq!(plc.int_value(ControllerTag::LayStackCount), Some(1));
    assert_eq!(plc.int_value(ControllerTag::StepSource), Some(60));
    assert_eq!(plc.int_value(ControllerTag::StepSink), Some(30));
    assert_eq!(plc.bool_value(ControllerTag::LaySurfaceRequest), Some(false));

    assert_eq!(journal.count(|e| *e == ScannerEvent::LaserEnabled), 3);
    assert!(journal.count(|e| matches!(e, ScannerEvent::AnalogOut { value, .. } if *value > 0)) > 0);
    assert_laser_left_off(&journal);
}

#[test]
fn test_layer_waits_for_prepared_surface() {
    let plc = Arc::new(SimulatedPlc::new(Duration::from_millis(60)));
    let (mut orchestrator, journal) = orchestrator(fast_config(), SimulatedBehavior::default(), plc.clone());
    orchestrator.start(source(1), Arc::new(production_styles())).unwrap();

    wait_until("layer request", Duration::from_secs(5), || plc.requests() == 1);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(journal.count(|e| matches!(e, ScannerEvent::Executed { .. })), 0);

    let summary = orchestrator.wait().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(journal.count(|e| matches!(e, ScannerEvent::Executed { .. })) > 0);
}

#[test]
fn test_prepared_timeout_fails_run_without_scanning() {
    let mut config = fast_config();
    config.handshake.prepared_timeout_ms = 50;
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO));
    plc.set_never_prepare(true);
    let (mut orchestrator, journal) = orchestrator(config, SimulatedBehavior::default(), plc.clone());

    orchestrator.start(source(3), Arc::new(production_styles())).unwrap();
    let summary = orchestrator.wait().unwrap();

    let RunOutcome::Failed(failure) = &summary.outcome else {
        panic!("expected failure, got {:?}", summary.outcome);
    };
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert_eq!(failure.layer, Some(0));
    assert_eq!(summary.layers_done, 0);
    assert_eq!(orchestrator.last_error(), Some(failure));
    assert_eq!(orchestrator.state(), RunState::Idle);

    assert_eq!(journal.count(|e| matches!(e, ScannerEvent::Executed { .. })), 0);
    assert_eq!(journal.count(|e| *e == ScannerEvent::LaserEnabled), 0);
    assert_eq!(plc.requests(), 1);
    // The unserved request is withdrawn
    assert_eq!(plc.bool_value(ControllerTag::LaySurfaceRequest), Some(false));
}

#[test]
fn test_link_loss_mid_run_fails_run() {
    let plc = Arc::new(SimulatedPlc::new(Duration::from_millis(200)));
    let (mut orchestrator, journal) = orchestrator(fast_config(), SimulatedBehavior::default(), plc.clone());
    orchestrator.start(source(3), Arc::new(production_styles())).unwrap();

    wait_until("layer request", Duration::from_secs(5), || plc.requests() == 1);
    plc.drop_link("cable unplugged");
    let summary = orchestrator.wait().unwrap();

    let RunOutcome::Failed(failure) = &summary.outcome else {
        panic!("expected failure, got {:?}", summary.outcome);
    };
    assert_eq!(failure.kind, ErrorKind::LinkLost);
    assert_eq!(failure.layer, Some(0));
    assert_laser_left_off(&journal);
}

#[test]
fn test_emergency_stop_during_execution() {
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO));
    let behavior = SimulatedBehavior { hang: true, ..SimulatedBehavior::default() };
    let (mut orchestrator, journal) = orchestrator(fast_config(), behavior, plc.clone());
    orchestrator.start_synthetic(0.03, 5).unwrap();

    wait_until("list execution", Duration::from_secs(5), || {
        journal.count(|e| matches!(e, ScannerEvent::Executed { .. })) > 0
    });
    let started = Instant::now();
    let summary = orchestrator.emergency_stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(summary.outcome, RunOutcome::EmergencyStopped);
    assert_eq!(summary.layers_done, 0);
    assert_eq!(orchestrator.state(), RunState::EmergencyStopped);
    assert_eq!(orchestrator.run_id(), None);
    assert_eq!(plc.bool_value(ControllerTag::EmergencyStop), Some(true));

    // Power zeroed and laser off before the device was released
    let events = journal.events();
    let executed = events.iter().position(|e| matches!(e, ScannerEvent::Executed { .. })).unwrap();
    let zeroed = events
        .iter()
        .enumerate()
        .skip(executed)
        .position(|(_, e)| matches!(e, ScannerEvent::AnalogOut { value: 0, .. }));
    assert!(zeroed.is_some());
    assert_laser_left_off(&journal);

    // No new run until the operator acknowledges
    assert!(matches!(orchestrator.start_synthetic(0.03, 1), Err(StreamError::InvalidInput(_))));
    orchestrator.reset().unwrap();
    assert_eq!(orchestrator.state(), RunState::Idle);
    assert_eq!(plc.bool_value(ControllerTag::EmergencyStop), Some(false));
}

#[test]
fn test_emergency_stop_without_run() {
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO));
    let (mut orchestrator, _journal) = orchestrator(fast_config(), SimulatedBehavior::default(), plc.clone());
    assert!(orchestrator.emergency_stop().is_none());
    assert_eq!(orchestrator.state(), RunState::EmergencyStopped);
    assert_eq!(plc.bool_value(ControllerTag::EmergencyStop), Some(true));
    orchestrator.reset().unwrap();
    assert!(orchestrator.reset().is_err());
}

#[test]
fn test_stop_during_handshake_wait() {
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO));
    plc.set_never_prepare(true);
    let (mut orchestrator, journal) = orchestrator(fast_config(), SimulatedBehavior::default(), plc.clone());
    orchestrator.start(source(3), Arc::new(production_styles())).unwrap();

    wait_until("layer request", Duration::from_secs(5), || plc.requests() == 1);
    let started = Instant::now();
    let summary = orchestrator.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.layers_done, 0);
    assert!(summary.queue.produced <= summary.queue.requested);
    assert_eq!(orchestrator.state(), RunState::Idle);
    assert!(orchestrator.last_error().is_none());
    assert_eq!(journal.count(|e| matches!(e, ScannerEvent::Executed { .. })), 0);
    assert_eq!(journal.events().last(), Some(&ScannerEvent::Closed));
    assert_eq!(plc.bool_value(ControllerTag::LaySurfaceRequest), Some(false));
}

#[test]
fn test_pause_holds_between_layers() {
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO));
    let behavior = SimulatedBehavior {
        per_command: Duration::from_micros(200),
        ..SimulatedBehavior::default()
    };
    let (mut orchestrator, _journal) = orchestrator(fast_config(), behavior, plc);
    orchestrator.start_synthetic(0.03, 20).unwrap();
    orchestrator.pause().unwrap();
    assert_eq!(orchestrator.state(), RunState::Paused);
    assert!(orchestrator.pause().is_err());

    thread::sleep(Duration::from_millis(50));
    assert!(orchestrator.poll().is_none());
    let held = orchestrator.progress().unwrap().0;
    thread::sleep(Duration::from_millis(100));
    assert!(orchestrator.poll().is_none());
    assert_eq!(orchestrator.progress(), Some((held, 20)));
    assert!(held < 20);

    orchestrator.resume().unwrap();
    assert_eq!(orchestrator.state(), RunState::Running);
    let summary = orchestrator.wait().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.layers_done, 20);
}

#[test]
fn test_stop_while_paused() {
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO));
    let (mut orchestrator, journal) = orchestrator(fast_config(), SimulatedBehavior::default(), plc);
    orchestrator.start_synthetic(0.03, 50).unwrap();
    orchestrator.pause().unwrap();
    thread::sleep(Duration::from_millis(30));

    let started = Instant::now();
    let summary = orchestrator.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert!(summary.layers_done < 50);
    assert_eq!(orchestrator.state(), RunState::Idle);
    assert_eq!(journal.events().last(), Some(&ScannerEvent::Closed));
}

#[test]
fn test_requested_stop_leaves_emergency_stop_available() {
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO));
    let behavior = SimulatedBehavior { hang: true, ..SimulatedBehavior::default() };
    let mut config = fast_config();
    config.scanner.completion_timeout_ms = 5000;
    let (mut orchestrator, journal) = orchestrator(config, behavior, plc);
    orchestrator.start_synthetic(0.03, 5).unwrap();

    wait_until("list execution", Duration::from_secs(5), || {
        journal.count(|e| matches!(e, ScannerEvent::Executed { .. })) > 0
    });
    let started = Instant::now();
    assert!(orchestrator.request_stop());
    assert!(started.elapsed() < Duration::from_millis(500));
    // The wedged layer keeps the run alive
    thread::sleep(Duration::from_millis(50));
    assert!(orchestrator.poll().is_none());
    assert!(orchestrator.run_id().is_some());

    let summary = orchestrator.emergency_stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(summary.outcome, RunOutcome::EmergencyStopped);
    assert_laser_left_off(&journal);
    assert!(!orchestrator.request_stop());
}

#[test]
fn test_start_rejected_while_running() {
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO));
    let behavior = SimulatedBehavior { hang: true, ..SimulatedBehavior::default() };
    let (mut orchestrator, _journal) = orchestrator(fast_config(), behavior, plc);
    orchestrator.start_synthetic(0.03, 2).unwrap();

    let err = orchestrator.start_synthetic(0.03, 2).unwrap_err();
    assert!(matches!(err, StreamError::AlreadyRunning(RunState::Running)));
    assert_eq!(err.kind(), ErrorKind::Invalid);

    let summary = orchestrator.emergency_stop().unwrap();
    assert_eq!(summary.outcome, RunOutcome::EmergencyStopped);
}

#[test]
fn test_link_not_ready_refuses_start() {
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO).offline());
    let (mut orchestrator, journal) = orchestrator(fast_config(), SimulatedBehavior::default(), plc);

    let started = Instant::now();
    let err = orchestrator.start(source(2), Arc::new(production_styles())).unwrap_err();
    assert!(matches!(err, StreamError::LinkNotReady(_)));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(orchestrator.state(), RunState::Idle);
    assert_eq!(orchestrator.run_id(), None);
    assert!(journal.events().is_empty());
}

#[test]
fn test_link_ready_after_delay_starts() {
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO).with_ready_delay(Duration::from_millis(30)));
    let (mut orchestrator, _journal) = orchestrator(fast_config(), SimulatedBehavior::default(), plc);
    orchestrator.start(source(1), Arc::new(production_styles())).unwrap();
    assert_eq!(orchestrator.wait().unwrap().outcome, RunOutcome::Completed);
}

#[test]
fn test_invalid_inputs_are_rejected_before_launch() {
    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO));
    let (mut orchestrator, journal) = orchestrator(fast_config(), SimulatedBehavior::default(), plc);

    assert!(matches!(orchestrator.start_synthetic(0.0, 3), Err(StreamError::InvalidInput(_))));
    assert!(matches!(orchestrator.start_synthetic(0.03, 0), Err(StreamError::InvalidInput(_))));
    assert!(matches!(
        orchestrator.start(source(0), Arc::new(production_styles())),
        Err(StreamError::InvalidInput(_))
    ));
    assert!(matches!(
        orchestrator.start(source(2), Arc::new(StyleMap::new())),
        Err(StreamError::InvalidInput(_))
    ));
    assert_eq!(orchestrator.state(), RunState::Idle);
    assert!(journal.events().is_empty());
}

#[test]
fn test_truncated_slice_file_fails_run() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("short.slices");
    let generator = SyntheticSource::new(0.03, 1, SyntheticConfig::default());
    write_slice_file(&path, &[generator.layer(0)]).unwrap();
    // Claim more layers than the file holds
    let text = std::fs::read_to_string(&path).unwrap();
    let text = text.replacen("\"layer_count\":1", "\"layer_count\":3", 1);
    std::fs::write(&path, text).unwrap();

    let plc = Arc::new(SimulatedPlc::new(Duration::ZERO));
    let (mut orchestrator, _journal) = orchestrator(fast_config(), SimulatedBehavior::default(), plc);
    orchestrator.start(Box::new(SliceFile::open(&path).unwrap()), Arc::new(production_styles())).unwrap();
    let summary = orchestrator.wait().unwrap();

    let RunOutcome::Failed(failure) = &summary.outcome else {
        panic!("expected failure, got {:?}", summary.outcome);
    };
    assert_eq!(failure.kind, ErrorKind::Input);
    assert_eq!(failure.layer, Some(1));
    assert_eq!(summary.layers_done, 1);
}

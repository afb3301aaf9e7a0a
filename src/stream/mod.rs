//! Run lifecycle: owns the producer and consumer threads and wires the queue,
//! the scanner session and the controller handshake together.
//!
//! The orchestrator lives on the control thread. Workers never touch its
//! state; they report through a [`StreamEvent`] channel that [`StreamOrchestrator::poll`]
//! and [`StreamOrchestrator::wait`] drain.

pub mod control;
mod consumer;
mod producer;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use layerstream_shared::{
    ControllerLink, ControllerTag, FALLBACK_STYLE_TAG, GeometrySource, ProcessMode, RunState,
    RunStateError, StyleTable,
};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::Config;
use crate::converter::LayerConverter;
use crate::error::{ErrorKind, StreamError};
use crate::handshake::HandshakeCoordinator;
use crate::hardware::{BlockReport, ScannerFactory};
use crate::queue::{LayerQueue, QueueStats, SINGLE_PIECE_CAPACITY};
use crate::synthetic::{SyntheticSource, test_styles};

use consumer::Consumer;
use control::RunControl;
use producer::Producer;

/// Worker -> control thread notifications.
#[derive(Debug)]
pub enum StreamEvent {
    LayerProduced { layer: u32 },
    LayerStarted { layer: u32 },
    LayerCompleted { layer: u32, report: BlockReport, duration: Duration },
    ProducerFinished { layers: u32 },
    ConsumerFinished { layers: u32 },
    Failed { worker: &'static str, error: StreamError },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub layer: Option<u32>,
    pub message: String,
}

impl RunFailure {
    fn from_error(error: &StreamError) -> Self {
        Self {
            kind: error.kind(),
            layer: error.layer(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    Completed,
    Stopped,
    EmergencyStopped,
    Failed(RunFailure),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: ProcessMode,
    pub outcome: RunOutcome,
    pub layers_total: u32,
    pub layers_done: u32,
    pub commands_executed: u64,
    pub batches_executed: u64,
    pub queue: QueueStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

type ProgressCallback = Box<dyn FnMut(u32, u32) + Send>;

/// Sets the run's flags and wakes every wait point, from any thread. Does not
/// join the workers; the orchestrator does that when it next polls.
#[derive(Clone)]
pub struct StopHandle {
    control: Arc<RunControl>,
    queue: Arc<LayerQueue>,
    handshake: Option<Arc<HandshakeCoordinator>>,
    link: Arc<dyn ControllerLink>,
}

impl StopHandle {
    fn wake(&self) {
        self.queue.wake_all();
        if let Some(handshake) = &self.handshake {
            handshake.wake();
        }
    }

    pub fn stop(&self) {
        tracing::info!("Stop requested");
        self.control.request_stop();
        self.wake();
    }

    pub fn emergency_stop(&self) {
        tracing::warn!("Emergency stop requested");
        self.control.request_emergency();
        self.wake();
        if let Err(e) = self.link.write_bool(ControllerTag::EmergencyStop, true) {
            tracing::error!("Failed to signal emergency stop to controller: {}", e);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

struct ActiveRun {
    id: Uuid,
    mode: ProcessMode,
    handle: StopHandle,
    events: Receiver<StreamEvent>,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    layers_total: u32,
    layers_done: u32,
    commands_executed: u64,
    batches_executed: u64,
    started_at: DateTime<Utc>,
    failure: Option<RunFailure>,
}

impl ActiveRun {
    fn workers_finished(&self) -> bool {
        let done = |h: &Option<JoinHandle<()>>| h.as_ref().is_none_or(|h| h.is_finished());
        done(&self.producer) && done(&self.consumer)
    }

    fn handle_event(&mut self, event: StreamEvent, progress: &mut Option<ProgressCallback>) {
        match event {
            StreamEvent::LayerProduced { layer } => tracing::trace!("Layer {} converted", layer),
            StreamEvent::LayerStarted { layer } => tracing::debug!("Layer {} started", layer),
            StreamEvent::LayerCompleted { report, .. } => {
                self.layers_done += 1;
                self.commands_executed += report.commands as u64;
                self.batches_executed += report.batches as u64;
                if let Some(progress) = progress.as_mut() {
                    progress(self.layers_done, self.layers_total);
                }
            }
            StreamEvent::ProducerFinished { layers } => {
                tracing::debug!("Producer reported {} layers", layers)
            }
            StreamEvent::ConsumerFinished { layers } => {
                tracing::debug!("Consumer reported {} layers", layers)
            }
            StreamEvent::Failed { worker, error } => {
                if error.is_cancellation() {
                    return;
                }
                tracing::error!("Run {} failed in {}: {}", self.id, worker, error);
                if self.failure.is_none() {
                    self.failure = Some(RunFailure::from_error(&error));
                }
                // Same shutdown path as an operator stop
                if !self.handle.is_cancelled() {
                    self.handle.stop();
                }
            }
        }
    }

    fn join(&mut self) {
        for (name, handle) in [("producer", self.producer.take()), ("consumer", self.consumer.take())] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::error!("Worker thread '{}' panicked", name);
                    let error = StreamError::WorkerPanicked(name);
                    self.failure.get_or_insert_with(|| RunFailure::from_error(&error));
                }
            }
        }
    }
}

pub struct StreamOrchestrator {
    config: Config,
    scanner: Arc<dyn ScannerFactory>,
    link: Arc<dyn ControllerLink>,
    state: RunState,
    run: Option<ActiveRun>,
    progress: Option<ProgressCallback>,
    last_error: Option<RunFailure>,
    last_summary: Option<RunSummary>,
}

impl StreamOrchestrator {
    pub fn new(
        config: Config,
        scanner: Arc<dyn ScannerFactory>,
        link: Arc<dyn ControllerLink>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self {
            config,
            scanner,
            link,
            state: RunState::Idle,
            run: None,
            progress: None,
            last_error: None,
            last_summary: None,
        })
    }

    /// Called with `(layers_done, layers_total)` after every completed layer.
    pub fn on_progress(&mut self, callback: impl FnMut(u32, u32) + Send + 'static) {
        self.progress = Some(Box::new(callback));
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn last_error(&self) -> Option<&RunFailure> {
        self.last_error.as_ref()
    }

    pub fn last_summary(&self) -> Option<&RunSummary> {
        self.last_summary.as_ref()
    }

    pub fn run_id(&self) -> Option<Uuid> {
        self.run.as_ref().map(|r| r.id)
    }

    /// `(layers_done, layers_total)` of the active run.
    pub fn progress(&self) -> Option<(u32, u32)> {
        self.run.as_ref().map(|r| (r.layers_done, r.layers_total))
    }

    pub fn queue_stats(&self) -> Option<QueueStats> {
        self.run.as_ref().map(|r| r.handle.queue.stats())
    }

    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.run.as_ref().map(|r| r.handle.clone())
    }

    /// Push delivery of the controller's "surface prepared" signal.
    pub fn notify_surface_prepared(&self) {
        if let Some(handshake) = self.run.as_ref().and_then(|r| r.handle.handshake.as_ref()) {
            handshake.notify_prepared();
        }
    }

    /// Production run from a geometry source. Fails without spawning anything
    /// if a run is active, the inputs are unusable or the controller is not
    /// ready in time.
    pub fn start(
        &mut self,
        source: Box<dyn GeometrySource>,
        styles: Arc<dyn StyleTable>,
    ) -> Result<Uuid, StreamError> {
        self.ensure_idle()?;
        if source.total_count() == 0 || !source.has_next() {
            return Err(StreamError::InvalidInput("geometry source contains no layers".to_string()));
        }
        if styles.lookup(FALLBACK_STYLE_TAG).is_none() {
            return Err(StreamError::InvalidInput(format!(
                "style table has no fallback style (tag {})",
                FALLBACK_STYLE_TAG
            )));
        }
        self.wait_for_link()?;
        self.launch(ProcessMode::Production, source, styles)
    }

    /// Test run over generated square layers; no controller involved and the
    /// laser is held at zero power.
    pub fn start_synthetic(&mut self, thickness: f64, count: u32) -> Result<Uuid, StreamError> {
        self.ensure_idle()?;
        if !(thickness.is_finite() && thickness > 0.0) {
            return Err(StreamError::InvalidInput(format!("layer thickness must be > 0, got {}", thickness)));
        }
        if count == 0 {
            return Err(StreamError::InvalidInput("layer count must be > 0".to_string()));
        }
        let source = SyntheticSource::new(thickness, count, self.config.synthetic.clone());
        let styles = Arc::new(test_styles(&self.config.synthetic));
        self.launch(ProcessMode::Test, Box::new(source), styles)
    }

    fn ensure_idle(&self) -> Result<(), StreamError> {
        if self.run.is_some() || self.state.is_active() {
            return Err(StreamError::AlreadyRunning(self.state));
        }
        if !self.state.can_transition_to(RunState::Starting) {
            return Err(StreamError::InvalidInput(format!(
                "cannot start from state {:?}; reset first",
                self.state
            )));
        }
        Ok(())
    }

    fn wait_for_link(&self) -> Result<(), StreamError> {
        let timeout = self.config.controller.ready_timeout();
        let deadline = Instant::now() + timeout;
        while !self.link.is_ready() {
            if Instant::now() >= deadline {
                tracing::error!("Controller link not ready after {:?}", timeout);
                return Err(StreamError::LinkNotReady(timeout));
            }
            thread::sleep(self.config.controller.ready_poll_interval());
        }
        Ok(())
    }

    fn launch(
        &mut self,
        mode: ProcessMode,
        source: Box<dyn GeometrySource>,
        styles: Arc<dyn StyleTable>,
    ) -> Result<Uuid, StreamError> {
        self.state.transition(RunState::Starting)?;
        let id = Uuid::new_v4();
        let layers_total = source.total_count();
        tracing::info!("Starting {:?} run {} ({} layers)", mode, id, layers_total);

        let control = Arc::new(RunControl::new());
        let queue = Arc::new(LayerQueue::new(SINGLE_PIECE_CAPACITY, control.clone()));
        let handshake = mode.uses_handshake().then(|| {
            Arc::new(HandshakeCoordinator::new(
                self.link.clone(),
                self.config.handshake.clone(),
                control.clone(),
            ))
        });
        let handle = StopHandle {
            control: control.clone(),
            queue: queue.clone(),
            handshake: handshake.clone(),
            link: self.link.clone(),
        };
        let (tx, rx) = unbounded();

        let consumer = Consumer {
            run_id: id,
            mode,
            scanner: self.config.scanner.clone(),
            factory: self.scanner.clone(),
            queue: queue.clone(),
            control: control.clone(),
            handshake,
            events: tx.clone(),
        };
        let producer = Producer {
            run_id: id,
            source,
            styles,
            converter: LayerConverter::from_scanner(&self.config.scanner),
            queue,
            control,
            events: tx,
        };

        let consumer = match thread::Builder::new()
            .name("layer-consumer".to_string())
            .spawn(move || consumer.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.state.transition(RunState::Idle)?;
                return Err(StreamError::Spawn(e.to_string()));
            }
        };
        let producer = match thread::Builder::new()
            .name("layer-producer".to_string())
            .spawn(move || producer.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                handle.stop();
                if consumer.join().is_err() {
                    tracing::error!("Consumer panicked while aborting start");
                }
                self.state.transition(RunState::Idle)?;
                return Err(StreamError::Spawn(e.to_string()));
            }
        };

        self.run = Some(ActiveRun {
            id,
            mode,
            handle,
            events: rx,
            producer: Some(producer),
            consumer: Some(consumer),
            layers_total,
            layers_done: 0,
            commands_executed: 0,
            batches_executed: 0,
            started_at: Utc::now(),
            failure: None,
        });
        self.last_error = None;
        self.state.transition(RunState::Running)?;
        Ok(id)
    }

    fn drain_events(&mut self) {
        if let Some(run) = self.run.as_mut() {
            for event in run.events.try_iter().collect::<Vec<_>>() {
                run.handle_event(event, &mut self.progress);
            }
        }
    }

    /// Processes pending worker events without blocking. Returns the summary
    /// once the run has ended.
    pub fn poll(&mut self) -> Option<RunSummary> {
        self.drain_events();
        let finished = self.run.as_ref().is_some_and(|r| r.workers_finished());
        if finished { self.finish() } else { None }
    }

    /// Blocks until the run ends.
    pub fn wait(&mut self) -> Option<RunSummary> {
        loop {
            let received = match &self.run {
                Some(run) => run.events.recv_timeout(Duration::from_millis(20)),
                None => return None,
            };
            match received {
                Ok(event) => {
                    if let Some(run) = self.run.as_mut() {
                        run.handle_event(event, &mut self.progress);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
            if let Some(summary) = self.poll() {
                return Some(summary);
            }
        }
    }

    /// Orderly stop: workers finish what they are doing, release the scanner
    /// and are joined before this returns.
    pub fn stop(&mut self) -> Option<RunSummary> {
        let handle = self.run.as_ref()?.handle.clone();
        handle.stop();
        self.finish()
    }

    /// Orderly stop without joining: returns at once and the run ends through
    /// [`poll`](Self::poll) or [`wait`](Self::wait). An emergency stop is still
    /// accepted while the current layer drains. False when no run is active.
    pub fn request_stop(&self) -> bool {
        match &self.run {
            Some(run) => {
                run.handle.stop();
                true
            }
            None => false,
        }
    }

    /// Immediate stop: laser off within one status poll, controller told to
    /// halt, workers joined. Valid from any state.
    pub fn emergency_stop(&mut self) -> Option<RunSummary> {
        match self.run.as_ref().map(|r| r.handle.clone()) {
            Some(handle) => {
                handle.emergency_stop();
                self.finish()
            }
            None => {
                tracing::warn!("Emergency stop requested with no active run");
                if let Err(e) = self.link.write_bool(ControllerTag::EmergencyStop, true) {
                    tracing::error!("Failed to signal emergency stop to controller: {}", e);
                }
                self.set_state(RunState::EmergencyStopped);
                None
            }
        }
    }

    pub fn pause(&mut self) -> Result<(), StreamError> {
        let run = self.run.as_ref().ok_or_else(|| StreamError::InvalidInput("no active run".to_string()))?;
        self.state.transition(RunState::Paused)?;
        run.handle.control.set_paused(true);
        tracing::info!("Run paused; the current layer finishes first");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), StreamError> {
        let run = self.run.as_ref().ok_or_else(|| StreamError::InvalidInput("no active run".to_string()))?;
        self.state.transition(RunState::Running)?;
        run.handle.control.set_paused(false);
        tracing::info!("Run resumed");
        Ok(())
    }

    /// Operator acknowledgement after an emergency stop.
    pub fn reset(&mut self) -> Result<(), StreamError> {
        if self.state != RunState::EmergencyStopped {
            return Err(StreamError::State(RunStateError::InvalidTransition {
                from: self.state,
                to: RunState::Idle,
            }));
        }
        if let Err(e) = self.link.write_bool(ControllerTag::EmergencyStop, false) {
            tracing::warn!("Could not clear controller emergency stop: {}", e);
        }
        self.state.transition(RunState::Idle)?;
        tracing::info!("Emergency stop acknowledged");
        Ok(())
    }

    fn set_state(&mut self, to: RunState) {
        if let Err(e) = self.state.transition(to) {
            tracing::warn!("{}", e);
        }
    }

    /// Joins the workers, drains what they left in the channel and records
    /// the terminal state.
    fn finish(&mut self) -> Option<RunSummary> {
        let mut run = self.run.take()?;
        run.join();
        for event in run.events.try_iter().collect::<Vec<_>>() {
            run.handle_event(event, &mut self.progress);
        }

        let control = &run.handle.control;
        let outcome = if control.is_emergency() {
            RunOutcome::EmergencyStopped
        } else if let Some(failure) = run.failure.clone() {
            RunOutcome::Failed(failure)
        } else if run.layers_done >= run.layers_total {
            RunOutcome::Completed
        } else {
            RunOutcome::Stopped
        };

        match &outcome {
            RunOutcome::EmergencyStopped => self.set_state(RunState::EmergencyStopped),
            _ => self.set_state(RunState::Idle),
        }
        if let RunOutcome::Failed(failure) = &outcome {
            tracing::error!("Run {} failed: {}", run.id, failure.message);
            self.last_error = Some(failure.clone());
        } else {
            tracing::info!(
                "Run {} ended {:?}: {}/{} layers",
                run.id,
                outcome,
                run.layers_done,
                run.layers_total
            );
        }

        let summary = RunSummary {
            run_id: run.id,
            mode: run.mode,
            outcome,
            layers_total: run.layers_total,
            layers_done: run.layers_done,
            commands_executed: run.commands_executed,
            batches_executed: run.batches_executed,
            queue: run.handle.queue.stats(),
            started_at: run.started_at,
            finished_at: Utc::now(),
        };
        self.last_summary = Some(summary.clone());
        Some(summary)
    }
}

impl Drop for StreamOrchestrator {
    fn drop(&mut self) {
        if self.run.is_some() {
            tracing::warn!("Orchestrator dropped with an active run; stopping it");
            self.stop();
        }
    }
}

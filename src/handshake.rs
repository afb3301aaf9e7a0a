//! Per-layer handshake with the machine controller.
//!
//! For every layer in production mode the consumer asks the controller to lay
//! a fresh powder surface, waits until it reports the surface prepared, scans,
//! and then drops the request flag again. The prepared signal can arrive by
//! push ([`HandshakeCoordinator::notify_prepared`], called by whatever owns the
//! controller transport) or is picked up by polling `LaySurfacePrepared`.
//! Polling only accepts a rising edge: the tag has to read `false` at least
//! once after the request, otherwise a flag left over from the previous layer
//! would release the wait before the recoater has moved.

use layerstream_shared::{ControllerLink, ControllerTag, LinkError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::HandshakeConfig;
use crate::stream::control::{RunControl, lock};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HandshakeError {
    #[error("Controller did not prepare layer {layer} within {waited:?}")]
    Timeout { layer: u32, waited: Duration },
    #[error("Handshake for layer {layer} cancelled")]
    Cancelled { layer: u32 },
    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Debug, Default)]
struct HandshakeState {
    prepared: bool,
    /// `LaySurfacePrepared` has read low since the last request.
    seen_clear: bool,
    awaiting: Option<u32>,
    completed_layers: u64,
}

pub struct HandshakeCoordinator {
    link: Arc<dyn ControllerLink>,
    config: HandshakeConfig,
    control: Arc<RunControl>,
    state: Mutex<HandshakeState>,
    prepared_cv: Condvar,
}

/// Millimetres to whole micrometres.
fn micrometres(mm: f64) -> i32 {
    (mm * 1000.0).round() as i32
}

impl HandshakeCoordinator {
    pub fn new(link: Arc<dyn ControllerLink>, config: HandshakeConfig, control: Arc<RunControl>) -> Self {
        Self {
            link,
            config,
            control,
            state: Mutex::new(HandshakeState::default()),
            prepared_cv: Condvar::new(),
        }
    }

    /// Step 1: write the layer request and raise `LaySurfaceRequest`.
    pub fn request_layer(&self, layer: u32, thickness_mm: f64) -> Result<(), HandshakeError> {
        {
            let mut state = lock(&self.state);
            state.prepared = false;
            state.seen_clear = false;
            state.awaiting = Some(layer);
        }
        let sink = micrometres(thickness_mm);
        let source = micrometres(thickness_mm * self.config.dosing_factor);
        tracing::debug!(
            "Requesting layer {} from controller (source {} µm, sink {} µm)",
            layer,
            source,
            sink
        );
        self.link.write_int(ControllerTag::LayStackCount, 1)?;
        self.link.write_int(ControllerTag::StepSource, source)?;
        self.link.write_int(ControllerTag::StepSink, sink)?;
        self.link.write_bool(ControllerTag::LaySurfaceRequest, true)?;
        Ok(())
    }

    /// Push delivery of the prepared signal.
    pub fn notify_prepared(&self) {
        let mut state = lock(&self.state);
        state.prepared = true;
        self.prepared_cv.notify_all();
    }

    /// Step 2: block until the surface is prepared, the run is cancelled or the
    /// configured timeout passes. Consumes the prepared signal.
    pub fn wait_prepared(&self, layer: u32) -> Result<Duration, HandshakeError> {
        let started = Instant::now();
        let timeout = self.config.prepared_timeout();
        let deadline = started + timeout;
        let poll = self.config.poll_interval();

        let mut state = lock(&self.state);
        loop {
            if self.control.is_cancelled() {
                state.awaiting = None;
                return Err(HandshakeError::Cancelled { layer });
            }
            if state.prepared {
                state.prepared = false;
                state.awaiting = None;
                let waited = started.elapsed();
                tracing::debug!("Layer {} surface prepared after {:?}", layer, waited);
                return Ok(waited);
            }

            // Poll the controller without holding the lock
            drop(state);
            let polled = self.link.read_bool(ControllerTag::LaySurfacePrepared);
            state = lock(&self.state);
            match polled {
                Ok(true) if state.seen_clear => {
                    state.prepared = true;
                    continue;
                }
                Ok(true) => {
                    tracing::trace!("Layer {}: prepared flag still latched from the last layer", layer);
                }
                Ok(false) => state.seen_clear = true,
                Err(e) => {
                    state.awaiting = None;
                    return Err(e.into());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                state.awaiting = None;
                tracing::error!("Layer {}: controller did not prepare within {:?}", layer, timeout);
                return Err(HandshakeError::Timeout { layer, waited: now - started });
            }
            let wait = poll.min(deadline - now);
            state = self
                .prepared_cv
                .wait_timeout_while(state, wait, |s| !s.prepared && !self.control.is_cancelled())
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drops a request whose layer will not be scanned. A link error is only
    /// logged.
    pub fn withdraw_request(&self, layer: u32) {
        lock(&self.state).awaiting = None;
        match self.link.write_bool(ControllerTag::LaySurfaceRequest, false) {
            Ok(()) => tracing::debug!("Layer {} request withdrawn", layer),
            Err(e) => tracing::warn!("Could not withdraw layer {} request: {}", layer, e),
        }
    }

    /// Step 4: drop `LaySurfaceRequest` after the layer was scanned.
    pub fn complete_layer(&self, layer: u32) -> Result<(), HandshakeError> {
        self.link.write_bool(ControllerTag::LaySurfaceRequest, false)?;
        lock(&self.state).completed_layers += 1;
        tracing::debug!("Layer {} reported complete to controller", layer);
        Ok(())
    }

    /// Layer currently waiting for its prepared signal.
    pub fn awaiting(&self) -> Option<u32> {
        lock(&self.state).awaiting
    }

    pub fn completed_layers(&self) -> u64 {
        lock(&self.state).completed_layers
    }

    /// Wake the waiter so it re-checks the cancellation flags.
    pub fn wake(&self) {
        let _state = lock(&self.state);
        self.prepared_cv.notify_all();
    }

    pub fn link(&self) -> &Arc<dyn ControllerLink> {
        &self.link
    }
}

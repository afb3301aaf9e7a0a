// src/hardware/plc.rs - Simulated machine controller (recoater / build platform)
//
// Stands in for the industrial controller during dry runs and tests. A layer
// request clears `LaySurfacePrepared` and is picked up on the next scan cycle
// (the next read of that tag), which starts a recoat lasting `recoat_time`.

use layerstream_shared::{ControllerLink, ControllerTag, LinkError, TagValue};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::stream::control::lock;

#[derive(Debug)]
struct PlcState {
    ready_at: Option<Instant>,
    lost: Option<String>,
    never_prepare: bool,
    request_pending: bool,
    recoat_started: Option<Instant>,
    prepared: bool,
    bools: HashMap<ControllerTag, bool>,
    ints: HashMap<ControllerTag, i32>,
    writes: Vec<(ControllerTag, TagValue)>,
    layers_prepared: u64,
}

#[derive(Debug)]
pub struct SimulatedPlc {
    recoat_time: Duration,
    state: Mutex<PlcState>,
}

impl SimulatedPlc {
    /// A connected controller that needs `recoat_time` per layer.
    pub fn new(recoat_time: Duration) -> Self {
        Self {
            recoat_time,
            state: Mutex::new(PlcState {
                ready_at: Some(Instant::now()),
                lost: None,
                never_prepare: false,
                request_pending: false,
                recoat_started: None,
                prepared: false,
                bools: HashMap::new(),
                ints: HashMap::new(),
                writes: Vec::new(),
                layers_prepared: 0,
            }),
        }
    }

    /// Becomes ready only after `delay`.
    pub fn with_ready_delay(self, delay: Duration) -> Self {
        lock(&self.state).ready_at = Some(Instant::now() + delay);
        self
    }

    /// Never becomes ready.
    pub fn offline(self) -> Self {
        lock(&self.state).ready_at = None;
        self
    }

    /// Accept requests but never report the surface as prepared.
    pub fn set_never_prepare(&self, never: bool) {
        lock(&self.state).never_prepare = never;
    }

    /// Every following call fails with `LinkError::Lost`.
    pub fn drop_link(&self, reason: &str) {
        tracing::warn!("Simulated controller link dropped: {}", reason);
        lock(&self.state).lost = Some(reason.to_string());
    }

    pub fn writes(&self) -> Vec<(ControllerTag, TagValue)> {
        lock(&self.state).writes.clone()
    }

    pub fn int_value(&self, tag: ControllerTag) -> Option<i32> {
        lock(&self.state).ints.get(&tag).copied()
    }

    pub fn bool_value(&self, tag: ControllerTag) -> Option<bool> {
        lock(&self.state).bools.get(&tag).copied()
    }

    /// Number of `LaySurfaceRequest = true` writes.
    pub fn requests(&self) -> usize {
        lock(&self.state)
            .writes
            .iter()
            .filter(|w| **w == (ControllerTag::LaySurfaceRequest, TagValue::Bool(true)))
            .count()
    }

    pub fn layers_prepared(&self) -> u64 {
        lock(&self.state).layers_prepared
    }

    fn connected(state: &PlcState) -> Result<(), LinkError> {
        if let Some(reason) = &state.lost {
            return Err(LinkError::Lost(reason.clone()));
        }
        match state.ready_at {
            Some(at) if Instant::now() >= at => Ok(()),
            _ => Err(LinkError::NotConnected),
        }
    }

    fn advance(&self, state: &mut PlcState) {
        if state.never_prepare {
            return;
        }
        if state.request_pending {
            state.request_pending = false;
            state.recoat_started = Some(Instant::now());
            return;
        }
        if let Some(started) = state.recoat_started {
            if started.elapsed() >= self.recoat_time {
                state.recoat_started = None;
                state.prepared = true;
                state.layers_prepared += 1;
                tracing::debug!("Simulated controller: surface prepared");
            }
        }
    }
}

impl ControllerLink for SimulatedPlc {
    fn is_ready(&self) -> bool {
        Self::connected(&lock(&self.state)).is_ok()
    }

    fn write_bool(&self, tag: ControllerTag, value: bool) -> Result<(), LinkError> {
        if !tag.is_bool() || tag == ControllerTag::LaySurfacePrepared {
            return Err(LinkError::WrongType(tag));
        }
        let mut state = lock(&self.state);
        Self::connected(&state)?;
        state.writes.push((tag, TagValue::Bool(value)));
        state.bools.insert(tag, value);
        match (tag, value) {
            (ControllerTag::LaySurfaceRequest, true) => {
                state.prepared = false;
                state.request_pending = true;
                state.recoat_started = None;
            }
            (ControllerTag::EmergencyStop, true) => {
                tracing::warn!("Simulated controller: emergency stop");
                state.request_pending = false;
                state.recoat_started = None;
            }
            _ => {}
        }
        Ok(())
    }

    fn write_int(&self, tag: ControllerTag, value: i32) -> Result<(), LinkError> {
        if tag.is_bool() {
            return Err(LinkError::WrongType(tag));
        }
        let mut state = lock(&self.state);
        Self::connected(&state)?;
        state.writes.push((tag, TagValue::Int(value)));
        state.ints.insert(tag, value);
        Ok(())
    }

    fn read_bool(&self, tag: ControllerTag) -> Result<bool, LinkError> {
        if !tag.is_bool() {
            return Err(LinkError::WrongType(tag));
        }
        let mut state = lock(&self.state);
        Self::connected(&state)?;
        if tag == ControllerTag::LaySurfacePrepared {
            self.advance(&mut state);
            return Ok(state.prepared);
        }
        Ok(state.bools.get(&tag).copied().unwrap_or(false))
    }
}

//! Request-driven single-piece-flow hand-off between producer and consumer.
//!
//! The consumer asks for a layer with [`LayerQueue::request_next`] only after it
//! has completely finished the previous one. The producer blocks in
//! [`LayerQueue::wait_for_request`] until such a request exists, so it can never
//! read more layers than have been requested. All state lives behind one mutex;
//! each of the three blocking waits also observes the run's cancellation flags.

use layerstream_shared::CommandBlock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use thiserror::Error;

use crate::stream::control::{RunControl, lock};

/// Capacity used by the streaming pipeline.
pub const SINGLE_PIECE_CAPACITY: usize = 1;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue wait cancelled")]
    Cancelled,
}

/// Instrumented counters, for progress reporting and flow checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub requested: u64,
    pub produced: u64,
    pub consumed: u64,
    pub max_depth: usize,
    pub producer_finished: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    blocks: VecDeque<CommandBlock>,
    pending_requests: u64,
    stats: QueueStats,
}

pub struct LayerQueue {
    capacity: usize,
    control: Arc<RunControl>,
    state: Mutex<QueueState>,
    request_cv: Condvar,
    not_empty_cv: Condvar,
    not_full_cv: Condvar,
}

impl LayerQueue {
    pub fn new(capacity: usize, control: Arc<RunControl>) -> Self {
        Self {
            capacity: capacity.max(1),
            control,
            state: Mutex::new(QueueState::default()),
            request_cv: Condvar::new(),
            not_empty_cv: Condvar::new(),
            not_full_cv: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Consumer: ask the producer for one more layer.
    pub fn request_next(&self) {
        let mut state = lock(&self.state);
        state.pending_requests += 1;
        state.stats.requested += 1;
        tracing::trace!("Layer request #{}", state.stats.requested);
        self.request_cv.notify_one();
    }

    /// Producer: block until a layer has been requested, then take the request.
    pub fn wait_for_request(&self) -> Result<(), QueueError> {
        let guard = lock(&self.state);
        let mut state = self
            .request_cv
            .wait_while(guard, |s| s.pending_requests == 0 && !self.control.is_cancelled())
            .unwrap_or_else(PoisonError::into_inner);
        if self.control.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        state.pending_requests -= 1;
        Ok(())
    }

    /// Producer: hand over a converted block, waiting for space if needed.
    pub fn push(&self, block: CommandBlock) -> Result<(), QueueError> {
        let guard = lock(&self.state);
        let mut state = self
            .not_full_cv
            .wait_while(guard, |s| s.blocks.len() >= self.capacity && !self.control.is_cancelled())
            .unwrap_or_else(PoisonError::into_inner);
        if self.control.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        state.blocks.push_back(block);
        state.stats.produced += 1;
        state.stats.max_depth = state.stats.max_depth.max(state.blocks.len());
        self.not_empty_cv.notify_one();
        Ok(())
    }

    /// Producer: no more blocks will follow. Wakes a consumer waiting on an empty queue.
    pub fn finish(&self) {
        let mut state = lock(&self.state);
        state.stats.producer_finished = true;
        self.not_empty_cv.notify_all();
    }

    /// Consumer: take the next block. `Ok(None)` once the queue is drained and
    /// the producer has finished.
    pub fn pop(&self) -> Result<Option<CommandBlock>, QueueError> {
        let guard = lock(&self.state);
        let mut state = self
            .not_empty_cv
            .wait_while(guard, |s| {
                s.blocks.is_empty() && !s.stats.producer_finished && !self.control.is_cancelled()
            })
            .unwrap_or_else(PoisonError::into_inner);
        if self.control.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        match state.blocks.pop_front() {
            Some(block) => {
                state.stats.consumed += 1;
                self.not_full_cv.notify_one();
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        lock(&self.state).stats
    }

    /// Wake every waiter so it re-evaluates its predicate (after a flag change).
    pub fn wake_all(&self) {
        let _state = lock(&self.state);
        self.request_cv.notify_all();
        self.not_empty_cv.notify_all();
        self.not_full_cv.notify_all();
    }
}

// Consumer worker: owns the scanner session for the whole run
//
// pop -> handshake -> execute -> laser off -> complete handshake -> request next

use crossbeam_channel::Sender;
use layerstream_shared::{CommandBlock, ProcessMode};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::config::ScannerConfig;
use crate::error::StreamError;
use crate::handshake::HandshakeCoordinator;
use crate::hardware::{BlockReport, DeviceSession, ScannerFactory};
use crate::queue::LayerQueue;
use crate::stream::StreamEvent;
use crate::stream::control::RunControl;

pub(crate) struct Consumer {
    pub run_id: Uuid,
    pub mode: ProcessMode,
    pub scanner: ScannerConfig,
    pub factory: Arc<dyn ScannerFactory>,
    pub queue: Arc<LayerQueue>,
    pub control: Arc<RunControl>,
    pub handshake: Option<Arc<HandshakeCoordinator>>,
    pub events: Sender<StreamEvent>,
}

impl Consumer {
    pub fn run(self) {
        let span = tracing::info_span!("consumer", run = %self.run_id);
        let _enter = span.enter();

        let mut done = 0;
        let result = match DeviceSession::open(self.factory.as_ref(), &self.scanner) {
            Ok(mut session) => {
                let result = self.consume(&mut session, &mut done);
                if self.control.is_emergency() {
                    session.emergency_disable_laser();
                } else if let Err(e) = session.disable_laser() {
                    tracing::error!("Failed to disable laser on shutdown: {}", e);
                }
                drop(session);
                result
            }
            Err(e) => Err(StreamError::Session(e)),
        };

        match result {
            Err(error) if !error.is_cancellation() => {
                tracing::error!("Consumer failed: {}", error);
                let _ = self.events.send(StreamEvent::Failed { worker: "consumer", error });
            }
            Err(error) => tracing::info!("Consumer cancelled: {}", error),
            Ok(()) => {}
        }
        let _ = self.events.send(StreamEvent::ConsumerFinished { layers: done });
        tracing::debug!("Consumer finished after {} layers", done);
    }

    fn consume(&self, session: &mut DeviceSession, done: &mut u32) -> Result<(), StreamError> {
        loop {
            // Parks here between layers while paused
            if !self.control.wait_while_paused() {
                return Ok(());
            }
            self.queue.request_next();
            let block = match self.queue.pop() {
                Ok(Some(block)) => block,
                Ok(None) | Err(_) => return Ok(()),
            };
            self.process(session, block)?;
            *done += 1;
        }
    }

    fn process(&self, session: &mut DeviceSession, block: CommandBlock) -> Result<(), StreamError> {
        let layer = block.layer_number;
        let started = Instant::now();
        let _ = self.events.send(StreamEvent::LayerStarted { layer });

        if let Some(handshake) = &self.handshake {
            handshake
                .request_layer(layer, block.layer_thickness)
                .map_err(|source| StreamError::Handshake { layer, source })?;
        }
        let report = match self.prepare_and_scan(session, &block) {
            Ok(report) => report,
            Err(error) => {
                // The controller must not recoat for a layer that is not scanned
                if let Some(handshake) = &self.handshake {
                    handshake.withdraw_request(layer);
                }
                return Err(error);
            }
        };

        if let Some(handshake) = &self.handshake {
            handshake
                .complete_layer(layer)
                .map_err(|source| StreamError::Handshake { layer, source })?;
        }

        let duration = started.elapsed();
        tracing::info!(
            "Layer {} done in {:?} ({} commands, {} batches)",
            layer,
            duration,
            report.commands,
            report.batches
        );
        let _ = self.events.send(StreamEvent::LayerCompleted { layer, report, duration });
        Ok(())
    }

    /// Waits for the prepared surface, then scans the block and turns the laser off.
    fn prepare_and_scan(&self, session: &mut DeviceSession, block: &CommandBlock) -> Result<BlockReport, StreamError> {
        let layer = block.layer_number;
        if let Some(handshake) = &self.handshake {
            handshake
                .wait_prepared(layer)
                .map_err(|source| StreamError::Handshake { layer, source })?;
        }

        let control = self.control.clone();
        let abort = move || control.is_emergency();
        let executed = session.execute_block(block, self.mode, &abort);
        let disabled = session.disable_laser();
        let report = executed.map_err(|source| StreamError::Device { layer, step: "execute", source })?;
        disabled.map_err(|source| StreamError::Device { layer, step: "disable_laser", source })?;
        Ok(report)
    }
}

// src/hardware/mod.rs - Scanner session: command-list lifecycle over one device
pub mod driver;
pub mod plc;
pub mod simulated;

use layerstream_shared::hardware_traits::codes;
use layerstream_shared::{
    Command, CommandBlock, LaserMode, ParameterSegment, ProcessMode, ScanDevice,
};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::ScannerConfig;
use crate::hardware::driver::ScannerDriver;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Scanner reported error {code:#06x} after {op}")]
    Fault { code: u32, op: &'static str },
    #[error("{op} is not valid while the command list is {state:?}")]
    InvalidState { op: &'static str, state: ListState },
    #[error("Command list full ({capacity} commands)")]
    ListFull { capacity: usize },
    #[error("List execution still busy after {timeout:?} (output pointer {position})")]
    Timeout { timeout: Duration, position: usize },
    #[error("Layer execution aborted at list position {position}")]
    Aborted { position: usize },
    #[error("Failed to open scanner: {0}")]
    Open(String),
}

/// Command-list lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    /// Closed, nothing queued.
    Empty,
    /// Accepting commands.
    Open,
    /// Closed with commands queued, not yet executed.
    Queued,
    Executing,
    /// Closed after execution finished; needs a reset before reuse.
    Drained,
}

/// Opens scan devices. Lives on the control thread and is shared with the
/// consumer, which calls `open` on its own thread.
pub trait ScannerFactory: Send + Sync {
    fn driver_name(&self) -> &str;
    fn open(&self, config: &ScannerConfig) -> Result<Box<dyn ScanDevice>, DeviceError>;
}

/// Immediate-mode laser parameters of one segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaserParameters {
    pub power_w: f64,
    pub mark_speed: f64,
    pub jump_speed: f64,
    pub laser_mode: LaserMode,
    pub focus_offset_mm: f64,
}

impl LaserParameters {
    /// Test runs keep the laser at zero power.
    pub fn for_segment(segment: &ParameterSegment, mode: ProcessMode) -> Self {
        let power_w = match mode {
            ProcessMode::Production => segment.laser_power_w,
            ProcessMode::Test => 0.0,
        };
        Self {
            power_w,
            mark_speed: segment.mark_speed,
            jump_speed: segment.jump_speed,
            laser_mode: segment.mode,
            focus_offset_mm: segment.focus_offset_mm,
        }
    }
}

/// What executing one block took.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockReport {
    pub commands: usize,
    pub batches: usize,
    /// Segment transitions, each with one parameter write.
    pub parameter_writes: usize,
}

/// Single-owner wrapper around one scan device.
///
/// The session is `!Send`: it is constructed on the consumer
/// thread and can never be moved to, or called from, another one.
pub struct DeviceSession {
    device: Box<dyn ScanDevice>,
    config: ScannerConfig,
    state: ListState,
    batch_len: usize,
    applied: Option<LaserParameters>,
    laser_enabled: bool,
    last_error: Option<u32>,
    batches_executed: u64,
    _driver: Arc<ScannerDriver>,
    _not_send: PhantomData<*const ()>,
}

impl DeviceSession {
    /// Acquires the driver, opens the device and writes the static tuning.
    pub fn open(factory: &dyn ScannerFactory, config: &ScannerConfig) -> Result<Self, DeviceError> {
        let driver = ScannerDriver::acquire(factory.driver_name());
        let device = factory.open(config)?;
        let mut session = Self {
            device,
            config: config.clone(),
            state: ListState::Empty,
            batch_len: 0,
            applied: None,
            laser_enabled: false,
            last_error: None,
            batches_executed: 0,
            _driver: driver,
            _not_send: PhantomData,
        };

        session.device.disable_laser();
        session.check("disable_laser")?;
        session
            .device
            .set_laser_delays(config.laser_on_delay_us, config.laser_off_delay_us);
        session.check("set_laser_delays")?;
        session.device.set_scanner_delays(
            config.jump_delay_us,
            config.mark_delay_us,
            config.polygon_delay_us,
        );
        session.check("set_scanner_delays")?;
        session.device.set_mark_speed(config.default_mark_speed);
        session.device.set_jump_speed(config.default_jump_speed);
        session.check("set_default_speeds")?;
        session.device.reset_list();
        session.check_reset()?;

        tracing::info!(
            "Scanner session open (list capacity {}, flush at {})",
            config.list_capacity,
            config.flush_threshold()
        );
        Ok(session)
    }

    pub fn state(&self) -> ListState {
        self.state
    }

    pub fn batch_len(&self) -> usize {
        self.batch_len
    }

    pub fn applied_parameters(&self) -> Option<LaserParameters> {
        self.applied
    }

    pub fn laser_enabled(&self) -> bool {
        self.laser_enabled
    }

    /// Last non-zero error code seen, if any.
    pub fn last_error(&self) -> Option<u32> {
        self.last_error
    }

    pub fn batches_executed(&self) -> u64 {
        self.batches_executed
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    fn check(&mut self, op: &'static str) -> Result<(), DeviceError> {
        let code = self.device.last_error();
        if code == codes::OK {
            return Ok(());
        }
        self.device.clear_error();
        self.last_error = Some(code);
        match codes::rejected_index(code) {
            Some(index) => tracing::error!(
                "Scanner rejected command at list index {} during {} (code {:#06x})",
                index,
                op,
                code
            ),
            None => tracing::error!("Scanner error {:#06x} after {}", code, op),
        }
        Err(DeviceError::Fault { code, op })
    }

    /// Like `check`, but a stale code left over from an earlier phase is cleared
    /// by the reset and only logged.
    fn check_reset(&mut self) -> Result<(), DeviceError> {
        let code = self.device.last_error();
        if code != codes::OK && codes::is_benign(code) {
            tracing::warn!("Clearing stale scanner code {:#06x} on list reset", code);
            self.device.clear_error();
            self.last_error = Some(code);
            return Ok(());
        }
        self.check("reset_list")
    }

    fn expect_state(&self, op: &'static str, allowed: &[ListState]) -> Result<(), DeviceError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DeviceError::InvalidState { op, state: self.state })
        }
    }

    /// Discards residual list pointers and commands, then reopens the list for
    /// writing. Required before the first command of a layer and after every
    /// batch execution; calling it twice in a row is harmless.
    pub fn prepare_for_layer(&mut self) -> Result<(), DeviceError> {
        self.expect_state(
            "prepare_for_layer",
            &[ListState::Empty, ListState::Open, ListState::Queued, ListState::Drained],
        )?;
        self.device.reset_list();
        self.check_reset()?;
        self.state = ListState::Empty;
        self.batch_len = 0;

        self.device.open_list();
        self.check("open_list")?;
        self.state = ListState::Open;
        Ok(())
    }

    pub fn enqueue(&mut self, command: &Command) -> Result<(), DeviceError> {
        self.expect_state("enqueue", &[ListState::Open])?;
        if self.batch_len >= self.config.list_capacity {
            return Err(DeviceError::ListFull { capacity: self.config.list_capacity });
        }
        match *command {
            Command::Jump { x, y } => self.device.jump_abs(x, y),
            Command::Mark { x, y } => self.device.mark_abs(x, y),
            Command::Delay { micros } => self.device.long_delay(micros),
        }
        self.check("enqueue")?;
        self.batch_len += 1;
        Ok(())
    }

    /// Occupancy reached `list_capacity - safety_margin`: close and run the batch.
    pub fn needs_flush(&self) -> bool {
        self.batch_len >= self.config.flush_threshold()
    }

    pub fn close(&mut self) -> Result<(), DeviceError> {
        self.expect_state("close", &[ListState::Open])?;
        self.device.close_list();
        self.check("close_list")?;
        self.state = ListState::Queued;
        Ok(())
    }

    pub fn execute(&mut self) -> Result<(), DeviceError> {
        self.expect_state("execute", &[ListState::Queued])?;
        self.device.execute_list();
        self.check("execute_list")?;
        self.state = ListState::Executing;
        self.batches_executed += 1;
        tracing::trace!("Executing batch of {} commands", self.batch_len);
        Ok(())
    }

    /// Polls busy/position until the list finished, `timeout` elapsed or
    /// `abort` returned true.
    pub fn wait_for_completion(
        &mut self,
        timeout: Duration,
        abort: &dyn Fn() -> bool,
    ) -> Result<(), DeviceError> {
        match self.state {
            ListState::Executing => {}
            ListState::Drained | ListState::Empty => return Ok(()),
            state => return Err(DeviceError::InvalidState { op: "wait_for_completion", state }),
        }

        let deadline = Instant::now() + timeout;
        let poll = self.config.status_poll_interval();
        loop {
            let status = self.device.status();
            self.check("status")?;
            if !status.busy {
                self.state = ListState::Drained;
                return Ok(());
            }
            if abort() {
                tracing::warn!("List execution aborted at output pointer {}", status.position);
                return Err(DeviceError::Aborted { position: status.position });
            }
            if Instant::now() >= deadline {
                tracing::error!(
                    "List execution timed out after {:?} at output pointer {}",
                    timeout,
                    status.position
                );
                return Err(DeviceError::Timeout { timeout, position: status.position });
            }
            thread::sleep(poll);
        }
    }

    /// Close, execute and drain the current batch, then reopen for the next one.
    pub fn flush_batch(&mut self, abort: &dyn Fn() -> bool) -> Result<(), DeviceError> {
        self.close()?;
        self.execute()?;
        self.wait_for_completion(self.config.completion_timeout(), abort)?;
        self.prepare_for_layer()
    }

    /// Immediate-mode write of power and speeds. Must not happen while a list
    /// is executing.
    pub fn apply_segment_parameters(
        &mut self,
        power_w: f64,
        mark_speed: f64,
        jump_speed: f64,
    ) -> Result<(), DeviceError> {
        if self.state == ListState::Executing {
            return Err(DeviceError::InvalidState {
                op: "apply_segment_parameters",
                state: self.state,
            });
        }
        let analog = self.config.power_to_analog(power_w);
        self.device.set_mark_speed(mark_speed);
        self.device.set_jump_speed(jump_speed);
        self.device.write_analog_out(self.config.analog_channel, analog);
        self.check("apply_segment_parameters")?;
        tracing::debug!(
            "Applied {:.1} W (analog {}), mark {} mm/s, jump {} mm/s",
            power_w,
            analog,
            mark_speed,
            jump_speed
        );
        Ok(())
    }

    /// Full segment transition: power and speeds, then laser mode and focus.
    pub fn apply_laser_parameters(&mut self, params: &LaserParameters) -> Result<(), DeviceError> {
        self.apply_segment_parameters(params.power_w, params.mark_speed, params.jump_speed)?;
        self.device.set_laser_mode(params.laser_mode);
        self.device.set_focus_offset(params.focus_offset_mm);
        self.check("set_beam_parameters")?;
        self.applied = Some(*params);
        Ok(())
    }

    pub fn enable_laser(&mut self) -> Result<(), DeviceError> {
        self.device.enable_laser();
        self.check("enable_laser")?;
        self.laser_enabled = true;
        Ok(())
    }

    pub fn disable_laser(&mut self) -> Result<(), DeviceError> {
        self.device.disable_laser();
        self.laser_enabled = false;
        self.check("disable_laser")
    }

    /// Zero the power output and switch the laser off, whatever the list is doing.
    /// Errors are logged and otherwise ignored.
    pub fn emergency_disable_laser(&mut self) {
        self.device.write_analog_out(self.config.analog_channel, 0);
        self.device.disable_laser();
        self.laser_enabled = false;
        self.applied = None;
        let code = self.device.last_error();
        if code != codes::OK {
            self.device.clear_error();
            self.last_error = Some(code);
            tracing::error!("Scanner error {:#06x} during emergency laser off", code);
        }
        tracing::warn!("Laser forced off");
    }

    /// Runs one layer's block: parameters are written once at every segment
    /// start, the pending batch is flushed before a parameter change and whenever the list
    /// reaches its flush threshold. Leaves the list drained; the laser stays as
    /// it is for the caller to disable.
    pub fn execute_block(
        &mut self,
        block: &CommandBlock,
        mode: ProcessMode,
        abort: &dyn Fn() -> bool,
    ) -> Result<BlockReport, DeviceError> {
        let mut report = BlockReport::default();
        self.prepare_for_layer()?;
        if mode == ProcessMode::Production {
            self.enable_laser()?;
        }

        let mut next_segment = 0;
        for (index, command) in block.commands.iter().enumerate() {
            if abort() {
                return Err(DeviceError::Aborted { position: index });
            }
            if let Some(segment) = block.parameter_segments.get(next_segment) {
                if segment.start_cmd == index {
                    next_segment += 1;
                    let params = LaserParameters::for_segment(segment, mode);
                    // Immediate writes take effect at once, so queued vectors
                    // must run under the old parameters first.
                    if self.applied != Some(params) && self.batch_len > 0 {
                        self.flush_batch(abort)?;
                        report.batches += 1;
                    }
                    self.apply_laser_parameters(&params)?;
                    report.parameter_writes += 1;
                }
            }
            if self.needs_flush() {
                self.flush_batch(abort)?;
                report.batches += 1;
            }
            self.enqueue(command)?;
            report.commands += 1;
        }

        if self.batch_len > 0 {
            self.close()?;
            self.execute()?;
            self.wait_for_completion(self.config.completion_timeout(), abort)?;
            report.batches += 1;
        }
        tracing::debug!(
            "Layer {} executed: {} commands, {} batch(es), {} parameter write(s)",
            block.layer_number,
            report.commands,
            report.batches,
            report.parameter_writes
        );
        Ok(report)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.device.disable_laser();
        if self.device.last_error() != codes::OK {
            self.device.clear_error();
        }
        tracing::info!(
            "Scanner session closed after {} batch(es)",
            self.batches_executed
        );
    }
}

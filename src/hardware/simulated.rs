// src/hardware/simulated.rs - In-process scan controller for tests and dry runs
//
// Models the parts of a real list-based scan controller the engine depends on:
// the list keeps its input/output pointers across an execute, so reopening it
// without a reset makes the first new command fail at index 0; execution takes
// time per command; errors latch until cleared.

use layerstream_shared::hardware_traits::codes;
use layerstream_shared::{DeviceStatus, LaserMode, ScanDevice};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::ScannerConfig;
use crate::hardware::{DeviceError, ScannerFactory};
use crate::stream::control::lock;

#[derive(Debug, Clone, PartialEq)]
pub enum ScannerEvent {
    ListReset,
    ListOpened,
    ListClosed,
    Executed { commands: usize },
    Jump { x: i32, y: i32 },
    Mark { x: i32, y: i32 },
    Delay { micros: u32 },
    MarkSpeed(f64),
    JumpSpeed(f64),
    AnalogOut { channel: u8, value: u16 },
    LaserMode(LaserMode),
    FocusOffset(f64),
    LaserEnabled,
    LaserDisabled,
    Error(u32),
    Closed,
}

impl ScannerEvent {
    pub fn is_vector(&self) -> bool {
        matches!(self, ScannerEvent::Jump { .. } | ScannerEvent::Mark { .. } | ScannerEvent::Delay { .. })
    }
}

/// Shared record of everything a simulated device was asked to do.
#[derive(Debug, Clone, Default)]
pub struct ScannerJournal {
    events: Arc<Mutex<Vec<ScannerEvent>>>,
}

impl ScannerJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: ScannerEvent) {
        lock(&self.events).push(event);
    }

    pub fn events(&self) -> Vec<ScannerEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, pred: impl Fn(&ScannerEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| pred(e)).count()
    }

    pub fn executed_commands(&self) -> usize {
        lock(&self.events)
            .iter()
            .map(|e| match e {
                ScannerEvent::Executed { commands } => *commands,
                _ => 0,
            })
            .sum()
    }

    pub fn errors(&self) -> Vec<u32> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                ScannerEvent::Error(code) => Some(*code),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

/// Fault and timing injection.
#[derive(Debug, Clone)]
pub struct SimulatedBehavior {
    /// Execution time per queued command.
    pub per_command: Duration,
    /// Executing lists never finish.
    pub hang: bool,
    /// Fail the n-th execute (1-based) with `EXECUTION_FAULT`.
    pub fail_execute_at: Option<u64>,
    /// The first list reset finds a stale timeout code from an earlier phase.
    pub stale_code_on_first_reset: bool,
    /// Record every jump/mark/delay in the journal.
    pub record_vectors: bool,
    /// Refuse to open at all.
    pub offline: bool,
}

impl Default for SimulatedBehavior {
    fn default() -> Self {
        Self {
            per_command: Duration::from_micros(20),
            hang: false,
            fail_execute_at: None,
            stale_code_on_first_reset: false,
            record_vectors: true,
            offline: false,
        }
    }
}

#[derive(Debug)]
struct Execution {
    started: Instant,
    commands: usize,
}

pub struct SimulatedScanner {
    journal: ScannerJournal,
    behavior: SimulatedBehavior,
    capacity: usize,
    queued: usize,
    open: bool,
    closed: bool,
    // Pointers left behind by the last execution; only a reset clears them.
    stale_pointers: bool,
    execution: Option<Execution>,
    executions: u64,
    resets: u64,
    error: u32,
}

impl SimulatedScanner {
    pub fn new(capacity: usize, behavior: SimulatedBehavior, journal: ScannerJournal) -> Self {
        Self {
            journal,
            behavior,
            capacity,
            queued: 0,
            open: false,
            closed: false,
            stale_pointers: false,
            execution: None,
            executions: 0,
            resets: 0,
            error: codes::OK,
        }
    }

    fn latch(&mut self, code: u32) {
        if self.error == codes::OK {
            self.error = code;
        }
        self.journal.record(ScannerEvent::Error(code));
    }

    fn queue_vector(&mut self, event: ScannerEvent) {
        if !self.open {
            self.latch(codes::LIST_NOT_OPEN);
            return;
        }
        if self.stale_pointers {
            // The device sees the new command at a stale offset and reports index 0
            self.latch(codes::COMMAND_REJECTED);
            return;
        }
        if self.queued >= self.capacity {
            self.latch(codes::LIST_OVERFLOW);
            return;
        }
        self.queued += 1;
        if self.behavior.record_vectors {
            self.journal.record(event);
        }
    }

    fn execution_time(&self, commands: usize) -> Duration {
        self.behavior.per_command * commands as u32
    }
}

impl ScanDevice for SimulatedScanner {
    fn reset_list(&mut self) {
        self.resets += 1;
        if self.resets == 1 && self.behavior.stale_code_on_first_reset {
            self.latch(codes::STALE_TIMEOUT);
        }
        self.execution = None;
        self.queued = 0;
        self.open = false;
        self.closed = false;
        self.stale_pointers = false;
        self.journal.record(ScannerEvent::ListReset);
    }

    fn open_list(&mut self) {
        // Opening keeps whatever pointers the list still has.
        self.open = true;
        self.closed = false;
        self.journal.record(ScannerEvent::ListOpened);
    }

    fn close_list(&mut self) {
        if !self.open {
            self.latch(codes::LIST_NOT_OPEN);
            return;
        }
        self.open = false;
        self.closed = true;
        self.journal.record(ScannerEvent::ListClosed);
    }

    fn execute_list(&mut self) {
        if !self.closed {
            self.latch(codes::LIST_NOT_CLOSED);
            return;
        }
        self.executions += 1;
        if self.behavior.fail_execute_at == Some(self.executions) {
            self.latch(codes::EXECUTION_FAULT);
            return;
        }
        self.closed = false;
        self.stale_pointers = true;
        self.execution = Some(Execution {
            started: Instant::now(),
            commands: self.queued,
        });
        self.journal.record(ScannerEvent::Executed { commands: self.queued });
    }

    fn list_occupancy(&mut self) -> usize {
        self.queued
    }

    fn jump_abs(&mut self, x: i32, y: i32) {
        self.queue_vector(ScannerEvent::Jump { x, y });
    }

    fn mark_abs(&mut self, x: i32, y: i32) {
        self.queue_vector(ScannerEvent::Mark { x, y });
    }

    fn long_delay(&mut self, micros: u32) {
        self.queue_vector(ScannerEvent::Delay { micros });
    }

    fn set_mark_speed(&mut self, mm_per_s: f64) {
        self.journal.record(ScannerEvent::MarkSpeed(mm_per_s));
    }

    fn set_jump_speed(&mut self, mm_per_s: f64) {
        self.journal.record(ScannerEvent::JumpSpeed(mm_per_s));
    }

    fn set_laser_delays(&mut self, _on_us: u32, _off_us: u32) {}

    fn set_scanner_delays(&mut self, _jump_us: u32, _mark_us: u32, _polygon_us: u32) {}

    fn write_analog_out(&mut self, channel: u8, value: u16) {
        self.journal.record(ScannerEvent::AnalogOut { channel, value });
    }

    fn set_laser_mode(&mut self, mode: LaserMode) {
        self.journal.record(ScannerEvent::LaserMode(mode));
    }

    fn set_focus_offset(&mut self, mm: f64) {
        self.journal.record(ScannerEvent::FocusOffset(mm));
    }

    fn enable_laser(&mut self) {
        self.journal.record(ScannerEvent::LaserEnabled);
    }

    fn disable_laser(&mut self) {
        self.journal.record(ScannerEvent::LaserDisabled);
    }

    fn status(&mut self) -> DeviceStatus {
        let Some(execution) = &self.execution else {
            return DeviceStatus { busy: false, position: self.queued };
        };
        let elapsed = execution.started.elapsed();
        let total = self.execution_time(execution.commands);
        if self.behavior.hang || elapsed < total {
            let per = self.behavior.per_command.as_nanos().max(1);
            let done = (elapsed.as_nanos() / per) as usize;
            return DeviceStatus {
                busy: true,
                position: done.min(execution.commands.saturating_sub(1)),
            };
        }
        let position = execution.commands;
        self.execution = None;
        DeviceStatus { busy: false, position }
    }

    fn last_error(&mut self) -> u32 {
        self.error
    }

    fn clear_error(&mut self) {
        self.error = codes::OK;
    }
}

impl Drop for SimulatedScanner {
    fn drop(&mut self) {
        self.journal.record(ScannerEvent::Closed);
    }
}

/// Opens [`SimulatedScanner`]s that all report into one journal.
#[derive(Debug, Clone, Default)]
pub struct SimulatedScannerFactory {
    journal: ScannerJournal,
    behavior: SimulatedBehavior,
}

impl SimulatedScannerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: SimulatedBehavior) -> Self {
        Self {
            journal: ScannerJournal::new(),
            behavior,
        }
    }

    pub fn journal(&self) -> ScannerJournal {
        self.journal.clone()
    }
}

impl ScannerFactory for SimulatedScannerFactory {
    fn driver_name(&self) -> &str {
        "simulated"
    }

    fn open(&self, config: &ScannerConfig) -> Result<Box<dyn ScanDevice>, DeviceError> {
        if self.behavior.offline {
            return Err(DeviceError::Open("simulated scanner is offline".to_string()));
        }
        Ok(Box::new(SimulatedScanner::new(
            config.list_capacity,
            self.behavior.clone(),
            self.journal.clone(),
        )))
    }
}

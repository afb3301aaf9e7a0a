// Trait-based interface to the scanning hardware (shared)
//
// Calls do not return results; like the vendor library they wrap, the device
// latches an error code that callers poll with `last_error` after every
// state-changing call.

use crate::style::LaserMode;

/// Device error codes.
pub mod codes {
    pub const OK: u32 = 0;
    /// A queued command was rejected; the low 16 bits carry the list index.
    pub const COMMAND_REJECTED: u32 = 0x0001_0000;
    /// Command queued beyond list capacity.
    pub const LIST_OVERFLOW: u32 = 0x0002;
    /// Command queued while the list is not open.
    pub const LIST_NOT_OPEN: u32 = 0x0004;
    /// Execute requested on a list that is not closed.
    pub const LIST_NOT_CLOSED: u32 = 0x0008;
    /// Busy timeout left over from a previous execution phase.
    pub const STALE_TIMEOUT: u32 = 0x0010;
    /// Execution aborted by the hardware.
    pub const EXECUTION_FAULT: u32 = 0x0020;

    /// Codes that may be left over from an earlier phase and are cleared by a reset.
    pub fn is_benign(code: u32) -> bool {
        code == STALE_TIMEOUT
    }

    pub fn rejected_index(code: u32) -> Option<u32> {
        if code & 0xFFFF_0000 == COMMAND_REJECTED {
            Some(code & 0xFFFF)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    pub busy: bool,
    /// Output pointer: index of the list command being executed.
    pub position: usize,
}

/// Command surface of one physical scan controller.
///
/// Implementations are not required to be `Send`; a device is opened on, used
/// by and dropped on a single thread.
pub trait ScanDevice {
    /// Discard residual input/output pointers and commands of the list buffer.
    fn reset_list(&mut self);
    fn open_list(&mut self);
    fn close_list(&mut self);
    fn execute_list(&mut self);
    /// Number of commands queued in the open list.
    fn list_occupancy(&mut self) -> usize;

    fn jump_abs(&mut self, x: i32, y: i32);
    fn mark_abs(&mut self, x: i32, y: i32);
    fn long_delay(&mut self, micros: u32);

    fn set_mark_speed(&mut self, mm_per_s: f64);
    fn set_jump_speed(&mut self, mm_per_s: f64);
    fn set_laser_delays(&mut self, on_us: u32, off_us: u32);
    fn set_scanner_delays(&mut self, jump_us: u32, mark_us: u32, polygon_us: u32);
    fn write_analog_out(&mut self, channel: u8, value: u16);
    fn set_laser_mode(&mut self, mode: LaserMode);
    /// Z offset of the focus from the build plane, mm.
    fn set_focus_offset(&mut self, mm: f64);

    fn enable_laser(&mut self);
    fn disable_laser(&mut self);

    fn status(&mut self) -> DeviceStatus;
    fn last_error(&mut self) -> u32;
    fn clear_error(&mut self);
}

//! Device-ready instruction blocks.
//!
//! A `CommandBlock` holds one layer's worth of list commands in execution order
//! plus the parameter segments that partition them by build style. Blocks are
//! created by the producer, moved through the layer queue and dropped by the
//! consumer once executed.

use serde::{Deserialize, Serialize};

use crate::style::{BuildStyle, LaserMode};

/// A single list command. Coordinates are device bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Jump { x: i32, y: i32 },
    Mark { x: i32, y: i32 },
    Delay { micros: u32 },
}

impl Command {
    pub fn is_mark(&self) -> bool {
        matches!(self, Command::Mark { .. })
    }
}

/// Inclusive range `[start_cmd, end_cmd]` of commands sharing one laser configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSegment {
    pub start_cmd: usize,
    pub end_cmd: usize,
    pub style_id: u32,
    pub laser_power_w: f64,
    pub mark_speed: f64,
    pub jump_speed: f64,
    pub mode: LaserMode,
    pub focus_offset_mm: f64,
}

impl ParameterSegment {
    pub fn from_style(start_cmd: usize, end_cmd: usize, style: &BuildStyle) -> Self {
        Self {
            start_cmd,
            end_cmd,
            style_id: style.id,
            laser_power_w: style.laser_power_w,
            mark_speed: style.mark_speed,
            jump_speed: style.jump_speed,
            mode: style.mode,
            focus_offset_mm: style.focus_offset_mm,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.start_cmd <= index && index <= self.end_cmd
    }

    pub fn len(&self) -> usize {
        self.end_cmd + 1 - self.start_cmd
    }

    pub fn is_empty(&self) -> bool {
        self.end_cmd < self.start_cmd
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandBlock {
    pub layer_number: u32,
    pub layer_thickness: f64,
    pub commands: Vec<Command>,
    pub parameter_segments: Vec<ParameterSegment>,
}

impl CommandBlock {
    pub fn new(layer_number: u32, layer_thickness: f64) -> Self {
        Self {
            layer_number,
            layer_thickness,
            commands: Vec::new(),
            parameter_segments: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Index into `parameter_segments` of the segment owning `index`.
    ///
    /// Linear scan; per-layer segment counts are small.
    pub fn segment_for(&self, index: usize) -> Option<usize> {
        self.parameter_segments.iter().position(|s| s.contains(index))
    }

    pub fn mark_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_mark()).count()
    }

    /// True when the segments are ordered, contiguous, non-overlapping and
    /// together cover exactly `[0, commands.len() - 1]`.
    pub fn coverage_is_complete(&self) -> bool {
        if self.commands.is_empty() {
            return self.parameter_segments.is_empty();
        }
        let mut next = 0usize;
        for segment in &self.parameter_segments {
            if segment.is_empty() || segment.start_cmd != next {
                return false;
            }
            next = segment.end_cmd + 1;
        }
        next == self.commands.len()
    }
}

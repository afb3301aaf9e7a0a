//! Logical tag interface to the external programmable controller (PLC).
//!
//! The concrete industrial transport lives outside this workspace; the engine
//! only needs typed reads and writes of a handful of logical points.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerTag {
    /// write bool: true requests physical layer preparation
    LaySurfaceRequest,
    /// read bool: true once the controller finished preparing the layer
    LaySurfacePrepared,
    /// write int: number of layers to lay (always 1)
    LayStackCount,
    /// write int: powder source cylinder delta, µm
    StepSource,
    /// write int: build cylinder delta, µm
    StepSink,
    /// write bool: immediate halt request
    EmergencyStop,
}

impl ControllerTag {
    pub fn name(self) -> &'static str {
        match self {
            ControllerTag::LaySurfaceRequest => "LaySurfaceRequest",
            ControllerTag::LaySurfacePrepared => "LaySurfacePrepared",
            ControllerTag::LayStackCount => "LayStackCount",
            ControllerTag::StepSource => "StepSource",
            ControllerTag::StepSink => "StepSink",
            ControllerTag::EmergencyStop => "EmergencyStop",
        }
    }

    /// Boolean tags; the rest carry integers.
    pub fn is_bool(self) -> bool {
        matches!(
            self,
            ControllerTag::LaySurfaceRequest
                | ControllerTag::LaySurfacePrepared
                | ControllerTag::EmergencyStop
        )
    }
}

impl fmt::Display for ControllerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagValue {
    Bool(bool),
    Int(i32),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("Controller link not connected")]
    NotConnected,
    #[error("Controller link lost: {0}")]
    Lost(String),
    #[error("Tag {0} does not accept this value type")]
    WrongType(ControllerTag),
}

/// Typed read/write access to the controller's tag set.
///
/// Methods are individually thread-safe; the handle is established before the
/// workers start and is never reassigned while they run.
pub trait ControllerLink: Send + Sync {
    fn is_ready(&self) -> bool;
    fn write_bool(&self, tag: ControllerTag, value: bool) -> Result<(), LinkError>;
    fn write_int(&self, tag: ControllerTag, value: i32) -> Result<(), LinkError>;
    fn read_bool(&self, tag: ControllerTag) -> Result<bool, LinkError>;
}

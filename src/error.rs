// Run-level error type: every failure a run can end with, plus its category

use layerstream_shared::{LinkError, RunState, RunStateError, SourceError, StyleError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::converter::ConversionError;
use crate::handshake::HandshakeError;
use crate::hardware::DeviceError;

/// Coarse failure category, for callers that branch on what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum ErrorKind {
    Timeout,
    DeviceFault(u32),
    LinkLost,
    Invalid,
    Input,
    Conversion,
    Cancelled,
    Internal,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("A run is already active (state {0:?})")]
    AlreadyRunning(RunState),
    #[error("Invalid run input: {0}")]
    InvalidInput(String),
    #[error("Controller link not ready after {0:?}")]
    LinkNotReady(Duration),
    #[error("Layer {layer}: reading slice data failed: {source}")]
    Source { layer: u32, source: SourceError },
    #[error("Layer {layer}: conversion failed: {source}")]
    Conversion { layer: u32, source: ConversionError },
    #[error("Opening scanner failed: {0}")]
    Session(DeviceError),
    #[error("Layer {layer}: scanner failed during {step}: {source}")]
    Device {
        layer: u32,
        step: &'static str,
        source: DeviceError,
    },
    #[error("Layer {layer}: controller handshake failed: {source}")]
    Handshake { layer: u32, source: HandshakeError },
    #[error("Controller link error: {0}")]
    Link(#[from] LinkError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Style(#[from] StyleError),
    #[error(transparent)]
    State(#[from] RunStateError),
    #[error("Worker thread '{0}' panicked")]
    WorkerPanicked(&'static str),
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::AlreadyRunning(_) | StreamError::InvalidInput(_) | StreamError::State(_) => {
                ErrorKind::Invalid
            }
            StreamError::LinkNotReady(_) | StreamError::Link(_) => ErrorKind::LinkLost,
            StreamError::Source { .. } | StreamError::Config(_) | StreamError::Style(_) => ErrorKind::Input,
            StreamError::Conversion { .. } => ErrorKind::Conversion,
            StreamError::Session(source) | StreamError::Device { source, .. } => match source {
                DeviceError::Fault { code, .. } => ErrorKind::DeviceFault(*code),
                DeviceError::Timeout { .. } => ErrorKind::Timeout,
                DeviceError::Aborted { .. } => ErrorKind::Cancelled,
                DeviceError::Open(_) => ErrorKind::LinkLost,
                DeviceError::InvalidState { .. } | DeviceError::ListFull { .. } => ErrorKind::Internal,
            },
            StreamError::Handshake { source, .. } => match source {
                HandshakeError::Timeout { .. } => ErrorKind::Timeout,
                HandshakeError::Cancelled { .. } => ErrorKind::Cancelled,
                HandshakeError::Link(_) => ErrorKind::LinkLost,
            },
            StreamError::WorkerPanicked(_) | StreamError::Spawn(_) => ErrorKind::Internal,
        }
    }

    /// Layer the error is attributed to, if any.
    pub fn layer(&self) -> Option<u32> {
        match self {
            StreamError::Source { layer, .. }
            | StreamError::Conversion { layer, .. }
            | StreamError::Device { layer, .. }
            | StreamError::Handshake { layer, .. } => Some(*layer),
            _ => None,
        }
    }

    /// Shutdown side effect rather than a failure of its own.
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let timeout = StreamError::Device {
            layer: 3,
            step: "wait_for_completion",
            source: DeviceError::Timeout { timeout: Duration::from_secs(1), position: 7 },
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(timeout.layer(), Some(3));
        assert!(timeout.to_string().contains("Layer 3"));

        let fault = StreamError::Device {
            layer: 0,
            step: "enqueue",
            source: DeviceError::Fault { code: 0x0001_0000, op: "enqueue" },
        };
        assert_eq!(fault.kind(), ErrorKind::DeviceFault(0x0001_0000));

        let hs = StreamError::Handshake {
            layer: 1,
            source: HandshakeError::Timeout { layer: 1, waited: Duration::from_secs(120) },
        };
        assert_eq!(hs.kind(), ErrorKind::Timeout);
        assert_eq!(StreamError::LinkNotReady(Duration::from_secs(5)).kind(), ErrorKind::LinkLost);
        assert!(StreamError::Handshake { layer: 1, source: HandshakeError::Cancelled { layer: 1 } }
            .is_cancellation());
    }
}

// layerstream: streams sliced layers to a galvo scan controller in lock-step
// with the machine controller that lays each powder layer

pub mod config;
pub mod converter;
pub mod error;
pub mod handshake;
pub mod hardware;
pub mod queue;
pub mod slice_file;
pub mod stream;
pub mod synthetic;

pub use config::{Config, load_config};
pub use converter::{ConversionError, LayerConverter};
pub use error::{ErrorKind, StreamError};
pub use handshake::{HandshakeCoordinator, HandshakeError};
pub use hardware::{DeviceError, DeviceSession, ListState, ScannerFactory};
pub use queue::{LayerQueue, QueueStats};
pub use slice_file::SliceFile;
pub use stream::{RunOutcome, RunSummary, StopHandle, StreamEvent, StreamOrchestrator};

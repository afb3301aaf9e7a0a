// layerstream_shared: data model and hardware seams shared by the streaming engine,
// its simulators and its tests

pub mod command;
pub mod controller;
pub mod geometry_source;
pub mod hardware_traits;
pub mod layer;
pub mod run_state;
pub mod style;

pub use command::{Command, CommandBlock, ParameterSegment};
pub use controller::{ControllerLink, ControllerTag, LinkError, TagValue};
pub use geometry_source::{GeometrySource, SourceError};
pub use hardware_traits::{DeviceStatus, ScanDevice};
pub use layer::{Hatch, Layer, Point2, Polygon, Polyline};
pub use run_state::{ProcessMode, RunState, RunStateError};
pub use style::{BuildStyle, FALLBACK_STYLE_TAG, LaserMode, StyleError, StyleMap, StyleTable};

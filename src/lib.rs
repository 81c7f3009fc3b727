//! Protocol layer for a BLE-connected addressable LED controller.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{Effect, ParamValue, RaveConfiguration, Segment, SessionEvent};
pub use error::{ProtocolError, TransportError};
pub use infrastructure::bluetooth::{DeviceService, SessionHandle};

//! Bluetooth Module
//!
//! Protocol layer between the application and the LED controller's BLE link.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceService                        │
//! │   (one tokio task per connection, SessionHandle API)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ owns
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ProtocolSession                       │
//! └───┬──────────────┬──────────────┬──────────────┬────────┘
//!     │              │              │              │
//!     ▼              ▼              ▼              ▼
//! ┌─────────┐  ┌───────────┐  ┌────────────┐  ┌────────────┐
//! │ Command │  │ Response  │  │ Response   │  │ Config     │
//! │ Queue   │  │ Framer    │  │ Dispatcher │  │ Transfer   │
//! │         │  │           │  │            │  │            │
//! │ - FIFO  │  │ - brace   │  │ - message  │  │ - ACK      │
//! │ - one   │  │   depth   │  │   shapes   │  │   handshake│
//! │   write │  │ - noise   │  │ - repos    │  │ - chunking │
//! └────┬────┘  └───────────┘  └────────────┘  └────────────┘
//!      │
//!      ▼
//!  Transport (trait) ── BLE backend or SimulatedController
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Opcodes, command encoding and control frames
//! - [`command_queue`] - Serialized outbound writes
//! - [`framer`] - Reassembly of fragmented JSON notifications
//! - [`dispatcher`] - Device message decoding and repository updates
//! - [`transfer`] - Configuration push and pull sequencing
//! - [`session`] - Per-connection protocol state
//! - [`service`] - Async event loop and handle
//! - [`transport`] - Link abstraction
//! - [`simulated`] - In-memory firmware stand-in

pub mod command_queue;
pub mod dispatcher;
pub mod framer;
pub mod protocol;
pub mod service;
pub mod session;
pub mod simulated;
pub mod transfer;
pub mod transport;

// Re-export main service for convenience
pub use service::{DeviceService, SessionHandle};

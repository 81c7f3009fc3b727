//! Transport Abstraction
//!
//! The BLE link itself (scanning, GATT, pairing) lives outside this crate.
//! A backend implements [`Transport`] for writes and pushes everything it
//! receives into a channel of [`TransportEvent`]s.

use crate::domain::settings::DEFAULT_MAX_PAYLOAD;
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one payload to the command characteristic
    ///
    /// Resolves once the stack reports the write as complete. Backends do not
    /// pipeline: the caller never has more than one write outstanding.
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Largest payload a single write may carry
    fn max_payload(&self) -> usize {
        DEFAULT_MAX_PAYLOAD
    }
}

/// Type alias for a shared transport
pub type BoxedTransport = Arc<dyn Transport>;

/// Inbound traffic and link lifecycle, in the order the backend observed them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw notification payload; no framing guarantees
    Notification(Vec<u8>),
    Connected,
    Disconnected,
}

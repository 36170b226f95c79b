//! The seam between the connection engine and a concrete BLE stack.
//!
//! Implementations wrap a central-role library (or a test double). All
//! methods take `&self`; implementations keep their own interior state.

use crate::error::TransportError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Called with each notification payload, on the transport's callback context.
pub type NotifyHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Called once when the link drops, whether requested or not.
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// A resolved GATT characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharHandle {
    pub uuid: Uuid,
    pub handle: u16,
}

impl fmt::Display for CharHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04x})", self.uuid, self.handle)
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Peer address used in log lines.
    fn address(&self) -> String;

    /// Establish the link. `on_disconnect` must fire when it later drops.
    async fn connect(&self, on_disconnect: DisconnectHandler) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Look up a characteristic on the connected peer.
    async fn resolve_characteristic(&self, uuid: Uuid) -> Option<CharHandle>;

    async fn write(&self, characteristic: CharHandle, data: &[u8], with_response: bool) -> Result<(), TransportError>;

    async fn start_notify(&self, characteristic: CharHandle, handler: NotifyHandler) -> Result<(), TransportError>;

    async fn stop_notify(&self, characteristic: CharHandle) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

//! A [`Transport`] that prints frames instead of sending them.
//!
//! Lets the CLI plan doser operations through the real sequencer and engine
//! (message ids, checksum rotation, frame order) without a device.

use async_trait::async_trait;
use chihiros_lib::constants::{UART_RX, UART_TX};
use chihiros_lib::decode_frame;
use chihiros_lib::error::TransportError;
use chihiros_lib::frame::spaced_hex;
use chihiros_lib::transport::{CharHandle, DisconnectHandler, NotifyHandler, Transport};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct Link {
    connected: AtomicBool,
    writes: AtomicUsize,
    on_disconnect: Mutex<Option<DisconnectHandler>>,
}

#[derive(Clone)]
pub struct DryRunTransport {
    address: String,
    link: Arc<Link>,
}

impl DryRunTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            link: Arc::default(),
        }
    }

    /// Frames printed so far.
    pub fn write_count(&self) -> usize {
        self.link.writes.load(Ordering::SeqCst)
    }

    fn take_disconnect_handler(&self) -> Option<DisconnectHandler> {
        self.link
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Transport for DryRunTransport {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self, on_disconnect: DisconnectHandler) -> Result<(), TransportError> {
        debug!(address = %self.address, "dry-run connect");
        *self
            .link
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(on_disconnect);
        self.link.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    async fn resolve_characteristic(&self, uuid: Uuid) -> Option<CharHandle> {
        let handle = match uuid {
            u if u == UART_RX => 0x000e,
            u if u == UART_TX => 0x0010,
            _ => return None,
        };
        Some(CharHandle { uuid, handle })
    }

    async fn write(&self, characteristic: CharHandle, data: &[u8], with_response: bool) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let n = self.link.writes.fetch_add(1, Ordering::SeqCst) + 1;
        let event = decode_frame(data);
        debug!(characteristic = %characteristic, with_response, "dry-run write");
        println!("{n:>3}  {:<40}  {}", spaced_hex(data), event.kind());
        Ok(())
    }

    async fn start_notify(&self, characteristic: CharHandle, _handler: NotifyHandler) -> Result<(), TransportError> {
        debug!(characteristic = %characteristic, "dry-run notify on");
        Ok(())
    }

    async fn stop_notify(&self, characteristic: CharHandle) -> Result<(), TransportError> {
        debug!(characteristic = %characteristic, "dry-run notify off");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.link.connected.store(false, Ordering::SeqCst);
        if let Some(handler) = self.take_disconnect_handler() {
            handler();
        }
        Ok(())
    }
}

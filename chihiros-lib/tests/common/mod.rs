//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use chihiros_lib::constants::{UART_RX, UART_TX};
#[allow(unused_imports)]
pub use chihiros_lib::error::{ChihirosError, TransportError};
#[allow(unused_imports)]
pub use chihiros_lib::frame::{Frame, xor_checksum};
#[allow(unused_imports)]
pub use hex;

use async_trait::async_trait;
use chihiros_lib::transport::{CharHandle, DisconnectHandler, NotifyHandler, Transport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

type AutoReply = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct MockState {
    connected: bool,
    on_disconnect: Option<DisconnectHandler>,
    notify: Option<NotifyHandler>,
    writes: Vec<Vec<u8>>,
    write_script: VecDeque<Option<TransportError>>,
    connect_script: VecDeque<TransportError>,
    hidden: Vec<Uuid>,
    auto_reply: Option<AutoReply>,
    connect_delay: Option<Duration>,
    write_delay: Option<Duration>,
    connects: usize,
    disconnects: usize,
    start_notifies: usize,
    stop_notifies: usize,
}

/// In-memory transport; clones share state so tests keep a handle after
/// moving one into the engine.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with `err`.
    pub fn fail_next_writes(&self, err: TransportError, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.write_script.extend(std::iter::repeat_n(Some(err), count));
    }

    /// Per-write outcomes, consumed in order; `None` succeeds.
    pub fn script_writes(&self, script: Vec<Option<TransportError>>) {
        self.state.lock().unwrap().write_script.extend(script);
    }

    pub fn fail_next_connect(&self, err: TransportError) {
        self.state.lock().unwrap().connect_script.push_back(err);
    }

    pub fn hide_characteristic(&self, uuid: Uuid) {
        self.state.lock().unwrap().hidden.push(uuid);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().unwrap().connect_delay = Some(delay);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().unwrap().write_delay = Some(delay);
    }

    /// Answer writes with a notification when `reply` returns one.
    pub fn auto_reply<F>(&self, reply: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.state.lock().unwrap().auto_reply = Some(Arc::new(reply));
    }

    /// Deliver a notification as the peripheral would.
    pub fn notify(&self, data: &[u8]) {
        let handler = self.state.lock().unwrap().notify.clone();
        if let Some(handler) = handler {
            handler(data);
        }
    }

    /// Drop the link from the peripheral side.
    pub fn drop_link(&self) {
        let handler = {
            let mut state = self.state.lock().unwrap();
            state.connected = false;
            state.notify = None;
            state.on_disconnect.take()
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    pub fn start_notifies(&self) -> usize {
        self.state.lock().unwrap().start_notifies
    }

    pub fn stop_notifies(&self) -> usize {
        self.state.lock().unwrap().stop_notifies
    }

    fn handle_for(uuid: Uuid) -> u16 {
        if uuid == UART_RX { 0x0010 } else { 0x0012 }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn address(&self) -> String {
        "AA:BB:CC:DD:EE:FF".to_string()
    }

    async fn connect(&self, on_disconnect: DisconnectHandler) -> Result<(), TransportError> {
        let delay = self.state.lock().unwrap().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if let Some(err) = state.connect_script.pop_front() {
            return Err(err);
        }
        state.connected = true;
        state.on_disconnect = Some(on_disconnect);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn resolve_characteristic(&self, uuid: Uuid) -> Option<CharHandle> {
        let state = self.state.lock().unwrap();
        (state.connected && !state.hidden.contains(&uuid)).then(|| CharHandle {
            uuid,
            handle: Self::handle_for(uuid),
        })
    }

    async fn write(&self, characteristic: CharHandle, data: &[u8], _with_response: bool) -> Result<(), TransportError> {
        assert_eq!(characteristic.uuid, UART_RX, "writes must target the UART RX characteristic");
        let delay = self.state.lock().unwrap().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let (reply, handler) = {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return Err(TransportError::Closed);
            }
            if let Some(Some(err)) = state.write_script.pop_front() {
                return Err(err);
            }
            state.writes.push(data.to_vec());
            let reply = state.auto_reply.as_ref().and_then(|reply| reply(data));
            (reply, state.notify.clone())
        };
        if let (Some(reply), Some(handler)) = (reply, handler) {
            handler(&reply);
        }
        Ok(())
    }

    async fn start_notify(&self, characteristic: CharHandle, handler: NotifyHandler) -> Result<(), TransportError> {
        assert_eq!(characteristic.uuid, UART_TX, "notifications come from the UART TX characteristic");
        let mut state = self.state.lock().unwrap();
        state.start_notifies += 1;
        state.notify = Some(handler);
        Ok(())
    }

    async fn stop_notify(&self, _characteristic: CharHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.stop_notifies += 1;
        state.notify = None;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let handler = {
            let mut state = self.state.lock().unwrap();
            state.disconnects += 1;
            state.connected = false;
            state.notify = None;
            state.on_disconnect.take()
        };
        if let Some(handler) = handler {
            handler();
        }
        Ok(())
    }
}

/// Build an 0x5B totals response around `params`.
#[allow(dead_code)]
pub fn totals_response(params: &[u8]) -> Vec<u8> {
    let mut body = vec![0x5B, 0x01, params.len() as u8 + 2, 0x00, 0x01, 0x22];
    body.extend_from_slice(params);
    body.push(xor_checksum(&body));
    body
}

//! # Connection engine
//!
//! [`ConnectionEngine`] owns one BLE session to one peripheral on top of a
//! [`Transport`]. It:
//!
//! - connects lazily and coalesces concurrent connect attempts behind a
//!   connect lock,
//! - resolves the Nordic UART write/notify characteristics and subscribes to
//!   notifications,
//! - serializes command dispatch behind an operation lock, retrying
//!   transient transport errors with a fixed backoff and a teardown between
//!   attempts,
//! - fans notifications out to any number of listeners, isolating panics,
//! - closes the session gracefully after an idle period.
//!
//! The engine has no protocol knowledge beyond the message-id counter it
//! owns for the session; frames come from [`crate::commands`].

use crate::config::EngineConfig;
use crate::constants::{UART_RX, UART_TX};
use crate::error::{ChihirosError, Result, TransportError};
use crate::frame::{Frame, spaced_hex};
use crate::message_id::{MessageId, MessageIdCounter};
use crate::transport::{CharHandle, DisconnectHandler, NotifyHandler, Transport};
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Why the most recent session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DisconnectReason {
    /// [`ConnectionEngine::disconnect`] was called
    Explicit,
    IdleTimeout,
    /// Torn down after a failed write or connect
    Error,
    /// The link dropped without the engine asking for it
    Unexpected,
}

/// Handle returned by [`ConnectionEngine::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Default)]
struct Session {
    state: SessionState,
    write_char: Option<CharHandle>,
    notify_char: Option<CharHandle>,
    notifying: bool,
    expected_disconnect: bool,
    last_disconnect: Option<DisconnectReason>,
}

type ListenerList = Mutex<Vec<(ListenerId, NotifyHandler)>>;

struct Shared<T: Transport> {
    transport: T,
    config: EngineConfig,
    connect_lock: AsyncMutex<()>,
    op_lock: AsyncMutex<()>,
    session: Mutex<Session>,
    listeners: Arc<ListenerList>,
    next_listener: AtomicU64,
    ids: Mutex<MessageIdCounter>,
    idle_timer: Mutex<IdleSlot>,
    /// Bumped on every disconnect; pending waits watch it
    disconnects: watch::Sender<u64>,
}

/// The armed idle task, tagged with the generation it was armed in.
#[derive(Debug, Default)]
struct IdleSlot {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl IdleSlot {
    /// Abort any armed task and install the one `spawn` builds for the next
    /// generation.
    fn rearm(&mut self, spawn: impl FnOnce(u64) -> JoinHandle<()>) {
        self.cancel();
        self.generation += 1;
        self.task = Some(spawn(self.generation));
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Detach the task armed in `generation`. False when a newer task has
    /// replaced it since, in which case the caller must not tear down.
    fn claim(&mut self, generation: u64) -> bool {
        if self.generation != generation {
            return false;
        }
        drop(self.task.take());
        true
    }
}

fn lock<M>(mutex: &Mutex<M>) -> MutexGuard<'_, M> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Displays a panic payload caught from a listener.
struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

fn dispatch(listeners: &ListenerList, data: &[u8]) {
    debug!(bytes = %spaced_hex(data), "notification received");
    let snapshot = lock(listeners).clone();
    for (id, listener) in snapshot {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(data))) {
            warn!(listener = id.0, panic = %PanicMessage(payload), "notify listener panicked");
        }
    }
}

/// A single BLE session to one Chihiros peripheral.
///
/// Cloning yields another handle to the same session.
pub struct ConnectionEngine<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for ConnectionEngine<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> ConnectionEngine<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, EngineConfig::default())
    }

    pub fn with_config(transport: T, config: EngineConfig) -> Self {
        let (disconnects, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                connect_lock: AsyncMutex::new(()),
                op_lock: AsyncMutex::new(()),
                session: Mutex::new(Session::default()),
                listeners: Arc::new(Mutex::new(Vec::new())),
                next_listener: AtomicU64::new(1),
                ids: Mutex::new(MessageIdCounter::new()),
                idle_timer: Mutex::new(IdleSlot::default()),
                disconnects,
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.session).state
    }

    /// True while a command holds the operation lock.
    pub fn is_busy(&self) -> bool {
        self.shared.op_lock.try_lock().is_err()
    }

    pub fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        lock(&self.shared.session).last_disconnect
    }

    /// Run `f` against the session's message-id counter.
    pub fn with_message_ids<R>(&self, f: impl FnOnce(&mut MessageIdCounter) -> R) -> R {
        f(&mut lock(&self.shared.ids))
    }

    /// Last message id handed out on this session.
    pub fn current_msg_id(&self) -> MessageId {
        lock(&self.shared.ids).current()
    }

    /// Connect if needed; a live session only has its idle deadline reset.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.shared.ensure_connected().await
    }

    /// Write `frames` in order under the operation lock, retrying transient
    /// transport failures up to the configured attempt budget.
    pub async fn send_command(&self, frames: &[Frame]) -> Result<()> {
        self.shared.send_command(frames).await
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send_command(std::slice::from_ref(frame)).await
    }

    /// Register a notification listener. Listeners are dropped on disconnect.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.shared.subscribe(Arc::new(listener))
    }

    /// Remove a listener; returns false if it was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).len()
    }

    /// Connect if needed and make sure the notify subscription is active.
    pub async fn start_notify(&self) -> Result<()> {
        self.shared.ensure_connected().await?;
        self.shared.start_notify().await
    }

    /// Stop the transport notify subscription; listeners stay registered.
    pub async fn stop_notify(&self) -> Result<()> {
        self.shared.stop_notify().await
    }

    /// Wait for the next notification accepted by `predicate`.
    ///
    /// Resolves to `Ok(None)` on timeout and to
    /// [`ChihirosError::Disconnected`] if the session drops first. The notify
    /// subscription is left untouched either way.
    pub async fn wait_for_notification<P>(&self, predicate: P, timeout: Duration) -> Result<Option<Vec<u8>>>
    where
        P: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        let mut disconnects = self.shared.disconnects.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |data| {
            if predicate(data) {
                let _ = tx.send(data.to_vec());
            }
        });

        let outcome = tokio::time::timeout(timeout, async {
            tokio::select! {
                Some(data) = rx.recv() => Ok(data),
                _ = disconnects.changed() => Err(ChihirosError::Disconnected),
            }
        })
        .await;
        self.unsubscribe(id);

        match outcome {
            Ok(Ok(data)) => Ok(Some(data)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!(?timeout, "no matching notification before timeout");
                Ok(None)
            }
        }
    }

    /// Close the session: stop notifications, drop listeners, close the link.
    pub async fn disconnect(&self) {
        debug!(address = %self.shared.transport.address(), "disconnecting");
        self.shared.teardown(DisconnectReason::Explicit).await;
    }
}

impl<T: Transport> Shared<T> {
    fn is_live(&self) -> bool {
        let session = lock(&self.session);
        session.state == SessionState::Connected && session.write_char.is_some() && self.transport.is_connected()
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        if self.is_live() {
            self.reset_idle_timer();
            return Ok(());
        }
        if self.connect_lock.try_lock().is_err() {
            debug!("connection already in progress, waiting for it to complete");
        }
        let _connect = self.connect_lock.lock().await;
        if self.is_live() {
            self.reset_idle_timer();
            return Ok(());
        }

        let address = self.transport.address();
        lock(&self.session).state = SessionState::Connecting;
        debug!(%address, "connecting");
        if let Err(e) = self.transport.connect(self.disconnect_handler()).await {
            lock(&self.session).state = SessionState::Disconnected;
            if e.is_unreachable() {
                warn!(%address, error = %e, "device not found or unreachable");
            }
            return Err(ChihirosError::from_transport(e));
        }

        let write_char = self.transport.resolve_characteristic(UART_RX).await;
        let notify_char = self.transport.resolve_characteristic(UART_TX).await;
        let (Some(write_char), Some(notify_char)) = (write_char, notify_char) else {
            let missing = if write_char.is_none() { UART_RX } else { UART_TX };
            warn!(%address, %missing, "failed to resolve UART characteristics");
            self.close_locked(DisconnectReason::Error).await;
            return Err(ChihirosError::CharacteristicMissing(missing));
        };

        {
            let mut session = lock(&self.session);
            session.state = SessionState::Connected;
            session.write_char = Some(write_char);
            session.notify_char = Some(notify_char);
            session.notifying = false;
        }
        info!(%address, write = %write_char, notify = %notify_char, "connected");
        self.reset_idle_timer();

        if let Err(e) = self.start_notify().await {
            self.close_locked(DisconnectReason::Error).await;
            return Err(e);
        }
        Ok(())
    }

    async fn send_command(self: &Arc<Self>, frames: &[Frame]) -> Result<()> {
        if self.op_lock.try_lock().is_err() {
            debug!("operation already in progress, waiting for it to complete");
        }
        let _op = self.op_lock.lock().await;

        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match self.write_frames(frames).await {
                Ok(()) => return Ok(()),
                Err(ChihirosError::Transport(e)) if e.is_retryable() => e,
                Err(e) => {
                    debug!(attempt, error = %e, "command failed");
                    return Err(e);
                }
            };

            let backoff = self.config.backoff();
            debug!(attempt, ?backoff, error = %err, "backing off, disconnecting due to error");
            tokio::time::sleep(backoff).await;
            self.teardown(DisconnectReason::Error).await;

            if attempt >= attempts {
                warn!(attempts, error = %err, "communication failed, giving up");
                return Err(ChihirosError::Transport(err));
            }
            attempt += 1;
        }
    }

    async fn write_frames(self: &Arc<Self>, frames: &[Frame]) -> Result<()> {
        self.ensure_connected().await?;
        let write_char = lock(&self.session)
            .write_char
            .ok_or(ChihirosError::Transport(TransportError::Closed))?;
        for frame in frames {
            debug!(bytes = %frame, "BLE write");
            self.transport
                .write(write_char, frame.as_bytes(), self.config.write_with_response)
                .await
                .map_err(ChihirosError::from_transport)?;
        }
        Ok(())
    }

    fn subscribe(&self, listener: NotifyHandler) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, listener));
        id
    }

    fn notify_handler(&self) -> NotifyHandler {
        let listeners = Arc::clone(&self.listeners);
        Arc::new(move |data: &[u8]| dispatch(&listeners, data))
    }

    async fn start_notify(&self) -> Result<()> {
        let (notify_char, notifying) = {
            let session = lock(&self.session);
            (session.notify_char, session.notifying)
        };
        if notifying {
            return Ok(());
        }
        let notify_char = notify_char.ok_or(ChihirosError::Transport(TransportError::Closed))?;
        self.transport
            .start_notify(notify_char, self.notify_handler())
            .await
            .map_err(ChihirosError::from_transport)?;
        lock(&self.session).notifying = true;
        debug!(characteristic = %notify_char, "subscribed to notifications");
        Ok(())
    }

    async fn stop_notify(&self) -> Result<()> {
        let notify_char = {
            let mut session = lock(&self.session);
            if !std::mem::take(&mut session.notifying) {
                return Ok(());
            }
            session.notify_char
        };
        if let Some(notify_char) = notify_char {
            self.transport
                .stop_notify(notify_char)
                .await
                .map_err(ChihirosError::from_transport)?;
            debug!(characteristic = %notify_char, "unsubscribed from notifications");
        }
        Ok(())
    }

    fn disconnect_handler(self: &Arc<Self>) -> DisconnectHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_transport_disconnected();
            }
        })
    }

    fn on_transport_disconnected(&self) {
        let expected = {
            let mut session = lock(&self.session);
            if !session.expected_disconnect {
                session.state = SessionState::Disconnected;
                session.write_char = None;
                session.notify_char = None;
                session.notifying = false;
                session.last_disconnect = Some(DisconnectReason::Unexpected);
            }
            session.expected_disconnect
        };
        let address = self.transport.address();
        if expected {
            debug!(%address, "disconnected from device");
            return;
        }
        warn!(%address, "device unexpectedly disconnected");
        self.cancel_idle_timer();
        self.disconnects.send_modify(|generation| *generation += 1);
    }

    /// Tear the session down under the connect lock.
    async fn teardown(&self, reason: DisconnectReason) {
        let _connect = self.connect_lock.lock().await;
        self.close_locked(reason).await;
    }

    /// Tear down; the caller holds the connect lock.
    async fn close_locked(&self, reason: DisconnectReason) {
        self.cancel_idle_timer();
        let (notify_char, was_notifying) = {
            let mut session = lock(&self.session);
            session.expected_disconnect = true;
            session.state = SessionState::Disconnected;
            session.last_disconnect = Some(reason);
            session.write_char = None;
            (session.notify_char.take(), std::mem::take(&mut session.notifying))
        };
        lock(&self.listeners).clear();

        if self.transport.is_connected() {
            if let (Some(notify_char), true) = (notify_char, was_notifying) {
                if let Err(e) = self.transport.stop_notify(notify_char).await {
                    debug!(error = %e, "stop_notify failed (already stopped?)");
                }
            }
            if let Err(e) = self.transport.disconnect().await {
                debug!(error = %e, "transport disconnect failed");
            }
        }
        self.disconnects.send_modify(|generation| *generation += 1);
        info!(address = %self.transport.address(), %reason, "disconnected");
    }

    fn reset_idle_timer(self: &Arc<Self>) {
        let mut slot = lock(&self.idle_timer);
        lock(&self.session).expected_disconnect = false;
        match self.config.idle_timeout() {
            Some(timeout) => {
                let weak = Arc::downgrade(self);
                slot.rearm(|generation| tokio::spawn(idle_watch(weak, timeout, generation)));
            }
            None => slot.cancel(),
        }
    }

    fn cancel_idle_timer(&self) {
        lock(&self.idle_timer).cancel();
    }
}

/// Fires the graceful idle disconnect; re-arms while a command is running.
async fn idle_watch<T: Transport>(shared: Weak<Shared<T>>, timeout: Duration, generation: u64) {
    loop {
        tokio::time::sleep(timeout).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let Ok(_op) = shared.op_lock.try_lock() else {
            debug!("operation in progress, re-arming idle timer");
            continue;
        };
        // Detach so the teardown below does not abort this task.
        if !lock(&shared.idle_timer).claim(generation) {
            debug!("idle timer superseded by newer activity");
            return;
        }
        debug!(?timeout, "disconnecting after idle timeout");
        shared.teardown(DisconnectReason::IdleTimeout).await;
        return;
    }
}

//! Connection lifecycle management.
//!
//! The [`ConnectionManager`] owns the transport handle and drives the
//! connection state machine:
//!
//! ```text
//!                ┌──────────────┐
//!   ensure_connected ─► Connecting ──ready──► Connected ──lost──┐
//!                └──────┬───────┘                ▲              │
//!                       │ failure                │              ▼
//!                       ▼                        │        Disconnected
//!                 Disconnected ──timer──► Reconnecting ─────────┘
//! ```
//!
//! Concurrent `ensure_connected` callers share a single pending-connect
//! future, so at most one connect attempt is in flight at any time. A
//! background monitor probes channel connectivity and triggers the
//! lost-connection path; reconnects are scheduled on a single-slot timer
//! with capped, jittered exponential backoff.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, SystemTime},
};

use futures::{FutureExt, future::BoxFuture, future::Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    backoff::reconnect_delay,
    config::ClientConfig,
    error::{ClientError, Result},
    events::{ClientEvent, EventBus},
    transport::{ChannelState, Transport, TransportFactory},
};

/// Delay between reaching readiness and the monitor's first probe.
const MONITOR_STARTUP_DELAY: Duration = Duration::from_secs(5);

/// Probe cadence while the channel reports `Ready`.
const HEALTHY_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Probe cadence while the channel reports anything else survivable.
const DEGRADED_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// High-level connection state exposed through health reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport handle exists.
    Disconnected,
    /// First connection attempt in flight.
    Connecting,
    /// Transport handle is live.
    Connected,
    /// A later connection attempt in flight.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Outcome type of the shared pending-connect future.
type SharedConnect = Shared<BoxFuture<'static, std::result::Result<(), Arc<ClientError>>>>;

struct ManagerInner {
    config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
    state: RwLock<ConnectionState>,
    handle: RwLock<Option<Arc<dyn Transport>>>,
    pending_connect: Mutex<Option<SharedConnect>>,
    reconnect_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    monitor_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    reconnect_attempts: AtomicU32,
    shutting_down: AtomicBool,
    last_connected_at: RwLock<Option<SystemTime>>,
    last_error_at: RwLock<Option<SystemTime>>,
    last_error: RwLock<Option<String>>,
    events: EventBus,
}

/// Owns the transport handle and the connection state machine.
///
/// Cloning is cheap; all clones share the same state. Every method is safe
/// to call concurrently.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("service", &self.inner.config.service_name)
            .field("state", &*self.inner.state.read())
            .field("reconnect_attempts", &self.inner.reconnect_attempts)
            .field("shutting_down", &self.inner.shutting_down)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager in the `Disconnected` state. No I/O happens until
    /// [`ensure_connected`](Self::ensure_connected) is called.
    #[must_use]
    pub fn new(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                factory,
                state: RwLock::new(ConnectionState::Disconnected),
                handle: RwLock::new(None),
                pending_connect: Mutex::new(None),
                reconnect_timer: Mutex::new(None),
                monitor_task: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                shutting_down: AtomicBool::new(false),
                last_connected_at: RwLock::new(None),
                last_error_at: RwLock::new(None),
                last_error: RwLock::new(None),
                events: EventBus::new(),
            }),
        }
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Returns whether the client currently holds a live connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.state.read() == ConnectionState::Connected
            && self.inner.handle.read().is_some()
    }

    /// Returns the live transport handle, if any.
    #[must_use]
    pub(crate) fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.handle.read().clone()
    }

    /// Number of reconnect attempts since the last successful connect.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// When the client last reached `Connected`.
    #[must_use]
    pub fn last_connected_at(&self) -> Option<SystemTime> {
        *self.inner.last_connected_at.read()
    }

    /// When the last connection error occurred.
    #[must_use]
    pub fn last_error_at(&self) -> Option<SystemTime> {
        *self.inner.last_error_at.read()
    }

    /// Description of the last connection error.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Registers a subscriber for lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        self.inner.events.emit(event);
    }

    /// Ensures a live connection, returning whether the client is connected.
    ///
    /// Idempotent and safe under concurrency: when a connect attempt is
    /// already in flight, callers await the same shared future instead of
    /// starting another attempt. Returns `false` without connecting once
    /// the client is shutting down.
    pub async fn ensure_connected(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        if self.is_shutting_down() {
            return false;
        }

        let connect = {
            let mut pending = self.inner.pending_connect.lock();
            match pending.as_ref() {
                Some(shared) => shared.clone(),
                None => {
                    let manager = self.clone();
                    let shared = async move {
                        let result = manager.connect().await.map_err(Arc::new);
                        // Clear the slot regardless of outcome so the next
                        // disconnect can start a fresh attempt.
                        manager.inner.pending_connect.lock().take();
                        result
                    }
                    .boxed()
                    .shared();
                    *pending = Some(shared.clone());
                    shared
                }
            }
        };

        let _ = connect.await;
        self.is_connected()
    }

    /// Runs one connection attempt.
    ///
    /// On failure the error is recorded, an `error` event fires and the
    /// next reconnect is scheduled before the error is returned.
    async fn connect(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(ClientError::Shutdown);
        }

        let attempts = self.inner.reconnect_attempts.load(Ordering::Relaxed);
        {
            let mut state = self.inner.state.write();
            *state = if attempts > 0 {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            };
        }
        info!(
            service = %self.inner.config.service_name,
            url = %self.inner.config.grpc_url,
            attempt = attempts,
            "connecting"
        );
        self.inner.events.emit(ClientEvent::Connecting);

        let result = async {
            let handle = self.inner.factory.create()?;
            handle.wait_for_ready(self.inner.config.timeout).await?;
            Ok::<_, ClientError>(handle)
        }
        .await;

        match result {
            Ok(handle) => {
                *self.inner.handle.write() = Some(handle);
                *self.inner.state.write() = ConnectionState::Connected;
                *self.inner.last_connected_at.write() = Some(SystemTime::now());
                *self.inner.last_error.write() = None;
                self.inner.reconnect_attempts.store(0, Ordering::Relaxed);
                info!(service = %self.inner.config.service_name, "connected");
                self.inner.events.emit(ClientEvent::Connected);
                self.start_monitor();
                Ok(())
            }
            Err(err) => {
                *self.inner.last_error_at.write() = Some(SystemTime::now());
                *self.inner.last_error.write() = Some(err.to_string());
                *self.inner.state.write() = ConnectionState::Disconnected;
                warn!(
                    service = %self.inner.config.service_name,
                    error = %err,
                    "connection attempt failed"
                );
                self.inner.events.emit(ClientEvent::Error {
                    code: err.status_code(),
                    message: err.to_string(),
                });
                self.schedule_reconnect();
                Err(err)
            }
        }
    }

    /// Starts the channel monitor for the current handle, replacing any
    /// previous monitor.
    fn start_monitor(&self) {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(MONITOR_STARTUP_DELAY).await;
            loop {
                if manager.is_shutting_down() {
                    break;
                }
                let Some(handle) = manager.transport() else {
                    break;
                };
                match handle.channel_state().await {
                    ChannelState::Ready => {
                        tokio::time::sleep(HEALTHY_PROBE_INTERVAL).await;
                    }
                    state @ (ChannelState::TransientFailure | ChannelState::Shutdown) => {
                        warn!(
                            service = %manager.inner.config.service_name,
                            channel_state = %state,
                            "channel became unhealthy"
                        );
                        manager.handle_connection_lost().await;
                        break;
                    }
                    state => {
                        debug!(
                            service = %manager.inner.config.service_name,
                            channel_state = %state,
                            "channel not ready, probing again shortly"
                        );
                        tokio::time::sleep(DEGRADED_PROBE_INTERVAL).await;
                    }
                }
            }
        });

        if let Some(previous) = self.inner.monitor_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Handles a lost connection: drops the handle, emits `disconnected`
    /// and schedules a reconnect. No-op unless currently connected.
    pub async fn handle_connection_lost(&self) {
        {
            let mut state = self.inner.state.write();
            if *state != ConnectionState::Connected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }

        warn!(service = %self.inner.config.service_name, "connection lost");
        self.inner.events.emit(ClientEvent::Disconnected);

        let handle = self.inner.handle.write().take();
        if let Some(handle) = handle {
            // Best effort: the handle may already be dead.
            handle.close().await;
        }

        self.schedule_reconnect();
    }

    /// Arms the single-slot reconnect timer, unless one is armed, the
    /// client is shutting down, or the attempt budget is exhausted.
    fn schedule_reconnect(&self) {
        if self.is_shutting_down() {
            return;
        }

        let mut timer = self.inner.reconnect_timer.lock();
        if timer.as_ref().is_some_and(|armed| !armed.is_finished()) {
            return;
        }

        let attempts = self.inner.reconnect_attempts.load(Ordering::Relaxed);
        if let Some(max) = self.inner.config.max_reconnect_attempts {
            if attempts >= max {
                warn!(
                    service = %self.inner.config.service_name,
                    attempts,
                    "max reconnect attempts reached, giving up until next ensure_connected"
                );
                return;
            }
        }

        let delay = reconnect_delay(
            self.inner.config.initial_reconnect_delay,
            self.inner.config.max_reconnect_delay,
            attempts,
        );
        self.inner.reconnect_attempts.store(attempts + 1, Ordering::Relaxed);
        info!(
            service = %self.inner.config.service_name,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        let manager = self.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Clear the slot so a later disconnect can arm a new timer.
            manager.inner.reconnect_timer.lock().take();
            if manager.is_shutting_down() {
                return;
            }
            // Routed through the deduplicated path; failures schedule the
            // next attempt from within connect().
            let _ = manager.ensure_connected().await;
        }));
    }

    /// Shuts the manager down: cancels timers, closes the handle, emits a
    /// final `disconnected` and detaches all listeners. Idempotent; no
    /// state transition can leave `Disconnected` afterwards.
    pub async fn close(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(timer) = self.inner.reconnect_timer.lock().take() {
            timer.abort();
        }
        if let Some(monitor) = self.inner.monitor_task.lock().take() {
            monitor.abort();
        }

        let handle = self.inner.handle.write().take();
        if let Some(handle) = handle {
            handle.close().await;
        }

        *self.inner.state.write() = ConnectionState::Disconnected;
        info!(service = %self.inner.config.service_name, "connection manager closed");
        self.inner.events.emit(ClientEvent::Disconnected);
        self.inner.events.close();
    }
}

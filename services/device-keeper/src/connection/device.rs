//! Device Connection
//!
//! One long-lived socket to an agent for a single (device, channel) pair.
//! Owns the socket, the heartbeat and the retry counter, and reacts to
//! socket events through a single transition function.
//!
//! Concurrency: `running` and `connecting` are compare-and-set guards, so
//! discovery ticks and socket callbacks racing on the same connection can
//! never start two connect attempts or schedule a reconnect after `stop()`.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::cli::config::Config;
use crate::connection::backoff::BackoffPolicy;
use crate::connection::protocol::{AgentSignal, MessageInterpreter};
use crate::connection::scheduler::{Scheduler, TaskHandle};
use crate::connection::state::{ConnectionState, StateTracker, StateTransition};
use crate::connection::target::ConnectionKey;
use crate::connection::transport::{Dialer, LinkWriter, SocketEvent};
use crate::directory::adapter::{ConnectionTarget, DeviceAddress, DeviceAddressSink};
use crate::sync::{DeviceSync, SyncOutcome};

pub(crate) type ConnectionTable = DashMap<ConnectionKey, Arc<DeviceConnection>>;

/// How an agent tells us a device is gone for good
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflinePolicy {
    pub close_code: u16,
    pub reason_marker: String,
}

impl Default for OfflinePolicy {
    fn default() -> Self {
        Self {
            close_code: 1001,
            reason_marker: "DEVICE_OFFLINE".to_string(),
        }
    }
}

impl OfflinePolicy {
    /// Permanent when the code is the sentinel or the reason carries the marker
    pub fn is_permanent(&self, code: Option<u16>, reason: &str) -> bool {
        code == Some(self.close_code)
            || (!self.reason_marker.is_empty() && reason.contains(&self.reason_marker))
    }
}

/// Timing and retry settings shared by every connection
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub ping_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// `None` retries forever
    pub max_retries: Option<u32>,
    pub offline: OfflinePolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            max_retries: Some(10),
            offline: OfflinePolicy::default(),
        }
    }
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.connection.heartbeat_interval(),
            ping_timeout: config.connection.ping_timeout(),
            backoff: config.retry.backoff(),
            max_retries: config.retry.budget(),
            offline: OfflinePolicy {
                close_code: config.connection.offline_close_code,
                reason_marker: config.connection.offline_reason_marker.clone(),
            },
        }
    }
}

/// Collaborators shared by every connection in the process
pub struct ConnectionContext {
    pub scheduler: Scheduler,
    pub dialer: Arc<dyn Dialer>,
    pub sink: Arc<dyn DeviceAddressSink>,
    pub sync: Arc<dyn DeviceSync>,
    pub settings: ConnectionSettings,
}

/// Why a connection reached `Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit `stop()` or registry removal
    Requested,
    /// A newer connection with a different URL took over the key
    Replaced,
    /// The agent closed with the offline sentinel
    DeviceOffline,
    /// Retry budget spent
    RetriesExhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::Replaced => write!(f, "replaced by a new connection"),
            StopReason::DeviceOffline => write!(f, "device offline"),
            StopReason::RetriesExhausted => write!(f, "retry budget exhausted"),
        }
    }
}

struct ActiveLink {
    generation: u64,
    writer: LinkWriter,
    reader: Option<TaskHandle>,
}

pub struct DeviceConnection {
    key: ConnectionKey,
    url: String,
    target: ConnectionTarget,
    instance: Uuid,
    interpreter: MessageInterpreter,
    ctx: Arc<ConnectionContext>,
    table: Weak<ConnectionTable>,

    state: StateTracker,
    running: AtomicBool,
    connecting: AtomicBool,
    retry: AtomicU32,
    generation: AtomicU64,

    socket: Mutex<Option<ActiveLink>>,
    heartbeat: Mutex<Option<TaskHandle>>,
    reconnect: Mutex<Option<TaskHandle>>,
}

impl DeviceConnection {
    pub(crate) fn new(
        key: ConnectionKey,
        url: String,
        target: ConnectionTarget,
        ctx: Arc<ConnectionContext>,
        table: Weak<ConnectionTable>,
    ) -> Arc<Self> {
        let interpreter =
            MessageInterpreter::new(target.platform, target.host.clone(), target.device_id.clone());

        Arc::new(Self {
            key,
            url,
            target,
            instance: Uuid::new_v4(),
            interpreter,
            ctx,
            table,
            state: StateTracker::new(),
            running: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            retry: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            socket: Mutex::new(None),
            heartbeat: Mutex::new(None),
            reconnect: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a socket is currently attached
    pub fn is_connected(&self) -> bool {
        self.socket.lock().is_some()
    }

    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat.lock().is_some()
    }

    pub fn recent_transitions(&self, count: usize) -> Vec<StateTransition> {
        self.state.recent_transitions(count)
    }

    /// Idempotent entry point, called on every discovery tick.
    ///
    /// The first call starts connecting; later calls reconnect right away
    /// if no socket is attached, and do nothing otherwise.
    pub fn start(self: &Arc<Self>) {
        if self.state.is_stopped() {
            return;
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Lost a race with stop(); stay down
            if self.state.is_stopped() {
                self.running.store(false, Ordering::SeqCst);
                return;
            }
            info!(key = %self.key, instance = %self.instance, "Connection started");
            self.spawn_connect();
        } else if !self.is_connected() {
            self.spawn_connect();
        }
    }

    /// Tear down without touching the registry or the stored address.
    ///
    /// The registry entry stays in place in the `Stopped` state until the
    /// next `ensure` for the key replaces it, so `contains()` and `len()`
    /// still count it. Use `ConnectionRegistry::remove` to drop the entry.
    pub fn stop(&self) {
        self.stop_with(StopReason::Requested);
    }

    pub(crate) fn stop_with(&self, reason: StopReason) {
        let was_running = self.running.swap(false, Ordering::SeqCst);

        self.cancel_heartbeat();
        let pending = self.reconnect.lock().take();
        if let Some(pending) = pending {
            pending.cancel();
        }

        let link = self.socket.lock().take();
        if let Some(link) = link {
            self.state
                .transition_to(ConnectionState::Closing, Some(reason.to_string()));
            link.writer.close();
            if let Some(reader) = link.reader {
                reader.cancel();
            }
        }
        self.state
            .transition_to(ConnectionState::Stopped, Some(reason.to_string()));

        if was_running {
            info!(key = %self.key, instance = %self.instance, %reason, "Connection stopped");
        }
    }

    fn spawn_connect(self: &Arc<Self>) {
        let this = self.clone();
        self.ctx.scheduler.execute(async move {
            this.do_connect().await;
        });
    }

    async fn do_connect(self: Arc<Self>) {
        if !self.is_running() || self.is_connected() {
            return;
        }
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        // Another attempt may have attached a socket since the check above
        if !self.is_running() || self.is_connected() {
            self.connecting.store(false, Ordering::SeqCst);
            return;
        }

        self.state.transition_to(ConnectionState::Connecting, None);
        info!(key = %self.key, url = %self.url, "Connecting to agent");

        let link = match self.ctx.dialer.dial(&self.url).await {
            Ok(link) => link,
            Err(e) => {
                self.connecting.store(false, Ordering::SeqCst);
                error!(key = %self.key, url = %self.url, error = %e, "Connect failed");
                self.schedule_reconnect();
                return;
            }
        };

        let (writer, mut events) = link.split();
        if !self.is_running() {
            writer.close();
            self.connecting.store(false, Ordering::SeqCst);
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            // Held until the link is fully attached; the reader's first
            // event blocks on it and therefore always sees an Open socket.
            let mut socket = self.socket.lock();
            let weak = Arc::downgrade(&self);
            let reader = self.ctx.scheduler.spawn_io(async move {
                while let Some(event) = events.recv().await {
                    match weak.upgrade() {
                        Some(this) => this.handle_event(generation, event),
                        None => return,
                    }
                }
                // Link dropped without a final event; no-op if already detached
                if let Some(this) = weak.upgrade() {
                    this.handle_event(
                        generation,
                        SocketEvent::Closed {
                            code: None,
                            reason: "link dropped".to_string(),
                        },
                    );
                }
            });
            *socket = Some(ActiveLink {
                generation,
                writer,
                reader: Some(reader),
            });

            self.retry.store(0, Ordering::SeqCst);
            self.state.transition_to(ConnectionState::Open, None);
            self.schedule_ping();
        }
        // A discovery tick may have connected ahead of a pending backoff timer
        let pending = self.reconnect.lock().take();
        if let Some(pending) = pending {
            pending.cancel();
        }
        self.connecting.store(false, Ordering::SeqCst);

        // stop() may have run while the socket was being attached
        if !self.is_running() {
            self.stop_with(StopReason::Requested);
            return;
        }

        info!(key = %self.key, url = %self.url, instance = %self.instance, "Connected to agent");
    }

    /// Single transition function for everything a socket reports
    pub(crate) fn handle_event(self: &Arc<Self>, generation: u64, event: SocketEvent) {
        match event {
            SocketEvent::Text(text) => {
                if !self.is_current(generation) {
                    return;
                }
                debug!(key = %self.key, frame = %text, "Received text frame");
                match self.interpreter.interpret(&text) {
                    Ok(Some(AgentSignal::DeviceReady(address))) => self.publish_address(address),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(key = %self.key, error = %e, "Dropping malformed frame");
                    }
                }
            }
            SocketEvent::Binary(len) => {
                trace!(key = %self.key, len, "Received binary frame");
            }
            SocketEvent::Ping => {
                debug!(key = %self.key, "Received ping");
            }
            SocketEvent::Pong => {
                if !self.is_current(generation) {
                    return;
                }
                debug!(key = %self.key, "Received pong");
                self.report_heartbeat();
            }
            SocketEvent::Closed { code, reason } => {
                if !self.detach(generation) {
                    return;
                }
                info!(key = %self.key, ?code, reason = %reason, "Connection closed");
                if self.ctx.settings.offline.is_permanent(code, &reason) {
                    info!(key = %self.key, "Device offline, not reconnecting");
                    self.terminate(StopReason::DeviceOffline);
                } else {
                    self.schedule_reconnect();
                }
            }
            SocketEvent::Error(e) => {
                if !self.detach(generation) {
                    return;
                }
                error!(key = %self.key, error = %e, "Connection error");
                self.schedule_reconnect();
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.socket
            .lock()
            .as_ref()
            .is_some_and(|l| l.generation == generation)
    }

    /// Drop the socket if it is still the one `generation` refers to
    fn detach(&self, generation: u64) -> bool {
        {
            let mut socket = self.socket.lock();
            if !socket.as_ref().is_some_and(|l| l.generation == generation) {
                return false;
            }
            *socket = None;
        }
        self.cancel_heartbeat();
        self.state
            .transition_to(ConnectionState::Connecting, Some("disconnected".to_string()));
        true
    }

    fn schedule_ping(self: &Arc<Self>) {
        let interval = self.ctx.settings.heartbeat_interval;
        let wait = self.ctx.settings.ping_timeout;
        let weak = Arc::downgrade(self);

        let task = self
            .ctx
            .scheduler
            .schedule_at_fixed_rate(interval, interval, move || {
                let weak = weak.clone();
                async move {
                    if let Some(this) = weak.upgrade() {
                        this.ping_once(wait).await;
                    }
                }
            });

        if let Some(previous) = self.heartbeat.lock().replace(task) {
            previous.cancel();
        }
    }

    // A failed ping is only logged; close/error events drive reconnection.
    async fn ping_once(&self, wait: Duration) {
        let writer = self.socket.lock().as_ref().map(|l| l.writer.clone());
        let Some(writer) = writer else {
            return;
        };
        match writer.ping(wait).await {
            Ok(()) => trace!(key = %self.key, "Ping sent"),
            Err(e) => warn!(key = %self.key, error = %e, "Ping failed"),
        }
    }

    fn cancel_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().take() {
            task.cancel();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.is_running() {
            return;
        }

        let attempt = self.retry.load(Ordering::SeqCst);
        if let Some(max) = self.ctx.settings.max_retries {
            if attempt >= max {
                warn!(
                    key = %self.key,
                    url = %self.url,
                    max_retries = max,
                    "Retry budget exhausted, giving up on connection"
                );
                self.terminate(StopReason::RetriesExhausted);
                return;
            }
        }

        self.retry.fetch_add(1, Ordering::SeqCst);
        let delay = self.ctx.settings.backoff.delay(attempt);
        self.state
            .transition_to(ConnectionState::Reconnecting, None);

        info!(
            key = %self.key,
            attempt = attempt + 1,
            max_retries = ?self.ctx.settings.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let this = self.clone();
        let task = self.ctx.scheduler.schedule(delay, async move {
            this.do_connect().await;
        });
        if let Some(previous) = self.reconnect.lock().replace(task) {
            previous.cancel();
        }

        if !self.is_running() {
            if let Some(task) = self.reconnect.lock().take() {
                task.cancel();
            }
        }
    }

    /// Terminal stop: tear down, leave the registry, clear the address
    fn terminate(self: &Arc<Self>, reason: StopReason) {
        self.stop_with(reason);

        if let Some(table) = self.table.upgrade() {
            let removed = table
                .remove_if(&self.key, |_, current| Arc::ptr_eq(current, self))
                .is_some();
            debug!(key = %self.key, removed, "Left connection registry");
        }

        let sink = self.ctx.sink.clone();
        let sync = self.ctx.sync.clone();
        let device_id = self.target.device_id.clone();
        self.ctx.scheduler.execute(async move {
            sync.forget(&device_id);
            if let Err(e) = sink.clear(&device_id).await {
                warn!(device_id = %device_id, error = %e, "Failed to clear device address");
            }
        });
    }

    fn publish_address(&self, address: DeviceAddress) {
        info!(key = %self.key, address = %address.endpoint(), "Device reachable");

        let sink = self.ctx.sink.clone();
        let sync = self.ctx.sync.clone();
        let target = self.target.clone();
        self.ctx.scheduler.execute(async move {
            if let Err(e) = sink.upsert(&address).await {
                warn!(device_id = %address.device_id, error = %e, "Failed to store device address");
            }
            match sync.device_ready(&target, &address).await {
                Ok(SyncOutcome::Written) => {}
                Ok(SyncOutcome::Unchanged) => {
                    trace!(device_id = %address.device_id, "Pool sync skipped, address unchanged");
                }
                Err(e) => {
                    warn!(device_id = %address.device_id, error = %e, "Pool sync failed");
                }
            }
        });
    }

    fn report_heartbeat(&self) {
        let sync = self.ctx.sync.clone();
        let host = self.target.host.clone();
        let ids = vec![self.target.device_id.clone()];
        self.ctx.scheduler.execute(async move {
            if let Err(e) = sync.heartbeat(&host, &ids).await {
                warn!(device_ids = ?ids, error = %e, "Pool heartbeat failed");
            }
        });
    }
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("key", &self.key)
            .field("url", &self.url)
            .field("instance", &self.instance)
            .field("state", &self.state.current())
            .field("retry", &self.retry_count())
            .finish()
    }
}

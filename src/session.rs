//! Connection session for a single controller.
//!
//! A [`ConnectionSession`] owns the link to one controller. It selects and
//! opens the device, keeps the link alive with one automatic reconnect after
//! an unexpected drop, decodes telemetry in arrival order, and dispatches
//! commands over the control characteristic.
//!
//! All inbound link traffic goes through a single supervisor task, so frames
//! reach the fuel estimator in order and a disconnect is never processed
//! ahead of frames that preceded it.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::connection::{ConnectionEvent, ConnectionState};
use crate::ble::scanner::BtleTransport;
use crate::ble::transport::{DeviceIdentity, Link, LinkEvent, LinkEventSender, Transport};
use crate::config::SessionConfig;
use crate::data::{FuelStatus, TimedReading};
use crate::error::{Error, Result};
use crate::monitor::{TelemetryMonitor, TelemetryUpdate};
use crate::protocol::{CommandRequest, EncodeWarning, Encoded, Setting, TelemetryReading};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Outcome of a successful [`ConnectionSession::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReport {
    /// The controller that was connected.
    pub device: DeviceIdentity,
    /// Open attempts used. Zero when the session was already connected.
    pub attempts: u32,
    /// Whether the authorization probe succeeded.
    pub authorized: bool,
    /// Whether the control characteristic was found.
    pub control_available: bool,
}

/// Outcome of a successful [`ConnectionSession::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// The bytes that were written.
    pub request: CommandRequest,
    /// Set when the value was substituted before sending.
    pub warning: Option<EncodeWarning>,
    /// Whether the next telemetry update will report on this setting.
    pub verifiable: bool,
}

/// The link currently committed to the session.
struct ActiveLink {
    id: u64,
    link: Arc<dyn Link>,
    control: bool,
}

/// What a freshly opened link offered.
struct Established {
    control: bool,
    authorized: bool,
}

struct SessionInner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    link: RwLock<Option<ActiveLink>>,
    device: RwLock<Option<DeviceIdentity>>,
    /// Link whose events are accepted. Events from any other link are stale.
    current_link_id: AtomicU64,
    next_link_id: AtomicU64,
    /// Last link that reported a drop before it was committed.
    dropped_link: AtomicU64,
    /// Bumped by every `connect()` and `disconnect()`.
    epoch: AtomicU64,
    intentional_disconnect: AtomicBool,
    authorized: AtomicBool,
    monitor: RwLock<TelemetryMonitor>,
    events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    connection_tx: broadcast::Sender<ConnectionEvent>,
    telemetry_tx: broadcast::Sender<TelemetryUpdate>,
    callback_counter: AtomicU64,
}

/// A session with one BBQ controller.
pub struct ConnectionSession {
    inner: Arc<SessionInner>,
    supervisor: JoinHandle<()>,
}

impl ConnectionSession {
    /// Create a session over `transport`.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let capacity = config.channel_capacity.max(1);
        let (connection_tx, _) = broadcast::channel(capacity);
        let (telemetry_tx, _) = broadcast::channel(capacity);

        let inner = Arc::new(SessionInner {
            monitor: RwLock::new(TelemetryMonitor::new(&config)),
            config,
            transport,
            state: RwLock::new(ConnectionState::Disconnected),
            link: RwLock::new(None),
            device: RwLock::new(None),
            current_link_id: AtomicU64::new(0),
            next_link_id: AtomicU64::new(0),
            dropped_link: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            intentional_disconnect: AtomicBool::new(false),
            authorized: AtomicBool::new(false),
            events_tx,
            connection_tx,
            telemetry_tx,
            callback_counter: AtomicU64::new(0),
        });

        let supervisor = tokio::spawn(supervise(Arc::downgrade(&inner), events_rx));

        Self { inner, supervisor }
    }

    /// Create a session over the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn bluetooth(config: SessionConfig) -> Result<Self> {
        let transport = BtleTransport::new(config.scan_timeout).await?;
        Ok(Self::new(Arc::new(transport), config))
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // === Connection ===

    /// Select a controller and connect to it.
    ///
    /// Opening the channel is retried with a fixed backoff. Once open, the
    /// telemetry and control characteristics are resolved, notifications are
    /// enabled and the control characteristic is read once to trigger pairing.
    /// A failed read is not fatal; it leaves the session unauthorized and
    /// emits [`ConnectionEvent::AuthorizationPending`].
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionInProgress`] if a connect or reconnect is running.
    /// - [`Error::ChannelOpenFailure`] once every attempt has failed.
    /// - [`Error::ConnectAborted`] if `disconnect()` was called meanwhile.
    pub async fn connect(&self) -> Result<ConnectReport> {
        self.inner.connect().await
    }

    /// Close the link and cancel any pending reconnect.
    ///
    /// The session ends up `Disconnected` even if closing the link fails.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// The selected controller, if any.
    pub fn device(&self) -> Option<DeviceIdentity> {
        self.inner.device.read().clone()
    }

    /// Whether the controller has accepted a control read or write.
    pub fn is_authorized(&self) -> bool {
        self.inner.authorized.load(Ordering::SeqCst)
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection_tx.subscribe()
    }

    /// Register a callback for connection lifecycle events.
    pub fn on_connection_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let callback_id = self.inner.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.inner.connection_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Connection callback missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    // === Commands ===

    /// Write a command to the controller.
    ///
    /// Success means the write was acknowledged, not that the controller
    /// applied the value. Use [`apply`](Self::apply) to have it checked
    /// against the next reading.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] without a link or a control characteristic.
    /// - [`Error::AuthorizationRequired`] if the controller rejected the write
    ///   for pairing or security reasons.
    pub async fn send(&self, request: CommandRequest) -> Result<()> {
        self.inner.send(request).await
    }

    /// Encode and send a setting, then check it against the next reading.
    pub async fn apply(&self, setting: Setting) -> Result<Applied> {
        let Encoded { request, warning } = setting.encode();
        if let Some(warning) = warning {
            warn!("{:?}: {}", setting, warning);
        }

        self.inner.send(request).await?;

        let verifiable = setting.opcode().is_verifiable();
        if verifiable {
            self.inner.monitor.write().track_pending(setting);
        }

        Ok(Applied {
            request,
            warning,
            verifiable,
        })
    }

    // === Telemetry ===

    /// Subscribe to decoded telemetry.
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryUpdate> {
        self.inner.telemetry_tx.subscribe()
    }

    /// Register a callback for decoded telemetry.
    pub fn on_telemetry<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&TelemetryUpdate) + Send + Sync + 'static,
    {
        let callback_id = self.inner.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.inner.telemetry_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => callback(&update),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Telemetry callback missed {} updates", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Most recent reading.
    pub fn latest(&self) -> Option<TimedReading> {
        self.inner.monitor.read().latest().cloned()
    }

    /// Current fuel estimate.
    pub fn fuel_status(&self) -> FuelStatus {
        self.inner.monitor.read().fuel_status().clone()
    }

    /// Restart fuel estimation, e.g. after adding charcoal.
    pub fn reset_fuel(&self) {
        info!("Fuel estimate reset");
        self.inner.monitor.write().reset_fuel();
    }

    /// All buffered readings, oldest first.
    pub fn history(&self) -> Vec<TimedReading> {
        self.inner.monitor.read().history().iter().cloned().collect()
    }

    /// Readings received within `span` of the newest one.
    pub fn recent_history(&self, span: chrono::Duration) -> Vec<TimedReading> {
        self.inner.monitor.read().history().recent(span)
    }

    /// Whether the heartbeat bit has stopped toggling.
    pub fn is_stale(&self) -> bool {
        self.inner
            .monitor
            .read()
            .is_stale(Utc::now(), self.inner.config.stale_timeout)
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

/// Process link events in arrival order until the session goes away.
async fn supervise(inner: Weak<SessionInner>, mut rx: mpsc::UnboundedReceiver<(u64, LinkEvent)>) {
    while let Some((link_id, event)) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_link_event(link_id, event).await;
    }
    debug!("Session supervisor stopped");
}

impl SessionInner {
    /// Whether the connect or reconnect started at `epoch` may still commit.
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
            && !self.intentional_disconnect.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.connection_tx.send(event);
    }

    fn announce(&self, from: ConnectionState, to: ConnectionState) {
        if from != to {
            debug!("Connection state changed: {} -> {}", from, to);
            self.emit(ConnectionEvent::StateChanged { from, to });
        }
    }

    /// Move to `Disconnected` if nothing else has moved the session since `epoch`.
    fn fail(&self, epoch: u64, expected: ConnectionState) -> bool {
        let failed = {
            let mut state = self.state.write();
            if self.is_current(epoch) && *state == expected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        };
        if failed {
            self.announce(expected, ConnectionState::Disconnected);
        }
        failed
    }

    async fn connect(&self) -> Result<ConnectReport> {
        let epoch = {
            let mut state = self.state.write();
            match *state {
                ConnectionState::Connected => None,
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    return Err(Error::ConnectionInProgress);
                }
                ConnectionState::Disconnected => {
                    *state = ConnectionState::Connecting;
                    self.intentional_disconnect.store(false, Ordering::SeqCst);
                    Some(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
                }
            }
        };

        let Some(epoch) = epoch else {
            debug!("Already connected");
            return self.current_report();
        };
        self.announce(ConnectionState::Disconnected, ConnectionState::Connecting);

        let device = match self.transport.select_device(&self.config.filter).await {
            Ok(device) => device,
            Err(e) => {
                warn!("Device selection failed: {}", e);
                if self.fail(epoch, ConnectionState::Connecting) {
                    return Err(e);
                }
                return Err(Error::ConnectAborted);
            }
        };

        if !self.is_current(epoch) {
            return Err(Error::ConnectAborted);
        }
        info!("Connecting to {}", device);
        *self.device.write() = Some(device.clone());
        self.emit(ConnectionEvent::DeviceSelected(device.clone()));

        let max_attempts = self.config.connect_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = None;

        let (link_id, link) = loop {
            if !self.is_current(epoch) {
                debug!("Connect to {} aborted", device);
                return Err(Error::ConnectAborted);
            }
            if attempts == max_attempts {
                break None;
            }

            attempts += 1;
            debug!("Connection attempt {} of {}", attempts, max_attempts);
            self.emit(ConnectionEvent::ConnectAttempt {
                attempt: attempts,
                max_attempts,
            });

            match self.open_link(&device).await {
                Ok(opened) => break Some(opened),
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempts, e);
                    last_error = Some(e);
                    if attempts < max_attempts {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
            }
        }
        .ok_or_else(|| Error::ChannelOpenFailure {
            attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        })
        .map_err(|e| {
            if self.fail(epoch, ConnectionState::Connecting) {
                error!("{}", e);
                self.emit(ConnectionEvent::ConnectFailed {
                    attempts,
                    reason: e.to_string(),
                    remediation: e.remediation(),
                });
            }
            e
        })?;

        match self
            .establish_and_commit(epoch, ConnectionState::Connecting, link_id, link)
            .await
        {
            Ok(established) => {
                info!("Connected to {}", device);
                Ok(ConnectReport {
                    device,
                    attempts,
                    authorized: established.authorized,
                    control_available: established.control,
                })
            }
            Err(Error::ConnectAborted) => Err(Error::ConnectAborted),
            Err(e) => {
                if self.fail(epoch, ConnectionState::Connecting) {
                    error!("Failed to set up {}: {}", device, e);
                    self.emit(ConnectionEvent::ConnectFailed {
                        attempts,
                        reason: e.to_string(),
                        remediation: e.remediation(),
                    });
                }
                Err(e)
            }
        }
    }

    fn current_report(&self) -> Result<ConnectReport> {
        let device = self.device.read().clone().ok_or(Error::NotConnected)?;
        let control_available = self
            .link
            .read()
            .as_ref()
            .map(|active| active.control)
            .unwrap_or(false);

        Ok(ConnectReport {
            device,
            attempts: 0,
            authorized: self.authorized.load(Ordering::SeqCst),
            control_available,
        })
    }

    /// Open a link whose events the supervisor will accept.
    async fn open_link(&self, device: &DeviceIdentity) -> Result<(u64, Arc<dyn Link>)> {
        let link_id = self.next_link_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.current_link_id.store(link_id, Ordering::SeqCst);

        let events = LinkEventSender::new(link_id, self.events_tx.clone());
        let link = self.transport.open(device, events).await?;

        Ok((link_id, link))
    }

    /// Resolve endpoints, subscribe and probe authorization on a new link.
    async fn establish(&self, link: &Arc<dyn Link>) -> Result<Established> {
        let endpoints = link.resolve_endpoints().await?;
        debug!("Endpoints: {:?}", endpoints);

        if !endpoints.telemetry {
            return Err(Error::CharacteristicNotFound {
                uuid: crate::ble::uuids::TELEMETRY_CHARACTERISTIC_UUID.to_string(),
            });
        }

        link.subscribe().await?;

        if !endpoints.control {
            warn!("Control characteristic missing, commands are unavailable");
            self.emit(ConnectionEvent::ControlUnavailable);
            return Ok(Established {
                control: false,
                authorized: false,
            });
        }

        let authorized = match link.read_control().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Authorization probe failed, first write may need pairing: {}", e);
                self.emit(ConnectionEvent::AuthorizationPending {
                    reason: e.to_string(),
                });
                false
            }
        };

        Ok(Established {
            control: true,
            authorized,
        })
    }

    /// Set up `link` and make it the session's link, unless superseded.
    async fn establish_and_commit(
        &self,
        epoch: u64,
        expected: ConnectionState,
        link_id: u64,
        link: Arc<dyn Link>,
    ) -> Result<Established> {
        if !self.is_current(epoch) {
            abandon(&link).await;
            return Err(Error::ConnectAborted);
        }

        let established = match self.establish(&link).await {
            Ok(established) => established,
            Err(e) => {
                abandon(&link).await;
                return Err(e);
            }
        };

        let committed = {
            let mut state = self.state.write();
            if !self.is_current(epoch) || *state != expected {
                Err(Error::ConnectAborted)
            } else if self.dropped_link.load(Ordering::SeqCst) == link_id {
                Err(Error::LinkDropped)
            } else {
                *self.link.write() = Some(ActiveLink {
                    id: link_id,
                    link: link.clone(),
                    control: established.control,
                });
                self.authorized
                    .store(established.authorized, Ordering::SeqCst);
                self.monitor.write().link_reset();
                *state = ConnectionState::Connected;
                Ok(())
            }
        };

        if let Err(e) = committed {
            debug!("Link {} not committed: {}", link_id, e);
            abandon(&link).await;
            return Err(e);
        }

        self.announce(expected, ConnectionState::Connected);
        Ok(established)
    }

    async fn disconnect(&self) -> Result<()> {
        let (from, active) = {
            let mut state = self.state.write();
            self.intentional_disconnect.store(true, Ordering::SeqCst);
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.current_link_id.store(0, Ordering::SeqCst);
            let from = *state;
            *state = ConnectionState::Disconnected;
            (from, self.link.write().take())
        };
        self.authorized.store(false, Ordering::SeqCst);
        self.announce(from, ConnectionState::Disconnected);

        let Some(active) = active else {
            return Ok(());
        };

        match active.link.disconnect().await {
            Ok(()) => {
                info!("Disconnected link {}", active.id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                Err(e)
            }
        }
    }

    async fn send(&self, request: CommandRequest) -> Result<()> {
        let link = {
            let active = self.link.read();
            match active.as_ref() {
                Some(active) if active.control => active.link.clone(),
                _ => return Err(Error::NotConnected),
            }
        };

        let bytes = request.to_bytes();
        debug!("Sending {:?} = {}", request.opcode, request.argument);

        match link.write_control(&bytes).await {
            Ok(()) => {
                self.authorized.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) if e.is_authorization() => {
                warn!("Controller rejected {:?}: {}", request.opcode, e);
                self.authorized.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_link_event(&self, link_id: u64, event: LinkEvent) {
        if link_id != self.current_link_id.load(Ordering::SeqCst) {
            trace!("Ignoring {:?} from stale link {}", event, link_id);
            return;
        }

        match event {
            LinkEvent::Frame(data) => self.process_frame(&data),
            LinkEvent::Disconnected => self.handle_link_drop(link_id).await,
        }
    }

    fn process_frame(&self, data: &[u8]) {
        trace!("Telemetry frame: {:02X?}", data);

        let reading = match TelemetryReading::decode(data) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Dropping telemetry frame: {}", e);
                return;
            }
        };

        let update = self.monitor.write().ingest(reading, Utc::now());
        if update.fuel.low_fuel_alert {
            warn!(
                "Low fuel: duty {:.0}%, pit {:.2} F/min",
                update.fuel.mean_duty_percent, update.fuel.mean_drop_rate
            );
        }

        let _ = self.telemetry_tx.send(update);
    }

    /// Unsolicited drop: wait, then make exactly one reconnect attempt.
    async fn handle_link_drop(&self, link_id: u64) {
        let epoch = {
            let mut state = self.state.write();
            let is_active = self.link.read().as_ref().map(|active| active.id) == Some(link_id);
            if *state != ConnectionState::Connected
                || !is_active
                || self.intentional_disconnect.load(Ordering::SeqCst)
            {
                if state.is_transitioning() && !is_active {
                    // Not committed yet; the commit checks this and fails.
                    warn!("Link {} dropped during setup", link_id);
                    self.dropped_link.store(link_id, Ordering::SeqCst);
                } else {
                    debug!("Link {} closed while {}", link_id, *state);
                }
                return;
            }
            *state = ConnectionState::Reconnecting;
            self.link.write().take();
            self.epoch.load(Ordering::SeqCst)
        };

        self.authorized.store(false, Ordering::SeqCst);
        warn!("Connection lost, reconnecting in {:?}", self.config.reconnect_delay);
        self.announce(ConnectionState::Connected, ConnectionState::Reconnecting);
        self.emit(ConnectionEvent::LinkDropped);

        tokio::time::sleep(self.config.reconnect_delay).await;

        if !self.is_current(epoch) {
            debug!("Reconnect cancelled");
            return;
        }

        let device = self.device.read().clone();
        let result = match device {
            Some(device) => self.reconnect_once(epoch, &device).await,
            None => Err(Error::DeviceNotFound {
                filter: self.config.filter.to_string(),
            }),
        };

        match result {
            Ok(()) => info!("Reconnected"),
            Err(Error::ConnectAborted) => debug!("Reconnect cancelled"),
            Err(e) => {
                if self.fail(epoch, ConnectionState::Reconnecting) {
                    let failure = Error::ReconnectFailed {
                        reason: e.to_string(),
                    };
                    error!("{}", failure);
                    *self.device.write() = None;
                    self.emit(ConnectionEvent::ReconnectFailed {
                        reason: e.to_string(),
                        remediation: failure.remediation(),
                    });
                }
            }
        }
    }

    async fn reconnect_once(&self, epoch: u64, device: &DeviceIdentity) -> Result<()> {
        self.emit(ConnectionEvent::ConnectAttempt {
            attempt: 1,
            max_attempts: 1,
        });

        let (link_id, link) = self.open_link(device).await?;
        self.establish_and_commit(epoch, ConnectionState::Reconnecting, link_id, link)
            .await
            .map(|_| ())
    }
}

/// Close a link that never became the session's link.
async fn abandon(link: &Arc<dyn Link>) {
    if let Err(e) = link.disconnect().await {
        debug!("Failed to close abandoned link: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::{Endpoints, MockLink, MockTransport};
    use crate::protocol::{Opcode, Verification};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::Instant;

    type Captured = Arc<Mutex<Vec<LinkEventSender>>>;

    fn controller() -> DeviceIdentity {
        DeviceIdentity {
            id: "AA:BB:CC:DD:EE:FF".into(),
            name: Some("BBQ-0042".into()),
        }
    }

    fn healthy_link() -> MockLink {
        let mut link = MockLink::new();
        link.expect_resolve_endpoints().returning(|| {
            Ok(Endpoints {
                telemetry: true,
                control: true,
            })
        });
        link.expect_subscribe().returning(|| Ok(()));
        link.expect_read_control().returning(|| Ok(vec![0]));
        link.expect_disconnect().returning(|| Ok(()));
        link
    }

    fn shared(link: MockLink) -> Option<Arc<dyn Link>> {
        Some(Arc::new(link))
    }

    fn frame(pit: u16, heartbeat: bool) -> Vec<u8> {
        let mut frame = vec![0u8; 20];
        frame[3..5].copy_from_slice(&pit.to_be_bytes());
        frame[5..7].copy_from_slice(&999u16.to_be_bytes());
        frame[7..9].copy_from_slice(&999u16.to_be_bytes());
        frame[10] = 80;
        frame[14] = if heartbeat { 0x80 } else { 0 };
        frame
    }

    /// A transport whose `open` hands out `links` in order, failing when
    /// the next entry is `None`.
    fn transport(links: Vec<Option<Arc<dyn Link>>>) -> (MockTransport, Captured, Arc<AtomicUsize>) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let opens = Arc::new(AtomicUsize::new(0));

        let mut transport = MockTransport::new();
        transport
            .expect_select_device()
            .returning(|_| Ok(controller()));

        let slot = captured.clone();
        let count = opens.clone();
        transport.expect_open().returning(move |_, events| {
            let call = count.fetch_add(1, Ordering::SeqCst);
            slot.lock().push(events);
            match links.get(call).cloned().flatten() {
                Some(link) => Ok(link),
                None => Err(Error::Internal("radio busy".into())),
            }
        });

        (transport, captured, opens)
    }

    fn session(transport: MockTransport) -> ConnectionSession {
        ConnectionSession::new(Arc::new(transport), SessionConfig::default())
    }

    fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn sender(captured: &Captured, index: usize) -> LinkEventSender {
        captured.lock()[index].clone()
    }

    /// Hand-driven link for races the mocks cannot express: it can stall in
    /// `subscribe` and report its own drop from inside `read_control`.
    struct ScriptedLink {
        events: Option<LinkEventSender>,
        subscribe_delay: Duration,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Link for ScriptedLink {
        async fn resolve_endpoints(&self) -> Result<Endpoints> {
            Ok(Endpoints {
                telemetry: true,
                control: true,
            })
        }

        async fn subscribe(&self) -> Result<()> {
            tokio::time::sleep(self.subscribe_delay).await;
            Ok(())
        }

        async fn read_control(&self) -> Result<Vec<u8>> {
            if let Some(events) = &self.events {
                events.disconnected();
                // Let the supervisor see the drop before the read returns.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(vec![0])
        }

        async fn write_control(&self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scripted_transport(
        drops_during_setup: bool,
        subscribe_delay: Duration,
    ) -> (MockTransport, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let mut transport = MockTransport::new();
        transport
            .expect_select_device()
            .returning(|_| Ok(controller()));

        let count = opens.clone();
        let closes = closed.clone();
        transport.expect_open().returning(move |_, events| {
            count.fetch_add(1, Ordering::SeqCst);
            let link = ScriptedLink {
                events: drops_during_setup.then_some(events),
                subscribe_delay,
                closed: closes.clone(),
            };
            Ok(Arc::new(link) as Arc<dyn Link>)
        });

        (transport, opens, closed)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_success() {
        let (transport, _, opens) = transport(vec![shared(healthy_link())]);
        let session = session(transport);
        let mut events = session.subscribe_connection();

        let report = session.connect().await.unwrap();

        assert_eq!(report.device, controller());
        assert_eq!(report.attempts, 1);
        assert!(report.authorized);
        assert!(report.control_available);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.is_authorized());
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        assert_eq!(
            drain(&mut events),
            vec![
                ConnectionEvent::StateChanged {
                    from: ConnectionState::Disconnected,
                    to: ConnectionState::Connecting,
                },
                ConnectionEvent::DeviceSelected(controller()),
                ConnectionEvent::ConnectAttempt {
                    attempt: 1,
                    max_attempts: 3,
                },
                ConnectionEvent::StateChanged {
                    from: ConnectionState::Connecting,
                    to: ConnectionState::Connected,
                },
            ]
        );

        // Already connected: no second open.
        let report = session.connect().await.unwrap();
        assert_eq!(report.attempts, 0);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_backoff() {
        let (transport, _, opens) =
            transport(vec![None, None, shared(healthy_link())]);
        let session = session(transport);
        let mut events = session.subscribe_connection();

        let started = Instant::now();
        let report = session.connect().await.unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(opens.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));

        let attempts: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                ConnectionEvent::ConnectAttempt { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhausts_attempts() {
        let (transport, _, opens) = transport(vec![]);
        let session = session(transport);
        let mut events = session.subscribe_connection();

        let err = session.connect().await.unwrap_err();

        match err {
            Error::ChannelOpenFailure { attempts, ref reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("radio busy"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(opens.load(Ordering::SeqCst), 3);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(
                e,
                ConnectionEvent::ConnectFailed {
                    attempts: 3,
                    remediation: crate::error::Remediation::Reconnect,
                    ..
                }
            )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_already_in_progress() {
        let (transport, _, _) = transport(vec![]);
        let session = Arc::new(session(transport));

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio_test::assert_err!(session.connect().await);
        assert!(matches!(
            session.connect().await,
            Err(Error::ConnectionInProgress)
        ));

        let _ = connecting.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_connect() {
        let (transport, _, opens) = transport(vec![]);
        let session = Arc::new(session(transport));
        let mut events = session.subscribe_connection();

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };

        // First attempt has failed; the session is in its backoff.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(session.state(), ConnectionState::Connecting);
        session.disconnect().await.unwrap();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectAborted)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!drain(&mut events).iter().any(|e| matches!(
            e,
            ConnectionEvent::StateChanged {
                to: ConnectionState::Reconnecting,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_after_open_closes_late_link() {
        let (transport, opens, closed) = scripted_transport(false, Duration::from_secs(1));
        let session = Arc::new(session(transport));
        let mut events = session.subscribe_connection();

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };

        // The link is open and still subscribing.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        session.disconnect().await.unwrap();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectAborted)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(session.send(CommandRequest::new(Opcode::PitTarget, 0)).await.is_err());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!drain(&mut events).iter().any(|e| matches!(
            e,
            ConnectionEvent::StateChanged {
                to: ConnectionState::Connected,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_during_setup_fails_connect() {
        let (transport, opens, closed) = scripted_transport(true, Duration::ZERO);
        let session = session(transport);
        let mut events = session.subscribe_connection();

        let err = session.connect().await.unwrap_err();

        assert!(matches!(err, Error::LinkDropped));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.is_authorized());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        let events = drain(&mut events);
        assert!(events.contains(&ConnectionEvent::ConnectFailed {
            attempts: 1,
            reason: "Connection lost".into(),
            remediation: crate::error::Remediation::Reconnect,
        }));
        assert!(!events.iter().any(|e| matches!(
            e,
            ConnectionEvent::StateChanged {
                to: ConnectionState::Connected | ConnectionState::Reconnecting,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorization_probe_failure_is_soft() {
        let mut link = MockLink::new();
        link.expect_resolve_endpoints().returning(|| {
            Ok(Endpoints {
                telemetry: true,
                control: true,
            })
        });
        link.expect_subscribe().returning(|| Ok(()));
        link.expect_read_control()
            .returning(|| Err(Error::authorization_required()));

        let (transport, _, _) = transport(vec![shared(link)]);
        let session = session(transport);
        let mut events = session.subscribe_connection();

        let report = session.connect().await.unwrap();

        assert!(!report.authorized);
        assert!(!session.is_authorized());
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, ConnectionEvent::AuthorizationPending { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_telemetry_fails_connect() {
        let mut link = MockLink::new();
        link.expect_resolve_endpoints().returning(|| {
            Ok(Endpoints {
                telemetry: false,
                control: true,
            })
        });
        link.expect_disconnect().times(1).returning(|| Ok(()));

        let (transport, _, _) = transport(vec![shared(link)]);
        let session = session(transport);

        let err = session.connect().await.unwrap_err();

        assert!(matches!(err, Error::CharacteristicNotFound { .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_session() {
        let (transport, _, _) = transport(vec![]);
        let session = session(transport);

        let err = session
            .send(crate::protocol::commands::set_pit_temp(225))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_control_endpoint() {
        let mut link = MockLink::new();
        link.expect_resolve_endpoints().returning(|| {
            Ok(Endpoints {
                telemetry: true,
                control: false,
            })
        });
        link.expect_subscribe().returning(|| Ok(()));

        let (transport, _, _) = transport(vec![shared(link)]);
        let session = session(transport);

        let report = session.connect().await.unwrap();
        assert!(!report.control_available);

        let err = session
            .send(crate::protocol::commands::set_fan_speed(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_writes_command_bytes() {
        let mut link = healthy_link();
        link.expect_write_control()
            .withf(|data: &[u8]| data == [0x01u8, 80])
            .times(1)
            .returning(|_| Ok(()));

        let (transport, _, _) = transport(vec![shared(link)]);
        let session = session(transport);
        session.connect().await.unwrap();

        session
            .send(crate::protocol::commands::set_pit_temp(225))
            .await
            .unwrap();
        assert!(session.is_authorized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_authorization_rejected() {
        let mut link = healthy_link();
        link.expect_write_control()
            .returning(|_| Err(Error::authorization_required()));

        let (transport, _, _) = transport(vec![shared(link)]);
        let session = session(transport);
        session.connect().await.unwrap();

        let err = session
            .send(crate::protocol::commands::set_lid_detect(true))
            .await
            .unwrap_err();

        assert!(err.is_authorization());
        assert_eq!(err.remediation(), crate::error::Remediation::RePair);
        assert!(!session.is_authorized());
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_published_in_order() {
        let (transport, captured, _) = transport(vec![shared(healthy_link())]);
        let session = session(transport);
        let mut telemetry = session.subscribe_telemetry();
        session.connect().await.unwrap();

        let events = sender(&captured, 0);
        assert!(events.frame(frame(200, false)));
        assert!(events.frame(vec![1u8, 2, 3]));
        assert!(events.frame(frame(201, true)));

        let first = telemetry.recv().await.unwrap();
        let second = telemetry.recv().await.unwrap();
        assert_eq!(first.reading.pit_temperature.fahrenheit(), Some(200));
        assert_eq!(second.reading.pit_temperature.fahrenheit(), Some(201));
        assert_eq!(first.reading.pit_set, 225);

        assert_eq!(session.history().len(), 2);
        assert_eq!(
            session
                .latest()
                .map(|latest| latest.reading.pit_temperature.0),
            Some(201)
        );
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_reports_verification() {
        let mut link = healthy_link();
        link.expect_write_control().returning(|_| Ok(()));

        let (transport, captured, _) = transport(vec![shared(link)]);
        let session = session(transport);
        let mut telemetry = session.subscribe_telemetry();
        session.connect().await.unwrap();

        let applied = session.apply(Setting::PitTarget(225)).await.unwrap();
        assert_eq!(applied.request.to_bytes(), [0x01, 80]);
        assert!(applied.verifiable);

        let applied = session.apply(Setting::DisplayBrightness(0)).await.unwrap();
        assert_eq!(applied.request.opcode, Opcode::DisplayBrightness);
        assert_eq!(applied.request.argument, 1);
        assert!(applied.warning.is_some());
        assert!(!applied.verifiable);

        sender(&captured, 0).frame(frame(200, false));

        let update = telemetry.recv().await.unwrap();
        assert_eq!(update.checks.len(), 1);
        assert_eq!(update.checks[0].setting, Setting::PitTarget(225));
        assert_eq!(update.checks[0].outcome, Verification::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_reconnects() {
        let (transport, captured, opens) = transport(vec![
            shared(healthy_link()),
            shared(healthy_link()),
        ]);
        let session = session(transport);
        let mut telemetry = session.subscribe_telemetry();
        session.connect().await.unwrap();
        let mut events = session.subscribe_connection();

        sender(&captured, 0).disconnected();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(session.state(), ConnectionState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(session.device(), Some(controller()));

        assert_eq!(
            drain(&mut events),
            vec![
                ConnectionEvent::StateChanged {
                    from: ConnectionState::Connected,
                    to: ConnectionState::Reconnecting,
                },
                ConnectionEvent::LinkDropped,
                ConnectionEvent::ConnectAttempt {
                    attempt: 1,
                    max_attempts: 1,
                },
                ConnectionEvent::StateChanged {
                    from: ConnectionState::Reconnecting,
                    to: ConnectionState::Connected,
                },
            ]
        );

        // Frames from the dead link are ignored; the new link is live.
        sender(&captured, 0).frame(frame(300, false));
        sender(&captured, 1).frame(frame(210, false));
        let update = telemetry.recv().await.unwrap();
        assert_eq!(update.reading.pit_temperature.0, 210);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_failure_forgets_device() {
        let (transport, captured, opens) =
            transport(vec![shared(healthy_link()), None]);
        let session = session(transport);
        session.connect().await.unwrap();
        let mut events = session.subscribe_connection();

        sender(&captured, 0).disconnected();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.device(), None);
        assert_eq!(opens.load(Ordering::SeqCst), 2);

        let events = drain(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::ReconnectFailed { .. })));
        assert_eq!(
            events.last(),
            Some(&ConnectionEvent::ReconnectFailed {
                reason: "Internal error: radio busy".into(),
                remediation: crate::error::Remediation::SelectDevice,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (transport, captured, opens) = transport(vec![
            shared(healthy_link()),
            shared(healthy_link()),
        ]);
        let session = session(transport);
        session.connect().await.unwrap();

        sender(&captured, 0).disconnected();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session.state(), ConnectionState::Reconnecting);

        session.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intentional_disconnect_does_not_reconnect() {
        let mut link = MockLink::new();
        link.expect_resolve_endpoints().returning(|| {
            Ok(Endpoints {
                telemetry: true,
                control: true,
            })
        });
        link.expect_subscribe().returning(|| Ok(()));
        link.expect_read_control().returning(|| Ok(vec![0]));
        link.expect_disconnect().times(1).returning(|| Ok(()));

        let (transport, captured, opens) = transport(vec![shared(link)]);
        let session = session(transport);
        session.connect().await.unwrap();

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.is_authorized());

        // A late drop report from the closed link changes nothing.
        sender(&captured, 0).disconnected();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(matches!(
            session
                .send(crate::protocol::commands::set_fan_speed(0))
                .await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callbacks() {
        let (transport, captured, _) = transport(vec![shared(healthy_link())]);
        let session = session(transport);

        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = states.clone();
        let _connection = session.on_connection_event(move |event| {
            if let ConnectionEvent::StateChanged { to, .. } = event {
                seen.lock().push(*to);
            }
        });

        let pits = Arc::new(Mutex::new(Vec::new()));
        let seen = pits.clone();
        let telemetry = session.on_telemetry(move |update| {
            seen.lock().push(update.reading.pit_temperature.0);
        });

        session.connect().await.unwrap();
        sender(&captured, 0).frame(frame(205, false));
        tokio::time::sleep(Duration::from_millis(10)).await;

        telemetry.unregister();
        sender(&captured, 0).frame(frame(206, true));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *states.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(*pits.lock(), vec![205]);
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_without_telemetry() {
        let (transport, _, _) = transport(vec![]);
        let session = session(transport);
        assert!(session.is_stale());
        assert_eq!(session.fuel_status(), FuelStatus::default());
    }
}

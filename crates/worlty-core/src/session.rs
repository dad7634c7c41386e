//! Gateway session: the owner of all per-gateway state.
//!
//! A session is two tasks:
//!
//! - the **actor** owns the device tree, the command queue, the store and
//!   the write half of the current connection. Every mutation happens inside
//!   it, so nothing here is locked.
//! - the **link supervisor** owns the connection lifecycle: it runs the
//!   listener loop and the health monitor for each authenticated connection,
//!   and on loss pauses, reauthenticates with backoff and starts over.
//!
//! Collaborators talk to the actor through a cloneable [`SessionHandle`].
//! Explicit disconnect cancels the session token, which stops both tasks and
//! short-circuits any pending recovery.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use worlty_rpc::{
    AuthState, Authenticator, ClientMessage, Command, FrameWriter, GatewayConnection,
    GatewayIdentity, ServerMessage,
};
use worlty_types::{DeviceRecord, Platform, UniqueId};

use crate::config::{GatewayConfig, SessionConfig};
use crate::health;
use crate::listener::{self, ListenExit};
use crate::queue::CommandQueue;
use crate::store::{ACCESS_TOKEN_KEY, DEVICES_KEY, HOST_KEY, PORT_KEY, StateStore};
use crate::tree::{DeviceTree, DiscoveryCallback, EntityListener};
use crate::{Error, Result};

/// Events from the link supervisor to the actor
#[derive(Debug)]
pub enum LinkEvent {
    /// A fresh authenticated connection; the actor takes its write half
    Established {
        writer: FrameWriter,
        identity: GatewayIdentity,
    },
    /// One decoded data frame
    Frame(Value),
    /// The current connection is gone
    Lost,
}

enum Request {
    RegisterEntity {
        unique_id: UniqueId,
        entity: Arc<dyn EntityListener>,
    },
    RegisterPlatformListener {
        platform: Platform,
        callback: DiscoveryCallback,
    },
    GetEntity {
        unique_id: UniqueId,
        reply: oneshot::Sender<Option<DeviceRecord>>,
    },
    PlatformSnapshot {
        platform: Platform,
        reply: oneshot::Sender<Vec<DeviceRecord>>,
    },
    Enqueue(Command),
}

/// Cloneable access to a running session
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
    token: CancellationToken,
    status: watch::Receiver<GatewayIdentity>,
    auth_state: watch::Receiver<AuthState>,
}

impl SessionHandle {
    fn send(&self, request: Request) -> Result<()> {
        self.requests.send(request).map_err(|_| Error::SessionClosed)
    }

    /// Route future updates for `unique_id` to `entity` instead of discovery.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the session has stopped.
    pub fn register_entity(
        &self,
        unique_id: UniqueId,
        entity: Arc<dyn EntityListener>,
    ) -> Result<()> {
        self.send(Request::RegisterEntity { unique_id, entity })
    }

    /// Add a discovery callback for `platform`. Callbacks run in registration order.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the session has stopped.
    pub fn register_platform_listener<F>(&self, platform: Platform, callback: F) -> Result<()>
    where
        F: FnMut(&DeviceRecord) + Send + 'static,
    {
        self.send(Request::RegisterPlatformListener {
            platform,
            callback: Box::new(callback),
        })
    }

    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the session has stopped.
    pub async fn get_entity(&self, unique_id: impl Into<UniqueId>) -> Result<Option<DeviceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::GetEntity {
            unique_id: unique_id.into(),
            reply,
        })?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Visible records currently known for `platform`, in discovery order.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the session has stopped.
    pub async fn platform_snapshot(&self, platform: Platform) -> Result<Vec<DeviceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::PlatformSnapshot { platform, reply })?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Queue a write for device `pk`.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the session has stopped.
    pub fn enqueue_command(&self, pk: i64, payload: Map<String, Value>) -> Result<()> {
        self.enqueue(Command::new(pk, payload))
    }

    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the session has stopped.
    pub fn enqueue(&self, command: Command) -> Result<()> {
        self.send(Request::Enqueue(command))
    }

    /// Stop the session. Idempotent.
    pub fn disconnect(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.requests.is_closed()
    }

    /// Current gateway identity and availability
    #[must_use]
    pub fn identity(&self) -> GatewayIdentity {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn status(&self) -> watch::Receiver<GatewayIdentity> {
        self.status.clone()
    }

    #[must_use]
    pub fn auth_state(&self) -> watch::Receiver<AuthState> {
        self.auth_state.clone()
    }
}

/// A running gateway session
pub struct Session {
    handle: SessionHandle,
    actor: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

impl Session {
    /// Authenticate, restore persisted state and start the session tasks.
    ///
    /// The handshake is attempted up to `setup_attempts` times,
    /// `setup_retry_delay_ms` apart.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an incomplete gateway config, or the
    /// classified `Error::Auth` of the last attempt.
    pub async fn setup(
        gateway: &GatewayConfig,
        config: SessionConfig,
        mut store: Box<dyn StateStore>,
    ) -> Result<Self> {
        gateway.validate()?;

        let authenticator = Authenticator::new(
            gateway.host.clone(),
            gateway.port,
            gateway.access_token.clone(),
            config.auth_options(),
        );

        let attempts = config.setup_attempts.max(1);
        let mut attempt = 0;
        let (conn, identity) = loop {
            attempt += 1;
            match authenticator.authenticate().await {
                Ok(link) => break link,
                Err(e) if attempt >= attempts => {
                    error!(
                        "[{}] Setup failed after {attempt} attempts: {}",
                        gateway.host,
                        e.reason()
                    );
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(
                        "[{}] Setup attempt {attempt}/{attempts} failed: {e}",
                        gateway.host
                    );
                    tokio::time::sleep(config.setup_retry_delay()).await;
                }
            }
        };

        let mut tree = DeviceTree::new(identity.device_id.clone());
        match store.get(DEVICES_KEY) {
            Ok(Some(persisted)) => {
                tree.hydrate(persisted);
            }
            Ok(None) => {}
            Err(e) => warn!("[{}] Could not read stored devices: {e}", identity.device_id),
        }

        if let Err(e) = store.set_many(persisted_identity(gateway, &identity)) {
            error!("[{}] Could not persist identity: {e}", identity.device_id);
        }

        Ok(Self::start(authenticator, config, store, tree, conn, identity))
    }

    fn start(
        authenticator: Authenticator,
        config: SessionConfig,
        store: Box<dyn StateStore>,
        tree: DeviceTree,
        conn: GatewayConnection,
        identity: GatewayIdentity,
    ) -> Self {
        let token = CancellationToken::new();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut offline = identity.clone();
        offline.available = false;
        let (status_tx, status_rx) = watch::channel(offline);

        let handle = SessionHandle {
            requests: requests_tx,
            token: token.clone(),
            status: status_rx,
            auth_state: authenticator.subscribe(),
        };

        let actor = SessionActor {
            label: identity.device_id.clone(),
            tree,
            queue: CommandQueue::new(config.debounce()),
            store,
            writer: None,
            status: status_tx,
            refresh: PendingRefresh::default(),
            refresh_delay: config.refresh_delay(),
        };

        let supervisor = LinkSupervisor {
            authenticator,
            config,
            events: events_tx,
            token: token.clone(),
        };

        Self {
            handle,
            actor: tokio::spawn(actor.run(requests_rx, events_rx, token)),
            supervisor: tokio::spawn(supervisor.run(conn, identity)),
        }
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Stop the session and wait for both tasks to finish.
    pub async fn disconnect(self) {
        self.handle.disconnect();
        self.join().await;
    }

    /// Wait until the session stops.
    pub async fn join(self) {
        if let Err(e) = self.supervisor.await {
            error!("Link supervisor task failed: {e}");
        }
        if let Err(e) = self.actor.await {
            error!("Session actor task failed: {e}");
        }
    }
}

/// Connection parameters and identity fields written after first authentication
fn persisted_identity(gateway: &GatewayConfig, identity: &GatewayIdentity) -> Map<String, Value> {
    let mut entries = match serde_json::to_value(identity) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    entries.insert(HOST_KEY.to_string(), Value::from(gateway.host.clone()));
    entries.insert(PORT_KEY.to_string(), Value::from(gateway.port));
    entries.insert(
        ACCESS_TOKEN_KEY.to_string(),
        Value::from(gateway.access_token.clone()),
    );
    entries
}

/// Coalesced `get` request waiting for its send time
#[derive(Debug, Default)]
struct PendingRefresh {
    keys: BTreeSet<i64>,
    deadline: Option<Instant>,
}

struct SessionActor {
    label: String,
    tree: DeviceTree,
    queue: CommandQueue,
    store: Box<dyn StateStore>,
    writer: Option<FrameWriter>,
    status: watch::Sender<GatewayIdentity>,
    refresh: PendingRefresh,
    refresh_delay: Duration,
}

impl SessionActor {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        token: CancellationToken,
    ) {
        loop {
            let flush_at = self.queue.deadline();
            let refresh_at = self.refresh.deadline;

            tokio::select! {
                () = token.cancelled() => break,
                request = requests.recv() => {
                    let Some(request) = request else {
                        debug!("[{}] All session handles dropped", self.label);
                        token.cancel();
                        break;
                    };
                    self.handle_request(request);
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        token.cancel();
                        break;
                    };
                    self.handle_link(event).await;
                }
                () = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    self.flush().await;
                }
                () = tokio::time::sleep_until(refresh_at.unwrap_or_else(Instant::now)), if refresh_at.is_some() => {
                    self.send_refresh().await;
                }
            }
        }

        if let Some(mut writer) = self.writer.take() {
            writer.terminate().await;
        }
        self.set_available(false);
        info!("[{}] Session stopped", self.label);
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::RegisterEntity { unique_id, entity } => {
                self.tree.register_entity(unique_id, entity);
            }
            Request::RegisterPlatformListener { platform, callback } => {
                self.tree.register_platform_listener(platform, callback);
            }
            Request::GetEntity { unique_id, reply } => {
                let _ = reply.send(self.tree.get_entity(unique_id.as_str()).cloned());
            }
            Request::PlatformSnapshot { platform, reply } => {
                let _ = reply.send(self.tree.platform_snapshot(platform));
            }
            Request::Enqueue(command) => {
                debug!("[{}] Queue command for pk {}", self.label, command.pk);
                self.queue.enqueue(command, Instant::now());
            }
        }
    }

    async fn handle_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Established {
                mut writer,
                mut identity,
            } => {
                if let Some(mut stale) = self.writer.take() {
                    stale.terminate().await;
                }
                self.label.clone_from(&identity.device_id);
                writer.set_label(self.label.as_str());
                self.writer = Some(writer);
                identity.available = true;
                self.status.send_replace(identity);
                info!("[{}] Gateway available", self.label);
            }
            LinkEvent::Frame(frame) => self.dispatch(frame),
            LinkEvent::Lost => {
                if let Some(mut writer) = self.writer.take() {
                    writer.terminate().await;
                }
                self.set_available(false);
                warn!("[{}] Gateway unavailable", self.label);
            }
        }
    }

    fn set_available(&self, available: bool) {
        self.status.send_if_modified(|identity| {
            let changed = identity.available != available;
            identity.available = available;
            changed
        });
    }

    fn dispatch(&mut self, frame: Value) {
        let message = match ServerMessage::from_value(frame.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] Unhandled message ({e}): {frame}", self.label);
                return;
            }
        };

        match message {
            ServerMessage::Update { data } => {
                let records = data.records();
                if records.is_empty() {
                    return;
                }
                let stats = self.tree.apply_update(records);
                debug!("[{}] Merged batch: {stats:?}", self.label);
                self.persist_devices();
            }
            ServerMessage::Health { data } => {
                let pks = self.tree.diff_health(&data.devices);
                if !pks.is_empty() {
                    info!("[{}] Update devices : {pks:?}", self.label);
                    self.schedule_refresh(pks);
                }
            }
            ServerMessage::DeviceList { data } => {
                let keys = data.keys();
                let listed: BTreeSet<i64> = keys.iter().copied().collect();
                let unlisted: Vec<i64> = self
                    .tree
                    .root_pks()
                    .into_iter()
                    .filter(|pk| !listed.contains(pk))
                    .collect();
                if !unlisted.is_empty() {
                    info!(
                        "[{}] Known devices missing from device list: {unlisted:?}",
                        self.label
                    );
                }
                self.schedule_refresh(keys);
            }
            ServerMessage::DeviceDelete { data } => {
                debug!("[{}] Delete devices : {data}", self.label);
            }
            ServerMessage::AuthRequired
            | ServerMessage::Authenticated { .. }
            | ServerMessage::Unknown => {
                debug!("[{}] Unhandled message : {frame}", self.label);
            }
        }
    }

    fn persist_devices(&mut self) {
        if let Err(e) = self.store.set(DEVICES_KEY, self.tree.to_value()) {
            error!("[{}] Could not persist devices: {e}", self.label);
        }
    }

    fn schedule_refresh(&mut self, pks: Vec<i64>) {
        if pks.is_empty() {
            return;
        }
        self.refresh.keys.extend(pks);
        if self.refresh.deadline.is_none() {
            self.refresh.deadline = Some(Instant::now() + self.refresh_delay);
        }
    }

    async fn send_refresh(&mut self) {
        self.refresh.deadline = None;
        let keys: Vec<i64> = std::mem::take(&mut self.refresh.keys).into_iter().collect();
        if !keys.is_empty() {
            self.publish(&ClientMessage::get(keys)).await;
        }
    }

    async fn flush(&mut self) {
        if let Some(batch) = self.queue.take_due(Instant::now()) {
            debug!("[{}] Flush {} queued commands", self.label, batch.len());
            self.publish(&ClientMessage::set(batch)).await;
        }
    }

    /// Publish on the current connection. Failures are logged and dropped.
    async fn publish(&mut self, message: &ClientMessage) -> bool {
        match self.writer.as_mut() {
            Some(writer) if writer.is_connected() => writer.publish(message).await.is_ok(),
            _ => {
                error!(
                    "[{}] Publish failed > [not connected], dropping {}",
                    self.label,
                    message.kind()
                );
                false
            }
        }
    }
}

struct LinkSupervisor {
    authenticator: Authenticator,
    config: SessionConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
    token: CancellationToken,
}

impl LinkSupervisor {
    async fn run(self, conn: GatewayConnection, identity: GatewayIdentity) {
        let mut link = Some((conn, identity));

        loop {
            let (conn, identity) = match link.take() {
                Some(link) => link,
                None => match self.reauthenticate().await {
                    Some(link) => link,
                    None => break,
                },
            };

            let label = identity.device_id.clone();
            let (mut reader, writer) = conn.into_split();
            if self
                .events
                .send(LinkEvent::Established { writer, identity })
                .is_err()
            {
                break;
            }

            let connection = self.token.child_token();
            let (liveness_tx, liveness_rx) = watch::channel(Instant::now());
            let monitor = tokio::spawn(health::monitor(
                liveness_rx,
                self.config.health_interval(),
                self.config.stale_after(),
                connection.clone(),
                label.clone(),
            ));

            let exit = listener::listen(
                &mut reader,
                self.config.poll_timeout(),
                &connection,
                &liveness_tx,
                &self.events,
                &label,
            )
            .await;

            connection.cancel();
            if let Err(e) = monitor.await {
                error!("[{label}] Health monitor failed: {e}");
            }
            drop(reader);
            self.authenticator.mark_disconnected();
            debug!("[{label}] Listener finished ({exit:?})");

            if self.events.send(LinkEvent::Lost).is_err() || exit == ListenExit::SessionGone {
                break;
            }
            if self.token.is_cancelled() {
                break;
            }

            tokio::select! {
                () = self.token.cancelled() => break,
                () = tokio::time::sleep(self.config.reconnect_pause()) => {}
            }
            debug!("[{label}] Try auth as listener finished");
        }

        self.authenticator.mark_disconnected();
        debug!("[{}] Link supervisor stopped", self.authenticator.host());
    }

    /// Retry the handshake until it succeeds or the session is cancelled.
    async fn reauthenticate(&self) -> Option<(GatewayConnection, GatewayIdentity)> {
        let mut attempt: u32 = 0;

        loop {
            let result = tokio::select! {
                () = self.token.cancelled() => return None,
                result = self.authenticator.authenticate() => result,
            };

            match result {
                Ok(link) => return Some(link),
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.config.reauth_delay(attempt);
                    warn!(
                        "[{}] Reauth attempt {attempt} failed ({}), retrying in {}ms",
                        self.authenticator.host(),
                        e.reason(),
                        delay.as_millis()
                    );
                    tokio::select! {
                        () = self.token.cancelled() => return None,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

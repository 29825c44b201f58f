//! Sync runtime
//!
//! [`SyncClient`] owns the cache, the connection manager and the
//! coordinators, and drives them from a single task. Backend messages are
//! handled strictly in arrival order, and every cache write happens on this
//! task, so the cache never sees concurrent writers.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use canon_protocol::{ClientMessage, ServerMessage};
use canon_utils::{CanonError, Result};

use crate::cache::{Session, SessionCache};
use crate::config::ClientConfig;
use crate::connection::{
    ConnectionAction, ConnectionManager, ConnectionState, Connector, Link,
};
use crate::coordinator::{SpawnCloseCoordinator, SpawnRequest};
use crate::namespace::Namespace;
use crate::reconcile::{ReconcileOutcome, ReconciliationEngine, RecoverySnapshot};
use crate::scheduler::{AlarmScheduler, Clock};
use crate::store::KvStore;

/// Upper bound on one wait for the reconnect alarm, so wall-clock jumps
/// (host suspension) are noticed promptly
const ALARM_CHECK_INTERVAL: Duration = Duration::from_secs(1);

const COMMAND_CAPACITY: usize = 64;

/// Requests from the UI to the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    Spawn(SpawnRequest),
    Close(String),
    Rename { id: String, name: String },
    Select(String),
    /// Request a fresh session list
    Resync,
    /// Manual reconnect, also after retries were exhausted
    ReconnectNow,
    Shutdown,
}

/// Notifications from the runtime to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    SessionsChanged {
        sessions: Vec<Session>,
        current: Option<String>,
    },
    ConnectionChanged(ConnectionState),
    /// Number of clients observing the backend
    ConnectionCount(u32),
    /// Automatic reconnects stopped; only `ReconnectNow` resumes them
    ReconnectExhausted { attempts: u32 },
}

/// Cloneable handle for talking to a running [`SyncClient`]
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
    sessions: watch::Receiver<Vec<Session>>,
}

impl SyncHandle {
    pub async fn send(&self, command: SyncCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CanonError::internal("sync runtime stopped"))
    }

    pub async fn spawn(&self, request: SpawnRequest) -> Result<()> {
        self.send(SyncCommand::Spawn(request)).await
    }

    pub async fn close(&self, id: impl Into<String>) -> Result<()> {
        self.send(SyncCommand::Close(id.into())).await
    }

    pub async fn rename(&self, id: impl Into<String>, name: impl Into<String>) -> Result<()> {
        self.send(SyncCommand::Rename {
            id: id.into(),
            name: name.into(),
        })
        .await
    }

    pub async fn select(&self, id: impl Into<String>) -> Result<()> {
        self.send(SyncCommand::Select(id.into())).await
    }

    pub async fn resync(&self) -> Result<()> {
        self.send(SyncCommand::Resync).await
    }

    pub async fn reconnect_now(&self) -> Result<()> {
        self.send(SyncCommand::ReconnectNow).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(SyncCommand::Shutdown).await
    }

    /// Latest session list, updated after every cache change
    pub fn sessions(&self) -> watch::Receiver<Vec<Session>> {
        self.sessions.clone()
    }
}

/// The session sync runtime
pub struct SyncClient<K, A, C, T>
where
    K: KvStore,
    A: AlarmScheduler,
    C: Clock,
    T: Connector,
{
    cache: SessionCache<K>,
    engine: ReconciliationEngine,
    coordinator: SpawnCloseCoordinator,
    manager: ConnectionManager<A, C>,
    connector: T,
    link: Option<Link>,
    health_interval: Duration,
    commands: mpsc::Receiver<SyncCommand>,
    events: mpsc::UnboundedSender<SyncEvent>,
    sessions_tx: watch::Sender<Vec<Session>>,
    attach_tasks: Vec<JoinHandle<()>>,
    published_state: Option<ConnectionState>,
}

impl<K, A, C, T> SyncClient<K, A, C, T>
where
    K: KvStore,
    A: AlarmScheduler,
    C: Clock,
    T: Connector,
{
    /// Assemble a runtime
    ///
    /// Returns the runtime, a handle for commands, and the event stream.
    pub fn new(
        config: &ClientConfig,
        cache: SessionCache<K>,
        manager: ConnectionManager<A, C>,
        connector: T,
    ) -> (Self, SyncHandle, mpsc::UnboundedReceiver<SyncEvent>) {
        let namespace = Namespace::new(config.namespace.prefix.clone());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (sessions_tx, sessions_rx) = watch::channel(cache.all().to_vec());

        let client = Self {
            cache,
            engine: ReconciliationEngine::new(namespace.clone()),
            coordinator: SpawnCloseCoordinator::new(
                namespace,
                config.spawn.suppression(),
                config.spawn.attach_stagger(),
            ),
            manager,
            connector,
            link: None,
            health_interval: config.health.interval(),
            commands: command_rx,
            events: event_tx,
            sessions_tx,
            attach_tasks: Vec::new(),
            published_state: None,
        };
        let handle = SyncHandle {
            commands: command_tx,
            sessions: sessions_rx,
        };
        (client, handle, event_rx)
    }

    pub fn cache(&self) -> &SessionCache<K> {
        &self.cache
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Run until shut down or every handle is dropped
    pub async fn run(mut self) -> Result<()> {
        info!("Sync runtime starting with {} cached sessions", self.cache.len());
        self.publish_sessions();

        // A reconnect cycle interrupted by a restart resumes on its alarm
        if self.manager.resume().is_none() && self.manager.begin_connect() {
            self.apply(ConnectionAction::Connect).await;
        }
        self.publish_connection_state();

        let mut health = tokio::time::interval_at(
            Instant::now() + self.health_interval,
            self.health_interval,
        );
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let alarm_wait = self.manager.next_alarm().map(|alarm| {
                alarm
                    .remaining(self.manager.clock().now_ms())
                    .min(ALARM_CHECK_INTERVAL)
            });

            tokio::select! {
                msg = recv_from(&mut self.link) => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => {
                        self.drop_link();
                        let action = self.manager.on_disconnected();
                        self.apply(action).await;
                    }
                },

                _ = sleep_for(alarm_wait) => {
                    let action = self.manager.on_alarm();
                    self.apply(action).await;
                }

                _ = health.tick() => {
                    debug!(phase = %self.manager.phase(), "Health check");
                    let action = self.manager.on_health_check();
                    self.apply(action).await;
                }

                command = self.commands.recv() => match command {
                    Some(SyncCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
            }
        }

        info!("Sync runtime shutting down");
        self.manager.shutdown();
        self.drop_link();
        self.publish_connection_state();
        Ok(())
    }

    async fn handle_message(&mut self, msg: ServerMessage) {
        let now = self.manager.clock().now_ms();
        match msg {
            ServerMessage::Terminals {
                sessions,
                recovery_complete,
                connection_count,
            } => {
                self.emit(SyncEvent::ConnectionCount(connection_count));
                let snapshot = RecoverySnapshot::new(sessions, recovery_complete, now);
                match self.engine.reconcile(&mut self.cache, &snapshot) {
                    Ok(outcome) => {
                        if !outcome.is_noop() {
                            self.publish_sessions();
                        }
                        if !outcome.added.is_empty() {
                            self.attach(outcome.added);
                        }
                    }
                    Err(e) => warn!("Failed to apply session report: {}", e),
                }
            }
            ServerMessage::TerminalSpawned { session } => {
                match self.coordinator.on_spawned(&mut self.cache, &session, now) {
                    Ok(true) => self.publish_sessions(),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to record spawned session {}: {}", session.id, e),
                }
            }
            ServerMessage::TerminalClosed { id } => {
                match self.coordinator.on_closed(&mut self.cache, &id) {
                    Ok(true) => self.publish_sessions(),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to record closed session {}: {}", id, e),
                }
            }
            ServerMessage::ConnectionCount { count } => {
                self.emit(SyncEvent::ConnectionCount(count));
            }
            ServerMessage::Unknown => {
                debug!("Ignoring unknown message");
            }
        }
    }

    async fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Spawn(request) => {
                if self.link.is_none() {
                    warn!("Cannot spawn {} while disconnected", request.profile_ref);
                    return;
                }
                let now = self.manager.clock().now_ms();
                if let Some(msg) = self.coordinator.request_spawn(request, now) {
                    let action = self.send(msg).await;
                    self.apply(action).await;
                }
            }
            SyncCommand::Close(id) => {
                if let Some(msg) = self.coordinator.request_close(&id) {
                    let action = self.send(msg).await;
                    self.apply(action).await;
                }
            }
            SyncCommand::Rename { id, name } => match self.cache.rename(&id, name) {
                Ok(()) => self.publish_sessions(),
                Err(e) => warn!("Rename failed: {}", e),
            },
            SyncCommand::Select(id) => match self.cache.select(&id) {
                Ok(()) => self.publish_sessions(),
                Err(e) => warn!("Select failed: {}", e),
            },
            SyncCommand::Resync => {
                if self.link.is_some() {
                    self.apply(ConnectionAction::RequestList).await;
                } else {
                    debug!("Resync requested while disconnected");
                }
            }
            SyncCommand::ReconnectNow => {
                let action = self.manager.reset();
                self.apply(action).await;
            }
            SyncCommand::Shutdown => {}
        }
    }

    /// Carry out manager actions until one settles
    async fn apply(&mut self, mut action: ConnectionAction) {
        loop {
            action = match action {
                ConnectionAction::None => break,
                ConnectionAction::Connect => self.open_link().await,
                ConnectionAction::RequestList => self.send(ClientMessage::ListTerminals).await,
                ConnectionAction::RetryScheduled(alarm) => {
                    debug!(
                        attempt = alarm.attempt,
                        deadline_ms = alarm.deadline_ms,
                        "Waiting for reconnect alarm"
                    );
                    break;
                }
                ConnectionAction::Exhausted => {
                    self.emit(SyncEvent::ReconnectExhausted {
                        attempts: self.manager.backoff().max_attempts,
                    });
                    break;
                }
            };
        }
        self.publish_connection_state();
    }

    async fn open_link(&mut self) -> ConnectionAction {
        self.drop_link();
        self.publish_connection_state();

        match self.connector.connect().await {
            Ok(link) => {
                self.link = Some(link);
                self.manager.on_connected()
            }
            Err(e) => {
                if e.is_retryable() {
                    debug!("Connect failed: {}", e);
                } else {
                    warn!("Connect failed: {}", e);
                }
                self.manager.on_connect_failed()
            }
        }
    }

    async fn send(&mut self, msg: ClientMessage) -> ConnectionAction {
        let Some(link) = &self.link else {
            debug!("Not connected, dropping {}", msg.kind());
            return ConnectionAction::None;
        };
        let result = link.send(msg).await;
        match result {
            Ok(()) => ConnectionAction::None,
            Err(e) => {
                warn!("Send failed: {}", e);
                self.drop_link();
                self.manager.on_disconnected()
            }
        }
    }

    fn attach(&mut self, ids: Vec<String>) {
        let Some(link) = &self.link else {
            return;
        };
        self.attach_tasks.retain(|task| !task.is_finished());
        let task = self.coordinator.spawn_attaches(link.sender(), ids);
        self.attach_tasks.push(task);
    }

    fn drop_link(&mut self) {
        for task in self.attach_tasks.drain(..) {
            task.abort();
        }
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }

    fn publish_sessions(&mut self) {
        let sessions = self.cache.all().to_vec();
        self.sessions_tx.send_replace(sessions.clone());
        self.emit(SyncEvent::SessionsChanged {
            sessions,
            current: self.cache.current().map(str::to_string),
        });
    }

    fn publish_connection_state(&mut self) {
        let state = self.manager.state();
        if self.published_state != Some(state) {
            self.published_state = Some(state);
            self.emit(SyncEvent::ConnectionChanged(state));
        }
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// Connect once, request the session list and reconcile the reply
///
/// For one-shot tools that have no long-running runtime. Messages other
/// than the session report are skipped.
pub async fn resync_once<K, T>(
    config: &ClientConfig,
    cache: &mut SessionCache<K>,
    connector: &T,
    clock: &dyn Clock,
    timeout: Duration,
) -> Result<ReconcileOutcome>
where
    K: KvStore,
    T: Connector,
{
    let engine = ReconciliationEngine::new(Namespace::new(config.namespace.prefix.clone()));
    let mut link = connector.connect().await?;
    link.send(ClientMessage::ListTerminals).await?;

    let deadline = Instant::now() + timeout;
    loop {
        let msg = tokio::time::timeout_at(deadline, link.recv())
            .await
            .map_err(|_| CanonError::ConnectionTimeout {
                millis: timeout.as_millis() as u64,
            })?
            .ok_or(CanonError::ConnectionClosed)?;

        if let ServerMessage::Terminals {
            sessions,
            recovery_complete,
            ..
        } = msg
        {
            let snapshot = RecoverySnapshot::new(sessions, recovery_complete, clock.now_ms());
            return engine.reconcile(cache, &snapshot);
        }
        debug!("Skipping {} while waiting for session list", msg.kind());
    }
}

async fn recv_from(link: &mut Option<Link>) -> Option<ServerMessage> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

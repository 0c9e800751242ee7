//! Connection supervisor.
//!
//! Owns the transport connection for one session at a time:
//! `disconnected → connecting → active → (disconnected | logged_out)`.
//! Recoverable closes reconnect after a bounded exponential backoff; a
//! logout purges the credential directory and the session, then optionally
//! starts over with a new one.

use crate::identity::{ChatId, SenderId};
use crate::session::{
    Debouncer, SessionConfig, SessionContinuityManager, SessionError, SessionId, SessionRegistry,
    StallWatchdog, SyncClock,
};
use crate::transport::{
    Connection, ConnectionUpdate, Connector, InboundMessage, Transport, TransportEvent,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Connection open
    Active,
    /// Account logged out; credentials discarded
    LoggedOut,
}

impl ConnectionState {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::LoggedOut => "logged_out",
        }
    }
}

/// Errors that stop the supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Session bookkeeping failed
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Receives connection lifecycle and inbound traffic
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Connection opened. `self_id` is `None` when the account address
    /// could not be normalized; the transport is usable either way.
    async fn on_open(
        &self,
        transport: Arc<dyn Transport>,
        self_id: Option<SenderId>,
        session_id: SessionId,
    );
    /// Inbound messages, in delivery order
    async fn on_messages(&self, messages: Vec<InboundMessage>);
    /// Group membership or roles changed
    async fn on_participants_changed(&self, _chat: ChatId) {}
    /// Connection closed
    async fn on_close(&self) {}
}

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Session timing and durability
    pub session: SessionConfig,
    /// Directory holding credential directories
    pub auth_root: PathBuf,
    /// Phone number (digits) used to name and find sessions
    pub phone: Option<String>,
    /// Start a new session after a logout
    pub restart_after_logout: bool,
}

enum SessionEnd {
    Shutdown,
    LoggedOut,
}

enum DriveEnd {
    Shutdown,
    LoggedOut,
    Lost,
}

/// Connection supervisor state machine
pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    registry: SessionRegistry,
    handler: Arc<dyn EventHandler>,
    options: SupervisorOptions,
    clock: SyncClock,
    state: watch::Sender<ConnectionState>,
    session_id: RwLock<Option<SessionId>>,
}

impl ConnectionSupervisor {
    /// Create a supervisor; nothing connects until [`Self::run`]
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: SessionRegistry,
        handler: Arc<dyn EventHandler>,
        options: SupervisorOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            registry,
            handler,
            options,
            clock: SyncClock::new(Utc::now()),
            state,
            session_id: RwLock::new(None),
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Session currently supervised
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().clone()
    }

    /// Process-wide sync clock
    #[must_use]
    pub fn clock(&self) -> &SyncClock {
        &self.clock
    }

    /// Session registry
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = previous.as_str(), to = next.as_str(), "Connection state changed");
        }
    }

    fn fresh_backoff(&self) -> ExponentialBackoff {
        let base_ms = self.options.session.reconnect_backoff_secs.max(1) * 1_000;
        // 2^n * base/2: base, 2*base, 4*base, ...
        ExponentialBackoff::from_millis(2)
            .factor(base_ms / 2)
            .max_delay(Duration::from_secs(
                self.options.session.reconnect_backoff_max_secs.max(1),
            ))
    }

    /// Supervise sessions until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if a session cannot be initialized in the registry.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        if let Err(e) = self.registry.ensure_indexes().await {
            warn!(error = %e, "Could not ensure session indexes");
        }
        let cleanup = self.spawn_cleanup(cancel.child_token());

        let result = self.run_sessions(&cancel).await;
        cleanup.abort();
        self.set_state(ConnectionState::Disconnected);
        result
    }

    async fn run_sessions(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        loop {
            let manager = Arc::new(
                SessionContinuityManager::initialize(
                    self.registry.clone(),
                    self.clock.clone(),
                    &self.options.session,
                    self.options.phone.as_deref(),
                )
                .await?,
            );
            *self.session_id.write() = Some(manager.id().clone());
            let dir = manager.id().credential_dir(&self.options.auth_root);

            match manager.load_from_durable_store(&dir).await {
                Ok(true) => info!(session_id = %manager.id(), "Resuming stored credentials"),
                Ok(false) => info!(session_id = %manager.id(), "Starting fresh authentication"),
                Err(e) => {
                    warn!(session_id = %manager.id(), error = %e, "Stored credentials unusable, starting fresh authentication");
                    purge_dir(&dir).await;
                    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                        warn!(dir = %dir.display(), error = %e, "Could not recreate credential directory");
                    }
                }
            }

            match self.run_session(&manager, &dir, cancel).await {
                SessionEnd::Shutdown => {
                    info!(session_id = %manager.id(), "Final credential sync before shutdown");
                    if let Err(e) = manager.sync_to_durable_store(&dir).await {
                        error!(error = %e, "❌ Final sync failed");
                    }
                    manager.mark_disconnected().await;
                    return Ok(());
                }
                SessionEnd::LoggedOut => {
                    info!(session_id = %manager.id(), "👋 Logged out, cleaning session");
                    purge_dir(&dir).await;
                    if let Err(e) = manager.delete().await {
                        error!(error = %e, "❌ Session deletion error");
                    }
                    *self.session_id.write() = None;
                    if !self.options.restart_after_logout || cancel.is_cancelled() {
                        return Ok(());
                    }
                    info!("Starting a new session after logout");
                }
            }
        }
    }

    async fn run_session(
        &self,
        manager: &Arc<SessionContinuityManager>,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let session_cancel = cancel.child_token();
        let watchdog = self.spawn_watchdog(manager, dir, session_cancel.clone());
        let debouncer = Debouncer::new(self.options.session.sync_debounce());
        let mut backoff = self.fresh_backoff();

        let end = loop {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                () = cancel.cancelled() => break SessionEnd::Shutdown,
                result = self.connector.connect(dir) => result,
            };

            match connected {
                Ok(connection) => {
                    match self
                        .drive(connection, manager, dir, &debouncer, &mut backoff, cancel)
                        .await
                    {
                        DriveEnd::Shutdown => break SessionEnd::Shutdown,
                        DriveEnd::LoggedOut => break SessionEnd::LoggedOut,
                        DriveEnd::Lost => {}
                    }
                }
                Err(e) => {
                    warn!(session_id = %manager.id(), error = %e, "Connect failed");
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            let delay = backoff
                .next()
                .unwrap_or(Duration::from_secs(self.options.session.reconnect_backoff_max_secs));
            info!(session_id = %manager.id(), delay_ms = delay.as_millis(), "🔄 Reconnecting");
            tokio::select! {
                () = cancel.cancelled() => break SessionEnd::Shutdown,
                () = tokio::time::sleep(delay) => {}
            }
        };

        debouncer.cancel();
        session_cancel.cancel();
        let _ = watchdog.await;
        end
    }

    async fn drive(
        &self,
        connection: Connection,
        manager: &Arc<SessionContinuityManager>,
        dir: &Path,
        debouncer: &Debouncer,
        backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> DriveEnd {
        let Connection {
            transport,
            mut events,
        } = connection;

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    self.handler.on_close().await;
                    return DriveEnd::Shutdown;
                }
                event = events.recv() => event,
            };

            match event {
                Some(TransportEvent::Connection(ConnectionUpdate::Connecting)) => {
                    self.set_state(ConnectionState::Connecting);
                }
                Some(TransportEvent::Connection(ConnectionUpdate::Open { self_address })) => {
                    info!(session_id = %manager.id(), "✅ Connected");
                    self.set_state(ConnectionState::Active);
                    *backoff = self.fresh_backoff();

                    if let Err(e) = manager.sync_to_durable_store(dir).await {
                        warn!(error = %e, "Sync on connect failed");
                    }
                    let self_id = match SenderId::from_address(&self_address) {
                        Ok(self_id) => Some(self_id),
                        Err(e) => {
                            warn!(error = %e, "Connected account has no usable address");
                            None
                        }
                    };
                    manager
                        .mark_active(self_id.as_ref().map(SenderId::as_str))
                        .await;
                    self.handler
                        .on_open(transport.clone(), self_id, manager.id().clone())
                        .await;
                }
                Some(TransportEvent::Connection(ConnectionUpdate::Close(cause))) => {
                    self.handler.on_close().await;
                    manager.mark_disconnected().await;
                    if !cause.is_recoverable() {
                        debouncer.cancel();
                        self.set_state(ConnectionState::LoggedOut);
                        return DriveEnd::LoggedOut;
                    }
                    warn!(session_id = %manager.id(), ?cause, "Connection closed");
                    if let Err(e) = manager.sync_to_durable_store(dir).await {
                        warn!(error = %e, "Sync on disconnect failed");
                    }
                    self.set_state(ConnectionState::Disconnected);
                    return DriveEnd::Lost;
                }
                Some(TransportEvent::CredentialsUpdated) => {
                    let manager = manager.clone();
                    let dir = dir.to_path_buf();
                    debouncer.trigger(move || async move {
                        if let Err(e) = manager.sync_to_durable_store(&dir).await {
                            warn!(error = %e, "Debounced sync failed");
                        }
                    });
                }
                Some(TransportEvent::Messages(messages)) => {
                    self.handler.on_messages(messages).await;
                }
                Some(TransportEvent::ParticipantsChanged(chat)) => {
                    debug!(chat = %chat, "Group participants changed");
                    self.handler.on_participants_changed(chat).await;
                }
                None => {
                    warn!(session_id = %manager.id(), "Event stream ended");
                    self.handler.on_close().await;
                    manager.mark_disconnected().await;
                    self.set_state(ConnectionState::Disconnected);
                    return DriveEnd::Lost;
                }
            }
        }
    }

    fn spawn_watchdog(
        &self,
        manager: &Arc<SessionContinuityManager>,
        dir: &Path,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let watchdog = StallWatchdog::new(
            self.clock.clone(),
            self.options.session.stall_threshold(),
            self.options.session.stall_check_interval(),
        );
        let state = self.state.subscribe();
        let manager = manager.clone();
        let dir = dir.to_path_buf();
        tokio::spawn(async move {
            watchdog
                .run(
                    move || *state.borrow() == ConnectionState::Active,
                    move || {
                        let manager = manager.clone();
                        let dir = dir.clone();
                        async move { manager.sync_to_durable_store(&dir).await.map(|_| ()) }
                    },
                    cancel,
                )
                .await;
        })
    }

    fn spawn_cleanup(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let period = self.options.session.cleanup_interval();
        let max_age_days = self.options.session.cleanup_max_age_days;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match registry.cleanup_old(max_age_days, Utc::now()).await {
                    Ok(0) => debug!("Auto-cleanup found nothing to remove"),
                    Ok(removed) => info!(removed, "🧹 Auto-cleanup removed old sessions"),
                    Err(e) => error!(error = %e, "❌ Auto-cleanup error"),
                }
            }
        })
    }
}

async fn purge_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Credential directory purged"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to purge credential directory"),
    }
}

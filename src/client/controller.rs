//! Reconnect Controller
//!
//! Keeps one relay connection alive. A single driver task owns the
//! transport and walks this state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                    ^   |          |
//!                    |   v          v
//!                    Backoff <------+
//!                       |
//!                       v (max consecutive failures)
//!                    Failed
//! ```
//!
//! Every failure, whether a dial error or a dropped connection, bumps the
//! consecutive failure count; the backoff before the next dial is
//! `count × step`. A successful dial resets the count and replays login
//! credentials before the connection is reported as `Connected`.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::connector::{BoxSink, Connection, Connector};
use super::session::{SessionRecord, SessionStore};
use super::{ClientError, ClientEvent, Incoming};
use crate::websocket::{AuthAction, AuthPayload, Envelope, AUTH, AUTH_ERROR, AUTH_SUCCESS};

/// Retry limits
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff added per consecutive failure, in milliseconds
    #[serde(default = "default_backoff_step")]
    pub backoff_step_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_step() -> u64 {
    1000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_step_ms: default_backoff_step(),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before the next dial after `failures` consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms.saturating_mul(u64::from(failures)))
    }
}

/// Where the controller is in its connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Dialing; `attempt` counts from 1 within a run of failures
    Connecting { attempt: u32 },
    Connected,
    /// Waiting `delay` after `attempt` consecutive failures
    Backoff { attempt: u32, delay: Duration },
    /// Gave up; only [`ReconnectController::restart`] dials again
    Failed,
}

/// Login or registration details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub action: AuthAction,
}

impl Credentials {
    pub fn login(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            action: AuthAction::Login,
        }
    }

    pub fn register(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            action: AuthAction::Register,
            ..Self::login(username, password)
        }
    }

    fn auth_frame(&self) -> Result<String, serde_json::Error> {
        let payload = AuthPayload {
            username: self.username.clone(),
            password: self.password.clone(),
            action: self.action,
        };
        serde_json::to_string(&Envelope::new(AUTH, &payload)?)
    }
}

impl From<&SessionRecord> for Credentials {
    fn from(record: &SessionRecord) -> Self {
        Credentials::login(record.username.clone(), record.password.clone())
    }
}

enum Command {
    Send(String),
    Login(Credentials),
    Logout,
    Restart,
    Close,
}

/// Stops a controller from another task
#[derive(Clone)]
pub struct CloseHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl CloseHandle {
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Reconnect-aware send/receive surface over one relay connection
pub struct ReconnectController {
    commands: mpsc::UnboundedSender<Command>,
    events: Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
    state: watch::Receiver<ConnectionState>,
}

impl ReconnectController {
    /// Start dialing with no saved session
    pub fn start<C: Connector>(connector: C, policy: ReconnectPolicy) -> Self {
        Self::spawn(Arc::new(connector), policy, None, String::new())
    }

    /// Start dialing, replaying and maintaining the session saved in `store`
    pub fn start_with_session<C: Connector>(
        connector: C,
        policy: ReconnectPolicy,
        store: SessionStore,
        server_url: impl Into<String>,
    ) -> Self {
        Self::spawn(Arc::new(connector), policy, Some(store), server_url.into())
    }

    fn spawn(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        store: Option<SessionStore>,
        server_url: String,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let session = store.as_ref().and_then(SessionStore::load);
        let driver = Driver {
            connector,
            policy,
            events: event_tx,
            state: state_tx,
            server_url,
            pending: None,
            session,
            store,
            replayed: None,
        };
        tokio::spawn(driver.run(command_rx));

        Self {
            commands,
            events: Mutex::new(events),
            state,
        }
    }

    /// Send a typed envelope; fails unless currently connected
    pub fn send<T: Serialize>(&self, kind: &str, payload: &T) -> Result<(), ClientError> {
        let text = serde_json::to_string(&Envelope::new(kind, payload)?)?;
        self.send_text(text)
    }

    /// Send pre-serialized text; fails unless currently connected
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.command(Command::Send(text.into()))
    }

    /// Authenticate now if connected, and on every later reconnect
    pub fn login(&self, credentials: Credentials) -> Result<(), ClientError> {
        self.command(Command::Login(credentials))
    }

    /// Forget all credentials and reconnect unauthenticated
    pub fn logout(&self) -> Result<(), ClientError> {
        self.command(Command::Logout)
    }

    /// Dial again immediately, resetting the failure count
    pub fn restart(&self) -> Result<(), ClientError> {
        self.command(Command::Restart)
    }

    /// Stop for good; pending and future `recv` calls return `None`
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            commands: self.commands.clone(),
        }
    }

    /// Next event; only one read is in flight at a time
    pub async fn recv(&self) -> Option<ClientEvent> {
        self.events.lock().await.recv().await
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }
}

/// Which credentials the last auth frame carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replayed {
    Interactive,
    Stored,
}

enum Flow {
    Stay,
    Redial,
    Stop,
}

enum Exit {
    Dropped(String),
    LoggedOut,
    Stop,
}

/// How long a closing connection may take to flush and say goodbye
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Drain `outbound` frames into the transport until the channel closes
fn spawn_writer(
    mut sink: BoxSink,
) -> (
    mpsc::UnboundedSender<String>,
    JoinHandle<Result<(), ClientError>>,
) {
    let (outbound, mut frames) = mpsc::unbounded_channel::<String>();
    let task = tokio::spawn(async move {
        while let Some(text) = frames.recv().await {
            sink.send(text).await?;
        }
        sink.close().await
    });
    (outbound, task)
}

struct Driver {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    server_url: String,
    /// Credentials entered this run, not yet accepted by the relay
    pending: Option<Credentials>,
    /// Credentials the relay has accepted before
    session: Option<SessionRecord>,
    store: Option<SessionStore>,
    replayed: Option<Replayed>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting {
                attempt: failures + 1,
            });

            let connector = Arc::clone(&self.connector);
            let dial = connector.connect();
            tokio::pin!(dial);
            let result = loop {
                tokio::select! {
                    result = &mut dial => break result,
                    command = commands.recv() => {
                        if let Flow::Stop = self.offline(command) {
                            return;
                        }
                    }
                }
            };

            match result {
                Ok(connection) => {
                    failures = 0;
                    match self.connected(connection, &mut commands).await {
                        Exit::Stop => return,
                        Exit::LoggedOut => continue,
                        Exit::Dropped(reason) => {
                            tracing::warn!(reason = %reason, "Connection lost");
                            failures += 1;
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(attempt = failures, error = %e, "Dial failed");
                }
            }

            if failures >= self.policy.max_attempts {
                tracing::error!(failures, "Giving up on reconnecting");
                self.set_state(ConnectionState::Failed);
                loop {
                    match self.offline(commands.recv().await) {
                        Flow::Stop => return,
                        Flow::Redial => break,
                        Flow::Stay => {}
                    }
                }
                failures = 0;
                continue;
            }

            let delay = self.policy.delay(failures);
            self.set_state(ConnectionState::Backoff {
                attempt: failures,
                delay,
            });
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = commands.recv() => match self.offline(command) {
                        Flow::Stop => return,
                        Flow::Redial => {
                            failures = 0;
                            break;
                        }
                        Flow::Stay => {}
                    },
                }
            }
        }
    }

    /// Pump one live connection until it drops or the owner intervenes
    ///
    /// Writes go through a separate task so a stalled transport never keeps
    /// the driver from reading or from seeing `Close`.
    async fn connected(
        &mut self,
        connection: Connection,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Exit {
        let Connection { sink, mut stream } = connection;
        let (outbound, mut writer) = spawn_writer(sink);

        self.replayed = None;
        if let Some((credentials, source)) = self.replay_credentials() {
            match credentials.auth_frame() {
                Ok(frame) => {
                    if outbound.send(frame).is_err() {
                        writer.abort();
                        return Exit::Dropped("writer stopped".to_string());
                    }
                    self.replayed = Some(source);
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode credentials"),
            }
        }
        self.set_state(ConnectionState::Connected);

        let exit = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.on_frame(&text),
                    Some(Err(e)) => break Exit::Dropped(e.to_string()),
                    None => break Exit::Dropped("closed by server".to_string()),
                },
                result = &mut writer => {
                    let reason = match result {
                        Ok(Ok(())) => "writer stopped".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => e.to_string(),
                    };
                    return Exit::Dropped(reason);
                }
                command = commands.recv() => match command {
                    None | Some(Command::Close) => break Exit::Stop,
                    // A dead writer surfaces through its own branch
                    Some(Command::Send(text)) => {
                        let _ = outbound.send(text);
                    }
                    Some(Command::Login(credentials)) => {
                        match credentials.auth_frame() {
                            Ok(frame) => {
                                let _ = outbound.send(frame);
                                self.replayed = Some(Replayed::Interactive);
                            }
                            Err(e) => tracing::error!(error = %e, "Failed to encode credentials"),
                        }
                        self.pending = Some(credentials);
                    }
                    Some(Command::Logout) => {
                        self.forget();
                        break Exit::LoggedOut;
                    }
                    Some(Command::Restart) => {}
                },
            }
        };

        match exit {
            Exit::Dropped(_) => writer.abort(),
            // Let queued frames and the close handshake go out in the background
            Exit::Stop | Exit::LoggedOut => {
                drop(outbound);
                tokio::spawn(async move {
                    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                        tracing::debug!("Transport did not close in time, abandoning it");
                        writer.abort();
                    }
                });
            }
        }
        exit
    }

    /// Handle a command while no connection is up
    fn offline(&mut self, command: Option<Command>) -> Flow {
        match command {
            None | Some(Command::Close) => Flow::Stop,
            Some(Command::Restart) => Flow::Redial,
            Some(Command::Login(credentials)) => {
                self.pending = Some(credentials);
                Flow::Stay
            }
            Some(Command::Logout) => {
                self.forget();
                Flow::Stay
            }
            Some(Command::Send(_)) => {
                tracing::debug!("Dropping frame sent while disconnected");
                Flow::Stay
            }
        }
    }

    /// Interactive credentials take precedence over the saved session
    fn replay_credentials(&self) -> Option<(Credentials, Replayed)> {
        if let Some(credentials) = &self.pending {
            return Some((credentials.clone(), Replayed::Interactive));
        }
        self.session
            .as_ref()
            .map(|record| (Credentials::from(record), Replayed::Stored))
    }

    fn on_frame(&mut self, text: &str) {
        let incoming = match Incoming::parse(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::debug!(error = %e, "Discarding malformed frame");
                return;
            }
        };

        match incoming.kind.as_str() {
            AUTH_SUCCESS => self.on_auth_success(),
            AUTH_ERROR => self.on_auth_error(),
            _ => {}
        }
        let _ = self.events.send(ClientEvent::Frame(incoming));
    }

    fn on_auth_success(&mut self) {
        if self.replayed.take() != Some(Replayed::Interactive) {
            return;
        }
        let Some(credentials) = self.pending.take() else {
            return;
        };

        let record = SessionRecord {
            server_url: self.server_url.clone(),
            username: credentials.username,
            password: credentials.password,
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&record) {
                tracing::warn!(error = %e, "Failed to save session");
            }
        }
        self.session = Some(record);
    }

    fn on_auth_error(&mut self) {
        match self.replayed.take() {
            Some(Replayed::Stored) => {
                tracing::info!("Saved session rejected, clearing it");
                self.clear_session();
            }
            Some(Replayed::Interactive) => self.pending = None,
            None => {}
        }
    }

    fn forget(&mut self) {
        self.pending = None;
        self.replayed = None;
        self.clear_session();
    }

    fn clear_session(&mut self) {
        self.session = None;
        if let Some(store) = &self.store {
            if let Err(e) = store.clear() {
                tracing::warn!(error = %e, "Failed to clear session");
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::debug!(state = ?state, "Connection state changed");
        self.state.send_replace(state.clone());
        let _ = self.events.send(ClientEvent::State(state));
    }
}

//! Push channel supervisor
//!
//! A single task owns the connection, the state and the retry timer. The
//! `PushChannel` handle only sends commands and reads the `watch`ed status,
//! so at most one connect attempt is ever in flight.

use super::protocol::{self, Inbound};
use super::state::{reconnect_delay, ChannelState, ChannelStatus};
use super::transport::{Connection, Connector};
use crate::auth::{Credential, IdentitySignal};
use crate::error::{SyncError, SyncResult};
use crate::event::{ChannelEvent, Delivery, EventBus};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Heartbeat settings
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between pings
    pub interval: Duration,

    /// How long to wait for any frame after a ping
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(25),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Configuration for the push channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Endpoint URLs tried in order on every attempt
    pub transport_order: Vec<String>,

    /// Deadline for connect + server acknowledgment, per endpoint
    pub handshake_timeout: Duration,

    /// Automatic retries before giving up
    pub max_reconnect_attempts: u32,

    /// Delay before the first retry
    pub reconnect_delay: Duration,

    /// Upper bound for the retry delay
    pub reconnect_delay_ceiling: Duration,

    /// Growth factor between retries
    pub backoff_multiplier: f64,

    pub heartbeat: Option<HeartbeatConfig>,

    /// Emits kept while disconnected; oldest dropped first
    pub max_buffered_frames: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            transport_order: Vec::new(),
            handshake_timeout: Duration::from_secs(20),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_ceiling: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            heartbeat: None,
            max_buffered_frames: 100,
        }
    }
}

impl ChannelConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            transport_order: vec![endpoint.into()],
            ..Self::default()
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.transport_order.is_empty() {
            return Err(SyncError::InvalidConfig {
                message: "push channel needs at least one endpoint".to_string(),
            });
        }
        if self.handshake_timeout.is_zero() {
            return Err(SyncError::InvalidConfig {
                message: "handshake_timeout must be greater than zero".to_string(),
            });
        }
        if self.reconnect_delay > self.reconnect_delay_ceiling {
            return Err(SyncError::InvalidConfig {
                message: "reconnect_delay must not exceed reconnect_delay_ceiling".to_string(),
            });
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(SyncError::InvalidConfig {
                message: "backoff_multiplier must be at least 1.0".to_string(),
            });
        }
        if let Some(heartbeat) = &self.heartbeat {
            if heartbeat.interval.is_zero() || heartbeat.timeout.is_zero() {
                return Err(SyncError::InvalidConfig {
                    message: "heartbeat interval and timeout must be greater than zero"
                        .to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Command {
    Join(String),
    Leave(String),
    Emit(String),
    Reconnect,
    SetCredential(Option<Credential>),
    Shutdown,
}

/// Handle to a running push channel
#[derive(Clone)]
pub struct PushChannel {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ChannelStatus>,
    rooms: Arc<Mutex<BTreeSet<String>>>,
    bus: EventBus,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PushChannel {
    /// Spawn the supervisor and start connecting
    pub fn open<C: Connector>(
        connector: C,
        config: ChannelConfig,
        credential: Option<Credential>,
        bus: EventBus,
    ) -> SyncResult<Self> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::initial(identity_of(&credential)));
        let rooms = Arc::new(Mutex::new(BTreeSet::new()));

        let supervisor = Supervisor {
            connector,
            config,
            credential,
            rooms: Arc::clone(&rooms),
            commands: commands_rx,
            status: status_tx,
            bus: bus.clone(),
            attempts: 0,
            generation: 0,
            outbox: VecDeque::new(),
        };
        let task = tokio::spawn(supervisor.run());

        Ok(Self {
            commands: commands_tx,
            status: status_rx,
            rooms,
            bus,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ChannelState {
        self.status.borrow().state
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Lifecycle and domain events
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.bus.subscribe()
    }

    /// Add a room to the membership set. It is joined now if connected and
    /// again after every reconnect.
    pub fn join_room(&self, room: impl Into<String>) -> SyncResult<()> {
        let room = room.into();
        let added = self.rooms.lock().insert(room.clone());
        if added {
            self.send(Command::Join(room))?;
        }
        Ok(())
    }

    pub fn leave_room(&self, room: &str) -> SyncResult<()> {
        let removed = self.rooms.lock().remove(room);
        if removed {
            self.send(Command::Leave(room.to_string()))?;
        }
        Ok(())
    }

    /// Current membership set
    pub fn rooms(&self) -> BTreeSet<String> {
        self.rooms.lock().clone()
    }

    /// Send a named event. Buffered while disconnected.
    pub fn emit(&self, event: &str, data: Value) -> SyncResult<()> {
        self.send(Command::Emit(protocol::encode(event, data)))
    }

    /// Manual reconnect: resets the attempt counter and connects now
    pub fn reconnect(&self) -> SyncResult<()> {
        self.send(Command::Reconnect)
    }

    /// Switch credentials. A different credential tears the session down
    /// and reconnects under the new identity.
    pub fn set_credential(&self, credential: Option<Credential>) -> SyncResult<()> {
        self.send(Command::SetCredential(credential))
    }

    /// Forward every change of `signal` to `set_credential`
    pub fn follow_identity(&self, mut signal: IdentitySignal) -> JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            while signal.changed().await.is_ok() {
                let credential = signal.borrow_and_update().clone();
                if channel.set_credential(credential).is_err() {
                    break;
                }
            }
        })
    }

    /// Stop the supervisor and wait for it to exit
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::ChannelClosed)
    }
}

fn identity_of(credential: &Option<Credential>) -> Option<String> {
    credential.as_ref().map(|c| c.identity().to_string())
}

fn enqueue(outbox: &mut VecDeque<String>, limit: usize, frame: String) {
    if limit == 0 {
        warn!("Dropping emit, buffering disabled");
        return;
    }
    if outbox.len() >= limit {
        outbox.pop_front();
        warn!(limit, "Emit buffer full, dropping oldest frame");
    }
    outbox.push_back(frame);
}

enum Next {
    Connect,
    Backoff,
    Idle,
    Shutdown,
}

enum SessionEnd {
    Lost(String),
    Closed,
    Reauth,
    Manual,
    Shutdown,
}

struct Supervisor<C: Connector> {
    connector: C,
    config: ChannelConfig,
    credential: Option<Credential>,
    rooms: Arc<Mutex<BTreeSet<String>>>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ChannelStatus>,
    bus: EventBus,
    attempts: u32,
    generation: u64,
    outbox: VecDeque<String>,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self) {
        let mut next = Next::Connect;
        loop {
            next = match next {
                Next::Connect => self.connect().await,
                Next::Backoff => self.backoff().await,
                Next::Idle => self.idle().await,
                Next::Shutdown => break,
            };
        }
        self.transition(ChannelState::Disconnected, None);
        info!("Push channel stopped");
    }

    fn identity(&self) -> Option<String> {
        identity_of(&self.credential)
    }

    fn transition(&self, state: ChannelState, error: Option<String>) {
        let previous = self.status.borrow().state;
        let identity = self.identity();
        self.status.send_modify(|status| {
            status.state = state;
            status.reconnect_attempts = self.attempts;
            status.generation = self.generation;
            status.identity = identity;
            if state == ChannelState::Connected {
                status.last_error = None;
            } else if error.is_some() {
                status.last_error = error;
            }
        });

        if previous != state {
            debug!(from = previous.label(), to = state.label(), "Push channel state changed");
            self.bus.publish(ChannelEvent::StateChanged(state));
        }
    }

    fn fail(&self, message: String) {
        self.bus.publish(ChannelEvent::Error {
            message: message.clone(),
        });
        self.transition(ChannelState::Errored, Some(message));
    }

    async fn connect(&mut self) -> Next {
        self.transition(ChannelState::Connecting, None);

        let result = {
            let opening = open_session(
                &self.connector,
                self.config.transport_order.clone(),
                self.credential.clone(),
                self.config.handshake_timeout,
            );
            tokio::pin!(opening);

            loop {
                tokio::select! {
                    result = &mut opening => break result,
                    command = self.commands.recv() => match command {
                        None | Some(Command::Shutdown) => return Next::Shutdown,
                        Some(Command::Reconnect) => {
                            self.attempts = 0;
                            return Next::Connect;
                        }
                        Some(Command::SetCredential(credential)) => {
                            if credential != self.credential {
                                self.credential = credential;
                                return Next::Connect;
                            }
                        }
                        Some(Command::Emit(frame)) => {
                            enqueue(&mut self.outbox, self.config.max_buffered_frames, frame)
                        }
                        // Membership is applied when the session resumes
                        Some(Command::Join(_)) | Some(Command::Leave(_)) => {}
                    },
                }
            }
        };

        let mut conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, attempt = self.attempts, "Push channel connect failed");
                self.fail(e.to_string());
                return Next::Backoff;
            }
        };

        if let Err(e) = self.resume(&mut conn).await {
            warn!(error = %e, "Push channel failed while rejoining rooms");
            conn.close().await;
            self.fail(e.to_string());
            return Next::Backoff;
        }

        self.attempts = 0;
        self.generation += 1;
        self.transition(ChannelState::Connected, None);
        info!(
            generation = self.generation,
            identity = ?self.identity(),
            rooms = self.rooms.lock().len(),
            "Push channel connected"
        );
        self.bus.publish(ChannelEvent::Connected {
            generation: self.generation,
            identity: self.identity(),
        });

        let end = self.run_session(&mut conn).await;
        let generation = self.generation;
        match end {
            SessionEnd::Lost(reason) => {
                warn!(generation, reason = %reason, "Push channel session lost");
                self.bus.publish(ChannelEvent::Disconnected { generation, reason: reason.clone() });
                self.fail(reason);
                Next::Backoff
            }
            SessionEnd::Closed => {
                info!(generation, "Push channel closed by server");
                self.bus.publish(ChannelEvent::Disconnected {
                    generation,
                    reason: "closed by server".to_string(),
                });
                self.transition(ChannelState::Disconnected, None);
                Next::Backoff
            }
            SessionEnd::Reauth => {
                conn.close().await;
                info!(generation, identity = ?self.identity(), "Credential changed, reconnecting");
                self.bus.publish(ChannelEvent::Disconnected {
                    generation,
                    reason: "credential changed".to_string(),
                });
                Next::Connect
            }
            SessionEnd::Manual => {
                conn.close().await;
                self.attempts = 0;
                self.bus.publish(ChannelEvent::Disconnected {
                    generation,
                    reason: "manual reconnect".to_string(),
                });
                Next::Connect
            }
            SessionEnd::Shutdown => {
                conn.close().await;
                self.bus.publish(ChannelEvent::Disconnected {
                    generation,
                    reason: "shutdown".to_string(),
                });
                Next::Shutdown
            }
        }
    }

    /// Rejoin every room in the membership set, then flush buffered emits
    async fn resume(&mut self, conn: &mut C::Conn) -> SyncResult<()> {
        let rooms: Vec<String> = self.rooms.lock().iter().cloned().collect();
        for room in &rooms {
            conn.send(protocol::join_room(room)).await?;
        }

        let buffered = self.outbox.len();
        while let Some(frame) = self.outbox.pop_front() {
            if let Err(e) = conn.send(frame.clone()).await {
                self.outbox.push_front(frame);
                return Err(e);
            }
        }

        debug!(rooms = rooms.len(), buffered, "Push channel session resumed");
        Ok(())
    }

    async fn run_session(&mut self, conn: &mut C::Conn) -> SessionEnd {
        let heartbeat = self.config.heartbeat.clone();
        let mut ticker = heartbeat.as_ref().map(|hb| {
            let mut interval = tokio::time::interval_at(Instant::now() + hb.interval, hb.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                frame = conn.recv() => match frame {
                    Some(Ok(text)) => {
                        // Any frame proves the peer is alive
                        pong_deadline = None;
                        if let Err(e) = self.handle_frame(conn, &text).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Closed,
                },
                command = self.commands.recv() => {
                    if let Some(end) = self.handle_command(conn, command).await {
                        return end;
                    }
                }
                _ = tick(&mut ticker), if ticker.is_some() && pong_deadline.is_none() => {
                    trace!("Sending heartbeat ping");
                    if let Err(e) = conn.send(protocol::ping()).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                    pong_deadline = heartbeat.as_ref().map(|hb| Instant::now() + hb.timeout);
                }
                _ = sleep_until(pong_deadline), if pong_deadline.is_some() => {
                    return SessionEnd::Lost("heartbeat timed out".to_string());
                }
            }
        }
    }

    async fn handle_frame(&self, conn: &mut C::Conn, text: &str) -> SyncResult<()> {
        match protocol::decode(text) {
            Ok(Inbound::Push { room, event }) => {
                trace!(event = event.name(), generation = self.generation, "Push event received");
                self.bus.publish(ChannelEvent::Push(Delivery {
                    generation: self.generation,
                    identity: self.identity(),
                    room,
                    event,
                }));
            }
            Ok(Inbound::Ping) => conn.send(protocol::pong()).await?,
            Ok(Inbound::Pong) | Ok(Inbound::HandshakeAck) => {}
            Ok(Inbound::ServerError(message)) => {
                warn!(message = %message, "Push server reported an error");
                self.bus.publish(ChannelEvent::Error { message });
            }
            Ok(Inbound::Ignored(name)) => trace!(event = %name, "Ignoring unknown push event"),
            Err(e) => warn!(error = %e, "Dropping malformed push frame"),
        }
        Ok(())
    }

    async fn handle_command(
        &mut self,
        conn: &mut C::Conn,
        command: Option<Command>,
    ) -> Option<SessionEnd> {
        let sent = match command {
            None | Some(Command::Shutdown) => return Some(SessionEnd::Shutdown),
            Some(Command::Reconnect) => return Some(SessionEnd::Manual),
            Some(Command::SetCredential(credential)) => {
                if credential == self.credential {
                    return None;
                }
                self.credential = credential;
                return Some(SessionEnd::Reauth);
            }
            Some(Command::Join(room)) => {
                let member = self.rooms.lock().contains(&room);
                if !member {
                    return None;
                }
                conn.send(protocol::join_room(&room)).await
            }
            Some(Command::Leave(room)) => {
                let member = self.rooms.lock().contains(&room);
                if member {
                    return None;
                }
                conn.send(protocol::leave_room(&room)).await
            }
            Some(Command::Emit(frame)) => match conn.send(frame.clone()).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    enqueue(&mut self.outbox, self.config.max_buffered_frames, frame);
                    Err(e)
                }
            },
        };

        sent.err().map(|e| SessionEnd::Lost(e.to_string()))
    }

    async fn backoff(&mut self) -> Next {
        if self.attempts >= self.config.max_reconnect_attempts {
            warn!(
                attempts = self.attempts,
                "Push channel giving up, waiting for manual reconnect"
            );
            self.transition(ChannelState::Errored, None);
            return Next::Idle;
        }

        self.attempts += 1;
        let delay = reconnect_delay(
            self.config.reconnect_delay,
            self.config.backoff_multiplier,
            self.config.reconnect_delay_ceiling,
            self.attempts,
        );
        info!(
            attempt = self.attempts,
            max = self.config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Push channel reconnect scheduled"
        );
        let current = self.status.borrow().state;
        self.transition(current, None);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Next::Connect,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return Next::Shutdown,
                    Some(Command::Reconnect) => {
                        self.attempts = 0;
                        return Next::Connect;
                    }
                    Some(Command::SetCredential(credential)) => {
                        if credential != self.credential {
                            self.credential = credential;
                            self.attempts = 0;
                            return Next::Connect;
                        }
                    }
                    Some(Command::Emit(frame)) => {
                        enqueue(&mut self.outbox, self.config.max_buffered_frames, frame)
                    }
                    Some(Command::Join(_)) | Some(Command::Leave(_)) => {}
                },
            }
        }
    }

    /// Retries exhausted: stay errored until told otherwise
    async fn idle(&mut self) -> Next {
        loop {
            match self.commands.recv().await {
                None | Some(Command::Shutdown) => return Next::Shutdown,
                Some(Command::Reconnect) => {
                    info!("Manual reconnect requested");
                    self.attempts = 0;
                    return Next::Connect;
                }
                // A new identity is treated as a manual reconnect
                Some(Command::SetCredential(credential)) => {
                    if credential != self.credential {
                        info!(identity = ?identity_of(&credential), "Credential changed, reconnecting");
                        self.credential = credential;
                        self.attempts = 0;
                        return Next::Connect;
                    }
                }
                Some(Command::Emit(frame)) => {
                    enqueue(&mut self.outbox, self.config.max_buffered_frames, frame)
                }
                Some(Command::Join(_)) | Some(Command::Leave(_)) => {}
            }
        }
    }
}

/// Try each endpoint in order; each gets the full handshake deadline
async fn open_session<C: Connector>(
    connector: &C,
    endpoints: Vec<String>,
    credential: Option<Credential>,
    handshake_timeout: Duration,
) -> SyncResult<C::Conn> {
    let mut last_error = SyncError::transport("no endpoint configured");

    for endpoint in &endpoints {
        let attempt = handshake(connector, endpoint, credential.as_ref());
        match tokio::time::timeout(handshake_timeout, attempt).await {
            Ok(Ok(conn)) => {
                debug!(endpoint = %endpoint, "Handshake acknowledged");
                return Ok(conn);
            }
            Ok(Err(e)) => {
                debug!(endpoint = %endpoint, error = %e, "Transport failed");
                last_error = e;
            }
            Err(_) => {
                debug!(endpoint = %endpoint, "Handshake timed out");
                last_error = SyncError::Timeout {
                    operation: format!("handshake with {}", endpoint),
                    timeout_ms: handshake_timeout.as_millis() as u64,
                };
            }
        }
    }

    Err(last_error)
}

async fn handshake<C: Connector>(
    connector: &C,
    endpoint: &str,
    credential: Option<&Credential>,
) -> SyncResult<C::Conn> {
    let mut conn = connector.connect(endpoint, credential).await?;
    loop {
        match conn.recv().await {
            Some(Ok(text)) => match protocol::decode(&text) {
                Ok(Inbound::HandshakeAck) => return Ok(conn),
                Ok(Inbound::ServerError(message)) => {
                    conn.close().await;
                    return Err(SyncError::transport(format!("handshake rejected: {}", message)));
                }
                Ok(other) => trace!(frame = ?other, "Frame before handshake ack"),
                Err(e) => debug!(error = %e, "Malformed frame before handshake ack"),
            },
            Some(Err(e)) => return Err(e),
            None => return Err(SyncError::transport("closed during handshake")),
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = ChannelConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(20));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect_delay_ceiling, Duration::from_secs(5));
        assert!(config.heartbeat.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        assert!(ChannelConfig::default().validate().is_err());
        assert!(ChannelConfig::new("wss://shop.example/ws").validate().is_ok());

        let mut config = ChannelConfig::new("wss://shop.example/ws");
        config.reconnect_delay = Duration::from_secs(10);
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidConfig { .. })
        ));

        let mut config = ChannelConfig::new("wss://shop.example/ws");
        config.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = ChannelConfig::new("wss://shop.example/ws");
        config.heartbeat = Some(HeartbeatConfig {
            interval: Duration::ZERO,
            timeout: Duration::from_secs(1),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enqueue_drops_oldest() {
        let mut outbox = VecDeque::new();
        for i in 0..4 {
            enqueue(&mut outbox, 3, i.to_string());
        }
        assert_eq!(outbox, VecDeque::from(vec!["1".to_string(), "2".to_string(), "3".to_string()]));
    }
}

//! Test doubles shared by the integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::Value;
use shopsync_core::{Backend, Connection, Connector, Credential, FetchRequest, SyncError, SyncResult};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const ACK: &str = r#"{"event":"connected","data":{}}"#;

enum ServerFrame {
    Text(String),
    Fail(String),
    Close,
}

struct Session {
    to_client: mpsc::UnboundedSender<ServerFrame>,
    sent: Arc<Mutex<Vec<String>>>,
    identity: Option<String>,
    endpoint: String,
}

#[derive(Default)]
struct ServerState {
    refuse_next: usize,
    refuse_all: bool,
    refused_endpoints: HashSet<String>,
    silent: bool,
    auto_pong: bool,
    connects: usize,
    sessions: Vec<Session>,
}

/// Scripted push server. Every accepted connection becomes a numbered
/// session the test can push frames into and inspect.
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            state: Arc::clone(&self.state),
        }
    }

    pub fn refuse_next(&self, count: usize) {
        self.state.lock().refuse_next = count;
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.state.lock().refuse_all = refuse;
    }

    pub fn refuse_endpoint(&self, endpoint: &str) {
        self.state.lock().refused_endpoints.insert(endpoint.to_string());
    }

    /// Accept connections but never acknowledge the handshake
    pub fn silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    pub fn auto_pong(&self, enabled: bool) {
        self.state.lock().auto_pong = enabled;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn sent(&self, session: usize) -> Vec<String> {
        self.state.lock().sessions[session].sent.lock().clone()
    }

    /// Rooms the client joined on a session, in order
    pub fn joined_rooms(&self, session: usize) -> Vec<String> {
        self.frames_named(session, "join_room")
            .into_iter()
            .filter_map(|data| data["room"].as_str().map(str::to_string))
            .collect()
    }

    /// Payloads of the frames with a given event name sent on a session
    pub fn frames_named(&self, session: usize, event: &str) -> Vec<Value> {
        self.sent(session)
            .iter()
            .filter_map(|text| serde_json::from_str::<Value>(text).ok())
            .filter(|frame| frame["event"] == event)
            .map(|frame| frame["data"].clone())
            .collect()
    }

    pub fn identity(&self, session: usize) -> Option<String> {
        self.state.lock().sessions[session].identity.clone()
    }

    pub fn endpoint(&self, session: usize) -> String {
        self.state.lock().sessions[session].endpoint.clone()
    }

    pub fn push(&self, session: usize, text: &str) {
        let state = self.state.lock();
        let _ = state.sessions[session]
            .to_client
            .send(ServerFrame::Text(text.to_string()));
    }

    /// Simulate a transport failure on a session
    pub fn fail(&self, session: usize, message: &str) {
        let state = self.state.lock();
        let _ = state.sessions[session]
            .to_client
            .send(ServerFrame::Fail(message.to_string()));
    }

    pub fn close(&self, session: usize) {
        let state = self.state.lock();
        let _ = state.sessions[session].to_client.send(ServerFrame::Close);
    }
}

pub struct MockConnector {
    state: Arc<Mutex<ServerState>>,
}

impl Connector for MockConnector {
    type Conn = MockConnection;

    async fn connect(
        &self,
        endpoint: &str,
        credential: Option<&Credential>,
    ) -> SyncResult<MockConnection> {
        let mut state = self.state.lock();
        state.connects += 1;

        if state.refused_endpoints.contains(endpoint) {
            return Err(SyncError::transport(format!("{} refused", endpoint)));
        }
        if state.refuse_all {
            return Err(SyncError::transport("connection refused"));
        }
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(SyncError::transport("connection refused"));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        if !state.silent {
            let _ = to_client.send(ServerFrame::Text(ACK.to_string()));
        }
        let sent = Arc::new(Mutex::new(Vec::new()));
        let index = state.sessions.len();
        state.sessions.push(Session {
            to_client,
            sent: Arc::clone(&sent),
            identity: credential.map(|c| c.identity().to_string()),
            endpoint: endpoint.to_string(),
        });

        Ok(MockConnection {
            incoming,
            sent,
            state: Arc::clone(&self.state),
            index,
        })
    }
}

pub struct MockConnection {
    incoming: mpsc::UnboundedReceiver<ServerFrame>,
    sent: Arc<Mutex<Vec<String>>>,
    state: Arc<Mutex<ServerState>>,
    index: usize,
}

impl Connection for MockConnection {
    async fn send(&mut self, text: String) -> SyncResult<()> {
        let is_ping = text.contains(r#""event":"ping""#);
        self.sent.lock().push(text);

        if is_ping {
            let state = self.state.lock();
            if state.auto_pong {
                let _ = state.sessions[self.index]
                    .to_client
                    .send(ServerFrame::Text(r#"{"event":"pong","data":{}}"#.to_string()));
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<SyncResult<String>> {
        match self.incoming.recv().await {
            Some(ServerFrame::Text(text)) => Some(Ok(text)),
            Some(ServerFrame::Fail(message)) => Some(Err(SyncError::transport(message))),
            Some(ServerFrame::Close) | None => None,
        }
    }

    async fn close(&mut self) {
        self.incoming.close();
    }
}

/// Canned REST backend keyed by request target
#[derive(Default)]
pub struct StubBackend {
    responses: Mutex<HashMap<String, Value>>,
    calls: Mutex<HashMap<String, usize>>,
    delays: Mutex<HashMap<String, Duration>>,
    credential: Mutex<Option<String>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, target: &str, value: Value) {
        self.responses.lock().insert(target.to_string(), value);
    }

    /// Hold responses for `target` this long. The body is the one
    /// configured when the request arrived.
    pub fn delay(&self, target: &str, delay: Duration) {
        self.delays.lock().insert(target.to_string(), delay);
    }

    pub fn calls_for(&self, target: &str) -> usize {
        self.calls.lock().get(target).copied().unwrap_or(0)
    }

    pub fn identity(&self) -> Option<String> {
        self.credential.lock().clone()
    }
}

impl Backend for StubBackend {
    async fn get_json(&self, request: &FetchRequest) -> SyncResult<Value> {
        *self.calls.lock().entry(request.target.clone()).or_insert(0) += 1;
        let response = self.responses.lock().get(&request.target).cloned();
        let delay = self.delays.lock().get(&request.target).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        response.ok_or_else(|| SyncError::NetworkFailure {
            url: request.target.clone(),
            status: Some(404),
            message: "HTTP 404".to_string(),
        })
    }

    fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.lock() = credential.map(|c| c.identity().to_string());
    }
}

/// Poll `condition` until it holds. With a paused clock the sleeps are
/// free; the iteration cap only guards against hangs.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Await a future with a generous deadline
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(120), future)
        .await
        .expect("timed out")
}

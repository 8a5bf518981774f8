//! Push channel state and reconnect timing

use serde::Serialize;
use std::time::Duration;

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

impl ChannelState {
    pub fn label(self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Errored => "errored",
        }
    }
}

/// Observable snapshot of the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,

    /// Automatic reconnect attempts since the last successful connect
    pub reconnect_attempts: u32,

    /// Bumped on every successful connect
    pub generation: u64,

    /// Identity of the credential in use
    pub identity: Option<String>,

    /// Last transport error, cleared on connect
    pub last_error: Option<String>,
}

impl ChannelStatus {
    pub(crate) fn initial(identity: Option<String>) -> Self {
        Self {
            state: ChannelState::Disconnected,
            reconnect_attempts: 0,
            generation: 0,
            identity,
            last_error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }
}

/// Delay before automatic reconnect attempt `attempt` (1-based):
/// `initial * multiplier^(attempt - 1)`, capped at `ceiling`.
pub fn reconnect_delay(initial: Duration, multiplier: f64, ceiling: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let factor = multiplier.max(1.0).powi(exponent);
    let millis = (initial.as_millis() as f64 * factor).min(ceiling.as_millis() as f64);
    Duration::from_millis(millis as u64)
}

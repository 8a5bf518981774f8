//! Wire frames of the push channel
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}` with an
//! optional `"room"`. Server event names outside the known set are ignored.

use crate::error::{SyncError, SyncResult};
use crate::event::PushEvent;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shopsync_types::{MessageRecord, RemoteNotificationItem};

pub const HANDSHAKE_ACK: &str = "connected";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const SERVER_ERROR: &str = "error";
pub const JOIN_ROOM: &str = "join_room";
pub const LEAVE_ROOM: &str = "leave_room";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

/// What a server frame means to the channel
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    HandshakeAck,
    Ping,
    Pong,
    ServerError(String),
    Push {
        room: Option<String>,
        event: PushEvent,
    },
    /// Unknown event name
    Ignored(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageCreatedData {
    conversation_id: String,
    message: MessageRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TicketUpdatedData {
    ticket_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct CatalogChangedData {
    scope: String,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    message: String,
}

/// Decode one text frame.
///
/// Fails only when the envelope is not JSON or a known event carries a
/// payload of the wrong shape.
pub fn decode(text: &str) -> SyncResult<Inbound> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| SyncError::malformed("push frame", e.to_string()))?;

    let inbound = match frame.event.as_str() {
        HANDSHAKE_ACK => Inbound::HandshakeAck,
        PING => Inbound::Ping,
        PONG => Inbound::Pong,
        SERVER_ERROR => {
            let message = payload::<ErrorData>(&frame)
                .map(|d| d.message)
                .unwrap_or_else(|_| frame.data.to_string());
            Inbound::ServerError(message)
        }
        _ => match parse_push_event(&frame)? {
            Some(event) => Inbound::Push {
                room: frame.room.clone(),
                event,
            },
            None => Inbound::Ignored(frame.event),
        },
    };
    Ok(inbound)
}

fn parse_push_event(frame: &Frame) -> SyncResult<Option<PushEvent>> {
    let event = match frame.event.as_str() {
        "notification_created" => {
            PushEvent::NotificationCreated(payload::<RemoteNotificationItem>(frame)?)
        }
        "notifications_changed" => PushEvent::NotificationsChanged,
        "message_created" => {
            let data = payload::<MessageCreatedData>(frame)?;
            PushEvent::MessageCreated {
                conversation_id: data.conversation_id,
                message: data.message,
            }
        }
        "ticket_updated" => {
            let data = payload::<TicketUpdatedData>(frame)?;
            PushEvent::TicketUpdated {
                ticket_id: data.ticket_id,
                status: data.status,
            }
        }
        "catalog_changed" => PushEvent::CatalogChanged {
            scope: payload::<CatalogChangedData>(frame)?.scope,
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn payload<T: serde::de::DeserializeOwned>(frame: &Frame) -> SyncResult<T> {
    T::deserialize(&frame.data).map_err(|e| SyncError::malformed(&frame.event, e.to_string()))
}

/// Encode an outgoing frame
pub fn encode(event: &str, data: Value) -> String {
    let frame = Frame {
        event: event.to_string(),
        data,
        room: None,
    };
    // A Frame built from a String and a Value always serializes
    serde_json::to_string(&frame).unwrap_or_default()
}

pub fn join_room(room: &str) -> String {
    encode(JOIN_ROOM, json!({ "room": room }))
}

pub fn leave_room(room: &str) -> String {
    encode(LEAVE_ROOM, json!({ "room": room }))
}

pub fn ping() -> String {
    encode(PING, json!({}))
}

pub fn pong() -> String {
    encode(PONG, json!({}))
}

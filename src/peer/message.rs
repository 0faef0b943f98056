//! Прикладные сообщения поверх data-канала.
//!
//! На проводе JSON: `{ "type": "...", "payload": { ... } }`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatPayload {
    pub name: String,
    pub date: String,
    pub text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum PeerMessage {
    NewUser {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    UserInfo {
        name: String,
    },
    ChatMessage(ChatPayload),
}

impl PeerMessage {
    pub const KINDS: [&'static str; 3] = ["new-user", "user-info", "chat-message"];

    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::NewUser { .. } => "new-user",
            PeerMessage::UserInfo { .. } => "user-info",
            PeerMessage::ChatMessage(_) => "chat-message",
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Результат разбора входящего сообщения
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Known(PeerMessage),
    /// Неизвестный `type` не ошибка, просто пропускается
    Unrecognized(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Неизвестный вид даёт `Unrecognized`, известный вид с битым payload даёт ошибку
pub fn decode(raw: &[u8]) -> Result<Inbound, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_slice(raw)?;
    let envelope = Envelope::deserialize(&value)?;
    if !PeerMessage::KINDS.contains(&envelope.kind.as_str()) {
        return Ok(Inbound::Unrecognized(envelope.kind));
    }
    serde_json::from_value(value).map(Inbound::Known)
}

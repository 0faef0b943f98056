use crate::utils::random_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Идентификатор пира, выданный транспортом сигнализации
pub type PeerId = String;

/// Идентификатор канала (data или media), выданный транспортом
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `dc_…` для data, `mc_…` для media
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}_{}", prefix, random_id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Вид канала: сообщения или аудио/видео
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Data,
    Media,
}

impl LinkKind {
    pub fn prefix(self) -> &'static str {
        match self {
            LinkKind::Data => "dc",
            LinkKind::Media => "mc",
        }
    }
}

/// Собственная идентичность сессии. Не меняется после bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub self_peer_id: PeerId,
    pub is_leader: bool,
}

/// Запись чата в порядке локального наблюдения
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatLogEntry {
    pub sender_name: String,
    pub sender_peer_id: PeerId,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Полезная нагрузка SDP с метаданными
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SdpPayload {
    pub sdp: RTCSessionDescription,
    pub id: String,
    pub ts: i64,
}

/// ICE кандидат для WebRTC соединения
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub channel: ChannelId, // канал, к которому относится кандидат
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_channel_ids_carry_prefix_and_differ() {
        let a = ChannelId::generate("dc");
        let b = ChannelId::generate("dc");
        assert!(a.as_str().starts_with("dc_"));
        assert_ne!(a, b);
    }

    #[test]
    fn channel_id_serializes_as_plain_string() {
        let id = ChannelId::new("mc_42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"mc_42\"");
    }
}

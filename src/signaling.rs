//! Граница с транспортом сигнализации: открытие id, исходящие connect/call,
//! входящие события каналов.

use crate::error::TransportError;
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::peer::types::{ChannelId, PeerId};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Двунаправленный канал сообщений с одним пиром
#[async_trait]
pub trait DataLink: Send + Sync {
    fn peer(&self) -> &str;
    fn id(&self) -> &ChannelId;
    fn is_open(&self) -> bool;
    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;
    /// Идемпотентно
    async fn close(&self);
}

/// Исходящий отправитель одной дорожки внутри media-соединения
#[async_trait]
pub trait TrackSender: Send + Sync {
    async fn kind(&self) -> Option<TrackKind>;
    /// Подмена дорожки без пересогласования
    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), TransportError>;
}

/// Аудио/видео сессия с одним пиром
#[async_trait]
pub trait MediaLink: Send + Sync {
    fn peer(&self) -> &str;
    fn id(&self) -> &ChannelId;
    fn is_open(&self) -> bool;
    /// Ответ на входящий звонок своим потоком
    async fn answer(&self, stream: &MediaStream) -> Result<(), TransportError>;
    async fn senders(&self) -> Vec<Arc<dyn TrackSender>>;
    /// Идемпотентно
    async fn close(&self);
}

/// Конечный набор событий транспорта
pub enum TransportEvent {
    /// Входящее data-соединение
    Connection(Arc<dyn DataLink>),
    /// Входящий звонок, ещё без ответа
    Call(Arc<dyn MediaLink>),
    DataOpen {
        peer: PeerId,
        channel: ChannelId,
    },
    Data {
        peer: PeerId,
        channel: ChannelId,
        payload: Bytes,
    },
    DataClosed {
        peer: PeerId,
        channel: ChannelId,
    },
    Stream {
        peer: PeerId,
        channel: ChannelId,
        stream: MediaStream,
    },
    MediaClosed {
        peer: PeerId,
        channel: ChannelId,
    },
    /// Потеряна связь с сервером сигнализации; открытые каналы живут
    Disconnected,
    /// Транспорт закрыт окончательно
    Closed,
    Error(String),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Connection(link) => f
                .debug_struct("Connection")
                .field("peer", &link.peer())
                .field("channel", link.id())
                .finish(),
            TransportEvent::Call(link) => f
                .debug_struct("Call")
                .field("peer", &link.peer())
                .field("channel", link.id())
                .finish(),
            TransportEvent::DataOpen { peer, channel } => f
                .debug_struct("DataOpen")
                .field("peer", peer)
                .field("channel", channel)
                .finish(),
            TransportEvent::Data {
                peer,
                channel,
                payload,
            } => f
                .debug_struct("Data")
                .field("peer", peer)
                .field("channel", channel)
                .field("len", &payload.len())
                .finish(),
            TransportEvent::DataClosed { peer, channel } => f
                .debug_struct("DataClosed")
                .field("peer", peer)
                .field("channel", channel)
                .finish(),
            TransportEvent::Stream {
                peer,
                channel,
                stream,
            } => f
                .debug_struct("Stream")
                .field("peer", peer)
                .field("channel", channel)
                .field("stream", &stream.id())
                .finish(),
            TransportEvent::MediaClosed { peer, channel } => f
                .debug_struct("MediaClosed")
                .field("peer", peer)
                .field("channel", channel)
                .finish(),
            TransportEvent::Disconnected => f.write_str("Disconnected"),
            TransportEvent::Closed => f.write_str("Closed"),
            TransportEvent::Error(msg) => f.debug_tuple("Error").field(msg).finish(),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Результат успешного `open`
pub struct Opened {
    pub peer_id: PeerId,
    pub events: EventReceiver,
}

/// Транспорт сигнализации (NAT traversal, установка каналов)
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// `Some(id)` просит ровно этот id, `None` просит сгенерировать
    async fn open(&mut self, requested: Option<&str>) -> Result<Opened, TransportError>;
    async fn connect(&self, peer: &str) -> Result<Arc<dyn DataLink>, TransportError>;
    async fn call(&self, peer: &str, stream: &MediaStream) -> Result<Arc<dyn MediaLink>, TransportError>;
}

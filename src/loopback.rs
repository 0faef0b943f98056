//! Транспорт в пределах одного процесса: сессии находят друг друга через
//! общий `LoopbackHub`, события доставляются в порядке отправки.
//! Для тестов и демо без сети.

use crate::error::TransportError;
use crate::media::{MediaConstraints, MediaProvider, MediaStream, MediaTrack, TrackKind};
use crate::peer::types::{ChannelId, PeerId};
use crate::signaling::{
    DataLink, EventReceiver, EventSender, MediaLink, Opened, SignalingTransport, TrackSender,
    TransportEvent,
};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct HubInner {
    peers: HashMap<PeerId, EventSender>,
    media: HashMap<(PeerId, ChannelId), Weak<LoopbackMediaLink>>,
}

/// Общая «точка встречи» для loopback-транспортов
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            self_id: None,
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.inner.lock().peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    fn register(&self, requested: Option<&str>) -> Result<(PeerId, EventReceiver), TransportError> {
        let mut inner = self.inner.lock();
        let peer_id = match requested {
            Some(id) if inner.peers.contains_key(id) => {
                return Err(TransportError::IdTaken(id.to_string()))
            }
            Some(id) => id.to_string(),
            None => random_id(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        inner.peers.insert(peer_id.clone(), tx);
        Ok((peer_id, rx))
    }

    fn is_registered(&self, peer: &str) -> bool {
        self.inner.lock().peers.contains_key(peer)
    }

    fn deliver(&self, peer: &str, event: TransportEvent) -> bool {
        let tx = self.inner.lock().peers.get(peer).cloned();
        match tx {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                debug!(peer, ?event, "loopback delivery to unknown peer dropped");
                false
            }
        }
    }

    /// Сообщает пиру о потере сервера сигнализации
    pub fn disconnect(&self, peer: &str) -> bool {
        self.deliver(peer, TransportEvent::Disconnected)
    }

    /// Снимает регистрацию пира и закрывает его поток событий
    pub fn shutdown(&self, peer: &str) {
        let tx = self.inner.lock().peers.remove(peer);
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Closed);
        }
    }

    fn remember_media(&self, owner: &str, link: &Arc<LoopbackMediaLink>) {
        self.inner.lock().media.insert(
            (owner.to_string(), link.shared.id.clone()),
            Arc::downgrade(link),
        );
    }

    /// Что `owner` сейчас отправляет по media-каналу: (вид, id дорожки)
    pub fn outgoing_tracks(&self, owner: &str, channel: &ChannelId) -> Vec<(TrackKind, String)> {
        let link = self
            .inner
            .lock()
            .media
            .get(&(owner.to_string(), channel.clone()))
            .and_then(Weak::upgrade);
        match link {
            Some(link) => link
                .senders
                .lock()
                .iter()
                .map(|s| {
                    let track = s.track.lock();
                    (s.kind, track.id().to_string())
                })
                .collect(),
            None => Vec::new(),
        }
    }
}

pub struct LoopbackTransport {
    hub: LoopbackHub,
    self_id: Option<PeerId>,
}

impl LoopbackTransport {
    fn me(&self) -> Result<PeerId, TransportError> {
        self.self_id.clone().ok_or(TransportError::NotOpen)
    }

    fn ensure_reachable(&self, peer: &str) -> Result<(), TransportError> {
        if self.hub.is_registered(peer) {
            Ok(())
        } else {
            Err(TransportError::PeerUnavailable(peer.to_string()))
        }
    }
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    async fn open(&mut self, requested: Option<&str>) -> Result<Opened, TransportError> {
        let (peer_id, events) = self.hub.register(requested)?;
        self.self_id = Some(peer_id.clone());
        Ok(Opened { peer_id, events })
    }

    async fn connect(&self, peer: &str) -> Result<Arc<dyn DataLink>, TransportError> {
        let me = self.me()?;
        self.ensure_reachable(peer)?;

        let shared = Arc::new(LinkShared {
            id: ChannelId::generate("dc"),
            closed: AtomicBool::new(false),
        });
        let local = Arc::new(LoopbackDataLink {
            owner: me.clone(),
            remote: peer.to_string(),
            shared: shared.clone(),
            hub: self.hub.clone(),
        });
        let remote = Arc::new(LoopbackDataLink {
            owner: peer.to_string(),
            remote: me.clone(),
            shared: shared.clone(),
            hub: self.hub.clone(),
        });

        self.hub.deliver(peer, TransportEvent::Connection(remote));
        self.hub.deliver(
            peer,
            TransportEvent::DataOpen {
                peer: me.clone(),
                channel: shared.id.clone(),
            },
        );
        self.hub.deliver(
            &me,
            TransportEvent::DataOpen {
                peer: peer.to_string(),
                channel: shared.id.clone(),
            },
        );
        Ok(local as Arc<dyn DataLink>)
    }

    async fn call(&self, peer: &str, stream: &MediaStream) -> Result<Arc<dyn MediaLink>, TransportError> {
        let me = self.me()?;
        self.ensure_reachable(peer)?;

        let shared = Arc::new(CallShared {
            id: ChannelId::generate("mc"),
            caller: me.clone(),
            callee: peer.to_string(),
            offered: stream.clone(),
            answered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let local = LoopbackMediaLink::new(&me, peer, shared.clone(), self.hub.clone());
        local.install_senders(stream);
        let remote = LoopbackMediaLink::new(peer, &me, shared, self.hub.clone());

        self.hub.remember_media(&me, &local);
        self.hub.remember_media(peer, &remote);
        self.hub.deliver(peer, TransportEvent::Call(remote));
        Ok(local as Arc<dyn MediaLink>)
    }
}

struct LinkShared {
    id: ChannelId,
    closed: AtomicBool,
}

/// Один конец data-канала
pub struct LoopbackDataLink {
    owner: PeerId,
    remote: PeerId,
    shared: Arc<LinkShared>,
    hub: LoopbackHub,
}

#[async_trait]
impl DataLink for LoopbackDataLink {
    fn peer(&self) -> &str {
        &self.remote
    }

    fn id(&self) -> &ChannelId {
        &self.shared.id
    }

    fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed(self.shared.id.to_string()));
        }
        let delivered = self.hub.deliver(
            &self.remote,
            TransportEvent::Data {
                peer: self.owner.clone(),
                channel: self.shared.id.clone(),
                payload,
            },
        );
        if delivered {
            Ok(())
        } else {
            Err(TransportError::PeerUnavailable(self.remote.clone()))
        }
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // close видят обе стороны
        self.hub.deliver(
            &self.owner,
            TransportEvent::DataClosed {
                peer: self.remote.clone(),
                channel: self.shared.id.clone(),
            },
        );
        self.hub.deliver(
            &self.remote,
            TransportEvent::DataClosed {
                peer: self.owner.clone(),
                channel: self.shared.id.clone(),
            },
        );
    }
}

struct CallShared {
    id: ChannelId,
    caller: PeerId,
    callee: PeerId,
    offered: MediaStream,
    answered: AtomicBool,
    closed: AtomicBool,
}

/// Один конец media-соединения
pub struct LoopbackMediaLink {
    owner: PeerId,
    remote: PeerId,
    shared: Arc<CallShared>,
    senders: Mutex<Vec<Arc<LoopbackSender>>>,
    hub: LoopbackHub,
}

impl LoopbackMediaLink {
    fn new(owner: &str, remote: &str, shared: Arc<CallShared>, hub: LoopbackHub) -> Arc<Self> {
        Arc::new(Self {
            owner: owner.to_string(),
            remote: remote.to_string(),
            shared,
            senders: Mutex::new(Vec::new()),
            hub,
        })
    }

    fn install_senders(&self, stream: &MediaStream) {
        *self.senders.lock() = stream
            .tracks()
            .iter()
            .map(|track| {
                Arc::new(LoopbackSender {
                    kind: track.kind(),
                    track: Mutex::new(track.clone()),
                })
            })
            .collect();
    }
}

#[async_trait]
impl MediaLink for LoopbackMediaLink {
    fn peer(&self) -> &str {
        &self.remote
    }

    fn id(&self) -> &ChannelId {
        &self.shared.id
    }

    fn is_open(&self) -> bool {
        self.shared.answered.load(Ordering::SeqCst) && !self.shared.closed.load(Ordering::SeqCst)
    }

    async fn answer(&self, stream: &MediaStream) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed(self.shared.id.to_string()));
        }
        if self.shared.answered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.install_senders(stream);

        // каждая сторона получает копию чужих дорожек
        self.hub.deliver(
            &self.shared.caller,
            TransportEvent::Stream {
                peer: self.shared.callee.clone(),
                channel: self.shared.id.clone(),
                stream: mirror(stream),
            },
        );
        self.hub.deliver(
            &self.shared.callee,
            TransportEvent::Stream {
                peer: self.shared.caller.clone(),
                channel: self.shared.id.clone(),
                stream: mirror(&self.shared.offered),
            },
        );
        Ok(())
    }

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
        self.senders
            .lock()
            .iter()
            .map(|s| s.clone() as Arc<dyn TrackSender>)
            .collect()
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.hub.deliver(
            &self.owner,
            TransportEvent::MediaClosed {
                peer: self.remote.clone(),
                channel: self.shared.id.clone(),
            },
        );
        self.hub.deliver(
            &self.remote,
            TransportEvent::MediaClosed {
                peer: self.owner.clone(),
                channel: self.shared.id.clone(),
            },
        );
    }
}

fn mirror(stream: &MediaStream) -> MediaStream {
    let tracks = stream
        .tracks()
        .iter()
        .map(|t| LoopbackTrack::new(t.id(), t.kind()) as Arc<dyn MediaTrack>)
        .collect();
    MediaStream::new(stream.id(), tracks)
}

pub struct LoopbackSender {
    kind: TrackKind,
    track: Mutex<Arc<dyn MediaTrack>>,
}

#[async_trait]
impl TrackSender for LoopbackSender {
    async fn kind(&self) -> Option<TrackKind> {
        Some(self.kind)
    }

    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), TransportError> {
        *self.track.lock() = track;
        Ok(())
    }
}

/// Дорожка-заглушка: помнит, остановлена ли она
pub struct LoopbackTrack {
    id: String,
    kind: TrackKind,
    live: AtomicBool,
}

impl LoopbackTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            live: AtomicBool::new(true),
        })
    }
}

impl MediaTrack for LoopbackTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Камера + микрофон, выдающие заглушки. `unavailable` имитирует отказ.
pub struct LoopbackCamera {
    name: String,
    available: bool,
}

impl LoopbackCamera {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: true,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            name: "none".into(),
            available: false,
        }
    }
}

#[async_trait]
impl MediaProvider for LoopbackCamera {
    async fn capture_stream(&self, constraints: &MediaConstraints) -> Option<MediaStream> {
        if !self.available {
            return None;
        }
        let tag = random_id();
        let audio = LoopbackTrack::new(format!("{}-audio-{}", self.name, tag), TrackKind::Audio);
        let video = LoopbackTrack::new(
            format!(
                "{}-video-{}x{}-{}",
                self.name, constraints.width, constraints.height, tag
            ),
            TrackKind::Video,
        );
        Some(MediaStream::new(
            format!("{}-{}", self.name, tag),
            vec![audio as Arc<dyn MediaTrack>, video as Arc<dyn MediaTrack>],
        ))
    }
}

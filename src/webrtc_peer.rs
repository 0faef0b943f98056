//! SignalingTransport поверх webrtc-rs.
//!
//! Каждый data- и media-канал живёт в собственном RTCPeerConnection.
//! SDP и ICE кандидаты ходят через внешний `SignalRelay` кадрами `SignalFrame`.

use crate::config::MeshConfig;
use crate::error::TransportError;
use crate::media::{MediaStream, MediaTrack};
use crate::peer::connection::{build_api, new_peer, rtc_config, watch_state, PeerRegistry};
use crate::peer::data_channel::{attach_dc, RtcDataLink, DATA_LABEL};
use crate::peer::ice::{analyze_candidates, apply_pending_candidates, candidate_from_rtc};
use crate::peer::tracks::{add_stream_tracks, RtcRemoteTrack, RtcTrackSender};
use crate::peer::types::{ChannelId, IceCandidate, LinkKind, PeerId, SdpPayload, ServerConfig};
use crate::signaling::{
    DataLink, EventSender, MediaLink, Opened, SignalingTransport, TrackSender, TransportEvent,
};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", content = "body", rename_all = "kebab-case")]
pub enum SignalBody {
    Offer(SdpPayload),
    Answer(SdpPayload),
    Candidate(IceCandidate),
}

/// Кадр сигнализации между двумя пирами по одному каналу
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignalFrame {
    pub from: PeerId,
    pub to: PeerId,
    pub channel: ChannelId,
    pub link: LinkKind,
    pub body: SignalBody,
}

impl SignalFrame {
    /// base64(JSON), удобно для текстовых relay и ручного обмена
    pub fn encode(&self) -> Result<String, TransportError> {
        let json = serde_json::to_string(self).map_err(|e| TransportError::Relay(e.to_string()))?;
        Ok(general_purpose::STANDARD.encode(json))
    }

    pub fn decode(s: &str) -> Result<Self, TransportError> {
        let raw = general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| TransportError::Relay(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| TransportError::Relay(e.to_string()))
    }
}

/// Сервер сигнализации: выдаёт id и пересылает кадры адресату
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// `None` просит сервер выдать id самому
    async fn register(&self, requested: Option<&str>) -> Result<PeerId, TransportError>;
    /// `PeerUnavailable`, если адресат не зарегистрирован
    async fn send(&self, frame: SignalFrame) -> Result<(), TransportError>;
}

pub type SignalReceiver = mpsc::UnboundedReceiver<SignalFrame>;

struct Inner {
    api: API,
    ice_servers: Vec<ServerConfig>,
    relay: Arc<dyn SignalRelay>,
    registry: PeerRegistry,
    self_id: Mutex<Option<PeerId>>,
    events: Mutex<Option<EventSender>>,
}

pub struct WebRtcTransport {
    inner: Arc<Inner>,
    inbound: Option<SignalReceiver>,
}

impl WebRtcTransport {
    /// `inbound` - кадры, которые relay доставил этому пиру
    pub fn new(
        ice_servers: Vec<ServerConfig>,
        relay: Arc<dyn SignalRelay>,
        inbound: SignalReceiver,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            inner: Arc::new(Inner {
                api: build_api()?,
                ice_servers,
                relay,
                registry: PeerRegistry::default(),
                self_id: Mutex::new(None),
                events: Mutex::new(None),
            }),
            inbound: Some(inbound),
        })
    }

    pub fn from_config(
        config: &MeshConfig,
        relay: Arc<dyn SignalRelay>,
        inbound: SignalReceiver,
    ) -> Result<Self, TransportError> {
        Self::new(config.ice_servers.clone(), relay, inbound)
    }

    /// Число живых RTCPeerConnection
    pub fn open_connections(&self) -> usize {
        self.inner.registry.len()
    }

    /// Удалённые кандидаты, ждущие remote description
    pub fn pending_candidates(&self) -> usize {
        self.inner.registry.pending_candidates()
    }
}

#[async_trait]
impl SignalingTransport for WebRtcTransport {
    async fn open(&mut self, requested: Option<&str>) -> Result<Opened, TransportError> {
        let inbound = self
            .inbound
            .take()
            .ok_or_else(|| TransportError::Relay("transport is already open".into()))?;

        let peer_id = match self.inner.relay.register(requested).await {
            Ok(id) => id,
            Err(e) => {
                self.inbound = Some(inbound);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.self_id.lock() = Some(peer_id.clone());
        *self.inner.events.lock() = Some(tx);
        info!(%peer_id, "webrtc transport open");

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.process_signals(inbound).await });

        Ok(Opened {
            peer_id,
            events: rx,
        })
    }

    async fn connect(&self, peer: &str) -> Result<Arc<dyn DataLink>, TransportError> {
        let events = self.inner.events()?;
        let channel = ChannelId::generate(LinkKind::Data.prefix());
        let pc = self.inner.new_link_pc(peer, &channel, LinkKind::Data).await?;

        let dc = pc
            .create_data_channel(DATA_LABEL, Some(RTCDataChannelInit::default()))
            .await?;
        attach_dc(&dc, peer, &channel, &events);
        let link = RtcDataLink::new(peer, channel.clone(), pc.clone(), dc, self.inner.registry.clone());

        if let Err(e) = self.inner.offer(&pc, peer, &channel, LinkKind::Data).await {
            link.close().await;
            return Err(e);
        }
        debug!(peer, %channel, "data offer sent");
        Ok(link as Arc<dyn DataLink>)
    }

    async fn call(&self, peer: &str, stream: &MediaStream) -> Result<Arc<dyn MediaLink>, TransportError> {
        let events = self.inner.events()?;
        let channel = ChannelId::generate(LinkKind::Media.prefix());
        let pc = self.inner.new_link_pc(peer, &channel, LinkKind::Media).await?;

        let link = RtcMediaLink::new(peer, channel.clone(), pc.clone(), None, self.inner.clone());
        link.watch_tracks(&events);

        let started = match add_stream_tracks(&pc, stream).await {
            Ok(_) => self.inner.offer(&pc, peer, &channel, LinkKind::Media).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            link.close().await;
            return Err(e);
        }
        debug!(peer, %channel, "media offer sent");
        Ok(link as Arc<dyn MediaLink>)
    }
}

impl Inner {
    fn self_id(&self) -> Result<PeerId, TransportError> {
        self.self_id.lock().clone().ok_or(TransportError::NotOpen)
    }

    fn events(&self) -> Result<EventSender, TransportError> {
        self.events.lock().clone().ok_or(TransportError::NotOpen)
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    async fn process_signals(self: Arc<Self>, mut inbound: SignalReceiver) {
        while let Some(frame) = inbound.recv().await {
            let channel = frame.channel.clone();
            if let Err(e) = self.handle_signal(frame).await {
                warn!(%channel, error = %e, "failed to process signal frame");
                self.emit(TransportEvent::Error(e.to_string()));
            }
        }
        info!("signaling relay closed");
        self.emit(TransportEvent::Disconnected);
    }

    async fn handle_signal(self: &Arc<Self>, frame: SignalFrame) -> Result<(), TransportError> {
        let me = self.self_id()?;
        if frame.to != me {
            debug!(to = %frame.to, "frame for another peer ignored");
            return Ok(());
        }

        let SignalFrame {
            from,
            channel,
            link,
            body,
            ..
        } = frame;

        match body {
            SignalBody::Offer(offer) => {
                debug!(%from, %channel, ?link, "incoming offer");
                match link {
                    LinkKind::Data => self.accept_data(&from, &channel, offer).await,
                    LinkKind::Media => self.accept_call(&from, &channel, offer).await,
                }
            }

            SignalBody::Answer(answer) => {
                let pc = self
                    .registry
                    .get(&channel)
                    .ok_or_else(|| TransportError::ChannelClosed(channel.to_string()))?;
                pc.set_remote_description(answer.sdp).await?;
                self.flush_candidates(&channel, &pc).await;
                debug!(%from, %channel, "answer applied");
                Ok(())
            }

            SignalBody::Candidate(candidate) => self.remote_candidate(candidate).await,
        }
    }

    async fn new_link_pc(
        &self,
        peer: &str,
        channel: &ChannelId,
        kind: LinkKind,
    ) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let events = self.events()?;
        let me = self.self_id()?;

        let pc = new_peer(&self.api, rtc_config(&self.ice_servers), channel).await?;
        watch_state(&pc, peer, channel, kind, &events, &self.registry);
        self.forward_candidates(&pc, me, peer, channel, kind);
        self.registry.insert(channel, pc.clone());
        Ok(pc)
    }

    /// Локальные кандидаты сразу уходят удалённой стороне (trickle ICE)
    fn forward_candidates(
        &self,
        pc: &RTCPeerConnection,
        from: PeerId,
        to: &str,
        channel: &ChannelId,
        kind: LinkKind,
    ) {
        let relay = self.relay.clone();
        let to = to.to_string();
        let channel = channel.clone();
        let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::default();

        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let relay = relay.clone();
            let from = from.clone();
            let to = to.clone();
            let channel = channel.clone();
            let gathered = gathered.clone();

            Box::pin(async move {
                match cand {
                    Some(c) => {
                        let Some(candidate) = candidate_from_rtc(&c, &channel) else {
                            return;
                        };
                        gathered.lock().push(candidate.clone());
                        let frame = SignalFrame {
                            from,
                            to,
                            channel: channel.clone(),
                            link: kind,
                            body: SignalBody::Candidate(candidate),
                        };
                        if let Err(e) = relay.send(frame).await {
                            warn!(%channel, error = %e, "failed to relay local candidate");
                        }
                    }
                    None => {
                        debug!(%channel, "ICE gathering complete");
                        analyze_candidates(&gathered.lock());
                    }
                }
            })
        }));
    }

    async fn offer(
        &self,
        pc: &RTCPeerConnection,
        to: &str,
        channel: &ChannelId,
        kind: LinkKind,
    ) -> Result<(), TransportError> {
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        self.send_description(pc, to, channel, kind, SignalBody::Offer)
            .await
    }

    async fn answer_offer(
        &self,
        pc: &RTCPeerConnection,
        to: &str,
        channel: &ChannelId,
        kind: LinkKind,
        offer: SdpPayload,
    ) -> Result<(), TransportError> {
        pc.set_remote_description(offer.sdp).await?;
        self.flush_candidates(channel, pc).await;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        self.send_description(pc, to, channel, kind, SignalBody::Answer)
            .await
    }

    async fn send_description(
        &self,
        pc: &RTCPeerConnection,
        to: &str,
        channel: &ChannelId,
        kind: LinkKind,
        wrap: fn(SdpPayload) -> SignalBody,
    ) -> Result<(), TransportError> {
        let sdp = pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Relay(format!("no local description for `{channel}`")))?;

        let frame = SignalFrame {
            from: self.self_id()?,
            to: to.to_string(),
            channel: channel.clone(),
            link: kind,
            body: wrap(SdpPayload {
                sdp,
                id: channel.to_string(),
                ts: Utc::now().timestamp(),
            }),
        };
        self.relay.send(frame).await
    }

    async fn accept_data(
        &self,
        from: &str,
        channel: &ChannelId,
        offer: SdpPayload,
    ) -> Result<(), TransportError> {
        let events = self.events()?;
        let pc = self.new_link_pc(from, channel, LinkKind::Data).await?;

        pc.on_data_channel(Box::new({
            let weak = Arc::downgrade(&pc);
            let registry = self.registry.clone();
            let from = from.to_string();
            let channel = channel.clone();
            move |dc: Arc<RTCDataChannel>| {
                if let Some(pc) = weak.upgrade() {
                    let link = RtcDataLink::new(&from, channel.clone(), pc, dc.clone(), registry.clone());
                    // Connection обязан прийти раньше DataOpen
                    let _ = events.send(TransportEvent::Connection(link));
                    attach_dc(&dc, &from, &channel, &events);
                }
                Box::pin(async {})
            }
        }));

        if let Err(e) = self.answer_offer(&pc, from, channel, LinkKind::Data, offer).await {
            self.forget(channel);
            if let Err(close) = pc.close().await {
                debug!(%channel, error = %close, "peer connection close failed");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn accept_call(
        self: &Arc<Self>,
        from: &str,
        channel: &ChannelId,
        offer: SdpPayload,
    ) -> Result<(), TransportError> {
        let events = self.events()?;
        let pc = self.new_link_pc(from, channel, LinkKind::Media).await?;
        let link = RtcMediaLink::new(from, channel.clone(), pc, Some(offer), self.clone());
        link.watch_tracks(&events);
        let _ = events.send(TransportEvent::Call(link));
        Ok(())
    }

    /// Сначала в очередь, потом проверка remote description: входящий звонок
    /// отвечается из другой задачи, и его flush может пройти между ними.
    async fn remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let channel = candidate.channel.clone();
        if !self.registry.queue_candidate(candidate) {
            return Ok(());
        }
        if let Some(pc) = self.registry.get(&channel) {
            if pc.remote_description().await.is_some() {
                self.flush_candidates(&channel, &pc).await;
            }
        }
        Ok(())
    }

    async fn flush_candidates(&self, channel: &ChannelId, pc: &RTCPeerConnection) {
        let queued = self.registry.take_candidates(channel);
        if !queued.is_empty() {
            debug!(%channel, count = queued.len(), "applying pending candidates");
        }
        apply_pending_candidates(pc, queued).await;
    }

    fn forget(&self, channel: &ChannelId) {
        self.registry.forget(channel);
    }
}

/// Media-канал: своё RTCPeerConnection, входящий offer ждёт `answer`
pub struct RtcMediaLink {
    peer: PeerId,
    id: ChannelId,
    pc: Arc<RTCPeerConnection>,
    offer: Mutex<Option<SdpPayload>>,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl RtcMediaLink {
    fn new(
        peer: &str,
        id: ChannelId,
        pc: Arc<RTCPeerConnection>,
        offer: Option<SdpPayload>,
        inner: Arc<Inner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.to_string(),
            id,
            pc,
            offer: Mutex::new(offer),
            inner,
            closed: AtomicBool::new(false),
        })
    }

    /// Каждая новая удалённая дорожка публикует накопленный поток целиком
    fn watch_tracks(&self, events: &EventSender) {
        let events = events.clone();
        let peer = self.peer.clone();
        let channel = self.id.clone();
        let received = Arc::new(Mutex::new(MediaStream::empty(channel.to_string())));

        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                if let Some(remote) = RtcRemoteTrack::new(track) {
                    debug!(%peer, %channel, track = remote.id(), "remote track received");
                    let stream = {
                        let mut stream = received.lock();
                        stream.add_track(remote);
                        stream.clone()
                    };
                    let _ = events.send(TransportEvent::Stream {
                        peer: peer.clone(),
                        channel: channel.clone(),
                        stream,
                    });
                }
                Box::pin(async {})
            },
        ));
    }
}

#[async_trait]
impl MediaLink for RtcMediaLink {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.pc.connection_state() == RTCPeerConnectionState::Connected
    }

    async fn answer(&self, stream: &MediaStream) -> Result<(), TransportError> {
        let offer = self
            .offer
            .lock()
            .take()
            .ok_or_else(|| TransportError::Relay(format!("call `{}` has no pending offer", self.id)))?;

        self.pc.set_remote_description(offer.sdp).await?;
        self.inner.flush_candidates(&self.id, &self.pc).await;
        add_stream_tracks(&self.pc, stream).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.inner
            .send_description(&self.pc, &self.peer, &self.id, LinkKind::Media, SignalBody::Answer)
            .await
    }

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
        self.pc
            .get_senders()
            .await
            .into_iter()
            .map(|sender| RtcTrackSender::new(sender) as Arc<dyn TrackSender>)
            .collect()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.forget(&self.id);
        if let Err(e) = self.pc.close().await {
            debug!(channel = %self.id, error = %e, "peer connection close failed");
        }
    }
}

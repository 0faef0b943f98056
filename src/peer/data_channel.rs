use crate::error::TransportError;
use crate::peer::connection::PeerRegistry;
use crate::peer::types::{ChannelId, PeerId};
use crate::signaling::{DataLink, EventSender, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

pub const DATA_LABEL: &str = "meshroom";

/// Data-канал поверх собственного RTCPeerConnection
pub struct RtcDataLink {
    peer: PeerId,
    id: ChannelId,
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    registry: PeerRegistry,
    closed: AtomicBool,
}

impl RtcDataLink {
    pub fn new(
        peer: &str,
        id: ChannelId,
        pc: Arc<RTCPeerConnection>,
        dc: Arc<RTCDataChannel>,
        registry: PeerRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.to_string(),
            id,
            pc,
            dc,
            registry,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl DataLink for RtcDataLink {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        // JSON уходит текстом
        let text = String::from_utf8_lossy(&payload).into_owned();
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.dc.close().await {
            debug!(channel = %self.id, error = %e, "data channel close failed");
        }
        self.registry.forget(&self.id);
        if let Err(e) = self.pc.close().await {
            debug!(channel = %self.id, error = %e, "peer connection close failed");
        }
    }
}

/// общий обработчик data-channel: open/message/close превращаются в события сессии
pub fn attach_dc(dc: &Arc<RTCDataChannel>, peer: &str, channel: &ChannelId, events: &EventSender) {
    dc.on_open(Box::new({
        let events = events.clone();
        let peer = peer.to_string();
        let channel = channel.clone();
        move || {
            debug!(%peer, %channel, "data channel opened");
            let _ = events.send(TransportEvent::DataOpen { peer, channel });
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let events = events.clone();
        let peer = peer.to_string();
        let channel = channel.clone();
        move |msg: DataChannelMessage| {
            trace!(%peer, %channel, len = msg.data.len(), "received message");
            let _ = events.send(TransportEvent::Data {
                peer: peer.clone(),
                channel: channel.clone(),
                payload: msg.data,
            });
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new({
        let events = events.clone();
        let peer = peer.to_string();
        let channel = channel.clone();
        move || {
            debug!(%peer, %channel, "data channel closed");
            let _ = events.send(TransportEvent::DataClosed {
                peer: peer.clone(),
                channel: channel.clone(),
            });
            Box::pin(async {})
        }
    }));
}

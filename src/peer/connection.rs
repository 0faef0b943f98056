use crate::error::TransportError;
use crate::peer::ice::PendingCandidates;
use crate::peer::types::{ChannelId, IceCandidate, LinkKind, PeerId, ServerConfig};
use crate::signaling::{EventSender, TransportEvent};
use crate::utils::add_ice_url_scheme;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;

/// Период ожидания перед принудительным закрытием разорванного соединения
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// API с кодеками и интерсепторами по умолчанию (нужны для media)
pub fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// RTCPeerConnection и ранние ICE кандидаты по id канала (одно соединение на канал)
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<Mutex<HashMap<ChannelId, Arc<RTCPeerConnection>>>>,
    pending: Arc<Mutex<PendingCandidates>>,
}

impl PeerRegistry {
    pub fn insert(&self, channel: &ChannelId, pc: Arc<RTCPeerConnection>) {
        self.inner.lock().insert(channel.clone(), pc);
    }

    pub fn get(&self, channel: &ChannelId) -> Option<Arc<RTCPeerConnection>> {
        self.inner.lock().get(channel).cloned()
    }

    /// Любое закрытие канала проходит здесь: соединение и его очередь кандидатов
    pub fn forget(&self, channel: &ChannelId) -> Option<Arc<RTCPeerConnection>> {
        self.pending.lock().forget(channel);
        self.inner.lock().remove(channel)
    }

    pub fn queue_candidate(&self, candidate: IceCandidate) -> bool {
        self.pending.lock().queue(candidate)
    }

    pub fn take_candidates(&self, channel: &ChannelId) -> Vec<IceCandidate> {
        self.pending.lock().take(channel)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub async fn new_peer(api: &API, config: RTCConfiguration, channel: &ChannelId) -> Result<Arc<RTCPeerConnection>, TransportError> {
    let pc = Arc::new(api.new_peer_connection(config).await?);

    let label = channel.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!(channel = %label, ?state, "ICE gathering state changed");
        Box::pin(async {})
    }));

    Ok(pc)
}

pub fn close_event(kind: LinkKind, peer: PeerId, channel: ChannelId) -> TransportEvent {
    match kind {
        LinkKind::Data => TransportEvent::DataClosed { peer, channel },
        LinkKind::Media => TransportEvent::MediaClosed { peer, channel },
    }
}

/// Failed/Closed → событие закрытия канала (один раз).
/// Disconnected → ждём GRACE_PERIOD, если не восстановилось, закрываем.
pub fn watch_state(
    pc: &Arc<RTCPeerConnection>,
    peer: &str,
    channel: &ChannelId,
    kind: LinkKind,
    events: &EventSender,
    registry: &PeerRegistry,
) {
    let weak = Arc::downgrade(pc);
    let reported = Arc::new(AtomicBool::new(false));
    let peer = peer.to_string();
    let channel = channel.clone();
    let events = events.clone();
    let registry = registry.clone();

    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!(%channel, state = ?st, "peer connection state changed");

        match st {
            RTCPeerConnectionState::Connected => {
                info!(peer = %peer, %channel, "peer connection connected");
            }

            RTCPeerConnectionState::Disconnected => {
                let weak = weak.clone();
                let channel = channel.clone();
                tokio::spawn(async move {
                    sleep(GRACE_PERIOD).await;
                    if let Some(pc) = weak.upgrade() {
                        if pc.connection_state() != RTCPeerConnectionState::Connected {
                            warn!(%channel, "connection did not recover during grace period");
                            let _ = pc.close().await;
                        }
                    }
                });
            }

            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                if !reported.swap(true, Ordering::SeqCst) {
                    registry.forget(&channel);
                    let _ = events.send(close_event(kind, peer.clone(), channel.clone()));
                }
            }

            _ => {}
        }
        Box::pin(async {})
    }));
}

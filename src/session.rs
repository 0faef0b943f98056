//! Сессия: своя идентичность, таблица соединений, чат.
//!
//! Жизненный цикл: `new` → `bootstrap` → события транспорта (`pump`/`run`)
//! и вызовы API → `dispose`. Всё выполняется в одном логическом потоке:
//! событие обрабатывается целиком до следующего.

use crate::config::MeshConfig;
use crate::error::{BootstrapError, MeshError};
use crate::logger;
use crate::media::{MediaStream, TrackKind};
use crate::peer::introduction::{introduction_targets, should_connect};
use crate::peer::message::{self, ChatPayload, Inbound, PeerMessage};
use crate::peer::notify::{snapshot, MeshChange, Notifier, PeerSnapshot};
use crate::peer::state::{ConnectionTable, Removal};
use crate::peer::types::{ChannelId, ChatLogEntry, Identity};
use crate::signaling::{DataLink, EventReceiver, MediaLink, SignalingTransport, TransportEvent};
use crate::utils::{iso8601, parse_iso8601};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub struct Session<T: SignalingTransport> {
    config: MeshConfig,
    transport: T,
    identity: Option<Identity>,
    events: Option<EventReceiver>,
    local_stream: MediaStream,
    table: ConnectionTable,
    chat: Vec<ChatLogEntry>,
    notifier: Notifier,
}

impl<T: SignalingTransport> Session<T> {
    pub fn new(config: MeshConfig, transport: T, local_stream: MediaStream) -> Self {
        let notifier = Notifier::new(config.change_buffer);
        Self {
            config,
            transport,
            identity: None,
            events: None,
            local_stream,
            table: ConnectionTable::new(),
            chat: Vec::new(),
            notifier,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.identity.as_ref().is_some_and(|id| id.is_leader)
    }

    pub fn display_name(&self) -> &str {
        &self.config.display_name
    }

    /// Только чтение; все изменения идут через события и API сессии
    pub fn connections(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        snapshot(&self.table)
    }

    pub fn chat_log(&self) -> &[ChatLogEntry] {
        &self.chat
    }

    pub fn local_stream(&self) -> &MediaStream {
        &self.local_stream
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshChange> {
        self.notifier.subscribe()
    }

    /// Заданный id делает сессию лидером (точка встречи), без него id
    /// генерирует транспорт. Ошибка фатальна, повторов нет.
    pub async fn bootstrap(&mut self, requested: Option<&str>) -> Result<Identity, BootstrapError> {
        if let Some(identity) = &self.identity {
            return Err(BootstrapError::AlreadyBootstrapped(identity.self_peer_id.clone()));
        }

        let is_leader = requested.is_some();
        let opened = match self.transport.open(requested).await {
            Ok(opened) => opened,
            Err(e) => {
                error!(requested, error = %e, "bootstrap failed");
                return Err(e.into());
            }
        };

        let identity = Identity {
            self_peer_id: opened.peer_id,
            is_leader,
        };
        info!(peer_id = %identity.self_peer_id, is_leader, "peer open");

        self.events = Some(opened.events);
        self.identity = Some(identity.clone());
        self.notifier.emit(MeshChange::Ready(identity.self_peer_id.clone()));
        Ok(identity)
    }

    /// Вход по конфигу: лидер занимает `rendezvous_id`, остальные берут
    /// случайный id и подключаются к лидеру.
    pub async fn start(&mut self, lead: bool) -> Result<Identity, BootstrapError> {
        logger::init(&self.config.log_filter);
        let rendezvous = self.config.rendezvous_id.clone();
        if lead {
            let Some(id) = rendezvous else {
                return Err(BootstrapError::MissingRendezvous);
            };
            return self.bootstrap(Some(&id)).await;
        }

        let identity = self.bootstrap(None).await?;
        match rendezvous {
            Some(leader) => self.connect(&leader).await,
            None => warn!("no rendezvous id configured, waiting for inbound connections"),
        }
        Ok(identity)
    }

    fn require_identity(&self) -> Result<&Identity, MeshError> {
        self.identity
            .as_ref()
            .ok_or(MeshError::OperationOnUninitializedSession)
    }

    /// Исходящие data + media к пиру. До bootstrap только предупреждение.
    pub async fn connect(&mut self, peer: &str) {
        let self_id = match self.require_identity() {
            Ok(identity) => identity.self_peer_id.clone(),
            Err(e) => {
                warn!(peer, error = %e, "connect ignored");
                return;
            }
        };
        if peer == self_id {
            debug!(peer, "refusing to connect to self");
            return;
        }

        match self.transport.connect(peer).await {
            Ok(link) => self.track_data(link),
            Err(e) => warn!(peer, error = %e, "data connect failed"),
        }

        match self.transport.call(peer, &self.local_stream).await {
            Ok(link) => self.track_media(link),
            Err(e) => warn!(peer, error = %e, "call failed"),
        }
    }

    /// Локальное эхо сразу, затем отправка всем с открытым data-каналом.
    /// Возвращает число пиров, которым ушло сообщение.
    pub async fn broadcast_message(&mut self, text: &str) -> usize {
        let self_id = match self.require_identity() {
            Ok(identity) => identity.self_peer_id.clone(),
            Err(e) => {
                warn!(error = %e, "broadcast ignored");
                return 0;
            }
        };

        let now = Utc::now();
        let date = iso8601(now);
        let entry = ChatLogEntry {
            sender_name: self.config.display_name.clone(),
            sender_peer_id: self_id,
            timestamp: parse_iso8601(&date).unwrap_or(now),
            text: text.to_string(),
        };
        let msg = PeerMessage::ChatMessage(ChatPayload {
            name: self.config.display_name.clone(),
            date,
            text: text.to_string(),
        });

        self.push_chat(entry);

        let Some(payload) = encode(&msg) else {
            return 0;
        };
        let mut sent = 0;
        for link in self.table.open_data_links() {
            if send_payload(link.as_ref(), payload.clone()).await {
                sent += 1;
            }
        }
        sent
    }

    /// Меняет видеодорожку на всех открытых media-соединениях, аудио не
    /// трогает. Возвращает число соединений, где замена прошла.
    pub async fn replace_outgoing_stream(&mut self, stream: MediaStream) -> usize {
        let Some(video) = stream.video_track() else {
            warn!(stream = stream.id(), "replacement stream has no video track");
            return 0;
        };

        let mut swapped = 0;
        for link in self.table.open_media_links() {
            let mut video_sender = None;
            for sender in link.senders().await {
                if sender.kind().await == Some(TrackKind::Video) {
                    video_sender = Some(sender);
                    break;
                }
            }

            let Some(sender) = video_sender else {
                debug!(peer = link.peer(), "no video sender, leaving connection as is");
                continue;
            };
            match sender.replace_track(video.clone()).await {
                Ok(()) => swapped += 1,
                Err(e) => warn!(peer = link.peer(), error = %e, "video track swap failed"),
            }
        }

        info!(stream = stream.id(), swapped, "outgoing video replaced");
        self.local_stream = stream;
        swapped
    }

    /// Обрабатывает все уже пришедшие события. Не ждёт новых.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let Some(rx) = self.events.as_mut() else {
                break;
            };
            let Ok(event) = rx.try_recv() else {
                break;
            };
            handled += 1;
            if !self.handle_event(event).await {
                break;
            }
        }
        handled
    }

    /// Цикл событий до закрытия транспорта
    pub async fn run(&mut self) {
        loop {
            let Some(rx) = self.events.as_mut() else {
                warn!(error = %MeshError::OperationOnUninitializedSession, "run ignored");
                return;
            };
            let Some(event) = rx.recv().await else {
                info!("transport event stream ended");
                return;
            };
            if !self.handle_event(event).await {
                return;
            }
        }
    }

    /// Единственная точка разбора событий транспорта.
    /// false: транспорт закрыт, дальше событий не будет.
    pub async fn handle_event(&mut self, event: TransportEvent) -> bool {
        debug!(?event, "transport event");
        match event {
            TransportEvent::Connection(link) => self.track_data(link),
            TransportEvent::Call(link) => self.answer_call(link).await,
            TransportEvent::DataOpen { peer, channel } => self.on_data_open(&peer, &channel).await,
            TransportEvent::Data { peer, payload, .. } => self.on_data(&peer, &payload).await,
            TransportEvent::DataClosed { peer, channel } => self.on_data_closed(&peer, &channel).await,
            TransportEvent::Stream {
                peer,
                channel,
                stream,
            } => self.on_stream(&peer, &channel, stream),
            TransportEvent::MediaClosed { peer, channel } => {
                self.on_media_closed(&peer, &channel).await
            }
            TransportEvent::Disconnected => info!("signaling server disconnected"),
            TransportEvent::Closed => {
                info!("signaling transport closed");
                return false;
            }
            TransportEvent::Error(msg) => warn!(%msg, "transport error"),
        }
        true
    }

    fn track_data(&mut self, link: Arc<dyn DataLink>) {
        let peer = link.peer().to_string();
        if self.table.upsert_data(link) {
            self.on_new_peer(&peer);
        }
    }

    fn track_media(&mut self, link: Arc<dyn MediaLink>) {
        let peer = link.peer().to_string();
        if self.table.upsert_media(link) {
            self.on_new_peer(&peer);
        }
    }

    fn on_new_peer(&mut self, peer: &str) {
        debug!(peer, "new peer");
        if self.is_leader() {
            // анонс уйдёт, когда откроется data-канал
            self.table.arm_announcement(peer);
        }
        self.notifier.emit(MeshChange::PeerJoined(peer.to_string()));
    }

    async fn answer_call(&mut self, link: Arc<dyn MediaLink>) {
        if let Err(e) = link.answer(&self.local_stream).await {
            warn!(peer = link.peer(), channel = %link.id(), error = %e, "failed to answer call");
            link.close().await;
            return;
        }
        self.track_media(link);
    }

    async fn on_data_open(&mut self, peer: &str, channel: &ChannelId) {
        let current = self
            .table
            .get(peer)
            .and_then(|record| record.data())
            .filter(|link| link.id() == channel)
            .cloned();
        let Some(link) = current else {
            debug!(peer, %channel, "open on superseded data channel");
            return;
        };

        let info = PeerMessage::UserInfo {
            name: self.config.display_name.clone(),
        };
        if let Some(payload) = encode(&info) {
            send_payload(link.as_ref(), payload).await;
        }

        if self.is_leader() && self.table.take_announcement(peer) {
            self.introduce(peer).await;
        }
    }

    async fn introduce(&mut self, new_peer: &str) {
        let targets = introduction_targets(&self.table, new_peer);
        let msg = PeerMessage::NewUser {
            peer_id: new_peer.to_string(),
        };
        if let Some(payload) = encode(&msg) {
            for link in &targets {
                send_payload(link.as_ref(), payload.clone()).await;
            }
        }
        info!(peer = new_peer, targets = targets.len(), "introduced new peer");
        if self.table.mark_introduced(new_peer) {
            self.notifier
                .emit(MeshChange::PeerIntroduced(new_peer.to_string()));
        }
    }

    async fn on_data(&mut self, from: &str, payload: &[u8]) {
        match message::decode(payload) {
            Ok(Inbound::Known(msg)) => self.route(from, msg).await,
            Ok(Inbound::Unrecognized(kind)) => {
                warn!(peer = from, error = %MeshError::UnrecognizedMessageKind(kind), "message ignored");
            }
            Err(e) => {
                warn!(peer = from, error = %MeshError::from(e), "message dropped");
            }
        }
    }

    async fn route(&mut self, from: &str, msg: PeerMessage) {
        debug!(peer = from, kind = msg.kind(), "message");
        match msg {
            PeerMessage::NewUser { peer_id } => self.on_introduction(from, &peer_id).await,
            PeerMessage::UserInfo { name } => {
                if self.table.set_display_name(from, &name) {
                    self.notifier.emit(MeshChange::PeerNamed {
                        peer: from.to_string(),
                        name,
                    });
                } else {
                    debug!(peer = from, "user-info for unknown peer or empty name");
                }
            }
            PeerMessage::ChatMessage(payload) => self.append_chat(from, payload),
        }
    }

    async fn on_introduction(&mut self, introducer: &str, peer: &str) {
        let self_id = match self.require_identity() {
            Ok(identity) => identity.self_peer_id.clone(),
            Err(_) => return,
        };
        if !should_connect(&self.table, &self_id, peer) {
            debug!(introducer, peer, "introduction for known peer");
            return;
        }

        info!(introducer, peer, "introduced to new peer, connecting");
        self.connect(peer).await;
        if self.table.mark_introduced(peer) {
            self.notifier.emit(MeshChange::PeerIntroduced(peer.to_string()));
        }
    }

    fn append_chat(&mut self, from: &str, payload: ChatPayload) {
        let timestamp = parse_iso8601(&payload.date).unwrap_or_else(|| {
            warn!(peer = from, date = %payload.date, "unparsable chat date, using receive time");
            Utc::now()
        });
        self.push_chat(ChatLogEntry {
            sender_name: payload.name,
            sender_peer_id: from.to_string(),
            timestamp,
            text: payload.text,
        });
    }

    fn push_chat(&mut self, entry: ChatLogEntry) {
        self.chat.push(entry.clone());
        self.notifier.emit(MeshChange::ChatAppended(entry));
    }

    async fn on_data_closed(&mut self, peer: &str, channel: &ChannelId) {
        match self.table.remove_data(peer, channel) {
            Removal::Stale => {
                let race = MeshError::StaleHandleRace {
                    peer: peer.to_string(),
                    channel: channel.to_string(),
                };
                debug!(error = %race, "close ignored");
            }
            Removal::Cleared(link) => {
                link.close().await;
                debug!(peer, %channel, "data channel closed, media still up");
            }
            Removal::Deleted(link) => {
                link.close().await;
                info!(peer, "peer left");
                self.notifier.emit(MeshChange::PeerLeft(peer.to_string()));
            }
        }
    }

    fn on_stream(&mut self, peer: &str, channel: &ChannelId, stream: MediaStream) {
        if self.table.attach_stream(peer, channel, stream.clone()) {
            debug!(peer, %channel, stream = stream.id(), "remote stream attached");
            self.notifier.emit(MeshChange::StreamAttached(peer.to_string()));
        } else {
            debug!(peer, %channel, "stream for superseded media channel dropped");
            stream.stop();
        }
    }

    async fn on_media_closed(&mut self, peer: &str, channel: &ChannelId) {
        let had_stream = self.table.get(peer).is_some_and(|record| {
            record.stream().is_some() && record.media().is_some_and(|m| m.id() == channel)
        });

        let removal = self.table.remove_media(peer, channel);
        let deleted = removal.record_deleted();
        let Some(link) = removal.into_handle() else {
            let race = MeshError::StaleHandleRace {
                peer: peer.to_string(),
                channel: channel.to_string(),
            };
            debug!(error = %race, "close ignored");
            return;
        };

        link.close().await;
        if had_stream {
            self.notifier.emit(MeshChange::StreamReleased(peer.to_string()));
        }
        if deleted {
            info!(peer, "peer left");
            self.notifier.emit(MeshChange::PeerLeft(peer.to_string()));
        }
    }

    /// Закрывает все каналы и освобождает все потоки, включая локальный
    pub async fn dispose(mut self) {
        for record in self.table.drain() {
            let (peer, data, media, stream) = record.into_parts();
            if let Some(link) = data {
                link.close().await;
            }
            if let Some(link) = media {
                link.close().await;
            }
            if let Some(stream) = stream {
                stream.stop();
            }
            self.notifier.emit(MeshChange::PeerLeft(peer));
        }
        self.local_stream.stop();
        info!(
            peer_id = self.identity.as_ref().map(|i| i.self_peer_id.as_str()),
            "session disposed"
        );
    }
}

fn encode(msg: &PeerMessage) -> Option<Bytes> {
    match msg.encode() {
        Ok(payload) => Some(payload),
        Err(e) => {
            error!(kind = msg.kind(), error = %e, "failed to encode message");
            None
        }
    }
}

/// Без очереди и повторов: закрытый канал просто пропускается
async fn send_payload(link: &dyn DataLink, payload: Bytes) -> bool {
    match link.send(payload).await {
        Ok(()) => true,
        Err(e) => {
            warn!(peer = link.peer(), channel = %link.id(), error = %e, "send failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::loopback::{LoopbackCamera, LoopbackHub, LoopbackTrack, LoopbackTransport};
    use crate::media::{capture_local_stream, MediaConstraints, MediaTrack};
    use crate::signaling::TrackSender;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast::error::TryRecvError;

    async fn session(hub: &LoopbackHub, name: &str) -> Session<LoopbackTransport> {
        let camera = LoopbackCamera::new(name);
        let stream = capture_local_stream(&camera, &MediaConstraints::default())
            .await
            .unwrap();
        Session::new(
            MeshConfig::default().with_display_name(name),
            hub.transport(),
            stream,
        )
    }

    #[tokio::test]
    async fn operations_before_bootstrap_are_noops() {
        let hub = LoopbackHub::new();
        let mut s = session(&hub, "A").await;
        assert_eq!(s.broadcast_message("hi").await, 0);
        s.connect("anyone").await;
        assert!(s.chat_log().is_empty());
        assert!(s.connections().is_empty());
        assert_eq!(s.pump().await, 0);
    }

    #[tokio::test]
    async fn explicit_id_makes_leader_generated_id_does_not() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, "A").await;
        let mut b = session(&hub, "B").await;

        let leader = a.bootstrap(Some("room1")).await.unwrap();
        assert_eq!(leader.self_peer_id, "room1");
        assert!(leader.is_leader);

        let follower = b.bootstrap(None).await.unwrap();
        assert!(!follower.is_leader);
        assert_ne!(follower.self_peer_id, "room1");
    }

    #[tokio::test]
    async fn taken_id_is_a_bootstrap_error() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, "A").await;
        let mut b = session(&hub, "B").await;
        a.bootstrap(Some("room1")).await.unwrap();

        let err = b.bootstrap(Some("room1")).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Transport(_)));
        assert!(b.identity().is_none());
    }

    #[tokio::test]
    async fn second_bootstrap_is_rejected() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, "A").await;
        a.bootstrap(None).await.unwrap();
        assert!(matches!(
            a.bootstrap(None).await,
            Err(BootstrapError::AlreadyBootstrapped(_))
        ));
    }

    #[tokio::test]
    async fn connect_to_self_is_ignored() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, "A").await;
        a.bootstrap(Some("room1")).await.unwrap();
        a.connect("room1").await;
        assert!(a.connections().is_empty());
    }

    #[tokio::test]
    async fn connect_to_missing_peer_leaves_table_empty() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, "A").await;
        a.bootstrap(None).await.unwrap();
        a.connect("nobody").await;
        assert!(a.connections().is_empty());
    }

    #[tokio::test]
    async fn broadcast_with_no_peers_still_echoes_locally() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, "A").await;
        let mut changes = a.subscribe();
        a.bootstrap(Some("room1")).await.unwrap();

        assert_eq!(a.broadcast_message("alone").await, 0);
        assert_eq!(a.chat_log().len(), 1);
        assert_eq!(a.chat_log()[0].sender_name, "A");
        assert_eq!(a.chat_log()[0].sender_peer_id, "room1");

        assert_eq!(changes.recv().await.unwrap(), MeshChange::Ready("room1".into()));
        assert!(matches!(changes.recv().await.unwrap(), MeshChange::ChatAppended(_)));
    }

    #[tokio::test]
    async fn closed_event_stops_the_pump() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, "A").await;
        a.bootstrap(None).await.unwrap();
        assert!(!a.handle_event(TransportEvent::Closed).await);
        assert!(a.handle_event(TransportEvent::Disconnected).await);
        assert!(a.handle_event(TransportEvent::Error("boom".into())).await);
    }

    #[tokio::test]
    async fn start_as_leader_needs_rendezvous_id() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, "A").await;
        assert!(matches!(
            a.start(true).await,
            Err(BootstrapError::MissingRendezvous)
        ));
        assert!(a.identity().is_none());
        // subscriber уже поставлен (или логирование выключено сборкой)
        assert!(!logger::init("debug"));
    }

    async fn settle(a: &mut Session<LoopbackTransport>, b: &mut Session<LoopbackTransport>) {
        while a.pump().await + b.pump().await > 0 {}
    }

    /// Звонок, который не удаётся принять
    struct RefusedCall {
        id: ChannelId,
        closed: AtomicBool,
    }

    #[async_trait]
    impl MediaLink for RefusedCall {
        fn peer(&self) -> &str {
            "caller"
        }

        fn id(&self) -> &ChannelId {
            &self.id
        }

        fn is_open(&self) -> bool {
            false
        }

        async fn answer(&self, _stream: &MediaStream) -> Result<(), TransportError> {
            Err(TransportError::ChannelClosed(self.id.to_string()))
        }

        async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
            Vec::new()
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn failed_answer_closes_the_call() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, "A").await;
        a.bootstrap(None).await.unwrap();

        let call = Arc::new(RefusedCall {
            id: ChannelId::new("mc_1"),
            closed: AtomicBool::new(false),
        });
        assert!(a.handle_event(TransportEvent::Call(call.clone() as Arc<dyn MediaLink>)).await);
        assert!(call.closed.load(Ordering::SeqCst));
        assert!(a.connections().is_empty());
    }

    #[tokio::test]
    async fn events_for_superseded_channels_change_nothing() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, "A").await;
        let mut b = session(&hub, "B").await;
        a.bootstrap(Some("room1")).await.unwrap();
        let b_id = b.bootstrap(None).await.unwrap().self_peer_id;
        b.connect("room1").await;
        settle(&mut a, &mut b).await;

        let before = a.peers();
        assert_eq!(before.len(), 1);
        assert!(before[0].has_stream);
        let mut changes = a.subscribe();

        let late = LoopbackTrack::new("late-video", TrackKind::Video);
        let stream = MediaStream::new("late", vec![late.clone() as Arc<dyn MediaTrack>]);
        a.handle_event(TransportEvent::Stream {
            peer: b_id.clone(),
            channel: ChannelId::new("mc_old"),
            stream,
        })
        .await;
        assert!(!late.is_live());

        a.handle_event(TransportEvent::DataClosed {
            peer: b_id.clone(),
            channel: ChannelId::new("dc_old"),
        })
        .await;
        a.handle_event(TransportEvent::MediaClosed {
            peer: b_id,
            channel: ChannelId::new("mc_old"),
        })
        .await;

        assert_eq!(a.peers(), before);
        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
    }
}

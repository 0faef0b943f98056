//! Таблица соединений: одна запись на удалённый peer id.
//!
//! Запись существует, пока открыт хотя бы один из каналов (data или media).
//! Удаление канала сверяет id канала, чтобы запоздалое закрытие старого
//! канала не стёрло более новый.

use crate::media::MediaStream;
use crate::peer::types::{ChannelId, PeerId};
use crate::signaling::{DataLink, MediaLink};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub struct ConnectionRecord {
    peer_id: PeerId,
    display_name: Option<String>,
    data: Option<Arc<dyn DataLink>>,
    media: Option<Arc<dyn MediaLink>>,
    stream: Option<MediaStream>,
    introduced: bool,
    // лидер ещё должен представить этого пира остальным
    announce_pending: bool,
}

impl ConnectionRecord {
    fn new(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            display_name: None,
            data: None,
            media: None,
            stream: None,
            introduced: false,
            announce_pending: false,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn data(&self) -> Option<&Arc<dyn DataLink>> {
        self.data.as_ref()
    }

    pub fn media(&self) -> Option<&Arc<dyn MediaLink>> {
        self.media.as_ref()
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn is_introduced(&self) -> bool {
        self.introduced
    }

    pub fn announce_pending(&self) -> bool {
        self.announce_pending
    }

    pub fn data_open(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.is_open())
    }

    pub fn media_open(&self) -> bool {
        self.media.as_ref().is_some_and(|m| m.is_open())
    }

    fn is_empty(&self) -> bool {
        self.data.is_none() && self.media.is_none()
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("peer_id", &self.peer_id)
            .field("display_name", &self.display_name)
            .field("data", &self.data.as_ref().map(|d| d.id().clone()))
            .field("media", &self.media.as_ref().map(|m| m.id().clone()))
            .field("stream", &self.stream.as_ref().map(|s| s.id().to_string()))
            .field("introduced", &self.introduced)
            .finish()
    }
}

/// Итог удаления канала
pub enum Removal<H> {
    /// id не совпал с текущим каналом (или записи нет), ничего не тронуто
    Stale,
    /// Канал снят, запись жива благодаря второму каналу
    Cleared(H),
    /// Канал снят вместе со всей записью
    Deleted(H),
}

impl<H> Removal<H> {
    pub fn is_stale(&self) -> bool {
        matches!(self, Removal::Stale)
    }

    pub fn record_deleted(&self) -> bool {
        matches!(self, Removal::Deleted(_))
    }

    pub fn into_handle(self) -> Option<H> {
        match self {
            Removal::Stale => None,
            Removal::Cleared(h) | Removal::Deleted(h) => Some(h),
        }
    }
}

#[derive(Default)]
pub struct ConnectionTable {
    records: HashMap<PeerId, ConnectionRecord>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Возвращает true, если пир раньше был неизвестен
    pub fn upsert_data(&mut self, link: Arc<dyn DataLink>) -> bool {
        let peer = link.peer().to_string();
        let is_new_peer = !self.records.contains_key(&peer);
        let record = self
            .records
            .entry(peer)
            .or_insert_with_key(|peer| ConnectionRecord::new(peer));
        record.data = Some(link);
        is_new_peer
    }

    pub fn upsert_media(&mut self, link: Arc<dyn MediaLink>) -> bool {
        let peer = link.peer().to_string();
        let is_new_peer = !self.records.contains_key(&peer);
        let record = self
            .records
            .entry(peer)
            .or_insert_with_key(|peer| ConnectionRecord::new(peer));
        record.media = Some(link);
        is_new_peer
    }

    /// Поток принимается только от текущего media-канала
    pub fn attach_stream(&mut self, peer: &str, channel: &ChannelId, stream: MediaStream) -> bool {
        match self.records.get_mut(peer) {
            Some(record) if record.media.as_ref().is_some_and(|m| m.id() == channel) => {
                record.stream = Some(stream);
                true
            }
            _ => false,
        }
    }

    pub fn remove_data(&mut self, peer: &str, channel: &ChannelId) -> Removal<Arc<dyn DataLink>> {
        let Some(record) = self.records.get_mut(peer) else {
            return Removal::Stale;
        };
        if !record.data.as_ref().is_some_and(|d| d.id() == channel) {
            return Removal::Stale;
        }
        let Some(link) = record.data.take() else {
            return Removal::Stale;
        };
        if record.is_empty() {
            self.records.remove(peer);
            Removal::Deleted(link)
        } else {
            Removal::Cleared(link)
        }
    }

    /// Снимает media-канал и останавливает привязанный поток
    pub fn remove_media(&mut self, peer: &str, channel: &ChannelId) -> Removal<Arc<dyn MediaLink>> {
        let Some(record) = self.records.get_mut(peer) else {
            return Removal::Stale;
        };
        if !record.media.as_ref().is_some_and(|m| m.id() == channel) {
            return Removal::Stale;
        }
        let Some(link) = record.media.take() else {
            return Removal::Stale;
        };
        if let Some(stream) = record.stream.take() {
            stream.stop();
        }
        if record.is_empty() {
            self.records.remove(peer);
            Removal::Deleted(link)
        } else {
            Removal::Cleared(link)
        }
    }

    /// Первое известное имя не перезаписывается пустым
    pub fn set_display_name(&mut self, peer: &str, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        match self.records.get_mut(peer) {
            Some(record) => {
                record.display_name = Some(name.to_string());
                true
            }
            None => false,
        }
    }

    pub fn mark_introduced(&mut self, peer: &str) -> bool {
        match self.records.get_mut(peer) {
            Some(record) if !record.introduced => {
                record.introduced = true;
                true
            }
            _ => false,
        }
    }

    pub fn arm_announcement(&mut self, peer: &str) {
        if let Some(record) = self.records.get_mut(peer) {
            record.announce_pending = true;
        }
    }

    /// Снимает флаг анонса; true, если он был взведён
    pub fn take_announcement(&mut self, peer: &str) -> bool {
        self.records
            .get_mut(peer)
            .map(|record| std::mem::take(&mut record.announce_pending))
            .unwrap_or(false)
    }

    pub fn get(&self, peer: &str) -> Option<&ConnectionRecord> {
        self.records.get(peer)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.records.contains_key(peer)
    }

    pub fn all(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Открытые data-каналы на момент вызова
    pub fn open_data_links(&self) -> Vec<Arc<dyn DataLink>> {
        self.records
            .values()
            .filter_map(|r| r.data.as_ref())
            .filter(|d| d.is_open())
            .cloned()
            .collect()
    }

    pub fn open_media_links(&self) -> Vec<Arc<dyn MediaLink>> {
        self.records
            .values()
            .filter_map(|r| r.media.as_ref())
            .filter(|m| m.is_open())
            .cloned()
            .collect()
    }

    /// Забирает все записи (для dispose)
    pub fn drain(&mut self) -> Vec<ConnectionRecord> {
        self.records.drain().map(|(_, record)| record).collect()
    }
}

impl ConnectionRecord {
    pub fn into_parts(
        self,
    ) -> (
        PeerId,
        Option<Arc<dyn DataLink>>,
        Option<Arc<dyn MediaLink>>,
        Option<MediaStream>,
    ) {
        (self.peer_id, self.data, self.media, self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::loopback::LoopbackTrack;
    use crate::media::{MediaTrack, TrackKind};
    use crate::signaling::TrackSender;
    use async_trait::async_trait;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    struct FakeData {
        peer: String,
        id: ChannelId,
    }

    #[async_trait]
    impl DataLink for FakeData {
        fn peer(&self) -> &str {
            &self.peer
        }
        fn id(&self) -> &ChannelId {
            &self.id
        }
        fn is_open(&self) -> bool {
            true
        }
        async fn send(&self, _payload: Bytes) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    struct FakeMedia {
        peer: String,
        id: ChannelId,
    }

    #[async_trait]
    impl MediaLink for FakeMedia {
        fn peer(&self) -> &str {
            &self.peer
        }
        fn id(&self) -> &ChannelId {
            &self.id
        }
        fn is_open(&self) -> bool {
            true
        }
        async fn answer(&self, _stream: &MediaStream) -> Result<(), TransportError> {
            Ok(())
        }
        async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
            Vec::new()
        }
        async fn close(&self) {}
    }

    fn data(peer: &str, id: &str) -> Arc<dyn DataLink> {
        Arc::new(FakeData {
            peer: peer.into(),
            id: ChannelId::new(id),
        })
    }

    fn media(peer: &str, id: &str) -> Arc<dyn MediaLink> {
        Arc::new(FakeMedia {
            peer: peer.into(),
            id: ChannelId::new(id),
        })
    }

    fn stream_with_track(id: &str) -> (MediaStream, Arc<dyn MediaTrack>) {
        let track: Arc<dyn MediaTrack> = LoopbackTrack::new(id, TrackKind::Video);
        (MediaStream::new(id, vec![track.clone()]), track)
    }

    #[test]
    fn first_upsert_reports_new_peer_only_once() {
        let mut table = ConnectionTable::new();
        assert!(table.upsert_data(data("p", "dc_1")));
        assert!(!table.upsert_media(media("p", "mc_1")));
        assert!(!table.upsert_data(data("p", "dc_2")));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("p").unwrap().data().unwrap().id().as_str(), "dc_2");
    }

    #[test]
    fn closing_data_keeps_record_and_stream_while_media_is_open() {
        let mut table = ConnectionTable::new();
        table.upsert_data(data("p", "dc_1"));
        table.upsert_media(media("p", "mc_1"));
        let (stream, track) = stream_with_track("remote");
        assert!(table.attach_stream("p", &ChannelId::new("mc_1"), stream));

        let removal = table.remove_data("p", &ChannelId::new("dc_1"));
        assert!(matches!(removal, Removal::Cleared(_)));

        let record = table.get("p").unwrap();
        assert!(record.data().is_none());
        assert!(record.stream().is_some());
        assert!(track.is_live());
    }

    #[test]
    fn closing_media_stops_stream_and_keeps_data() {
        let mut table = ConnectionTable::new();
        table.upsert_data(data("p", "dc_1"));
        table.upsert_media(media("p", "mc_1"));
        let (stream, track) = stream_with_track("remote");
        table.attach_stream("p", &ChannelId::new("mc_1"), stream);

        let removal = table.remove_media("p", &ChannelId::new("mc_1"));
        assert!(matches!(removal, Removal::Cleared(_)));
        assert!(!track.is_live());

        let record = table.get("p").unwrap();
        assert!(record.media().is_none());
        assert!(record.stream().is_none());
        assert!(record.data().is_some());
    }

    #[test]
    fn removing_the_last_channel_deletes_the_record() {
        let mut table = ConnectionTable::new();
        table.upsert_data(data("p", "dc_1"));
        table.upsert_media(media("p", "mc_1"));
        assert!(!table.remove_media("p", &ChannelId::new("mc_1")).record_deleted());
        assert!(table.remove_data("p", &ChannelId::new("dc_1")).record_deleted());
        assert!(table.get("p").is_none());
    }

    #[test]
    fn stale_close_leaves_current_handle_alone() {
        let mut table = ConnectionTable::new();
        table.upsert_data(data("p", "dc_old"));
        table.upsert_data(data("p", "dc_new"));
        table.upsert_media(media("p", "mc_new"));

        assert!(table.remove_data("p", &ChannelId::new("dc_old")).is_stale());
        assert!(table.remove_media("p", &ChannelId::new("mc_old")).is_stale());
        assert!(table.remove_data("nobody", &ChannelId::new("dc_new")).is_stale());

        let record = table.get("p").unwrap();
        assert_eq!(record.data().unwrap().id().as_str(), "dc_new");
        assert_eq!(record.media().unwrap().id().as_str(), "mc_new");
    }

    #[test]
    fn stream_from_superseded_media_channel_is_rejected() {
        let mut table = ConnectionTable::new();
        table.upsert_media(media("p", "mc_2"));
        let (stream, _) = stream_with_track("late");
        assert!(!table.attach_stream("p", &ChannelId::new("mc_1"), stream.clone()));
        assert!(!table.attach_stream("ghost", &ChannelId::new("mc_2"), stream));
        assert!(table.get("p").unwrap().stream().is_none());
    }

    #[test]
    fn display_name_is_stored_as_received() {
        let mut table = ConnectionTable::new();
        assert!(!table.set_display_name("p", "alice"));
        table.upsert_data(data("p", "dc_1"));
        assert!(!table.set_display_name("p", ""));
        assert!(table.set_display_name("p", " alice "));
        assert_eq!(table.get("p").unwrap().display_name(), Some(" alice "));
    }

    #[test]
    fn announcement_flag_is_taken_once() {
        let mut table = ConnectionTable::new();
        table.upsert_data(data("p", "dc_1"));
        table.arm_announcement("p");
        assert!(table.take_announcement("p"));
        assert!(!table.take_announcement("p"));
    }

    // Запись есть ⇔ открыт data или media канал, на случайных последовательностях
    #[test]
    fn record_exists_iff_some_channel_is_open_under_random_sequences() {
        let peers = ["a", "b", "c"];
        for seed in 0..64u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut table = ConnectionTable::new();
            // модель: текущие id каналов
            let mut model: HashMap<&str, (Option<String>, Option<String>)> = HashMap::new();
            let mut issued: Vec<(&str, bool, String)> = Vec::new();

            for step in 0..200 {
                let peer = peers[rng.random_range(0..peers.len())];
                match rng.random_range(0..4) {
                    0 => {
                        let id = format!("dc_{seed}_{step}");
                        table.upsert_data(data(peer, &id));
                        model.entry(peer).or_default().0 = Some(id.clone());
                        issued.push((peer, true, id));
                    }
                    1 => {
                        let id = format!("mc_{seed}_{step}");
                        table.upsert_media(media(peer, &id));
                        model.entry(peer).or_default().1 = Some(id.clone());
                        issued.push((peer, false, id));
                    }
                    _ if !issued.is_empty() => {
                        let (peer, is_data, id) = issued[rng.random_range(0..issued.len())].clone();
                        let channel = ChannelId::new(id.clone());
                        let slot = model.entry(peer).or_default();
                        if is_data {
                            let removal = table.remove_data(peer, &channel);
                            let current = slot.0.as_deref() == Some(id.as_str());
                            assert_eq!(!removal.is_stale(), current);
                            if current {
                                slot.0 = None;
                            }
                        } else {
                            let removal = table.remove_media(peer, &channel);
                            let current = slot.1.as_deref() == Some(id.as_str());
                            assert_eq!(!removal.is_stale(), current);
                            if current {
                                slot.1 = None;
                            }
                        }
                    }
                    _ => {}
                }

                for peer in peers {
                    let expected = model
                        .get(peer)
                        .map(|(d, m)| d.is_some() || m.is_some())
                        .unwrap_or(false);
                    assert_eq!(table.contains(peer), expected, "seed {seed} step {step} peer {peer}");
                    if let Some(record) = table.get(peer) {
                        let (d, m) = &model[peer];
                        assert_eq!(record.data().map(|l| l.id().as_str().to_string()), *d);
                        assert_eq!(record.media().map(|l| l.id().as_str().to_string()), *m);
                    }
                }
            }
        }
    }
}

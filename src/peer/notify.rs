//! Уведомления наблюдателям (UI) и снимки состояния только для чтения

use crate::peer::introduction::{phase_of, IntroPhase};
use crate::peer::state::ConnectionTable;
use crate::peer::types::{ChatLogEntry, PeerId};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshChange {
    /// Bootstrap завершён
    Ready(PeerId),
    PeerJoined(PeerId),
    PeerNamed { peer: PeerId, name: String },
    PeerIntroduced(PeerId),
    PeerLeft(PeerId),
    StreamAttached(PeerId),
    StreamReleased(PeerId),
    ChatAppended(ChatLogEntry),
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub display_name: Option<String>,
    pub data_open: bool,
    pub media_open: bool,
    pub has_stream: bool,
    pub phase: IntroPhase,
}

pub fn snapshot(table: &ConnectionTable) -> Vec<PeerSnapshot> {
    let mut peers: Vec<_> = table
        .all()
        .map(|record| PeerSnapshot {
            peer_id: record.peer_id().to_string(),
            display_name: record.display_name().map(str::to_string),
            data_open: record.data_open(),
            media_open: record.media_open(),
            has_stream: record.stream().is_some(),
            phase: phase_of(table, record.peer_id()),
        })
        .collect();
    peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    peers
}

pub struct Notifier {
    tx: broadcast::Sender<MeshChange>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshChange> {
        self.tx.subscribe()
    }

    /// Без подписчиков событие просто теряется
    pub fn emit(&self, change: MeshChange) {
        trace!(?change, "emit");
        let _ = self.tx.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_silent() {
        let notifier = Notifier::new(4);
        notifier.emit(MeshChange::PeerJoined("p".into()));
    }

    #[tokio::test]
    async fn subscribers_see_changes_in_order() {
        let notifier = Notifier::new(4);
        let mut rx = notifier.subscribe();
        notifier.emit(MeshChange::PeerJoined("p".into()));
        notifier.emit(MeshChange::PeerLeft("p".into()));
        assert_eq!(rx.recv().await.unwrap(), MeshChange::PeerJoined("p".into()));
        assert_eq!(rx.recv().await.unwrap(), MeshChange::PeerLeft("p".into()));
    }

    #[test]
    fn empty_table_has_empty_snapshot() {
        assert!(snapshot(&ConnectionTable::new()).is_empty());
    }
}

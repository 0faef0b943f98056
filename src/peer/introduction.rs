//! Протокол представления: лидер сообщает уже знакомым пирам о новом,
//! каждый получатель `new-user` сам подключается к новичку. Так N пиров
//! сходятся в полную сетку.
//!
//! Перевыборов лидера нет: если лидер ушёл, новые пиры больше не
//! представляются, существующие рёбра остаются.

use crate::peer::state::ConnectionTable;
use crate::signaling::DataLink;
use serde::Serialize;
use std::sync::Arc;

/// Фаза удалённого пира с точки зрения локальной сессии
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum IntroPhase {
    Unknown,
    Connecting,
    NameExchanged,
    Introduced,
}

pub fn phase_of(table: &ConnectionTable, peer: &str) -> IntroPhase {
    match table.get(peer) {
        None => IntroPhase::Unknown,
        Some(record) => match (record.display_name().is_some(), record.is_introduced()) {
            (true, true) => IntroPhase::Introduced,
            (true, false) => IntroPhase::NameExchanged,
            _ => IntroPhase::Connecting,
        },
    }
}

/// Кому лидер шлёт `new-user{new_peer}`: всем остальным с известным
/// именем и открытым data-каналом. Пиры посреди рукопожатия пропускаются.
pub fn introduction_targets(table: &ConnectionTable, new_peer: &str) -> Vec<Arc<dyn DataLink>> {
    let mut targets: Vec<_> = table
        .all()
        .filter(|record| record.peer_id() != new_peer)
        .filter(|record| record.display_name().is_some())
        .filter_map(|record| record.data())
        .filter(|link| link.is_open())
        .cloned()
        .collect();
    targets.sort_by(|a, b| a.peer().cmp(b.peer()));
    targets
}

/// Подключаться ли в ответ на `new-user{peer}`
pub fn should_connect(table: &ConnectionTable, self_id: &str, peer: &str) -> bool {
    !peer.is_empty() && peer != self_id && !table.contains(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::peer::types::ChannelId;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct Link {
        peer: String,
        id: ChannelId,
        open: bool,
    }

    #[async_trait]
    impl DataLink for Link {
        fn peer(&self) -> &str {
            &self.peer
        }
        fn id(&self) -> &ChannelId {
            &self.id
        }
        fn is_open(&self) -> bool {
            self.open
        }
        async fn send(&self, _payload: Bytes) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn add(table: &mut ConnectionTable, peer: &str, open: bool, name: Option<&str>) {
        table.upsert_data(Arc::new(Link {
            peer: peer.into(),
            id: ChannelId::generate("dc"),
            open,
        }));
        if let Some(name) = name {
            table.set_display_name(peer, name);
        }
    }

    #[test]
    fn only_named_open_peers_other_than_newcomer_are_targets() {
        let mut table = ConnectionTable::new();
        add(&mut table, "named", true, Some("Named"));
        add(&mut table, "handshaking", true, None);
        add(&mut table, "closed", false, Some("Closed"));
        add(&mut table, "new", true, Some("New"));

        let targets: Vec<_> = introduction_targets(&table, "new")
            .iter()
            .map(|l| l.peer().to_string())
            .collect();
        assert_eq!(targets, vec!["named".to_string()]);
    }

    #[test]
    fn phases_follow_name_exchange_and_introduction() {
        let mut table = ConnectionTable::new();
        assert_eq!(phase_of(&table, "p"), IntroPhase::Unknown);
        add(&mut table, "p", true, None);
        assert_eq!(phase_of(&table, "p"), IntroPhase::Connecting);
        table.set_display_name("p", "P");
        assert_eq!(phase_of(&table, "p"), IntroPhase::NameExchanged);
        table.mark_introduced("p");
        assert_eq!(phase_of(&table, "p"), IntroPhase::Introduced);
    }

    #[test]
    fn known_or_self_peers_are_not_reconnected() {
        let mut table = ConnectionTable::new();
        add(&mut table, "known", true, None);
        assert!(!should_connect(&table, "me", "known"));
        assert!(!should_connect(&table, "me", "me"));
        assert!(!should_connect(&table, "me", ""));
        assert!(should_connect(&table, "me", "fresh"));
    }
}

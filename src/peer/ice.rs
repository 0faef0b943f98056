use crate::error::TransportError;
use crate::peer::types::{ChannelId, IceCandidate};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::RTCPeerConnection;

/// Сколько каналов без соединения могут ждать своего offer
pub const MAX_WAITING_CHANNELS: usize = 32;
/// Сколько закрытых каналов помним, чтобы отбрасывать их поздние кандидаты
const RETIRED_LIMIT: usize = 256;

/// Кандидаты, полученные до установки remote description, по каналам
#[derive(Default, Debug)]
pub struct PendingCandidates {
    by_channel: HashMap<ChannelId, Vec<IceCandidate>>,
    order: VecDeque<ChannelId>,
    retired: VecDeque<ChannelId>,
}

impl PendingCandidates {
    /// false: канал уже закрыт, кандидат отброшен
    pub fn queue(&mut self, candidate: IceCandidate) -> bool {
        if self.retired.contains(&candidate.channel) {
            debug!(channel = %candidate.channel, "candidate for closed channel dropped");
            return false;
        }
        debug!(channel = %candidate.channel, "remote description not set yet, queuing candidate");

        let channel = candidate.channel.clone();
        let queued = self.by_channel.entry(channel.clone()).or_default();
        if queued.is_empty() {
            self.order.push_back(channel);
        }
        queued.push(candidate);

        while self.by_channel.len() > MAX_WAITING_CHANNELS {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(dropped) = self.by_channel.remove(&oldest) {
                warn!(channel = %oldest, count = dropped.len(), "too many channels waiting, dropping oldest candidates");
            }
        }
        true
    }

    pub fn take(&mut self, channel: &ChannelId) -> Vec<IceCandidate> {
        match self.by_channel.remove(channel) {
            Some(queued) => {
                self.order.retain(|c| c != channel);
                queued
            }
            None => Vec::new(),
        }
    }

    /// Канал закрыт: очередь сбрасывается, поздние кандидаты больше не копятся
    pub fn forget(&mut self, channel: &ChannelId) {
        self.take(channel);
        if !self.retired.contains(channel) {
            self.retired.push_back(channel.clone());
            if self.retired.len() > RETIRED_LIMIT {
                self.retired.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_channel.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn candidate_from_rtc(cand: &RTCIceCandidate, channel: &ChannelId) -> Option<IceCandidate> {
    match cand.to_json() {
        Ok(init) => Some(IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            channel: channel.clone(),
        }),
        Err(e) => {
            warn!(%channel, error = %e, "failed to serialize local candidate");
            None
        }
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

/// Применяет ICE кандидат от удалённой стороны
pub async fn add_remote_candidate(
    pc: &RTCPeerConnection,
    candidate: IceCandidate,
) -> Result<(), TransportError> {
    let channel = candidate.channel.clone();
    pc.add_ice_candidate(to_init(candidate)).await?;
    debug!(%channel, "added remote ICE candidate");
    Ok(())
}

/// Применяет все отложенные кандидаты после установки remote description
pub async fn apply_pending_candidates(pc: &RTCPeerConnection, candidates: Vec<IceCandidate>) {
    for candidate in candidates {
        let channel = candidate.channel.clone();
        if let Err(e) = add_remote_candidate(pc, candidate).await {
            warn!(%channel, error = %e, "failed to apply pending candidate");
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    debug!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "candidate analysis"
    );
    if summary.relay == 0 && summary.srflx == 0 {
        warn!("no srflx or relay candidates, connection through NAT may fail");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(channel: &str, line: &str) -> IceCandidate {
        IceCandidate {
            candidate: line.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            channel: ChannelId::new(channel),
        }
    }

    #[test]
    fn pending_candidates_are_kept_per_channel() {
        let mut pending = PendingCandidates::default();
        pending.queue(cand("dc_1", "candidate:1 1 udp 1 10.0.0.1 5000 typ host"));
        pending.queue(cand("dc_1", "candidate:2 1 udp 1 1.2.3.4 5001 typ srflx"));
        pending.queue(cand("mc_1", "candidate:3 1 udp 1 5.6.7.8 5002 typ relay"));
        assert_eq!(pending.len(), 3);

        assert_eq!(pending.take(&ChannelId::new("dc_1")).len(), 2);
        assert!(pending.take(&ChannelId::new("dc_1")).is_empty());

        pending.forget(&ChannelId::new("mc_1"));
        assert!(pending.is_empty());
    }

    #[test]
    fn closed_channel_drops_late_candidates() {
        let mut pending = PendingCandidates::default();
        let channel = ChannelId::new("dc_1");
        pending.queue(cand("dc_1", "candidate:1 1 udp 1 10.0.0.1 5000 typ host"));
        pending.forget(&channel);

        assert!(!pending.queue(cand("dc_1", "candidate:2 1 udp 1 10.0.0.1 5001 typ host")));
        assert!(pending.is_empty());
    }

    #[test]
    fn waiting_channels_are_bounded() {
        let mut pending = PendingCandidates::default();
        for i in 0..50 {
            pending.queue(cand(&format!("dc_gone_{i}"), "candidate:1 1 udp 1 10.0.0.1 5000 typ host"));
        }
        assert_eq!(pending.len(), MAX_WAITING_CHANNELS);
        // вытесняются самые старые
        assert!(pending.take(&ChannelId::new("dc_gone_0")).is_empty());
        assert_eq!(pending.take(&ChannelId::new("dc_gone_49")).len(), 1);
    }

    #[test]
    fn summary_counts_candidate_types() {
        let summary = analyze_candidates(&[
            cand("dc", "candidate:1 1 udp 1 10.0.0.1 5000 typ host"),
            cand("dc", "candidate:2 1 udp 1 10.0.0.2 5000 typ host"),
            cand("dc", "candidate:3 1 udp 1 1.2.3.4 5001 typ srflx raddr 0.0.0.0"),
            cand("dc", "candidate:4 1 udp 1 5.6.7.8 5002 typ relay raddr 0.0.0.0"),
        ]);
        assert_eq!(
            summary,
            CandidateSummary {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }
}

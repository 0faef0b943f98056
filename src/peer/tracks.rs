//! Дорожки и отправители webrtc-rs за трейтами MediaTrack / TrackSender

use crate::error::TransportError;
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::signaling::TrackSender;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub fn kind_of(codec: RTPCodecType) -> Option<TrackKind> {
    match codec {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

/// Локальная дорожка, которую можно отдать в RTCPeerConnection
pub struct RtcLocalTrack {
    track: Arc<dyn TrackLocal + Send + Sync>,
    id: String,
    kind: TrackKind,
    live: AtomicBool,
}

impl RtcLocalTrack {
    pub fn new(track: Arc<dyn TrackLocal + Send + Sync>) -> Option<Arc<Self>> {
        let kind = kind_of(track.kind())?;
        Some(Arc::new(Self {
            id: track.id().to_string(),
            track,
            kind,
            live: AtomicBool::new(true),
        }))
    }
}

impl MediaTrack for RtcLocalTrack {
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

    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(self.track.clone())
    }
}

/// Входящая дорожка удалённого пира
pub struct RtcRemoteTrack {
    track: Arc<TrackRemote>,
    id: String,
    kind: TrackKind,
    live: AtomicBool,
}

impl RtcRemoteTrack {
    pub fn new(track: Arc<TrackRemote>) -> Option<Arc<Self>> {
        let kind = kind_of(track.kind())?;
        Some(Arc::new(Self {
            id: track.id().to_string(),
            track,
            kind,
            live: AtomicBool::new(true),
        }))
    }

    pub fn remote(&self) -> &Arc<TrackRemote> {
        &self.track
    }
}

impl MediaTrack for RtcRemoteTrack {
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

pub struct RtcTrackSender {
    sender: Arc<RTCRtpSender>,
}

impl RtcTrackSender {
    pub fn new(sender: Arc<RTCRtpSender>) -> Arc<Self> {
        Arc::new(Self { sender })
    }
}

#[async_trait]
impl TrackSender for RtcTrackSender {
    async fn kind(&self) -> Option<TrackKind> {
        let track = self.sender.track().await?;
        kind_of(track.kind())
    }

    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), TransportError> {
        let rtc = track
            .rtc_track()
            .ok_or_else(|| TransportError::UnsupportedTrack(track.id().to_string()))?;
        self.sender.replace_track(Some(rtc)).await?;
        debug!(track = track.id(), "sender track replaced");
        Ok(())
    }
}

/// Добавляет в соединение все дорожки потока, которые умеет отправлять webrtc
pub async fn add_stream_tracks(
    pc: &RTCPeerConnection,
    stream: &MediaStream,
) -> Result<usize, TransportError> {
    let mut added = 0;
    for track in stream.tracks() {
        match track.rtc_track() {
            Some(rtc) => {
                pc.add_track(rtc).await?;
                added += 1;
            }
            None => warn!(track = track.id(), "track cannot be sent over webrtc, skipping"),
        }
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTrack;
    use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    fn sample_track(mime: &str, id: &str) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            "local".to_owned(),
        ))
    }

    #[test]
    fn local_track_keeps_kind_and_rtc_handle() {
        let video = RtcLocalTrack::new(sample_track(MIME_TYPE_VP8, "cam")).unwrap();
        assert_eq!(video.kind(), TrackKind::Video);
        assert_eq!(video.id(), "cam");
        assert!(video.rtc_track().is_some());

        let audio = RtcLocalTrack::new(sample_track(MIME_TYPE_OPUS, "mic")).unwrap();
        assert_eq!(audio.kind(), TrackKind::Audio);
        audio.stop();
        assert!(!audio.is_live());
    }

    #[test]
    fn unspecified_codec_has_no_kind() {
        assert_eq!(kind_of(RTPCodecType::Unspecified), None);
    }

    #[test]
    fn loopback_tracks_are_not_rtc_tracks() {
        let track: Arc<dyn MediaTrack> = LoopbackTrack::new("v", TrackKind::Video);
        assert!(track.rtc_track().is_none());
    }
}

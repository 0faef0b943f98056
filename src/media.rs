//! Локальные и удалённые медиапотоки, граница с провайдером захвата

use crate::error::MeshError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};
use webrtc::track::track_local::TrackLocal;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Одна аудио- или видеодорожка. `stop` освобождает железо (камера/микрофон).
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_live(&self) -> bool;
    fn stop(&self);

    /// Дорожка, которую умеет отправлять webrtc-транспорт
    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

/// Набор дорожек. Клон разделяет те же дорожки.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, Vec::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn video_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video).cloned()
    }

    pub fn audio_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio).cloned()
    }

    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return;
        }
        self.tracks.push(track);
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracks: Vec<_> = self.tracks.iter().map(|t| (t.id().to_string(), t.kind())).collect();
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &tracks)
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

/// Ограничения захвата
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MediaConstraints {
    pub facing_mode: FacingMode,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub echo_cancellation: bool,
    pub background_blur: bool,
    pub audio_frame_rate: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            facing_mode: FacingMode::User,
            width: 320,
            height: 240,
            frame_rate: 10,
            echo_cancellation: true,
            background_blur: true,
            audio_frame_rate: 5,
        }
    }
}

impl MediaConstraints {
    pub fn facing(mut self, mode: FacingMode) -> Self {
        self.facing_mode = mode;
        self
    }
}

/// Источник локального потока (камера, микрофон)
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// `None` означает отказ захвата, а не панику
    async fn capture_stream(&self, constraints: &MediaConstraints) -> Option<MediaStream>;
}

pub async fn capture_local_stream<P>(
    provider: &P,
    constraints: &MediaConstraints,
) -> Result<MediaStream, MeshError>
where
    P: MediaProvider + ?Sized,
{
    match provider.capture_stream(constraints).await {
        Some(stream) => {
            info!(
                stream = stream.id(),
                tracks = stream.tracks().len(),
                "captured local stream"
            );
            Ok(stream)
        }
        None => {
            error!(?constraints, "error accessing media devices");
            Err(MeshError::CaptureFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackCamera, LoopbackTrack};

    #[test]
    fn stop_releases_every_track() {
        let audio: Arc<dyn MediaTrack> = LoopbackTrack::new("a", TrackKind::Audio);
        let video: Arc<dyn MediaTrack> = LoopbackTrack::new("v", TrackKind::Video);
        let stream = MediaStream::new("s", vec![audio.clone(), video.clone()]);
        assert!(stream.is_live());
        stream.stop();
        assert!(!audio.is_live());
        assert!(!video.is_live());
    }

    #[test]
    fn add_track_skips_duplicates() {
        let mut stream = MediaStream::empty("s");
        let video = LoopbackTrack::new("v", TrackKind::Video);
        stream.add_track(video.clone());
        stream.add_track(video);
        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(stream.video_track().unwrap().id(), "v");
        assert!(stream.audio_track().is_none());
    }

    #[tokio::test]
    async fn missing_capture_is_an_error_not_a_panic() {
        let camera = LoopbackCamera::unavailable();
        let result = capture_local_stream(&camera, &MediaConstraints::default()).await;
        assert!(matches!(result, Err(MeshError::CaptureFailed)));
    }

    #[tokio::test]
    async fn capture_returns_audio_and_video() {
        let camera = LoopbackCamera::new("cam");
        let constraints = MediaConstraints::default().facing(FacingMode::Environment);
        let stream = capture_local_stream(&camera, &constraints).await.unwrap();
        assert!(stream.audio_track().is_some());
        assert!(stream.video_track().is_some());
    }
}

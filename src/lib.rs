//! Меш из пиров без центрального сервера: лидер знакомит новичков со всеми,
//! дальше каждый держит прямые data- и media-каналы с каждым.

pub mod config;
pub mod error;
pub mod logger;
pub mod loopback;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;
pub mod webrtc_peer;

pub use config::MeshConfig;
pub use error::{BootstrapError, ConfigError, MeshError, TransportError};
pub use media::{MediaConstraints, MediaProvider, MediaStream, MediaTrack, TrackKind};
pub use peer::{ChatLogEntry, Identity, MeshChange, PeerId, PeerSnapshot};
pub use session::Session;
pub use signaling::{DataLink, MediaLink, SignalingTransport, TransportEvent};
pub use webrtc_peer::{SignalFrame, SignalRelay, WebRtcTransport};

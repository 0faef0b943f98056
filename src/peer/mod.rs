pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod introduction;
pub mod message;
pub mod notify;
pub mod state;
pub mod tracks;
pub mod types;

pub use introduction::IntroPhase;
pub use message::{ChatPayload, Inbound, PeerMessage};
pub use notify::{MeshChange, PeerSnapshot};
pub use state::{ConnectionRecord, ConnectionTable, Removal};
pub use types::{ChannelId, ChatLogEntry, Identity, IceCandidate, LinkKind, PeerId, SdpPayload, ServerConfig};

use thiserror::Error;

/// Ошибки транспорта сигнализации и каналов
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer id `{0}` is already taken")]
    IdTaken(String),

    #[error("peer `{0}` is unavailable")]
    PeerUnavailable(String),

    #[error("channel `{0}` is closed")]
    ChannelClosed(String),

    #[error("transport is not open yet")]
    NotOpen,

    #[error("track `{0}` cannot be sent over this transport")]
    UnsupportedTrack(String),

    #[error("signaling relay failed: {0}")]
    Relay(String),

    #[error(transparent)]
    Rtc(#[from] webrtc::Error),
}

/// Не удалось получить собственный peer id. Фатально, повторов нет.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("session is already bootstrapped as `{0}`")]
    AlreadyBootstrapped(String),

    #[error("leader needs a rendezvous id")]
    MissingRendezvous,

    #[error("signaling transport refused to open: {0}")]
    Transport(#[from] TransportError),
}

/// Нефатальные ошибки сессии: логируются и проглатываются
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("operation on uninitialized session")]
    OperationOnUninitializedSession,

    #[error("stale handle: channel `{channel}` is no longer current for peer `{peer}`")]
    StaleHandleRace { peer: String, channel: String },

    #[error("unrecognized message kind `{0}`")]
    UnrecognizedMessageKind(String),

    #[error("malformed payload: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("media capture failed")]
    CaptureFailed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

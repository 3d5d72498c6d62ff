use thiserror::Error;

use crate::types::PeerId;

#[derive(Error, Debug)]
pub enum SfuError {
    #[error(transparent)]
    Rtc(#[from] synctv_rtc::Error),

    #[error("Room is full ({max} peers)")]
    PeerLimit { max: usize },

    #[error("Peer already in room: {0}")]
    PeerExists(PeerId),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Track {0} does not receive media")]
    NotAReceiver(String),
}

pub type Result<T> = std::result::Result<T, SfuError>;

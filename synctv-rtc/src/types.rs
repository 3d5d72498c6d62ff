//! Common types shared by the peer connection, the channel model and the
//! transport engine contract.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Transport engine handle for a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc#{}", self.0)
    }
}

/// Transport engine handle for a data channel or a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(pub u32);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GatheringState {
    #[default]
    New,
    InProgress,
    Complete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPrAnswer,
    HaveRemotePrAnswer,
}

/// Session description type, as carried in the JSON signaling form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Let the engine pick offer or answer from the signaling state
    #[serde(rename = "unspec")]
    Unspecified,
    Offer,
    Answer,
    #[serde(rename = "pranswer")]
    PrAnswer,
    Rollback,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspec",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::PrAnswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

impl FromStr for SdpType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unspec" | "" => Ok(Self::Unspecified),
            "offer" => Ok(Self::Offer),
            "answer" => Ok(Self::Answer),
            "pranswer" => Ok(Self::PrAnswer),
            "rollback" => Ok(Self::Rollback),
            other => Err(Error::invalid(format!("unknown sdp type `{other}`"))),
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session description as exchanged over the application's signaling channel:
/// `{"type": "offer", "sdp": "v=0..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| Error::invalid(e.to_string()))
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::invalid(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, mid: Option<String>) -> Self {
        Self {
            candidate: candidate.into(),
            mid,
        }
    }
}

/// Negotiated media direction of a track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Unknown,
    SendOnly,
    RecvOnly,
    SendRecv,
    Inactive,
}

impl Direction {
    /// SDP attribute name (`a=sendonly`, ...)
    #[must_use]
    pub const fn as_sdp(&self) -> &'static str {
        match self {
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::SendRecv | Self::Unknown => "sendrecv",
            Self::Inactive => "inactive",
        }
    }

    #[must_use]
    pub fn from_sdp(attr: &str) -> Option<Self> {
        match attr {
            "sendonly" => Some(Self::SendOnly),
            "recvonly" => Some(Self::RecvOnly),
            "sendrecv" => Some(Self::SendRecv),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }

    /// The direction seen from the other end of the link
    #[must_use]
    pub const fn reversed(&self) -> Self {
        match self {
            Self::SendOnly => Self::RecvOnly,
            Self::RecvOnly => Self::SendOnly,
            other => *other,
        }
    }

    #[must_use]
    pub const fn can_send(&self) -> bool {
        matches!(self, Self::SendOnly | Self::SendRecv)
    }

    #[must_use]
    pub const fn can_receive(&self) -> bool {
        matches!(self, Self::RecvOnly | Self::SendRecv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    // video
    H264,
    VP8,
    VP9,
    H265,
    AV1,

    // audio
    Opus,
    PCMU,
    PCMA,
    AAC,
    G722,
}

impl Codec {
    /// Encoding name as written in `a=rtpmap`
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::VP8 => "VP8",
            Self::VP9 => "VP9",
            Self::H265 => "H265",
            Self::AV1 => "AV1",
            Self::Opus => "opus",
            Self::PCMU => "PCMU",
            Self::PCMA => "PCMA",
            Self::AAC => "MP4A-LATM",
            Self::G722 => "G722",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        [
            Self::H264,
            Self::VP8,
            Self::VP9,
            Self::H265,
            Self::AV1,
            Self::Opus,
            Self::PCMU,
            Self::PCMA,
            Self::AAC,
            Self::G722,
        ]
        .into_iter()
        .find(|codec| codec.name().eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub const fn is_video(&self) -> bool {
        matches!(
            self,
            Self::H264 | Self::VP8 | Self::VP9 | Self::H265 | Self::AV1
        )
    }

    /// Media kind as written in the `m=` line
    #[must_use]
    pub const fn media_kind(&self) -> &'static str {
        if self.is_video() {
            "video"
        } else {
            "audio"
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

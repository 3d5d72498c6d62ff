//! Transport engine contract
//!
//! The engine owns ICE, DTLS, SCTP and SRTP. This layer talks to it through
//! integer handles and receives [`EngineEvent`]s on engine-owned threads.
//!
//! Engines must never invoke the [`EventSink`] re-entrantly from inside one
//! of the [`TransportEngine`] methods; callers hold per-connection locks
//! across those calls.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::config::{PeerConfig, PortRange};
use crate::error::{Error, Result};
use crate::types::{
    ChannelHandle, Codec, ConnectionHandle, ConnectionState, Direction, GatheringState, IceState,
    SdpType, SignalingState,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub auto_negotiation: bool,
    pub force_media_transport: bool,
    pub port_range: Option<PortRange>,
}

impl From<&PeerConfig> for EngineConfig {
    fn from(config: &PeerConfig) -> Self {
        Self {
            auto_negotiation: config.auto_negotiation,
            force_media_transport: config.force_media_transport,
            port_range: config.port_range,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelInit {
    /// Ordered and fully reliable when true, unordered with no retransmits otherwise
    pub reliable: bool,
    /// SCTP stream id; required when `negotiated` is set
    pub stream_id: Option<u16>,
    /// Out-of-band negotiated: both sides create the channel with the same id
    pub negotiated: bool,
    pub protocol: String,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            reliable: true,
            stream_id: None,
            negotiated: false,
            protocol: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInit {
    pub mid: String,
    pub stream_id: String,
    pub track_id: String,
    pub direction: Direction,
    pub codec: Codec,
    pub payload_type: u8,
    pub ssrc: u32,
    pub profile: Option<String>,
    /// Clock rate for video, sample rate or bitrate for audio
    pub clock_rate: u32,
    pub channel_count: u8,
}

/// Callback notifications from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    LocalDescription { sdp: String, sdp_type: SdpType },
    LocalCandidate { candidate: String, mid: Option<String> },
    StateChange(ConnectionState),
    IceStateChange(IceState),
    GatheringStateChange(GatheringState),
    SignalingStateChange(SignalingState),
    /// The remote side opened a data channel
    DataChannel(ChannelHandle),
    /// The remote side negotiated a track
    Track(ChannelHandle),
    Open(ChannelHandle),
    Closed(ChannelHandle),
    Error(ChannelHandle, String),
    Message(ChannelHandle, Bytes),
    /// A PLI arrived for a track with a chained PLI handler
    KeyFrameRequested(ChannelHandle),
}

pub type EventSink = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Sized string reads follow a size-then-fill protocol: called with an
/// empty buffer they return the required size; called with a buffer that is
/// too short they fail with [`Error::BufferTooSmall`]; otherwise they write
/// the value and return the number of bytes written.
pub trait TransportEngine: Send + Sync {
    fn create_connection(&self, config: &EngineConfig, sink: EventSink) -> Result<ConnectionHandle>;
    fn close_connection(&self, pc: ConnectionHandle) -> Result<()>;
    /// Release the handle and every channel still attached to it.
    fn delete_connection(&self, pc: ConnectionHandle) -> Result<()>;

    fn create_offer(&self, pc: ConnectionHandle, buf: &mut [u8]) -> Result<usize>;
    fn create_answer(&self, pc: ConnectionHandle, buf: &mut [u8]) -> Result<usize>;
    /// Commit local tracks and channels and start gathering candidates.
    fn set_local_description(&self, pc: ConnectionHandle, sdp_type: SdpType) -> Result<()>;
    /// The signaling state as of now, possibly ahead of the events delivered so far.
    fn signaling_state(&self, pc: ConnectionHandle) -> Result<SignalingState>;
    fn set_remote_description(&self, pc: ConnectionHandle, sdp: &str, sdp_type: SdpType)
        -> Result<()>;
    fn add_remote_candidate(
        &self,
        pc: ConnectionHandle,
        candidate: &str,
        mid: Option<&str>,
    ) -> Result<()>;

    fn create_data_channel(
        &self,
        pc: ConnectionHandle,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<ChannelHandle>;
    fn create_track(&self, pc: ConnectionHandle, init: &TrackInit) -> Result<ChannelHandle>;

    fn send_message(&self, ch: ChannelHandle, data: &[u8]) -> Result<()>;
    fn close_channel(&self, ch: ChannelHandle) -> Result<()>;
    fn delete_channel(&self, ch: ChannelHandle) -> Result<()>;

    fn data_channel_stream(&self, ch: ChannelHandle) -> Result<u16>;
    fn data_channel_label(&self, ch: ChannelHandle, buf: &mut [u8]) -> Result<usize>;

    /// The track's SDP media description: a bare `m=` section or a session
    /// holding only that section.
    fn track_description(&self, ch: ChannelHandle, buf: &mut [u8]) -> Result<usize>;
    fn track_mid(&self, ch: ChannelHandle, buf: &mut [u8]) -> Result<usize>;
    fn track_direction(&self, ch: ChannelHandle) -> Result<Direction>;
    fn track_ssrcs(&self, ch: ChannelHandle) -> Result<Vec<u32>>;
    fn track_payload_types(&self, ch: ChannelHandle, codec: &str) -> Result<Vec<u8>>;

    /// Chain an RTCP receiving session (receiver reports, PLI, REMB) onto the track.
    fn set_rtcp_receiving_session(&self, ch: ChannelHandle) -> Result<()>;
    /// Enable or disable `KeyFrameRequested` events for the track.
    fn chain_pli_handler(&self, ch: ChannelHandle, enabled: bool) -> Result<()>;
    fn request_keyframe(&self, ch: ChannelHandle) -> Result<()>;
}

impl fmt::Debug for dyn TransportEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportEngine")
    }
}

/// Read an engine string with the size-then-fill protocol, retrying once if
/// the value grew between the size query and the fill.
pub fn read_sized<F>(mut fill: F) -> Result<String>
where
    F: FnMut(&mut [u8]) -> Result<usize>,
{
    let mut retried = false;
    loop {
        let size = fill(&mut [])?;
        let mut buf = vec![0u8; size];
        match fill(&mut buf) {
            Ok(written) => {
                buf.truncate(written);
                return String::from_utf8(buf).map_err(|e| Error::invalid(e.to_string()));
            }
            Err(Error::BufferTooSmall { .. }) if !retried => retried = true,
            Err(e) => return Err(e),
        }
    }
}

/// Engine-side half of [`read_sized`]: copy `value` into `buf` following the
/// size-then-fill protocol.
pub fn fill_sized(value: &str, buf: &mut [u8]) -> Result<usize> {
    let bytes = value.as_bytes();
    if buf.is_empty() {
        return Ok(bytes.len());
    }
    if buf.len() < bytes.len() {
        return Err(Error::BufferTooSmall {
            required: bytes.len(),
        });
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

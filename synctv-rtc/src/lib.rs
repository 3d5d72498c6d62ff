//! WebRTC session control over a pluggable transport engine
//!
//! This crate turns the callbacks of a transport engine (ICE, DTLS, SCTP and
//! SRTP live there) into observable, awaitable session state:
//! - [`Published`]: observable values with synchronous subscribers and
//!   timed waits
//! - [`PayloadTypeAllocator`] and [`SsrcAllocator`]: per-connection RTP
//!   identifier allocation
//! - [`PeerConnection`]: the negotiation state machine and the registry of
//!   its [`DataChannel`]s and [`Track`]s
//! - [`LoopbackEngine`]: an in-process [`TransportEngine`] used by tests and
//!   demos

pub mod allocator;
pub mod channel;
pub mod config;
pub mod data_channel;
pub mod engine;
pub mod error;
pub mod logging;
pub mod loopback;
pub mod peer;
pub mod publisher;
pub mod sdp;
pub mod signaling;
pub mod track;
pub mod types;

pub use allocator::{PayloadTypeAllocator, PayloadTypeKey, SsrcAllocator};
pub use channel::{Channel, ChannelCore, RtcChannel};
pub use config::{IpOverride, LoggingConfig, NegotiationTimeouts, PeerConfig, PortRange, RtcSettings};
pub use data_channel::DataChannel;
pub use engine::{DataChannelInit, EngineConfig, EngineEvent, EventSink, TrackInit, TransportEngine};
pub use error::{Error, Result};
pub use loopback::LoopbackEngine;
pub use peer::{PeerConnection, TrackOptions};
pub use publisher::{Published, Subscription};
pub use track::Track;
pub use types::{
    ChannelHandle, Codec, ConnectionHandle, ConnectionState, Direction, GatheringState,
    IceCandidate, IceState, SdpType, SessionDescription, SignalingState,
};

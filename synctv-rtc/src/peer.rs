//! Peer connection negotiation state machine
//!
//! This module handles:
//! - Ownership of exactly one engine connection handle
//! - Mirroring connection, ICE, gathering and signaling state into [`Published`] values
//! - Offer/answer/candidate exchange with the IP override rule applied
//! - The registry of live data channels and tracks, keyed by engine handle
//! - Payload type and SSRC allocation for local tracks
//!
//! Engine events and application calls that touch the channel registry are
//! serialized by one lock per connection.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, info_span, trace, warn, Span};

use crate::allocator::{PayloadTypeAllocator, PayloadTypeKey, SsrcAllocator};
use crate::channel::{Channel, ChannelCore};
use crate::config::PeerConfig;
use crate::data_channel::DataChannel;
use crate::engine::{
    read_sized, DataChannelInit, EngineConfig, EngineEvent, EventSink, TrackInit, TransportEngine,
};
use crate::error::{Error, Result};
use crate::publisher::Published;
use crate::track::Track;
use crate::types::{
    ChannelHandle, Codec, ConnectionHandle, ConnectionState, Direction, GatheringState,
    IceCandidate, IceState, SdpType, SessionDescription, SignalingState,
};

/// Parameters for [`PeerConnection::create_track`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackOptions {
    pub stream_id: String,
    pub track_id: String,
    pub direction: Direction,
    pub codec: Codec,
    pub profile: Option<String>,
    /// Clock rate for video, sample rate or bitrate for audio
    pub clock_rate: u32,
    pub channel_count: u8,
    /// Defaults to the track id
    pub mid: Option<String>,
    /// Reserved and used as-is when set; otherwise allocated
    pub ssrc: Option<u32>,
}

impl TrackOptions {
    /// Options with the usual clock rate and channel count for `codec`.
    pub fn new(
        stream_id: impl Into<String>,
        track_id: impl Into<String>,
        direction: Direction,
        codec: Codec,
    ) -> Self {
        let (clock_rate, channel_count) = match codec {
            Codec::Opus => (48_000, 2),
            Codec::PCMU | Codec::PCMA | Codec::G722 => (8_000, 1),
            Codec::AAC => (44_100, 2),
            _ => (90_000, 0),
        };
        Self {
            stream_id: stream_id.into(),
            track_id: track_id.into(),
            direction,
            codec,
            profile: None,
            clock_rate,
            channel_count,
            mid: None,
            ssrc: None,
        }
    }

    #[must_use]
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    #[must_use]
    pub const fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = clock_rate;
        self
    }

    #[must_use]
    pub const fn with_channel_count(mut self, channel_count: u8) -> Self {
        self.channel_count = channel_count;
        self
    }

    #[must_use]
    pub fn with_mid(mut self, mid: impl Into<String>) -> Self {
        self.mid = Some(mid.into());
        self
    }

    #[must_use]
    pub const fn with_ssrc(mut self, ssrc: u32) -> Self {
        self.ssrc = Some(ssrc);
        self
    }

    fn payload_type_key(&self) -> PayloadTypeKey {
        PayloadTypeKey {
            codec: self.codec,
            profile: self.profile.clone(),
            clock_rate: self.clock_rate,
            channel_count: self.channel_count,
        }
    }
}

fn assert_token(kind: &str, value: &str) {
    assert!(
        !value.is_empty() && !value.chars().any(char::is_whitespace),
        "{kind} must be a non-empty token without whitespace, got {value:?}"
    );
}

struct Registry {
    channels: HashMap<ChannelHandle, Channel>,
    payload_types: PayloadTypeAllocator,
    ssrcs: SsrcAllocator,
    /// Set by `lock_local_description`, cleared when signaling returns to stable
    locked: bool,
}

pub(crate) struct PeerShared {
    handle: ConnectionHandle,
    engine: Arc<dyn TransportEngine>,
    config: PeerConfig,
    span: Span,
    this: Weak<PeerShared>,
    released: AtomicBool,

    state: Published<ConnectionState>,
    ice_state: Published<IceState>,
    gathering_state: Published<GatheringState>,
    signaling_state: Published<SignalingState>,
    local_description: Published<Option<SessionDescription>>,
    local_candidates: Published<Vec<IceCandidate>>,
    /// Bumped after every registry insertion or removal
    channel_generation: Published<u64>,

    registry: Mutex<Registry>,
}

impl PeerShared {
    fn ensure_live(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            Err(Error::invalid(format!("{} has been closed", self.handle)))
        } else {
            Ok(())
        }
    }

    fn scrub(&self, text: &str) -> String {
        match &self.config.ip_override {
            Some(rule) => rule.apply(text),
            None => text.to_string(),
        }
    }

    fn channel_core(&self, handle: ChannelHandle) -> ChannelCore {
        ChannelCore::new(handle, Arc::clone(&self.engine), self.this.clone())
    }

    fn lookup(&self, handle: ChannelHandle) -> Option<Channel> {
        self.registry.lock().channels.get(&handle).cloned()
    }

    /// Must be called without the registry lock held.
    fn registry_changed(&self) {
        self.channel_generation.update(|generation| *generation += 1);
    }

    pub(crate) fn forget_channel(&self, handle: ChannelHandle) {
        let removed = self.registry.lock().channels.remove(&handle).is_some();
        if removed {
            trace!(parent: &self.span, channel = %handle, "Channel removed from registry");
            self.registry_changed();
        }
    }

    fn handle_event(&self, event: EngineEvent) {
        let _entered = self.span.enter();
        match event {
            EngineEvent::LocalDescription { sdp, sdp_type } => {
                debug!(sdp_type = %sdp_type, "Local description ready");
                let sdp = self.scrub(&sdp);
                self.local_description
                    .set(Some(SessionDescription::new(sdp_type, sdp)));
            }
            EngineEvent::LocalCandidate { candidate, mid } => {
                trace!(candidate = %candidate, "Local candidate");
                let candidate = IceCandidate::new(self.scrub(&candidate), mid);
                self.local_candidates.update(|all| all.push(candidate));
            }
            EngineEvent::StateChange(state) => {
                info!(state = ?state, "Connection state changed");
                self.state.set(state);
            }
            EngineEvent::IceStateChange(state) => {
                debug!(state = ?state, "ICE state changed");
                self.ice_state.set(state);
            }
            EngineEvent::GatheringStateChange(state) => {
                debug!(state = ?state, "Gathering state changed");
                self.gathering_state.set(state);
            }
            EngineEvent::SignalingStateChange(state) => {
                debug!(state = ?state, "Signaling state changed");
                if state == SignalingState::Stable {
                    self.unlock_if_stable();
                }
                self.signaling_state.set(state);
            }
            EngineEvent::DataChannel(handle) => match self.adopt_data_channel(handle) {
                Ok(true) => self.registry_changed(),
                Ok(false) => {}
                Err(e) => warn!(channel = %handle, error = %e, "Failed to adopt inbound data channel"),
            },
            EngineEvent::Track(handle) => match self.adopt_track(handle) {
                Ok(true) => self.registry_changed(),
                Ok(false) => {}
                Err(e) => warn!(channel = %handle, error = %e, "Failed to adopt inbound track"),
            },
            EngineEvent::Open(handle) => match self.lookup(handle) {
                Some(channel) => {
                    debug!(channel = %handle, "Channel open");
                    channel.core().on_open();
                }
                None => trace!(channel = %handle, "Open for unknown channel"),
            },
            EngineEvent::Closed(handle) => {
                if let Some(channel) = self.lookup(handle) {
                    debug!(channel = %handle, "Channel closed by engine");
                    channel.core().on_closed();
                }
            }
            EngineEvent::Error(handle, message) => {
                if let Some(channel) = self.lookup(handle) {
                    channel.core().on_error(message);
                }
            }
            EngineEvent::Message(handle, data) => {
                if let Some(channel) = self.lookup(handle) {
                    channel.core().on_message(data);
                }
            }
            EngineEvent::KeyFrameRequested(handle) => {
                if let Some(Channel::Media(track)) = self.lookup(handle) {
                    trace!(channel = %handle, "Key frame requested");
                    track.on_key_frame_requested();
                }
            }
        }
    }

    /// A queued `Stable` notification can trail a newer local description,
    /// so the lock is only lifted when the engine is still stable.
    fn unlock_if_stable(&self) {
        let mut registry = self.registry.lock();
        if !registry.locked {
            return;
        }
        match self.engine.signaling_state(self.handle) {
            Ok(SignalingState::Stable) => registry.locked = false,
            Ok(current) => trace!(current = ?current, "Ignoring stale stable signaling state"),
            Err(e) => debug!(error = %e, "Could not read signaling state"),
        }
    }

    /// Returns whether the channel was new to the registry.
    fn adopt_data_channel(&self, handle: ChannelHandle) -> Result<bool> {
        let mut registry = self.registry.lock();
        if registry.channels.contains_key(&handle) {
            return Ok(false);
        }

        let dc = DataChannel::from_engine(self.channel_core(handle))?;
        info!(channel = %handle, label = %dc.label(), stream = dc.stream_id(), "Inbound data channel");
        registry
            .channels
            .insert(handle, Channel::Data(Arc::new(dc)));
        Ok(true)
    }

    fn adopt_track(&self, handle: ChannelHandle) -> Result<bool> {
        let mut registry = self.registry.lock();
        if registry.channels.contains_key(&handle) {
            return Ok(false);
        }

        let track = Track::from_engine(self.channel_core(handle), None)?;
        for ssrc in track.ssrcs() {
            registry.ssrcs.reserve(*ssrc);
        }
        info!(
            channel = %handle,
            stream_id = %track.stream_id(),
            track_id = %track.track_id(),
            ssrcs = ?track.ssrcs(),
            "Inbound track"
        );
        registry
            .channels
            .insert(handle, Channel::Media(Arc::new(track)));
        Ok(true)
    }

    fn teardown(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let _entered = self.span.enter();

        if let Err(e) = self.engine.close_connection(self.handle) {
            warn!(error = %e, "Engine failed to close connection");
        }
        let channels: Vec<Channel> = self
            .registry
            .lock()
            .channels
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        if let Err(e) = self.engine.delete_connection(self.handle) {
            warn!(error = %e, "Engine failed to release connection");
        }
        let emptied = !channels.is_empty();
        for channel in channels {
            channel.core().detach();
        }
        if emptied {
            self.registry_changed();
        }
        if self.state.get() != ConnectionState::Closed {
            self.state.set(ConnectionState::Closed);
        }
        info!("Peer connection closed");
    }
}

/// One negotiated session with a remote peer
///
/// Dropping the connection closes it and releases the engine handle.
pub struct PeerConnection {
    shared: Arc<PeerShared>,
}

impl PeerConnection {
    pub fn new(engine: Arc<dyn TransportEngine>, config: PeerConfig) -> Result<Self> {
        Self::with_span(engine, config, &Span::current())
    }

    /// Like [`new`](Self::new), with every log line of this connection
    /// recorded under a child of `parent`.
    pub fn with_span(
        engine: Arc<dyn TransportEngine>,
        config: PeerConfig,
        parent: &Span,
    ) -> Result<Self> {
        let engine_config = EngineConfig::from(&config);
        let mut created = None;

        let shared = Arc::new_cyclic(|this: &Weak<PeerShared>| {
            let target = this.clone();
            let sink: EventSink = Arc::new(move |event| {
                if let Some(shared) = target.upgrade() {
                    shared.handle_event(event);
                }
            });
            let result = engine.create_connection(&engine_config, sink);
            let handle = result.as_ref().copied().unwrap_or(ConnectionHandle(0));
            created = Some(result);

            PeerShared {
                handle,
                engine: Arc::clone(&engine),
                config,
                span: info_span!(parent: parent, "peer_connection", pc = %handle),
                this: this.clone(),
                released: AtomicBool::new(false),
                state: Published::default(),
                ice_state: Published::default(),
                gathering_state: Published::default(),
                signaling_state: Published::default(),
                local_description: Published::new(None),
                local_candidates: Published::new(Vec::new()),
                channel_generation: Published::new(0),
                registry: Mutex::new(Registry {
                    channels: HashMap::new(),
                    payload_types: PayloadTypeAllocator::new(),
                    ssrcs: SsrcAllocator::new(),
                    locked: false,
                }),
            }
        });

        match created {
            Some(Ok(handle)) => {
                info!(parent: &shared.span, pc = %handle, "Peer connection created");
                Ok(Self { shared })
            }
            Some(Err(e)) => {
                shared.released.store(true, Ordering::Release);
                Err(e)
            }
            None => {
                shared.released.store(true, Ordering::Release);
                Err(Error::failure("engine did not create a connection"))
            }
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionHandle {
        self.shared.handle
    }

    #[must_use]
    pub fn config(&self) -> &PeerConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.shared.span
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> &Published<ConnectionState> {
        &self.shared.state
    }

    #[must_use]
    pub fn ice_state(&self) -> &Published<IceState> {
        &self.shared.ice_state
    }

    #[must_use]
    pub fn gathering_state(&self) -> &Published<GatheringState> {
        &self.shared.gathering_state
    }

    #[must_use]
    pub fn signaling_state(&self) -> &Published<SignalingState> {
        &self.shared.signaling_state
    }

    /// The last description reported by the engine, IP override applied
    #[must_use]
    pub fn local_description(&self) -> &Published<Option<SessionDescription>> {
        &self.shared.local_description
    }

    /// Local candidates in the order they were gathered
    #[must_use]
    pub fn local_candidates(&self) -> &Published<Vec<IceCandidate>> {
        &self.shared.local_candidates
    }

    /// Changes whenever a data channel or track joins or leaves this
    /// connection, locally or from the remote side.
    #[must_use]
    pub fn channel_generation(&self) -> &Published<u64> {
        &self.shared.channel_generation
    }

    /// Serialize the local configuration as an offer.
    pub fn create_offer(&self) -> Result<String> {
        self.shared.ensure_live()?;
        let engine = &self.shared.engine;
        let pc = self.shared.handle;
        let sdp = read_sized(|buf| engine.create_offer(pc, buf))?;
        Ok(self.shared.scrub(&sdp))
    }

    /// Serialize the local configuration as an answer to the remote offer.
    pub fn create_answer(&self) -> Result<String> {
        self.shared.ensure_live()?;
        let engine = &self.shared.engine;
        let pc = self.shared.handle;
        let sdp = read_sized(|buf| engine.create_answer(pc, buf))?;
        Ok(self.shared.scrub(&sdp))
    }

    /// Commit local tracks and channels and start gathering candidates. No
    /// track or channel can be added until signaling is stable again.
    pub fn lock_local_description(&self, sdp_type: SdpType) -> Result<()> {
        self.shared.ensure_live()?;
        let mut registry = self.shared.registry.lock();
        registry.locked = true;
        debug!(parent: &self.shared.span, sdp_type = %sdp_type, "Locking local description");
        let result = self
            .shared
            .engine
            .set_local_description(self.shared.handle, sdp_type);
        if result.is_err() {
            registry.locked = false;
        }
        result
    }

    pub fn set_remote(&self, sdp: &str, sdp_type: SdpType) -> Result<()> {
        self.shared.ensure_live()?;
        debug!(parent: &self.shared.span, sdp_type = %sdp_type, "Applying remote description");
        self.shared
            .engine
            .set_remote_description(self.shared.handle, sdp, sdp_type)
    }

    pub fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        self.set_remote(&description.sdp, description.sdp_type)
    }

    pub fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.shared.ensure_live()?;
        self.shared.engine.add_remote_candidate(
            self.shared.handle,
            &candidate.candidate,
            candidate.mid.as_deref(),
        )
    }

    pub fn create_data_channel(&self, label: &str, init: DataChannelInit) -> Result<Arc<DataChannel>> {
        self.shared.ensure_live()?;
        if init.negotiated && init.stream_id.is_none() {
            return Err(Error::invalid("negotiated data channels need a stream id"));
        }

        let mut registry = self.shared.registry.lock();
        if registry.locked {
            return Err(Error::invalid(
                "local description is locked until negotiation completes",
            ));
        }

        let handle = self
            .shared
            .engine
            .create_data_channel(self.shared.handle, label, &init)?;
        if let Some(existing) = registry.channels.get(&handle) {
            if let Some(dc) = existing.as_data_channel() {
                return Ok(Arc::clone(dc));
            }
            return Err(Error::failure(format!("{handle} is already a track")));
        }

        let dc = Arc::new(DataChannel::from_engine(self.shared.channel_core(handle))?);
        registry.channels.insert(handle, Channel::Data(Arc::clone(&dc)));
        drop(registry);
        debug!(parent: &self.shared.span, channel = %handle, label, "Data channel created");
        self.shared.registry_changed();
        Ok(dc)
    }

    /// Create a local track, allocating its payload type and SSRC.
    ///
    /// # Panics
    ///
    /// Panics if the stream id, track id or mid is empty or contains
    /// whitespace; such identifiers cannot appear in an `a=msid` line.
    pub fn create_track(&self, options: TrackOptions) -> Result<Arc<Track>> {
        let mid = options.mid.clone().unwrap_or_else(|| options.track_id.clone());
        assert_token("stream id", &options.stream_id);
        assert_token("track id", &options.track_id);
        assert_token("mid", &mid);
        self.shared.ensure_live()?;

        let mut registry = self.shared.registry.lock();
        if registry.locked {
            return Err(Error::invalid(
                "local description is locked until negotiation completes",
            ));
        }

        let existing = registry
            .channels
            .values()
            .filter_map(Channel::as_track)
            .find(|track| track.mid() == mid);
        if let Some(track) = existing {
            if track.direction() == options.direction {
                return Ok(Arc::clone(track));
            }
            return Err(Error::invalid(format!("mid {mid} already in use")));
        }

        if let Some(ssrc) = options.ssrc {
            if registry.ssrcs.is_reserved(ssrc) {
                return Err(Error::invalid(format!("SSRC {ssrc} is already in use")));
            }
        }
        let payload_type = registry
            .payload_types
            .payload_type(&options.payload_type_key())?;
        let ssrc = match options.ssrc {
            Some(ssrc) => {
                registry.ssrcs.reserve(ssrc);
                ssrc
            }
            None => registry.ssrcs.next(),
        };

        let init = TrackInit {
            mid,
            stream_id: options.stream_id,
            track_id: options.track_id,
            direction: options.direction,
            codec: options.codec,
            payload_type,
            ssrc,
            profile: options.profile,
            clock_rate: options.clock_rate,
            channel_count: options.channel_count,
        };
        let handle = match self.shared.engine.create_track(self.shared.handle, &init) {
            Ok(handle) => handle,
            Err(e) => {
                registry.ssrcs.release(ssrc);
                return Err(e);
            }
        };
        if registry.channels.contains_key(&handle) {
            registry.ssrcs.release(ssrc);
            return Err(Error::failure(format!("{handle} is already registered")));
        }

        let track = match Track::from_engine(self.shared.channel_core(handle), Some(&init)) {
            Ok(track) => Arc::new(track),
            Err(e) => {
                registry.ssrcs.release(ssrc);
                return Err(e);
            }
        };
        registry
            .channels
            .insert(handle, Channel::Media(Arc::clone(&track)));
        drop(registry);
        self.shared.registry_changed();
        debug!(
            parent: &self.shared.span,
            channel = %handle,
            mid = %init.mid,
            codec = %init.codec,
            payload_type,
            ssrc,
            "Track created"
        );
        Ok(track)
    }

    /// Every live channel, data channels and tracks alike
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        self.shared.registry.lock().channels.values().cloned().collect()
    }

    #[must_use]
    pub fn data_channels(&self) -> Vec<Arc<DataChannel>> {
        self.shared
            .registry
            .lock()
            .channels
            .values()
            .filter_map(|c| c.as_data_channel().cloned())
            .collect()
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<Track>> {
        self.shared
            .registry
            .lock()
            .channels
            .values()
            .filter_map(|c| c.as_track().cloned())
            .collect()
    }

    #[must_use]
    pub fn channel(&self, handle: ChannelHandle) -> Option<Channel> {
        self.shared.lookup(handle)
    }

    /// Whether `ssrc` is taken on this connection, locally or by the remote side
    #[must_use]
    pub fn is_ssrc_reserved(&self, ssrc: u32) -> bool {
        self.shared.registry.lock().ssrcs.is_reserved(ssrc)
    }

    /// Close the connection and release the engine handle. Every later
    /// operation fails with [`Error::Invalid`]. Idempotent.
    pub fn close(&self) {
        self.shared.teardown();
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.shared.handle)
            .field("state", &self.shared.state.get())
            .field("signaling_state", &self.shared.signaling_state.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RtcChannel;
    use crate::loopback::LoopbackEngine;

    fn peer() -> PeerConnection {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        PeerConnection::new(engine, PeerConfig::default()).unwrap()
    }

    #[test]
    fn test_track_options_defaults() {
        let video = TrackOptions::new("s", "v", Direction::SendOnly, Codec::H264);
        assert_eq!(video.clock_rate, 90_000);
        assert_eq!(video.channel_count, 0);

        let audio = TrackOptions::new("s", "a", Direction::SendOnly, Codec::Opus);
        assert_eq!((audio.clock_rate, audio.channel_count), (48_000, 2));
    }

    #[test]
    fn test_create_track_allocates_identifiers() {
        let pc = peer();
        let video = pc
            .create_track(TrackOptions::new("cam", "video", Direction::SendOnly, Codec::H264))
            .unwrap();
        let audio = pc
            .create_track(TrackOptions::new("cam", "audio", Direction::SendOnly, Codec::Opus))
            .unwrap();

        assert_eq!(video.mid(), "video");
        assert_eq!(video.stream_id(), "cam");
        assert_eq!(video.codec(), Some(Codec::H264));
        assert_eq!(video.payload_types("H264").unwrap(), vec![96]);
        assert_eq!(audio.payload_types("opus").unwrap(), vec![97]);

        let ssrc = video.ssrc().unwrap();
        assert_ne!(ssrc, 0);
        assert!(pc.is_ssrc_reserved(ssrc));
        assert_ne!(Some(ssrc), audio.ssrc());
        assert_eq!(pc.tracks().len(), 2);
    }

    #[test]
    fn test_same_format_shares_payload_type() {
        let pc = peer();
        let a = pc
            .create_track(TrackOptions::new("s", "a", Direction::SendOnly, Codec::VP8))
            .unwrap();
        let b = pc
            .create_track(TrackOptions::new("s", "b", Direction::SendOnly, Codec::VP8))
            .unwrap();
        assert_eq!(a.payload_types("VP8").unwrap(), b.payload_types("VP8").unwrap());
    }

    #[test]
    fn test_caller_ssrc_is_reserved() {
        let pc = peer();
        let track = pc
            .create_track(
                TrackOptions::new("s", "v", Direction::SendOnly, Codec::VP8).with_ssrc(4242),
            )
            .unwrap();
        assert_eq!(track.ssrcs(), &[4242]);
        assert!(pc.is_ssrc_reserved(4242));
    }

    #[test]
    #[should_panic(expected = "without whitespace")]
    fn test_whitespace_in_track_id_panics() {
        let pc = peer();
        let _ = pc.create_track(TrackOptions::new("s", "bad id", Direction::SendOnly, Codec::VP8));
    }

    #[test]
    fn test_negotiated_channel_needs_stream_id() {
        let pc = peer();
        let init = DataChannelInit {
            negotiated: true,
            ..DataChannelInit::default()
        };
        assert!(matches!(
            pc.create_data_channel("x", init),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_data_channel_properties() {
        let pc = peer();
        let dc = pc
            .create_data_channel(
                "chat",
                DataChannelInit {
                    stream_id: Some(3),
                    negotiated: true,
                    ..DataChannelInit::default()
                },
            )
            .unwrap();
        assert_eq!(dc.label(), "chat");
        assert_eq!(dc.stream_id(), 3);
        assert!(!dc.is_open().get());
        assert_eq!(pc.data_channels().len(), 1);
    }

    #[test]
    fn test_channel_close_removes_from_registry() {
        use crate::channel::RtcChannel;

        let pc = peer();
        let dc = pc
            .create_data_channel("chat", DataChannelInit::default())
            .unwrap();
        let handle = dc.handle();
        assert!(pc.channel(handle).is_some());

        dc.close().unwrap();
        assert!(pc.channel(handle).is_none());
        assert!(dc.close().is_ok());
        assert!(matches!(dc.send(b"late"), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_operations_after_close_are_invalid() {
        let pc = peer();
        let dc = pc
            .create_data_channel("chat", DataChannelInit::default())
            .unwrap();
        pc.close();
        pc.close();

        assert!(pc.is_closed());
        assert_eq!(pc.state().get(), ConnectionState::Closed);
        assert!(pc.channels().is_empty());
        assert!(matches!(pc.create_offer(), Err(Error::Invalid(_))));
        assert!(matches!(
            pc.lock_local_description(SdpType::Offer),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            pc.create_data_channel("again", DataChannelInit::default()),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(dc.send_text("x"), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_create_track_twice_returns_same_entity() {
        let pc = peer();
        let options = TrackOptions::new("s", "v", Direction::SendOnly, Codec::VP8);
        let first = pc.create_track(options.clone()).unwrap();
        let second = pc.create_track(options).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pc.tracks().len(), 1);
    }

    #[test]
    fn test_repeated_inbound_notifications_are_deduplicated() {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        let pc = PeerConnection::new(Arc::clone(&engine), PeerConfig::default()).unwrap();
        let init = TrackInit {
            mid: "remote".to_string(),
            stream_id: "far".to_string(),
            track_id: "cam".to_string(),
            direction: Direction::RecvOnly,
            codec: Codec::H264,
            payload_type: 102,
            ssrc: 777,
            profile: None,
            clock_rate: 90_000,
            channel_count: 0,
        };
        let handle = engine.create_track(pc.id(), &init).unwrap();

        pc.shared.handle_event(EngineEvent::Track(handle));
        pc.shared.handle_event(EngineEvent::Track(handle));

        let tracks = pc.tracks();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].stream_id(), "far");
        assert_eq!(tracks[0].track_id(), "cam");
        assert!(pc.is_ssrc_reserved(777));

        let dc = engine
            .create_data_channel(pc.id(), "side", &DataChannelInit::default())
            .unwrap();
        pc.shared.handle_event(EngineEvent::DataChannel(dc));
        pc.shared.handle_event(EngineEvent::DataChannel(dc));
        assert_eq!(pc.data_channels().len(), 1);
    }

    #[test]
    fn test_cannot_add_channels_while_locked() {
        let pc = peer();
        pc.create_data_channel("chat", DataChannelInit::default())
            .unwrap();
        pc.lock_local_description(SdpType::Offer).unwrap();
        assert!(matches!(
            pc.create_track(TrackOptions::new("s", "v", Direction::SendOnly, Codec::VP8)),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_colliding_caller_ssrc_is_rejected() {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        let pc = PeerConnection::new(Arc::clone(&engine), PeerConfig::default()).unwrap();
        pc.create_track(
            TrackOptions::new("s", "v", Direction::SendOnly, Codec::VP8).with_ssrc(4242),
        )
        .unwrap();

        let result = pc.create_track(
            TrackOptions::new("s", "w", Direction::SendOnly, Codec::VP8).with_ssrc(4242),
        );
        assert!(matches!(result, Err(Error::Invalid(_))));

        // SSRCs announced by the remote side are taken as well.
        let init = TrackInit {
            mid: "remote".to_string(),
            stream_id: "far".to_string(),
            track_id: "mic".to_string(),
            direction: Direction::RecvOnly,
            codec: Codec::Opus,
            payload_type: 111,
            ssrc: 777,
            profile: None,
            clock_rate: 48_000,
            channel_count: 2,
        };
        let handle = engine.create_track(pc.id(), &init).unwrap();
        pc.shared.handle_event(EngineEvent::Track(handle));
        let result = pc.create_track(
            TrackOptions::new("s", "a", Direction::SendOnly, Codec::Opus).with_ssrc(777),
        );
        assert!(matches!(result, Err(Error::Invalid(_))));
        assert_eq!(pc.tracks().len(), 2);
    }

    #[test]
    fn test_existing_mid_allocates_nothing() {
        let pc = peer();
        let reserved = || pc.shared.registry.lock().ssrcs.len();

        let options = TrackOptions::new("s", "v", Direction::SendOnly, Codec::VP8);
        pc.create_track(options.clone()).unwrap();
        assert_eq!(reserved(), 1);

        pc.create_track(options).unwrap();
        assert_eq!(reserved(), 1);

        let conflicting = TrackOptions::new("s", "v", Direction::RecvOnly, Codec::VP8);
        assert!(matches!(
            pc.create_track(conflicting),
            Err(Error::Invalid(_))
        ));
        assert_eq!(reserved(), 1);
        assert_eq!(pc.tracks().len(), 1);
    }

    #[test]
    fn test_stale_stable_notification_keeps_lock() {
        let pc = peer();
        let options = TrackOptions::new("s", "v", Direction::SendOnly, Codec::VP8);

        pc.lock_local_description(SdpType::Offer).unwrap();
        pc.lock_local_description(SdpType::Rollback).unwrap();
        pc.shared
            .handle_event(EngineEvent::SignalingStateChange(SignalingState::Stable));
        pc.create_data_channel("chat", DataChannelInit::default())
            .unwrap();

        // A new offer is pending; the stable notice from the rollback is late.
        pc.lock_local_description(SdpType::Offer).unwrap();
        pc.shared
            .handle_event(EngineEvent::SignalingStateChange(SignalingState::Stable));
        assert!(matches!(
            pc.create_track(options.clone()),
            Err(Error::Invalid(_))
        ));

        pc.lock_local_description(SdpType::Rollback).unwrap();
        pc.shared
            .handle_event(EngineEvent::SignalingStateChange(SignalingState::Stable));
        assert!(pc.create_track(options).is_ok());
    }

    #[test]
    fn test_channel_generation_tracks_registry_changes() {
        use crate::channel::RtcChannel;

        let pc = peer();
        assert_eq!(pc.channel_generation().get(), 0);

        let dc = pc
            .create_data_channel("chat", DataChannelInit::default())
            .unwrap();
        assert_eq!(pc.channel_generation().get(), 1);

        let options = TrackOptions::new("s", "v", Direction::SendOnly, Codec::VP8);
        pc.create_track(options.clone()).unwrap();
        pc.create_track(options).unwrap();
        assert_eq!(pc.channel_generation().get(), 2);

        dc.close().unwrap();
        assert_eq!(pc.channel_generation().get(), 3);
    }
}

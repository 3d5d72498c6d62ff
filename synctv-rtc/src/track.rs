//! Media tracks
//!
//! A [`Track`] is one negotiated RTP stream. Its identity (stream and track
//! ids, mid, direction, SSRCs, RTP format) is read from the engine once, when
//! the track is constructed. Remote tracks carry no direct id accessor on the
//! engine side; their stream/track ids are recovered from the media
//! description's `a=msid` attributes.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::channel::{ChannelCore, RtcChannel};
use crate::engine::{read_sized, TrackInit};
use crate::error::Result;
use crate::sdp::{self, RtpMap};
use crate::types::{Codec, Direction};

type KeyFrameHandler = Arc<dyn Fn() + Send + Sync>;

pub struct Track {
    core: ChannelCore,
    stream_id: String,
    track_id: String,
    mid: String,
    direction: Direction,
    ssrcs: Vec<u32>,
    format: Option<RtpMap>,
    on_key_frame_requested: Mutex<Option<KeyFrameHandler>>,
}

impl Track {
    /// Wrap an engine handle. `local` carries the parameters the track was
    /// created with when it originates on this side.
    pub(crate) fn from_engine(core: ChannelCore, local: Option<&TrackInit>) -> Result<Self> {
        let handle = core.handle();
        let engine = Arc::clone(core.engine());

        let description = read_sized(|buf| engine.track_description(handle, buf))?;
        let media = sdp::parse_media(&description)?;
        let mid = read_sized(|buf| engine.track_mid(handle, buf))?;
        let direction = engine.track_direction(handle)?;
        let ssrcs = engine.track_ssrcs(handle)?;

        let (stream_id, track_id) = match local {
            Some(init) => (init.stream_id.clone(), init.track_id.clone()),
            None => sdp::msid(&media).unwrap_or_else(|| (mid.clone(), mid.clone())),
        };

        let formats = sdp::rtpmaps(&media)?;
        let format = local
            .and_then(|init| {
                formats
                    .iter()
                    .find(|map| map.payload_type == init.payload_type)
                    .cloned()
            })
            .or_else(|| formats.into_iter().next());

        Ok(Self {
            core,
            stream_id,
            track_id,
            mid,
            direction,
            ssrcs,
            format,
            on_key_frame_requested: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    #[must_use]
    pub fn mid(&self) -> &str {
        &self.mid
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub fn ssrcs(&self) -> &[u32] {
        &self.ssrcs
    }

    /// The primary SSRC, if any was negotiated
    #[must_use]
    pub fn ssrc(&self) -> Option<u32> {
        self.ssrcs.first().copied()
    }

    #[must_use]
    pub fn codec(&self) -> Option<Codec> {
        self.format.as_ref().and_then(RtpMap::codec)
    }

    #[must_use]
    pub fn clock_rate(&self) -> Option<u32> {
        self.format.as_ref().map(|f| f.clock_rate)
    }

    #[must_use]
    pub fn channel_count(&self) -> u8 {
        self.format.as_ref().map_or(0, |f| f.channels)
    }

    #[must_use]
    pub fn profile(&self) -> Option<&str> {
        self.format.as_ref().and_then(|f| f.profile.as_deref())
    }

    /// Current SDP media description of the track, as the engine sees it
    pub fn description(&self) -> Result<String> {
        self.core.ensure_live()?;
        let handle = self.core.handle();
        read_sized(|buf| self.core.engine().track_description(handle, buf))
    }

    /// Payload types the engine registered for `codec` on this track
    pub fn payload_types(&self, codec: &str) -> Result<Vec<u8>> {
        self.core.ensure_live()?;
        self.core
            .engine()
            .track_payload_types(self.core.handle(), codec)
    }

    /// Chain an RTCP receiving session onto the track. Required before key
    /// frames can be requested from the remote sender.
    pub fn install_rtcp_receiving_session(&self) -> Result<()> {
        self.core.ensure_live()?;
        self.core
            .engine()
            .set_rtcp_receiving_session(self.core.handle())
    }

    /// Send a PLI to the remote sender of this track.
    pub fn request_key_frame(&self) -> Result<()> {
        self.core.ensure_live()?;
        trace!(track = %self.core.handle(), "Requesting key frame");
        self.core.engine().request_keyframe(self.core.handle())
    }

    /// Install the key-frame request callback, replacing any previous one,
    /// and chain the engine's PLI handler onto the track.
    pub fn set_on_key_frame_requested<F>(&self, callback: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.install_key_frame_handler(Some(Arc::new(callback)))
    }

    /// Remove the key-frame request callback and unchain the PLI handler.
    pub fn clear_on_key_frame_requested(&self) -> Result<()> {
        self.install_key_frame_handler(None)
    }

    fn install_key_frame_handler(&self, handler: Option<KeyFrameHandler>) -> Result<()> {
        let enabled = handler.is_some();
        *self.on_key_frame_requested.lock() = handler;

        if self.core.is_released() {
            return Ok(());
        }
        debug!(track = %self.core.handle(), enabled, "Chaining PLI handler");
        self.core
            .engine()
            .chain_pli_handler(self.core.handle(), enabled)
    }

    #[must_use]
    pub fn has_key_frame_handler(&self) -> bool {
        self.on_key_frame_requested.lock().is_some()
    }

    pub(crate) fn on_key_frame_requested(&self) {
        let handler = self.on_key_frame_requested.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl RtcChannel for Track {
    fn core(&self) -> &ChannelCore {
        &self.core
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("handle", &self.core.handle())
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("mid", &self.mid)
            .field("direction", &self.direction)
            .field("ssrcs", &self.ssrcs)
            .field("codec", &self.codec())
            .field("open", &self.is_open().get())
            .finish()
    }
}

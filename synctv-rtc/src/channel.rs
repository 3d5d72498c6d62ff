//! Channel entity model
//!
//! Data channels and media tracks share one lifecycle: they open, they may
//! report an error, they carry messages, and they are closed explicitly.
//! [`ChannelCore`] holds that shared state, [`RtcChannel`] exposes it, and
//! [`Channel`] is the element type of a peer connection's entity registry.
//!
//! `last_message` keeps only the most recent inbound payload. A consumer that
//! reads it slower than messages arrive loses the intermediate ones;
//! subscribe to it to observe every message.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::data_channel::DataChannel;
use crate::engine::TransportEngine;
use crate::error::{Error, Result};
use crate::peer::PeerShared;
use crate::publisher::Published;
use crate::track::Track;
use crate::types::ChannelHandle;

pub struct ChannelCore {
    handle: ChannelHandle,
    engine: Arc<dyn TransportEngine>,
    owner: Weak<PeerShared>,
    open: Published<bool>,
    last_error: Published<Option<String>>,
    last_message: Published<Option<Bytes>>,
    released: AtomicBool,
}

impl ChannelCore {
    pub(crate) fn new(
        handle: ChannelHandle,
        engine: Arc<dyn TransportEngine>,
        owner: Weak<PeerShared>,
    ) -> Self {
        Self {
            handle,
            engine,
            owner,
            open: Published::new(false),
            last_error: Published::new(None),
            last_message: Published::new(None),
            released: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    pub(crate) fn engine(&self) -> &Arc<dyn TransportEngine> {
        &self.engine
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            Err(Error::invalid(format!("{} has been released", self.handle)))
        } else {
            Ok(())
        }
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        self.engine.send_message(self.handle, data)
    }

    /// Close the channel on the engine, drop it from the owning peer
    /// connection and release the engine handle. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let closed = self.engine.close_channel(self.handle);
        if let Some(owner) = self.owner.upgrade() {
            owner.forget_channel(self.handle);
        }
        let deleted = self.engine.delete_channel(self.handle);
        self.open.set(false);

        debug!(channel = %self.handle, "Channel closed");
        closed.and(deleted)
    }

    /// Mark as released without touching the engine; used when the owning
    /// connection has already torn the handle down.
    pub(crate) fn detach(&self) {
        if !self.released.swap(true, Ordering::AcqRel) && self.open.get() {
            self.open.set(false);
        }
    }

    pub(crate) fn on_open(&self) {
        self.open.set(true);
    }

    pub(crate) fn on_closed(&self) {
        self.open.set(false);
    }

    pub(crate) fn on_error(&self, message: String) {
        warn!(channel = %self.handle, error = %message, "Channel error");
        self.last_error.set(Some(message));
    }

    pub(crate) fn on_message(&self, data: Bytes) {
        self.last_message.set(Some(data));
    }
}

impl fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCore")
            .field("handle", &self.handle)
            .field("open", &self.open.get())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Behaviour shared by data channels and media tracks
pub trait RtcChannel {
    fn core(&self) -> &ChannelCore;

    fn handle(&self) -> ChannelHandle {
        self.core().handle()
    }

    fn is_open(&self) -> &Published<bool> {
        &self.core().open
    }

    fn last_error(&self) -> &Published<Option<String>> {
        &self.core().last_error
    }

    /// Most recent inbound payload only; see the module docs.
    fn last_message(&self) -> &Published<Option<Bytes>> {
        &self.core().last_message
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        self.core().send(data)
    }

    fn close(&self) -> Result<()> {
        self.core().close()
    }
}

#[derive(Debug, Clone)]
pub enum Channel {
    Data(Arc<DataChannel>),
    Media(Arc<Track>),
}

impl Channel {
    #[must_use]
    pub fn core(&self) -> &ChannelCore {
        match self {
            Self::Data(dc) => dc.core(),
            Self::Media(track) => track.core(),
        }
    }

    #[must_use]
    pub fn handle(&self) -> ChannelHandle {
        self.core().handle()
    }

    #[must_use]
    pub fn as_data_channel(&self) -> Option<&Arc<DataChannel>> {
        match self {
            Self::Data(dc) => Some(dc),
            Self::Media(_) => None,
        }
    }

    #[must_use]
    pub fn as_track(&self) -> Option<&Arc<Track>> {
        match self {
            Self::Media(track) => Some(track),
            Self::Data(_) => None,
        }
    }
}

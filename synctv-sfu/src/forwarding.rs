//! Media Forwarding Unit
//!
//! This module handles:
//! - Creating a send-only egress track on the egress peer that mirrors an
//!   inbound track
//! - Relaying every inbound RTP packet to the egress track with its SSRC and
//!   payload type translated to the egress leg's identifiers
//! - Propagating key frame requests from egress receivers back to the sender
//!
//! Relaying happens synchronously inside the ingress track's message
//! notification. Nothing on that path returns an error: failures are counted
//! and kept as the unit's last error.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use synctv_rtc::{
    Codec, Direction, Error as RtcError, PeerConnection, RtcChannel, Subscription, Track,
    TrackOptions,
};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::rtp;

/// How the egress track of a [`MediaForwardingUnit`] is derived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingOptions {
    /// Prefix for the egress stream and track ids, usually the source peer id
    pub namespace: Option<String>,
    /// Chain key frame requests from egress receivers to the ingress track
    pub propagate_key_frames: bool,
}

impl Default for ForwardingOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            propagate_key_frames: true,
        }
    }
}

/// Snapshot of a forwarding unit's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingStats {
    pub forwarded: u64,
    /// Packets dropped because the egress track was not open
    pub dropped_closed: u64,
    /// Packets dropped because the unit failed to resolve its egress identifiers
    pub dropped_failed: u64,
    pub send_failures: u64,
    pub ssrc: Option<u32>,
    pub payload_type: Option<u8>,
    pub failed: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Egress {
    Unresolved,
    Resolved { ssrc: u32, payload_type: u8 },
    Failed,
}

/// State shared with the ingress subscription
struct Relay {
    egress: Arc<Track>,
    codec: Codec,
    resolved: Mutex<Egress>,
    forwarded: AtomicU64,
    dropped_closed: AtomicU64,
    dropped_failed: AtomicU64,
    send_failures: AtomicU64,
    last_error: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl Relay {
    fn new(egress: Arc<Track>, codec: Codec) -> Self {
        Self {
            egress,
            codec,
            resolved: Mutex::new(Egress::Unresolved),
            forwarded: AtomicU64::new(0),
            dropped_closed: AtomicU64::new(0),
            dropped_failed: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock() = Some((message, Utc::now()));
    }

    fn resolve(&self) -> std::result::Result<(u32, u8), RtcError> {
        let ssrc = self
            .egress
            .ssrc()
            .ok_or_else(|| RtcError::invalid("egress track has no SSRC"))?;
        let payload_type = self
            .egress
            .payload_types(self.codec.name())?
            .first()
            .copied()
            .ok_or_else(|| {
                RtcError::invalid(format!(
                    "no payload type registered for {} on egress track",
                    self.codec
                ))
            })?;
        Ok((ssrc, payload_type))
    }

    fn egress_identifiers(&self) -> Option<(u32, u8)> {
        let mut resolved = self.resolved.lock();
        match *resolved {
            Egress::Resolved { ssrc, payload_type } => Some((ssrc, payload_type)),
            Egress::Failed => None,
            Egress::Unresolved => match self.resolve() {
                Ok((ssrc, payload_type)) => {
                    debug!(
                        track = %self.egress.handle(),
                        ssrc,
                        payload_type,
                        "Resolved egress RTP identifiers"
                    );
                    *resolved = Egress::Resolved { ssrc, payload_type };
                    Some((ssrc, payload_type))
                }
                Err(e) => {
                    warn!(track = %self.egress.handle(), error = %e, "Forwarding unit failed");
                    *resolved = Egress::Failed;
                    self.record_error(e.to_string());
                    None
                }
            },
        }
    }

    fn forward(&self, data: &Bytes) {
        if !self.egress.is_open().get() {
            self.dropped_closed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some((ssrc, payload_type)) = self.egress_identifiers() else {
            self.dropped_failed.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let mut packet = BytesMut::from(&data[..]);
        rtp::rewrite_header(&mut packet, ssrc, payload_type);

        match self.egress.send(&packet) {
            Ok(()) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                debug!(track = %self.egress.handle(), error = %e, "Failed to forward packet");
                self.record_error(e.to_string());
            }
        }
    }

    fn stats(&self) -> ForwardingStats {
        let (ssrc, payload_type, failed) = match *self.resolved.lock() {
            Egress::Resolved { ssrc, payload_type } => (Some(ssrc), Some(payload_type), false),
            Egress::Unresolved => (None, None, false),
            Egress::Failed => (None, None, true),
        };
        let (last_error, last_error_at) = self
            .last_error
            .lock()
            .clone()
            .map_or((None, None), |(message, at)| (Some(message), Some(at)));

        ForwardingStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped_closed: self.dropped_closed.load(Ordering::Relaxed),
            dropped_failed: self.dropped_failed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            ssrc,
            payload_type,
            failed,
            last_error,
            last_error_at,
        }
    }
}

/// Relays one inbound track to a send-only track on another peer connection.
///
/// The ingress track stays owned by its peer connection; the unit only keeps
/// a weak reference to it. The egress track lives on after [`stop`](Self::stop)
/// and is closed by the caller, if at all.
pub struct MediaForwardingUnit {
    ingress: Weak<Track>,
    relay: Arc<Relay>,
    subscription: Mutex<Option<Subscription>>,
    stopped: AtomicBool,
}

impl MediaForwardingUnit {
    /// Wire `ingress` to a new egress track on `egress_peer`.
    ///
    /// Fails if the ingress track has no negotiated codec or if the egress
    /// peer cannot take a new track right now (closed, or mid-negotiation).
    pub fn new(
        ingress: &Arc<Track>,
        egress_peer: &PeerConnection,
        options: &ForwardingOptions,
    ) -> Result<Self> {
        ingress.install_rtcp_receiving_session()?;

        let codec = ingress.codec().ok_or_else(|| {
            RtcError::invalid(format!("track {} has no negotiated codec", ingress.handle()))
        })?;

        let (stream_id, track_id) = match &options.namespace {
            Some(ns) => (
                format!("{ns}-{}", ingress.stream_id()),
                format!("{ns}-{}", ingress.track_id()),
            ),
            None => (ingress.stream_id().to_string(), ingress.track_id().to_string()),
        };

        let mut track_options = TrackOptions::new(stream_id, track_id, Direction::SendOnly, codec)
            .with_channel_count(ingress.channel_count());
        if let Some(clock_rate) = ingress.clock_rate() {
            track_options = track_options.with_clock_rate(clock_rate);
        }
        if let Some(profile) = ingress.profile() {
            track_options = track_options.with_profile(profile);
        }

        let egress = egress_peer.create_track(track_options)?;
        egress.install_rtcp_receiving_session()?;

        if options.propagate_key_frames {
            let upstream = Arc::downgrade(ingress);
            egress.set_on_key_frame_requested(move || {
                let Some(ingress) = upstream.upgrade() else {
                    return;
                };
                if let Err(e) = ingress.request_key_frame() {
                    debug!(track = %ingress.handle(), error = %e, "Key frame request not relayed");
                }
            })?;
        }

        let relay = Arc::new(Relay::new(Arc::clone(&egress), codec));
        let subscription = {
            let relay = Arc::clone(&relay);
            ingress.last_message().subscribe(move |message| {
                if let Some(data) = message {
                    relay.forward(data);
                }
            })
        };

        info!(
            ingress = %ingress.handle(),
            egress = %egress.handle(),
            egress_peer = %egress_peer.id(),
            codec = %codec,
            "Forwarding unit started"
        );

        Ok(Self {
            ingress: Arc::downgrade(ingress),
            relay,
            subscription: Mutex::new(Some(subscription)),
            stopped: AtomicBool::new(false),
        })
    }

    /// `None` once the ingress peer connection dropped the track
    #[must_use]
    pub fn ingress(&self) -> Option<Arc<Track>> {
        self.ingress.upgrade()
    }

    #[must_use]
    pub fn egress(&self) -> &Arc<Track> {
        &self.relay.egress
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> ForwardingStats {
        self.relay.stats()
    }

    /// Stop relaying packets and key frame requests. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        drop(self.subscription.lock().take());

        let egress = &self.relay.egress;
        if egress.has_key_frame_handler() {
            if let Err(e) = egress.clear_on_key_frame_requested() {
                debug!(track = %egress.handle(), error = %e, "Failed to unchain key frame handler");
            }
        }

        info!(egress = %egress.handle(), "Forwarding unit stopped");
    }
}

impl Drop for MediaForwardingUnit {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for MediaForwardingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaForwardingUnit")
            .field("egress", &self.relay.egress.handle())
            .field("codec", &self.relay.codec)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synctv_rtc::{LoopbackEngine, PeerConfig, TransportEngine};

    fn peer(engine: &Arc<dyn TransportEngine>) -> PeerConnection {
        PeerConnection::new(Arc::clone(engine), PeerConfig::default()).unwrap()
    }

    #[test]
    fn test_egress_mirrors_ingress_format() {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        let source = peer(&engine);
        let target = peer(&engine);
        let ingress = source
            .create_track(
                TrackOptions::new("screen", "v", Direction::SendRecv, Codec::H264)
                    .with_profile("packetization-mode=1"),
            )
            .unwrap();

        let options = ForwardingOptions {
            namespace: Some("alice".to_string()),
            propagate_key_frames: true,
        };
        let unit = MediaForwardingUnit::new(&ingress, &target, &options).unwrap();
        let egress = unit.egress();

        assert_eq!(egress.stream_id(), "alice-screen");
        assert_eq!(egress.track_id(), "alice-v");
        assert_eq!(egress.mid(), "alice-v");
        assert_eq!(egress.direction(), Direction::SendOnly);
        assert_eq!(egress.codec(), Some(Codec::H264));
        assert_eq!(egress.clock_rate(), Some(90_000));
        assert_eq!(egress.profile(), Some("packetization-mode=1"));
        assert!(egress.has_key_frame_handler());
        assert_eq!(unit.stats(), ForwardingStats::default());
    }

    #[test]
    fn test_stop_is_idempotent_and_unchains() {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        let source = peer(&engine);
        let target = peer(&engine);
        let ingress = source
            .create_track(TrackOptions::new("s", "a", Direction::SendRecv, Codec::Opus))
            .unwrap();

        let options = ForwardingOptions {
            namespace: None,
            propagate_key_frames: true,
        };
        let unit = MediaForwardingUnit::new(&ingress, &target, &options).unwrap();
        assert_eq!(ingress.last_message().subscriber_count(), 1);

        unit.stop();
        unit.stop();
        assert!(unit.is_stopped());
        assert_eq!(ingress.last_message().subscriber_count(), 0);
        assert!(!unit.egress().has_key_frame_handler());
        assert_eq!(target.tracks().len(), 1);
    }

    #[test]
    fn test_packets_dropped_while_egress_closed() {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        let source = peer(&engine);
        let target = peer(&engine);
        let ingress = source
            .create_track(TrackOptions::new("s", "a", Direction::SendRecv, Codec::Opus))
            .unwrap();
        let unit =
            MediaForwardingUnit::new(&ingress, &target, &ForwardingOptions::default()).unwrap();

        // Simulate inbound packets on a track whose egress never opened.
        ingress
            .last_message()
            .set(Some(Bytes::from_static(&[0x80, 111, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1])));
        ingress
            .last_message()
            .set(Some(Bytes::from_static(&[0x80, 111, 0, 2, 0, 0, 0, 0, 0, 0, 0, 1])));

        let stats = unit.stats();
        assert_eq!(stats.dropped_closed, 2);
        assert_eq!(stats.forwarded, 0);
        assert_eq!(stats.ssrc, None);
        assert!(!stats.failed);
    }

    #[test]
    fn test_released_ingress_is_rejected() {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        let target = peer(&engine);
        let source = peer(&engine);
        let ingress = source
            .create_track(TrackOptions::new("s", "a", Direction::SendRecv, Codec::Opus))
            .unwrap();
        source.close();

        // A released ingress track can no longer install its RTCP session.
        let result = MediaForwardingUnit::new(&ingress, &target, &ForwardingOptions::default());
        assert!(result.is_err());
        assert!(target.tracks().is_empty());
    }

    #[test]
    fn test_default_options_chain_key_frames() {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        let source = peer(&engine);
        let target = peer(&engine);
        let ingress = source
            .create_track(TrackOptions::new("s", "v", Direction::SendRecv, Codec::VP8))
            .unwrap();

        let options = ForwardingOptions::default();
        assert!(options.propagate_key_frames);
        let unit = MediaForwardingUnit::new(&ingress, &target, &options).unwrap();
        assert!(unit.egress().has_key_frame_handler());

        let opted_out = ForwardingOptions {
            namespace: Some("x".to_string()),
            propagate_key_frames: false,
        };
        let unit = MediaForwardingUnit::new(&ingress, &target, &opted_out).unwrap();
        assert!(!unit.egress().has_key_frame_handler());
    }
}

//! In-process transport engine
//!
//! [`LoopbackEngine`] connects peer connections created on the same engine
//! instance to each other without touching the network. It produces real SDP,
//! runs the signaling state machine, gathers one host candidate per
//! connection and pairs data channels and tracks once both ends have
//! exchanged descriptions. Messages and RTP packets are handed to the paired
//! channel on the receiving connection's event thread.
//!
//! Endpoints find each other through the `a=ice-ufrag` of the remote
//! description, so descriptions must be exchanged between connections of the
//! same engine.

mod describe;
mod network;

use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use self::describe::{mids, parse_remote, render_session, render_track};
use self::network::{ChannelKind, Connection, DataEntry, Network, TrackEntry};
use crate::engine::{
    fill_sized, DataChannelInit, EngineConfig, EngineEvent, EventSink, TrackInit, TransportEngine,
};
use crate::error::{Error, Result};
use crate::sdp::RtpMap;
use crate::types::{
    ChannelHandle, ConnectionHandle, ConnectionState, Direction, GatheringState, IceState,
    SdpType, SignalingState,
};

const ICE_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

const DEFAULT_HOST: &str = "127.0.0.1";
const EPHEMERAL_PORT_BASE: u32 = 49_152;
const EPHEMERAL_PORT_COUNT: u32 = 16_384;

pub struct LoopbackEngine {
    network: Mutex<Network>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::with_host_address(DEFAULT_HOST)
    }

    /// Engine whose descriptions and candidates advertise `host`
    #[must_use]
    pub fn with_host_address(host: impl Into<String>) -> Self {
        Self {
            network: Mutex::new(Network::new(host.into())),
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.network.lock().connections.len()
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.network.lock().channels.len()
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoopbackEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let network = self.network.lock();
        f.debug_struct("LoopbackEngine")
            .field("host", &network.host())
            .field("connections", &network.connections.len())
            .field("channels", &network.channels.len())
            .finish()
    }
}

fn port_for(config: &EngineConfig, handle: u32) -> u16 {
    let port = match config.port_range {
        Some(range) if range.end >= range.begin => {
            let span = u32::from(range.end - range.begin) + 1;
            u32::from(range.begin) + handle % span
        }
        _ => EPHEMERAL_PORT_BASE + handle % EPHEMERAL_PORT_COUNT,
    };
    u16::try_from(port).unwrap_or(u16::MAX)
}

fn spawn_dispatcher(pc: ConnectionHandle, sink: EventSink) -> Result<mpsc::UnboundedSender<EngineEvent>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
    std::thread::Builder::new()
        .name(format!("loopback-{pc}"))
        .spawn(move || {
            while let Some(event) = rx.blocking_recv() {
                sink(event);
            }
            trace!(pc = %pc, "Event dispatcher stopped");
        })
        .map_err(|e| Error::failure(format!("failed to spawn event thread: {e}")))?;
    Ok(tx)
}

impl TransportEngine for LoopbackEngine {
    fn create_connection(&self, config: &EngineConfig, sink: EventSink) -> Result<ConnectionHandle> {
        let mut net = self.network.lock();
        let pc = ConnectionHandle(net.allocate_handle());

        let ufrag = loop {
            let candidate = nanoid::nanoid!(8, &ICE_ALPHABET);
            if !net.endpoints.contains_key(&candidate) {
                break candidate;
            }
        };
        let events = spawn_dispatcher(pc, sink)?;

        let connection = Connection {
            ufrag: ufrag.clone(),
            pwd: nanoid::nanoid!(24, &ICE_ALPHABET),
            cname: nanoid::nanoid!(16),
            session_id: u64::from(rand::thread_rng().gen::<u32>()),
            version: 0,
            port: port_for(config, pc.0),
            events,
            state: ConnectionState::New,
            ice: IceState::New,
            gathering: GatheringState::New,
            signaling: SignalingState::Stable,
            local: None,
            remote: None,
            local_candidate: None,
            remote_candidates: Vec::new(),
            channels: Vec::new(),
            peer: None,
            closed: false,
        };
        net.endpoints.insert(ufrag, pc);
        net.connections.insert(pc, connection);
        debug!(pc = %pc, "Loopback connection created");
        Ok(pc)
    }

    fn close_connection(&self, pc: ConnectionHandle) -> Result<()> {
        self.network.lock().close_connection(pc)
    }

    fn delete_connection(&self, pc: ConnectionHandle) -> Result<()> {
        self.network.lock().delete_connection(pc)
    }

    fn create_offer(&self, pc: ConnectionHandle, buf: &mut [u8]) -> Result<usize> {
        let net = self.network.lock();
        let sdp = render_session(&net, pc, SdpType::Offer)?;
        fill_sized(&sdp, buf)
    }

    fn create_answer(&self, pc: ConnectionHandle, buf: &mut [u8]) -> Result<usize> {
        let net = self.network.lock();
        if net.connection(pc)?.remote.is_none() {
            return Err(Error::ElementNotAvailable(
                "no remote description to answer".to_string(),
            ));
        }
        let sdp = render_session(&net, pc, SdpType::Answer)?;
        fill_sized(&sdp, buf)
    }

    fn set_local_description(&self, pc: ConnectionHandle, sdp_type: SdpType) -> Result<()> {
        let mut net = self.network.lock();
        let conn = net.live_connection_mut(pc)?;

        let resolved = match sdp_type {
            SdpType::Unspecified => match conn.signaling {
                SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer => {
                    SdpType::Answer
                }
                _ => SdpType::Offer,
            },
            other => other,
        };
        let next = match (resolved, conn.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (
                SdpType::Answer,
                SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer,
            ) => SignalingState::Stable,
            (
                SdpType::PrAnswer,
                SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer,
            ) => SignalingState::HaveLocalPrAnswer,
            (SdpType::Rollback, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, state) => {
                return Err(Error::failure(format!(
                    "cannot apply local {kind} in signaling state {state:?}"
                )))
            }
        };

        conn.set_signaling(next);
        if resolved == SdpType::Rollback {
            return Ok(());
        }
        conn.local = Some(resolved);
        conn.version += 1;

        if conn.gathering != GatheringState::Complete {
            conn.set_gathering(GatheringState::InProgress);
            let candidate = format!(
                "candidate:1 1 UDP 2122317823 {} {} typ host",
                net.host(),
                net.connection(pc)?.port
            );
            let mid = mids(&net, pc).into_iter().next();
            let conn = net.connection_mut(pc)?;
            conn.local_candidate = Some(candidate.clone());
            conn.emit(EngineEvent::LocalCandidate { candidate, mid });
            conn.set_gathering(GatheringState::Complete);
        }

        let sdp = render_session(&net, pc, resolved)?;
        net.emit(
            pc,
            EngineEvent::LocalDescription {
                sdp,
                sdp_type: resolved,
            },
        );
        net.settle(pc);
        Ok(())
    }

    fn signaling_state(&self, pc: ConnectionHandle) -> Result<SignalingState> {
        Ok(self.network.lock().connection(pc)?.signaling)
    }

    fn set_remote_description(&self, pc: ConnectionHandle, sdp: &str, sdp_type: SdpType) -> Result<()> {
        let remote = parse_remote(sdp)?;
        let mut net = self.network.lock();
        let conn = net.live_connection_mut(pc)?;
        if remote.ufrag == conn.ufrag {
            return Err(Error::invalid("remote description is this connection's own"));
        }

        let resolved = match sdp_type {
            SdpType::Unspecified => match conn.signaling {
                SignalingState::HaveLocalOffer | SignalingState::HaveRemotePrAnswer => {
                    SdpType::Answer
                }
                _ => SdpType::Offer,
            },
            other => other,
        };
        let next = match (resolved, conn.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveRemoteOffer
            }
            (
                SdpType::Answer,
                SignalingState::HaveLocalOffer | SignalingState::HaveRemotePrAnswer,
            ) => SignalingState::Stable,
            (
                SdpType::PrAnswer,
                SignalingState::HaveLocalOffer | SignalingState::HaveRemotePrAnswer,
            ) => SignalingState::HaveRemotePrAnswer,
            (SdpType::Rollback, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, state) => {
                return Err(Error::failure(format!(
                    "cannot apply remote {kind} in signaling state {state:?}"
                )))
            }
        };

        conn.set_signaling(next);
        if resolved == SdpType::Rollback {
            return Ok(());
        }
        conn.remote = Some(remote);

        net.adopt_remote_media(pc)?;
        net.settle(pc);
        Ok(())
    }

    fn add_remote_candidate(&self, pc: ConnectionHandle, candidate: &str, mid: Option<&str>) -> Result<()> {
        let candidate = candidate.trim();
        let candidate = candidate.strip_prefix("a=").unwrap_or(candidate);
        if !candidate.starts_with("candidate:") {
            return Err(Error::invalid(format!("malformed candidate {candidate:?}")));
        }

        let mut net = self.network.lock();
        let conn = net.live_connection_mut(pc)?;
        if conn.remote.is_none() {
            return Err(Error::failure("remote candidate before remote description"));
        }
        trace!(pc = %pc, candidate, mid = ?mid, "Remote candidate added");
        conn.remote_candidates.push(candidate.to_string());
        net.settle(pc);
        Ok(())
    }

    fn create_data_channel(
        &self,
        pc: ConnectionHandle,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<ChannelHandle> {
        let mut net = self.network.lock();
        net.live_connection_mut(pc)?;

        let stream_id = match init.stream_id {
            Some(id) => id,
            None if init.negotiated => {
                return Err(Error::invalid("negotiated data channel without stream id"))
            }
            None => net.allocate_stream_id(),
        };
        let taken = net.live_channels(pc).any(|(_, entry)| {
            matches!(&entry.kind, ChannelKind::Data(d) if d.stream_id == stream_id)
        });
        if taken {
            return Err(Error::invalid(format!("stream id {stream_id} already in use")));
        }

        net.add_channel(
            pc,
            ChannelKind::Data(DataEntry {
                label: label.to_string(),
                stream_id,
                negotiated: init.negotiated,
            }),
        )
    }

    fn create_track(&self, pc: ConnectionHandle, init: &TrackInit) -> Result<ChannelHandle> {
        let mut net = self.network.lock();
        let cname = net.live_connection_mut(pc)?.cname.clone();

        let existing = net.live_channels(pc).find_map(|(h, entry)| match &entry.kind {
            ChannelKind::Track(track) if track.mid == init.mid => Some((h, track.direction)),
            _ => None,
        });
        if let Some((handle, direction)) = existing {
            if direction == init.direction {
                return Ok(handle);
            }
            return Err(Error::invalid(format!("mid {} already in use", init.mid)));
        }

        let entry = TrackEntry {
            kind: init.codec.media_kind().to_string(),
            mid: init.mid.clone(),
            msid: Some((init.stream_id.clone(), init.track_id.clone())),
            direction: init.direction,
            formats: vec![RtpMap {
                payload_type: init.payload_type,
                encoding: init.codec.name().to_string(),
                clock_rate: init.clock_rate,
                channels: init.channel_count,
                profile: init.profile.clone(),
            }],
            ssrcs: vec![init.ssrc],
            cname: Some(cname),
            rtcp_session: false,
            pli_chained: false,
        };
        net.add_channel(pc, ChannelKind::Track(entry))
    }

    fn send_message(&self, ch: ChannelHandle, data: &[u8]) -> Result<()> {
        self.network.lock().deliver(ch, data)
    }

    fn close_channel(&self, ch: ChannelHandle) -> Result<()> {
        self.network.lock().close_channel(ch)
    }

    fn delete_channel(&self, ch: ChannelHandle) -> Result<()> {
        self.network.lock().delete_channel(ch)
    }

    fn data_channel_stream(&self, ch: ChannelHandle) -> Result<u16> {
        Ok(self.network.lock().channel(ch)?.data()?.stream_id)
    }

    fn data_channel_label(&self, ch: ChannelHandle, buf: &mut [u8]) -> Result<usize> {
        let net = self.network.lock();
        fill_sized(&net.channel(ch)?.data()?.label, buf)
    }

    fn track_description(&self, ch: ChannelHandle, buf: &mut [u8]) -> Result<usize> {
        let net = self.network.lock();
        let track = net.channel(ch)?.track()?;
        fill_sized(&render_track(track, net.host()), buf)
    }

    fn track_mid(&self, ch: ChannelHandle, buf: &mut [u8]) -> Result<usize> {
        let net = self.network.lock();
        fill_sized(&net.channel(ch)?.track()?.mid, buf)
    }

    fn track_direction(&self, ch: ChannelHandle) -> Result<Direction> {
        Ok(self.network.lock().channel(ch)?.track()?.direction)
    }

    fn track_ssrcs(&self, ch: ChannelHandle) -> Result<Vec<u32>> {
        Ok(self.network.lock().channel(ch)?.track()?.ssrcs.clone())
    }

    fn track_payload_types(&self, ch: ChannelHandle, codec: &str) -> Result<Vec<u8>> {
        let net = self.network.lock();
        let track = net.channel(ch)?.track()?;
        Ok(track
            .formats
            .iter()
            .filter(|f| f.encoding.eq_ignore_ascii_case(codec))
            .map(|f| f.payload_type)
            .collect())
    }

    fn set_rtcp_receiving_session(&self, ch: ChannelHandle) -> Result<()> {
        self.network.lock().channel_mut(ch)?.track_mut()?.rtcp_session = true;
        Ok(())
    }

    fn chain_pli_handler(&self, ch: ChannelHandle, enabled: bool) -> Result<()> {
        self.network.lock().channel_mut(ch)?.track_mut()?.pli_chained = enabled;
        Ok(())
    }

    fn request_keyframe(&self, ch: ChannelHandle) -> Result<()> {
        self.network.lock().request_keyframe(ch)
    }
}

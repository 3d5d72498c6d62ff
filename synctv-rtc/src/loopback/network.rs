//! Shared state of every endpoint attached to one loopback engine

use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::describe::RemoteSession;
use crate::engine::EngineEvent;
use crate::error::{Error, Result};
use crate::sdp::RtpMap;
use crate::types::{
    ChannelHandle, ConnectionHandle, ConnectionState, Direction, GatheringState, IceState,
    SdpType, SignalingState,
};

pub(super) struct Connection {
    pub ufrag: String,
    pub pwd: String,
    pub cname: String,
    pub session_id: u64,
    pub version: u64,
    pub port: u16,
    pub events: mpsc::UnboundedSender<EngineEvent>,

    pub state: ConnectionState,
    pub ice: IceState,
    pub gathering: GatheringState,
    pub signaling: SignalingState,

    /// Type of the last local description applied
    pub local: Option<SdpType>,
    pub remote: Option<RemoteSession>,
    pub local_candidate: Option<String>,
    pub remote_candidates: Vec<String>,
    /// Creation order
    pub channels: Vec<ChannelHandle>,
    /// The endpoint this one is connected to
    pub peer: Option<ConnectionHandle>,
    pub closed: bool,
}

impl Connection {
    pub fn emit(&self, event: EngineEvent) {
        // The receiving thread is gone only after the connection is deleted.
        let _ = self.events.send(event);
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.emit(EngineEvent::StateChange(state));
        }
    }

    pub fn set_ice(&mut self, ice: IceState) {
        if self.ice != ice {
            self.ice = ice;
            self.emit(EngineEvent::IceStateChange(ice));
        }
    }

    pub fn set_gathering(&mut self, gathering: GatheringState) {
        if self.gathering != gathering {
            self.gathering = gathering;
            self.emit(EngineEvent::GatheringStateChange(gathering));
        }
    }

    pub fn set_signaling(&mut self, signaling: SignalingState) {
        if self.signaling != signaling {
            self.signaling = signaling;
            self.emit(EngineEvent::SignalingStateChange(signaling));
        }
    }

    /// Negotiation finished and at least one remote candidate is known
    fn is_settled(&self) -> bool {
        let has_candidates = !self.remote_candidates.is_empty()
            || self.remote.as_ref().is_some_and(|r| !r.candidates.is_empty());
        !self.closed
            && self.signaling == SignalingState::Stable
            && self.local.is_some()
            && has_candidates
    }
}

#[derive(Debug, Clone)]
pub(super) struct DataEntry {
    pub label: String,
    pub stream_id: u16,
    pub negotiated: bool,
}

#[derive(Debug, Clone)]
pub(super) struct TrackEntry {
    /// `audio` or `video`
    pub kind: String,
    pub mid: String,
    pub msid: Option<(String, String)>,
    pub direction: Direction,
    pub formats: Vec<RtpMap>,
    pub ssrcs: Vec<u32>,
    pub cname: Option<String>,
    pub rtcp_session: bool,
    pub pli_chained: bool,
}

#[derive(Debug, Clone)]
pub(super) enum ChannelKind {
    Data(DataEntry),
    Track(TrackEntry),
}

#[derive(Debug)]
pub(super) struct ChannelEntry {
    pub pc: ConnectionHandle,
    pub kind: ChannelKind,
    pub open: bool,
    pub closed: bool,
    /// The channel on the connected endpoint this one is paired with
    pub peer: Option<ChannelHandle>,
}

impl ChannelEntry {
    pub fn data(&self) -> Result<&DataEntry> {
        match &self.kind {
            ChannelKind::Data(data) => Ok(data),
            ChannelKind::Track(_) => Err(Error::invalid("handle is a track, not a data channel")),
        }
    }

    pub fn track(&self) -> Result<&TrackEntry> {
        match &self.kind {
            ChannelKind::Track(track) => Ok(track),
            ChannelKind::Data(_) => Err(Error::invalid("handle is a data channel, not a track")),
        }
    }

    pub fn track_mut(&mut self) -> Result<&mut TrackEntry> {
        match &mut self.kind {
            ChannelKind::Track(track) => Ok(track),
            ChannelKind::Data(_) => Err(Error::invalid("handle is a data channel, not a track")),
        }
    }
}

pub(super) struct Network {
    host: String,
    next_handle: u32,
    next_stream_id: u16,
    pub connections: HashMap<ConnectionHandle, Connection>,
    pub channels: HashMap<ChannelHandle, ChannelEntry>,
    /// ICE username fragment to connection
    pub endpoints: HashMap<String, ConnectionHandle>,
}

impl Network {
    pub fn new(host: String) -> Self {
        Self {
            host,
            next_handle: 1,
            next_stream_id: 1024,
            connections: HashMap::new(),
            channels: HashMap::new(),
            endpoints: HashMap::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn allocate_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    pub fn allocate_stream_id(&mut self) -> u16 {
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1).max(1024);
        id
    }

    pub fn connection(&self, pc: ConnectionHandle) -> Result<&Connection> {
        self.connections
            .get(&pc)
            .ok_or_else(|| Error::invalid(format!("unknown connection {pc}")))
    }

    pub fn connection_mut(&mut self, pc: ConnectionHandle) -> Result<&mut Connection> {
        self.connections
            .get_mut(&pc)
            .ok_or_else(|| Error::invalid(format!("unknown connection {pc}")))
    }

    /// An open (not closed) connection
    pub fn live_connection_mut(&mut self, pc: ConnectionHandle) -> Result<&mut Connection> {
        let conn = self.connection_mut(pc)?;
        if conn.closed {
            return Err(Error::invalid(format!("connection {pc} is closed")));
        }
        Ok(conn)
    }

    pub fn channel(&self, ch: ChannelHandle) -> Result<&ChannelEntry> {
        self.channels
            .get(&ch)
            .ok_or_else(|| Error::invalid(format!("unknown channel {ch}")))
    }

    pub fn channel_mut(&mut self, ch: ChannelHandle) -> Result<&mut ChannelEntry> {
        self.channels
            .get_mut(&ch)
            .ok_or_else(|| Error::invalid(format!("unknown channel {ch}")))
    }

    /// Channels of `pc` that are not closed, in creation order
    pub fn live_channels(
        &self,
        pc: ConnectionHandle,
    ) -> impl Iterator<Item = (ChannelHandle, &ChannelEntry)> {
        self.connections
            .get(&pc)
            .map(|conn| conn.channels.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|h| self.channels.get(h).map(|entry| (*h, entry)))
            .filter(|(_, entry)| !entry.closed)
    }

    pub fn emit(&self, pc: ConnectionHandle, event: EngineEvent) {
        if let Some(conn) = self.connections.get(&pc) {
            conn.emit(event);
        }
    }

    pub fn add_channel(&mut self, pc: ConnectionHandle, kind: ChannelKind) -> Result<ChannelHandle> {
        self.live_connection_mut(pc)?;
        let handle = ChannelHandle(self.allocate_handle());
        self.channels.insert(
            handle,
            ChannelEntry {
                pc,
                kind,
                open: false,
                closed: false,
                peer: None,
            },
        );
        if let Some(conn) = self.connections.get_mut(&pc) {
            conn.channels.push(handle);
        }
        Ok(handle)
    }

    /// Create inbound tracks for remote media sections whose mid is unknown
    /// locally.
    pub fn adopt_remote_media(&mut self, pc: ConnectionHandle) -> Result<()> {
        let media = match &self.connection(pc)?.remote {
            Some(remote) => remote.media.clone(),
            None => return Ok(()),
        };

        for remote in media {
            let known = self.live_channels(pc).any(|(_, entry)| {
                matches!(&entry.kind, ChannelKind::Track(track) if track.mid == remote.mid)
            });
            if known {
                continue;
            }

            let direction = remote.direction.unwrap_or(Direction::SendRecv).reversed();
            let entry = TrackEntry {
                kind: remote.kind.clone(),
                mid: remote.mid.clone(),
                msid: remote.msid.clone(),
                direction,
                formats: remote.formats.clone(),
                ssrcs: remote.ssrcs.clone(),
                cname: None,
                rtcp_session: false,
                pli_chained: false,
            };
            let handle = self.add_channel(pc, ChannelKind::Track(entry))?;
            debug!(pc = %pc, channel = %handle, mid = %remote.mid, "Remote track negotiated");
            self.emit(pc, EngineEvent::Track(handle));
        }
        Ok(())
    }

    /// The endpoint `pc` can connect to, if both sides finished negotiating
    /// with each other.
    fn counterpart(&self, pc: ConnectionHandle) -> Option<ConnectionHandle> {
        let conn = self.connections.get(&pc)?;
        if !conn.is_settled() {
            return None;
        }
        let other_pc = *self.endpoints.get(&conn.remote.as_ref()?.ufrag)?;
        let other = self.connections.get(&other_pc)?;
        let mutual = other
            .remote
            .as_ref()
            .is_some_and(|remote| remote.ufrag == conn.ufrag);
        (other_pc != pc && other.is_settled() && mutual).then_some(other_pc)
    }

    /// Connect `pc` to its counterpart once negotiation is complete on both
    /// sides, then pair and open every channel not yet open.
    pub fn settle(&mut self, pc: ConnectionHandle) {
        let Some(other) = self.counterpart(pc) else {
            return;
        };

        let linked = self.connections.get(&pc).and_then(|c| c.peer) == Some(other);
        if !linked {
            let busy = [pc, other]
                .iter()
                .any(|h| self.connections.get(h).is_some_and(|c| c.peer.is_some()));
            if busy {
                return;
            }

            for (this, that) in [(pc, other), (other, pc)] {
                if let Some(conn) = self.connections.get_mut(&this) {
                    conn.peer = Some(that);
                    conn.set_state(ConnectionState::Connecting);
                    conn.set_ice(IceState::Checking);
                    conn.set_ice(IceState::Connected);
                    conn.set_state(ConnectionState::Connected);
                }
            }
            debug!(pc = %pc, remote = %other, "Endpoints connected");
        }

        self.pair_channels(pc, other);
        self.pair_channels(other, pc);
        for side in [pc, other] {
            self.open_pending(side);
        }
    }

    fn pair_channels(&mut self, from: ConnectionHandle, to: ConnectionHandle) {
        let pending: Vec<(ChannelHandle, ChannelKind)> = self
            .live_channels(from)
            .filter(|(_, entry)| entry.peer.is_none())
            .map(|(h, entry)| (h, entry.kind.clone()))
            .collect();

        for (handle, kind) in pending {
            let partner = match &kind {
                ChannelKind::Data(data) if data.negotiated => {
                    self.find_unpaired(to, |other| {
                        matches!(other, ChannelKind::Data(d) if d.negotiated && d.stream_id == data.stream_id)
                    })
                }
                ChannelKind::Data(data) => {
                    let announced = ChannelKind::Data(data.clone());
                    match self.add_channel(to, announced) {
                        Ok(h) => {
                            self.emit(to, EngineEvent::DataChannel(h));
                            Some(h)
                        }
                        Err(_) => None,
                    }
                }
                ChannelKind::Track(track) => self.find_unpaired(to, |other| {
                    matches!(other, ChannelKind::Track(t) if t.mid == track.mid)
                }),
            };

            if let Some(partner) = partner {
                trace!(channel = %handle, peer_channel = %partner, "Channels paired");
                if let Some(entry) = self.channels.get_mut(&handle) {
                    entry.peer = Some(partner);
                }
                if let Some(entry) = self.channels.get_mut(&partner) {
                    entry.peer = Some(handle);
                }
            }
        }
    }

    fn find_unpaired(
        &self,
        pc: ConnectionHandle,
        matches: impl Fn(&ChannelKind) -> bool,
    ) -> Option<ChannelHandle> {
        self.live_channels(pc)
            .find(|(_, entry)| entry.peer.is_none() && matches(&entry.kind))
            .map(|(h, _)| h)
    }

    fn open_pending(&mut self, pc: ConnectionHandle) {
        let pending: Vec<ChannelHandle> = self
            .live_channels(pc)
            .filter(|(_, entry)| !entry.open)
            .map(|(h, _)| h)
            .collect();
        for handle in pending {
            if let Some(entry) = self.channels.get_mut(&handle) {
                entry.open = true;
            }
            self.emit(pc, EngineEvent::Open(handle));
        }
    }

    /// Deliver `data` from `ch` to its paired channel.
    pub fn deliver(&self, ch: ChannelHandle, data: &[u8]) -> Result<()> {
        let entry = self.channel(ch)?;
        if entry.closed {
            return Err(Error::invalid(format!("channel {ch} is closed")));
        }
        if !entry.open {
            return Err(Error::failure(format!("channel {ch} is not open")));
        }
        if let ChannelKind::Track(track) = &entry.kind {
            if !track.direction.can_send() {
                return Err(Error::failure(format!(
                    "track {} is {} and cannot send",
                    track.mid,
                    track.direction.as_sdp()
                )));
            }
        }

        if let Some(peer) = entry.peer {
            match self.channels.get(&peer) {
                Some(peer_entry) if peer_entry.open => self.emit(
                    peer_entry.pc,
                    EngineEvent::Message(peer, Bytes::copy_from_slice(data)),
                ),
                _ => trace!(channel = %ch, "Dropping message for closed peer channel"),
            }
        }
        Ok(())
    }

    /// Forward a PLI from the receiving track `ch` to the paired sender.
    pub fn request_keyframe(&self, ch: ChannelHandle) -> Result<()> {
        let entry = self.channel(ch)?;
        let track = entry.track()?;
        if !track.rtcp_session {
            return Err(Error::failure(format!(
                "track {} has no RTCP receiving session",
                track.mid
            )));
        }
        if !entry.open {
            return Err(Error::failure(format!("track {} is not open", track.mid)));
        }

        if let Some(peer) = entry.peer {
            let chained = self
                .channels
                .get(&peer)
                .filter(|e| e.open)
                .and_then(|e| e.track().ok().map(|t| (e.pc, t.pli_chained)));
            if let Some((peer_pc, true)) = chained {
                self.emit(peer_pc, EngineEvent::KeyFrameRequested(peer));
            }
        }
        Ok(())
    }

    /// Close `ch` and the channel paired with it. Idempotent.
    pub fn close_channel(&mut self, ch: ChannelHandle) -> Result<()> {
        let entry = self.channel_mut(ch)?;
        if entry.closed {
            return Ok(());
        }
        entry.closed = true;
        entry.open = false;
        let pc = entry.pc;
        let peer = entry.peer.take();
        self.emit(pc, EngineEvent::Closed(ch));

        if let Some(peer) = peer {
            if let Some(peer_entry) = self.channels.get_mut(&peer) {
                peer_entry.peer = None;
                if !peer_entry.closed {
                    peer_entry.closed = true;
                    peer_entry.open = false;
                    let peer_pc = peer_entry.pc;
                    self.emit(peer_pc, EngineEvent::Closed(peer));
                }
            }
        }
        Ok(())
    }

    pub fn delete_channel(&mut self, ch: ChannelHandle) -> Result<()> {
        self.close_channel(ch)?;
        if let Some(entry) = self.channels.remove(&ch) {
            if let Some(conn) = self.connections.get_mut(&entry.pc) {
                conn.channels.retain(|h| *h != ch);
            }
        }
        Ok(())
    }

    pub fn close_connection(&mut self, pc: ConnectionHandle) -> Result<()> {
        let conn = self.connection(pc)?;
        if conn.closed {
            return Ok(());
        }
        for ch in conn.channels.clone() {
            self.close_channel(ch)?;
        }

        let conn = self.connection_mut(pc)?;
        conn.closed = true;
        conn.set_ice(IceState::Closed);
        conn.set_state(ConnectionState::Closed);
        let remote = conn.peer.take();

        if let Some(remote) = remote {
            if let Some(other) = self.connections.get_mut(&remote) {
                other.peer = None;
                if !other.closed {
                    other.set_ice(IceState::Disconnected);
                    other.set_state(ConnectionState::Disconnected);
                }
            }
        }
        debug!(pc = %pc, "Connection closed");
        Ok(())
    }

    pub fn delete_connection(&mut self, pc: ConnectionHandle) -> Result<()> {
        self.close_connection(pc)?;
        self.channels.retain(|_, entry| entry.pc != pc);
        if let Some(conn) = self.connections.remove(&pc) {
            self.endpoints.remove(&conn.ufrag);
        }
        Ok(())
    }
}

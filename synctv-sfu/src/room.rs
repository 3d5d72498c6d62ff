//! SFU Room management
//!
//! A room holds the SFU side of every participant's peer connection and the
//! forwarding units relaying inbound tracks between them. One unit exists per
//! (source peer, ingress track, egress peer).

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use synctv_rtc::{PeerConnection, RtcChannel, Track};
use tracing::{debug, info};

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::forwarding::{ForwardingOptions, ForwardingStats, MediaForwardingUnit};
use crate::types::{ForwardKey, PeerId, RoomId};

pub struct SfuRoom {
    id: RoomId,
    config: Arc<SfuConfig>,
    peers: DashMap<PeerId, Arc<PeerConnection>>,
    /// Seats taken against `max_peers_per_room`; moves with every insert and removal
    seats: AtomicUsize,
    forwarders: DashMap<ForwardKey, Arc<MediaForwardingUnit>>,
}

impl SfuRoom {
    pub fn new(id: RoomId, config: Arc<SfuConfig>) -> Self {
        Self {
            id,
            config,
            peers: DashMap::new(),
            seats: AtomicUsize::new(0),
            forwarders: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    fn take_seat(&self) -> Result<()> {
        let max = self.config.max_peers_per_room;
        self.seats
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (max == 0 || taken < max).then_some(taken + 1)
            })
            .map(|_| ())
            .map_err(|_| SfuError::PeerLimit { max })
    }

    pub fn add_peer(&self, peer_id: PeerId, pc: Arc<PeerConnection>) -> Result<()> {
        match self.peers.entry(peer_id) {
            Entry::Occupied(entry) => Err(SfuError::PeerExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                // The shard stays locked, so the map cannot be counted here.
                self.take_seat()?;
                info!(room_id = %self.id, peer_id = %entry.key(), pc = %pc.id(), "Peer joined room");
                entry.insert(pc);
                Ok(())
            }
        }
    }

    /// Remove a peer and stop every forwarding unit it feeds or receives from.
    /// The peer connection itself is handed back open.
    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<Arc<PeerConnection>> {
        let (_, pc) = self.peers.remove(peer_id)?;
        self.seats.fetch_sub(1, Ordering::AcqRel);

        let keys: Vec<ForwardKey> = self
            .forwarders
            .iter()
            .filter(|entry| entry.key().source == *peer_id || entry.key().egress == *peer_id)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.stop_forwarding(key);
        }

        info!(
            room_id = %self.id,
            peer_id = %peer_id,
            stopped_forwarders = keys.len(),
            "Peer left room"
        );
        Some(pc)
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.peers.get(peer_id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forward `ingress`, an inbound track on `source`'s connection, to
    /// `egress`. Returns the existing unit if this leg is already forwarded.
    pub fn forward(
        &self,
        source: &PeerId,
        ingress: &Arc<Track>,
        egress: &PeerId,
    ) -> Result<Arc<MediaForwardingUnit>> {
        if !self.peers.contains_key(source) {
            return Err(SfuError::UnknownPeer(source.clone()));
        }
        if !ingress.direction().can_receive() {
            return Err(SfuError::NotAReceiver(ingress.handle().to_string()));
        }
        let egress_pc = self
            .peer(egress)
            .ok_or_else(|| SfuError::UnknownPeer(egress.clone()))?;

        let key = ForwardKey {
            source: source.clone(),
            ingress: ingress.handle(),
            egress: egress.clone(),
        };

        match self.forwarders.entry(key) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let options = ForwardingOptions {
                    namespace: self
                        .config
                        .namespace_by_source
                        .then(|| source.to_string()),
                    propagate_key_frames: self.config.propagate_key_frames,
                };
                let unit = Arc::new(MediaForwardingUnit::new(ingress, &egress_pc, &options)?);
                debug!(room_id = %self.id, forward = %entry.key(), "Forwarder added");
                entry.insert(Arc::clone(&unit));
                Ok(unit)
            }
        }
    }

    /// Forward `ingress` to every other peer in the room.
    pub fn forward_to_all(
        &self,
        source: &PeerId,
        ingress: &Arc<Track>,
    ) -> Result<Vec<Arc<MediaForwardingUnit>>> {
        let mut targets: Vec<PeerId> = self
            .peer_ids()
            .into_iter()
            .filter(|id| id != source)
            .collect();
        targets.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        targets
            .iter()
            .map(|egress| self.forward(source, ingress, egress))
            .collect()
    }

    /// Stop and drop one forwarding unit. The egress track stays on its peer
    /// connection.
    pub fn stop_forwarding(&self, key: &ForwardKey) -> bool {
        match self.forwarders.remove(key) {
            Some((_, unit)) => {
                unit.stop();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn forwarder(&self, key: &ForwardKey) -> Option<Arc<MediaForwardingUnit>> {
        self.forwarders.get(key).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn forwarder_count(&self) -> usize {
        self.forwarders.len()
    }

    #[must_use]
    pub fn forwarder_stats(&self) -> Vec<(ForwardKey, ForwardingStats)> {
        self.forwarders
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let mut stats = RoomStats {
            peer_count: self.peers.len(),
            forwarder_count: self.forwarders.len(),
            ..Default::default()
        };
        for entry in &self.forwarders {
            let unit = entry.value().stats();
            stats.packets_forwarded += unit.forwarded;
            stats.packets_dropped += unit.dropped_closed + unit.dropped_failed;
            stats.send_failures += unit.send_failures;
        }
        stats
    }

    /// Stop every forwarder and forget every peer. Peer connections are not
    /// closed here; dropping the last handle closes them.
    pub fn close(&self) {
        let count = self.forwarders.len();
        for entry in &self.forwarders {
            entry.value().stop();
        }
        self.forwarders.clear();
        self.peers.retain(|_, _| {
            self.seats.fetch_sub(1, Ordering::AcqRel);
            false
        });
        info!(room_id = %self.id, stopped_forwarders = count, "Room closed");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub peer_count: usize,
    pub forwarder_count: usize,
    pub packets_forwarded: u64,
    pub packets_dropped: u64,
    pub send_failures: u64,
}

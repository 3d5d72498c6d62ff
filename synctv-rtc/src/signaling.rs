//! In-process signaling helpers
//!
//! Hosts normally carry descriptions over their own signaling transport.
//! When both peer connections live in the same process (tests, demos, a
//! server relaying between its own connections) these helpers run the
//! offer/answer exchange directly, passing descriptions through their JSON
//! wire form.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::NegotiationTimeouts;
use crate::error::Result;
use crate::peer::PeerConnection;
use crate::track::Track;
use crate::types::{ConnectionState, GatheringState, SdpType, SessionDescription};

async fn local_description(
    pc: &PeerConnection,
    sdp_type: SdpType,
    timeouts: &NegotiationTimeouts,
) -> Result<String> {
    pc.lock_local_description(sdp_type)?;
    pc.gathering_state()
        .wait_for_value(GatheringState::Complete, timeouts.gathering())
        .await?;

    let sdp = match sdp_type {
        SdpType::Answer => pc.create_answer()?,
        _ => pc.create_offer()?,
    };
    SessionDescription::new(sdp_type, sdp).to_json()
}

/// Run one offer/answer round between two local peer connections. Resolves
/// once both sides applied their descriptions; it does not wait for the
/// connection to come up.
pub async fn negotiate(
    offerer: &PeerConnection,
    answerer: &PeerConnection,
    timeouts: &NegotiationTimeouts,
) -> Result<()> {
    let offer = local_description(offerer, SdpType::Offer, timeouts).await?;
    answerer.set_remote_description(&SessionDescription::from_json(&offer)?)?;

    let answer = local_description(answerer, SdpType::Answer, timeouts).await?;
    offerer.set_remote_description(&SessionDescription::from_json(&answer)?)?;

    debug!(offerer = %offerer.id(), answerer = %answerer.id(), "Negotiation round complete");
    Ok(())
}

/// Wait until `pc` reports `connected`, failing early if it fails or closes.
pub async fn wait_connected(pc: &PeerConnection, timeouts: &NegotiationTimeouts) -> Result<()> {
    pc.state()
        .wait_for_either(
            |state| *state == ConnectionState::Connected,
            |state| matches!(state, ConnectionState::Failed | ConnectionState::Closed),
            timeouts.connect(),
        )
        .await
        .map(|_| ())
}

/// Wait for a track on `pc` matching `predicate`, local or inbound.
///
/// Re-checks the registry each time a channel is added or removed.
pub async fn wait_for_track<P>(
    pc: &PeerConnection,
    mut predicate: P,
    timeout: Duration,
) -> Result<Arc<Track>>
where
    P: FnMut(&Track) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        // Read before scanning so a track added mid-scan still wakes us.
        let seen = pc.channel_generation().get();
        if let Some(track) = pc.tracks().into_iter().find(|t| predicate(t.as_ref())) {
            return Ok(track);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        pc.channel_generation()
            .wait_for(move |generation| *generation != seen, remaining)
            .await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RtcChannel;
    use crate::config::PeerConfig;
    use crate::engine::TransportEngine;
    use crate::error::Error;
    use crate::loopback::LoopbackEngine;
    use crate::peer::TrackOptions;
    use crate::types::{Codec, Direction};

    #[tokio::test]
    async fn test_negotiate_and_find_inbound_track() {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        let a = PeerConnection::new(Arc::clone(&engine), PeerConfig::default()).unwrap();
        let b = PeerConnection::new(Arc::clone(&engine), PeerConfig::default()).unwrap();
        a.create_track(TrackOptions::new("mic", "audio", Direction::SendOnly, Codec::Opus))
            .unwrap();

        let timeouts = NegotiationTimeouts::default();
        negotiate(&a, &b, &timeouts).await.unwrap();
        wait_connected(&a, &timeouts).await.unwrap();
        wait_connected(&b, &timeouts).await.unwrap();

        let inbound = wait_for_track(&b, |t| t.codec() == Some(Codec::Opus), timeouts.open())
            .await
            .unwrap();
        assert_eq!(inbound.stream_id(), "mic");
        assert_eq!(inbound.channel_count(), 2);
        assert_eq!(inbound.clock_rate(), Some(48_000));
        inbound
            .is_open()
            .wait_for_value(true, timeouts.open())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_missing_track_times_out() {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        let pc = PeerConnection::new(engine, PeerConfig::default()).unwrap();
        let result = wait_for_track(&pc, |_| true, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::TimedOut)));
    }

    #[tokio::test]
    async fn test_wait_connected_rejects_closed() {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        let pc = PeerConnection::new(engine, PeerConfig::default()).unwrap();
        pc.close();
        let result = wait_connected(&pc, &NegotiationTimeouts::default()).await;
        assert_eq!(result, Err(Error::WrongValue));
    }

    #[tokio::test]
    async fn test_wait_for_track_wakes_on_new_track() {
        let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
        let pc = Arc::new(PeerConnection::new(engine, PeerConfig::default()).unwrap());
        pc.create_data_channel("chat", Default::default()).unwrap();

        let creator = Arc::clone(&pc);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            creator
                .create_track(TrackOptions::new("s", "v", Direction::SendOnly, Codec::VP8))
                .unwrap();
        });

        let track = wait_for_track(&pc, |t| t.mid() == "v", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(track.codec(), Some(Codec::VP8));
        assert_eq!(pc.channel_generation().subscriber_count(), 0);
    }
}

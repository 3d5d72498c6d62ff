use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use synctv_rtc::logging::init_test_logging;
use synctv_rtc::{
    Codec, ConnectionState, DataChannelInit, Direction, Error, GatheringState, IpOverride,
    LoopbackEngine, PeerConfig, PeerConnection, RtcChannel, SdpType, SessionDescription,
    SignalingState, TrackOptions, TransportEngine,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn engine() -> Arc<dyn TransportEngine> {
    Arc::new(LoopbackEngine::new())
}

fn peer(engine: &Arc<dyn TransportEngine>) -> PeerConnection {
    PeerConnection::new(Arc::clone(engine), PeerConfig::default()).unwrap()
}

fn negotiated(stream_id: u16) -> DataChannelInit {
    DataChannelInit {
        stream_id: Some(stream_id),
        negotiated: true,
        ..DataChannelInit::default()
    }
}

/// Offer/answer exchange with descriptions passed through their JSON wire form.
async fn negotiate(offerer: &PeerConnection, answerer: &PeerConnection) {
    offerer.lock_local_description(SdpType::Offer).unwrap();
    offerer
        .gathering_state()
        .wait_for_value(GatheringState::Complete, TIMEOUT)
        .await
        .unwrap();
    let offer = SessionDescription::new(SdpType::Offer, offerer.create_offer().unwrap())
        .to_json()
        .unwrap();

    answerer
        .set_remote_description(&SessionDescription::from_json(&offer).unwrap())
        .unwrap();
    answerer.lock_local_description(SdpType::Answer).unwrap();
    answerer
        .gathering_state()
        .wait_for_value(GatheringState::Complete, TIMEOUT)
        .await
        .unwrap();
    let answer = answerer.create_answer().unwrap();

    offerer.set_remote(&answer, SdpType::Answer).unwrap();
}

async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {TIMEOUT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_negotiated_data_channel_carries_message() {
    init_test_logging();
    let engine = engine();
    let a = peer(&engine);
    let b = peer(&engine);
    let dc_a = a.create_data_channel("test", negotiated(1)).unwrap();
    let dc_b = b.create_data_channel("test", negotiated(1)).unwrap();

    negotiate(&a, &b).await;

    for pc in [&a, &b] {
        pc.state()
            .wait_for_value(ConnectionState::Connected, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(pc.signaling_state().get(), SignalingState::Stable);
    }
    dc_a.is_open().wait_for_value(true, TIMEOUT).await.unwrap();
    dc_b.is_open().wait_for_value(true, TIMEOUT).await.unwrap();

    dc_a.send(b"Test").unwrap();
    let message = dc_b
        .last_message()
        .wait_for(Option::is_some, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(message.as_deref(), Some(&b"Test"[..]));
}

#[tokio::test]
async fn test_in_band_data_channel_is_announced() {
    init_test_logging();
    let engine = engine();
    let a = peer(&engine);
    let b = peer(&engine);
    let dc_a = a
        .create_data_channel("chat", DataChannelInit::default())
        .unwrap();

    negotiate(&a, &b).await;

    let dc_b = eventually(|| b.data_channels().into_iter().find(|dc| dc.label() == "chat")).await;
    assert_eq!(dc_b.stream_id(), dc_a.stream_id());
    dc_b.is_open().wait_for_value(true, TIMEOUT).await.unwrap();
    dc_a.is_open().wait_for_value(true, TIMEOUT).await.unwrap();

    dc_b.send_text("pong").unwrap();
    let message = dc_a
        .last_message()
        .wait_for(Option::is_some, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(message.as_deref(), Some(&b"pong"[..]));
}

#[tokio::test]
async fn test_remote_track_identity_and_key_frames() {
    init_test_logging();
    let engine = engine();
    let a = peer(&engine);
    let b = peer(&engine);
    let sender = a
        .create_track(
            TrackOptions::new("camera", "video0", Direction::SendOnly, Codec::H264)
                .with_profile("profile-level-id=42e01f;packetization-mode=1"),
        )
        .unwrap();

    negotiate(&a, &b).await;

    let receiver = eventually(|| b.tracks().into_iter().next()).await;
    assert_eq!(receiver.stream_id(), "camera");
    assert_eq!(receiver.track_id(), "video0");
    assert_eq!(receiver.mid(), "video0");
    assert_eq!(receiver.direction(), Direction::RecvOnly);
    assert_eq!(receiver.codec(), Some(Codec::H264));
    assert_eq!(
        receiver.profile(),
        Some("profile-level-id=42e01f;packetization-mode=1")
    );
    assert_eq!(receiver.ssrcs(), sender.ssrcs());
    assert!(b.is_ssrc_reserved(sender.ssrc().unwrap()));

    sender.is_open().wait_for_value(true, TIMEOUT).await.unwrap();
    receiver.is_open().wait_for_value(true, TIMEOUT).await.unwrap();

    let packet = [0x80u8, 96, 0, 1, 0, 0, 0, 1, 0, 0, 0, 7, 0xAA];
    sender.send(&packet).unwrap();
    let received = receiver
        .last_message()
        .wait_for(Option::is_some, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(received.as_deref(), Some(&packet[..]));

    // Receivers cannot send on a recvonly track.
    assert!(matches!(receiver.send(&packet), Err(Error::Failure(_))));

    let requests = Arc::new(AtomicUsize::new(0));
    {
        let requests = Arc::clone(&requests);
        sender
            .set_on_key_frame_requested(move || {
                requests.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    // No RTCP session yet: the request is rejected.
    assert!(matches!(receiver.request_key_frame(), Err(Error::Failure(_))));
    receiver.install_rtcp_receiving_session().unwrap();
    receiver.request_key_frame().unwrap();
    eventually(|| (requests.load(Ordering::SeqCst) == 1).then_some(())).await;

    sender.clear_on_key_frame_requested().unwrap();
    receiver.request_key_frame().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_renegotiation_opens_new_channels() {
    init_test_logging();
    let engine = engine();
    let a = peer(&engine);
    let b = peer(&engine);
    a.create_data_channel("first", negotiated(1)).unwrap();
    b.create_data_channel("first", negotiated(1)).unwrap();
    negotiate(&a, &b).await;
    a.state()
        .wait_for_value(ConnectionState::Connected, TIMEOUT)
        .await
        .unwrap();
    a.signaling_state()
        .wait_for_value(SignalingState::Stable, TIMEOUT)
        .await
        .unwrap();
    b.signaling_state()
        .wait_for_value(SignalingState::Stable, TIMEOUT)
        .await
        .unwrap();

    let second_a = eventually(|| a.create_data_channel("second", negotiated(5)).ok()).await;
    let second_b = eventually(|| b.create_data_channel("second", negotiated(5)).ok()).await;
    assert!(!second_a.is_open().get());

    negotiate(&a, &b).await;
    second_a.is_open().wait_for_value(true, TIMEOUT).await.unwrap();
    second_b.is_open().wait_for_value(true, TIMEOUT).await.unwrap();

    second_a.send(b"again").unwrap();
    let message = second_b
        .last_message()
        .wait_for(Option::is_some, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(message.as_deref(), Some(&b"again"[..]));
}

#[tokio::test]
async fn test_ip_override_scrubs_private_address() {
    init_test_logging();
    let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::with_host_address("192.168.7.20"));
    let config = PeerConfig {
        ip_override: Some(IpOverride::new("192.168.7.20", "203.0.113.5")),
        ..PeerConfig::default()
    };
    let a = PeerConnection::new(Arc::clone(&engine), config).unwrap();
    a.create_data_channel("x", negotiated(1)).unwrap();
    a.lock_local_description(SdpType::Offer).unwrap();

    let description = a
        .local_description()
        .wait_for(Option::is_some, TIMEOUT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(description.sdp_type, SdpType::Offer);
    assert!(description.sdp.contains("203.0.113.5"));
    assert!(!description.sdp.contains("192.168.7.20"));

    let offer = a.create_offer().unwrap();
    assert!(offer.contains("c=IN IP4 203.0.113.5"));
    assert!(!offer.contains("192.168.7.20"));

    let candidates = a.local_candidates().get();
    assert_eq!(candidates.len(), 1);
    assert!(candidates[0].candidate.contains("203.0.113.5"));
    assert_eq!(candidates[0].mid.as_deref(), Some("data"));
}

#[tokio::test]
async fn test_state_waits_time_out_or_reject() {
    init_test_logging();
    let engine = engine();
    let a = peer(&engine);

    let waited = a
        .state()
        .wait_for_value(ConnectionState::Connected, Duration::from_millis(30))
        .await;
    assert_eq!(waited, Err(Error::TimedOut));

    a.close();
    let waited = a
        .state()
        .wait_for_either(
            |s| *s == ConnectionState::Connected,
            |s| *s == ConnectionState::Closed,
            TIMEOUT,
        )
        .await;
    assert_eq!(waited, Err(Error::WrongValue));
}

#[tokio::test]
async fn test_bad_remote_description_is_surfaced() {
    init_test_logging();
    let engine = engine();
    let a = peer(&engine);

    assert!(matches!(
        a.set_remote("not sdp", SdpType::Offer),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(
        a.lock_local_description(SdpType::Answer),
        Err(Error::Failure(_))
    ));
    assert!(matches!(a.create_answer(), Err(Error::ElementNotAvailable(_))));
}

#[tokio::test]
async fn test_closing_one_side_disconnects_the_other() {
    init_test_logging();
    let engine = engine();
    let a = peer(&engine);
    let b = peer(&engine);
    let dc_a = a.create_data_channel("test", negotiated(1)).unwrap();
    let dc_b = b.create_data_channel("test", negotiated(1)).unwrap();
    negotiate(&a, &b).await;
    dc_b.is_open().wait_for_value(true, TIMEOUT).await.unwrap();

    drop(dc_a);
    drop(a);

    b.state()
        .wait_for_value(ConnectionState::Disconnected, TIMEOUT)
        .await
        .unwrap();
    dc_b.is_open().wait_for_value(false, TIMEOUT).await.unwrap();
    assert_eq!(b.data_channels().len(), 1);

    dc_b.close().unwrap();
    assert!(b.data_channels().is_empty());
}

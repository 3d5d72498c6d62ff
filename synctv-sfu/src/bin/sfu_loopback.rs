use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use synctv_rtc::logging::init_logging;
use synctv_rtc::signaling::{negotiate, wait_connected, wait_for_track};
use synctv_rtc::{
    Codec, Direction, LoopbackEngine, PeerConnection, RtcChannel, TrackOptions, TransportEngine,
};
use synctv_sfu::{PeerId, RoomId, SfuRoom, SfuSettings};
use tracing::{info, info_span, warn};

const SENDER_SSRC: u32 = 0x5EED_0001;
const PACKET_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Parser, Debug)]
#[command(name = "sfu-loopback")]
#[command(about = "Forward synthetic RTP from one sender to N receivers through an in-process SFU", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "SFU_CONFIG")]
    config: Option<String>,

    /// Number of receiving peers
    #[arg(short, long, default_value = "2")]
    receivers: usize,

    /// Number of RTP packets to push through the SFU
    #[arg(short, long, default_value = "100")]
    packets: u16,
}

fn synthetic_rtp(sequence: u16, payload_type: u8) -> Vec<u8> {
    let timestamp = u32::from(sequence) * 3000;
    let marker = if sequence % 10 == 9 { 0x80 } else { 0 };

    let mut packet = vec![0x80, marker | payload_type];
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(&timestamp.to_be_bytes());
    packet.extend_from_slice(&SENDER_SSRC.to_be_bytes());
    packet.extend_from_slice(&[0xAB; 32]);
    packet
}

struct Receiver {
    id: PeerId,
    // Held so the receiving connection stays up for the run.
    _pc: PeerConnection,
    received: Arc<AtomicU64>,
    _subscription: synctv_rtc::Subscription,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = SfuSettings::load(args.config.as_deref()).context("Failed to load settings")?;
    init_logging(&settings.rtc.logging)?;

    let timeouts = settings.rtc.timeouts;
    let peer_config = settings.rtc.peer.clone();
    let engine: Arc<dyn TransportEngine> = Arc::new(LoopbackEngine::new());
    let room = SfuRoom::new(RoomId::new("loopback"), Arc::new(settings.sfu.clone()));

    info!(receivers = args.receivers, packets = args.packets, "sfu-loopback starting");

    // Sender and the SFU connection it publishes to.
    let sender = PeerConnection::new(Arc::clone(&engine), peer_config.clone())?;
    let camera = sender.create_track(
        TrackOptions::new("camera", "video", Direction::SendOnly, Codec::VP8)
            .with_ssrc(SENDER_SSRC),
    )?;
    let sender_id = PeerId::new("sender");
    let ingress_pc = Arc::new(PeerConnection::new(Arc::clone(&engine), peer_config.clone())?);
    room.add_peer(sender_id.clone(), Arc::clone(&ingress_pc))?;

    negotiate(&sender, &ingress_pc, &timeouts).await?;
    wait_connected(&sender, &timeouts).await?;
    let ingress = wait_for_track(&ingress_pc, |t| t.direction().can_receive(), timeouts.open())
        .await
        .context("Sender track never arrived at the SFU")?;
    camera.is_open().wait_for_value(true, timeouts.open()).await?;

    let mut receivers = Vec::with_capacity(args.receivers);
    for i in 0..args.receivers {
        let id = PeerId::new(format!("receiver-{i}"));
        let egress_pc = Arc::new(PeerConnection::new(Arc::clone(&engine), peer_config.clone())?);
        room.add_peer(id.clone(), Arc::clone(&egress_pc))?;
        room.forward(&sender_id, &ingress, &id)?;

        let span = info_span!("receiver", peer = %id);
        let pc = PeerConnection::with_span(Arc::clone(&engine), peer_config.clone(), &span)?;
        negotiate(&egress_pc, &pc, &timeouts).await?;
        wait_connected(&pc, &timeouts).await?;
        let track = wait_for_track(&pc, |t| t.direction().can_receive(), timeouts.open()).await?;
        track.is_open().wait_for_value(true, timeouts.open()).await?;

        let received = Arc::new(AtomicU64::new(0));
        let subscription = {
            let received = Arc::clone(&received);
            track.last_message().subscribe(move |message| {
                if message.is_some() {
                    received.fetch_add(1, Ordering::Relaxed);
                }
            })
        };
        info!(receiver = %id, ssrc = ?track.ssrc(), "Receiver connected");
        receivers.push(Receiver {
            id,
            _pc: pc,
            received,
            _subscription: subscription,
        });
    }

    let payload_type = camera
        .payload_types(Codec::VP8.name())?
        .first()
        .copied()
        .context("Sender track has no VP8 payload type")?;
    for sequence in 0..args.packets {
        if let Err(e) = camera.send(&synthetic_rtp(sequence, payload_type)) {
            warn!(sequence, error = %e, "Send failed");
        }
        tokio::time::sleep(PACKET_INTERVAL).await;
    }

    // Let the last packets drain through the dispatcher threads.
    tokio::time::sleep(Duration::from_millis(200)).await;

    for receiver in &receivers {
        let received = receiver.received.load(Ordering::Relaxed);
        println!("{}: received {received}/{} packets", receiver.id, args.packets);
    }
    for (key, stats) in room.forwarder_stats() {
        println!("{key}: {}", serde_json::to_string(&stats)?);
    }
    println!("room: {}", serde_json::to_string_pretty(&room.stats())?);

    room.close();
    info!("sfu-loopback finished");
    Ok(())
}

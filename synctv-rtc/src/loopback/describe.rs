//! SDP text produced and consumed by the loopback engine

use ::sdp::description::media::MediaDescription;
use ::sdp::description::session::SessionDescription;

use super::network::{ChannelKind, Network, TrackEntry};
use crate::error::{Error, Result};
use crate::sdp::{self, RtpMap};
use crate::types::{ConnectionHandle, Direction, SdpType};

pub(super) const DATA_MID: &str = "data";
const SCTP_PORT: u16 = 5000;
const MAX_MESSAGE_SIZE: usize = 262_144;

/// A remote media section carrying audio or video
#[derive(Debug, Clone)]
pub(super) struct RemoteMedia {
    pub kind: String,
    pub mid: String,
    pub direction: Option<Direction>,
    pub msid: Option<(String, String)>,
    pub formats: Vec<RtpMap>,
    pub ssrcs: Vec<u32>,
}

/// What the engine keeps from a remote description
#[derive(Debug, Clone)]
pub(super) struct RemoteSession {
    pub ufrag: String,
    pub media: Vec<RemoteMedia>,
    pub has_application: bool,
    pub candidates: Vec<String>,
}

pub(super) fn parse_remote(text: &str) -> Result<RemoteSession> {
    let session = sdp::parse_session(text)?;

    let ufrag = session
        .attributes
        .iter()
        .find(|attr| attr.key == "ice-ufrag")
        .and_then(|attr| attr.value.as_deref())
        .or_else(|| {
            session
                .media_descriptions
                .first()
                .and_then(|media| media.attribute("ice-ufrag").flatten())
        })
        .map(|ufrag| ufrag.trim().to_string())
        .ok_or_else(|| Error::invalid("session description has no ice-ufrag"))?;

    let mut candidates: Vec<String> = session
        .attributes
        .iter()
        .filter(|attr| attr.key == "candidate")
        .filter_map(|attr| attr.value.as_deref())
        .map(|value| format!("candidate:{value}"))
        .collect();

    let mut media = Vec::new();
    let mut has_application = false;
    for description in &session.media_descriptions {
        let kind = description.media_name.media.clone();
        let mid = sdp::mid(description)
            .ok_or_else(|| Error::invalid(format!("{kind} media section has no mid")))?
            .to_string();
        candidates.extend(sdp::candidates(description));

        match kind.as_str() {
            "application" => has_application = true,
            "audio" | "video" => media.push(RemoteMedia {
                direction: sdp::direction(description),
                msid: sdp::msid(description),
                formats: sdp::rtpmaps(description)?,
                ssrcs: sdp::ssrcs(description),
                kind,
                mid,
            }),
            _ => return Err(Error::invalid(format!("unsupported media kind {kind:?}"))),
        }
    }

    Ok(RemoteSession {
        ufrag,
        media,
        has_application,
        candidates,
    })
}

fn with_host(mut media: MediaDescription, host: &str) -> MediaDescription {
    if let Some(address) = media
        .connection_information
        .as_mut()
        .and_then(|c| c.address.as_mut())
    {
        address.address = host.to_string();
    }
    media
}

/// `setup` and candidates only go into full sessions.
fn with_transport(
    mut media: MediaDescription,
    setup: Option<&str>,
    candidates: &[String],
) -> MediaDescription {
    if let Some(setup) = setup {
        media = media.with_value_attribute("setup".to_string(), setup.to_string());
    }
    if candidates.is_empty() {
        return media;
    }
    for candidate in candidates {
        let value = candidate.strip_prefix("candidate:").unwrap_or(candidate);
        media = media.with_value_attribute("candidate".to_string(), value.to_string());
    }
    media.with_property_attribute("end-of-candidates".to_string())
}

fn track_media(
    track: &TrackEntry,
    host: &str,
    setup: Option<&str>,
    candidates: &[String],
) -> MediaDescription {
    let mut media = MediaDescription::new_jsep_media_description(track.kind.clone(), vec![])
        .with_value_attribute("mid".to_string(), track.mid.clone())
        .with_property_attribute(track.direction.as_sdp().to_string())
        .with_property_attribute("rtcp-mux".to_string());
    if let Some((stream_id, track_id)) = &track.msid {
        media = media.with_value_attribute("msid".to_string(), format!("{stream_id} {track_id}"));
    }

    for format in &track.formats {
        media = media.with_codec(
            format.payload_type,
            format.encoding.clone(),
            format.clock_rate,
            u16::from(format.channels),
            format.profile.clone().unwrap_or_default(),
        );
        if track.kind == "video" {
            let pt = format.payload_type;
            media = media
                .with_value_attribute("rtcp-fb".to_string(), format!("{pt} nack"))
                .with_value_attribute("rtcp-fb".to_string(), format!("{pt} nack pli"));
        }
    }

    for ssrc in &track.ssrcs {
        if let Some(cname) = &track.cname {
            media = media.with_value_attribute("ssrc".to_string(), format!("{ssrc} cname:{cname}"));
        }
        if let Some((stream_id, track_id)) = &track.msid {
            media = media.with_value_attribute(
                "ssrc".to_string(),
                format!("{ssrc} msid:{stream_id} {track_id}"),
            );
        }
    }

    with_transport(with_host(media, host), setup, candidates)
}

fn application_media(host: &str, setup: &str, candidates: &[String]) -> MediaDescription {
    let mut media = MediaDescription::new_jsep_media_description("application".to_string(), vec![])
        .with_value_attribute("mid".to_string(), DATA_MID.to_string())
        .with_value_attribute("sctp-port".to_string(), SCTP_PORT.to_string())
        .with_value_attribute("max-message-size".to_string(), MAX_MESSAGE_SIZE.to_string());
    media.media_name.protos = vec!["UDP".to_string(), "DTLS".to_string(), "SCTP".to_string()];
    media.media_name.formats = vec!["webrtc-datachannel".to_string()];
    with_transport(with_host(media, host), Some(setup), candidates)
}

/// A session holding only the media of one track, as reported for the
/// track's description.
pub(super) fn render_track(track: &TrackEntry, host: &str) -> String {
    SessionDescription::new_jsep_session_description(false)
        .with_media(track_media(track, host, None, &[]))
        .marshal()
}

/// Mids of a connection in the order their sections are written
pub(super) fn mids(net: &Network, pc: ConnectionHandle) -> Vec<String> {
    let Some(conn) = net.connections.get(&pc) else {
        return Vec::new();
    };

    let mut mids: Vec<String> = net
        .live_channels(pc)
        .filter_map(|(_, entry)| match &entry.kind {
            ChannelKind::Track(track) => Some(track.mid.clone()),
            ChannelKind::Data(_) => None,
        })
        .collect();
    let has_data = net
        .live_channels(pc)
        .any(|(_, entry)| matches!(entry.kind, ChannelKind::Data(_)))
        || conn.remote.as_ref().is_some_and(|r| r.has_application);
    if has_data {
        mids.push(DATA_MID.to_string());
    }
    mids
}

/// Full session description of `pc` for an offer or an answer.
pub(super) fn render_session(
    net: &Network,
    pc: ConnectionHandle,
    sdp_type: SdpType,
) -> Result<String> {
    let conn = net.connection(pc)?;
    let setup = if sdp_type == SdpType::Answer {
        "active"
    } else {
        "actpass"
    };
    let candidates: Vec<String> = conn.local_candidate.iter().cloned().collect();
    let host = net.host();
    let mids = mids(net, pc);

    let mut session = SessionDescription::new_jsep_session_description(false);
    session.origin.session_id = conn.session_id;
    session.origin.session_version = conn.version;
    session.origin.unicast_address = host.to_string();

    if !mids.is_empty() {
        session = session.with_value_attribute("group".to_string(), format!("BUNDLE {}", mids.join(" ")));
    }
    session = session
        .with_value_attribute("msid-semantic".to_string(), "WMS *".to_string())
        .with_value_attribute("ice-ufrag".to_string(), conn.ufrag.clone())
        .with_value_attribute("ice-pwd".to_string(), conn.pwd.clone())
        .with_value_attribute("ice-options".to_string(), "trickle".to_string());

    for (_, entry) in net.live_channels(pc) {
        if let ChannelKind::Track(track) = &entry.kind {
            session = session.with_media(track_media(track, host, Some(setup), &candidates));
        }
    }
    if mids.iter().any(|mid| mid == DATA_MID) {
        session = session.with_media(application_media(host, setup, &candidates));
    }

    Ok(session.marshal())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> TrackEntry {
        TrackEntry {
            kind: "video".to_string(),
            mid: "video".to_string(),
            msid: Some(("cam".to_string(), "video0".to_string())),
            direction: Direction::SendOnly,
            formats: vec![RtpMap {
                payload_type: 96,
                encoding: "H264".to_string(),
                clock_rate: 90_000,
                channels: 0,
                profile: Some("packetization-mode=1".to_string()),
            }],
            ssrcs: vec![1234],
            cname: Some("abc".to_string()),
            rtcp_session: false,
            pli_chained: false,
        }
    }

    fn remote_text(track: &TrackEntry, candidates: &[String]) -> String {
        SessionDescription::new_jsep_session_description(false)
            .with_value_attribute("ice-ufrag".to_string(), "abcd".to_string())
            .with_media(track_media(track, "127.0.0.1", Some("actpass"), candidates))
            .with_media(application_media("127.0.0.1", "actpass", &[]))
            .marshal()
    }

    #[test]
    fn test_render_track_is_parseable() {
        let text = render_track(&track(), "127.0.0.1");
        assert!(text.contains("m=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 127.0.0.1\r\n"));
        assert!(text.contains("a=rtcp-fb:96 nack pli\r\n"));
        assert!(!text.contains("a=setup"));

        let media = sdp::parse_media(&text).unwrap();
        assert_eq!(
            sdp::msid(&media),
            Some(("cam".to_string(), "video0".to_string()))
        );
        assert_eq!(sdp::ssrcs(&media), vec![1234]);
        assert_eq!(sdp::direction(&media), Some(Direction::SendOnly));
        assert_eq!(sdp::rtpmaps(&media).unwrap(), track().formats);
    }

    #[test]
    fn test_track_media_with_candidates() {
        let candidates = vec!["candidate:1 1 UDP 2122317823 10.0.0.1 50000 typ host".to_string()];
        let text = SessionDescription::new_jsep_session_description(false)
            .with_media(track_media(&track(), "10.0.0.1", Some("actpass"), &candidates))
            .marshal();
        assert!(text.contains("a=setup:actpass\r\n"));
        assert!(text.contains("a=candidate:1 1 UDP 2122317823 10.0.0.1"));
        assert!(text.ends_with("a=end-of-candidates\r\n"));
    }

    #[test]
    fn test_parse_remote() {
        let candidates = vec!["candidate:1 1 UDP 1 127.0.0.1 9 typ host".to_string()];
        let remote = parse_remote(&remote_text(&track(), &candidates)).unwrap();
        assert_eq!(remote.ufrag, "abcd");
        assert!(remote.has_application);
        assert_eq!(remote.candidates, candidates);

        assert_eq!(remote.media.len(), 1);
        let media = &remote.media[0];
        assert_eq!(media.mid, "video");
        assert_eq!(media.kind, "video");
        assert_eq!(media.direction, Some(Direction::SendOnly));
        assert_eq!(media.ssrcs, vec![1234]);
        assert_eq!(media.formats, track().formats);
    }

    #[test]
    fn test_parse_remote_rejects_malformed() {
        assert!(matches!(parse_remote("hello"), Err(Error::Invalid(_))));
        assert!(matches!(
            parse_remote("v=0\r\ns=-\r\n"),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            parse_remote("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=ice-ufrag:x\r\nm=video 9 RTP/AVP 96\r\n"),
            Err(Error::Invalid(_))
        ));

        let mut bad_format = track();
        bad_format.formats[0].encoding = String::new();
        assert!(matches!(
            parse_remote(&remote_text(&bad_format, &[])),
            Err(Error::Invalid(_))
        ));
    }
}

//! Reading engine-provided session descriptions
//!
//! Parsing goes through the `sdp` crate; this module only pulls out what the
//! control layer needs from a media description: stream/track identifiers,
//! SSRCs, direction and the RTP formats. Full SDP handling stays inside the
//! transport engine.

use ::sdp::description::media::MediaDescription;
use ::sdp::description::session::SessionDescription;
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::types::{Codec, Direction};

/// Prepended to a bare `m=` section so it parses as a session.
const SECTION_HEADER: &str = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n";

pub fn parse_session(text: &str) -> Result<SessionDescription> {
    let mut reader = Cursor::new(text.as_bytes());
    SessionDescription::unmarshal(&mut reader)
        .map_err(|e| Error::invalid(format!("malformed session description: {e}")))
}

/// The first media description of `text`, which is either a full session
/// description or a single `m=` section.
pub fn parse_media(text: &str) -> Result<MediaDescription> {
    let trimmed = text.trim_start();
    let session = if trimmed.starts_with("m=") {
        parse_session(&format!("{SECTION_HEADER}{trimmed}"))?
    } else {
        parse_session(text)?
    };
    session
        .media_descriptions
        .into_iter()
        .next()
        .ok_or_else(|| Error::invalid("session description has no media section"))
}

/// Values of every `a=<key>:<value>` attribute of a media description.
fn values<'a>(media: &'a MediaDescription, key: &'a str) -> impl Iterator<Item = &'a str> {
    media
        .attributes
        .iter()
        .filter(move |attr| attr.key == key)
        .filter_map(|attr| attr.value.as_deref())
}

#[must_use]
pub fn mid(media: &MediaDescription) -> Option<&str> {
    media.attribute("mid").flatten().map(str::trim)
}

/// `(stream_id, track_id)` from `a=msid:`, falling back to
/// `a=ssrc:<n> msid:<stream> <track>`.
#[must_use]
pub fn msid(media: &MediaDescription) -> Option<(String, String)> {
    let split = |value: &str| {
        let mut parts = value.split_whitespace();
        let stream = parts.next()?;
        let track = parts.next().unwrap_or(stream);
        Some((stream.to_string(), track.to_string()))
    };

    if let Some(found) = media.attribute("msid").flatten().and_then(split) {
        return Some(found);
    }

    values(media, "ssrc")
        .filter_map(|value| value.split_once(' ').map(|(_, tail)| tail))
        .filter_map(|tail| tail.strip_prefix("msid:"))
        .find_map(split)
}

/// Distinct SSRCs from `a=ssrc:` lines, in order of appearance.
#[must_use]
pub fn ssrcs(media: &MediaDescription) -> Vec<u32> {
    let mut ssrcs = Vec::new();
    for value in values(media, "ssrc") {
        let id = value.split_whitespace().next().unwrap_or_default();
        if let Ok(ssrc) = id.parse::<u32>() {
            if !ssrcs.contains(&ssrc) {
                ssrcs.push(ssrc);
            }
        }
    }
    ssrcs
}

#[must_use]
pub fn direction(media: &MediaDescription) -> Option<Direction> {
    media
        .attributes
        .iter()
        .filter(|attr| attr.value.is_none())
        .find_map(|attr| Direction::from_sdp(&attr.key))
}

/// `a=candidate` attributes, written back as `candidate:...` strings.
#[must_use]
pub fn candidates(media: &MediaDescription) -> Vec<String> {
    values(media, "candidate")
        .map(|value| format!("candidate:{value}"))
        .collect()
}

/// One `a=rtpmap` entry, with its `a=fmtp` profile if present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: u8,
    pub profile: Option<String>,
}

impl RtpMap {
    #[must_use]
    pub fn codec(&self) -> Option<Codec> {
        Codec::from_name(&self.encoding)
    }

    /// `<pt> <encoding>/<clock rate>[/<channels>]`
    fn parse(value: &str) -> Result<Self> {
        let malformed = || Error::invalid(format!("malformed rtpmap {value:?}"));

        let (pt, format) = value.trim().split_once(' ').ok_or_else(malformed)?;
        let mut parts = format.trim().split('/');
        let encoding = parts.next().filter(|e| !e.is_empty()).ok_or_else(malformed)?;
        let clock_rate = parts
            .next()
            .and_then(|rate| rate.parse().ok())
            .ok_or_else(malformed)?;
        let channels = match parts.next() {
            Some(channels) => channels.parse().map_err(|_| malformed())?,
            None => 0,
        };

        Ok(Self {
            payload_type: pt.parse().map_err(|_| malformed())?,
            encoding: encoding.to_string(),
            clock_rate,
            channels,
            profile: None,
        })
    }
}

/// All `a=rtpmap` entries of a media description. A malformed entry fails
/// the whole description.
pub fn rtpmaps(media: &MediaDescription) -> Result<Vec<RtpMap>> {
    let mut maps = values(media, "rtpmap")
        .map(RtpMap::parse)
        .collect::<Result<Vec<_>>>()?;

    for value in values(media, "fmtp") {
        let Some((pt, profile)) = value.split_once(' ') else {
            continue;
        };
        let Ok(pt) = pt.parse::<u8>() else {
            continue;
        };
        if let Some(map) = maps.iter_mut().find(|m| m.payload_type == pt) {
            map.profile = Some(profile.trim().to_string());
        }
    }
    Ok(maps)
}

fn is_address_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == ':'
}

/// Replace every whole-token occurrence of the address `from` with `to`.
/// Occurrences embedded in a longer address (`10.0.0.1` inside `10.0.0.12`)
/// are left alone.
#[must_use]
pub fn rewrite_address(text: &str, from: &str, to: &str) -> String {
    if from.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(from) {
        let before = rest[..pos].chars().next_back();
        let after = rest[pos + from.len()..].chars().next();
        let bounded = !before.is_some_and(is_address_char) && !after.is_some_and(is_address_char);

        out.push_str(&rest[..pos]);
        out.push_str(if bounded { to } else { from });
        rest = &rest[pos + from.len()..];
    }
    out.push_str(rest);
    out
}

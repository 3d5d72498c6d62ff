//! RTP fixed-header access
//!
//! Only the two fields a forwarding leg has to translate are touched: the
//! payload type (low 7 bits of byte 1) and the SSRC (bytes 8..12, network
//! order). Buffers shorter than the fixed header cannot be RTP and are left
//! alone.

/// Size of the fixed RTP header, without CSRCs or extensions
pub const RTP_HEADER_LEN: usize = 12;

const MARKER_BIT: u8 = 0x80;
const PAYLOAD_TYPE_MASK: u8 = 0x7F;

#[must_use]
pub fn ssrc(packet: &[u8]) -> Option<u32> {
    if packet.len() < RTP_HEADER_LEN {
        return None;
    }
    Some(u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]))
}

#[must_use]
pub fn payload_type(packet: &[u8]) -> Option<u8> {
    if packet.len() < RTP_HEADER_LEN {
        return None;
    }
    Some(packet[1] & PAYLOAD_TYPE_MASK)
}

/// Returns whether the packet was long enough to be rewritten.
pub fn rewrite_ssrc(packet: &mut [u8], ssrc: u32) -> bool {
    if packet.len() < RTP_HEADER_LEN {
        return false;
    }
    packet[8..RTP_HEADER_LEN].copy_from_slice(&ssrc.to_be_bytes());
    true
}

/// Replaces the payload type and keeps the marker bit. Returns whether the
/// packet was long enough to be rewritten.
pub fn rewrite_payload_type(packet: &mut [u8], payload_type: u8) -> bool {
    if packet.len() < RTP_HEADER_LEN {
        return false;
    }
    packet[1] = (packet[1] & MARKER_BIT) | (payload_type & PAYLOAD_TYPE_MASK);
    true
}

pub fn rewrite_header(packet: &mut [u8], ssrc: u32, payload_type: u8) -> bool {
    rewrite_ssrc(packet, ssrc) && rewrite_payload_type(packet, payload_type)
}

//! Per-connection identifier allocation
//!
//! - [`PayloadTypeAllocator`]: stable dynamic RTP payload types, handed out in
//!   ascending order from 96 so that identical sessions produce identical SDP.
//! - [`SsrcAllocator`]: collision-free random SSRCs. Remote SSRCs must be
//!   reserved as soon as they are discovered.

use rand::Rng;
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::types::Codec;

/// First dynamic payload type (RFC 3551)
pub const DYNAMIC_PAYLOAD_TYPE_MIN: u8 = 96;
/// Last dynamic payload type, inclusive
pub const DYNAMIC_PAYLOAD_TYPE_MAX: u8 = 126;

/// Everything that makes two RTP formats distinct for payload type purposes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PayloadTypeKey {
    pub codec: Codec,
    pub profile: Option<String>,
    /// Clock rate for video, sample rate or bitrate for audio
    pub clock_rate: u32,
    pub channel_count: u8,
}

#[derive(Debug)]
pub struct PayloadTypeAllocator {
    assigned: HashMap<PayloadTypeKey, u8>,
    next: u8,
}

impl PayloadTypeAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            assigned: HashMap::new(),
            next: DYNAMIC_PAYLOAD_TYPE_MIN,
        }
    }

    /// Payload type for `key`, allocating the next free one on first use.
    pub fn payload_type(&mut self, key: &PayloadTypeKey) -> Result<u8> {
        if let Some(pt) = self.assigned.get(key) {
            return Ok(*pt);
        }
        if self.next > DYNAMIC_PAYLOAD_TYPE_MAX {
            return Err(Error::Exhausted);
        }

        let pt = self.next;
        self.next += 1;
        self.assigned.insert(key.clone(), pt);
        Ok(pt)
    }

    #[must_use]
    pub fn get(&self, key: &PayloadTypeKey) -> Option<u8> {
        self.assigned.get(key).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}

impl Default for PayloadTypeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct SsrcAllocator {
    reserved: HashSet<u32>,
}

impl SsrcAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a fresh SSRC from `[1, 2^32 - 1]` that has never been returned
    /// or reserved, and reserve it.
    pub fn next(&mut self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(1..=u32::MAX);
            if self.reserved.insert(candidate) {
                return candidate;
            }
        }
    }

    /// Mark `ssrc` as taken. Reserving an already reserved value is a no-op.
    pub fn reserve(&mut self, ssrc: u32) {
        self.reserved.insert(ssrc);
    }

    /// Give back an SSRC that never reached the engine.
    pub fn release(&mut self, ssrc: u32) -> bool {
        self.reserved.remove(&ssrc)
    }

    #[must_use]
    pub fn is_reserved(&self, ssrc: u32) -> bool {
        self.reserved.contains(&ssrc)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(clock_rate: u32) -> PayloadTypeKey {
        PayloadTypeKey {
            codec: Codec::H264,
            profile: None,
            clock_rate,
            channel_count: 0,
        }
    }

    #[test]
    fn test_payload_type_is_idempotent() {
        let mut alloc = PayloadTypeAllocator::new();
        let k = PayloadTypeKey {
            codec: Codec::Opus,
            profile: Some("minptime=10;useinbandfec=1".to_string()),
            clock_rate: 48000,
            channel_count: 2,
        };
        let first = alloc.payload_type(&k).unwrap();
        let second = alloc.payload_type(&k).unwrap();
        assert_eq!(first, 96);
        assert_eq!(first, second);
        assert_eq!(alloc.len(), 1);
    }

    #[test]
    fn test_payload_types_distinct_then_exhausted() {
        let mut alloc = PayloadTypeAllocator::new();
        let mut seen = HashSet::new();
        for i in 0..31 {
            let pt = alloc.payload_type(&key(90_000 + i)).unwrap();
            assert!((DYNAMIC_PAYLOAD_TYPE_MIN..=DYNAMIC_PAYLOAD_TYPE_MAX).contains(&pt));
            assert!(seen.insert(pt), "payload type {pt} handed out twice");
        }
        assert_eq!(alloc.payload_type(&key(1)), Err(Error::Exhausted));

        // Keys seen before still resolve after exhaustion.
        assert_eq!(alloc.payload_type(&key(90_000)).unwrap(), 96);
        assert_eq!(alloc.payload_type(&key(90_030)).unwrap(), 126);
    }

    #[test]
    fn test_profile_and_channels_are_part_of_the_key() {
        let mut alloc = PayloadTypeAllocator::new();
        let base = key(90_000);
        let profiled = PayloadTypeKey {
            profile: Some("profile-level-id=42e01f".to_string()),
            ..base.clone()
        };
        let stereo = PayloadTypeKey {
            channel_count: 2,
            ..base.clone()
        };
        let a = alloc.payload_type(&base).unwrap();
        let b = alloc.payload_type(&profiled).unwrap();
        let c = alloc.payload_type(&stereo).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(alloc.get(&profiled), Some(b));
    }

    #[test]
    fn test_ssrcs_never_collide() {
        let mut alloc = SsrcAllocator::new();
        let mut seen = HashSet::new();
        for i in 0..2_000u32 {
            if i % 3 == 0 {
                let remote = i.wrapping_mul(2_654_435_761) | 1;
                alloc.reserve(remote);
                seen.insert(remote);
            } else {
                let ssrc = alloc.next();
                assert_ne!(ssrc, 0);
                assert!(seen.insert(ssrc), "ssrc {ssrc} returned twice");
            }
        }
        assert_eq!(alloc.len(), seen.len());
    }

    #[test]
    fn test_reserving_returned_ssrc_is_noop() {
        let mut alloc = SsrcAllocator::new();
        let ssrc = alloc.next();
        alloc.reserve(ssrc);
        assert_eq!(alloc.len(), 1);
        assert!(alloc.is_reserved(ssrc));

        let other = alloc.next();
        assert_ne!(other, ssrc);
    }

    #[test]
    fn test_released_ssrc_is_free_again() {
        let mut alloc = SsrcAllocator::new();
        let ssrc = alloc.next();
        assert!(alloc.release(ssrc));
        assert!(!alloc.release(ssrc));
        assert!(!alloc.is_reserved(ssrc));
        assert!(alloc.is_empty());
    }
}

//! `SyncTV` SFU (Selective Forwarding Unit)
//!
//! Relays RTP between peer connections that were negotiated independently of
//! each other. Each leg allocates its own SSRC and payload type, so the SFU
//! translates both header fields on every forwarded packet and relays key
//! frame requests back towards the sender.
//!
//! ## Architecture
//!
//! - **`SfuRoom`**: Registers the SFU-side peer connection of every
//!   participant and owns the forwarding units between them
//! - **`MediaForwardingUnit`**: Relays one inbound track to a send-only track
//!   on another peer connection
//! - **`rtp`**: Fixed-header SSRC and payload type rewriting
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synctv_sfu::{PeerId, RoomId, SfuConfig, SfuRoom};
//!
//! let room = SfuRoom::new(RoomId::new("room_id"), Arc::new(SfuConfig::default()));
//! room.add_peer(PeerId::new("alice"), alice_pc)?;
//! room.add_peer(PeerId::new("bob"), bob_pc)?;
//! let units = room.forward_to_all(&PeerId::new("alice"), &alice_camera)?;
//! ```

mod config;
mod error;
mod forwarding;
mod room;
pub mod rtp;
mod types;

pub use config::{SfuConfig, SfuSettings};
pub use error::{Result, SfuError};
pub use forwarding::{ForwardingOptions, ForwardingStats, MediaForwardingUnit};
pub use room::{RoomStats, SfuRoom};
pub use types::{ForwardKey, PeerId, RoomId};

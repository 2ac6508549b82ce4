//! # signalmesh-voice
//!
//! The core of the SFU: `SignalBody`/`Signaler` (the negotiation wire
//! contract), `Negotiator` (Perfect Negotiation), the `PeerConnection`
//! capability boundary and its `str0m`-backed adapter, the SFU routing
//! table, and the signalling Gateway that ties a user's control-channel
//! socket to a peer connection and negotiator.

pub mod gateway;
pub mod negotiator;
pub mod rtc;
pub mod sfu;
pub mod signaling;

pub use gateway::{build_router, GatewayState};
pub use negotiator::Negotiator;
pub use rtc::{PeerConnection, PeerEvent, Str0mPeer};
pub use sfu::{Sfu, TrackKey};
pub use signaling::{ControlMessage, IceCandidateInit, SessionDescription, SignalBody, Signaler};

//! # Protocol Negotiation
//!
//! Connection header exchange that precedes all framed traffic.
//!
//! ## Handshake Flow
//! 1. Initiator sends its header: magic, version, initial ration, flags
//! 2. Responder checks magic and version, replies with its own header
//! 3. Initiator validates the reply; both sides then exchange frames
//!
//! Either side learns the peer's initial inbound ration from its header and
//! uses it as the starting outbound credit of every session.

pub mod handshake;

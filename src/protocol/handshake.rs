//! Connection header exchange.
//!
//! Both sides open the connection with an 8-byte header:
//!
//! ```text
//! [Magic(4)] [Version(1)] [Ration(2)] [Flags(1)]
//! ```
//!
//! The ration field holds bits 8-23 of the sender's initial inbound ration,
//! so `ration = field << 8` and the low eight bits are always zero. The
//! initiator may set [`FLAG_NEGOTIATE`] to let a responder running an older
//! version answer with its own instead of rejecting the connection.
//!
//! The initiator sends first; the responder validates it and replies. Magic is
//! checked byte by byte by the parser as bytes arrive; everything else is
//! validated here once the full header is available.

use crate::config::{MAGIC_BYTES, PROTOCOL_VERSION};
use crate::error::{constants, MuxError, Result};

use tracing::{debug, instrument, warn};

/// Length of a connection header on the wire
pub const HEADER_LEN: usize = 8;

/// Bits of an initial ration representable in the header
pub const RATION_MASK: u32 = 0x00FF_FF00;

/// Initiator flag: accept a responder answering with an older version
pub const FLAG_NEGOTIATE: u8 = 0x80;

/// Encode an initial ration into the 16-bit header field.
///
/// # Errors
/// Returns `MuxError::InvalidRation` if any bit outside [`RATION_MASK`] is set.
pub fn encode_ration(ration: u32) -> Result<u16> {
    if ration & !RATION_MASK != 0 {
        return Err(MuxError::InvalidRation(ration));
    }
    Ok((ration >> 8) as u16)
}

/// Decode the 16-bit header field back into a byte ration.
pub fn decode_ration(field: u16) -> u32 {
    u32::from(field) << 8
}

/// A parsed or to-be-sent connection header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    pub version: u8,
    pub ration: u32,
    pub flags: u8,
}

impl ConnectionHeader {
    /// Build the header an initiator sends.
    pub fn initiator(ration: u32, negotiate: bool) -> Result<Self> {
        encode_ration(ration)?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            ration,
            flags: if negotiate { FLAG_NEGOTIATE } else { 0 },
        })
    }

    /// Build the header a responder replies with.
    pub fn responder(version: u8, ration: u32) -> Result<Self> {
        encode_ration(ration)?;
        Ok(Self {
            version,
            ration,
            flags: 0,
        })
    }

    /// Whether the initiator asked for version negotiation.
    pub fn negotiate(&self) -> bool {
        self.flags & FLAG_NEGOTIATE != 0
    }

    /// Serialize to wire form.
    pub fn to_bytes(&self) -> Result<[u8; HEADER_LEN]> {
        let field = encode_ration(self.ration)?.to_be_bytes();
        Ok([
            MAGIC_BYTES[0],
            MAGIC_BYTES[1],
            MAGIC_BYTES[2],
            MAGIC_BYTES[3],
            self.version,
            field[0],
            field[1],
            self.flags,
        ])
    }

    /// Parse a complete header, checking the magic.
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        if bytes[..4] != MAGIC_BYTES {
            return Err(MuxError::Handshake(constants::ERR_BAD_MAGIC.into()));
        }
        Ok(Self {
            version: bytes[4],
            ration: decode_ration(u16::from_be_bytes([bytes[5], bytes[6]])),
            flags: bytes[7],
        })
    }
}

/// Whether `byte` is valid at `position` of a header still being received.
///
/// Lets the parser reject a wrong prefix without waiting for eight bytes.
pub fn magic_byte_ok(position: usize, byte: u8) -> bool {
    position >= MAGIC_BYTES.len() || MAGIC_BYTES[position] == byte
}

/// Validate an initiator header on the responder side.
///
/// # Returns
/// The version the responder answers with.
///
/// # Errors
/// `Handshake` for version 0, `UnsupportedVersion` for a newer version
/// without the negotiate flag.
#[instrument(level = "debug")]
pub fn responder_accept(header: &ConnectionHeader, local_version: u8) -> Result<u8> {
    if header.version == 0 {
        return Err(MuxError::Handshake(constants::ERR_ZERO_VERSION.into()));
    }
    if header.version > local_version {
        if header.negotiate() {
            debug!(
                peer_version = header.version,
                local_version, "Negotiating protocol version down"
            );
            return Ok(local_version);
        }
        warn!(peer_version = header.version, "Rejecting newer protocol version");
        return Err(MuxError::UnsupportedVersion(header.version));
    }
    Ok(header.version)
}

/// Validate a responder header on the initiator side.
///
/// # Returns
/// The negotiated version.
///
/// # Errors
/// `Handshake` for version 0, `UnsupportedVersion` for a version newer than
/// the initiator's own.
#[instrument(level = "debug")]
pub fn initiator_accept(header: &ConnectionHeader, local_version: u8) -> Result<u8> {
    if header.version == 0 {
        return Err(MuxError::Handshake(constants::ERR_ZERO_VERSION.into()));
    }
    if header.version > local_version {
        return Err(MuxError::UnsupportedVersion(header.version));
    }
    Ok(header.version)
}

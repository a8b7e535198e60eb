//! Frame definitions and the opcode bit layout.
//!
//! Every frame after the handshake starts with a 4-byte header:
//!
//! ```text
//! [Op(1)] [Session or reserved(1)] [Length / cookie / increment (2, BE)] [Body(N)]
//! ```
//!
//! The op byte is bit-packed; it is decoded exactly once into [`Op`] and the
//! rest of the crate only ever sees [`Frame`] variants with named fields.
//!
//! | op byte    | frame             |
//! |------------|-------------------|
//! | `00000000` | no-op             |
//! | `00000010` | shutdown          |
//! | `00000100` | ping              |
//! | `00000110` | ping-ack          |
//! | `00001000` | error             |
//! | `0001sss0` | increment-ration  |
//! | `001000p0` | abort             |
//! | `00110000` | close             |
//! | `01000000` | acknowledgment    |
//! | `100ocea0` | data              |

use crate::error::{MuxError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Length of a frame header on the wire
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest body a single frame can carry
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Largest left shift an increment-ration frame can express
pub const MAX_INCREMENT_SHIFT: u8 = 7;

const OP_NO_OP: u8 = 0x00;
const OP_SHUTDOWN: u8 = 0x02;
const OP_PING: u8 = 0x04;
const OP_PING_ACK: u8 = 0x06;
const OP_ERROR: u8 = 0x08;
const OP_INCREMENT_RATION: u8 = 0x10;
const OP_ABORT: u8 = 0x20;
const OP_CLOSE: u8 = 0x30;
const OP_ACKNOWLEDGMENT: u8 = 0x40;
const OP_DATA: u8 = 0x80;

const INCREMENT_MASK: u8 = 0xF1;
const ABORT_MASK: u8 = 0xFD;
const ABORT_PARTIAL: u8 = 0x02;
const DATA_MASK: u8 = 0xE1;
const DATA_OPEN: u8 = 0x10;
const DATA_CLOSE: u8 = 0x08;
const DATA_EOF: u8 = 0x04;
const DATA_ACK_REQUIRED: u8 = 0x02;

/// One-byte session identifier (0-255)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u8);

impl SessionId {
    /// Largest valid identifier
    pub const MAX: usize = u8::MAX as usize;

    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Slot index in the session table.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<usize> for SessionId {
    type Error = MuxError;

    fn try_from(value: usize) -> Result<Self> {
        u8::try_from(value)
            .map(SessionId)
            .map_err(|_| MuxError::InvalidSessionId(value))
    }
}

impl From<u8> for SessionId {
    fn from(value: u8) -> Self {
        SessionId(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flags carried by a data frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataFlags {
    /// First frame of a new session
    pub open: bool,
    /// Sender is done with the session (initiator only)
    pub close: bool,
    /// Last data the sender will send
    pub eof: bool,
    /// Sender wants an acknowledgment once EOF is observed (initiator only)
    pub ack_required: bool,
}

impl DataFlags {
    fn from_op(op: u8) -> Self {
        Self {
            open: op & DATA_OPEN != 0,
            close: op & DATA_CLOSE != 0,
            eof: op & DATA_EOF != 0,
            ack_required: op & DATA_ACK_REQUIRED != 0,
        }
    }

    fn to_op(self) -> u8 {
        let mut op = OP_DATA;
        if self.open {
            op |= DATA_OPEN;
        }
        if self.close {
            op |= DATA_CLOSE;
        }
        if self.eof {
            op |= DATA_EOF;
        }
        if self.ack_required {
            op |= DATA_ACK_REQUIRED;
        }
        op
    }

    /// Close and ack-required only make sense on the final frame.
    pub fn validate(self) -> Result<()> {
        if (self.close || self.ack_required) && !self.eof {
            return Err(MuxError::violation(
                "data frame sets close or ack-required without eof",
            ));
        }
        Ok(())
    }
}

/// Decoded operation code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    NoOp,
    Shutdown,
    Ping,
    PingAck,
    Error,
    IncrementRation { shift: u8 },
    Abort { partial: bool },
    Close,
    Acknowledgment,
    Data(DataFlags),
}

impl Op {
    /// Decode an op byte; `None` for codes the protocol does not define.
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte & DATA_MASK == OP_DATA {
            return Some(Op::Data(DataFlags::from_op(byte)));
        }
        if byte & INCREMENT_MASK == OP_INCREMENT_RATION {
            return Some(Op::IncrementRation {
                shift: (byte >> 1) & 0x07,
            });
        }
        if byte & ABORT_MASK == OP_ABORT {
            return Some(Op::Abort {
                partial: byte & ABORT_PARTIAL != 0,
            });
        }
        match byte {
            OP_NO_OP => Some(Op::NoOp),
            OP_SHUTDOWN => Some(Op::Shutdown),
            OP_PING => Some(Op::Ping),
            OP_PING_ACK => Some(Op::PingAck),
            OP_ERROR => Some(Op::Error),
            OP_CLOSE => Some(Op::Close),
            OP_ACKNOWLEDGMENT => Some(Op::Acknowledgment),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Op::NoOp => OP_NO_OP,
            Op::Shutdown => OP_SHUTDOWN,
            Op::Ping => OP_PING,
            Op::PingAck => OP_PING_ACK,
            Op::Error => OP_ERROR,
            Op::IncrementRation { shift } => OP_INCREMENT_RATION | ((shift & 0x07) << 1),
            Op::Abort { partial } => {
                if partial {
                    OP_ABORT | ABORT_PARTIAL
                } else {
                    OP_ABORT
                }
            }
            Op::Close => OP_CLOSE,
            Op::Acknowledgment => OP_ACKNOWLEDGMENT,
            Op::Data(flags) => flags.to_op(),
        }
    }

    /// Whether byte 1 of the header names a session.
    pub fn is_session_op(self) -> bool {
        matches!(
            self,
            Op::IncrementRation { .. }
                | Op::Abort { .. }
                | Op::Close
                | Op::Acknowledgment
                | Op::Data(_)
        )
    }
}

/// A parsed frame header, before the body has arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub op: Op,
    pub session: u8,
    pub field: u16,
}

impl FrameHeader {
    pub fn parse(bytes: [u8; FRAME_HEADER_LEN]) -> Result<Self> {
        let op = Op::from_byte(bytes[0]).ok_or_else(|| {
            MuxError::violation(format!("unknown operation code {:#04x}", bytes[0]))
        })?;
        let session = bytes[1];
        let field = u16::from_be_bytes([bytes[2], bytes[3]]);

        if !op.is_session_op() && session != 0 {
            return Err(MuxError::violation(format!(
                "nonzero reserved byte {session:#04x} in {op:?} header"
            )));
        }
        if matches!(op, Op::Close | Op::Acknowledgment) && field != 0 {
            return Err(MuxError::violation(format!(
                "{op:?} frame declares a body of {field} bytes"
            )));
        }
        if let Op::Data(flags) = op {
            flags.validate()?;
        }
        Ok(Self { op, session, field })
    }

    /// Number of body bytes following this header.
    pub fn body_len(&self) -> usize {
        match self.op {
            Op::Ping | Op::PingAck | Op::IncrementRation { .. } => 0,
            Op::Close | Op::Acknowledgment => 0,
            _ => usize::from(self.field),
        }
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    NoOp { body: Bytes },
    Shutdown { message: String },
    Ping { cookie: u16 },
    PingAck { cookie: u16 },
    Error { message: String },
    IncrementRation { session: SessionId, shift: u8, value: u16 },
    Abort { session: SessionId, partial: bool, message: String },
    Close { session: SessionId },
    Acknowledgment { session: SessionId },
    Data { session: SessionId, flags: DataFlags, payload: Bytes },
}

impl Frame {
    /// Build a data frame.
    ///
    /// # Errors
    /// `BodyTooLarge` when the payload exceeds [`MAX_BODY_LEN`].
    pub fn data(session: SessionId, flags: DataFlags, payload: Bytes) -> Result<Self> {
        if payload.len() > MAX_BODY_LEN {
            return Err(MuxError::BodyTooLarge(payload.len()));
        }
        flags.validate()?;
        Ok(Frame::Data {
            session,
            flags,
            payload,
        })
    }

    pub fn abort(session: SessionId, partial: bool, message: &str) -> Self {
        Frame::Abort {
            session,
            partial,
            message: truncate_message(message),
        }
    }

    pub fn error(message: &str) -> Self {
        Frame::Error {
            message: truncate_message(message),
        }
    }

    pub fn shutdown(message: &str) -> Self {
        Frame::Shutdown {
            message: truncate_message(message),
        }
    }

    /// Build an increment-ration frame granting as much of `amount` as the
    /// encoding can express.
    ///
    /// # Returns
    /// The frame and the number of bytes it actually grants, or `None` when
    /// `amount` is zero.
    pub fn increment_ration(session: SessionId, amount: u32) -> Option<(Self, u32)> {
        let (shift, value) = encode_increment(amount)?;
        Some((
            Frame::IncrementRation {
                session,
                shift,
                value,
            },
            u32::from(value) << shift,
        ))
    }

    pub fn op(&self) -> Op {
        match self {
            Frame::NoOp { .. } => Op::NoOp,
            Frame::Shutdown { .. } => Op::Shutdown,
            Frame::Ping { .. } => Op::Ping,
            Frame::PingAck { .. } => Op::PingAck,
            Frame::Error { .. } => Op::Error,
            Frame::IncrementRation { shift, .. } => Op::IncrementRation { shift: *shift },
            Frame::Abort { partial, .. } => Op::Abort { partial: *partial },
            Frame::Close { .. } => Op::Close,
            Frame::Acknowledgment { .. } => Op::Acknowledgment,
            Frame::Data { flags, .. } => Op::Data(*flags),
        }
    }

    /// Session addressed by this frame, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Frame::IncrementRation { session, .. }
            | Frame::Abort { session, .. }
            | Frame::Close { session }
            | Frame::Acknowledgment { session }
            | Frame::Data { session, .. } => Some(*session),
            _ => None,
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            Frame::NoOp { body } => body,
            Frame::Shutdown { message } | Frame::Error { message } => message.as_bytes(),
            Frame::Abort { message, .. } => message.as_bytes(),
            Frame::Data { payload, .. } => payload,
            _ => &[],
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body().len()
    }

    /// Append the wire form of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let body = self.body();
        if body.len() > MAX_BODY_LEN {
            return Err(MuxError::BodyTooLarge(body.len()));
        }
        let session = self.session().map(SessionId::get).unwrap_or(0);
        let field = match self {
            Frame::Ping { cookie } | Frame::PingAck { cookie } => *cookie,
            Frame::IncrementRation { value, .. } => *value,
            _ => body.len() as u16,
        };

        dst.reserve(FRAME_HEADER_LEN + body.len());
        dst.put_u8(self.op().to_byte());
        dst.put_u8(session);
        dst.put_u16(field);
        dst.put_slice(body);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Assemble a frame from a parsed header and its complete body.
    pub fn from_parts(header: FrameHeader, body: Bytes) -> Result<Self> {
        let session = SessionId::new(header.session);
        let frame = match header.op {
            Op::NoOp => Frame::NoOp { body },
            Op::Shutdown => Frame::Shutdown {
                message: utf8_message(body)?,
            },
            Op::Ping => Frame::Ping {
                cookie: header.field,
            },
            Op::PingAck => Frame::PingAck {
                cookie: header.field,
            },
            Op::Error => Frame::Error {
                message: utf8_message(body)?,
            },
            Op::IncrementRation { shift } => Frame::IncrementRation {
                session,
                shift,
                value: header.field,
            },
            Op::Abort { partial } => Frame::Abort {
                session,
                partial,
                message: utf8_message(body)?,
            },
            Op::Close => Frame::Close { session },
            Op::Acknowledgment => Frame::Acknowledgment { session },
            Op::Data(flags) => Frame::Data {
                session,
                flags,
                payload: body,
            },
        };
        Ok(frame)
    }
}

/// Pick the smallest shift whose 16-bit value does not exceed `amount`.
///
/// Bits shifted out are not granted; callers carry them to the next increment.
pub fn encode_increment(amount: u32) -> Option<(u8, u16)> {
    if amount == 0 {
        return None;
    }
    let mut shift = 0u8;
    while shift < MAX_INCREMENT_SHIFT && (amount >> shift) > u32::from(u16::MAX) {
        shift += 1;
    }
    let value = (amount >> shift).min(u32::from(u16::MAX)) as u16;
    if value == 0 {
        return None;
    }
    Some((shift, value))
}

fn utf8_message(body: Bytes) -> Result<String> {
    String::from_utf8(body.to_vec())
        .map_err(|_| MuxError::violation("frame message is not valid UTF-8"))
}

fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_BODY_LEN {
        return message.to_owned();
    }
    let mut end = MAX_BODY_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_owned()
}

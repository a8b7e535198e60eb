//! Resumable frame parser.
//!
//! [`MuxCodec`] is a `tokio_util` codec that consumes input eagerly: every
//! byte handed to [`Decoder::decode`] is moved into the parser's own state, so
//! a header or body split across any number of reads is reassembled without
//! re-scanning. The parser walks four phases:
//!
//! ```text
//! AwaitInitiatorHeader ─┐
//!                       ├─> AwaitMessageHeader <─> AwaitMessageBody
//! AwaitResponderHeader ─┘
//! ```

use crate::core::frame::{Frame, FrameHeader, FRAME_HEADER_LEN};
use crate::error::{constants, MuxError, Result};
use crate::protocol::handshake::{magic_byte_ok, ConnectionHeader, HEADER_LEN};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Current position of the parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Responder waiting for the initiator's connection header
    AwaitInitiatorHeader,
    /// Initiator waiting for the responder's connection header
    AwaitResponderHeader,
    /// Between frames
    AwaitMessageHeader,
    /// Header parsed, collecting the body
    AwaitMessageBody,
}

/// Item produced by the parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Handshake(ConnectionHeader),
    Frame(Frame),
}

#[derive(Debug)]
pub struct MuxCodec {
    phase: Phase,
    partial: [u8; HEADER_LEN],
    filled: usize,
    pending: Option<FrameHeader>,
    body: BytesMut,
}

impl MuxCodec {
    /// Parser for the initiator side, expecting the responder's header first.
    pub fn initiator() -> Self {
        Self::with_phase(Phase::AwaitResponderHeader)
    }

    /// Parser for the responder side, expecting the initiator's header first.
    pub fn responder() -> Self {
        Self::with_phase(Phase::AwaitInitiatorHeader)
    }

    /// Parser that skips the handshake and reads frames directly.
    pub fn frames_only() -> Self {
        Self::with_phase(Phase::AwaitMessageHeader)
    }

    fn with_phase(phase: Phase) -> Self {
        Self {
            phase,
            partial: [0; HEADER_LEN],
            filled: 0,
            pending: None,
            body: BytesMut::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the parser holds part of an unfinished header or body.
    pub fn is_mid_item(&self) -> bool {
        self.filled > 0 || self.pending.is_some()
    }

    fn decode_connection_header(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        while self.filled < HEADER_LEN {
            if src.is_empty() {
                return Ok(None);
            }
            let byte = src.get_u8();
            if !magic_byte_ok(self.filled, byte) {
                return Err(MuxError::Handshake(constants::ERR_BAD_MAGIC.into()));
            }
            self.partial[self.filled] = byte;
            self.filled += 1;
        }
        self.filled = 0;
        self.phase = Phase::AwaitMessageHeader;
        let header = ConnectionHeader::from_bytes(&self.partial)?;
        Ok(Some(Inbound::Handshake(header)))
    }

    fn decode_frame_header(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        let take = (FRAME_HEADER_LEN - self.filled).min(src.len());
        src.copy_to_slice(&mut self.partial[self.filled..self.filled + take]);
        self.filled += take;
        if self.filled < FRAME_HEADER_LEN {
            return Ok(None);
        }
        self.filled = 0;

        let header = FrameHeader::parse([
            self.partial[0],
            self.partial[1],
            self.partial[2],
            self.partial[3],
        ])?;
        if header.body_len() == 0 {
            return Frame::from_parts(header, bytes::Bytes::new())
                .map(|frame| Some(Inbound::Frame(frame)));
        }
        self.body.reserve(header.body_len());
        self.pending = Some(header);
        self.phase = Phase::AwaitMessageBody;
        Ok(None)
    }

    fn decode_body(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        let Some(header) = self.pending else {
            return Err(MuxError::InvalidState("body phase without a header".into()));
        };
        let remaining = header.body_len() - self.body.len();
        let take = remaining.min(src.len());
        self.body.extend_from_slice(&src.split_to(take));
        if self.body.len() < header.body_len() {
            return Ok(None);
        }

        self.pending = None;
        self.phase = Phase::AwaitMessageHeader;
        let body = self.body.split().freeze();
        Frame::from_parts(header, body).map(|frame| Some(Inbound::Frame(frame)))
    }
}

impl Decoder for MuxCodec {
    type Item = Inbound;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        loop {
            let item = match self.phase {
                Phase::AwaitInitiatorHeader | Phase::AwaitResponderHeader => {
                    self.decode_connection_header(src)?
                }
                Phase::AwaitMessageHeader => self.decode_frame_header(src)?,
                Phase::AwaitMessageBody => self.decode_body(src)?,
            };
            if item.is_some() {
                return Ok(item);
            }
            if src.is_empty() {
                return Ok(None);
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if self.is_mid_item() || !matches!(self.phase, Phase::AwaitMessageHeader) {
            return Err(MuxError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                constants::ERR_CONNECTION_CLOSED,
            )));
        }
        Ok(None)
    }
}

impl Encoder<Frame> for MuxCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.encode(dst)
    }
}

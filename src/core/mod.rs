//! # Core Wire Components
//!
//! Frame layout, encoding and the resumable parser.
//!
//! This is the only part of the crate that knows how operations are packed
//! into bits. Everything above it works with [`frame::Frame`] values.
//!
//! ## Components
//! - **Frame**: tagged frame enum, opcode decoding, session identifiers
//! - **Codec**: Tokio codec reassembling frames from arbitrarily split input
//!
//! ## Wire Format
//! ```text
//! [Op(1)] [Session or reserved(1)] [Length / cookie / increment(2, BE)] [Body(N)]
//! ```
//!
//! ## Limits
//! - Maximum body size: 65535 bytes
//! - Session identifiers: 0-255

pub mod codec;
pub mod frame;

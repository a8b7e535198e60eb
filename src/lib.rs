//! # mux-protocol
//!
//! Connection multiplexing protocol engine: many independent, flow-controlled
//! duplex sessions over one ordered, reliable byte stream.
//!
//! ## Layers
//! - [`protocol`]: connection header exchange and version negotiation
//! - [`core`]: frame layout, encoding and the resumable parser
//! - [`mux`]: connection engine, sessions, I/O loops
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Failure model
//! - Handshake failures tear the connection down before any session exists.
//! - Any protocol violation tears down the whole connection after a
//!   best-effort Error frame.
//! - `Session::abort` affects only that session.

pub mod config;
pub mod core;
pub mod error;
pub mod mux;
pub mod protocol;
pub mod utils;

pub use config::MuxConfig;
pub use error::{DownReason, MuxError, Result};
pub use mux::{
    AcceptHook, Executor, HalfState, IoFuture, Mux, MuxBuilder, Role, Session, SessionReader,
    SessionWriter,
};

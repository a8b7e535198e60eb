//! # Connection Multiplexing
//!
//! Runs many flow-controlled sessions over one ordered byte stream.
//!
//! ## Components
//! - **connection**: [`Mux`], the engine owning the transport, the handshake,
//!   the session table and teardown
//! - **session**: per-session half-state machines and the
//!   [`SessionReader`]/[`SessionWriter`] endpoints
//! - **io**: send queue, writer loop and reader loop
//! - **future**: [`IoFuture`] completion handles for flushed sends
//! - **executor**: injected background [`Executor`]
//! - **lock**: lock wrappers enforcing the lock order
//!
//! ## Concurrency
//! Each connection runs one reader task and one writer task on its executor.
//! A session lock may be held while taking the connection lock, never the
//! other way round. Work that needs a session lock after a connection-wide
//! event (teardown, acknowledgment listeners) is handed to the executor.
//!
//! ## Example
//! ```rust,no_run
//! use mux_protocol::mux::MuxBuilder;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn run() -> mux_protocol::error::Result<()> {
//! let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//! let server = MuxBuilder::responder().build(server_io)?;
//! let client = MuxBuilder::initiator().build(client_io)?;
//! client.start().await?;
//!
//! let session = client.open()?;
//! let mut writer = session.writer();
//! writer.write_all(b"hello").await?;
//! writer.shutdown().await?;
//!
//! let accepted = server.accept().await.expect("session");
//! let mut received = Vec::new();
//! accepted.reader().read_to_end(&mut received).await?;
//! assert_eq!(received, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod executor;
pub mod future;
pub(crate) mod io;
pub(crate) mod lock;
pub mod session;

pub use connection::{AcceptHook, Mux, MuxBuilder, Role};
pub use executor::Executor;
pub use future::IoFuture;
pub use session::{HalfState, Session, SessionReader, SessionWriter};

//! Asynchronous, non-blocking socket transport with optional TLS and
//! stream compression.
//!
//! The crate revolves around [`Channel`], a single-connection byte pipe
//! driven entirely by readiness events from an external event loop. The
//! event loop is abstracted behind the [`Poller`] trait; the application
//! observes the channel through a [`ChannelHandler`]. On top of the raw
//! descriptor the channel can layer a TLS session (with an explicit
//! post-handshake trust decision) and a raw-deflate compression filter,
//! in either order, without the caller's read/write code changing.
//!
//! ```no_run
//! use std::sync::Arc;
//! use msync_transport::{Channel, ServerConfig};
//!
//! let conf = Arc::new(ServerConfig::new("imap.example.org", 143));
//! let chan = Channel::new(conf);
//! // chan.connect(&mut poller, &mut handler);
//! # let _ = chan;
//! ```

mod buffer;
mod queue;
mod tls;
mod zlib;

pub mod channel;
pub mod config;
pub mod error;
pub mod poller;

pub use buffer::READ_BUFFER_SIZE;
pub use channel::{Channel, ChannelHandler, ChannelState};
pub use config::{ServerConfig, TlsVersions};
pub use error::{Result, TransportError};
pub use poller::{Interest, Poller, Readiness};

//! Keep the last N bytes of a byte stream.
//!
//! [`RingBuffer`] is the core: a fixed-capacity byte ring that silently evicts
//! its oldest bytes and can hand back its contents oldest-first at any time.
//! The `capture` and `server` modules put it behind a CLI and an HTTP API.

pub mod buffer;
pub mod capture;
pub mod server;
pub mod utils;

pub use buffer::{BufferError, RingBuffer};

//! Wire-level building blocks of the delta-transfer protocol.
//!
//! Everything that crosses the peer stream is defined here: the framed
//! integer/buffer primitives ([`wire`]), the multiplex envelope that lets
//! diagnostics share the data stream ([`envelope`], [`mux`]), the
//! version/seed handshake ([`version`]), the match/literal token codec in
//! both plain and deflated forms ([`token`]), and the advisory exit-code
//! taxonomy ([`exit_code`]). The [`io`] module provides the in-memory
//! duplex stream the integration tests run the whole pipeline over.
//!
//! All multi-byte integers are little-endian; `u32 0xffffffff` (`-1` as a
//! signed value) is the universal end-of-stream sentinel.

pub mod envelope;
pub mod exit_code;
pub mod io;
pub mod mux;
pub mod token;
pub mod version;
pub mod wire;

pub use envelope::{MessageCode, MessageHeader, MAX_PAYLOAD_LENGTH, MPLEX_BASE};
pub use exit_code::{ExitCode, HasExitCode};
pub use mux::{DemuxReader, MessageSink, MuxWriter, TracingSink};
pub use token::{TokenCodec, TokenEvent};
pub use version::{setup_protocol, Role, SessionConfig, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
pub use wire::{ReadWire, WriteWire};

/// Default nominal block length for file signatures.
pub const BLOCK_SIZE: u32 = 700;

/// Unit of map-window reads and token literal chunking.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Floor for the sliding map-window allocation.
pub const MAX_MAP_SIZE: usize = 256 * 1024;

/// Capacity of the buffered stream writer.
pub const IO_BUFFER_SIZE: usize = 4092;

/// Full strong-checksum length in bytes.
pub const SUM_LENGTH: usize = 16;

/// Truncated block strong-checksum length used during phase 0.
pub const SHORT_SUM_LENGTH: usize = 2;

/// Longest path accepted from the wire.
pub const MAXPATHLEN: usize = 1024;

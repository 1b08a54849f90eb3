//! Checksum primitives for the delta-transfer engine.
//!
//! Two kinds of checksum cooperate during block matching:
//!
//! - [`RollingChecksum`]: a 32-bit Adler-style weak sum that can be slid
//!   one byte at a time in O(1), used to locate candidate blocks.
//! - [`BlockDigest`] / [`FileDigest`]: the 16-byte MD4 strong digest that
//!   confirms a weak-sum candidate and protects whole files against
//!   corruption on the wire.
//!
//! Both match the classic rsync wire format bit for bit, including the
//! checksum-seed mixing rules (the seed is appended after block data but
//! prepended to the whole-file accumulator).

mod rolling;
mod strong;

pub use rolling::{tag_for, RollingChecksum, RollingError, CHAR_OFFSET};
pub use strong::{BlockDigest, FileDigest, SUM_LENGTH};

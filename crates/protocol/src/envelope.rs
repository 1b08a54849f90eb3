//! Multiplex frame envelope.
//!
//! Once multiplexing starts, every outbound chunk is preceded by a
//! four-byte little-endian header packing the channel code and payload
//! length: `((MPLEX_BASE + code) << 24) | len`. Code 0 is the
//! application data stream; everything else is an out-of-band diagnostic
//! routed to the reader's message sink.

use std::io;

/// Bias added to [`MessageCode`] values in the frame header so that a
/// header byte is never mistaken for a protocol version during startup.
pub const MPLEX_BASE: u8 = 7;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload a single frame can describe (24-bit length field).
pub const MAX_PAYLOAD_LENGTH: u32 = 0x00ff_ffff;

/// Channel a multiplexed frame is addressed to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum MessageCode {
    /// The application data stream itself.
    Data = 0,
    /// An error message to surface on the remote end.
    Error = 1,
    /// An informational message.
    Info = 2,
    /// A message destined for the server log only.
    Log = 3,
}

impl MessageCode {
    /// Decodes a channel code from the biased header byte.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag.wrapping_sub(MPLEX_BASE) {
            0 => Some(Self::Data),
            1 => Some(Self::Error),
            2 => Some(Self::Info),
            3 => Some(Self::Log),
            _ => None,
        }
    }

    /// Returns the biased tag byte used on the wire.
    #[must_use]
    pub const fn tag(self) -> u8 {
        MPLEX_BASE + self as u8
    }
}

/// Decoded four-byte multiplex header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    code: MessageCode,
    payload_len: u32,
}

impl MessageHeader {
    /// Builds a header, validating the payload length against the 24-bit
    /// wire field.
    pub fn new(code: MessageCode, payload_len: u32) -> io::Result<Self> {
        if payload_len > MAX_PAYLOAD_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("multiplexed payload length {payload_len} exceeds maximum {MAX_PAYLOAD_LENGTH}"),
            ));
        }
        Ok(Self { code, payload_len })
    }

    /// Returns the channel code.
    #[must_use]
    pub const fn code(self) -> MessageCode {
        self.code
    }

    /// Returns the payload length in bytes.
    #[must_use]
    pub const fn payload_len(self) -> u32 {
        self.payload_len
    }

    /// Encodes the header into its wire representation.
    #[must_use]
    pub const fn encode(self) -> [u8; HEADER_LEN] {
        let word = ((self.code.tag() as u32) << 24) | self.payload_len;
        word.to_le_bytes()
    }

    /// Decodes a header from its wire representation.
    pub fn decode(bytes: [u8; HEADER_LEN]) -> io::Result<Self> {
        let word = u32::from_le_bytes(bytes);
        let tag = (word >> 24) as u8;
        let payload_len = word & MAX_PAYLOAD_LENGTH;
        let code = MessageCode::from_tag(tag).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected multiplex tag {tag}"),
            )
        })?;
        Ok(Self { code, payload_len })
    }
}

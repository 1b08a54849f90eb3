//! Framed integer and buffer primitives.
//!
//! Extension traits over [`std::io::Read`] / [`std::io::Write`] carrying
//! the little-endian wire conventions: 4-byte integers with `-1` as the
//! universal sentinel, and the split 4/12-byte `longint` encoding whose
//! 64-bit form is only used for peers speaking protocol 16 or newer.

use std::fmt;
use std::io::{self, Read, Write};

/// Longest formatted line [`WriteWire::write_printf`] will emit.
const PRINTF_TRUNCATE: usize = 1024;

/// Read-side wire primitives.
pub trait ReadWire: Read {
    /// Reads a single byte.
    fn read_byte(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    /// Reads a little-endian 32-bit integer. `0xffffffff` comes back as
    /// `-1`, the end-of-stream sentinel.
    fn read_int(&mut self) -> io::Result<i32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    /// Reads a possibly 64-bit integer.
    ///
    /// A value that fits in 32 bits arrives as a plain integer. The
    /// sentinel `0xffffffff` announces an 8-byte little-endian value for
    /// protocol ≥ 16; older peers cannot express one and the sentinel
    /// itself means `-1`.
    fn read_longint(&mut self, protocol: i32) -> io::Result<i64> {
        let first = self.read_int()?;
        if first != -1 {
            return Ok(i64::from(first));
        }
        if protocol < 16 {
            return Ok(-1);
        }
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    /// Reads exactly `len` bytes into a new buffer.
    fn read_vec(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads bytes up to a newline, which is consumed but not returned.
    /// Carriage returns are silently dropped.
    ///
    /// # Errors
    ///
    /// Fails on EOF, on an embedded NUL, and when `max` bytes arrive
    /// without a newline.
    fn read_line(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let byte = self.read_byte()?;
            match byte {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected NUL in line",
                    ))
                }
                b'\n' => return Ok(line),
                b'\r' => {}
                _ => {
                    if line.len() == max {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "line too long",
                        ));
                    }
                    line.push(byte);
                }
            }
        }
    }
}

impl<R: Read + ?Sized> ReadWire for R {}

/// Write-side wire primitives.
pub trait WriteWire: Write {
    /// Writes a single byte.
    fn write_byte(&mut self, value: u8) -> io::Result<()> {
        self.write_all(&[value])
    }

    /// Writes a little-endian 32-bit integer.
    fn write_int(&mut self, value: i32) -> io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    /// Writes a possibly 64-bit integer; see [`ReadWire::read_longint`]
    /// for the encoding rules.
    fn write_longint(&mut self, value: i64, protocol: i32) -> io::Result<()> {
        if protocol < 16 || value <= i64::from(i32::MAX) {
            return self.write_int(value as i32);
        }
        self.write_int(-1)?;
        self.write_all(&value.to_le_bytes())
    }

    /// Writes a formatted line, truncated at 1 KiB.
    fn write_printf(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        let mut text = args.to_string();
        text.truncate(PRINTF_TRUNCATE);
        self.write_all(text.as_bytes())
    }
}

impl<W: Write + ?Sized> WriteWire for W {}

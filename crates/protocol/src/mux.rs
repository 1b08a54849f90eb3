//! Output buffering and stream multiplexing.
//!
//! The write half of the peer stream is buffered (about 4 KiB) and, once
//! the protocol is set up, wrapped in tagged frames so diagnostics can
//! share the stream with bulk data. The read half demultiplexes below
//! the integer/buffer primitives: data frames are handed to the caller
//! byte for byte, anything else goes to the [`MessageSink`].

use std::io::{self, Read, Write};

use bandwidth::BandwidthLimiter;

use crate::envelope::{MessageCode, MessageHeader, HEADER_LEN, MAX_PAYLOAD_LENGTH};
use crate::IO_BUFFER_SIZE;

/// Largest diagnostic payload the demultiplexer will accept, matching
/// the line buffer the messages are rendered into.
const MAX_MESSAGE_LEN: u32 = 1024;

/// Receives out-of-band frames lifted out of the data stream.
pub trait MessageSink: Send {
    /// Handles one diagnostic message.
    fn handle(&mut self, code: MessageCode, payload: &[u8]);
}

/// Default sink forwarding peer diagnostics to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn handle(&mut self, code: MessageCode, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim_end_matches('\n');
        match code {
            MessageCode::Error => tracing::error!(target: "peer", "{text}"),
            MessageCode::Info => tracing::info!(target: "peer", "{text}"),
            MessageCode::Log | MessageCode::Data => {
                tracing::debug!(target: "peer", "{text}");
            }
        }
    }
}

/// Buffered, optionally multiplexed writer owning the outbound half of
/// the peer stream.
pub struct MuxWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
    multiplex: bool,
    limiter: Option<BandwidthLimiter>,
    total_written: u64,
}

impl<W: Write> MuxWriter<W> {
    /// Wraps a writer with a fresh output buffer; multiplexing starts
    /// disabled, as it must during protocol setup.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(IO_BUFFER_SIZE),
            multiplex: false,
            limiter: None,
            total_written: 0,
        }
    }

    /// Installs a bandwidth limiter applied to the physical writes.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Option<BandwidthLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Enables multiplexed framing for all subsequent output.
    pub fn start_multiplex(&mut self) -> io::Result<()> {
        self.flush()?;
        self.multiplex = true;
        Ok(())
    }

    /// Returns `true` once multiplexed framing is active.
    #[must_use]
    pub const fn multiplex_enabled(&self) -> bool {
        self.multiplex
    }

    /// Application bytes written so far (frame headers excluded, message
    /// frames counted with their header like the classic accounting).
    #[must_use]
    pub const fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Sends an out-of-band diagnostic frame, flushing buffered data
    /// first so ordering is preserved.
    ///
    /// Returns `Ok(false)` when multiplexing is not active; the caller
    /// is expected to log locally instead. A failed write disables
    /// multiplexing so that later error reporting cannot recurse into a
    /// dead stream.
    pub fn send_msg(&mut self, code: MessageCode, payload: &[u8]) -> io::Result<bool> {
        if !self.multiplex {
            return Ok(false);
        }
        if payload.len() as u64 > u64::from(MAX_PAYLOAD_LENGTH) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "diagnostic message too large for one frame",
            ));
        }
        self.flush()?;
        let header = MessageHeader::new(code, payload.len() as u32)?;
        let result = self
            .write_raw(&header.encode())
            .and_then(|()| self.write_raw(payload));
        if let Err(err) = result {
            self.multiplex = false;
            return Err(err);
        }
        self.total_written += (payload.len() + HEADER_LEN) as u64;
        Ok(true)
    }

    /// Flushes buffered application data, framing it when multiplexing
    /// is active, and flushes the underlying writer.
    pub fn flush_buffer(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            if self.multiplex {
                let header = MessageHeader::new(MessageCode::Data, self.buf.len() as u32)?;
                let encoded = header.encode();
                if let Err(err) = self.write_raw(&encoded) {
                    self.multiplex = false;
                    return Err(err);
                }
            }
            let pending = std::mem::take(&mut self.buf);
            if let Err(err) = self.write_raw(&pending) {
                self.multiplex = false;
                return Err(err);
            }
            self.buf = pending;
            self.buf.clear();
        }
        self.inner.flush()
    }

    /// Consumes the writer, flushing anything still buffered.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.flush_buffer()?;
        Ok(self.inner)
    }

    fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        if let Some(limiter) = &mut self.limiter {
            limiter.register(data.len());
        }
        Ok(())
    }
}

impl<W: Write> Write for MuxWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut rest = data;
        while !rest.is_empty() {
            let room = IO_BUFFER_SIZE - self.buf.len();
            let take = rest.len().min(room);
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == IO_BUFFER_SIZE {
                self.flush_buffer()?;
            }
        }
        self.total_written += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }
}

/// Demultiplexing reader owning the inbound half of the peer stream.
pub struct DemuxReader<R: Read> {
    inner: R,
    multiplex: bool,
    remaining: u32,
    sink: Box<dyn MessageSink>,
    total_read: u64,
}

impl<R: Read> DemuxReader<R> {
    /// Wraps a reader; demultiplexing starts disabled.
    pub fn new(inner: R) -> Self {
        Self::with_sink(inner, Box::new(TracingSink))
    }

    /// Wraps a reader with an explicit diagnostic sink.
    pub fn with_sink(inner: R, sink: Box<dyn MessageSink>) -> Self {
        Self {
            inner,
            multiplex: false,
            remaining: 0,
            sink,
            total_read: 0,
        }
    }

    /// Enables frame demultiplexing for all subsequent reads.
    pub fn start_multiplex(&mut self) {
        self.multiplex = true;
    }

    /// Returns `true` once demultiplexing is active.
    #[must_use]
    pub const fn multiplex_enabled(&self) -> bool {
        self.multiplex
    }

    /// Application bytes delivered so far.
    #[must_use]
    pub const fn total_read(&self) -> u64 {
        self.total_read
    }

    fn eof_error() -> io::Error {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection unexpectedly closed",
        )
    }

    fn read_app_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(Self::eof_error());
        }
        self.remaining -= n as u32;
        self.total_read += n as u64;
        Ok(n)
    }
}

impl<R: Read> Read for DemuxReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.multiplex {
            let n = self.inner.read(buf)?;
            self.total_read += n as u64;
            return Ok(n);
        }

        loop {
            if self.remaining > 0 {
                return self.read_app_bytes(buf);
            }

            let mut raw = [0u8; HEADER_LEN];
            self.inner.read_exact(&mut raw)?;
            let header = MessageHeader::decode(raw)?;

            match header.code() {
                MessageCode::Data => {
                    self.remaining = header.payload_len();
                }
                MessageCode::Error | MessageCode::Info => {
                    if header.payload_len() > MAX_MESSAGE_LEN {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("multiplexing overflow {}", header.payload_len()),
                        ));
                    }
                    let mut payload = vec![0u8; header.payload_len() as usize];
                    self.inner.read_exact(&mut payload)?;
                    self.sink.handle(header.code(), &payload);
                }
                MessageCode::Log => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected log frame on the data stream",
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct CollectingSink {
        messages: Arc<Mutex<Vec<(MessageCode, Vec<u8>)>>>,
    }

    impl MessageSink for CollectingSink {
        fn handle(&mut self, code: MessageCode, payload: &[u8]) {
            self.messages
                .lock()
                .expect("sink lock")
                .push((code, payload.to_vec()));
        }
    }

    #[test]
    fn plain_mode_is_a_passthrough() {
        let mut writer = MuxWriter::new(Vec::new());
        writer.write_all(b"hello").unwrap();
        writer.flush().unwrap();
        let bytes = writer.into_inner().unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn multiplexed_data_round_trips() {
        let mut writer = MuxWriter::new(Vec::new());
        writer.start_multiplex().unwrap();
        writer.write_all(b"payload bytes").unwrap();
        writer.flush().unwrap();
        let wire = writer.into_inner().unwrap();
        // one header plus the payload
        assert_eq!(wire.len(), HEADER_LEN + 13);

        let mut reader = DemuxReader::new(&wire[..]);
        reader.start_multiplex();
        let mut out = vec![0u8; 13];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, b"payload bytes");
    }

    #[test]
    fn diagnostics_are_lifted_out_of_band() {
        let sink = CollectingSink::default();
        let messages = Arc::clone(&sink.messages);

        let mut writer = MuxWriter::new(Vec::new());
        writer.start_multiplex().unwrap();
        writer.write_all(b"data-before").unwrap();
        assert!(writer.send_msg(MessageCode::Error, b"disk on fire").unwrap());
        writer.write_all(b"data-after").unwrap();
        writer.flush().unwrap();
        let wire = writer.into_inner().unwrap();

        let mut reader = DemuxReader::with_sink(&wire[..], Box::new(sink));
        reader.start_multiplex();
        let mut out = vec![0u8; b"data-before".len() + b"data-after".len()];
        reader.read_exact(&mut out).unwrap();

        assert_eq!(&out[..11], b"data-before");
        assert_eq!(&out[11..], b"data-after");
        let seen = messages.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, MessageCode::Error);
        assert_eq!(seen[0].1, b"disk on fire");
    }

    #[test]
    fn send_msg_without_multiplex_reports_false() {
        let mut writer = MuxWriter::new(Vec::new());
        assert!(!writer.send_msg(MessageCode::Info, b"too early").unwrap());
    }

    #[test]
    fn large_writes_split_into_buffer_sized_frames() {
        let payload = vec![0xabu8; IO_BUFFER_SIZE * 2 + 100];
        let mut writer = MuxWriter::new(Vec::new());
        writer.start_multiplex().unwrap();
        writer.write_all(&payload).unwrap();
        writer.flush().unwrap();
        let wire = writer.into_inner().unwrap();

        let mut reader = DemuxReader::new(&wire[..]);
        reader.start_multiplex();
        let mut out = vec![0u8; payload.len()];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn truncated_frame_is_an_unexpected_eof() {
        let mut writer = MuxWriter::new(Vec::new());
        writer.start_multiplex().unwrap();
        writer.write_all(b"some data").unwrap();
        writer.flush().unwrap();
        let mut wire = writer.into_inner().unwrap();
        wire.truncate(wire.len() - 3);

        let mut reader = DemuxReader::new(&wire[..]);
        reader.start_multiplex();
        let mut out = vec![0u8; 9];
        let err = reader.read_exact(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_diagnostic_is_rejected() {
        let header = MessageHeader::new(MessageCode::Info, MAX_MESSAGE_LEN + 1).unwrap();
        let mut wire = header.encode().to_vec();
        wire.extend(std::iter::repeat(0u8).take((MAX_MESSAGE_LEN + 1) as usize));

        let mut reader = DemuxReader::new(&wire[..]);
        reader.start_multiplex();
        let mut out = [0u8; 1];
        let err = reader.read(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn byte_accounting_tracks_application_bytes() {
        let mut writer = MuxWriter::new(Vec::new());
        writer.start_multiplex().unwrap();
        writer.write_all(b"12345").unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.total_written(), 5);
        writer.send_msg(MessageCode::Info, b"msg").unwrap();
        // message frames count header + payload
        assert_eq!(writer.total_written(), 5 + 4 + 3);
    }
}

//! In-memory duplex byte streams.
//!
//! The engine is written against plain [`Read`]/[`Write`] halves so it
//! can run over any transport the caller establishes. This module
//! provides the channel-backed pipe used to wire two in-process peers
//! together, mainly by the integration tests. The reader honours an
//! optional inactivity timeout, surfacing expiry as
//! [`std::io::ErrorKind::TimedOut`] exactly where a socket read would.

use std::io::{self, Read, Write};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

/// Number of in-flight chunks a pipe buffers before the writer blocks.
/// Bounded so pipe buffering provides backpressure the way kernel
/// buffers do for the real transports.
const PIPE_DEPTH: usize = 64;

/// Write half of an in-memory pipe.
#[derive(Debug)]
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

/// Read half of an in-memory pipe.
#[derive(Debug)]
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
    timeout: Option<Duration>,
}

/// Creates a unidirectional in-memory pipe.
#[must_use]
pub fn pipe(timeout: Option<Duration>) -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(PIPE_DEPTH);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: Vec::new(),
            pos: 0,
            timeout,
        },
    )
}

/// Creates a full-duplex connection: two `(reader, writer)` endpoints
/// whose writes surface on the other side's reader.
#[must_use]
pub fn duplex(timeout: Option<Duration>) -> ((PipeReader, PipeWriter), (PipeReader, PipeWriter)) {
    let (a_tx, b_rx) = pipe(timeout);
    let (b_tx, a_rx) = pipe(timeout);
    ((a_rx, a_tx), (b_rx, b_tx))
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed the stream"))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PipeReader {
    fn refill(&mut self) -> io::Result<bool> {
        let chunk = match self.timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(chunk) => chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "io timeout waiting for peer data",
                    ))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(false),
            },
            None => match self.rx.recv() {
                Ok(chunk) => chunk,
                Err(_) => return Ok(false),
            },
        };
        self.pending = chunk;
        self.pos = 0;
        Ok(true)
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.pending.len() {
            if !self.refill()? {
                return Ok(0);
            }
        }
        let available = &self.pending[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

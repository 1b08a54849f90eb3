//! Protocol version negotiation and checksum-seed exchange.
//!
//! The very first bytes on the stream are the peers' protocol versions,
//! one little-endian integer each. The common version is the minimum of
//! the two; a remote version outside the supported window aborts the
//! session. For version 12 and newer the server then sends the 32-bit
//! checksum seed that is mixed into every strong digest of the transfer.

use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::wire::{ReadWire, WriteWire};

/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: i32 = 26;

/// Oldest peer protocol accepted.
pub const MIN_PROTOCOL_VERSION: i32 = 15;

/// Newest peer protocol accepted.
pub const MAX_PROTOCOL_VERSION: i32 = 30;

/// Which side of the connection this process is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// The invoked side; picks the checksum seed.
    Server,
    /// The invoking side; receives the checksum seed.
    Client,
}

/// Result of the startup handshake.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionConfig {
    /// Negotiated protocol version, `min(local, remote)`.
    pub protocol: i32,
    /// Seed mixed into every strong-checksum computation.
    pub checksum_seed: u32,
}

fn default_seed() -> u32 {
    // wall-clock seconds, like the original server; uniqueness per
    // session is all that matters
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0x7fff)
}

/// Runs the startup handshake on a fresh stream.
///
/// The server reads the remote version before answering with its own;
/// the client writes first. `seed` overrides the server's generated
/// checksum seed (clients ignore it).
///
/// # Errors
///
/// Fails with [`io::ErrorKind::InvalidData`] when the remote version is
/// outside `[MIN_PROTOCOL_VERSION, MAX_PROTOCOL_VERSION]`, and with any
/// underlying transport error.
pub fn setup_protocol<R, W>(
    reader: &mut R,
    writer: &mut W,
    role: Role,
    seed: Option<u32>,
) -> io::Result<SessionConfig>
where
    R: Read,
    W: Write,
{
    let remote = match role {
        Role::Server => {
            let remote = reader.read_int()?;
            writer.write_int(PROTOCOL_VERSION)?;
            writer.flush()?;
            remote
        }
        Role::Client => {
            writer.write_int(PROTOCOL_VERSION)?;
            writer.flush()?;
            reader.read_int()?
        }
    };

    if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&remote) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "protocol version mismatch: peer speaks {remote}, supported range is \
                 {MIN_PROTOCOL_VERSION}-{MAX_PROTOCOL_VERSION} - is your shell clean?"
            ),
        ));
    }

    let protocol = remote.min(PROTOCOL_VERSION);

    let checksum_seed = if protocol >= 12 {
        match role {
            Role::Server => {
                let seed = seed.unwrap_or_else(default_seed);
                writer.write_int(seed as i32)?;
                writer.flush()?;
                seed
            }
            Role::Client => reader.read_int()? as u32,
        }
    } else {
        0
    };

    tracing::debug!(protocol, checksum_seed, "protocol setup complete");

    Ok(SessionConfig {
        protocol,
        checksum_seed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::duplex;

    #[test]
    fn client_and_server_agree() {
        let ((mut srv_rx, mut srv_tx), (mut cli_rx, mut cli_tx)) = duplex(None);

        let server = std::thread::spawn(move || {
            setup_protocol(&mut srv_rx, &mut srv_tx, Role::Server, Some(0xfeed))
        });
        let client = setup_protocol(&mut cli_rx, &mut cli_tx, Role::Client, None).unwrap();
        let server = server.join().unwrap().unwrap();

        assert_eq!(server.protocol, PROTOCOL_VERSION);
        assert_eq!(client.protocol, PROTOCOL_VERSION);
        assert_eq!(server.checksum_seed, 0xfeed);
        assert_eq!(client.checksum_seed, 0xfeed);
    }

    #[test]
    fn old_peer_is_rejected() {
        let mut input = Vec::new();
        input.write_int(12).unwrap();
        let mut output = Vec::new();
        let err = setup_protocol(&mut &input[..], &mut output, Role::Server, None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn future_peer_is_rejected() {
        let mut input = Vec::new();
        input.write_int(MAX_PROTOCOL_VERSION + 1).unwrap();
        let mut output = Vec::new();
        let err = setup_protocol(&mut &input[..], &mut output, Role::Server, None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn negotiated_version_is_the_minimum() {
        // a protocol-20 peer talks to our 26; both sides settle on 20
        let mut input = Vec::new();
        input.write_int(20).unwrap();
        input.write_int(0).unwrap(); // unused seed slot for the client read
        let mut output = Vec::new();
        let session =
            setup_protocol(&mut &input[..], &mut output, Role::Server, Some(7)).unwrap();
        assert_eq!(session.protocol, 20);
    }
}

//! Block signatures of a destination file.
//!
//! The generator reads the receiver's copy of a file and describes it as
//! a sequence of fixed-size blocks, each carrying the 32-bit rolling
//! checksum and a strong digest truncated to the phase's checksum
//! length. The sender holds a [`Signatures`] set for exactly one file at
//! a time while the matcher runs against it.

use std::io::{self, Read, Write};

use checksums::{BlockDigest, RollingChecksum, SUM_LENGTH};
use protocol::wire::{ReadWire, WriteWire};
use protocol::{BLOCK_SIZE, CHUNK_SIZE};

/// Upper bound on the block count a peer may announce for one file,
/// keeping a hostile header from forcing a huge allocation.
const MAX_BLOCK_COUNT: i32 = i32::MAX / 32;

/// One block's signature.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SumBuf {
    /// Rolling weak checksum of the block.
    pub sum1: u32,
    /// Strong digest; only the first `csum_len` bytes are meaningful.
    pub sum2: [u8; SUM_LENGTH],
    /// Byte offset of the block in the file.
    pub offset: u64,
    /// Block length; the final block may be short.
    pub len: u32,
}

/// Signature set for one file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signatures {
    /// Nominal block length.
    pub block_len: u32,
    /// Length of the final block, or 0 when the file divides evenly.
    pub remainder: u32,
    /// Per-block signatures, in file order.
    pub blocks: Vec<SumBuf>,
    /// Total length covered by the blocks.
    pub file_len: u64,
}

impl Signatures {
    /// Number of blocks.
    #[must_use]
    pub fn count(&self) -> usize {
        self.blocks.len()
    }

    /// An empty set announcing "no basis file" with the given nominal
    /// block length.
    #[must_use]
    pub fn empty(block_len: u32) -> Self {
        Self {
            block_len,
            remainder: 0,
            blocks: Vec::new(),
            file_len: 0,
        }
    }

    /// Builds signatures over `len` bytes read from `source`, one
    /// checksum pair roughly every `block_len` bytes.
    pub fn generate<R: Read>(
        source: &mut R,
        len: u64,
        block_len: u32,
        seed: u32,
    ) -> io::Result<Self> {
        let block_len = block_len.max(1);
        let remainder = (len % u64::from(block_len)) as u32;
        let count = len.div_ceil(u64::from(block_len));

        let mut sigs = Self {
            block_len,
            remainder,
            blocks: Vec::with_capacity(count as usize),
            file_len: len,
        };

        let mut buf = vec![0u8; block_len as usize];
        let mut offset = 0u64;
        let mut left = len;
        while left > 0 {
            let n1 = left.min(u64::from(block_len)) as usize;
            source.read_exact(&mut buf[..n1])?;

            sigs.blocks.push(SumBuf {
                sum1: RollingChecksum::from_block(&buf[..n1]).value(),
                sum2: BlockDigest::digest(&buf[..n1], seed),
                offset,
                len: n1 as u32,
            });

            offset += n1 as u64;
            left -= n1 as u64;
        }

        tracing::trace!(
            count = sigs.count(),
            block_len,
            remainder,
            "generated signatures"
        );
        Ok(sigs)
    }

    /// Writes the signature header and blocks; strong digests are
    /// truncated to `csum_len`.
    pub fn send<W: Write>(&self, f: &mut W, csum_len: usize) -> io::Result<()> {
        f.write_int(self.count() as i32)?;
        f.write_int(self.block_len as i32)?;
        f.write_int(self.remainder as i32)?;
        for block in &self.blocks {
            f.write_int(block.sum1 as i32)?;
            f.write_all(&block.sum2[..csum_len])?;
        }
        Ok(())
    }

    /// Writes an empty header: no basis file on the receiving side.
    pub fn send_empty<W: Write>(f: &mut W, block_len: u32) -> io::Result<()> {
        f.write_int(0)?;
        f.write_int(block_len as i32)?;
        f.write_int(0)
    }

    /// Reads a signature set, reconstructing per-block offsets and
    /// lengths from the header.
    pub fn receive<R: Read>(f: &mut R, csum_len: usize) -> io::Result<Self> {
        let count = f.read_int()?;
        let block_len = f.read_int()?;
        let remainder = f.read_int()?;

        if !(0..=MAX_BLOCK_COUNT).contains(&count) || block_len <= 0 || remainder < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid signature header: count={count} n={block_len} rem={remainder}"),
            ));
        }

        let block_len = block_len as u32;
        let remainder = remainder as u32;
        let mut sigs = Self {
            block_len,
            remainder,
            blocks: Vec::with_capacity(count as usize),
            file_len: 0,
        };

        let mut offset = 0u64;
        for i in 0..count {
            let sum1 = f.read_int()? as u32;
            let mut sum2 = [0u8; SUM_LENGTH];
            f.read_exact(&mut sum2[..csum_len])?;

            let len = if i == count - 1 && remainder != 0 {
                remainder
            } else {
                block_len
            };
            sigs.blocks.push(SumBuf {
                sum1,
                sum2,
                offset,
                len,
            });
            offset += u64::from(len);
        }
        sigs.file_len = offset;
        Ok(sigs)
    }
}

/// Scales the block size up for very large files so the number of
/// blocks stays bounded: roughly `len / 10000`, rounded down to a
/// multiple of 16 and clamped between the default and half a chunk.
/// An explicit non-default `block_size` is honoured as-is.
#[must_use]
pub fn adapt_block_size(len: u64, block_size: u32) -> u32 {
    if block_size != BLOCK_SIZE {
        return block_size;
    }

    let mut ret = (len / 10000) as u32;
    ret &= !15;
    ret = ret.max(block_size);
    ret.min(CHUNK_SIZE as u32 / 2)
}

//! Scans a source file against a destination's block signatures,
//! emitting the match/literal token stream.
//!
//! The weak rolling checksum slides over the source one byte at a time;
//! its 16-bit tag indexes a table of candidate blocks, and candidates
//! are confirmed with the strong digest before a match token is
//! committed. Runs of adjacent blocks are preferred so the token stream
//! run-length encodes well. While scanning, the whole-file strong
//! digest accumulates over exactly the bytes the receiver will
//! reconstruct, wire corruption shows up as a digest mismatch there.

use std::io::{self, Write};

use checksums::{BlockDigest, FileDigest, RollingChecksum};
use protocol::token::TokenCodec;
use protocol::CHUNK_SIZE;
use signature::Signatures;

mod source;
mod table;

pub use source::{BlockSource, SliceSource};
use table::TagTable;

/// Counters the sender reports after each file and accumulates across
/// the transfer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MatchStats {
    /// Committed block matches.
    pub matches: u64,
    /// Tag-table hits, including ones rejected later.
    pub tag_hits: u64,
    /// Weak-sum collisions rejected by the strong digest.
    pub false_alarms: u64,
    /// Bytes sent verbatim.
    pub literal_data: u64,
    /// Bytes covered by match tokens.
    pub matched_data: u64,
}

impl MatchStats {
    /// Folds one file's counters into a running total.
    pub fn accumulate(&mut self, other: &Self) {
        self.matches += other.matches;
        self.tag_hits += other.tag_hits;
        self.false_alarms += other.false_alarms;
        self.literal_data += other.literal_data;
        self.matched_data += other.matched_data;
    }
}

struct MatchState<'a, W: Write, S: BlockSource> {
    f: &'a mut W,
    codec: &'a mut TokenCodec,
    sigs: &'a Signatures,
    src: &'a mut S,
    csum_len: usize,
    seed: u32,
    file_sum: FileDigest,
    last_match: u64,
    stats: MatchStats,
    scratch: Vec<u8>,
}

impl<W: Write, S: BlockSource> MatchState<'_, W, S> {
    /// Transmits the literal run `[last_match, offset)` followed by a
    /// token. `token` is a block index, `-1` at end of file, or `-2`
    /// for a literal-only flush, and the whole-file digest is advanced
    /// over everything the receiver will write out.
    fn matched(&mut self, offset: u64, token: i32) -> io::Result<()> {
        let n = (offset - self.last_match) as usize;

        self.scratch.clear();
        let mut copied = 0usize;
        while copied < n {
            let want = (n - copied).min(CHUNK_SIZE);
            let piece = self.src.slice(self.last_match + copied as u64, want)?;
            self.scratch.extend_from_slice(piece);
            copied += want;
        }
        self.file_sum.update(&self.scratch);
        self.stats.literal_data += n as u64;

        if token >= 0 {
            let block = &self.sigs.blocks[token as usize];
            let len = block.len as usize;
            self.stats.matched_data += u64::from(block.len);
            let bytes = self.src.slice(offset, len)?;
            self.file_sum.update(bytes);

            // the codec needs the literal and the matched block in one
            // call; the literal was staged into scratch above
            let scratch = std::mem::take(&mut self.scratch);
            let result = self.codec.send_token(self.f, token, &scratch, bytes);
            self.scratch = scratch;
            result?;

            self.last_match = offset + u64::from(block.len);
        } else {
            let scratch = std::mem::take(&mut self.scratch);
            let result = self.codec.send_token(self.f, token, &scratch, b"");
            self.scratch = scratch;
            result?;

            self.last_match = offset;
        }
        Ok(())
    }

    fn hash_search(&mut self, table: &TagTable, len: u64) -> io::Result<()> {
        // encourage adjacent matches so the run-length coding of the
        // output works well
        let mut last_i: i64 = -1;

        let block_len = self.sigs.block_len;
        let last_block_len = self.sigs.blocks[self.sigs.count() - 1].len;

        let mut k = len.min(u64::from(block_len)) as usize;
        let mut sum = RollingChecksum::from_block(self.src.slice(0, k)?);

        let mut offset: u64 = 0;
        let end = len as i64 + 1 - i64::from(last_block_len);

        tracing::trace!(block_len, len, count = self.sigs.count(), "hash search");

        loop {
            let tag = sum.tag();
            let mut done_csum2 = false;
            let mut sum2 = [0u8; 16];

            if let Some(start) = table.lookup(tag) {
                self.stats.tag_hits += 1;
                let sum_val = sum.value();

                let mut j = start;
                while let Some(index) = table.candidate(j, tag) {
                    let block = &self.sigs.blocks[index];
                    if sum_val != block.sum1 {
                        j += 1;
                        continue;
                    }

                    // the two blocks must be the same length, which only
                    // bites at the tail
                    let l = (len - offset).min(u64::from(block_len)) as u32;
                    if l != block.len {
                        j += 1;
                        continue;
                    }

                    if !done_csum2 {
                        let window = self.src.slice(offset, l as usize)?;
                        sum2 = BlockDigest::digest(window, self.seed);
                        done_csum2 = true;
                    }
                    if sum2[..self.csum_len] != block.sum2[..self.csum_len] {
                        self.stats.false_alarms += 1;
                        j += 1;
                        continue;
                    }

                    // found a match; check whether the block after the
                    // previous match also fits, which compresses better
                    let mut chosen = index;
                    let mut j2 = j + 1;
                    while let Some(index2) = table.candidate(j2, tag) {
                        if index2 as i64 == last_i + 1 {
                            let block2 = &self.sigs.blocks[index2];
                            if sum_val != block2.sum1 {
                                break;
                            }
                            if sum2[..self.csum_len] != block2.sum2[..self.csum_len] {
                                break;
                            }
                            chosen = index2;
                            break;
                        }
                        j2 += 1;
                    }

                    last_i = chosen as i64;
                    self.matched(offset, chosen as i32)?;
                    self.stats.matches += 1;

                    // minus one compensates for the slide and increment
                    // at the bottom of the loop
                    offset += u64::from(self.sigs.blocks[chosen].len) - 1;
                    k = (len - offset).min(u64::from(block_len)) as usize;
                    sum = RollingChecksum::from_block(self.src.slice(offset, k)?);
                    break;
                }
            }

            // slide the window one byte
            let window = self.src.slice(offset, k + 1)?;
            let outgoing = window[0];
            if (k as u64) < len - offset {
                let incoming = window[k];
                sum.roll(outgoing, incoming).map_err(roll_error)?;
            } else {
                sum.roll_out(outgoing).map_err(roll_error)?;
                k -= 1;
            }

            // flushing periodically bounds how much literal data can
            // pile up between message boundaries and spares the window
            // a third re-read of far-back bytes
            if offset > self.last_match
                && offset - self.last_match >= (CHUNK_SIZE as u64) + u64::from(block_len)
                && end - offset as i64 > CHUNK_SIZE as i64
            {
                self.matched(offset - u64::from(block_len), -2)?;
            }

            offset += 1;
            if offset as i64 >= end {
                break;
            }
        }

        self.matched(len, -1)
    }
}

fn roll_error(err: checksums::RollingError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Runs the matcher over `src`, writing the token stream through
/// `codec` and returning the whole-file digest plus per-file counters.
///
/// With no signatures (`count == 0`) or an empty source the file goes
/// out as chunked literals.
pub fn match_sums<W: Write, S: BlockSource>(
    f: &mut W,
    codec: &mut TokenCodec,
    sigs: &Signatures,
    src: &mut S,
    csum_len: usize,
    seed: u32,
) -> io::Result<([u8; 16], MatchStats)> {
    let len = src.len();
    let mut state = MatchState {
        f,
        codec,
        sigs,
        src,
        csum_len,
        seed,
        file_sum: FileDigest::new(seed),
        last_match: 0,
        stats: MatchStats::default(),
        scratch: Vec::new(),
    };

    if len > 0 && sigs.count() > 0 {
        let table = TagTable::build(sigs);
        state.hash_search(&table, len)?;
    } else {
        // emit in pieces to avoid unbounded buffering
        let chunk = CHUNK_SIZE as u64;
        let mut j = 0u64;
        while len > chunk && j < len - chunk {
            let n1 = chunk.min(len - chunk - j);
            state.matched(j + n1, -2)?;
            j += chunk;
        }
        state.matched(len, -1)?;
    }

    let MatchState {
        file_sum, stats, ..
    } = state;
    tracing::debug!(
        matches = stats.matches,
        tag_hits = stats.tag_hits,
        false_alarms = stats.false_alarms,
        "matcher finished"
    );
    Ok((file_sum.finalize(), stats))
}

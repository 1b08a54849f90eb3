use std::fs::File;
use std::io::{Read, Write};

use flist::FileList;
use matching::{match_sums, MatchStats};
use protocol::wire::{ReadWire, WriteWire};
use protocol::{DemuxReader, MessageCode, MuxWriter, TokenCodec, SHORT_SUM_LENGTH, SUM_LENGTH};
use signature::Signatures;

use crate::error::{EngineError, Result};
use crate::map::MapWindow;
use crate::options::Options;
use crate::stats::Stats;

/// The sender reads `(index, signatures)` pairs from the generator,
/// runs the matcher over the named source file and answers with the
/// index, the signature header, the token stream and the whole-file
/// digest. Returns whether any per-file I/O error was recorded.
pub fn send_files<R: Read, W: Write>(
    f_in: &mut DemuxReader<R>,
    f_out: &mut MuxWriter<W>,
    flist: &FileList,
    opts: &Options,
    protocol: i32,
    seed: u32,
    stats: &mut Stats,
) -> Result<bool> {
    let mut codec = TokenCodec::new(opts.compress);
    let mut csum_len = SHORT_SUM_LENGTH;
    let mut phase = 0;
    let mut io_error = false;
    let mut totals = MatchStats::default();

    tracing::debug!("send_files starting");

    loop {
        // everything buffered must be on the wire before we block on
        // the generator, or the pipeline stalls
        f_out.flush()?;

        let index = f_in.read_int()?;
        if index == -1 {
            if phase == 0 && protocol >= 13 {
                phase = 1;
                csum_len = SUM_LENGTH;
                f_out.write_int(-1)?;
                tracing::debug!("send_files phase 1");
                continue;
            }
            break;
        }

        let entry = flist
            .get(index)
            .filter(|e| !e.suppressed)
            .ok_or_else(|| {
                EngineError::protocol(format!(
                    "invalid file index {index} (count={})",
                    flist.len()
                ))
            })?;

        stats.num_transferred_files += 1;
        stats.total_transferred_size += entry.length;

        let sigs = Signatures::receive(f_in, csum_len)?;

        let fname = entry.source_path();
        tracing::debug!(index, name = %fname.display(), "sending");

        let file = match File::open(&fname) {
            Ok(file) => file,
            Err(err) => {
                io_error = true;
                report_error(
                    f_out,
                    &format!("send_files failed to open {}: {err}", fname.display()),
                )?;
                continue;
            }
        };
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                io_error = true;
                report_error(f_out, &format!("fstat {} failed: {err}", fname.display()))?;
                continue;
            }
        };

        let mut map = MapWindow::new(file, meta.len());

        f_out.write_int(index)?;
        f_out.write_int(sigs.count() as i32)?;
        f_out.write_int(sigs.block_len as i32)?;
        f_out.write_int(sigs.remainder as i32)?;

        let (file_sum, file_stats) =
            match_sums(f_out, &mut codec, &sigs, &mut map, csum_len, seed)?;
        if protocol >= 14 {
            f_out.write_all(&file_sum)?;
        }

        stats.literal_data += file_stats.literal_data;
        stats.matched_data += file_stats.matched_data;
        totals.accumulate(&file_stats);
    }

    tracing::debug!("send files finished");

    report_match_totals(f_out, &totals)?;
    f_out.write_int(-1)?;
    f_out.flush()?;
    Ok(io_error)
}

fn report_error<W: Write>(f_out: &mut MuxWriter<W>, text: &str) -> Result<()> {
    tracing::error!("{text}");
    let mut line = text.to_string();
    line.push('\n');
    f_out.send_msg(MessageCode::Error, line.as_bytes())?;
    Ok(())
}

fn report_match_totals<W: Write>(f_out: &mut MuxWriter<W>, totals: &MatchStats) -> Result<()> {
    let line = format!(
        "total: matches={}  tag_hits={}  false_alarms={} data={}\n",
        totals.matches, totals.tag_hits, totals.false_alarms, totals.literal_data
    );
    tracing::info!("{}", line.trim_end());
    f_out.send_msg(MessageCode::Info, line.as_bytes())?;
    Ok(())
}

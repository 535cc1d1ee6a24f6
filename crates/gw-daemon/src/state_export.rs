//! Writes the two flat files an external LED/diagnostics process reads:
//! `/tmp/KBUS/termCount` (terminal count, decimal ASCII) and
//! `/tmp/KBUS/termInfo` (one descriptive line per terminal). Grounded on
//! `proc.c`'s `proc_createEntry`: same directory, same filenames, same
//! per-line field layout, minus the `Channels`/`PiFormat` fields our
//! terminal descriptor doesn't carry (no real fieldbus driver in this
//! workspace ever produces `AdditionalInfo`, so there is nothing to print).
//!
//! The consumer of these files is out of scope; only the publish step is.

use gw_fieldbus::TerminalInfo;
use std::io::Write;
use std::path::Path;

const EXPORT_DIR: &str = "/tmp/KBUS";

/// Write `termCount` and `termInfo` under [`EXPORT_DIR`].
///
/// Best-effort: a failure here is logged and does not abort startup, since
/// the gateway itself has no other use for these files (matching the
/// original's own "keep going" stance on a write failure — see
/// `main_startUpModules`, which never consults `proc_createEntry`'s return).
pub fn publish(terminals: &[TerminalInfo]) {
    if let Err(e) = publish_inner(terminals) {
        tracing::warn!(error = %e, "failed to publish KBUS terminal state files");
    }
}

fn publish_inner(terminals: &[TerminalInfo]) -> std::io::Result<()> {
    std::fs::create_dir_all(EXPORT_DIR)?;
    write_term_count(Path::new(EXPORT_DIR).join("termCount"), terminals.len())?;
    write_term_info(Path::new(EXPORT_DIR).join("termInfo"), terminals)?;
    Ok(())
}

fn write_term_count(path: impl AsRef<Path>, count: usize) -> std::io::Result<()> {
    let mut f = std::fs::File::create(path)?;
    write!(f, "{count}")
}

fn write_term_info(path: impl AsRef<Path>, terminals: &[TerminalInfo]) -> std::io::Result<()> {
    let mut f = std::fs::File::create(path)?;
    for (i, t) in terminals.iter().enumerate() {
        writeln!(
            f,
            "Pos:{i} \tType:{}\tBitOffsetOut:{}\tBitSizeOut:{}\tBitOffsetIn:{}\tBitSizeIn:{}",
            t.description, t.bit_offset_out, t.bit_size_out, t.bit_offset_in, t.bit_size_in
        )?;
    }
    Ok(())
}

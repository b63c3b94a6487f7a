use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;

use crate::checksum::{ChecksumFile, CHECKSUM_WINDOW};
use crate::crypto::block_sum;
use crate::error::Result;
use crate::index::Index;
use crate::progress::Progress;
use crate::storage::Storage;

pub struct ValidateOptions {
    /// Suppress the per-window OK lines.
    pub only_bad: bool,
    pub show_progress: bool,
}

#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub files_checked: u64,
    pub files_failed: u64,
    pub windows_ok: u64,
    pub windows_bad: u64,
    pub elapsed: Duration,
}

/// Re-extract every file with recorded checksums into memory and compare its
/// 32 KiB plaintext windows against the checksum table. Mismatches are
/// printed and counted, never raised: a bad checksum is a statement about
/// the depot, not a failure of the validator.
pub fn validate(
    storage: &Storage,
    index: &Index,
    checks: &ChecksumFile,
    opts: &ValidateOptions,
) -> Result<ValidateReport> {
    let t0 = Instant::now();
    let ids: Vec<u32> =
        (0..checks.file_count() as u32).filter(|&id| checks.num_checksums(id) > 0).collect();

    let prog = Progress::new(opts.show_progress);
    prog.set_stage("Validating");
    prog.set_files_total(ids.len() as u64);
    prog.start();

    let (files_checked, files_failed, windows_ok, windows_bad) = ids
        .par_iter()
        .map(|&fileid| {
            let mut buf: Vec<u8> = Vec::new();
            if let Err(e) = storage.extract_file(&mut buf, index, fileid) {
                eprintln!("failed to read file {fileid}: {e}");
                prog.inc_file();
                return (0u64, 1u64, 0u64, 0u64);
            }
            let sums = checks.sums_for(fileid);
            let mut ok = 0u64;
            let mut bad = 0u64;
            let mut left = buf.len();
            for (k, &expected) in sums.iter().enumerate() {
                let start = buf.len().min(k * CHECKSUM_WINDOW);
                let to_read = left.min(CHECKSUM_WINDOW);
                let got = block_sum(&buf[start..start + to_read]);
                if got != expected {
                    println!("Bad checksum for file {fileid}: got {got} expected {expected}");
                    bad += 1;
                } else {
                    if !opts.only_bad {
                        println!("File {fileid} part {k} OK");
                    }
                    ok += 1;
                }
                left -= to_read;
            }
            prog.inc_file();
            prog.add_bytes(buf.len() as u64);
            (1, 0, ok, bad)
        })
        .reduce(|| (0, 0, 0, 0), |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2, a.3 + b.3));

    prog.stop();
    Ok(ValidateReport { files_checked, files_failed, windows_ok, windows_bad, elapsed: t0.elapsed() })
}

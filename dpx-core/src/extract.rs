use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::index::Index;
use crate::manifest::Manifest;
use crate::paths::materialize_path;
use crate::progress::Progress;
use crate::storage::Storage;

pub struct ExtractOptions {
    pub out_root: PathBuf,
    /// Anchored filter over manifest-relative paths; see `compile_filter`.
    pub filter: Option<Regex>,
    pub show_progress: bool,
}

#[derive(Debug, Serialize)]
pub struct ExtractReport {
    pub files_written: u64,
    pub files_failed: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

/// Compile a user filter so it must match the whole relative path, the way
/// the platform's tooling always treated it.
pub fn compile_filter(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

struct Task {
    fileid: u32,
    rel: String,
    abs: PathBuf,
}

/// Walk the manifest, materialize directories, then fan per-file extraction
/// out to a rayon pool. Workers share the parsed structures read-only; the
/// only per-task resource is the output file. A failed file is reported and
/// counted, never aborts its peers.
pub fn extract(
    manifest: &Manifest,
    index: &Index,
    storage: &Storage,
    opts: &ExtractOptions,
) -> Result<ExtractReport> {
    let t0 = Instant::now();
    let matches = |rel: &str| opts.filter.as_ref().map_or(true, |re| re.is_match(rel));
    fs::create_dir_all(&opts.out_root)?;

    // Directory entries first, so empty directories survive extraction.
    for (i, e) in manifest.entries().iter().enumerate() {
        if i == 0 || !e.is_dir() {
            continue;
        }
        let rel = manifest.full_path_for_entry(i);
        if !matches(&rel) {
            continue;
        }
        fs::create_dir_all(materialize_path(&opts.out_root, &rel)?)?;
    }

    let mut tasks: Vec<Task> = Vec::new();
    for (i, e) in manifest.entries().iter().enumerate() {
        if !e.is_file() {
            continue;
        }
        let rel = manifest.full_path_for_entry(i);
        if !matches(&rel) {
            continue;
        }
        let abs = materialize_path(&opts.out_root, &rel)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)?;
        }
        tasks.push(Task { fileid: e.fileid, rel, abs });
    }
    debug!(tasks = tasks.len(), "extraction dispatch");

    let prog = Progress::new(opts.show_progress);
    prog.set_stage("Extracting");
    prog.set_files_total(tasks.len() as u64);
    prog.start();

    let (files_written, files_failed, bytes_written) = tasks
        .par_iter()
        .map(|t| {
            println!("extracting: {}", t.rel);
            match extract_one(storage, index, t) {
                Ok(n) => {
                    prog.inc_file();
                    prog.add_bytes(n);
                    (1u64, 0u64, n)
                }
                Err(e) => {
                    eprintln!("failed to extract {}: {e}", t.rel);
                    (0, 1, 0)
                }
            }
        })
        .reduce(|| (0, 0, 0), |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2));

    prog.stop();
    Ok(ExtractReport { files_written, files_failed, bytes_written, elapsed: t0.elapsed() })
}

fn extract_one(storage: &Storage, index: &Index, task: &Task) -> Result<u64> {
    let mut out = BufWriter::new(File::create(&task.abs)?);
    let n = storage.extract_file(&mut out, index, task.fileid)?;
    out.flush()?;
    Ok(n)
}

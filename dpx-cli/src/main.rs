use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dpx_core::checksum::ChecksumFile;
use dpx_core::crypto::DepotKey;
use dpx_core::extract::{compile_filter, extract, ExtractOptions};
use dpx_core::index::{Dialect, Index};
use dpx_core::keystore::Keystore;
use dpx_core::manifest::Manifest;
use dpx_core::storage::Storage;
use dpx_core::validate::{validate, ValidateOptions};

#[derive(Parser)]
#[command(name = "dpx", version, about = "Extract, list and validate legacy content depots")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Extract storage
    X {
        /// The .data file
        storage: PathBuf,
        /// The .manifest file
        manifest: PathBuf,
        /// The .index file
        index: PathBuf,
        /// Decryption key (32 hex chars)
        #[arg(long)]
        key: Option<String>,
        /// Output directory
        #[arg(long)]
        out: Option<PathBuf>,
        /// Regex filter over relative paths
        #[arg(long)]
        filter: Option<String>,
        /// Treat index as v2
        #[arg(long)]
        v2: bool,
        /// Keystore seed file
        #[arg(long, default_value = "keys.txt")]
        keystore: PathBuf,
        /// Print periodic progress
        #[arg(long)]
        progress: bool,
    },
    /// List files in manifest
    Ls {
        /// The .manifest file
        manifest: PathBuf,
    },
    /// Validate storage
    V {
        /// The .data file
        storage: PathBuf,
        /// The .index file
        index: PathBuf,
        /// The .checksums file
        checksum: PathBuf,
        /// Decryption key if the depot contains encrypted files
        #[arg(long)]
        key: Option<String>,
        /// Cacheid for keystore lookup
        #[arg(long)]
        cacheid: Option<u32>,
        /// Show only bad parts
        #[arg(long)]
        onlybad: bool,
        /// Keystore seed file
        #[arg(long, default_value = "keys.txt")]
        keystore: PathBuf,
        /// Print periodic progress
        #[arg(long)]
        progress: bool,
    },
    /// Fileid to name
    Iton {
        /// Id to look up
        id: u32,
        /// The .manifest file
        manifest: PathBuf,
    },
    /// List blocks in index
    Lsblk {
        /// The .index file
        index: PathBuf,
        /// Show only fileids
        #[arg(long)]
        onlyid: bool,
        /// Treat index as v2
        #[arg(long)]
        v2: bool,
    },
    /// Download a depot from a content server
    #[cfg(feature = "net")]
    Dl {
        /// Content server list server (ip:port)
        cls: String,
        /// Depot id
        depot: u32,
        /// Depot version
        version: u32,
        /// Decryption key (32 hex chars)
        #[arg(long)]
        key: Option<String>,
        /// Output directory
        #[arg(long)]
        outpath: Option<PathBuf>,
        /// Regex filter over relative paths
        #[arg(long)]
        filter: Option<String>,
        /// Connect to the given address directly, skipping the directory query
        #[arg(long)]
        skipcls: bool,
        /// Keystore seed file
        #[arg(long, default_value = "keys.txt")]
        keystore: PathBuf,
    },
    /// List files in manifest (remote)
    #[cfg(feature = "net")]
    Lsr {
        /// Content server list server (ip:port)
        cls: String,
        /// Depot id
        depot: u32,
        /// Depot version
        version: u32,
    },
    /// Download the content description record
    #[cfg(feature = "net")]
    Dlcdr {
        /// Config server (ip:port)
        ip: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Argument-parse failure is the one path that exits nonzero=1.
            let _ = e.print();
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.cmd {
        Cmd::X { storage, manifest, index, key, out, filter, v2, keystore, progress } => {
            cmd_extract(storage, manifest, index, key, out, filter, dialect(v2), keystore, progress)
        }
        Cmd::Ls { manifest } => cmd_ls(manifest),
        Cmd::V { storage, index, checksum, key, cacheid, onlybad, keystore, progress } => {
            cmd_validate(storage, index, checksum, key, cacheid, onlybad, keystore, progress)
        }
        Cmd::Iton { id, manifest } => cmd_iton(id, manifest),
        Cmd::Lsblk { index, onlyid, v2 } => cmd_lsblk(index, onlyid, dialect(v2)),
        #[cfg(feature = "net")]
        Cmd::Dl { cls, depot, version, key, outpath, filter, skipcls, keystore } => {
            remote::cmd_download(cls, depot, version, key, outpath, filter, skipcls, keystore)
        }
        #[cfg(feature = "net")]
        Cmd::Lsr { cls, depot, version } => remote::cmd_ls(cls, depot, version),
        #[cfg(feature = "net")]
        Cmd::Dlcdr { ip } => remote::cmd_cdr(ip),
    }
}

fn dialect(v2: bool) -> Dialect {
    if v2 {
        Dialect::V2
    } else {
        Dialect::V3
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_extract(
    storage: PathBuf,
    manifest: PathBuf,
    index: PathBuf,
    key: Option<String>,
    out: Option<PathBuf>,
    filter: Option<String>,
    dialect: Dialect,
    keystore: PathBuf,
    progress: bool,
) -> Result<()> {
    let manifest = Manifest::open(&manifest)
        .with_context(|| format!("read manifest {}", manifest.display()))?;
    let index =
        Index::open(&index, dialect).with_context(|| format!("read index {}", index.display()))?;
    let ks = Keystore::load(&keystore)?;
    let key = ks.resolve(manifest.header.cacheid, key.as_deref())?;
    let storage = Storage::open(&storage, key)
        .with_context(|| format!("open storage {}", storage.display()))?;

    let filter = match filter {
        Some(pat) => match compile_filter(&pat) {
            Ok(re) => Some(re),
            Err(e) => {
                // Bad filter aborts the command but is not an exit-code failure.
                eprintln!("{e}");
                return Ok(());
            }
        },
        None => None,
    };

    let out_root = out.unwrap_or_else(|| {
        PathBuf::from(format!("{}_{}", manifest.header.cacheid, manifest.header.gcfversion))
    });

    let report = extract(
        &manifest,
        &index,
        &storage,
        &ExtractOptions { out_root, filter, show_progress: progress },
    )?;
    if report.files_failed > 0 {
        eprintln!("{} file(s) failed", report.files_failed);
    }
    println!("Took {:.3}s", report.elapsed.as_secs_f64());
    Ok(())
}

fn cmd_ls(manifest: PathBuf) -> Result<()> {
    let manifest = Manifest::open(&manifest)
        .with_context(|| format!("read manifest {}", manifest.display()))?;
    for (i, entry) in manifest.entries().iter().enumerate() {
        if entry.is_file() {
            println!("{}", manifest.full_path_for_entry(i));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_validate(
    storage: PathBuf,
    index: PathBuf,
    checksum: PathBuf,
    key: Option<String>,
    cacheid: Option<u32>,
    onlybad: bool,
    keystore: PathBuf,
    progress: bool,
) -> Result<()> {
    let ks = Keystore::load(&keystore)?;
    let key = match cacheid {
        Some(id) => ks.resolve(id, key.as_deref())?,
        None => match key.as_deref() {
            Some(hex) => DepotKey::from_hex(hex)?,
            None => DepotKey::zero(),
        },
    };
    println!("Validating cache {}", storage.display());
    let storage =
        Storage::open(&storage, key).with_context(|| "open storage".to_string())?;
    let index = Index::open(&index, Dialect::V3)
        .with_context(|| format!("read index {}", index.display()))?;
    let checks = ChecksumFile::open(&checksum)
        .with_context(|| format!("read checksum file {}", checksum.display()))?;

    let report =
        validate(&storage, &index, &checks, &ValidateOptions { only_bad: onlybad, show_progress: progress })?;
    println!("took {:.3}s", report.elapsed.as_secs_f64());
    Ok(())
}

fn cmd_iton(id: u32, manifest: PathBuf) -> Result<()> {
    let manifest = Manifest::open(&manifest)
        .with_context(|| format!("read manifest {}", manifest.display()))?;
    match manifest.path_for_fileid(id) {
        Ok(path) => println!("{path}"),
        Err(e) => eprintln!("{e}"),
    }
    Ok(())
}

fn cmd_lsblk(index: PathBuf, onlyid: bool, dialect: Dialect) -> Result<()> {
    let index =
        Index::open(&index, dialect).with_context(|| format!("read index {}", index.display()))?;
    for (fileid, layout) in index.iter() {
        if onlyid {
            println!("{fileid}");
        } else {
            println!("{fileid} | {}", layout.filetype);
        }
    }
    Ok(())
}

#[cfg(feature = "net")]
mod remote {
    use super::*;
    use dpx_core::net::{download_cdr, download_depot, get_fileservers, FileClient};
    use std::net::SocketAddrV4;

    fn parse_addr(s: &str) -> Result<SocketAddrV4> {
        s.parse::<SocketAddrV4>().with_context(|| format!("bad address {s:?}"))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn cmd_download(
        cls: String,
        depot: u32,
        version: u32,
        key: Option<String>,
        outpath: Option<PathBuf>,
        filter: Option<String>,
        skipcls: bool,
        keystore: PathBuf,
    ) -> Result<()> {
        let addr = parse_addr(&cls)?;
        let cm = if skipcls {
            addr
        } else {
            let servers = get_fileservers(addr, depot, version, 2)?;
            for s in &servers {
                println!("{} {}", s.ip(), s.port());
            }
            *servers.get(1).or_else(|| servers.first()).context("no content servers offered")?
        };

        let filter = match filter {
            Some(pat) => match compile_filter(&pat) {
                Ok(re) => Some(re),
                Err(e) => {
                    eprintln!("{e}");
                    return Ok(());
                }
            },
            None => None,
        };

        let ks = Keystore::load(&keystore)?;
        let key = ks.resolve(depot, key.as_deref())?;
        let out_root =
            outpath.unwrap_or_else(|| PathBuf::from(format!("{depot}_{version}")));

        let mut client = FileClient::connect(cm, depot, version)?;
        let manifest = client.download_manifest()?;
        let checks = client.download_checksums()?;
        let report =
            download_depot(&mut client, &manifest, &checks, &key, filter.as_ref(), &out_root)?;
        if report.files_failed > 0 {
            eprintln!("{} file(s) failed", report.files_failed);
        }
        println!("Took {:.3}s", report.elapsed.as_secs_f64());
        Ok(())
    }

    pub fn cmd_ls(cls: String, depot: u32, version: u32) -> Result<()> {
        let addr = parse_addr(&cls)?;
        let servers = get_fileservers(addr, depot, version, 2)?;
        for s in &servers {
            println!("{} {}", s.ip(), s.port());
        }
        let cm = *servers.get(1).or_else(|| servers.first()).context("no content servers offered")?;
        let mut client = FileClient::connect(cm, depot, version)?;
        let manifest = client.download_manifest()?;
        println!(
            "File list for cache {} version {}:",
            manifest.header.cacheid, manifest.header.gcfversion
        );
        for (i, entry) in manifest.entries().iter().enumerate() {
            if entry.is_file() {
                println!("{}", manifest.full_path_for_entry(i));
            }
        }
        Ok(())
    }

    pub fn cmd_cdr(ip: String) -> Result<()> {
        let addr = parse_addr(&ip)?;
        let mut out = std::fs::File::create("cdr.bin")?;
        let n = download_cdr(addr, &mut out)?;
        println!("wrote cdr.bin ({n} bytes)");
        Ok(())
    }
}

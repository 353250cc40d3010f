//! Command-line driver for the five archive sub-commands of spec.md §6.
//! Talks to the library purely through the [`Archive`] (C10) facade; holds
//! no crypto or tree logic of its own. `RUST_LOG` controls verbosity via
//! `env_logger` when the `cli` feature (default-on) is enabled.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use vefs::index::OpenFlags;
use vefs::{Archive, ArchiveConfig, Error, ErrorDetail, Result, VefsError};

#[derive(Debug, Parser)]
#[clap(name = "vefs")]
#[clap(about = "Inspect and manipulate vefs encrypted archives", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open the archive read-only and verify every path resolves.
    Validate(ValidateArgs),
    /// Decrypt every file in the archive into a host directory.
    ExtractAll(ExtractAllArgs),
    /// Decrypt the named files into a host directory.
    Extract(ExtractArgs),
    /// Write the archive's personalization area out to a host file.
    ExtractPersonalization(ExtractPersonalizationArgs),
    /// Create or overwrite files in the archive from a host directory.
    Upsert(UpsertArgs),
}

#[derive(Debug, clap::Args)]
struct ValidateArgs {
    /// Path to the archive's host file
    archive: PathBuf,
    /// Path to a file holding the raw 32-byte pre-shared root key
    #[clap(long)]
    prk_file: PathBuf,
}

#[derive(Debug, clap::Args)]
struct ExtractAllArgs {
    archive: PathBuf,
    /// Host directory to decrypt every archive path into
    dir: PathBuf,
    #[clap(long)]
    prk_file: PathBuf,
}

#[derive(Debug, clap::Args)]
struct ExtractArgs {
    archive: PathBuf,
    /// Archive paths to decrypt
    #[clap(required = true)]
    paths: Vec<String>,
    /// Host directory to write the decrypted files into
    #[clap(long)]
    to: PathBuf,
    #[clap(long)]
    prk_file: PathBuf,
}

#[derive(Debug, clap::Args)]
struct ExtractPersonalizationArgs {
    archive: PathBuf,
    /// Host file to write the personalization area's bytes into
    #[clap(long)]
    to: PathBuf,
    #[clap(long)]
    prk_file: PathBuf,
}

#[derive(Debug, clap::Args)]
struct UpsertArgs {
    archive: PathBuf,
    /// Archive paths to create or overwrite
    #[clap(required = true)]
    paths: Vec<String>,
    /// Host directory to read the new contents from, one file per path
    #[clap(long)]
    from: PathBuf,
    #[clap(long)]
    prk_file: PathBuf,
}

#[cfg(feature = "cli")]
fn init_logging() {
    env_logger::init();
}

#[cfg(not(feature = "cli"))]
fn init_logging() {}

fn read_prk(path: &Path) -> Result<[u8; 32]> {
    let bytes = fs::read(path)?;
    bytes
        .try_into()
        .map_err(|_| Error::with_detail(VefsError::InvalidArgument, ErrorDetail::default().with_path(path.display().to_string())))
}

fn host_path(dir: &Path, archive_path: &str) -> PathBuf {
    dir.join(archive_path.trim_start_matches('/'))
}

fn extract_one(archive: &Archive, archive_path: &str, dest: &Path) -> Result<()> {
    let file = archive.open_file(archive_path, OpenFlags::READ)?;
    let extent = file.maximum_extent();
    let mut data = vec![0u8; extent as usize];
    let n = file.read(&mut data, 0)?;
    data.truncate(n);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, data)?;
    archive.close_file(archive_path);
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let prk = read_prk(&args.prk_file)?;
    Archive::validate(&args.archive, &prk, ArchiveConfig::default())?;
    log::info!("{} validated", args.archive.display());
    Ok(())
}

fn run_extract_all(args: ExtractAllArgs) -> Result<()> {
    let prk = read_prk(&args.prk_file)?;
    let archive = Archive::open(&args.archive, &prk, ArchiveConfig::default())?;
    fs::create_dir_all(&args.dir)?;
    for path in archive.list() {
        let dest = host_path(&args.dir, &path);
        extract_one(&archive, &path, &dest)?;
        log::debug!("extracted {path}");
    }
    Ok(())
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let prk = read_prk(&args.prk_file)?;
    let archive = Archive::open(&args.archive, &prk, ArchiveConfig::default())?;
    fs::create_dir_all(&args.to)?;
    for path in &args.paths {
        let dest = host_path(&args.to, path);
        extract_one(&archive, path, &dest)?;
        log::debug!("extracted {path}");
    }
    Ok(())
}

fn run_extract_personalization(args: ExtractPersonalizationArgs) -> Result<()> {
    let prk = read_prk(&args.prk_file)?;
    let archive = Archive::open(&args.archive, &prk, ArchiveConfig::default())?;
    let data = archive.personalization()?;
    if let Some(parent) = args.to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&args.to, data)?;
    Ok(())
}

/// Creates or overwrites `archive_path` from `host_file`. On any failure
/// past the point of opening the handle, erases the path again so a failed
/// upsert never leaves a half-written file behind (spec.md §6).
fn upsert_one(archive: &Archive, archive_path: &str, host_file: &Path) -> Result<()> {
    let data = fs::read(host_file)?;
    let existed = archive.query(archive_path).is_ok();
    let file = archive.open_file(archive_path, OpenFlags::CREATE | OpenFlags::WRITE)?;
    let result = file.truncate(data.len() as u64).and_then(|_| file.write(&data, 0));
    if let Err(err) = result {
        archive.close_file(archive_path);
        if !existed {
            let _ = archive.erase(archive_path);
        }
        return Err(err);
    }
    archive.close_file(archive_path);
    Ok(())
}

fn run_upsert(args: UpsertArgs) -> Result<()> {
    let prk = read_prk(&args.prk_file)?;
    let archive = Archive::open(&args.archive, &prk, ArchiveConfig::default())?;
    for path in &args.paths {
        let host_file = host_path(&args.from, path);
        upsert_one(&archive, path, &host_file)?;
        log::debug!("upserted {path}");
    }
    archive.commit()?;
    Ok(())
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Validate(args) => run_validate(args),
        Command::ExtractAll(args) => run_extract_all(args),
        Command::Extract(args) => run_extract(args),
        Command::ExtractPersonalization(args) => run_extract_personalization(args),
        Command::Upsert(args) => run_upsert(args),
    }
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            eprintln!("vefs: {err}");
            ExitCode::FAILURE
        }
    }
}

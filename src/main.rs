//! nxelf - NX loadable-image to ELF64 converter.
//!
//! Convert NSO, NRO, and raw MOD images into ELF64 shared objects, or
//! re-emit an NSO without its per-segment compression.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use nxelf::NxFile;

/// NX loadable-image to ELF64 converter.
#[derive(Parser, Debug)]
#[command(name = "nxelf")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input file, or a directory whose entries are each converted once
    path: PathBuf,

    /// Write an ELF64 shared object here (a directory for batch input)
    #[arg(long, value_name = "PATH")]
    export_elf: Option<PathBuf>,

    /// Write an uncompressed NSO here (a directory for batch input)
    #[arg(long, value_name = "PATH")]
    export_uncompressed: Option<PathBuf>,

    /// Increase verbosity (-v: dump details + info logs, -vv: debug logs)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    // A malformed command line is the only condition that exits nonzero.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };

    setup_logging(cli.verbose);

    if cli.path.is_dir() {
        run_batch(&cli);
    } else if let Err(err) = convert_one(&cli, &cli.path, false) {
        error!("{}: {:#}", cli.path.display(), err);
    }

    ExitCode::SUCCESS
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Converts every non-directory entry once, non-recursively. Per-file
/// failures are reported and do not abort the batch.
fn run_batch(cli: &Cli) {
    let entries = match fs::read_dir(&cli.path) {
        Ok(entries) => entries,
        Err(err) => {
            error!("{}: {}", cli.path.display(), err);
            return;
        }
    };

    let mut total = 0usize;
    let mut failed = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        total += 1;
        if let Err(err) = convert_one(cli, &path, true) {
            failed += 1;
            error!("{}: {:#}", path.display(), err);
        }
    }

    info!("converted {}/{} files", total - failed, total);
}

fn convert_one(cli: &Cli, path: &Path, batch: bool) -> Result<()> {
    let nx = NxFile::load(path).with_context(|| "failed to load image")?;

    println!("{}:", path.display());
    nx.dump(cli.verbose > 0);
    if cli.verbose > 0 {
        nx.dump_elf_info();
    }

    if let Some(elf_path) = &cli.export_elf {
        let out = output_path(elf_path, path, batch, "elf");
        nxelf::export_elf(&nx, &out)
            .with_context(|| format!("failed to export ELF to {}", out.display()))?;
        info!("wrote {}", out.display());
    }

    if let Some(nso_path) = &cli.export_uncompressed {
        let out = output_path(nso_path, path, batch, "nso");
        nxelf::export_uncompressed(&nx, &out)
            .with_context(|| format!("failed to export NSO to {}", out.display()))?;
        info!("wrote {}", out.display());
    }

    Ok(())
}

/// For a single input the export path is used as given; for a batch it is
/// a directory and outputs are named after the input file.
fn output_path(export: &Path, input: &Path, batch: bool, extension: &str) -> PathBuf {
    if batch {
        let stem = input.file_stem().unwrap_or_default();
        export.join(stem).with_extension(extension)
    } else {
        export.to_path_buf()
    }
}

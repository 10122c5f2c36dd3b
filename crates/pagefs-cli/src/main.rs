#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pagefs_core::{FsConfig, PageFs};
use pagefs_fuse::MountOptions;
use pagefs_types::PAGE_SIZE;
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "pagefs", about = "pagefs — in-memory page-addressed filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a fresh, empty filesystem via FUSE (blocks until unmount).
    Mount {
        /// Mountpoint directory.
        mountpoint: PathBuf,
        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,
        /// Owner uid for nodes created through the path surface.
        #[arg(long, default_value_t = 0)]
        uid: u32,
        /// Owner gid for nodes created through the path surface.
        #[arg(long, default_value_t = 0)]
        gid: u32,
    },
    /// Run a scripted workload against an in-process filesystem and
    /// verify every structural invariant.
    Selftest {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Selftest ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SelftestReport {
    operations: u64,
    stats: pagefs_core::FsStats,
    check: pagefs_core::check::CheckReport,
}

fn run_selftest(json: bool) -> Result<()> {
    let fs = PageFs::new(FsConfig::default()).context("build filesystem")?;
    let mut operations = 0_u64;
    let mut op = |n: u64| operations += n;

    // Directory tree with a spread of files.
    fs.mkdir("projects", 0o755)?;
    fs.mkdir("projects/pagefs", 0o755)?;
    fs.mkdir("scratch", 0o777)?;
    op(3);

    for i in 0..64 {
        let path = format!("projects/pagefs/note{i:02}.txt");
        fs.mknod(&path, 0o644, 0)?;
        fs.write(&path, 0, format!("note number {i}\n").as_bytes())?;
        op(2);
    }

    // One file large enough to span two index pages.
    fs.mknod("scratch/big.bin", 0o600, 0)?;
    let payload: Vec<u8> = (0..3_000_000_usize).map(|i| (i % 241) as u8).collect();
    fs.write("scratch/big.bin", 0, &payload)?;
    op(2);

    let mut probe = [0_u8; 1];
    fs.read("scratch/big.bin", 2_500_000, &mut probe)?;
    if probe[0] != payload[2_500_000] {
        bail!("big-file readback mismatch at offset 2500000");
    }
    op(1);

    // Shrink, regrow, and partially tear down.
    fs.truncate("scratch/big.bin", PAGE_SIZE as u64 + 1)?;
    fs.truncate("scratch/big.bin", 64 * PAGE_SIZE as u64)?;
    for i in 0..32 {
        fs.unlink(&format!("projects/pagefs/note{i:02}.txt"))?;
        op(1);
    }
    op(2);

    let report = SelftestReport {
        operations,
        stats: fs.stats(),
        check: fs.check(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("operations : {}", report.operations);
        println!("pages      : {}", report.stats.pages_allocated);
        println!("nodes      : {}", report.stats.nodes_live);
        println!("ids issued : {}", report.stats.node_ids_issued);
        if report.check.is_clean() {
            println!("check      : clean");
        } else {
            println!("check      : {} error(s)", report.check.errors.len());
            for err in &report.check.errors {
                println!("  - {err}");
            }
        }
    }

    if !report.check.is_clean() {
        bail!("invariant check failed");
    }
    Ok(())
}

// ── Entrypoint ──────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Mount {
            mountpoint,
            allow_other,
            uid,
            gid,
        } => {
            let fs = PageFs::new(FsConfig { uid, gid }).context("build filesystem")?;
            let options = MountOptions {
                allow_other,
                ..MountOptions::default()
            };
            pagefs_fuse::mount(fs, &mountpoint, &options)
                .with_context(|| format!("mount at {}", mountpoint.display()))?;
            Ok(())
        }
        Command::Selftest { json } => run_selftest(json),
    }
}

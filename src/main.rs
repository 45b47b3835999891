//! # gencodedoc
//!
//! Project-local versioning engine: a content-addressed snapshot store with
//! deduplication, compression at rest, diffing, partial restore, export, and
//! a watcher-driven autosave loop.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │  RequestRouter    │  line-delimited JSON-RPC
//!                  └────────┬─────────┘
//!                           │
//!             ┌─────────────┼──────────────┐
//!             ▼             ▼              ▼
//!      ┌────────────┐ ┌───────────┐ ┌────────────────┐
//!      │ VersionMgr │ │  Config   │ │ AutosaveCtrl   │
//!      └─────┬──────┘ └───────────┘ └───────┬────────┘
//!            │                              │ notify observer
//!     ┌──────┴───────┐                      ▼
//!     ▼              ▼                 dirty flag
//! ┌─────────┐  ┌──────────────┐
//! │ Scanner │  │ ContentStore │  SHA-256 + zstd
//! │(ignore) │  └──────┬───────┘
//! └─────────┘         ▼
//!               ┌────────────┐
//!               │ MetadataDB │  SQLite (snapshots, files, blobs)
//!               └────────────┘
//! ```
//!
//! The binary speaks JSON-RPC 2.0 over stdin/stdout, one request per line;
//! logs go to stderr so the reply channel stays clean.

mod autosave;
mod compress;
mod config;
mod db;
mod diff;
mod error;
mod hasher;
mod ignore;
mod router;
mod scanner;
mod store;
mod version;

use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// gencodedoc — content-addressed snapshot engine with autosave
#[derive(Parser, Debug)]
#[command(
    name = "gencodedoc",
    version,
    about = "Project-local versioning engine over line-delimited JSON-RPC",
    long_about = "gencodedoc captures deduplicated, compressed snapshots of a \
                  working tree and exposes them for inspection, diffing, \
                  restore, and export. Requests arrive as JSON-RPC 2.0 lines \
                  on stdin; replies leave on stdout; logs go to stderr."
)]
struct Cli {
    /// Default project root (falls back to PROJECT_PATH, then the cwd)
    #[arg(short, long)]
    project: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset (e.g. "info", "gencodedoc=debug")
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let project = cli
        .project
        .or_else(|| std::env::var("PROJECT_PATH").ok().map(PathBuf::from))
        .map(Ok)
        .unwrap_or_else(std::env::current_dir)?;

    tracing::info!(project = %project.display(), "gencodedoc serving on stdio");
    let router = router::RequestRouter::new(project);

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if let Some(reply) = router.handle_line(&line) {
            writeln!(stdout, "{reply}")?;
            stdout.flush()?;
        }
    }

    // Channel closed: stop every live autosave loop before exiting.
    router.shutdown();
    Ok(())
}

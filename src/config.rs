//! CLI option surface (spec §6), following the teacher's `clap::Parser`
//! derive usage in `main.rs::Cli`/`Commands`. Each subcommand exposes the
//! `--key=value` options spec.md's table names, with its defaults.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "blockswarm", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server (role S): host a catalog and serve blocks.
    Serve(ServeArgs),
    /// Run the downloading client (role C): fetch a file, then serve as
    /// a trusted peer for it.
    Download(DownloadArgs),
    /// One-shot LIST_FILES against a running server.
    List(ListArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Listen port.
    #[arg(long)]
    pub port: u16,

    /// Concurrent normal-handler pool size (Cs).
    #[arg(long, default_value_t = 5)]
    pub cs: usize,

    /// Per-tick disconnect probability (P), in [0, 1].
    #[arg(long, default_value_t = 0.2)]
    pub p: f64,

    /// Chaos timer interval in seconds (T).
    #[arg(long, default_value_t = 10)]
    pub t: u64,

    /// Block size in bytes (B).
    #[arg(long, default_value_t = 100)]
    pub b: u64,

    /// Source directory to catalog and serve from.
    #[arg(long, default_value = "./files")]
    pub files_dir: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DownloadArgs {
    #[arg(long, default_value = "localhost")]
    pub server_host: String,

    #[arg(long, default_value_t = 12345)]
    pub server_port: u16,

    /// File id to download, or the literal `random`.
    #[arg(long, default_value = "random")]
    pub file: String,

    /// Client parallelism (Dc): number of worker sockets.
    #[arg(long, default_value_t = 1)]
    pub dc: usize,

    /// Block size in bytes (B). Must match the server's.
    #[arg(long, default_value_t = 100)]
    pub b: u64,

    /// Peer token-deny probability (Pc) once this client becomes trusted.
    #[arg(long, default_value_t = 0.2)]
    pub pc: f64,

    /// Port this client's own trusted-peer server listens on.
    #[arg(long)]
    pub port: u16,

    /// Destination directory for saved/served files.
    #[arg(long, default_value = "./downloads")]
    pub files_dir: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ListArgs {
    #[arg(long, default_value = "localhost")]
    pub server_host: String,

    #[arg(long, default_value_t = 12345)]
    pub server_port: u16,
}

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use raidfile::LayoutId;
use raidfile::config::DEFAULT_STRIPE_WIDTH;

#[derive(Parser)]
#[command(name = "raidfile", author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub layout: LayoutArgs,

    /// Print per stripe operation counts when the command finishes.
    #[arg(long, env = "RAIDFILE_STATS")]
    pub stats: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Copy a local file into the striped file.
    Write(WriteArgs),

    /// Copy a range of the striped file out to a local file or stdout.
    Read(ReadArgs),

    /// Show the file size and what every stripe looked like at open.
    Stat,

    /// Rebuild every group and rewrite blocks on repaired or unreadable stripes.
    Recover,

    /// Dump the stripe headers after validation.
    Headers,

    /// Scribble over one stripe header, for recovery drills.
    CorruptHeader(CorruptArgs),

    /// Delete every stripe file.
    Remove,
}

#[derive(Args, Debug, Clone)]
pub struct LayoutArgs {
    /// Directory holding the `stripe-<n>.dat` files.
    #[arg(long, env = "RAIDFILE_STRIPE_DIR")]
    pub stripe_dir: PathBuf,

    #[arg(long, env = "RAIDFILE_STRIPES", default_value_t = 4)]
    pub stripes: usize,

    #[arg(long, env = "RAIDFILE_PARITY", default_value_t = 1)]
    pub parity: usize,

    #[arg(long, env = "RAIDFILE_STRIPE_WIDTH", default_value_t = DEFAULT_STRIPE_WIDTH)]
    pub stripe_width: u64,

    /// Packed layout id (hex); overrides the parity and stripe width flags.
    #[arg(long, env = "RAIDFILE_LAYOUT_ID", value_parser = parse_layout_id)]
    pub layout_id: Option<LayoutId>,

    #[arg(long, env = "RAIDFILE_STREAMING")]
    pub streaming: bool,

    #[arg(long, env = "RAIDFILE_STORE_RECOVERY")]
    pub store_recovery: bool,

    #[arg(long, env = "RAIDFILE_TIMEOUT_MS", default_value_t = 30_000)]
    pub timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct WriteArgs {
    #[arg(long)]
    pub input: PathBuf,

    #[arg(long, default_value_t = 0)]
    pub offset: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ReadArgs {
    /// Destination file; stdout when omitted.
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    /// Bytes to read; up to the end of the file when omitted.
    #[arg(long)]
    pub length: Option<u64>,

    /// Rebuild every touched group from parity before reading.
    #[arg(long)]
    pub force_recovery: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CorruptArgs {
    /// Physical stripe index.
    #[arg(long)]
    pub stripe: usize,
}

fn parse_layout_id(s: &str) -> Result<LayoutId, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map(LayoutId::from_raw)
        .map_err(|e| format!("invalid layout id {s:?}: {e}"))
}

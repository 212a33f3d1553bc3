mod cli;
mod commands;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use raidfile::metrics::{Metrics, RecordingSink};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; `read` may stream file contents to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let sink = Arc::new(RecordingSink::default());
    let metrics = if cli.stats {
        Metrics::new(sink.clone())
    } else {
        Metrics::disabled()
    };
    let args = &cli.layout;

    match &cli.command {
        Command::Write(write) => {
            let written = commands::write_file(args, write, &metrics)?;
            println!("wrote {written} bytes at offset {}", write.offset);
        }
        Command::Read(read) => {
            let copied = match &read.output {
                Some(path) => {
                    let file = File::create(path)
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    commands::read_file(args, read, &metrics, &mut BufWriter::new(file))?
                }
                None => commands::read_file(args, read, &metrics, &mut io::stdout().lock())?,
            };
            tracing::info!(copied, "read finished");
        }
        Command::Stat => {
            let report = commands::stat(args, &metrics)?;
            match report.size {
                Some(size) => println!("size: {size}"),
                None => println!("size: unknown (never written)"),
            }
            println!(
                "stripes: {} physical bytes: {}",
                report.stat.stripes, report.stat.physical_size
            );
            for h in &report.health {
                println!(
                    "  [{}] logical={} header={:?} repaired={} io_errors={} {}",
                    h.physical, h.logical, h.header_state, h.header_repaired, h.io_errors, h.url
                );
            }
        }
        Command::Recover => {
            let rewritten = commands::recover(args, &metrics)?;
            println!("rewrote {rewritten} blocks");
        }
        Command::Headers => {
            for row in commands::headers(args, &metrics)? {
                println!(
                    "  [{}] found={:?} state={:?} logical={} blocks={} last_block={}",
                    row.physical,
                    row.found,
                    row.header.state(),
                    row.header.logical_index(),
                    row.header.block_count(),
                    row.header.last_block_size()
                );
            }
        }
        Command::CorruptHeader(corrupt) => commands::corrupt_header(args, corrupt)?,
        Command::Remove => commands::remove(args, &metrics)?,
    }

    if cli.stats {
        commands::print_stats(&sink, args.stripes, &mut io::stderr().lock())?;
        io::stderr().flush()?;
    }
    Ok(())
}

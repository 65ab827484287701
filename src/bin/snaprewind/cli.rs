use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI для снимков SnapRewind: разбор, проверка, демонстрация
#[derive(Parser, Debug)]
#[command(name = "snaprewind", version, about = "SnapRewind snapshot tool")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Print a generation: header, threads, areas and page flag histogram
    Inspect {
        #[arg(long)]
        dir: PathBuf,
        /// Slot number (mutually exclusive with --base)
        #[arg(long, conflicts_with = "base")]
        slot: Option<u32>,
        /// Inspect the shared base generation
        #[arg(long)]
        base: bool,
        /// Print one JSON object instead of text
        #[arg(long)]
        json: bool,
    },
    /// Read every flag and payload of a slot, resolve Unchanged pages through base
    Verify {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        slot: u32,
        #[arg(long)]
        json: bool,
    },
    /// In-process round trip: save, mutate, load, check
    Demo {
        #[arg(long)]
        dir: PathBuf,
        /// Worker threads running during save/load
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Size of the mutated buffer in KiB
        #[arg(long, default_value_t = 256)]
        buffer_kb: usize,
        #[arg(long)]
        no_incremental: bool,
        #[arg(long)]
        no_compression: bool,
        /// Keep generations in memfd instead of --dir
        #[arg(long)]
        in_ram: bool,
    },
}

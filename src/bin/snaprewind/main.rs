use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};

mod cli;
mod cmd_demo;
mod cmd_inspect;
mod cmd_verify;

fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Inspect { dir, slot, base, json } =>
            cmd_inspect::exec(dir, slot, base, json),

        cli::Cmd::Verify { dir, slot, json } =>
            cmd_verify::exec(dir, slot, json),

        cli::Cmd::Demo { dir, workers, buffer_kb, no_incremental, no_compression, in_ram } => {
            cmd_demo::exec(dir, workers, buffer_kb, !no_incremental, !no_compression, in_ram)
        }
    }
}

//! sgq-bench - asynchronous SCSI generic stress and benchmark tool
//!
//! Keeps many commands in flight on `/dev/sgN` devices from several threads
//! and reports throughput, latency and transient-error counts.
//!
//! # Usage
//!
//! ```bash
//! # 4 threads, 16 TEST UNIT READYs in flight each
//! sgq-bench -t 4 -q 16 -n 100000 /dev/sg1
//!
//! # random 4 KiB reads over the first 1 GiB, legacy interface
//! sgq-bench -o read -b 512 -c 8 --lba 0-2097151 --v3 /dev/sg1
//!
//! # try the options without a device
//! sgq-bench --dry-run -o write -t 8 -S /dev/sg0
//! ```
//!
//! Exit status: 0 when every thread reached its target, 1 on usage or setup
//! errors or when any thread failed, 2 when a write test was refused.

mod cli;
mod safety;

use clap::Parser;
use cli::Cli;
use safety::Refusal;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level())),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli::run::run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) if e.downcast_ref::<Refusal>().is_some() => {
            eprintln!("sgq-bench: {e}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("sgq-bench: {e:#}");
            ExitCode::from(1)
        }
    }
}

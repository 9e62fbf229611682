//! Run the benchmark and print the report.

use super::Cli;
use crate::safety::{self, SYSFS_ROOT};
use anyhow::{Context, Result};
use sgq_core::{DeviceOpener, Engine, MemDisk, MemOpener, OpKind, RunSummary, SysOpener};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Run with `cli`; `Ok(false)` means at least one worker failed.
pub fn run(cli: &Cli) -> Result<bool> {
    let config = cli.engine_config();

    if config.op == OpKind::Write && !cli.force && !cli.dry_run {
        for dev in &cli.devices {
            safety::check_write_target(Path::new(SYSFS_ROOT), dev)?;
        }
    }

    let opener: Arc<dyn DeviceOpener> = if cli.dry_run {
        Arc::new(dry_run_opener(cli))
    } else {
        Arc::new(SysOpener)
    };

    tracing::info!(
        devices = cli.devices.len(),
        threads = config.threads,
        dry_run = cli.dry_run,
        "starting sgq-bench"
    );
    let engine = Engine::new(config, opener);
    let summary = engine.run().context("setup failed")?;

    let mut out = std::io::stdout().lock();
    write_summary(&mut out, &summary, cli)?;
    out.flush()?;

    Ok(summary.all_succeeded())
}

/// In-memory disks standing in for every device path.
fn dry_run_opener(cli: &Cli) -> MemOpener {
    cli.devices.iter().fold(MemOpener::new(), |opener, path| {
        opener.with_disk(path.clone(), MemDisk::new(cli.dry_run_blocks, cli.block_size))
    })
}

fn write_summary(out: &mut impl Write, summary: &RunSummary, cli: &Cli) -> Result<()> {
    if cli.json {
        serde_json::to_writer_pretty(&mut *out, summary).context("serializing report")?;
        writeln!(out)?;
        return Ok(());
    }
    if OpKind::from(cli.op).needs_lba() {
        for t in &summary.targets {
            writeln!(out, "{}: LBA {}..{}", t.path.display(), t.start, t.end)?;
        }
    }
    write!(out, "{}", summary.report.render(cli.stats))?;
    for w in summary.workers.iter().filter(|w| !w.succeeded()) {
        if let Some(e) = &w.error {
            writeln!(out, "worker {} failed: {e}", w.index)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sgq-bench").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_dry_run_read() {
        let c = cli(&["--dry-run", "-t", "2", "-n", "50", "-o", "read", "--seed", "3", "/dev/sg0"]);
        assert!(run(&c).unwrap());
    }

    #[test]
    fn test_dry_run_write_skips_guard() {
        let c = cli(&["--dry-run", "-n", "20", "-o", "write", "--seed", "3", "/dev/sg42"]);
        assert!(run(&c).unwrap());
    }

    #[test]
    fn test_text_summary() {
        let c = cli(&["--dry-run", "-o", "read", "-n", "10", "--seed", "1", "--lba", "0-99", "/dev/sg0"]);
        let engine = Engine::new(c.engine_config(), Arc::new(dry_run_opener(&c)));
        let summary = engine.run().unwrap();
        let mut buf = Vec::new();
        write_summary(&mut buf, &summary, &c).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("/dev/sg0: LBA 0..100"));
        assert!(text.contains("completed 10 commands"));
        assert!(!text.contains("failed"));
    }

    #[test]
    fn test_noop_summary_has_no_lba_range() {
        let c = cli(&["--dry-run", "-n", "10", "/dev/sg0"]);
        let engine = Engine::new(c.engine_config(), Arc::new(dry_run_opener(&c)));
        let summary = engine.run().unwrap();
        let mut buf = Vec::new();
        write_summary(&mut buf, &summary, &c).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("LBA"));
        assert!(text.contains("completed 10 commands"));
    }

    #[test]
    fn test_json_summary() {
        let c = cli(&["--dry-run", "--json", "-o", "read", "-n", "10", "--seed", "1", "/dev/sg0"]);
        let engine = Engine::new(c.engine_config(), Arc::new(dry_run_opener(&c)));
        let summary = engine.run().unwrap();
        let mut buf = Vec::new();
        write_summary(&mut buf, &summary, &c).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v["report"]["completed"], 10);
        assert_eq!(v["workers"][0]["device"], "/dev/sg0");
        assert_eq!(v["targets"][0]["end"], crate::cli::DEFAULT_DRY_RUN_BLOCKS);
    }

    #[test]
    fn test_bad_config_is_setup_error() {
        let c = cli(&["--dry-run", "-q", "0", "/dev/sg0"]);
        let err = run(&c).unwrap_err();
        assert!(format!("{err:#}").contains("queue depth"));
    }
}

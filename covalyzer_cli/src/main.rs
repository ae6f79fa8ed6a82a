use covalyzer_core::config::{CoverageMode, CovalyzerConfig};
use covalyzer_core::session::{RunSummary, run_session};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Replay a fuzzing corpus against a coverage build and report coverage"
)]
struct Cli {
    /// TOML configuration; flags below override its values.
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,

    /// SQLite database holding the fuzzer's testcases.
    #[clap(long, required_unless_present = "config_file")]
    db: Option<PathBuf>,

    /// Coverage-instrumented build of the fuzz target.
    #[clap(long, required_unless_present = "config_file")]
    bin: Option<PathBuf>,

    /// Directory receiving profiles, reports and the merged profile.
    #[clap(long, required_unless_present = "config_file")]
    out: Option<PathBuf>,

    /// all, queue, queue_restarts, all_restarts, fuzzbench or eval_only.
    #[clap(short, long, value_parser = CoverageMode::from_str)]
    mode: Option<CoverageMode>,

    #[clap(long)]
    batch_size: Option<u64>,

    /// Snapshot window width in seconds (fuzzbench mode).
    #[clap(long)]
    snapshot_window: Option<u32>,

    /// Per-invocation timeout for the instrumented binary.
    #[clap(long)]
    timeout_ms: Option<u64>,

    /// Where per-batch input directories are materialized.
    #[clap(long)]
    scratch_dir: Option<PathBuf>,
}

fn build_config(cli: Cli) -> Result<CovalyzerConfig, anyhow::Error> {
    let mut config = match cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from {config_path:?}");
            CovalyzerConfig::load_from_file(&config_path)?
        }
        None => {
            let db = cli.db.clone().context("--db is required without --config-file")?;
            let bin = cli.bin.clone().context("--bin is required without --config-file")?;
            let out = cli.out.clone().context("--out is required without --config-file")?;
            CovalyzerConfig::new(db, bin, out, CoverageMode::default())
        }
    };

    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(bin) = cli.bin {
        config.coverage_binary = bin;
    }
    if let Some(out) = cli.out {
        config.output_dir = out;
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(batch_size) = cli.batch_size {
        config.replay.batch_size = batch_size;
    }
    if let Some(window) = cli.snapshot_window {
        config.replay.snapshot_window_secs = window;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.replay.timeout_ms = Some(timeout_ms);
    }
    if let Some(scratch_dir) = cli.scratch_dir {
        config.replay.scratch_dir = scratch_dir;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn log_summary(summary: &RunSummary) {
    let replay = &summary.replay;
    if summary.strategy.replays() {
        info!(
            "Replayed {} testcases in {} batches, {} profiles written to {:?}",
            replay.testcases_replayed(),
            replay.batches_attempted(),
            replay.artifacts.len(),
            summary.output_dir
        );
        for failure in &replay.failures {
            warn!(
                "{} ({} testcases) failed: {}",
                failure.batch, failure.testcases, failure.reason
            );
        }
    }

    match &summary.evaluation {
        Some(evaluation) => {
            info!(
                "Coverage summary ({} profiles merged into {:?}):\n{}",
                evaluation.profiles_merged, evaluation.merged_profile, evaluation.summary
            );
            if let Some(show) = &evaluation.show_path {
                info!("Line-level coverage written to {show:?}");
            }
        }
        None => warn!("No coverage was evaluated"),
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_env(
            env_logger::Env::default()
                .filter("COVALYZER_LOG")
                .write_style("COVALYZER_LOG_STYLE"),
        )
        .init();

    let config = build_config(Cli::parse())?;
    log::debug!("Effective configuration: {config:#?}");

    let start_time = Instant::now();
    let summary = run_session(&config).context("Coverage run failed")?;
    log_summary(&summary);
    info!("Finished in {:.2?}", start_time.elapsed());

    if !summary.replay.is_complete() {
        anyhow::bail!(
            "{} of {} batches produced no coverage profile",
            summary.replay.failures.len(),
            summary.replay.batches_attempted()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_build_a_config_without_file() {
        let cli = Cli::try_parse_from([
            "covalyzer",
            "--db",
            "corpus.db",
            "--bin",
            "./target_cov",
            "--out",
            "out",
            "--mode",
            "queue_restarts",
            "--batch-size",
            "50",
        ])
        .unwrap();
        let config = build_config(cli).unwrap();
        assert_eq!(config.db_path, PathBuf::from("corpus.db"));
        assert_eq!(config.mode, CoverageMode::QueueWithRestarts);
        assert_eq!(config.replay.batch_size, 50);
        assert_eq!(config.replay.snapshot_window_secs, 900);
    }

    #[test]
    fn required_paths_without_config_file() {
        assert!(Cli::try_parse_from(["covalyzer", "--db", "corpus.db"]).is_err());
    }

    #[test]
    fn unknown_mode_is_rejected_by_parser() {
        let result = Cli::try_parse_from([
            "covalyzer",
            "--db",
            "a",
            "--bin",
            "b",
            "--out",
            "c",
            "--mode",
            "everything",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let cli = Cli::try_parse_from([
            "covalyzer",
            "--db",
            "a",
            "--bin",
            "b",
            "--out",
            "c",
            "--batch-size",
            "0",
        ])
        .unwrap();
        assert!(build_config(cli).is_err());
    }
}

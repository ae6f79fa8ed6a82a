use crate::config::{ConfigError, FlatDiscipline, ReplaySettings};
use crate::executor::{CoverageExecutor, ExecutionContext, ExecutionStatus};
use crate::scratch::EphemeralBatchDir;
use crate::segment::restart_segments;
use crate::store::{CorpusStore, StoreError};
use crate::strategy::ReplayStrategy;
use crate::testcase::{Testcase, TestcaseId};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension of raw coverage profiles written by the instrumented binary.
pub const PROFILE_EXTENSION: &str = "profraw";

/// File name of the JSON manifest describing a replay run.
pub const REPORT_FILENAME: &str = "replay_report.json";

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Corpus store query failed: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid replay settings: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to prepare output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write replay report to {path:?}: {message}")]
    Report { path: PathBuf, message: String },
}

/// Partition key of one batch. It alone determines the artifact file name, so
/// names are reproducible across runs and never collide within one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "key", rename_all = "kebab-case")]
pub enum BatchId {
    /// Page offset in stateless replay.
    Offset(u64),
    /// Snapshot window index.
    Bucket(i64),
    /// Position of a restart segment.
    Segment(usize),
    /// A single testcase in per-input replay.
    Input(TestcaseId),
}

impl BatchId {
    pub fn artifact_file_name(&self) -> String {
        match self {
            BatchId::Offset(offset) => format!("batch_{offset}.{PROFILE_EXTENSION}"),
            BatchId::Bucket(bucket) => format!("snapshot_{bucket}.{PROFILE_EXTENSION}"),
            BatchId::Segment(index) => format!("segment_{index}.{PROFILE_EXTENSION}"),
            BatchId::Input(id) => format!("input_{id}.{PROFILE_EXTENSION}"),
        }
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchId::Offset(offset) => write!(f, "batch {offset}"),
            BatchId::Bucket(bucket) => write!(f, "snapshot {bucket}"),
            BatchId::Segment(index) => write!(f, "segment {index}"),
            BatchId::Input(id) => write!(f, "input {id}"),
        }
    }
}

/// Raw profile produced by one successful batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageProfileArtifact {
    pub path: PathBuf,
    pub batch: BatchId,
    pub testcases: usize,
}

/// A batch whose run did not yield a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub batch: BatchId,
    pub testcases: usize,
    pub reason: String,
}

/// Outcome of one replay run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub strategy: ReplayStrategy,
    pub artifacts: Vec<CoverageProfileArtifact>,
    pub failures: Vec<BatchFailure>,
    /// Partitions that held no testcases and were never run.
    pub skipped_empty: usize,
}

impl ReplayReport {
    pub fn new(strategy: ReplayStrategy) -> Self {
        Self {
            strategy,
            artifacts: Vec::new(),
            failures: Vec::new(),
            skipped_empty: 0,
        }
    }

    /// True when every attempted batch produced its artifact.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn batches_attempted(&self) -> usize {
        self.artifacts.len() + self.failures.len()
    }

    pub fn testcases_replayed(&self) -> usize {
        self.artifacts.iter().map(|a| a.testcases).sum()
    }

    /// Writes the report as pretty JSON to `dir/replay_report.json`.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, ReplayError> {
        let path = dir.join(REPORT_FILENAME);
        let file = File::create(&path).map_err(|e| ReplayError::Report {
            path: path.clone(),
            message: e.to_string(),
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|e| {
            ReplayError::Report {
                path: path.clone(),
                message: e.to_string(),
            }
        })?;
        Ok(path)
    }

    fn log_summary(&self) {
        if self.is_complete() {
            info!(
                "Finished {}: {} profiles from {} testcases ({} empty partitions skipped)",
                self.strategy,
                self.artifacts.len(),
                self.testcases_replayed(),
                self.skipped_empty
            );
        } else {
            warn!(
                "Finished {} with failures: {} of {} batches produced no profile",
                self.strategy,
                self.failures.len(),
                self.batches_attempted()
            );
        }
    }
}

/// Partitions the corpus according to a [`ReplayStrategy`] and runs each partition
/// through the instrumented binary, strictly one at a time and in ascending key order.
pub struct ReplayEngine<S, E> {
    store: S,
    executor: E,
    settings: ReplaySettings,
    output_dir: PathBuf,
}

impl<S: CorpusStore, E: CoverageExecutor> ReplayEngine<S, E> {
    pub fn new(store: S, executor: E, settings: ReplaySettings, output_dir: PathBuf) -> Self {
        Self {
            store,
            executor,
            settings,
            output_dir,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn run(&mut self, strategy: ReplayStrategy) -> Result<ReplayReport, ReplayError> {
        let mut report = ReplayReport::new(strategy);
        if !strategy.replays() {
            info!("Skipping replay, evaluating existing profiles only");
            return Ok(report);
        }

        self.prepare_output_dir()?;
        info!("Starting {strategy} into {:?}", self.output_dir);

        match strategy {
            ReplayStrategy::StatelessFlat { queue_only } => match self.settings.flat_discipline {
                FlatDiscipline::Directory => self.replay_flat_batches(queue_only, &mut report)?,
                FlatDiscipline::PerInput => self.replay_flat_per_input(queue_only, &mut report)?,
            },
            ReplayStrategy::FuzzbenchSnapshot => self.replay_snapshots(&mut report)?,
            ReplayStrategy::RestartSegmented { queue_only } => {
                self.replay_restart_segments(queue_only, &mut report)?
            }
            ReplayStrategy::EvalOnly => {}
        }

        report.log_summary();
        Ok(report)
    }

    fn prepare_output_dir(&mut self) -> Result<(), ReplayError> {
        // Profiles are written by the child, possibly from another working directory.
        let prepared = fs::create_dir_all(&self.output_dir)
            .and_then(|_| fs::canonicalize(&self.output_dir));
        match prepared {
            Ok(abs) => {
                self.output_dir = abs;
                Ok(())
            }
            Err(source) => Err(ReplayError::OutputDir {
                path: self.output_dir.clone(),
                source,
            }),
        }
    }

    /// Path the binary writes `batch`'s profile to. A profile already there from an
    /// earlier run is removed so only this run's output can be recorded.
    fn artifact_path(&self, batch: BatchId) -> PathBuf {
        let profile = self.output_dir.join(batch.artifact_file_name());
        discard_profile(&profile);
        profile
    }

    /// Pages through the corpus and runs each page as one directory-mode batch.
    fn replay_flat_batches(
        &mut self,
        queue_only: bool,
        report: &mut ReplayReport,
    ) -> Result<(), ReplayError> {
        let batch_size = self.settings.batch_size;
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize.into());
        }
        let mut offset = 0u64;
        loop {
            debug!("Fetching up to {batch_size} testcases at offset {offset}");
            let page = self.store.fetch_testcases(offset, batch_size, queue_only)?;
            if page.is_empty() {
                break;
            }
            let fetched = page.len() as u64;
            info!(
                "Running batch: {} » {} ({} testcases)",
                offset,
                offset + fetched - 1,
                page.len()
            );
            self.run_directory_batch(BatchId::Offset(offset), &page, report);
            offset += fetched;
            if fetched < batch_size {
                break;
            }
        }
        Ok(())
    }

    /// Pages through the corpus and runs the binary once per testcase.
    fn replay_flat_per_input(
        &mut self,
        queue_only: bool,
        report: &mut ReplayReport,
    ) -> Result<(), ReplayError> {
        let batch_size = self.settings.batch_size;
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize.into());
        }
        let mut offset = 0u64;
        loop {
            let page = self.store.fetch_testcases(offset, batch_size, queue_only)?;
            if page.is_empty() {
                break;
            }
            info!("Running {} single-input executions from offset {offset}", page.len());
            for tc in &page {
                let batch = BatchId::Input(tc.id);
                let profile = self.artifact_path(batch);
                let status = self
                    .executor
                    .run_single(tc, &ExecutionContext::for_profile(&profile));
                self.record_outcome(batch, 1, profile, status, report);
            }
            let fetched = page.len() as u64;
            offset += fetched;
            if fetched < batch_size {
                break;
            }
        }
        Ok(())
    }

    fn replay_snapshots(&mut self, report: &mut ReplayReport) -> Result<(), ReplayError> {
        let window = self.settings.snapshot_window()?;
        let buckets = self.store.fetch_queue_snapshots(window)?;
        info!(
            "Queue spans {} snapshot windows of {}s",
            buckets.len(),
            window.get()
        );
        for (bucket, testcases) in &buckets {
            info!(
                "Running snapshot bucket {bucket} with {} testcases",
                testcases.len()
            );
            self.run_directory_batch(BatchId::Bucket(*bucket), testcases, report);
        }
        Ok(())
    }

    fn replay_restart_segments(
        &mut self,
        queue_only: bool,
        report: &mut ReplayReport,
    ) -> Result<(), ReplayError> {
        let restarts = self.store.fetch_restart_boundaries()?;
        let segments = restart_segments(&restarts);
        info!(
            "{} restart events split the corpus into {} segments",
            restarts.len(),
            segments.len()
        );

        for (index, bounds) in segments.iter().enumerate() {
            let testcases = self.store.fetch_testcase_range(bounds, queue_only)?;
            if testcases.is_empty() {
                debug!("Segment {index} {bounds} is empty, skipping");
                report.skipped_empty += 1;
                continue;
            }
            info!(
                "Running segment {index}: ids {bounds} ({} testcases)",
                testcases.len()
            );
            let batch = BatchId::Segment(index);
            let profile = self.artifact_path(batch);
            let status = self
                .executor
                .run_streaming(&testcases, &ExecutionContext::for_profile(&profile));
            self.record_outcome(batch, testcases.len(), profile, status, report);
        }
        Ok(())
    }

    /// Materializes a batch into the scratch directory, runs the binary over it and
    /// removes the directory again before returning.
    fn run_directory_batch(
        &mut self,
        batch: BatchId,
        testcases: &[Testcase],
        report: &mut ReplayReport,
    ) {
        if testcases.is_empty() {
            report.skipped_empty += 1;
            return;
        }
        let profile = self.artifact_path(batch);

        let inputs = match EphemeralBatchDir::materialize(&self.settings.scratch_dir, testcases) {
            Ok(inputs) => inputs,
            Err(e) => {
                let reason = format!(
                    "Failed to materialize inputs in {:?}: {e}",
                    self.settings.scratch_dir
                );
                warn!("{batch}: {reason}");
                report.failures.push(BatchFailure {
                    batch,
                    testcases: testcases.len(),
                    reason,
                });
                return;
            }
        };

        let status = self
            .executor
            .run_input_dir(inputs.path(), &ExecutionContext::for_profile(&profile));

        let scratch = inputs.path().to_path_buf();
        if let Err(e) = inputs.close() {
            warn!("Failed to remove scratch directory {scratch:?} for {batch}: {e}");
        }

        self.record_outcome(batch, testcases.len(), profile, status, report);
    }

    fn record_outcome(
        &self,
        batch: BatchId,
        testcases: usize,
        profile: PathBuf,
        status: ExecutionStatus,
        report: &mut ReplayReport,
    ) {
        let reason = match status {
            ExecutionStatus::Ok if profile.is_file() => {
                debug!("{batch} wrote {profile:?}");
                report.artifacts.push(CoverageProfileArtifact {
                    path: profile,
                    batch,
                    testcases,
                });
                return;
            }
            ExecutionStatus::Ok => "binary exited cleanly but wrote no profile".to_string(),
            failed => failed.describe(),
        };

        warn!("{batch} failed, continuing: {reason}");
        discard_profile(&profile);
        report.failures.push(BatchFailure {
            batch,
            testcases,
            reason,
        });
    }
}

/// Removes a stale or partial profile so it never reaches the merge step.
fn discard_profile(profile: &Path) {
    match fs::remove_file(profile) {
        Ok(()) => debug!("Removed leftover profile {profile:?}"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial profile {profile:?}: {e}"),
    }
}

use crate::snapshot::DEFAULT_SNAPSHOT_WINDOW_SECS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown coverage mode '{0}' (expected one of: all, queue, queue_restarts, all_restarts, fuzzbench, eval_only)")]
    UnknownMode(String),
    #[error("batch-size must be greater than zero")]
    ZeroBatchSize,
    #[error("snapshot-window-secs must be greater than zero")]
    ZeroSnapshotWindow,
    #[error("timeout-ms must be greater than zero when set")]
    ZeroTimeout,
}

/// Which slice of the corpus is replayed and whether fuzzer restarts are honored.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoverageMode {
    #[default]
    #[serde(rename = "all")]
    AllTestcases,
    #[serde(rename = "queue")]
    QueueOnly,
    #[serde(rename = "queue_restarts")]
    QueueWithRestarts,
    #[serde(rename = "all_restarts")]
    AllWithRestarts,
    #[serde(rename = "fuzzbench")]
    FuzzbenchLike,
    #[serde(rename = "eval_only")]
    EvalOnly,
}

impl CoverageMode {
    pub const ALL: [CoverageMode; 6] = [
        CoverageMode::AllTestcases,
        CoverageMode::QueueOnly,
        CoverageMode::QueueWithRestarts,
        CoverageMode::AllWithRestarts,
        CoverageMode::FuzzbenchLike,
        CoverageMode::EvalOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageMode::AllTestcases => "all",
            CoverageMode::QueueOnly => "queue",
            CoverageMode::QueueWithRestarts => "queue_restarts",
            CoverageMode::AllWithRestarts => "all_restarts",
            CoverageMode::FuzzbenchLike => "fuzzbench",
            CoverageMode::EvalOnly => "eval_only",
        }
    }
}

impl fmt::Display for CoverageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoverageMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CoverageMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownMode(s.to_string()))
    }
}

/// How flat (restart-unaware) replay drives the binary.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FlatDiscipline {
    /// One invocation per batch over a materialized input directory.
    #[default]
    Directory,
    /// One invocation per testcase, input on stdin.
    PerInput,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReplaySettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_snapshot_window_secs")]
    pub snapshot_window_secs: u32,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default)]
    pub flat_discipline: FlatDiscipline,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub fn default_batch_size() -> u64 {
    1000
}

fn default_snapshot_window_secs() -> u32 {
    DEFAULT_SNAPSHOT_WINDOW_SECS
}

/// `/dev/shm` keeps materialized batches in RAM; fall back to the system temp dir
/// where it does not exist.
pub fn default_scratch_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() {
        shm
    } else {
        std::env::temp_dir()
    }
}

impl ReplaySettings {
    pub fn snapshot_window(&self) -> Result<NonZeroU32, ConfigError> {
        NonZeroU32::new(self.snapshot_window_secs).ok_or(ConfigError::ZeroSnapshotWindow)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            snapshot_window_secs: default_snapshot_window_secs(),
            scratch_dir: default_scratch_dir(),
            flat_discipline: FlatDiscipline::default(),
            timeout_ms: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolchainSettings {
    #[serde(default = "default_profdata")]
    pub profdata: PathBuf,
    #[serde(default = "default_cov")]
    pub cov: PathBuf,
    #[serde(default)]
    pub show_report: bool,
}

fn default_profdata() -> PathBuf {
    PathBuf::from("llvm-profdata")
}

fn default_cov() -> PathBuf {
    PathBuf::from("llvm-cov")
}

impl Default for ToolchainSettings {
    fn default() -> Self {
        Self {
            profdata: default_profdata(),
            cov: default_cov(),
            show_report: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CovalyzerConfig {
    pub db_path: PathBuf,
    pub coverage_binary: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub mode: CoverageMode,
    #[serde(default)]
    pub replay: ReplaySettings,
    #[serde(default)]
    pub toolchain: ToolchainSettings,
}

impl CovalyzerConfig {
    pub fn new(
        db_path: PathBuf,
        coverage_binary: PathBuf,
        output_dir: PathBuf,
        mode: CoverageMode,
    ) -> Self {
        Self {
            db_path,
            coverage_binary,
            output_dir,
            mode,
            replay: ReplaySettings::default(),
            toolchain: ToolchainSettings::default(),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CovalyzerConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Rejects settings that would make the replay loop meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replay.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        self.replay.snapshot_window()?;
        if self.replay.timeout_ms == Some(0) {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn mode_strings_round_trip_through_from_str() {
        for mode in CoverageMode::ALL {
            assert_eq!(mode.as_str().parse::<CoverageMode>(), Ok(mode));
        }
        assert_eq!(
            "restarts".parse::<CoverageMode>(),
            Err(ConfigError::UnknownMode("restarts".to_string()))
        );
    }

    #[test]
    fn minimal_toml_gets_defaults() {
        let config: CovalyzerConfig = toml::from_str(
            r#"
            db-path = "fuzz.db"
            coverage-binary = "./target_cov"
            output-dir = "out"
            "#,
        )
        .unwrap();
        assert_eq!(config.mode, CoverageMode::AllTestcases);
        assert_eq!(config.replay.batch_size, 1000);
        assert_eq!(config.replay.snapshot_window_secs, 900);
        assert_eq!(config.replay.flat_discipline, FlatDiscipline::Directory);
        assert_eq!(config.replay.timeout(), None);
        assert_eq!(config.toolchain.profdata, PathBuf::from("llvm-profdata"));
        assert!(!config.toolchain.show_report);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_toml_is_parsed() {
        let config: CovalyzerConfig = toml::from_str(
            r#"
            db-path = "fuzz.db"
            coverage-binary = "./target_cov"
            output-dir = "out"
            mode = "queue_restarts"

            [replay]
            batch-size = 250
            snapshot-window-secs = 60
            scratch-dir = "/tmp/cov"
            flat-discipline = "per-input"
            timeout-ms = 5000

            [toolchain]
            profdata = "/opt/llvm/bin/llvm-profdata"
            cov = "/opt/llvm/bin/llvm-cov"
            show-report = true
            "#,
        )
        .unwrap();
        assert_eq!(config.mode, CoverageMode::QueueWithRestarts);
        assert_eq!(config.replay.batch_size, 250);
        assert_eq!(config.replay.snapshot_window().unwrap().get(), 60);
        assert_eq!(config.replay.flat_discipline, FlatDiscipline::PerInput);
        assert_eq!(config.replay.timeout(), Some(Duration::from_secs(5)));
        assert!(config.toolchain.show_report);
    }

    #[test]
    fn unknown_mode_and_fields_are_rejected() {
        let bad_mode = toml::from_str::<CovalyzerConfig>(
            r#"
            db-path = "fuzz.db"
            coverage-binary = "bin"
            output-dir = "out"
            mode = "restarts"
            "#,
        );
        assert!(bad_mode.is_err());

        let bad_field = toml::from_str::<CovalyzerConfig>(
            r#"
            db-path = "fuzz.db"
            coverage-binary = "bin"
            output-dir = "out"
            threads = 4
            "#,
        );
        assert!(bad_field.is_err());
    }

    #[test]
    fn validate_rejects_zero_values() {
        let mut config = CovalyzerConfig::new(
            "db".into(),
            "bin".into(),
            "out".into(),
            CoverageMode::FuzzbenchLike,
        );
        config.replay.batch_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBatchSize));

        config.replay.batch_size = 10;
        config.replay.snapshot_window_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroSnapshotWindow));

        config.replay.snapshot_window_secs = 900;
        config.replay.timeout_ms = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout));
    }

    #[test]
    fn load_from_file_reports_missing_and_malformed_files() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = CovalyzerConfig::load_from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));

        let malformed = dir.path().join("bad.toml");
        fs::write(&malformed, "db-path = ").unwrap();
        let err = CovalyzerConfig::load_from_file(&malformed).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"));

        let good = dir.path().join("good.toml");
        fs::write(
            &good,
            "db-path = \"a.db\"\ncoverage-binary = \"b\"\noutput-dir = \"c\"\nmode = \"fuzzbench\"\n",
        )
        .unwrap();
        let config = CovalyzerConfig::load_from_file(&good).unwrap();
        assert_eq!(config.mode, CoverageMode::FuzzbenchLike);
    }
}

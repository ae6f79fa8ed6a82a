use crate::config::{ConfigError, CovalyzerConfig};
use crate::evaluator::{CoverageEvaluator, Evaluation, EvaluatorError};
use crate::executor::{CommandExecutor, CommandExecutorConfig};
use crate::replay::{ReplayEngine, ReplayError, ReplayReport};
use crate::store::{SqliteCorpusStore, StoreError};
use crate::strategy::{ReplayStrategy, select_strategy};
use log::{info, warn};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to open corpus store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("Coverage evaluation failed: {0}")]
    Evaluation(#[from] EvaluatorError),
}

/// What a complete run left behind.
#[derive(Debug)]
pub struct RunSummary {
    pub strategy: ReplayStrategy,
    pub output_dir: PathBuf,
    pub replay: ReplayReport,
    /// `None` for evaluation-only runs, which write no replay report.
    pub report_path: Option<PathBuf>,
    /// `None` when there were no profiles to merge.
    pub evaluation: Option<Evaluation>,
}

/// Replays the corpus as `config.mode` dictates, then merges and reports coverage.
pub fn run_session(config: &CovalyzerConfig) -> Result<RunSummary, SessionError> {
    config.validate()?;
    let strategy = select_strategy(config.mode);
    info!("Mode '{}' selects {strategy}", config.mode);

    let (replay, output_dir, report_path) = if strategy.replays() {
        let store = SqliteCorpusStore::open(&config.db_path)?;
        let mut executor_config = CommandExecutorConfig::new(config.coverage_binary.clone());
        executor_config.timeout = config.replay.timeout();
        let executor = CommandExecutor::new(executor_config);

        let mut engine = ReplayEngine::new(
            store,
            executor,
            config.replay.clone(),
            config.output_dir.clone(),
        );
        let replay = engine.run(strategy)?;
        let output_dir = engine.output_dir().to_path_buf();
        let report_path = replay.write_to(&output_dir)?;
        info!("Replay report written to {report_path:?}");
        (replay, output_dir, Some(report_path))
    } else {
        (
            ReplayReport::new(strategy),
            config.output_dir.clone(),
            None,
        )
    };

    let evaluator = CoverageEvaluator::new(
        output_dir.clone(),
        config.coverage_binary.clone(),
        output_dir.clone(),
        config.toolchain.clone(),
    );
    let evaluation = match evaluator.evaluate() {
        Ok(evaluation) => Some(evaluation),
        Err(EvaluatorError::NoProfiles(dir)) => {
            warn!("No coverage profiles in {dir:?}, skipping evaluation");
            None
        }
        Err(e) => return Err(e.into()),
    };

    Ok(RunSummary {
        strategy,
        output_dir,
        replay,
        report_path,
        evaluation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoverageMode;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn config_in(root: &Path, mode: CoverageMode) -> CovalyzerConfig {
        let mut config = CovalyzerConfig::new(
            root.join("corpus.db"),
            root.join("target_cov"),
            root.join("out"),
            mode,
        );
        config.replay.scratch_dir = root.to_path_buf();
        config
    }

    #[test]
    fn invalid_config_fails_before_touching_anything() {
        let root = tempdir().unwrap();
        let mut config = config_in(root.path(), CoverageMode::AllTestcases);
        config.replay.batch_size = 0;
        assert!(matches!(
            run_session(&config),
            Err(SessionError::Config(ConfigError::ZeroBatchSize))
        ));
        assert!(!root.path().join("out").exists());
    }

    #[test]
    fn missing_database_is_fatal_for_replaying_modes() {
        let root = tempdir().unwrap();
        let config = config_in(root.path(), CoverageMode::QueueOnly);
        assert!(matches!(
            run_session(&config),
            Err(SessionError::Store(StoreError::NotFound(_)))
        ));
    }

    #[test]
    fn eval_only_without_profiles_skips_evaluation() {
        let root = tempdir().unwrap();
        let config = config_in(root.path(), CoverageMode::EvalOnly);
        let summary = run_session(&config).unwrap();
        assert_eq!(summary.strategy, ReplayStrategy::EvalOnly);
        assert!(summary.report_path.is_none());
        assert!(summary.evaluation.is_none());
        assert_eq!(summary.replay.batches_attempted(), 0);
    }

    #[cfg(unix)]
    mod end_to_end {
        use super::*;
        use crate::store::test_utils::{create_sqlite_corpus, numbered_testcases};

        fn with_fake_binaries(mut config: CovalyzerConfig) -> CovalyzerConfig {
            let targets = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../test_targets");
            config.coverage_binary = targets.join("fake_covbin.sh");
            config.toolchain.profdata = targets.join("fake_llvm_profdata.sh");
            config.toolchain.cov = targets.join("fake_llvm_cov.sh");
            config
        }

        #[test]
        fn replays_reports_and_evaluates() {
            let root = tempdir().unwrap();
            let mut config = with_fake_binaries(config_in(root.path(), CoverageMode::AllTestcases));
            config.replay.batch_size = 2;
            create_sqlite_corpus(&config.db_path, &numbered_testcases(1..=3), &[], &[]).unwrap();

            let summary = run_session(&config).unwrap();
            assert!(summary.replay.is_complete());
            assert_eq!(summary.replay.artifacts.len(), 2);
            assert_eq!(summary.replay.testcases_replayed(), 3);

            let report = fs::read_to_string(summary.report_path.unwrap()).unwrap();
            assert!(report.contains("\"stateless-flat\""));

            let evaluation = summary.evaluation.unwrap();
            assert_eq!(evaluation.profiles_merged, 2);
            assert_eq!(
                fs::read_to_string(&evaluation.merged_profile).unwrap(),
                "id_1 id_2 id_3 "
            );
            assert!(summary.output_dir.join("coverage_summary.txt").is_file());
        }

        #[test]
        fn eval_only_merges_existing_profiles() {
            let root = tempdir().unwrap();
            let config = with_fake_binaries(config_in(root.path(), CoverageMode::EvalOnly));
            fs::create_dir_all(&config.output_dir).unwrap();
            fs::write(config.output_dir.join("segment_0.profraw"), b"old").unwrap();

            let summary = run_session(&config).unwrap();
            assert!(!config.db_path.exists());
            let evaluation = summary.evaluation.unwrap();
            assert_eq!(evaluation.profiles_merged, 1);
            assert_eq!(fs::read_to_string(evaluation.merged_profile).unwrap(), "old");
        }
    }
}

use crate::config::CoverageMode;
use serde::Serialize;
use std::fmt;

/// How the corpus is partitioned and fed to the instrumented binary.
///
/// Every [`CoverageMode`] maps to exactly one strategy; the mapping is fixed for the
/// lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum ReplayStrategy {
    /// Page through the corpus in fixed-size batches, ignoring restarts.
    StatelessFlat { queue_only: bool },
    /// Replay queue entries grouped into fixed-width time windows.
    FuzzbenchSnapshot,
    /// One streaming run per segment between two recorded restarts.
    RestartSegmented { queue_only: bool },
    /// Skip replay; only merge and report existing profiles.
    EvalOnly,
}

impl ReplayStrategy {
    /// Whether this strategy executes the binary and queries the corpus store.
    pub fn replays(&self) -> bool {
        !matches!(self, ReplayStrategy::EvalOnly)
    }

    pub fn queue_only(&self) -> bool {
        match self {
            ReplayStrategy::StatelessFlat { queue_only }
            | ReplayStrategy::RestartSegmented { queue_only } => *queue_only,
            ReplayStrategy::FuzzbenchSnapshot => true,
            ReplayStrategy::EvalOnly => false,
        }
    }
}

impl fmt::Display for ReplayStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = if self.queue_only() { "queue" } else { "all" };
        match self {
            ReplayStrategy::StatelessFlat { .. } => write!(f, "stateless flat replay ({scope})"),
            ReplayStrategy::FuzzbenchSnapshot => f.write_str("snapshot-bucketed replay (queue)"),
            ReplayStrategy::RestartSegmented { .. } => {
                write!(f, "restart-segmented replay ({scope})")
            }
            ReplayStrategy::EvalOnly => f.write_str("evaluation only"),
        }
    }
}

/// Maps an evaluation mode to its replay strategy.
pub fn select_strategy(mode: CoverageMode) -> ReplayStrategy {
    match mode {
        CoverageMode::AllTestcases => ReplayStrategy::StatelessFlat { queue_only: false },
        CoverageMode::QueueOnly => ReplayStrategy::StatelessFlat { queue_only: true },
        CoverageMode::AllWithRestarts => ReplayStrategy::RestartSegmented { queue_only: false },
        CoverageMode::QueueWithRestarts => ReplayStrategy::RestartSegmented { queue_only: true },
        CoverageMode::FuzzbenchLike => ReplayStrategy::FuzzbenchSnapshot,
        CoverageMode::EvalOnly => ReplayStrategy::EvalOnly,
    }
}

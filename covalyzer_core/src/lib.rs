pub mod config;
pub mod evaluator;
pub mod executor;
pub mod replay;
pub mod scratch;
pub mod segment;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod strategy;
pub mod testcase;

pub use config::{CoverageMode, CovalyzerConfig};
pub use evaluator::{CoverageEvaluator, Evaluation, EvaluatorError};
pub use executor::{CommandExecutor, CoverageExecutor, ExecutionContext, ExecutionStatus};
pub use replay::{ReplayEngine, ReplayError, ReplayReport};
pub use scratch::EphemeralBatchDir;
pub use segment::{SegmentBounds, restart_segments};
pub use session::{RunSummary, SessionError, run_session};
pub use snapshot::bucket_queue_events;
pub use store::{CorpusStore, InMemoryCorpusStore, SqliteCorpusStore, StoreError};
pub use strategy::{ReplayStrategy, select_strategy};
pub use testcase::{QueueEvent, QueuedTestcase, RestartEvent, Testcase, TestcaseId};

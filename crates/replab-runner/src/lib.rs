//! Mutating side of replab: stage execution, session fan-out and the
//! reconciliation loop that drives an experiment directory to completion.

pub mod aggregate;
pub mod controller;
pub mod event_log;
pub mod executor;
pub mod lock;
pub mod pipeline;
pub mod process;

pub use aggregate::{aggregate, write_results_table};
pub use controller::{ActionRecord, ReconcileOutcome, ReconcileStatus, ReconciliationController};
pub use event_log::{EventLog, EventRow};
pub use executor::{
    BatchSummary, CancelFlag, CommandSessionRunner, ConcurrentTaskExecutor, SessionRunner,
    TaskResult,
};
pub use lock::OperationLock;
pub use pipeline::{
    CommandStageInvoker, PipelineOutcome, PipelinePlan, SessionPolicy, SessionSelection, Stage,
    StageInvoker, StagePipeline,
};
pub use process::{STAGE_FAILED_TOKEN, STAGE_OK_TOKEN};

use revbox_storage::StorageError;
use thiserror::Error;

pub mod engine;
pub mod executor;

pub use engine::{run_rollover, RolloverReport};
pub use executor::{next_quarter_boundary, ExecutorConfig, QuarterHourExecutor};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("firing exceeded its execution budget")]
    BudgetExceeded,
    #[error("firing task failed: {0}")]
    Join(String),
}

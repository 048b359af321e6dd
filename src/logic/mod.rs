pub mod diff_engine;
pub mod jobs;
pub mod lifecycle;
pub mod operations;
pub mod replay;
pub mod squash;

pub use diff_engine::DiffEngine;
pub use jobs::{JobOutcome, JobRunner};
pub use lifecycle::{Lifecycle, OperationGuard, PolicyDecision};
pub use operations::{
    BranchService, ChangeSummary, HistoryEntry, MergeStrategy, NewBranch, OperationReport,
};
pub use replay::{Disposition, ReplayDirection, ReplayEngine, ReplayOutcome, ReplayReport};
pub use squash::{collapse, order_by_dependencies, CollapsedAction, CollapsedChange};

pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

pub use error::BranchError;

// Export logic types
pub use logic::{
    BranchService, DiffEngine, JobOutcome, JobRunner, Lifecycle, MergeStrategy, NewBranch,
    OperationReport, PolicyDecision, ReplayDirection, ReplayEngine, ReplayReport,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{MemoryStore, MigrationSource, PostgresStore, Store};

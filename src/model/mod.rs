pub mod branch;
pub mod change;
pub mod common;
pub mod diff;
pub mod registry;

pub use branch::*;
pub use change::*;
pub use common::*;
pub use diff::*;
pub use registry::*;

//! External-collaborator contracts for the farm submitter: the Scheduler,
//! the Shared Store, the Production Data source and the Version Registry,
//! plus in-memory and file-backed implementations.

pub mod file;
pub mod memory;
pub mod types;

pub use file::*;
pub use memory::*;
pub use types::*;

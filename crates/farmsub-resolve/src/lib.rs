//! Frame and version resolution over a batch of render environments.
//!
//! [`resolve_all`] is the entry point: it refreshes production ranges, runs
//! frame-rule resolution for every environment and pass, resolves output
//! versions, and returns one machine-readable report row per item.

pub mod driver;
pub mod frames;
pub mod version;

pub use driver::{resolve_all, resolve_environment_slice};
pub use frames::{resolve_environment, resolve_pass};
pub use version::{collapse_versions, resolve_environment_versions};

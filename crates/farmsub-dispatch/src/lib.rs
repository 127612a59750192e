//! Submission and dispatch: turning a resolved batch into paused scheduler
//! jobs, mapping declared WAIT-on relations onto dependency edges, and
//! coordinating the release across detached workers through the shared
//! store.

pub mod coordinator;
pub mod graph;
pub mod host;
pub mod submit;

pub use coordinator::*;
pub use graph::*;
pub use host::*;
pub use submit::*;

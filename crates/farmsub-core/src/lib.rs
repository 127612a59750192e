#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared data model for the farm submitter: identifiers, frame-set algebra,
//! frame rules, the override/layering model, resolution config and the
//! persisted session schema.

pub mod config;
pub mod frameset;
pub mod ids;
pub mod model;
pub mod report;
pub mod rules;
pub mod session;

mod util;

pub use config::*;
pub use frameset::*;
pub use ids::*;
pub use model::*;
pub use report::*;
pub use rules::*;
pub use session::*;
pub use util::now_ms;

//! Machine-readable per-item results. Nothing is thrown across unit
//! boundaries; drivers collect one outcome per item instead.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::ItemId;

/// The result of resolving or submitting one item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The item resolved (and, where applicable, submitted) fully.
    Resolved,
    /// The item was left out, with the reason (`skipped:<reason>`).
    Skipped(String),
    /// The item failed, with the reason (`failed:<reason>`).
    Failed(String),
}

impl Outcome {
    /// Shorthand constructor for a skip.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped(reason.into())
    }

    /// Shorthand constructor for a failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed(reason.into())
    }

    /// True for [`Outcome::Resolved`].
    pub fn is_resolved(&self) -> bool {
        matches!(self, Outcome::Resolved)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Resolved => f.write_str("resolved"),
            Outcome::Skipped(reason) => write!(f, "skipped:{reason}"),
            Outcome::Failed(reason) => write!(f, "failed:{reason}"),
        }
    }
}

/// One item's outcome, labelled for humans.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    /// The item this row is about.
    pub item: ItemId,
    /// Human label (`area`, `area:source`).
    pub label: String,
    /// What happened.
    pub outcome: Outcome,
}

impl ItemReport {
    /// Builds a report row.
    pub fn new(item: ItemId, label: impl Into<String>, outcome: Outcome) -> Self {
        Self { item, label: label.into(), outcome }
    }
}

impl fmt::Display for ItemReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.label, self.outcome)
    }
}

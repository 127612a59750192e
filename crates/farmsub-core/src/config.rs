//! Resolution configuration: an explicit value handed into every resolution
//! call, never process-wide state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::VersionPolicy;

/// Whether environments resolve before their passes, and what that means for
/// a pass's base range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverrideOrdering {
    /// Passes resolve against the environment's resolved range; a pass-level
    /// frame-range override may escape it.
    #[default]
    EnvironmentFirst,
    /// Passes resolve against the production base and are then intersected
    /// with the environment's resolved range (narrow, never escape).
    PassFirst,
}

/// Everything one resolution or coordination run needs to know.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Environment-first or pass-first resolution ordering.
    pub ordering: OverrideOrdering,
    /// Policy used when neither pass nor environment carries a version
    /// override.
    pub default_version_policy: VersionPolicy,
    /// Sleep between shared-store polls while waiting for sibling workers.
    pub poll_interval: Duration,
    /// Poll attempts before a worker gives up on missing targets.
    pub max_poll_attempts: u32,
    /// Optional expiry handed to the scheduler when pausing fresh jobs.
    pub pause_expiry: Option<Duration>,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            ordering: OverrideOrdering::default(),
            default_version_policy: VersionPolicy::Next,
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 60,
            pause_expiry: None,
        }
    }
}

impl ResolutionConfig {
    /// A copy that polls once and never sleeps. Local submission registers
    /// everything before building edges, so a missing target can never
    /// appear later.
    pub fn immediate(&self) -> Self {
        Self {
            poll_interval: Duration::ZERO,
            max_poll_attempts: 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_five_minutes_of_polling() {
        let cfg = ResolutionConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.max_poll_attempts, 60);
        assert_eq!(cfg.ordering, OverrideOrdering::EnvironmentFirst);
        assert_eq!(cfg.default_version_policy, VersionPolicy::Next);
    }

    #[test]
    fn immediate_copy_polls_once() {
        let cfg = ResolutionConfig::default().immediate();
        assert_eq!(cfg.max_poll_attempts, 1);
        assert_eq!(cfg.poll_interval, Duration::ZERO);
    }
}

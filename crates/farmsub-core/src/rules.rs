//! Named frame rules and the per-item rule flag sets.
//!
//! Add-rule flags compose by union; remove-rule flags subtract after every
//! add-rule has been applied, in any order. A NOT-rule of the same kind as a
//! set add-rule still applies after it.

use serde::{Deserialize, Serialize};

use crate::frameset::FrameSet;

/// A named frame rule, evaluated against a base range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameRule {
    /// The production "important frames" list, intersected with the base.
    Important,
    /// First frame, arithmetic-middle frame and last frame of the base.
    FirstMiddleLast,
    /// Every Nth frame rebuilt from the base set's bounds (gap-filling).
    EveryNth(i64),
}

/// Context handed to rule evaluators.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuleContext<'a> {
    /// Production important-frames list for the owning area, when known.
    pub important: Option<&'a FrameSet>,
}

impl FrameRule {
    /// Evaluates the rule over `base`. An empty base yields an empty set,
    /// never an error.
    pub fn evaluate(&self, base: &FrameSet, ctx: &RuleContext<'_>) -> FrameSet {
        match self {
            FrameRule::Important => match ctx.important {
                Some(important) => important.intersection(base),
                None => FrameSet::empty(),
            },
            FrameRule::FirstMiddleLast => {
                let frames: Vec<i64> = base.iter().collect();
                match frames.as_slice() {
                    [] => FrameSet::empty(),
                    all => FrameSet::from_frames([
                        all[0],
                        all[all.len() / 2],
                        all[all.len() - 1],
                    ]),
                }
            }
            FrameRule::EveryNth(n) => {
                if *n < 1 {
                    return FrameSet::empty();
                }
                match base.bounds() {
                    Some((lo, hi)) => {
                        FrameSet::from_frames((lo..=hi).step_by(*n as usize))
                    }
                    None => FrameSet::empty(),
                }
            }
        }
    }
}

/// The fixed flag set carried by an OverrideSet, one for add-rules and one
/// mirrored for NOT-rules. `xn` of zero or less means unset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFlags {
    /// Important-frames rule.
    pub important: bool,
    /// First/middle/last rule.
    pub fml: bool,
    /// Every frame (x1).
    pub x1: bool,
    /// Every tenth frame (x10).
    pub x10: bool,
    /// Every Nth frame with a custom N.
    pub xn: Option<i64>,
}

impl RuleFlags {
    /// True when at least one rule flag is set.
    pub fn any(&self) -> bool {
        self.important || self.fml || self.x1 || self.x10 || self.usable_xn().is_some()
    }

    /// The custom N when it is set and usable.
    pub fn usable_xn(&self) -> Option<i64> {
        self.xn.filter(|n| *n >= 1)
    }

    /// Expands flags into rules, in a fixed order for deterministic logs.
    pub fn rules(&self) -> Vec<FrameRule> {
        let mut out = Vec::new();
        if self.important {
            out.push(FrameRule::Important);
        }
        if self.fml {
            out.push(FrameRule::FirstMiddleLast);
        }
        if self.x1 {
            out.push(FrameRule::EveryNth(1));
        }
        if self.x10 {
            out.push(FrameRule::EveryNth(10));
        }
        if let Some(n) = self.usable_xn() {
            out.push(FrameRule::EveryNth(n));
        }
        out
    }

    /// Layers these flags over `under`: booleans union, a pass-level `xn`
    /// wins over the environment's.
    pub fn merged_over(&self, under: &RuleFlags) -> RuleFlags {
        RuleFlags {
            important: self.important || under.important,
            fml: self.fml || under.fml,
            x1: self.x1 || under.x1,
            x10: self.x10 || under.x10,
            xn: self.xn.or(under.xn),
        }
    }
}

//! Frame-rule resolution: from layered overrides and production ranges to
//! the cached enabled/queued frame sets.

use tracing::warn;

use farmsub_core::{
    Batch, EnvId, FrameSet, ItemId, Outcome, OverrideOrdering, OverrideSet, PassId, RangeSource,
    ResolutionConfig, ResolvedFrames, RuleContext,
};

/// Resolves an environment's own frame sets from its overrides and production
/// ranges, caching the result on the environment.
///
/// The base range is the explicit frame-range override when set and parsable,
/// else the preferred production range with the fixed fallback chain. No base
/// anywhere leaves the cache cleared and reports `skipped:no-frame-range`.
pub fn resolve_environment(batch: &mut Batch, id: EnvId) -> Outcome {
    let computed = {
        let Some(env) = batch.environment(id) else {
            return Outcome::failed("unknown-environment");
        };
        let label = env.label();
        let base = explicit_range(&env.overrides, &label)
            .or_else(|| env.ranges.pick(env.range_source).map(|(_, set)| set.clone()));
        base.map(|base| {
            let enabled = apply_rules(
                &env.overrides,
                &base,
                env.ranges.get(RangeSource::Important),
                &label,
            );
            let queued = if env.is_active() {
                enabled.clone()
            } else {
                FrameSet::empty()
            };
            ResolvedFrames { enabled, queued }
        })
    };
    let Some(env) = batch.environment_mut(id) else {
        return Outcome::failed("unknown-environment");
    };
    match computed {
        Some(resolved) => {
            env.resolved = Some(resolved);
            Outcome::Resolved
        }
        None => {
            env.resolved = None;
            Outcome::skipped("no-frame-range")
        }
    }
}

/// Resolves one pass's frame sets against its environment, honoring the
/// configured override ordering, caching the result on the pass.
///
/// Under environment-first ordering a pass without its own frame-range
/// override inherits the environment's resolved range as its base; under
/// pass-first ordering the pass resolves against the production base and the
/// final set is intersected with the environment's resolved range, so pass
/// overrides narrow but never escape it.
pub fn resolve_pass(batch: &mut Batch, id: PassId, cfg: &ResolutionConfig) -> Outcome {
    let active = batch.pass_is_active(id);
    let computed = {
        let Some(pass) = batch.pass(id) else {
            return Outcome::failed("unknown-pass");
        };
        let Some(env) = batch.environment(pass.env) else {
            return Outcome::failed("unknown-environment");
        };
        let label = batch.label_of(ItemId::Pass(id));
        let eff = pass.overrides.layered_over(&env.overrides);

        let mut base = explicit_range(&eff, &label);
        if base.is_none() && cfg.ordering == OverrideOrdering::EnvironmentFirst {
            base = env
                .resolved
                .as_ref()
                .map(|r| r.enabled.clone())
                .filter(|set| !set.is_empty());
        }
        if base.is_none() {
            base = env.ranges.pick(env.range_source).map(|(_, set)| set.clone());
        }
        base.map(|base| {
            let mut enabled =
                apply_rules(&eff, &base, env.ranges.get(RangeSource::Important), &label);
            if cfg.ordering == OverrideOrdering::PassFirst {
                if let Some(resolved) = &env.resolved {
                    enabled = enabled.intersection(&resolved.enabled);
                }
            }
            let queued = if active {
                enabled.clone()
            } else {
                FrameSet::empty()
            };
            ResolvedFrames { enabled, queued }
        })
    };
    let Some(pass) = batch.pass_mut(id) else {
        return Outcome::failed("unknown-pass");
    };
    match computed {
        Some(resolved) => {
            pass.resolved = Some(resolved);
            Outcome::Resolved
        }
        None => {
            pass.resolved = None;
            Outcome::skipped("no-frame-range")
        }
    }
}

/// The explicit frame-range override of a set, when present, parsable and
/// non-empty. An unparsable override is logged and treated as absent.
fn explicit_range(overrides: &OverrideSet, owner: &str) -> Option<FrameSet> {
    let text = overrides.frame_range.as_deref()?;
    parse_or_warn(text, "frame_range_override", owner).filter(|set| !set.is_empty())
}

fn parse_or_warn(text: &str, field: &str, owner: &str) -> Option<FrameSet> {
    match FrameSet::parse(text) {
        Ok(set) => Some(set),
        Err(err) => {
            warn!(owner, field, text, %err, "ignoring unparsable frame range");
            None
        }
    }
}

/// Applies add-rules then NOT-rules over `base`. Add-rules union into an
/// empty accumulator; with none set the accumulator is the base unchanged.
/// Every NOT-rule (and the NOT-frame-range) evaluates against the same base
/// and subtracts from the accumulator, so removal order cannot matter.
fn apply_rules(
    overrides: &OverrideSet,
    base: &FrameSet,
    important: Option<&FrameSet>,
    owner: &str,
) -> FrameSet {
    let ctx = RuleContext { important };
    let adds = overrides.add_rules.rules();
    let mut acc = if adds.is_empty() {
        base.clone()
    } else {
        let mut acc = FrameSet::empty();
        for rule in adds {
            acc = acc.union(&rule.evaluate(base, &ctx));
        }
        acc
    };
    for rule in overrides.not_rules.rules() {
        acc = acc.difference(&rule.evaluate(base, &ctx));
    }
    if let Some(text) = overrides.not_frame_range.as_deref() {
        if let Some(not) = parse_or_warn(text, "not_frame_range_override", owner) {
            acc = acc.difference(&not);
        }
    }
    acc
}

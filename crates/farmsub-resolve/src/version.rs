//! Output-version resolution per pass, including the sibling-wide maximum
//! and the submission-time collapse into explicit overrides.

use farmsub_core::{Batch, EnvId, Outcome, PassId, ResolutionConfig, VersionOverride, VersionPolicy};
use farmsub_services::VersionRegistry;

/// The effective policy of one pass after layering and the config default.
enum Policy {
    Pinned(i64),
    MatchSource,
    Next,
    NextAcrossSiblings,
}

/// One registry lookup, with the error flattened for per-item reporting.
enum Lookup {
    Found(i64),
    Absent,
    Error(String),
}

/// Resolves output versions for every active pass of one environment,
/// caching each resolved number on its pass. Returns one outcome per active
/// pass.
///
/// Two-step evaluation: first the registry's "next" is fetched for every
/// active pass, because the sibling maximum ranges over all of them, not
/// just the ones pinned to the sibling policy; then each pass resolves per
/// its own effective policy.
pub fn resolve_environment_versions(
    batch: &mut Batch,
    env_id: EnvId,
    cfg: &ResolutionConfig,
    registry: &dyn VersionRegistry,
) -> Vec<(PassId, Outcome)> {
    let Some(env) = batch.environment(env_id) else {
        return Vec::new();
    };
    let area = env.area.clone();

    let mut drafts: Vec<(PassId, Policy, Lookup)> = Vec::new();
    let mut needs_source = false;
    for id in batch.active_passes_of(env_id) {
        let policy = effective_policy(batch, id, cfg);
        if matches!(policy, Policy::MatchSource) {
            needs_source = true;
        }
        let next = next_version(registry, &area, &source_name(batch, id));
        drafts.push((id, policy, next));
    }

    let sibling_max = drafts
        .iter()
        .filter_map(|(_, _, next)| match next {
            Lookup::Found(n) => Some(*n),
            _ => None,
        })
        .max();
    let source = if needs_source {
        match registry.source_version(&area) {
            Ok(Some(v)) => Lookup::Found(v),
            Ok(None) => Lookup::Absent,
            Err(err) => Lookup::Error(err.to_string()),
        }
    } else {
        Lookup::Absent
    };

    let mut out = Vec::with_capacity(drafts.len());
    for (id, policy, next) in drafts {
        let (version, outcome) = match policy {
            Policy::Pinned(n) => (Some(n), Outcome::Resolved),
            Policy::MatchSource => match &source {
                Lookup::Found(v) => (Some(*v), Outcome::Resolved),
                Lookup::Absent => (None, Outcome::skipped("no-source-version")),
                Lookup::Error(err) => (None, Outcome::failed(format!("version-lookup ({err})"))),
            },
            Policy::Next => resolve_lookup(next),
            Policy::NextAcrossSiblings => match next {
                // Own location known: take the uniform sibling maximum.
                Lookup::Found(own) => (Some(sibling_max.unwrap_or(own)), Outcome::Resolved),
                other => resolve_lookup(other),
            },
        };
        if let Some(pass) = batch.pass_mut(id) {
            pass.resolved_version = version;
        }
        out.push((id, outcome));
    }
    out
}

/// Freezes every resolved version into its pass's override set as an
/// explicit number. Run at submission time, never during interactive
/// preview, so that an independent re-evaluation inside a dispatched worker
/// reproduces identical versions from a now-stale registry.
pub fn collapse_versions(batch: &mut Batch) {
    for env_id in batch.env_ids() {
        for pass_id in batch.passes_of(env_id) {
            let Some(pass) = batch.pass_mut(pass_id) else {
                continue;
            };
            if let Some(version) = pass.resolved_version {
                pass.overrides.version = VersionOverride::Explicit(version);
            }
        }
    }
}

fn effective_policy(batch: &Batch, pass: PassId, cfg: &ResolutionConfig) -> Policy {
    let version = batch
        .effective_overrides(pass)
        .map(|o| o.version)
        .unwrap_or_default();
    match version {
        VersionOverride::Explicit(n) => Policy::Pinned(n),
        VersionOverride::Policy(p) => policy_of(p),
        VersionOverride::Unset => policy_of(cfg.default_version_policy),
    }
}

fn policy_of(policy: VersionPolicy) -> Policy {
    match policy {
        VersionPolicy::MatchSource => Policy::MatchSource,
        VersionPolicy::Next => Policy::Next,
        VersionPolicy::NextAcrossSiblings => Policy::NextAcrossSiblings,
    }
}

/// The next free version for one output location. `Absent` means the
/// registry does not know the location at all; a known location with no
/// published versions comes back as highest 0 and nexts to 1.
fn next_version(registry: &dyn VersionRegistry, area: &str, pass_name: &str) -> Lookup {
    match registry.highest_version(area, pass_name) {
        Ok(Some(highest)) => Lookup::Found(highest + 1),
        Ok(None) => Lookup::Absent,
        Err(err) => Lookup::Error(err.to_string()),
    }
}

fn resolve_lookup(lookup: Lookup) -> (Option<i64>, Outcome) {
    match lookup {
        Lookup::Found(v) => (Some(v), Outcome::Resolved),
        Lookup::Absent => (None, Outcome::skipped("unknown-output-location")),
        Lookup::Error(err) => (None, Outcome::failed(format!("version-lookup ({err})"))),
    }
}

fn source_name(batch: &Batch, pass: PassId) -> String {
    batch
        .pass(pass)
        .and_then(|p| batch.source(p.source))
        .map(|s| s.name.clone())
        .unwrap_or_default()
}

//! The resolve-all driver: production ranges, frames and versions over every
//! environment, with failures scoped to the smallest unit.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use farmsub_core::{
    Batch, EnvId, ItemId, ItemReport, Outcome, ProductionRanges, RangeSource, ResolutionConfig,
};
use farmsub_services::{ProductionData, ServiceResult, VersionRegistry};

use crate::{frames, version};

/// Runs frame and version resolution over the whole batch.
///
/// Production ranges are refreshed first, per environment; an environment
/// whose fetch fails reports `failed:production-data (..)` and its siblings
/// carry on. Every environment and every pass of a non-cancelled environment
/// gets exactly one report row; a cancelled environment reports a single
/// `skipped:cancelled` row. Inactive items still get their enabled frames
/// cached but report `skipped:not-active` and are excluded from version
/// resolution.
pub fn resolve_all(
    batch: &mut Batch,
    cfg: &ResolutionConfig,
    production: &dyn ProductionData,
    registry: &dyn VersionRegistry,
) -> Vec<ItemReport> {
    batch.invalidate_all();
    let mut reports = Vec::new();
    for env_id in batch.env_ids() {
        resolve_one_environment(batch, env_id, cfg, production, registry, &mut reports);
    }
    debug!(
        items = reports.len(),
        resolved = reports.iter().filter(|r| r.outcome.is_resolved()).count(),
        "resolve all finished"
    );
    reports
}

/// Resolves a single environment, leaving the rest of the batch's caches
/// untouched. Deferred-submission workers use this to refresh only their own
/// slice of a reloaded session.
pub fn resolve_environment_slice(
    batch: &mut Batch,
    env_id: EnvId,
    cfg: &ResolutionConfig,
    production: &dyn ProductionData,
    registry: &dyn VersionRegistry,
) -> Vec<ItemReport> {
    batch.invalidate_environment(env_id);
    let mut reports = Vec::new();
    resolve_one_environment(batch, env_id, cfg, production, registry, &mut reports);
    reports
}

fn resolve_one_environment(
    batch: &mut Batch,
    env_id: EnvId,
    cfg: &ResolutionConfig,
    production: &dyn ProductionData,
    registry: &dyn VersionRegistry,
    reports: &mut Vec<ItemReport>,
) {
    let Some(env) = batch.environment(env_id) else {
        return;
    };
    let env_item = ItemId::Environment(env_id);
    let env_label = env.label();
    if env.cancelled {
        reports.push(ItemReport::new(env_item, env_label, Outcome::skipped("cancelled")));
        return;
    }
    let env_active = env.is_active();
    let area = env.area.clone();

    if let Err(err) = refresh_ranges(batch, env_id, production) {
        warn!(area = %area, error = %err, "production range fetch failed");
        reports.push(ItemReport::new(
            env_item,
            env_label,
            Outcome::failed(format!("production-data ({err})")),
        ));
        return;
    }

    let env_frames = frames::resolve_environment(batch, env_id);
    let env_outcome = if env_active {
        env_frames
    } else {
        Outcome::skipped("not-active")
    };
    reports.push(ItemReport::new(env_item, env_label, env_outcome));

    let mut frame_outcomes = BTreeMap::new();
    for pass_id in batch.passes_of(env_id) {
        frame_outcomes.insert(pass_id, frames::resolve_pass(batch, pass_id, cfg));
    }
    let version_outcomes: BTreeMap<_, _> =
        version::resolve_environment_versions(batch, env_id, cfg, registry)
            .into_iter()
            .collect();

    for pass_id in batch.passes_of(env_id) {
        let label = batch.label_of(ItemId::Pass(pass_id));
        let frames_row = frame_outcomes.remove(&pass_id).unwrap_or(Outcome::Resolved);
        let outcome = if !batch.pass_is_active(pass_id) {
            Outcome::skipped("not-active")
        } else if !frames_row.is_resolved() {
            frames_row
        } else {
            version_outcomes
                .get(&pass_id)
                .cloned()
                .unwrap_or(Outcome::Resolved)
        };
        reports.push(ItemReport::new(ItemId::Pass(pass_id), label, outcome));
    }
}

/// Replaces an environment's production ranges wholesale from the data
/// source. One failing kind fails the whole environment's refresh.
fn refresh_ranges(
    batch: &mut Batch,
    env_id: EnvId,
    production: &dyn ProductionData,
) -> ServiceResult<()> {
    let Some(env) = batch.environment(env_id) else {
        return Ok(());
    };
    let area = env.area.clone();
    let mut fetched = ProductionRanges::default();
    for kind in RangeSource::FALLBACK {
        fetched.set(kind, production.range(&area, kind)?);
    }
    if let Some(env) = batch.environment_mut(env_id) {
        env.ranges = fetched;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsub_core::FrameSet;
    use farmsub_services::{MemProductionData, MemVersionRegistry, ServiceError};

    fn fs(text: &str) -> FrameSet {
        FrameSet::parse(text).unwrap()
    }

    fn outcome_for<'a>(reports: &'a [ItemReport], label: &str) -> &'a Outcome {
        &reports.iter().find(|r| r.label == label).unwrap().outcome
    }

    #[test]
    fn cancelled_environments_report_one_row() {
        let mut batch = Batch::new();
        let env = batch.add_environment("/show/a");
        let src = batch.add_source("beauty");
        batch.add_pass(env, src).unwrap();
        batch.environment_mut(env).unwrap().cancelled = true;

        let reports = resolve_all(
            &mut batch,
            &ResolutionConfig::default(),
            &MemProductionData::new(),
            &MemVersionRegistry::new(),
        );
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Outcome::skipped("cancelled"));
    }

    #[test]
    fn ranges_are_fetched_before_resolution() {
        let mut batch = Batch::new();
        let env = batch.add_environment("/show/a");
        let src = batch.add_source("beauty");
        let pass = batch.add_pass(env, src).unwrap();

        let production = MemProductionData::new();
        production.set("/show/a", RangeSource::Cut, fs("1-10"));
        let registry = MemVersionRegistry::new();
        registry.set_highest("/show/a", "beauty", 0);

        let reports = resolve_all(&mut batch, &ResolutionConfig::default(), &production, &registry);
        assert!(reports.iter().all(|r| r.outcome.is_resolved()));
        assert_eq!(
            batch.pass(pass).unwrap().resolved.clone().unwrap().queued,
            fs("1-10")
        );
        assert_eq!(batch.pass(pass).unwrap().resolved_version, Some(1));
    }

    struct BrokenProduction;

    impl ProductionData for BrokenProduction {
        fn range(&self, area: &str, _kind: RangeSource) -> ServiceResult<Option<FrameSet>> {
            Err(ServiceError::Backend(format!("no data for {area}")))
        }
    }

    #[test]
    fn production_failure_scopes_to_one_environment() {
        struct HalfBroken(MemProductionData);
        impl ProductionData for HalfBroken {
            fn range(&self, area: &str, kind: RangeSource) -> ServiceResult<Option<FrameSet>> {
                if area == "/show/bad" {
                    return BrokenProduction.range(area, kind);
                }
                self.0.range(area, kind)
            }
        }

        let mut batch = Batch::new();
        let bad = batch.add_environment("/show/bad");
        let good = batch.add_environment("/show/good");
        let src = batch.add_source("beauty");
        batch.add_pass(bad, src).unwrap();
        batch.add_pass(good, src).unwrap();

        let inner = MemProductionData::new();
        inner.set("/show/good", RangeSource::Cut, fs("1-4"));
        let registry = MemVersionRegistry::new();
        registry.set_highest("/show/good", "beauty", 2);

        let reports = resolve_all(
            &mut batch,
            &ResolutionConfig::default(),
            &HalfBroken(inner),
            &registry,
        );
        assert_eq!(
            outcome_for(&reports, "/show/bad").to_string(),
            "failed:production-data (backend: no data for /show/bad)"
        );
        assert!(outcome_for(&reports, "/show/good").is_resolved());
        assert!(outcome_for(&reports, "/show/good:beauty").is_resolved());
    }

    #[test]
    fn inactive_items_report_not_active_but_cache_enabled_frames() {
        let mut batch = Batch::new();
        let env = batch.add_environment("/show/a");
        let src = batch.add_source("beauty");
        let pass = batch.add_pass(env, src).unwrap();
        batch.pass_mut(pass).unwrap().queued = false;

        let production = MemProductionData::new();
        production.set("/show/a", RangeSource::Cut, fs("1-10"));
        let reports = resolve_all(
            &mut batch,
            &ResolutionConfig::default(),
            &production,
            &MemVersionRegistry::new(),
        );
        assert_eq!(outcome_for(&reports, "/show/a:beauty"), &Outcome::skipped("not-active"));
        let resolved = batch.pass(pass).unwrap().resolved.clone().unwrap();
        assert_eq!(resolved.enabled, fs("1-10"));
        assert!(resolved.queued.is_empty());
        assert_eq!(batch.pass(pass).unwrap().resolved_version, None);
    }

    #[test]
    fn version_outcome_surfaces_on_the_pass_row() {
        let mut batch = Batch::new();
        let env = batch.add_environment("/show/a");
        let src = batch.add_source("beauty");
        batch.add_pass(env, src).unwrap();
        let production = MemProductionData::new();
        production.set("/show/a", RangeSource::Cut, fs("1-10"));

        // No registry entry for the location: frames resolve, version skips.
        let reports = resolve_all(
            &mut batch,
            &ResolutionConfig::default(),
            &production,
            &MemVersionRegistry::new(),
        );
        assert!(outcome_for(&reports, "/show/a").is_resolved());
        assert_eq!(
            outcome_for(&reports, "/show/a:beauty"),
            &Outcome::skipped("unknown-output-location")
        );
    }
}

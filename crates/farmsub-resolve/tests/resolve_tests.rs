//! End-to-end resolution scenarios over the public API.

use farmsub_core::{
    Batch, FrameSet, PassId, RangeSource, ResolutionConfig, RuleFlags, VersionOverride,
    VersionPolicy,
};
use farmsub_resolve::{collapse_versions, resolve_all};
use farmsub_services::{MemProductionData, MemVersionRegistry};

fn fs(text: &str) -> FrameSet {
    FrameSet::parse(text).unwrap()
}

fn queued_text(batch: &Batch, pass: PassId) -> String {
    batch
        .pass(pass)
        .unwrap()
        .resolved
        .clone()
        .unwrap()
        .queued
        .to_string()
}

#[test]
fn beauty_override_and_specular_cut_under_environment_first() {
    let mut batch = Batch::new();
    let env = batch.add_environment("/show/shots/010/0010");
    let beauty_src = batch.add_source("beauty");
    let specular_src = batch.add_source("specular");
    let beauty = batch.add_pass(env, beauty_src).unwrap();
    let specular = batch.add_pass(env, specular_src).unwrap();
    batch.pass_mut(beauty).unwrap().overrides.frame_range = Some("1-10".into());

    let production = MemProductionData::new();
    production.set("/show/shots/010/0010", RangeSource::Cut, fs("5-8"));
    let registry = MemVersionRegistry::new();
    registry.set_highest("/show/shots/010/0010", "beauty", 0);
    registry.set_highest("/show/shots/010/0010", "specular", 0);

    let reports = resolve_all(&mut batch, &ResolutionConfig::default(), &production, &registry);
    assert!(reports.iter().all(|r| r.outcome.is_resolved()));
    assert_eq!(queued_text(&batch, beauty), "1-10");
    assert_eq!(queued_text(&batch, specular), "5-8");
}

#[test]
fn first_middle_last_over_one_to_nine() {
    let mut batch = Batch::new();
    let env = batch.add_environment("/show/shots/010/0010");
    let src = batch.add_source("beauty");
    let beauty = batch.add_pass(env, src).unwrap();
    batch.pass_mut(beauty).unwrap().overrides.add_rules =
        RuleFlags { fml: true, ..RuleFlags::default() };

    let production = MemProductionData::new();
    production.set("/show/shots/010/0010", RangeSource::Cut, fs("1-9"));
    let registry = MemVersionRegistry::new();
    registry.set_highest("/show/shots/010/0010", "beauty", 3);

    resolve_all(&mut batch, &ResolutionConfig::default(), &production, &registry);
    let resolved = batch.pass(beauty).unwrap().resolved.clone().unwrap();
    assert_eq!(resolved.queued, fs("1,5,9"));
}

#[test]
fn resolving_twice_is_bit_identical() {
    let mut batch = Batch::new();
    let env = batch.add_environment("/show/shots/020/0040");
    let beauty_src = batch.add_source("beauty");
    let specular_src = batch.add_source("specular");
    let beauty = batch.add_pass(env, beauty_src).unwrap();
    let specular = batch.add_pass(env, specular_src).unwrap();
    batch.pass_mut(beauty).unwrap().overrides.add_rules =
        RuleFlags { x10: true, ..RuleFlags::default() };
    batch.environment_mut(env).unwrap().overrides.not_frame_range = Some("50-60".into());

    let production = MemProductionData::new();
    production.set("/show/shots/020/0040", RangeSource::Cut, fs("1-100"));
    let registry = MemVersionRegistry::new();
    registry.set_highest("/show/shots/020/0040", "beauty", 11);
    registry.set_highest("/show/shots/020/0040", "specular", 4);

    let cfg = ResolutionConfig::default();
    resolve_all(&mut batch, &cfg, &production, &registry);
    let first: Vec<(String, Option<i64>)> = [beauty, specular]
        .iter()
        .map(|p| (queued_text(&batch, *p), batch.pass(*p).unwrap().resolved_version))
        .collect();

    resolve_all(&mut batch, &cfg, &production, &registry);
    let second: Vec<(String, Option<i64>)> = [beauty, specular]
        .iter()
        .map(|p| (queued_text(&batch, *p), batch.pass(*p).unwrap().resolved_version))
        .collect();

    assert_eq!(first, second);
}

#[test]
fn next_across_siblings_through_the_driver() {
    let mut batch = Batch::new();
    let env = batch.add_environment("/show/shots/010/0010");
    batch.environment_mut(env).unwrap().overrides.version =
        VersionOverride::Policy(VersionPolicy::NextAcrossSiblings);
    let a_src = batch.add_source("beauty");
    let b_src = batch.add_source("specular");
    let a = batch.add_pass(env, a_src).unwrap();
    let b = batch.add_pass(env, b_src).unwrap();

    let production = MemProductionData::new();
    production.set("/show/shots/010/0010", RangeSource::Cut, fs("1-10"));
    let registry = MemVersionRegistry::new();
    registry.set_highest("/show/shots/010/0010", "beauty", 4);
    registry.set_highest("/show/shots/010/0010", "specular", 2);

    resolve_all(&mut batch, &ResolutionConfig::default(), &production, &registry);
    assert_eq!(batch.pass(a).unwrap().resolved_version, Some(5));
    assert_eq!(batch.pass(b).unwrap().resolved_version, Some(5));
}

#[test]
fn collapse_makes_resolution_reproducible_against_a_stale_registry() {
    let mut batch = Batch::new();
    let env = batch.add_environment("/show/shots/010/0010");
    let src = batch.add_source("beauty");
    let beauty = batch.add_pass(env, src).unwrap();

    let production = MemProductionData::new();
    production.set("/show/shots/010/0010", RangeSource::Cut, fs("1-10"));
    let registry = MemVersionRegistry::new();
    registry.set_highest("/show/shots/010/0010", "beauty", 4);

    let cfg = ResolutionConfig::default();
    resolve_all(&mut batch, &cfg, &production, &registry);
    collapse_versions(&mut batch);

    // A sibling publish bumps the registry between dispatch and the worker's
    // own re-resolution; the collapsed session must not care.
    registry.set_highest("/show/shots/010/0010", "beauty", 7);
    resolve_all(&mut batch, &cfg, &production, &registry);
    assert_eq!(batch.pass(beauty).unwrap().resolved_version, Some(5));
}

#[test]
fn unparsable_override_degrades_to_production_range() {
    let mut batch = Batch::new();
    let env = batch.add_environment("/show/shots/010/0010");
    let src = batch.add_source("beauty");
    let beauty = batch.add_pass(env, src).unwrap();
    batch.pass_mut(beauty).unwrap().overrides.frame_range = Some("1-x-oops".into());

    let production = MemProductionData::new();
    production.set("/show/shots/010/0010", RangeSource::Cut, fs("5-8"));
    let registry = MemVersionRegistry::new();
    registry.set_highest("/show/shots/010/0010", "beauty", 0);

    let reports = resolve_all(&mut batch, &ResolutionConfig::default(), &production, &registry);
    assert!(reports.iter().all(|r| r.outcome.is_resolved()));
    assert_eq!(queued_text(&batch, beauty), "5-8");
}

#[test]
fn not_rules_apply_after_add_rules() {
    let mut batch = Batch::new();
    let env = batch.add_environment("/show/shots/030/0100");
    let src = batch.add_source("beauty");
    let beauty = batch.add_pass(env, src).unwrap();
    {
        let overrides = &mut batch.pass_mut(beauty).unwrap().overrides;
        overrides.add_rules = RuleFlags { x10: true, ..RuleFlags::default() };
        overrides.not_rules = RuleFlags { fml: true, ..RuleFlags::default() };
    }

    let production = MemProductionData::new();
    production.set("/show/shots/030/0100", RangeSource::Cut, fs("1-100"));
    let registry = MemVersionRegistry::new();
    registry.set_highest("/show/shots/030/0100", "beauty", 0);

    resolve_all(&mut batch, &ResolutionConfig::default(), &production, &registry);
    assert_eq!(queued_text(&batch, beauty), "11-41x10,61-91x10");
}

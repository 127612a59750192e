use farmsub_core::{
    Batch, FrameSet, OverrideOrdering, OverrideSet, PostTask, ResolutionConfig, RuleFlags,
    SessionDoc, VersionOverride, VersionPolicy,
};
use uuid::Uuid;

fn fs(text: &str) -> FrameSet {
    FrameSet::parse(text).unwrap()
}

#[test]
fn effective_overrides_layer_pass_over_environment() {
    let mut batch = Batch::new();
    let env = batch.add_environment("/show/shots/010/0010");
    let src = batch.add_source("beauty");
    let pass = batch.add_pass(env, src).unwrap();

    let e = batch.environment_mut(env).unwrap();
    e.overrides = OverrideSet {
        version: VersionOverride::Policy(VersionPolicy::NextAcrossSiblings),
        frame_range: Some("1-100".into()),
        add_rules: RuleFlags { x10: true, ..RuleFlags::default() },
        note: Some("env".into()),
        ..OverrideSet::default()
    };
    batch.pass_mut(pass).unwrap().overrides = OverrideSet {
        frame_range: Some("1-10".into()),
        add_rules: RuleFlags { fml: true, ..RuleFlags::default() },
        ..OverrideSet::default()
    };

    let eff = batch.effective_overrides(pass).unwrap();
    assert_eq!(eff.frame_range.as_deref(), Some("1-10"));
    assert!(eff.add_rules.fml && eff.add_rules.x10);
    assert_eq!(eff.note.as_deref(), Some("env"));
    assert_eq!(
        eff.version,
        VersionOverride::Policy(VersionPolicy::NextAcrossSiblings)
    );

    // Layering never mutates the environment's set.
    assert_eq!(
        batch.environment(env).unwrap().overrides.frame_range.as_deref(),
        Some("1-100")
    );
}

#[test]
fn frame_algebra_composes_with_the_model() {
    let enabled = fs("1-100").difference(&fs("40-60"));
    assert_eq!(enabled.to_string(), "1-39,61-100");
    assert!(enabled.is_subset_of(&fs("1-100")));
    assert_eq!(enabled.count(), 79);
}

#[test]
fn session_survives_an_edit_and_recapture_cycle() {
    let mut batch = Batch::new();
    let env = batch.add_environment("/show/shots/020/0040");
    let src = batch.add_source("beauty");
    let pass = batch.add_pass(env, src).unwrap();
    batch.environment_mut(env).unwrap().overrides.wait_on = vec![Uuid::new_v4()];
    batch.pass_mut(pass).unwrap().overrides.post_tasks = vec![PostTask::named("comp")];

    let doc = SessionDoc::capture(&batch);
    let mut rebuilt = Batch::new();
    doc.apply(&mut rebuilt);

    // Apply onto the already-populated batch matches by identity and is
    // idempotent for capture purposes.
    doc.apply(&mut rebuilt);
    assert_eq!(SessionDoc::capture(&rebuilt).to_value(), doc.to_value());
    assert_eq!(rebuilt.passes_of(env).len(), 1);
}

#[test]
fn resolution_config_is_a_plain_value() {
    let cfg = ResolutionConfig { ordering: OverrideOrdering::PassFirst, ..Default::default() };
    let copy = cfg.clone();
    assert_eq!(cfg, copy);
    // Serializes for config files / debugging.
    let text = serde_json::to_string(&cfg).unwrap();
    assert!(text.contains("pass-first"));
}

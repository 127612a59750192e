//! The override model: Environments, RenderPasses, shared RenderSources and
//! the layered OverrideSet, held in a uuid-keyed arena.
//!
//! There are no back-pointers between entities. A RenderPass carries `env` and
//! `source` index fields and every lookup goes through the [`Batch`] arena.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frameset::FrameSet;
use crate::ids::{EnvId, ItemId, JobId, LayerId, PassId, SourceId};
use crate::rules::RuleFlags;

/// A named output-version resolution policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionPolicy {
    /// Use the current source-of-truth project version for the area.
    MatchSource,
    /// The next free version for this pass alone.
    Next,
    /// The maximum "next" across all active sibling passes, applied uniformly.
    NextAcrossSiblings,
}

impl VersionPolicy {
    /// The canonical token, as it appears in sessions and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionPolicy::MatchSource => "match-source",
            VersionPolicy::Next => "next",
            VersionPolicy::NextAcrossSiblings => "next-across-siblings",
        }
    }

    /// Parses a canonical token.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "match-source" => Some(VersionPolicy::MatchSource),
            "next" => Some(VersionPolicy::Next),
            "next-across-siblings" => Some(VersionPolicy::NextAcrossSiblings),
            _ => None,
        }
    }
}

/// Version override ladder: absent, pinned to a number, or a named policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionOverride {
    /// No override at this level.
    #[default]
    Unset,
    /// Pinned to an explicit version number.
    Explicit(i64),
    /// Resolved through a policy.
    Policy(VersionPolicy),
}

impl VersionOverride {
    /// True when no override is present at this level.
    pub fn is_unset(&self) -> bool {
        matches!(self, VersionOverride::Unset)
    }
}

/// Which production range kind seeds resolution for an Environment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RangeSource {
    /// Editorial cut range.
    #[default]
    Cut,
    /// Delivery range.
    Delivery,
    /// Explicitly entered production range.
    Explicit,
    /// Important-frames list.
    Important,
}

impl RangeSource {
    /// Fixed fallback order when the preferred source is empty.
    pub const FALLBACK: [RangeSource; 4] = [
        RangeSource::Cut,
        RangeSource::Delivery,
        RangeSource::Explicit,
        RangeSource::Important,
    ];

    /// The canonical token.
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeSource::Cut => "cut",
            RangeSource::Delivery => "delivery",
            RangeSource::Explicit => "explicit",
            RangeSource::Important => "important",
        }
    }

    /// Parses a canonical token.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "cut" => Some(RangeSource::Cut),
            "delivery" => Some(RangeSource::Delivery),
            "explicit" => Some(RangeSource::Explicit),
            "important" => Some(RangeSource::Important),
            _ => None,
        }
    }
}

/// Per-kind production ranges fetched for an Environment's area.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductionRanges {
    /// Editorial cut range.
    pub cut: Option<FrameSet>,
    /// Delivery range.
    pub delivery: Option<FrameSet>,
    /// Explicit production range.
    pub explicit: Option<FrameSet>,
    /// Important-frames list.
    pub important: Option<FrameSet>,
}

impl ProductionRanges {
    /// The range of one kind, if fetched and non-empty.
    pub fn get(&self, kind: RangeSource) -> Option<&FrameSet> {
        let set = match kind {
            RangeSource::Cut => self.cut.as_ref(),
            RangeSource::Delivery => self.delivery.as_ref(),
            RangeSource::Explicit => self.explicit.as_ref(),
            RangeSource::Important => self.important.as_ref(),
        };
        set.filter(|s| !s.is_empty())
    }

    /// Stores the range of one kind.
    pub fn set(&mut self, kind: RangeSource, set: Option<FrameSet>) {
        match kind {
            RangeSource::Cut => self.cut = set,
            RangeSource::Delivery => self.delivery = set,
            RangeSource::Explicit => self.explicit = set,
            RangeSource::Important => self.important = set,
        }
    }

    /// Walks the preferred kind then the fixed fallback chain, returning the
    /// first non-empty range.
    pub fn pick(&self, preferred: RangeSource) -> Option<(RangeSource, &FrameSet)> {
        std::iter::once(preferred)
            .chain(RangeSource::FALLBACK)
            .find_map(|kind| self.get(kind).map(|set| (kind, set)))
    }
}

/// An explicit reference to a job (and optionally one of its layers or tasks)
/// that exists outside this batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ExternalRef {
    /// The external scheduler job.
    pub job: JobId,
    /// Optional layer-or-task id inside that job.
    pub sub: Option<String>,
}

impl TryFrom<Vec<String>> for ExternalRef {
    type Error = String;

    fn try_from(parts: Vec<String>) -> Result<Self, Self::Error> {
        match parts.as_slice() {
            [job] => Ok(ExternalRef { job: JobId::from_str(job.clone()), sub: None }),
            [job, sub] => Ok(ExternalRef {
                job: JobId::from_str(job.clone()),
                sub: Some(sub.clone()),
            }),
            _ => Err(format!("external reference needs 1 or 2 parts, got {}", parts.len())),
        }
    }
}

impl From<ExternalRef> for Vec<String> {
    fn from(r: ExternalRef) -> Self {
        match r.sub {
            Some(sub) => vec![r.job.0, sub],
            None => vec![r.job.0],
        }
    }
}

/// One post-task descriptor: a named follow-up task attached to the job (when
/// set at Environment level) or to a pass's layer (when set at pass level).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostTask {
    /// Task name as shown on the farm.
    pub name: String,
    /// Free-form key/value arguments handed to the task.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl PostTask {
    /// A post-task with no arguments.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), args: BTreeMap::new() }
    }
}

/// The layered set of user-specified deviations from default behavior,
/// embedded in both Environment and RenderPass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideSet {
    /// Output-version override.
    pub version: VersionOverride,
    /// Explicit frame-range text; parsed at resolve time.
    pub frame_range: Option<String>,
    /// Explicit NOT-frame-range text, subtracted after add-rules.
    pub not_frame_range: Option<String>,
    /// Add-rule flags; compose by union.
    pub add_rules: RuleFlags,
    /// NOT-rule flags; subtract after every add-rule.
    pub not_rules: RuleFlags,
    /// Free-text note carried onto the job.
    pub note: Option<String>,
    /// Colour tag (rgb, 0..=1).
    pub colour: Option<[f32; 3]>,
    /// Post-task descriptors. Not layered: environment post-tasks attach to
    /// the job, pass post-tasks to the layer.
    pub post_tasks: Vec<PostTask>,
    /// WAIT-on targets addressed by entity uuid.
    pub wait_on: Vec<Uuid>,
    /// WAIT-on targets outside this batch, addressed by scheduler id.
    pub wait_on_external: Vec<ExternalRef>,
}

impl OverrideSet {
    /// Layers this set over `under` without mutating either. Pass-level
    /// values win on collision, rule flags union, wait-on lists merge.
    pub fn layered_over(&self, under: &OverrideSet) -> OverrideSet {
        OverrideSet {
            version: if self.version.is_unset() { under.version } else { self.version },
            frame_range: self.frame_range.clone().or_else(|| under.frame_range.clone()),
            not_frame_range: self
                .not_frame_range
                .clone()
                .or_else(|| under.not_frame_range.clone()),
            add_rules: self.add_rules.merged_over(&under.add_rules),
            not_rules: self.not_rules.merged_over(&under.not_rules),
            note: self.note.clone().or_else(|| under.note.clone()),
            colour: self.colour.or(under.colour),
            post_tasks: self.post_tasks.clone(),
            wait_on: merge_unique(&under.wait_on, &self.wait_on),
            wait_on_external: merge_unique(&under.wait_on_external, &self.wait_on_external),
        }
    }
}

fn merge_unique<T: Clone + PartialEq>(under: &[T], over: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(under.len() + over.len());
    for item in under.iter().chain(over.iter()) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// Both cached result sets of one resolution. Recomputed whole on every
/// resolve, never incrementally patched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFrames {
    /// Frames computed regardless of queued state.
    pub enabled: FrameSet,
    /// Frames actually submitted; empty when the owner is not active.
    pub queued: FrameSet,
}

/// One shot/asset-variant output target. Owns its passes by composition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Stable identity; survives re-sync.
    pub id: EnvId,
    /// Area path, like `/show/shots/010/0010`. Not unique within a session.
    pub area: String,
    /// Optional job-identifier text, disambiguating repeated submissions.
    pub job_name: Option<String>,
    /// Nth occurrence of the same area within one session.
    pub ordinal: u32,
    /// User queued flag.
    pub queued: bool,
    /// User enabled flag.
    pub enabled: bool,
    /// Cancelled mark; set when the operator withdraws the environment or a
    /// worker discovers its job died on the scheduler.
    pub cancelled: bool,
    /// Preferred production range kind for base-range selection.
    pub range_source: RangeSource,
    /// Production ranges fetched for the area.
    pub ranges: ProductionRanges,
    /// Environment-level overrides; pass overrides layer over these.
    pub overrides: OverrideSet,
    /// Owned passes, in creation order.
    pub passes: Vec<PassId>,
    /// Cached frame resolution.
    pub resolved: Option<ResolvedFrames>,
    /// Job created for this environment at the last submission.
    pub last_job: Option<JobId>,
}

impl Environment {
    /// A fresh environment for an area, queued and enabled.
    pub fn new(area: impl Into<String>) -> Self {
        Self {
            id: EnvId::fresh(),
            area: area.into(),
            job_name: None,
            ordinal: 0,
            queued: true,
            enabled: true,
            cancelled: false,
            range_source: RangeSource::default(),
            ranges: ProductionRanges::default(),
            overrides: OverrideSet::default(),
            passes: Vec::new(),
            resolved: None,
            last_job: None,
        }
    }

    /// Queued, enabled and not cancelled.
    pub fn is_active(&self) -> bool {
        self.queued && self.enabled && !self.cancelled
    }

    /// Session label: `area` or `area@ordinal` for repeats.
    pub fn label(&self) -> String {
        if self.ordinal == 0 {
            self.area.clone()
        } else {
            format!("{}@{}", self.area, self.ordinal)
        }
    }

    /// Scheduler job name: `<area>[ <job_name>][ #ordinal]`.
    pub fn job_label(&self) -> String {
        let mut label = self.area.clone();
        if let Some(name) = &self.job_name {
            label.push(' ');
            label.push_str(name);
        }
        if self.ordinal > 0 {
            label.push_str(&format!(" #{}", self.ordinal));
        }
        label
    }
}

/// One render node evaluated for one Environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderPass {
    /// Stable identity.
    pub id: PassId,
    /// Owning environment (index field, not a back-pointer).
    pub env: EnvId,
    /// Shared render source this pass evaluates.
    pub source: SourceId,
    /// User queued flag.
    pub queued: bool,
    /// User enabled flag.
    pub enabled: bool,
    /// Pass-level overrides; layer over the environment's.
    pub overrides: OverrideSet,
    /// Cached frame resolution.
    pub resolved: Option<ResolvedFrames>,
    /// Cached version resolution.
    pub resolved_version: Option<i64>,
    /// Scheduler job this pass landed in at the last submission.
    pub last_job: Option<JobId>,
    /// Scheduler layer created for this pass at the last submission.
    pub last_layer: Option<LayerId>,
}

impl RenderPass {
    /// A fresh pass under `env` rendering `source`, queued and enabled.
    pub fn new(env: EnvId, source: SourceId) -> Self {
        Self {
            id: PassId::fresh(),
            env,
            source,
            queued: true,
            enabled: true,
            overrides: OverrideSet::default(),
            resolved: None,
            resolved_version: None,
            last_job: None,
            last_layer: None,
        }
    }

    /// Queued and enabled. The owning environment's state is judged by
    /// [`Batch::pass_is_active`].
    pub fn is_active(&self) -> bool {
        self.queued && self.enabled
    }
}

/// A render node definition, shared across environments ("column").
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderSource {
    /// Stable identity.
    pub id: SourceId,
    /// Short name, unique within a batch (`beauty`, `specular`).
    pub name: String,
    /// Host-application node path; defaults to the name until a host binds it.
    pub node_path: String,
}

impl RenderSource {
    /// A source whose node path is its name.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { id: SourceId::fresh(), node_path: name.clone(), name }
    }
}

/// The arena holding one session's entities, keyed by their ids.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Batch {
    envs: BTreeMap<EnvId, Environment>,
    passes: BTreeMap<PassId, RenderPass>,
    sources: BTreeMap<SourceId, RenderSource>,
    env_order: Vec<EnvId>,
}

impl Batch {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fresh environment for `area`, assigning the next ordinal for
    /// that area. Returns its id.
    pub fn add_environment(&mut self, area: impl Into<String>) -> EnvId {
        let mut env = Environment::new(area);
        env.ordinal = self
            .envs
            .values()
            .filter(|e| e.area == env.area)
            .count() as u32;
        let id = env.id;
        self.env_order.push(id);
        self.envs.insert(id, env);
        id
    }

    /// Inserts a pre-built environment (session load path). Keeps its id and
    /// ordinal as given.
    pub fn insert_environment(&mut self, env: Environment) {
        if !self.envs.contains_key(&env.id) {
            self.env_order.push(env.id);
        }
        self.envs.insert(env.id, env);
    }

    /// Environment by id.
    pub fn environment(&self, id: EnvId) -> Option<&Environment> {
        self.envs.get(&id)
    }

    /// Mutable environment by id.
    pub fn environment_mut(&mut self, id: EnvId) -> Option<&mut Environment> {
        self.envs.get_mut(&id)
    }

    /// Environment ids in creation order.
    pub fn env_ids(&self) -> Vec<EnvId> {
        self.env_order.clone()
    }

    /// Finds an environment by area and ordinal.
    pub fn find_environment(&self, area: &str, ordinal: u32) -> Option<EnvId> {
        self.envs
            .values()
            .find(|e| e.area == area && e.ordinal == ordinal)
            .map(|e| e.id)
    }

    /// Registers (or reuses) a render source by name.
    pub fn add_source(&mut self, name: &str) -> SourceId {
        if let Some(id) = self.source_named(name) {
            return id;
        }
        let source = RenderSource::named(name);
        let id = source.id;
        self.sources.insert(id, source);
        id
    }

    /// Source by id.
    pub fn source(&self, id: SourceId) -> Option<&RenderSource> {
        self.sources.get(&id)
    }

    /// Source id by name.
    pub fn source_named(&self, name: &str) -> Option<SourceId> {
        self.sources
            .values()
            .find(|s| s.name == name)
            .map(|s| s.id)
    }

    /// Adds a fresh pass under `env` rendering `source`. Returns `None` when
    /// the environment is unknown.
    pub fn add_pass(&mut self, env: EnvId, source: SourceId) -> Option<PassId> {
        let pass = RenderPass::new(env, source);
        let id = pass.id;
        self.envs.get_mut(&env)?.passes.push(id);
        self.passes.insert(id, pass);
        Some(id)
    }

    /// Inserts a pre-built pass (session load path), wiring it into its
    /// environment's pass list.
    pub fn insert_pass(&mut self, pass: RenderPass) {
        if let Some(env) = self.envs.get_mut(&pass.env) {
            if !env.passes.contains(&pass.id) {
                env.passes.push(pass.id);
            }
        }
        self.passes.insert(pass.id, pass);
    }

    /// Pass by id.
    pub fn pass(&self, id: PassId) -> Option<&RenderPass> {
        self.passes.get(&id)
    }

    /// Mutable pass by id.
    pub fn pass_mut(&mut self, id: PassId) -> Option<&mut RenderPass> {
        self.passes.get_mut(&id)
    }

    /// Pass ids of one environment, in creation order.
    pub fn passes_of(&self, env: EnvId) -> Vec<PassId> {
        self.envs
            .get(&env)
            .map(|e| e.passes.clone())
            .unwrap_or_default()
    }

    /// Active pass ids of one environment (pass and environment both active).
    pub fn active_passes_of(&self, env: EnvId) -> Vec<PassId> {
        self.passes_of(env)
            .into_iter()
            .filter(|p| self.pass_is_active(*p))
            .collect()
    }

    /// True when the pass and its owning environment are both active.
    pub fn pass_is_active(&self, id: PassId) -> bool {
        let Some(pass) = self.passes.get(&id) else {
            return false;
        };
        let Some(env) = self.envs.get(&pass.env) else {
            return false;
        };
        pass.is_active() && env.is_active()
    }

    /// Looks an arbitrary uuid up as either an environment or a pass.
    pub fn item(&self, uuid: Uuid) -> Option<ItemId> {
        if self.envs.contains_key(&EnvId(uuid)) {
            return Some(ItemId::Environment(EnvId(uuid)));
        }
        if self.passes.contains_key(&PassId(uuid)) {
            return Some(ItemId::Pass(PassId(uuid)));
        }
        None
    }

    /// Human label for an item: the environment label, or `label:source`.
    pub fn label_of(&self, item: ItemId) -> String {
        match item {
            ItemId::Environment(id) => self
                .environment(id)
                .map(|e| e.label())
                .unwrap_or_else(|| id.to_string()),
            ItemId::Pass(id) => {
                let Some(pass) = self.pass(id) else {
                    return id.to_string();
                };
                let env = self
                    .environment(pass.env)
                    .map(|e| e.label())
                    .unwrap_or_else(|| pass.env.to_string());
                let source = self
                    .source(pass.source)
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| pass.source.to_string());
                format!("{env}:{source}")
            }
        }
    }

    /// The pass's overrides layered over its environment's.
    pub fn effective_overrides(&self, pass: PassId) -> Option<OverrideSet> {
        let pass = self.passes.get(&pass)?;
        let env = self.envs.get(&pass.env)?;
        Some(pass.overrides.layered_over(&env.overrides))
    }

    /// Effective WAIT-on targets of a pass: environment-level targets are
    /// broadcast in, the pass's own and its environment's uuids are stripped.
    pub fn effective_wait_on(&self, pass: PassId) -> Vec<Uuid> {
        let Some(p) = self.passes.get(&pass) else {
            return Vec::new();
        };
        let Some(env) = self.envs.get(&p.env) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for target in env.overrides.wait_on.iter().chain(p.overrides.wait_on.iter()) {
            if *target == p.id.0 || *target == env.id.0 {
                continue;
            }
            if !out.contains(target) {
                out.push(*target);
            }
        }
        out
    }

    /// Effective external WAIT-on references of a pass (environment-level
    /// references broadcast in, deduplicated).
    pub fn effective_external_waits(&self, pass: PassId) -> Vec<ExternalRef> {
        let Some(p) = self.passes.get(&pass) else {
            return Vec::new();
        };
        let Some(env) = self.envs.get(&p.env) else {
            return Vec::new();
        };
        merge_unique(&env.overrides.wait_on_external, &p.overrides.wait_on_external)
    }

    /// Distinct WAIT-on targets across every active pass of an environment.
    pub fn wait_targets_of_env(&self, env: EnvId) -> Vec<Uuid> {
        let mut out = Vec::new();
        for pass in self.active_passes_of(env) {
            for target in self.effective_wait_on(pass) {
                if !out.contains(&target) {
                    out.push(target);
                }
            }
        }
        out
    }

    /// Clears the resolved caches of one environment and all of its passes.
    pub fn invalidate_environment(&mut self, env: EnvId) {
        let pass_ids = self.passes_of(env);
        if let Some(e) = self.envs.get_mut(&env) {
            e.resolved = None;
        }
        for id in pass_ids {
            if let Some(p) = self.passes.get_mut(&id) {
                p.resolved = None;
                p.resolved_version = None;
            }
        }
    }

    /// Clears every resolved cache in the batch.
    pub fn invalidate_all(&mut self) {
        for id in self.env_ids() {
            self.invalidate_environment(id);
        }
    }
}

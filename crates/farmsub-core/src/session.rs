//! The persisted session document.
//!
//! A nested JSON map with fixed legacy key names (the `plow_*` keys name the
//! farm these sessions were historically exchanged with). The reader is
//! tolerant: unknown keys and junk values inside an entry warn and are
//! skipped, they never abort a load. Outer keys are `area` or
//! `area@<ordinal>` for repeated submissions of the same area.

use std::fs;
use std::path::Path;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::ids::{EnvId, JobId, LayerId, PassId};
use crate::model::{
    Batch, Environment, ExternalRef, OverrideSet, PostTask, RangeSource, RenderPass,
    VersionOverride, VersionPolicy,
};

/// A session document, ready to be saved or applied onto a [`Batch`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionDoc {
    root: Map<String, Value>,
}

/// Why a session file could not be read or written.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Filesystem trouble.
    #[error("session io: {0}")]
    Io(#[from] std::io::Error),
    /// The file was not valid JSON.
    #[error("session is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    /// The JSON root was not an object.
    #[error("session root must be a json object")]
    NotAnObject,
}

impl SessionDoc {
    /// An empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a parsed JSON value; the root must be an object.
    pub fn from_value(value: Value) -> Result<Self, SessionError> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            _ => Err(SessionError::NotAnObject),
        }
    }

    /// The document as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    /// Reads a session file.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let text = fs::read_to_string(path)?;
        Self::from_value(serde_json::from_str(&text)?)
    }

    /// Writes the session file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut text = serde_json::to_string_pretty(&self.to_value())?;
        text.push('\n');
        fs::write(path, text)?;
        Ok(())
    }

    /// Number of environment entries.
    pub fn len(&self) -> usize {
        self.root.len()
    }

    /// True when the document holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// The raw entry map (outer key to environment entry).
    pub fn entries(&self) -> &Map<String, Value> {
        &self.root
    }

    /// Captures the whole batch into a fresh document.
    pub fn capture(batch: &Batch) -> Self {
        let mut root = Map::new();
        for env_id in batch.env_ids() {
            let Some(env) = batch.environment(env_id) else {
                continue;
            };
            let mut entry = overrides_to_map(&env.overrides);
            entry.insert("identity_id".into(), json!(env.id.to_string()));
            entry.insert("queued".into(), json!(env.queued));
            entry.insert("enabled".into(), json!(env.enabled));
            entry.insert("cancelled".into(), json!(env.cancelled));
            entry.insert("job_name".into(), opt_string(&env.job_name));
            entry.insert("range_source".into(), json!(env.range_source.as_str()));

            let mut passes = Map::new();
            for pass_id in batch.passes_of(env_id) {
                let Some(pass) = batch.pass(pass_id) else {
                    continue;
                };
                let name = batch
                    .source(pass.source)
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| pass.source.to_string());
                let mut p = overrides_to_map(&pass.overrides);
                p.insert("identity_id".into(), json!(pass.id.to_string()));
                p.insert("queued".into(), json!(pass.queued));
                p.insert("enabled".into(), json!(pass.enabled));
                p.insert("pass_name".into(), json!(name));
                p.insert(
                    "plow_job_id_last".into(),
                    opt_string(&pass.last_job.as_ref().map(|j| j.0.clone())),
                );
                p.insert(
                    "plow_layer_id_last".into(),
                    opt_string(&pass.last_layer.as_ref().map(|l| l.0.clone())),
                );
                passes.insert(name, Value::Object(p));
            }
            entry.insert("passes".into(), Value::Object(passes));
            root.insert(env.label(), Value::Object(entry));
        }
        Self { root }
    }

    /// Overlays every entry onto the batch, creating environments and passes
    /// for unknown identities. Returns the number of entries applied.
    pub fn apply(&self, batch: &mut Batch) -> usize {
        let mut applied = 0;
        for (outer, value) in &self.root {
            let Some(entry) = value.as_object() else {
                warn!(entry = %outer, "session entry is not a map, skipped");
                continue;
            };
            self.apply_entry(batch, outer, entry);
            applied += 1;
        }
        applied
    }

    fn apply_entry(&self, batch: &mut Batch, outer: &str, entry: &Map<String, Value>) {
        let (area, ordinal) = split_outer_key(outer);
        let identity = field_uuid(entry, "identity_id", outer);

        let env_id = match identity.map(EnvId) {
            Some(id) if batch.environment(id).is_some() => id,
            _ => match batch.find_environment(area, ordinal) {
                Some(id) => id,
                None => {
                    let mut env = Environment::new(area);
                    if let Some(id) = identity {
                        env.id = EnvId(id);
                    }
                    env.ordinal = ordinal;
                    let id = env.id;
                    batch.insert_environment(env);
                    id
                }
            },
        };

        if let Some(env) = batch.environment_mut(env_id) {
            if let Some(q) = field_bool(entry, "queued", outer) {
                env.queued = q;
            }
            if let Some(e) = field_bool(entry, "enabled", outer) {
                env.enabled = e;
            }
            if let Some(c) = field_bool(entry, "cancelled", outer) {
                env.cancelled = c;
            }
            if let Some(name) = field_opt_string(entry, "job_name", outer) {
                env.job_name = name;
            }
        }
        if let Some(Some(token)) = field_opt_string(entry, "range_source", outer) {
            match RangeSource::parse(&token) {
                Some(kind) => {
                    if let Some(env) = batch.environment_mut(env_id) {
                        env.range_source = kind;
                    }
                }
                None => warn!(entry = %outer, token = %token, "unknown range source, kept current"),
            }
        }
        if let Some(env) = batch.environment(env_id) {
            let mut over = env.overrides.clone();
            apply_overrides(entry, &mut over, outer);
            if let Some(env) = batch.environment_mut(env_id) {
                env.overrides = over;
            }
        }

        match entry.get("passes") {
            None => {}
            Some(Value::Object(passes)) => {
                for (source_name, pass_value) in passes {
                    let ctx = format!("{outer}:{source_name}");
                    let Some(pass_entry) = pass_value.as_object() else {
                        warn!(entry = %ctx, "pass entry is not a map, skipped");
                        continue;
                    };
                    self.apply_pass_entry(batch, env_id, source_name, &ctx, pass_entry);
                }
            }
            Some(_) => warn!(entry = %outer, "passes entry is not a map, skipped"),
        }
    }

    fn apply_pass_entry(
        &self,
        batch: &mut Batch,
        env_id: EnvId,
        source_name: &str,
        ctx: &str,
        entry: &Map<String, Value>,
    ) {
        let source = batch.add_source(source_name);
        let identity = field_uuid(entry, "identity_id", ctx);

        let pass_id = match identity.map(PassId) {
            Some(id) if batch.pass(id).is_some() => id,
            _ => {
                let existing = batch
                    .passes_of(env_id)
                    .into_iter()
                    .find(|p| batch.pass(*p).is_some_and(|pp| pp.source == source));
                match existing {
                    Some(id) => id,
                    None => {
                        let mut pass = RenderPass::new(env_id, source);
                        if let Some(id) = identity {
                            pass.id = PassId(id);
                        }
                        let id = pass.id;
                        batch.insert_pass(pass);
                        id
                    }
                }
            }
        };

        if let Some(pass) = batch.pass_mut(pass_id) {
            if let Some(q) = field_bool(entry, "queued", ctx) {
                pass.queued = q;
            }
            if let Some(e) = field_bool(entry, "enabled", ctx) {
                pass.enabled = e;
            }
        }
        if let Some(pass) = batch.pass(pass_id) {
            let mut over = pass.overrides.clone();
            apply_overrides(entry, &mut over, ctx);
            if let Some(pass) = batch.pass_mut(pass_id) {
                pass.overrides = over;
            }
        }
        if let Some(job) = field_opt_string(entry, "plow_job_id_last", ctx) {
            if let Some(pass) = batch.pass_mut(pass_id) {
                pass.last_job = job.map(JobId::from_str);
            }
        }
        if let Some(layer) = field_opt_string(entry, "plow_layer_id_last", ctx) {
            if let Some(pass) = batch.pass_mut(pass_id) {
                pass.last_layer = layer.map(LayerId::from_str);
            }
        }
    }
}

fn split_outer_key(key: &str) -> (&str, u32) {
    if let Some((area, ord)) = key.rsplit_once('@') {
        if let Ok(n) = ord.parse::<u32>() {
            return (area, n);
        }
    }
    (key, 0)
}

fn opt_string(value: &Option<String>) -> Value {
    match value {
        Some(s) => json!(s),
        None => Value::Null,
    }
}

fn overrides_to_map(over: &OverrideSet) -> Map<String, Value> {
    let mut map = Map::new();
    let version = match over.version {
        VersionOverride::Unset => Value::Null,
        VersionOverride::Explicit(n) => json!(n),
        VersionOverride::Policy(p) => json!(p.as_str()),
    };
    map.insert("version_override".into(), version);
    map.insert("frame_range_override".into(), opt_string(&over.frame_range));
    map.insert("not_frame_range_override".into(), opt_string(&over.not_frame_range));
    map.insert("frames_rule_important".into(), json!(over.add_rules.important));
    map.insert("frames_rule_fml".into(), json!(over.add_rules.fml));
    map.insert("frames_rule_x1".into(), json!(over.add_rules.x1));
    map.insert("frames_rule_x10".into(), json!(over.add_rules.x10));
    map.insert("frames_rule_xn".into(), json!(over.add_rules.xn.unwrap_or(0)));
    map.insert("not_frames_rule_important".into(), json!(over.not_rules.important));
    map.insert("not_frames_rule_fml".into(), json!(over.not_rules.fml));
    map.insert("not_frames_rule_x1".into(), json!(over.not_rules.x1));
    map.insert("not_frames_rule_x10".into(), json!(over.not_rules.x10));
    map.insert("not_frames_rule_xn".into(), json!(over.not_rules.xn.unwrap_or(0)));
    map.insert("note_override".into(), opt_string(&over.note));
    map.insert(
        "wait_on".into(),
        Value::Array(over.wait_on.iter().map(|u| json!(u.to_string())).collect()),
    );
    map.insert(
        "wait_on_plow_ids".into(),
        Value::Array(
            over.wait_on_external
                .iter()
                .map(|r| json!(Vec::<String>::from(r.clone())))
                .collect(),
        ),
    );
    map.insert(
        "colour".into(),
        match over.colour {
            Some([r, g, b]) => json!([r, g, b]),
            None => Value::Null,
        },
    );
    map.insert(
        "post_tasks".into(),
        Value::Array(
            over.post_tasks
                .iter()
                .map(|t| json!({ "name": t.name, "args": t.args }))
                .collect(),
        ),
    );
    map
}

fn apply_overrides(entry: &Map<String, Value>, over: &mut OverrideSet, ctx: &str) {
    match entry.get("version_override") {
        None => {}
        Some(Value::Null) => over.version = VersionOverride::Unset,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) => over.version = VersionOverride::Explicit(v),
            None => warn!(entry = %ctx, "version_override is not an integer, skipped"),
        },
        Some(Value::String(s)) => match VersionPolicy::parse(s) {
            Some(policy) => over.version = VersionOverride::Policy(policy),
            None => warn!(entry = %ctx, token = %s, "unknown version policy, skipped"),
        },
        Some(_) => warn!(entry = %ctx, "version_override has an unusable shape, skipped"),
    }

    if let Some(text) = field_opt_string(entry, "frame_range_override", ctx) {
        over.frame_range = text.filter(|t| !t.trim().is_empty());
    }
    if let Some(text) = field_opt_string(entry, "not_frame_range_override", ctx) {
        over.not_frame_range = text.filter(|t| !t.trim().is_empty());
    }

    for (key, slot) in [
        ("frames_rule_important", &mut over.add_rules.important),
        ("frames_rule_fml", &mut over.add_rules.fml),
        ("frames_rule_x1", &mut over.add_rules.x1),
        ("frames_rule_x10", &mut over.add_rules.x10),
    ] {
        if let Some(flag) = field_bool(entry, key, ctx) {
            *slot = flag;
        }
    }
    for (key, slot) in [
        ("not_frames_rule_important", &mut over.not_rules.important),
        ("not_frames_rule_fml", &mut over.not_rules.fml),
        ("not_frames_rule_x1", &mut over.not_rules.x1),
        ("not_frames_rule_x10", &mut over.not_rules.x10),
    ] {
        if let Some(flag) = field_bool(entry, key, ctx) {
            *slot = flag;
        }
    }
    if let Some(n) = field_i64(entry, "frames_rule_xn", ctx) {
        over.add_rules.xn = (n >= 1).then_some(n);
    }
    if let Some(n) = field_i64(entry, "not_frames_rule_xn", ctx) {
        over.not_rules.xn = (n >= 1).then_some(n);
    }

    if let Some(note) = field_opt_string(entry, "note_override", ctx) {
        over.note = note.filter(|t| !t.is_empty());
    }

    match entry.get("wait_on") {
        None => {}
        Some(Value::Array(items)) => {
            let mut targets = Vec::new();
            for item in items {
                match item.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                    Some(uuid) => targets.push(uuid),
                    None => warn!(entry = %ctx, value = %item, "wait_on entry is not a uuid, skipped"),
                }
            }
            over.wait_on = targets;
        }
        Some(_) => warn!(entry = %ctx, "wait_on is not a list, skipped"),
    }

    match entry.get("wait_on_plow_ids") {
        None => {}
        Some(Value::Array(items)) => {
            let mut refs = Vec::new();
            for item in items {
                let parts: Option<Vec<String>> = item.as_array().map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                });
                match parts.and_then(|p| ExternalRef::try_from(p).ok()) {
                    Some(r) => refs.push(r),
                    None => {
                        warn!(entry = %ctx, value = %item, "wait_on_plow_ids entry is unusable, skipped")
                    }
                }
            }
            over.wait_on_external = refs;
        }
        Some(_) => warn!(entry = %ctx, "wait_on_plow_ids is not a list, skipped"),
    }

    match entry.get("colour") {
        None => {}
        Some(Value::Null) => over.colour = None,
        Some(Value::Array(parts)) if parts.len() == 3 => {
            let rgb: Vec<f32> = parts.iter().filter_map(|v| v.as_f64()).map(|f| f as f32).collect();
            match rgb.as_slice() {
                [r, g, b] => over.colour = Some([*r, *g, *b]),
                _ => warn!(entry = %ctx, "colour components are not numbers, skipped"),
            }
        }
        Some(_) => warn!(entry = %ctx, "colour is not an rgb triple, skipped"),
    }

    match entry.get("post_tasks") {
        None => {}
        Some(Value::Array(items)) => {
            let mut tasks = Vec::new();
            for item in items {
                match item {
                    Value::String(name) => tasks.push(PostTask::named(name.clone())),
                    Value::Object(_) => match serde_json::from_value::<PostTask>(item.clone()) {
                        Ok(task) if !task.name.is_empty() => tasks.push(task),
                        _ => warn!(entry = %ctx, "post_tasks entry is unusable, skipped"),
                    },
                    _ => warn!(entry = %ctx, "post_tasks entry is unusable, skipped"),
                }
            }
            over.post_tasks = tasks;
        }
        Some(_) => warn!(entry = %ctx, "post_tasks is not a list, skipped"),
    }
}

fn field_bool(entry: &Map<String, Value>, key: &str, ctx: &str) -> Option<bool> {
    match entry.get(key) {
        None => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            warn!(entry = %ctx, key, "expected a bool, skipped");
            None
        }
    }
}

fn field_i64(entry: &Map<String, Value>, key: &str, ctx: &str) -> Option<i64> {
    match entry.get(key) {
        None => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) => Some(v),
            None => {
                warn!(entry = %ctx, key, "expected an integer, skipped");
                None
            }
        },
        Some(_) => {
            warn!(entry = %ctx, key, "expected an integer, skipped");
            None
        }
    }
}

/// Outer `None` means absent or unusable; `Some(None)` is an explicit null.
fn field_opt_string(entry: &Map<String, Value>, key: &str, ctx: &str) -> Option<Option<String>> {
    match entry.get(key) {
        None => None,
        Some(Value::Null) => Some(None),
        Some(Value::String(s)) => Some(Some(s.clone())),
        Some(_) => {
            warn!(entry = %ctx, key, "expected a string, skipped");
            None
        }
    }
}

fn field_uuid(entry: &Map<String, Value>, key: &str, ctx: &str) -> Option<Uuid> {
    match entry.get(key) {
        None => None,
        Some(Value::String(s)) => match Uuid::parse_str(s) {
            Ok(uuid) => Some(uuid),
            Err(_) => {
                warn!(entry = %ctx, key, "expected a uuid, skipped");
                None
            }
        },
        Some(_) => {
            warn!(entry = %ctx, key, "expected a uuid, skipped");
            None
        }
    }
}

//! Maps declared WAIT-on relations onto concrete scheduler dependency-edge
//! requests, against whatever scheduler ids are known so far.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;
use uuid::Uuid;

use farmsub_core::{Batch, EnvId, ExternalRef, ItemId, LayerId};
use farmsub_services::{Blob, DepEdge, DepEnd, DepGranularity};

/// Scheduler ids known for batch items, keyed by entity uuid. Built from the
/// shared-store registry (workers) or from the ids recorded during this
/// submission (local path).
pub type ScheduledIds = BTreeMap<Uuid, DepEnd>;

/// The `(source uuid, target token)` pairs whose edges were already created,
/// as merged across workers in the shared store. Membership makes edge
/// building idempotent.
#[derive(Clone, Debug, Default)]
pub struct AppliedEdges {
    pairs: BTreeSet<(Uuid, String)>,
}

impl AppliedEdges {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the shared-store blob (`"src>tgt": true` per pair). Junk keys
    /// from foreign writers are skipped.
    pub fn from_blob(blob: &Blob) -> Self {
        let mut pairs = BTreeSet::new();
        for key in blob.keys() {
            let Some((source, target)) = key.split_once('>') else {
                warn!(key = %key, "skipping junk applied-edge key");
                continue;
            };
            let Ok(source) = Uuid::parse_str(source) else {
                warn!(key = %key, "skipping junk applied-edge key");
                continue;
            };
            pairs.insert((source, target.to_string()));
        }
        Self { pairs }
    }

    /// Encodes for a merge into the shared store.
    pub fn to_blob(&self) -> Blob {
        let mut blob = Blob::new();
        for (source, target) in &self.pairs {
            blob.insert(Self::key(*source, target), serde_json::Value::Bool(true));
        }
        blob
    }

    /// The store key of one pair.
    pub fn key(source: Uuid, target: &str) -> String {
        format!("{source}>{target}")
    }

    pub fn insert(&mut self, source: Uuid, target: String) {
        self.pairs.insert((source, target));
    }

    pub fn contains(&self, source: Uuid, target: &str) -> bool {
        self.pairs.contains(&(source, target.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Uuid, String)> {
        self.pairs.iter()
    }
}

/// The applied-set token of an in-batch target.
pub fn batch_target(uuid: Uuid) -> String {
    uuid.to_string()
}

/// The applied-set token of an external job reference.
pub fn external_target(ext: &ExternalRef) -> String {
    match &ext.sub {
        Some(sub) => format!("ext:{}/{}", ext.job.as_str(), sub),
        None => format!("ext:{}", ext.job.as_str()),
    }
}

/// One edge the scheduler should be asked for, with the pair that records it
/// as applied.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedEdge {
    /// The pass whose WAIT-on produced this edge.
    pub source_item: ItemId,
    /// Applied-set pair: source uuid and target token.
    pub pair: (Uuid, String),
    /// The concrete request.
    pub edge: DepEdge,
}

/// Everything one graph build decided.
#[derive(Clone, Debug, Default)]
pub struct GraphPlan {
    /// Edges to create, already-applied pairs filtered out.
    pub edges: Vec<PlannedEdge>,
    /// `(source item, target uuid)` pairs deferred because the target has no
    /// registered scheduler id yet.
    pub missing: Vec<(ItemId, Uuid)>,
}

/// Builds the dependency plan for one environment's active passes.
///
/// Layer-on-layer is preferred when both ends expose a layer id, else the
/// edge falls back to job-on-job. Targets in `excluded` (cancelled or
/// inactive) produce neither edges nor deferrals. Self-dependencies never
/// reach this point; `Batch::effective_wait_on` strips them.
pub fn build_graph(
    batch: &Batch,
    env_id: EnvId,
    ids: &ScheduledIds,
    applied: &AppliedEdges,
    excluded: &BTreeSet<Uuid>,
) -> GraphPlan {
    let mut plan = GraphPlan::default();
    for pass_id in batch.active_passes_of(env_id) {
        let source_item = ItemId::Pass(pass_id);
        let source = ids.get(&pass_id.0);

        for target_uuid in batch.effective_wait_on(pass_id) {
            if excluded.contains(&target_uuid) {
                continue;
            }
            let Some(source) = source else {
                plan.missing.push((source_item, target_uuid));
                continue;
            };
            let Some(target) = ids.get(&target_uuid) else {
                plan.missing.push((source_item, target_uuid));
                continue;
            };
            let token = batch_target(target_uuid);
            if applied.contains(pass_id.0, &token) {
                continue;
            }
            plan.edges.push(PlannedEdge {
                source_item,
                pair: (pass_id.0, token),
                edge: edge_between(source, target),
            });
        }

        for ext in batch.effective_external_waits(pass_id) {
            let Some(source) = source else {
                warn!(pass = %pass_id, target = %ext.job, "source not registered; skipping external edge");
                continue;
            };
            let token = external_target(&ext);
            if applied.contains(pass_id.0, &token) {
                continue;
            }
            let target = DepEnd {
                job: ext.job.clone(),
                sub: ext.sub.clone().map(LayerId::from_str),
            };
            plan.edges.push(PlannedEdge {
                source_item,
                pair: (pass_id.0, token),
                edge: edge_between(source, &target),
            });
        }
    }
    plan
}

fn edge_between(source: &DepEnd, target: &DepEnd) -> DepEdge {
    if source.sub.is_some() && target.sub.is_some() {
        DepEdge {
            source: source.clone(),
            target: target.clone(),
            granularity: DepGranularity::LayerOnLayer,
        }
    } else {
        DepEdge {
            source: DepEnd::job(source.job.clone()),
            target: DepEnd::job(target.job.clone()),
            granularity: DepGranularity::JobOnJob,
        }
    }
}

/// Every `(source uuid, target token)` pair that must be recorded as applied
/// before the environment's job may be released: the effective WAIT-on of
/// every active pass, minus excluded targets, plus external references.
pub fn required_pairs(
    batch: &Batch,
    env_id: EnvId,
    excluded: &BTreeSet<Uuid>,
) -> Vec<(Uuid, String)> {
    let mut out = Vec::new();
    for pass_id in batch.active_passes_of(env_id) {
        for target in batch.effective_wait_on(pass_id) {
            if excluded.contains(&target) {
                continue;
            }
            out.push((pass_id.0, batch_target(target)));
        }
        for ext in batch.effective_external_waits(pass_id) {
            out.push((pass_id.0, external_target(&ext)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsub_core::{JobId, PassId};

    fn rig() -> (Batch, EnvId, PassId, EnvId, PassId) {
        let mut batch = Batch::new();
        let e1 = batch.add_environment("/show/a");
        let e2 = batch.add_environment("/show/b");
        let src = batch.add_source("beauty");
        let p1 = batch.add_pass(e1, src).unwrap();
        let p2 = batch.add_pass(e2, src).unwrap();
        (batch, e1, p1, e2, p2)
    }

    fn layer_end(job: &str, layer: &str) -> DepEnd {
        DepEnd::layer(JobId::from_str(job), LayerId::from_str(layer))
    }

    #[test]
    fn prefers_layer_on_layer_and_falls_back_to_job_on_job() {
        let (mut batch, _e1, p1, e2, p2) = rig();
        batch.pass_mut(p1).unwrap().overrides.wait_on = vec![p2.0, e2.0];

        let mut ids = ScheduledIds::new();
        ids.insert(p1.0, layer_end("job-1", "layer-1"));
        ids.insert(p2.0, layer_end("job-2", "layer-2"));
        ids.insert(e2.0, DepEnd::job(JobId::from_str("job-2")));

        let plan = build_graph(&batch, batch.pass(p1).unwrap().env, &ids, &AppliedEdges::new(), &BTreeSet::new());
        assert!(plan.missing.is_empty());
        assert_eq!(plan.edges.len(), 2);
        assert_eq!(plan.edges[0].edge.granularity, DepGranularity::LayerOnLayer);
        assert_eq!(plan.edges[0].edge.target, layer_end("job-2", "layer-2"));
        // The env-level target exposes no layer, so that edge degrades.
        assert_eq!(plan.edges[1].edge.granularity, DepGranularity::JobOnJob);
        assert_eq!(plan.edges[1].edge.source, DepEnd::job(JobId::from_str("job-1")));
    }

    #[test]
    fn environment_wait_on_broadcasts_to_every_active_pass() {
        let (mut batch, e1, p1, e2, _p2) = rig();
        let src = batch.add_source("specular");
        let sibling = batch.add_pass(e1, src).unwrap();
        batch.environment_mut(e1).unwrap().overrides.wait_on = vec![e2.0];

        let mut ids = ScheduledIds::new();
        ids.insert(p1.0, layer_end("job-1", "layer-1"));
        ids.insert(sibling.0, layer_end("job-1", "layer-2"));
        ids.insert(e2.0, DepEnd::job(JobId::from_str("job-2")));

        let plan = build_graph(&batch, e1, &ids, &AppliedEdges::new(), &BTreeSet::new());
        let sources: Vec<Uuid> = plan.edges.iter().map(|e| e.pair.0).collect();
        assert_eq!(sources, vec![p1.0, sibling.0]);
    }

    #[test]
    fn unregistered_targets_defer() {
        let (mut batch, e1, p1, _e2, p2) = rig();
        batch.pass_mut(p1).unwrap().overrides.wait_on = vec![p2.0];
        let mut ids = ScheduledIds::new();
        ids.insert(p1.0, layer_end("job-1", "layer-1"));

        let plan = build_graph(&batch, e1, &ids, &AppliedEdges::new(), &BTreeSet::new());
        assert!(plan.edges.is_empty());
        assert_eq!(plan.missing, vec![(ItemId::Pass(p1), p2.0)]);
    }

    #[test]
    fn applied_pairs_never_rebuild() {
        let (mut batch, e1, p1, _e2, p2) = rig();
        batch.pass_mut(p1).unwrap().overrides.wait_on = vec![p2.0];
        let mut ids = ScheduledIds::new();
        ids.insert(p1.0, layer_end("job-1", "layer-1"));
        ids.insert(p2.0, layer_end("job-2", "layer-2"));

        let first = build_graph(&batch, e1, &ids, &AppliedEdges::new(), &BTreeSet::new());
        assert_eq!(first.edges.len(), 1);
        let mut applied = AppliedEdges::new();
        for planned in &first.edges {
            applied.insert(planned.pair.0, planned.pair.1.clone());
        }
        let second = build_graph(&batch, e1, &ids, &applied, &BTreeSet::new());
        assert!(second.edges.is_empty());
        assert!(second.missing.is_empty());
    }

    #[test]
    fn excluded_targets_produce_nothing() {
        let (mut batch, e1, p1, _e2, p2) = rig();
        batch.pass_mut(p1).unwrap().overrides.wait_on = vec![p2.0];
        let mut ids = ScheduledIds::new();
        ids.insert(p1.0, layer_end("job-1", "layer-1"));

        let excluded: BTreeSet<Uuid> = [p2.0].into_iter().collect();
        let plan = build_graph(&batch, e1, &ids, &AppliedEdges::new(), &excluded);
        assert!(plan.edges.is_empty());
        assert!(plan.missing.is_empty());
    }

    #[test]
    fn external_references_resolve_directly() {
        let (mut batch, e1, p1, _e2, _p2) = rig();
        batch.pass_mut(p1).unwrap().overrides.wait_on_external = vec![
            ExternalRef { job: JobId::from_str("plow-77"), sub: Some("render".into()) },
            ExternalRef { job: JobId::from_str("plow-78"), sub: None },
        ];
        let mut ids = ScheduledIds::new();
        ids.insert(p1.0, layer_end("job-1", "layer-1"));

        let plan = build_graph(&batch, e1, &ids, &AppliedEdges::new(), &BTreeSet::new());
        assert_eq!(plan.edges.len(), 2);
        assert_eq!(plan.edges[0].pair.1, "ext:plow-77/render");
        assert_eq!(plan.edges[0].edge.granularity, DepGranularity::LayerOnLayer);
        assert_eq!(plan.edges[1].pair.1, "ext:plow-78");
        assert_eq!(plan.edges[1].edge.granularity, DepGranularity::JobOnJob);
    }

    #[test]
    fn applied_set_round_trips_through_blobs() {
        let mut applied = AppliedEdges::new();
        let source = Uuid::new_v4();
        applied.insert(source, "ext:plow-1".into());
        applied.insert(source, Uuid::new_v4().to_string());

        let mut blob = applied.to_blob();
        blob.insert("not-a-pair".into(), serde_json::Value::Bool(true));
        let decoded = AppliedEdges::from_blob(&blob);
        assert!(decoded.contains(source, "ext:plow-1"));
        assert_eq!(decoded.iter().count(), 2);
    }

    #[test]
    fn required_pairs_cover_broadcast_and_external_waits() {
        let (mut batch, e1, p1, e2, _p2) = rig();
        batch.environment_mut(e1).unwrap().overrides.wait_on = vec![e2.0];
        batch.pass_mut(p1).unwrap().overrides.wait_on_external =
            vec![ExternalRef { job: JobId::from_str("plow-9"), sub: None }];

        let pairs = required_pairs(&batch, e1, &BTreeSet::new());
        assert_eq!(
            pairs,
            vec![(p1.0, e2.0.to_string()), (p1.0, "ext:plow-9".to_string())]
        );
        let excluded: BTreeSet<Uuid> = [e2.0].into_iter().collect();
        let pairs = required_pairs(&batch, e1, &excluded);
        assert_eq!(pairs, vec![(p1.0, "ext:plow-9".to_string())]);
    }
}

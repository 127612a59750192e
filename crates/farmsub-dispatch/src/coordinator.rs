//! The cross-worker dispatch handshake over the shared store.
//!
//! Two keys per submission bucket: `registry` maps entity uuids to the
//! scheduler ids a worker produced for them, and `applied` records the edge
//! pairs whose scheduler dependencies exist. Both are merge-only (first
//! writer wins per key, union across keys), so duplicate and late writers
//! are harmless, and every writer re-merges its own entries on each poll to
//! survive a concurrent read-merge-write losing them.

use std::collections::BTreeSet;
use std::thread;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use farmsub_core::{
    now_ms, Batch, BucketId, EnvId, ItemId, JobId, LayerId, Outcome, ResolutionConfig,
};
use farmsub_services::{
    merge_blobs, Blob, DepEnd, JobState, Scheduler, ServiceResult, SharedStore,
};

use crate::graph::{build_graph, required_pairs, AppliedEdges, GraphPlan, ScheduledIds};

const REGISTRY_KEY: &str = "registry";
const APPLIED_KEY: &str = "applied";

/// One dependency edge the scheduler refused twice.
#[derive(Clone, Debug, PartialEq)]
pub struct EdgeFailure {
    /// The pass whose WAIT-on produced the edge.
    pub source: ItemId,
    /// Target token of the refused edge.
    pub target: String,
    /// What the scheduler said.
    pub error: String,
}

/// Coordination phase of one environment's job, as far as the shared-store
/// record shows (cancellation exclusions are a polling-time judgement and
/// are not reflected here).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinationState {
    /// Nothing registered yet.
    Pending,
    /// Registered; some required edge pair not yet applied.
    Resolving,
    /// Every required pair applied; job still paused.
    EdgesApplied,
    /// Job released.
    Released,
}

/// Orchestrates one worker's side of the handshake: register ids, poll for
/// dependency targets, apply edges, gate the release.
pub struct DispatchCoordinator<'a> {
    scheduler: &'a dyn Scheduler,
    store: &'a dyn SharedStore,
    bucket: BucketId,
    cfg: ResolutionConfig,
}

impl<'a> DispatchCoordinator<'a> {
    pub fn new(
        scheduler: &'a dyn Scheduler,
        store: &'a dyn SharedStore,
        bucket: BucketId,
        cfg: ResolutionConfig,
    ) -> Self {
        Self { scheduler, store, bucket, cfg }
    }

    /// Merges `entries` into the bucket's registry. Existing entries for the
    /// same uuid win, so a duplicate worker cannot repoint a target that
    /// siblings already ordered against.
    pub fn register(&self, entries: &[(Uuid, DepEnd)]) -> ServiceResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let at_ms = now_ms();
        let mut blob = Blob::new();
        for (uuid, end) in entries {
            blob.insert(uuid.to_string(), end_to_value(end, at_ms));
        }
        self.merge_into(REGISTRY_KEY, &blob)
    }

    /// Runs the whole handshake for one environment whose paused `job` this
    /// worker just created: poll the registry for WAIT-on targets, build and
    /// apply the edge plan, then unpause the job once every required pair is
    /// recorded as applied.
    ///
    /// Targets that are inactive in the session, or whose registered job sits
    /// in a terminal-failure state, are excluded from the must-be-satisfied
    /// set. An exhausted poll budget leaves the job paused and reports
    /// `failed:unresolved-dependency` naming what never turned up.
    pub fn coordinate_environment(
        &self,
        batch: &Batch,
        env_id: EnvId,
        job: &JobId,
        own: &[(Uuid, DepEnd)],
    ) -> ServiceResult<(Outcome, Vec<EdgeFailure>)> {
        let waited = self.await_targets(batch, env_id, own)?;
        if !waited.missing.is_empty() {
            let missing = join_uuids(&waited.missing);
            warn!(
                env = %env_id,
                job = %job,
                missing = %missing,
                "dependency targets never registered; job stays paused"
            );
            return Ok((
                Outcome::failed(format!("unresolved-dependency ({missing})")),
                Vec::new(),
            ));
        }

        let applied = self.read_applied()?;
        let plan = build_graph(batch, env_id, &waited.ids, &applied, &waited.excluded);
        let (own_pairs, failures) = self.apply_plan(&plan)?;

        let outcome = self.release_when_applied(batch, env_id, job, &waited.excluded, &own_pairs)?;
        Ok((outcome, failures))
    }

    /// Polls the registry until every WAIT-on target of the environment is
    /// registered or excluded, re-merging `own` entries on each attempt.
    fn await_targets(
        &self,
        batch: &Batch,
        env_id: EnvId,
        own: &[(Uuid, DepEnd)],
    ) -> ServiceResult<AwaitedTargets> {
        let targets = batch.wait_targets_of_env(env_id);
        let mut excluded: BTreeSet<Uuid> = BTreeSet::new();
        for target in &targets {
            if batch_inactive(batch, *target) {
                warn!(env = %env_id, target = %target, "wait-on target inactive in session; excluded");
                excluded.insert(*target);
            }
        }

        let attempts = self.cfg.max_poll_attempts.max(1);
        let mut ids = ScheduledIds::new();
        let mut missing: Vec<Uuid> = Vec::new();
        for attempt in 0..attempts {
            self.register(own)?;
            ids = self.read_registry()?;
            for target in &targets {
                if excluded.contains(target) {
                    continue;
                }
                let Some(end) = ids.get(target) else {
                    continue;
                };
                if let Some(state) = self.scheduler.job_state(&end.job)? {
                    if state.is_terminal_failure() {
                        warn!(
                            env = %env_id,
                            target = %target,
                            job = %end.job,
                            ?state,
                            "wait-on target job is dead; excluded"
                        );
                        excluded.insert(*target);
                    }
                }
            }
            missing = targets
                .iter()
                .filter(|t| !excluded.contains(*t) && !ids.contains_key(*t))
                .copied()
                .collect();
            if missing.is_empty() {
                break;
            }
            debug!(
                env = %env_id,
                attempt,
                missing = %join_uuids(&missing),
                "waiting for dependency targets"
            );
            if attempt + 1 < attempts {
                thread::sleep(self.cfg.poll_interval);
            }
        }
        Ok(AwaitedTargets { ids, excluded, missing })
    }

    /// Creates every planned edge, retrying each failed one once, and merges
    /// the successful pairs into the applied record. Failures are reported
    /// per edge; nothing is rolled back.
    fn apply_plan(&self, plan: &GraphPlan) -> ServiceResult<(AppliedEdges, Vec<EdgeFailure>)> {
        let mut fresh = AppliedEdges::new();
        let mut failures = Vec::new();
        for planned in &plan.edges {
            let mut result = self.scheduler.create_dependency(&planned.edge);
            if let Err(err) = &result {
                warn!(
                    source = %planned.pair.0,
                    target = %planned.pair.1,
                    error = %err,
                    "dependency creation failed; retrying once"
                );
                result = self.scheduler.create_dependency(&planned.edge);
            }
            match result {
                Ok(()) => fresh.insert(planned.pair.0, planned.pair.1.clone()),
                Err(err) => failures.push(EdgeFailure {
                    source: planned.source_item,
                    target: planned.pair.1.clone(),
                    error: err.to_string(),
                }),
            }
        }
        if !fresh.is_empty() {
            self.merge_into(APPLIED_KEY, &fresh.to_blob())?;
        }
        Ok((fresh, failures))
    }

    /// The release gate: unpauses `job` only once every required pair is in
    /// the applied record, re-merging this worker's own pairs each attempt.
    fn release_when_applied(
        &self,
        batch: &Batch,
        env_id: EnvId,
        job: &JobId,
        excluded: &BTreeSet<Uuid>,
        own_pairs: &AppliedEdges,
    ) -> ServiceResult<Outcome> {
        let required = required_pairs(batch, env_id, excluded);
        let attempts = self.cfg.max_poll_attempts.max(1);
        let mut outstanding: Vec<String> = Vec::new();
        for attempt in 0..attempts {
            if !own_pairs.is_empty() {
                self.merge_into(APPLIED_KEY, &own_pairs.to_blob())?;
            }
            let applied = self.read_applied()?;
            outstanding = required
                .iter()
                .filter(|(source, target)| !applied.contains(*source, target))
                .map(|(_, target)| target.clone())
                .collect();
            if outstanding.is_empty() {
                self.scheduler.pause(job, false, self.cfg.pause_expiry)?;
                info!(env = %env_id, job = %job, "all dependencies applied; job released");
                return Ok(Outcome::Resolved);
            }
            debug!(
                env = %env_id,
                attempt,
                outstanding = outstanding.len(),
                "waiting for edges to be applied"
            );
            if attempt + 1 < attempts {
                thread::sleep(self.cfg.poll_interval);
            }
        }
        warn!(
            env = %env_id,
            job = %job,
            outstanding = %outstanding.join(", "),
            "edges never fully applied; job stays paused"
        );
        Ok(Outcome::failed(format!(
            "unresolved-dependency ({})",
            outstanding.join(", ")
        )))
    }

    fn read_registry(&self) -> ServiceResult<ScheduledIds> {
        let Some(blob) = self.store.get(&self.bucket, REGISTRY_KEY)? else {
            return Ok(ScheduledIds::new());
        };
        let mut ids = ScheduledIds::new();
        for (key, value) in &blob {
            let Ok(uuid) = Uuid::parse_str(key) else {
                warn!(key = %key, "skipping junk registry key");
                continue;
            };
            let Some(end) = end_from_value(value) else {
                warn!(key = %key, "skipping junk registry entry");
                continue;
            };
            ids.insert(uuid, end);
        }
        Ok(ids)
    }

    fn read_applied(&self) -> ServiceResult<AppliedEdges> {
        let blob = self.store.get(&self.bucket, APPLIED_KEY)?.unwrap_or_default();
        Ok(AppliedEdges::from_blob(&blob))
    }

    fn merge_into(&self, key: &str, incoming: &Blob) -> ServiceResult<()> {
        let current = self.store.get(&self.bucket, key)?.unwrap_or_default();
        self.store.put(&self.bucket, key, &merge_blobs(&current, incoming))
    }
}

/// Where one environment's handshake currently stands, derived from the
/// shared-store record and the job state.
pub fn coordination_state(
    store: &dyn SharedStore,
    scheduler: &dyn Scheduler,
    bucket: &BucketId,
    batch: &Batch,
    env_id: EnvId,
) -> ServiceResult<CoordinationState> {
    let registry = store.get(bucket, REGISTRY_KEY)?.unwrap_or_default();
    let Some(entry) = registry.get(&env_id.0.to_string()) else {
        return Ok(CoordinationState::Pending);
    };
    let Some(end) = end_from_value(entry) else {
        return Ok(CoordinationState::Pending);
    };
    let applied = AppliedEdges::from_blob(&store.get(bucket, APPLIED_KEY)?.unwrap_or_default());
    let required = required_pairs(batch, env_id, &BTreeSet::new());
    if required.iter().any(|(source, target)| !applied.contains(*source, target)) {
        return Ok(CoordinationState::Resolving);
    }
    match scheduler.job_state(&end.job)? {
        Some(JobState::Paused) => Ok(CoordinationState::EdgesApplied),
        _ => Ok(CoordinationState::Released),
    }
}

struct AwaitedTargets {
    ids: ScheduledIds,
    excluded: BTreeSet<Uuid>,
    missing: Vec<Uuid>,
}

fn batch_inactive(batch: &Batch, target: Uuid) -> bool {
    match batch.item(target) {
        Some(ItemId::Environment(id)) => {
            !batch.environment(id).map(|e| e.is_active()).unwrap_or(false)
        }
        Some(ItemId::Pass(id)) => !batch.pass_is_active(id),
        // Unknown to this session: keep polling for it, and fail loudly
        // rather than release out of order if it never registers.
        None => false,
    }
}

fn end_to_value(end: &DepEnd, at_ms: i64) -> Value {
    let mut map = Blob::new();
    map.insert("job".into(), end.job.as_str().into());
    if let Some(sub) = &end.sub {
        map.insert("sub".into(), sub.as_str().into());
    }
    map.insert("at_ms".into(), at_ms.into());
    Value::Object(map)
}

fn end_from_value(value: &Value) -> Option<DepEnd> {
    let map = value.as_object()?;
    let job = JobId::from_str(map.get("job")?.as_str()?);
    let sub = map
        .get("sub")
        .and_then(|v| v.as_str())
        .map(LayerId::from_str);
    Some(DepEnd { job, sub })
}

fn join_uuids(uuids: &[Uuid]) -> String {
    uuids
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsub_core::PassId;
    use farmsub_services::{JobSpec, MemScheduler, MemSharedStore};
    use std::time::Duration;

    fn fast_cfg(attempts: u32) -> ResolutionConfig {
        ResolutionConfig {
            poll_interval: Duration::ZERO,
            max_poll_attempts: attempts,
            ..ResolutionConfig::default()
        }
    }

    fn job_end(job: &JobId) -> DepEnd {
        DepEnd::job(job.clone())
    }

    fn paused_job(scheduler: &MemScheduler, name: &str) -> JobId {
        scheduler
            .create_job(&JobSpec { name: name.into(), paused: true, ..Default::default() })
            .unwrap()
    }

    fn two_envs() -> (Batch, EnvId, PassId, EnvId, PassId) {
        let mut batch = Batch::new();
        let e1 = batch.add_environment("/show/a");
        let e2 = batch.add_environment("/show/b");
        let src = batch.add_source("beauty");
        let p1 = batch.add_pass(e1, src).unwrap();
        let p2 = batch.add_pass(e2, src).unwrap();
        (batch, e1, p1, e2, p2)
    }

    #[test]
    fn duplicate_registration_is_first_writer_wins() {
        let scheduler = MemScheduler::new();
        let store = MemSharedStore::new();
        let coordinator = DispatchCoordinator::new(
            &scheduler,
            &store,
            BucketId::mint(),
            fast_cfg(1),
        );
        let uuid = Uuid::new_v4();
        coordinator
            .register(&[(uuid, job_end(&JobId::from_str("job-a")))])
            .unwrap();
        coordinator
            .register(&[(uuid, job_end(&JobId::from_str("job-b")))])
            .unwrap();
        let ids = coordinator.read_registry().unwrap();
        assert_eq!(ids.get(&uuid).unwrap().job.as_str(), "job-a");
    }

    #[test]
    fn junk_registry_entries_are_skipped() {
        let scheduler = MemScheduler::new();
        let store = MemSharedStore::new();
        let bucket = BucketId::mint();
        let coordinator =
            DispatchCoordinator::new(&scheduler, &store, bucket.clone(), fast_cfg(1));
        let uuid = Uuid::new_v4();
        coordinator
            .register(&[(uuid, job_end(&JobId::from_str("job-a")))])
            .unwrap();

        let mut blob = store.get(&bucket, "registry").unwrap().unwrap();
        blob.insert("not-a-uuid".into(), Value::Bool(true));
        blob.insert(Uuid::new_v4().to_string(), Value::String("bare".into()));
        store.put(&bucket, "registry", &blob).unwrap();

        let ids = coordinator.read_registry().unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains_key(&uuid));
    }

    #[test]
    fn no_wait_on_releases_immediately() {
        let (batch, e1, p1, ..) = two_envs();
        let scheduler = MemScheduler::new();
        let store = MemSharedStore::new();
        let coordinator =
            DispatchCoordinator::new(&scheduler, &store, BucketId::mint(), fast_cfg(1));

        let job = paused_job(&scheduler, "a");
        let own = vec![(e1.0, job_end(&job)), (p1.0, job_end(&job))];
        let (outcome, failures) = coordinator
            .coordinate_environment(&batch, e1, &job, &own)
            .unwrap();
        assert!(outcome.is_resolved());
        assert!(failures.is_empty());
        assert_eq!(scheduler.job(&job).unwrap().state, JobState::Pending);
    }

    #[test]
    fn exhausted_budget_leaves_the_job_paused() {
        let (mut batch, e1, p1, _e2, p2) = two_envs();
        batch.pass_mut(p1).unwrap().overrides.wait_on = vec![p2.0];
        let scheduler = MemScheduler::new();
        let store = MemSharedStore::new();
        let coordinator =
            DispatchCoordinator::new(&scheduler, &store, BucketId::mint(), fast_cfg(2));

        let job = paused_job(&scheduler, "a");
        let own = vec![(e1.0, job_end(&job)), (p1.0, job_end(&job))];
        let (outcome, _) = coordinator
            .coordinate_environment(&batch, e1, &job, &own)
            .unwrap();
        assert_eq!(
            outcome.to_string(),
            format!("failed:unresolved-dependency ({})", p2.0)
        );
        assert_eq!(scheduler.job(&job).unwrap().state, JobState::Paused);
        assert!(scheduler.edges().is_empty());
    }

    #[test]
    fn terminal_target_jobs_are_excluded() {
        let (mut batch, e1, p1, _e2, p2) = two_envs();
        batch.pass_mut(p1).unwrap().overrides.wait_on = vec![p2.0];
        let scheduler = MemScheduler::new();
        let store = MemSharedStore::new();
        let coordinator =
            DispatchCoordinator::new(&scheduler, &store, BucketId::mint(), fast_cfg(3));

        // The sibling registered, then its job was killed on the farm.
        let dead = paused_job(&scheduler, "b");
        scheduler.set_job_state(&dead, JobState::Cancelled);
        coordinator.register(&[(p2.0, job_end(&dead))]).unwrap();

        let job = paused_job(&scheduler, "a");
        let own = vec![(e1.0, job_end(&job)), (p1.0, job_end(&job))];
        let (outcome, _) = coordinator
            .coordinate_environment(&batch, e1, &job, &own)
            .unwrap();
        assert!(outcome.is_resolved());
        assert_eq!(scheduler.job(&job).unwrap().state, JobState::Pending);
        assert!(scheduler.edges().is_empty());
    }

    #[test]
    fn inactive_session_targets_are_excluded() {
        let (mut batch, e1, p1, e2, _p2) = two_envs();
        batch.pass_mut(p1).unwrap().overrides.wait_on = vec![e2.0];
        batch.environment_mut(e2).unwrap().queued = false;
        let scheduler = MemScheduler::new();
        let store = MemSharedStore::new();
        let coordinator =
            DispatchCoordinator::new(&scheduler, &store, BucketId::mint(), fast_cfg(1));

        let job = paused_job(&scheduler, "a");
        let own = vec![(e1.0, job_end(&job)), (p1.0, job_end(&job))];
        let (outcome, _) = coordinator
            .coordinate_environment(&batch, e1, &job, &own)
            .unwrap();
        assert!(outcome.is_resolved());
        assert_eq!(scheduler.job(&job).unwrap().state, JobState::Pending);
    }

    #[test]
    fn edge_failures_are_retried_then_reported() {
        let (mut batch, e1, p1, _e2, p2) = two_envs();
        batch.pass_mut(p1).unwrap().overrides.wait_on = vec![p2.0];
        let scheduler = MemScheduler::new();
        let store = MemSharedStore::new();
        let coordinator =
            DispatchCoordinator::new(&scheduler, &store, BucketId::mint(), fast_cfg(1));

        let target_job = paused_job(&scheduler, "b");
        coordinator.register(&[(p2.0, job_end(&target_job))]).unwrap();
        let job = paused_job(&scheduler, "a");
        let own = vec![(e1.0, job_end(&job)), (p1.0, job_end(&job))];

        // Both the first try and the retry fail.
        scheduler.fail_next_dependencies(2);
        let (outcome, failures) = coordinator
            .coordinate_environment(&batch, e1, &job, &own)
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].source, ItemId::Pass(p1));
        // The pair never made it into the applied record, so the job is not
        // released.
        assert!(!outcome.is_resolved());
        assert_eq!(scheduler.job(&job).unwrap().state, JobState::Paused);

        // A single transient failure is absorbed by the retry.
        scheduler.fail_next_dependencies(1);
        let (outcome, failures) = coordinator
            .coordinate_environment(&batch, e1, &job, &own)
            .unwrap();
        assert!(failures.is_empty());
        assert!(outcome.is_resolved());
        assert_eq!(scheduler.edges().len(), 1);
    }

    #[test]
    fn state_query_tracks_the_handshake() {
        let (mut batch, e1, p1, _e2, p2) = two_envs();
        batch.pass_mut(p1).unwrap().overrides.wait_on = vec![p2.0];
        let scheduler = MemScheduler::new();
        let store = MemSharedStore::new();
        let bucket = BucketId::mint();
        let coordinator =
            DispatchCoordinator::new(&scheduler, &store, bucket.clone(), fast_cfg(2));

        assert_eq!(
            coordination_state(&store, &scheduler, &bucket, &batch, e1).unwrap(),
            CoordinationState::Pending
        );

        let target_job = paused_job(&scheduler, "b");
        coordinator.register(&[(p2.0, job_end(&target_job))]).unwrap();
        let job = paused_job(&scheduler, "a");
        let own = vec![(e1.0, job_end(&job)), (p1.0, job_end(&job))];
        coordinator.register(&own).unwrap();
        assert_eq!(
            coordination_state(&store, &scheduler, &bucket, &batch, e1).unwrap(),
            CoordinationState::Resolving
        );

        let (outcome, _) = coordinator
            .coordinate_environment(&batch, e1, &job, &own)
            .unwrap();
        assert!(outcome.is_resolved());
        assert_eq!(
            coordination_state(&store, &scheduler, &bucket, &batch, e1).unwrap(),
            CoordinationState::Released
        );
    }
}

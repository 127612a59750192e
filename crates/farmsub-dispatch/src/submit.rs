//! The two submission paths and the worker entry point.
//!
//! Local submission does everything in-process: one paused job per active
//! environment, every id registered before any edge is built, then the
//! release gate with a single poll attempt. Deferred submission saves the
//! collapsed session and spawns one detached worker per environment; the
//! workers then meet in the shared store.

use std::path::Path;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use farmsub_core::{
    Batch, BucketId, EnvId, ItemId, ItemReport, JobId, LayerId, Outcome, PassId, PostTask,
    ResolutionConfig, SessionDoc, SessionError,
};
use farmsub_resolve::{collapse_versions, resolve_all, resolve_environment_slice};
use farmsub_services::{
    DepEnd, JobSpec, LayerSpec, ProductionData, Scheduler, ServiceResult, SharedStore, TaskSpec,
    VersionRegistry,
};

use crate::coordinator::{DispatchCoordinator, EdgeFailure};
use crate::host::DispatcherRegistry;

/// Failures that stop a whole flow before any per-item work. Everything
/// after that point lands in report rows instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The session file could not be read or written.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// A worker was pointed at an environment the session does not contain.
    #[error("environment {0} not present in the session")]
    UnknownEnvironment(Uuid),
}

/// Borrowed collaborators handed to every submission flow.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub scheduler: &'a dyn Scheduler,
    pub store: &'a dyn SharedStore,
    pub production: &'a dyn ProductionData,
    pub versions: &'a dyn VersionRegistry,
}

/// What one submission did.
#[derive(Debug)]
pub struct SubmitReport {
    /// Shared-store bucket the submission ran under.
    pub bucket: BucketId,
    /// One row per environment and pass, in session order.
    pub items: Vec<ItemReport>,
    /// Dependency edges the scheduler refused even after a retry.
    pub edge_failures: Vec<EdgeFailure>,
}

/// Resolves, collapses versions and submits every active environment from
/// this process.
///
/// Every created entity is registered into the bucket before the first edge
/// is built, so the coordination runs with the single-attempt budget from
/// [`ResolutionConfig::immediate`]: a target missing at that point can never
/// appear later. Environments whose creation or coordination fails keep
/// their scheduler-side leftovers paused and report `failed:..` rows; the
/// rest of the submission carries on.
pub fn submit_local(
    batch: &mut Batch,
    cfg: &ResolutionConfig,
    services: Services<'_>,
    bucket: BucketId,
) -> SubmitReport {
    let mut items = resolve_all(batch, cfg, services.production, services.versions);
    collapse_versions(batch);

    let coordinator = DispatchCoordinator::new(
        services.scheduler,
        services.store,
        bucket.clone(),
        cfg.immediate(),
    );
    let mut created: Vec<(EnvId, JobId, Vec<(Uuid, DepEnd)>)> = Vec::new();
    for env_id in batch.env_ids() {
        if !row_is_resolved(&items, ItemId::Environment(env_id)) {
            continue;
        }
        match create_environment_entities(batch, env_id, services.scheduler) {
            Ok(Some((job, entries))) => match coordinator.register(&entries) {
                Ok(()) => created.push((env_id, job, entries)),
                Err(err) => set_row(
                    &mut items,
                    ItemId::Environment(env_id),
                    Outcome::failed(format!("coordination ({err})")),
                ),
            },
            Ok(None) => set_row(
                &mut items,
                ItemId::Environment(env_id),
                Outcome::skipped("no-submittable-passes"),
            ),
            Err(err) => set_row(
                &mut items,
                ItemId::Environment(env_id),
                Outcome::failed(format!("scheduler ({err})")),
            ),
        }
    }

    let mut edge_failures = Vec::new();
    for (env_id, job, entries) in &created {
        match coordinator.coordinate_environment(batch, *env_id, job, entries) {
            Ok((outcome, failures)) => {
                edge_failures.extend(failures);
                if !outcome.is_resolved() {
                    set_row(&mut items, ItemId::Environment(*env_id), outcome);
                }
            }
            Err(err) => set_row(
                &mut items,
                ItemId::Environment(*env_id),
                Outcome::failed(format!("coordination ({err})")),
            ),
        }
    }
    info!(bucket = %bucket, jobs = created.len(), "local submission finished");
    SubmitReport { bucket, items, edge_failures }
}

/// Resolves, collapses and saves the session, then spawns one detached
/// worker per dispatchable environment.
///
/// The collapse pins every resolved version as an explicit override before
/// the save, so workers re-resolving against a moved-on version registry
/// still submit exactly what this preview showed.
pub fn submit_deferred(
    batch: &mut Batch,
    cfg: &ResolutionConfig,
    services: Services<'_>,
    bucket: BucketId,
    session_path: &Path,
    dispatchers: &DispatcherRegistry,
    host_app: &str,
) -> Result<SubmitReport, DispatchError> {
    let mut items = resolve_all(batch, cfg, services.production, services.versions);
    collapse_versions(batch);
    SessionDoc::capture(batch).save(session_path)?;

    let dispatcher = dispatchers.get(host_app);
    let mut spawned = 0usize;
    for env_id in batch.env_ids() {
        if !row_is_resolved(&items, ItemId::Environment(env_id)) {
            continue;
        }
        if submittable_passes(batch, env_id).is_empty() {
            set_row(
                &mut items,
                ItemId::Environment(env_id),
                Outcome::skipped("no-submittable-passes"),
            );
            continue;
        }
        let Some(dispatcher) = dispatcher else {
            set_row(
                &mut items,
                ItemId::Environment(env_id),
                Outcome::failed(format!("no-dispatcher ({host_app})")),
            );
            continue;
        };
        let Some(env) = batch.environment(env_id) else {
            continue;
        };
        let argv = dispatcher.resolve_and_submit_command(env, session_path, &bucket);
        match spawn_detached(&argv) {
            Ok(()) => {
                debug!(env = %env.label(), "worker spawned");
                spawned += 1;
            }
            Err(err) => set_row(
                &mut items,
                ItemId::Environment(env_id),
                Outcome::failed(format!("dispatch ({err})")),
            ),
        }
    }
    info!(
        bucket = %bucket,
        spawned,
        session = %session_path.display(),
        "deferred submission handed off"
    );
    Ok(SubmitReport { bucket, items, edge_failures: Vec::new() })
}

/// The deferred-worker entry: reload the session, re-resolve one
/// environment, create its entities and run the coordination handshake with
/// the full poll budget. Also callable in-process, which is how the tests
/// race two workers.
pub fn run_worker(
    session_path: &Path,
    env_id: EnvId,
    bucket: BucketId,
    cfg: &ResolutionConfig,
    services: Services<'_>,
) -> Result<SubmitReport, DispatchError> {
    let doc = SessionDoc::load(session_path)?;
    let mut batch = Batch::new();
    let loaded = doc.apply(&mut batch);
    if batch.environment(env_id).is_none() {
        return Err(DispatchError::UnknownEnvironment(env_id.0));
    }
    debug!(session = %session_path.display(), loaded, env = %env_id, "session reloaded");

    let mut items =
        resolve_environment_slice(&mut batch, env_id, cfg, services.production, services.versions);
    let mut edge_failures = Vec::new();
    if row_is_resolved(&items, ItemId::Environment(env_id)) {
        let coordinator = DispatchCoordinator::new(
            services.scheduler,
            services.store,
            bucket.clone(),
            cfg.clone(),
        );
        match create_environment_entities(&mut batch, env_id, services.scheduler) {
            Ok(Some((job, own))) => {
                match coordinator.coordinate_environment(&batch, env_id, &job, &own) {
                    Ok((outcome, failures)) => {
                        edge_failures = failures;
                        if !outcome.is_resolved() {
                            set_row(&mut items, ItemId::Environment(env_id), outcome);
                        }
                    }
                    Err(err) => set_row(
                        &mut items,
                        ItemId::Environment(env_id),
                        Outcome::failed(format!("coordination ({err})")),
                    ),
                }
            }
            Ok(None) => set_row(
                &mut items,
                ItemId::Environment(env_id),
                Outcome::skipped("no-submittable-passes"),
            ),
            Err(err) => set_row(
                &mut items,
                ItemId::Environment(env_id),
                Outcome::failed(format!("scheduler ({err})")),
            ),
        }
    }
    Ok(SubmitReport { bucket, items, edge_failures })
}

/// Creates the paused job, one layer per submittable pass and the post-tasks
/// for one environment, recording the fresh scheduler ids in the arena.
/// Returns the job plus the registry entries for everything created, or
/// `None` when no pass has queued frames and a version.
///
/// Ids recorded by an earlier submission are never re-registered; only
/// entities created here enter the bucket.
fn create_environment_entities(
    batch: &mut Batch,
    env_id: EnvId,
    scheduler: &dyn Scheduler,
) -> ServiceResult<Option<(JobId, Vec<(Uuid, DepEnd)>)>> {
    let submittable = submittable_passes(batch, env_id);
    if submittable.is_empty() {
        return Ok(None);
    }
    let Some(env) = batch.environment(env_id) else {
        return Ok(None);
    };

    struct LayerPlan {
        pass: PassId,
        spec: LayerSpec,
        post_tasks: Vec<PostTask>,
    }
    let mut plans = Vec::with_capacity(submittable.len());
    for pass_id in &submittable {
        let Some(pass) = batch.pass(*pass_id) else {
            continue;
        };
        let Some(source) = batch.source(pass.source) else {
            continue;
        };
        let Some(version) = pass.resolved_version else {
            continue;
        };
        let frames = pass
            .resolved
            .as_ref()
            .map(|r| r.queued.to_string())
            .unwrap_or_default();
        plans.push(LayerPlan {
            pass: *pass_id,
            spec: LayerSpec {
                name: format!("{}_v{:03}", source.name, version),
                frames,
                chunk: 1,
            },
            post_tasks: pass.overrides.post_tasks.clone(),
        });
    }

    let job_spec = JobSpec {
        name: env.job_label(),
        paused: true,
        note: env.overrides.note.clone(),
        colour: env.overrides.colour,
    };
    let env_tasks = env.overrides.post_tasks.clone();
    let env_label = env.label();
    let job = scheduler.create_job(&job_spec)?;
    info!(job = %job, env = %env_label, layers = plans.len(), "created paused job");

    let mut entries = vec![(env_id.0, DepEnd::job(job.clone()))];
    let mut layered: Vec<(PassId, LayerId)> = Vec::new();
    for plan in &plans {
        let layer = scheduler.create_layer(&job, &plan.spec)?;
        entries.push((plan.pass.0, DepEnd::layer(job.clone(), layer.clone())));
        for task in &plan.post_tasks {
            create_post_task(scheduler, &job, task, Some(layer.clone()));
        }
        layered.push((plan.pass, layer));
    }
    for task in &env_tasks {
        create_post_task(scheduler, &job, task, None);
    }

    if let Some(env) = batch.environment_mut(env_id) {
        env.last_job = Some(job.clone());
    }
    for (pass_id, layer) in layered {
        if let Some(pass) = batch.pass_mut(pass_id) {
            pass.last_job = Some(job.clone());
            pass.last_layer = Some(layer);
        }
    }
    Ok(Some((job, entries)))
}

/// A post-task that fails to create is reported in the log only; the job
/// itself is sound without it.
fn create_post_task(
    scheduler: &dyn Scheduler,
    job: &JobId,
    task: &PostTask,
    after_layer: Option<LayerId>,
) {
    let spec = TaskSpec {
        name: task.name.clone(),
        args: task.args.clone(),
        after_layer,
    };
    if let Err(err) = scheduler.create_task(job, &spec) {
        warn!(job = %job, task = %task.name, error = %err, "post-task creation failed");
    }
}

/// Active passes worth a layer: resolved to a non-empty queued set and a
/// concrete version.
fn submittable_passes(batch: &Batch, env_id: EnvId) -> Vec<PassId> {
    batch
        .active_passes_of(env_id)
        .into_iter()
        .filter(|id| {
            batch
                .pass(*id)
                .map(|p| {
                    p.resolved_version.is_some()
                        && p.resolved.as_ref().map(|r| !r.queued.is_empty()).unwrap_or(false)
                })
                .unwrap_or(false)
        })
        .collect()
}

fn row_is_resolved(items: &[ItemReport], item: ItemId) -> bool {
    items
        .iter()
        .find(|r| r.item == item)
        .map(|r| r.outcome.is_resolved())
        .unwrap_or(false)
}

fn set_row(items: &mut [ItemReport], item: ItemId, outcome: Outcome) {
    if let Some(row) = items.iter_mut().find(|r| r.item == item) {
        row.outcome = outcome;
    }
}

fn spawn_detached(argv: &[String]) -> std::io::Result<()> {
    let (program, args) = argv.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty worker command")
    })?;
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsub_core::{FrameSet, ResolvedFrames};
    use farmsub_services::{JobState, MemScheduler};

    fn fs(text: &str) -> FrameSet {
        FrameSet::parse(text).unwrap()
    }

    fn cache(batch: &mut Batch, pass: PassId, frames: &str, version: i64) {
        let p = batch.pass_mut(pass).unwrap();
        p.resolved = Some(ResolvedFrames { enabled: fs(frames), queued: fs(frames) });
        p.resolved_version = Some(version);
    }

    #[test]
    fn entities_cover_job_layers_and_post_tasks() {
        let mut batch = Batch::new();
        let env = batch.add_environment("/show/a");
        let beauty = batch.add_source("beauty");
        let matte = batch.add_source("matte");
        let p1 = batch.add_pass(env, beauty).unwrap();
        let p2 = batch.add_pass(env, matte).unwrap();
        cache(&mut batch, p1, "1-10", 5);
        cache(&mut batch, p2, "1-10x2", 2);
        batch.pass_mut(p1).unwrap().overrides.post_tasks = vec![PostTask::named("publish")];
        batch.environment_mut(env).unwrap().overrides.post_tasks =
            vec![PostTask::named("dailies")];

        let scheduler = MemScheduler::new();
        let (job, entries) = create_environment_entities(&mut batch, env, &scheduler)
            .unwrap()
            .unwrap();

        let record = scheduler.job(&job).unwrap();
        assert_eq!(record.spec.name, "/show/a");
        assert!(record.spec.paused);
        assert_eq!(record.state, JobState::Paused);
        let layer_names: Vec<_> = record.layers.iter().map(|(_, s)| s.name.clone()).collect();
        assert_eq!(layer_names, vec!["beauty_v005", "matte_v002"]);
        assert_eq!(record.layers[1].1.frames, "1-10x2");

        // Pass post-task after its layer, environment post-task after the job.
        assert_eq!(record.tasks[0].1.name, "publish");
        assert_eq!(record.tasks[0].1.after_layer, Some(record.layers[0].0.clone()));
        assert_eq!(record.tasks[1].1.name, "dailies");
        assert_eq!(record.tasks[1].1.after_layer, None);

        // Registry entries: the job for the environment, the layers for the
        // passes.
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], (env.0, DepEnd::job(job.clone())));
        assert_eq!(entries[1].0, p1.0);
        assert_eq!(entries[1].1.sub, Some(record.layers[0].0.clone()));

        assert_eq!(batch.environment(env).unwrap().last_job, Some(job.clone()));
        assert_eq!(batch.pass(p1).unwrap().last_job, Some(job));
        assert_eq!(
            batch.pass(p2).unwrap().last_layer,
            Some(record.layers[1].0.clone())
        );
    }

    #[test]
    fn passes_without_frames_or_versions_are_not_submittable() {
        let mut batch = Batch::new();
        let env = batch.add_environment("/show/a");
        let src = batch.add_source("beauty");
        let full = batch.add_pass(env, src).unwrap();
        let versionless = batch.add_pass(env, src).unwrap();
        let frameless = batch.add_pass(env, src).unwrap();
        cache(&mut batch, full, "1-10", 3);
        batch.pass_mut(versionless).unwrap().resolved =
            Some(ResolvedFrames { enabled: fs("1-10"), queued: fs("1-10") });
        batch.pass_mut(frameless).unwrap().resolved_version = Some(3);

        assert_eq!(submittable_passes(&batch, env), vec![full]);
    }

    #[test]
    fn environment_without_submittable_passes_creates_nothing() {
        let mut batch = Batch::new();
        let env = batch.add_environment("/show/a");
        let src = batch.add_source("beauty");
        batch.add_pass(env, src).unwrap();

        let scheduler = MemScheduler::new();
        let created = create_environment_entities(&mut batch, env, &scheduler).unwrap();
        assert!(created.is_none());
        assert!(scheduler.jobs().is_empty());
    }
}

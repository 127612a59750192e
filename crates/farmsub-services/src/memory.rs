//! In-memory collaborators. Test doubles that double as the dry-run backends
//! of the CLI: the scheduler records everything it is asked to create and
//! hands out deterministic ids.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use farmsub_core::{BucketId, FrameSet, JobId, LayerId, ProductionRanges, RangeSource, TaskId};

use crate::types::{
    Blob, DepEdge, JobSpec, JobState, LayerSpec, ProductionData, Scheduler, ServiceError,
    ServiceResult, SharedStore, TaskSpec, VersionRegistry,
};

/// Everything the mem scheduler knows about one job.
#[derive(Clone, Debug)]
pub struct JobRecord {
    pub id: JobId,
    pub spec: JobSpec,
    pub state: JobState,
    pub layers: Vec<(LayerId, LayerSpec)>,
    pub tasks: Vec<(TaskId, TaskSpec)>,
    /// Pause/unpause calls in order, with their expiry.
    pub pause_calls: Vec<(bool, Option<Duration>)>,
}

#[derive(Default)]
struct SchedInner {
    jobs: BTreeMap<String, JobRecord>,
    edges: Vec<DepEdge>,
    job_seq: u64,
    layer_seq: u64,
    task_seq: u64,
    fail_dependencies: u32,
}

/// Recording scheduler with `job-0001`-style ids.
#[derive(Default)]
pub struct MemScheduler {
    inner: Mutex<SchedInner>,
}

impl MemScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` `create_dependency` calls fail.
    pub fn fail_next_dependencies(&self, n: u32) {
        self.inner.lock().unwrap().fail_dependencies = n;
    }

    /// Snapshot of one job.
    pub fn job(&self, id: &JobId) -> Option<JobRecord> {
        self.inner.lock().unwrap().jobs.get(id.as_str()).cloned()
    }

    /// Snapshot of every job, in id order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.inner.lock().unwrap().jobs.values().cloned().collect()
    }

    /// Every dependency edge created so far.
    pub fn edges(&self) -> Vec<DepEdge> {
        self.inner.lock().unwrap().edges.clone()
    }

    /// Overrides a job's state (used to simulate dead siblings).
    pub fn set_job_state(&self, id: &JobId, state: JobState) {
        if let Some(job) = self.inner.lock().unwrap().jobs.get_mut(id.as_str()) {
            job.state = state;
        }
    }
}

impl Scheduler for MemScheduler {
    fn create_job(&self, spec: &JobSpec) -> ServiceResult<JobId> {
        let mut inner = self.inner.lock().unwrap();
        inner.job_seq += 1;
        let id = JobId::from_str(format!("job-{:04}", inner.job_seq));
        let state = if spec.paused { JobState::Paused } else { JobState::Pending };
        inner.jobs.insert(
            id.as_str().to_string(),
            JobRecord {
                id: id.clone(),
                spec: spec.clone(),
                state,
                layers: Vec::new(),
                tasks: Vec::new(),
                pause_calls: Vec::new(),
            },
        );
        Ok(id)
    }

    fn create_layer(&self, job: &JobId, spec: &LayerSpec) -> ServiceResult<LayerId> {
        let mut inner = self.inner.lock().unwrap();
        inner.layer_seq += 1;
        let id = LayerId::from_str(format!("layer-{:04}", inner.layer_seq));
        match inner.jobs.get_mut(job.as_str()) {
            Some(record) => {
                record.layers.push((id.clone(), spec.clone()));
                Ok(id)
            }
            None => Err(ServiceError::Backend(format!("no such job {job}"))),
        }
    }

    fn create_task(&self, job: &JobId, spec: &TaskSpec) -> ServiceResult<TaskId> {
        let mut inner = self.inner.lock().unwrap();
        inner.task_seq += 1;
        let id = TaskId::from_str(format!("task-{:04}", inner.task_seq));
        match inner.jobs.get_mut(job.as_str()) {
            Some(record) => {
                record.tasks.push((id.clone(), spec.clone()));
                Ok(id)
            }
            None => Err(ServiceError::Backend(format!("no such job {job}"))),
        }
    }

    fn pause(&self, job: &JobId, paused: bool, expiry: Option<Duration>) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(job.as_str()) {
            Some(record) => {
                record.pause_calls.push((paused, expiry));
                // Terminal states stay terminal.
                if !record.state.is_terminal_failure() {
                    record.state = if paused { JobState::Paused } else { JobState::Pending };
                }
                Ok(())
            }
            None => Err(ServiceError::Backend(format!("no such job {job}"))),
        }
    }

    fn create_dependency(&self, edge: &DepEdge) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_dependencies > 0 {
            inner.fail_dependencies -= 1;
            return Err(ServiceError::Backend("injected dependency failure".into()));
        }
        if !inner.jobs.contains_key(edge.source.job.as_str()) {
            return Err(ServiceError::Backend(format!(
                "no such source job {}",
                edge.source.job
            )));
        }
        inner.edges.push(edge.clone());
        Ok(())
    }

    fn job_state(&self, job: &JobId) -> ServiceResult<Option<JobState>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .get(job.as_str())
            .map(|j| j.state))
    }

    fn layer_state(&self, layer: &LayerId) -> ServiceResult<Option<JobState>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.values().find_map(|j| {
            j.layers
                .iter()
                .find(|(id, _)| id == layer)
                .map(|_| j.state)
        }))
    }

    fn task_state(&self, task: &TaskId) -> ServiceResult<Option<JobState>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.values().find_map(|j| {
            j.tasks.iter().find(|(id, _)| id == task).map(|_| j.state)
        }))
    }
}

/// Map-backed shared store. Merge discipline stays with the callers, exactly
/// as with the real store.
#[derive(Default)]
pub struct MemSharedStore {
    inner: Mutex<BTreeMap<(String, String), Blob>>,
}

impl MemSharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys present in one bucket.
    pub fn keys(&self, bucket: &BucketId) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket.as_str())
            .map(|(_, k)| k.clone())
            .collect()
    }
}

impl SharedStore for MemSharedStore {
    fn get(&self, bucket: &BucketId, key: &str) -> ServiceResult<Option<Blob>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .get(&(bucket.as_str().to_string(), key.to_string()))
            .cloned())
    }

    fn put(&self, bucket: &BucketId, key: &str, blob: &Blob) -> ServiceResult<()> {
        self.inner
            .lock()
            .unwrap()
            .insert((bucket.as_str().to_string(), key.to_string()), blob.clone());
        Ok(())
    }
}

/// Area-keyed production ranges.
#[derive(Default)]
pub struct MemProductionData {
    inner: Mutex<BTreeMap<String, ProductionRanges>>,
}

impl MemProductionData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one range kind for an area.
    pub fn set(&self, area: &str, kind: RangeSource, set: FrameSet) {
        self.inner
            .lock()
            .unwrap()
            .entry(area.to_string())
            .or_default()
            .set(kind, Some(set));
    }
}

impl ProductionData for MemProductionData {
    fn range(&self, area: &str, kind: RangeSource) -> ServiceResult<Option<FrameSet>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .get(area)
            .and_then(|r| r.get(kind).cloned()))
    }
}

#[derive(Default)]
struct RegistryInner {
    highest: BTreeMap<(String, String), i64>,
    source: BTreeMap<String, i64>,
}

/// Map-backed version registry.
#[derive(Default)]
pub struct MemVersionRegistry {
    inner: Mutex<RegistryInner>,
}

impl MemVersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the highest published version for an output location.
    pub fn set_highest(&self, area: &str, pass_name: &str, version: i64) {
        self.inner
            .lock()
            .unwrap()
            .highest
            .insert((area.to_string(), pass_name.to_string()), version);
    }

    /// Sets the source-of-truth project version for an area.
    pub fn set_source_version(&self, area: &str, version: i64) {
        self.inner
            .lock()
            .unwrap()
            .source
            .insert(area.to_string(), version);
    }
}

impl VersionRegistry for MemVersionRegistry {
    fn highest_version(&self, area: &str, pass_name: &str) -> ServiceResult<Option<i64>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .highest
            .get(&(area.to_string(), pass_name.to_string()))
            .copied())
    }

    fn source_version(&self, area: &str) -> ServiceResult<Option<i64>> {
        Ok(self.inner.lock().unwrap().source.get(area).copied())
    }
}

//! Shared wire types and the four collaborator traits. The core never
//! inspects scheduler-specific metadata beyond ids and status.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use farmsub_core::{BucketId, FrameSet, JobId, LayerId, RangeSource, TaskId};

/// Errors surfaced by external collaborators.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Scheduler / production-data / registry backend trouble.
    #[error("backend: {0}")]
    Backend(String),
    /// Shared-store trouble.
    #[error("shared store: {0}")]
    Store(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// What a new job should look like.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    /// Jobs are created paused and released by the coordinator.
    pub paused: bool,
    pub note: Option<String>,
    pub colour: Option<[f32; 3]>,
}

/// What a new layer should look like.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    /// Queued frames, in canonical frame-set text.
    pub frames: String,
    pub chunk: u32,
}

/// A post-task attached to a job, optionally scheduled after one layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub args: BTreeMap<String, String>,
    /// When set, the scheduler runs the task after this layer rather than
    /// after the whole job.
    pub after_layer: Option<LayerId>,
}

/// Scheduler-side lifecycle state, shared by jobs, layers and tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Paused,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// True when the entity died on the scheduler and will never finish.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Cancelled)
    }
}

/// One end of a dependency edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepEnd {
    pub job: JobId,
    pub sub: Option<LayerId>,
}

impl DepEnd {
    /// A whole-job end.
    pub fn job(job: JobId) -> Self {
        Self { job, sub: None }
    }

    /// A layer end.
    pub fn layer(job: JobId, layer: LayerId) -> Self {
        Self { job, sub: Some(layer) }
    }
}

/// Edge granularity, preferred finest-first when both ends expose it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepGranularity {
    JobOnJob,
    LayerOnLayer,
    TaskOnTask,
}

/// One concrete dependency-edge request: `source` runs after `target`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepEdge {
    pub source: DepEnd,
    pub target: DepEnd,
    pub granularity: DepGranularity,
}

/// Farm scheduler client.
pub trait Scheduler: Send + Sync {
    fn create_job(&self, spec: &JobSpec) -> ServiceResult<JobId>;
    fn create_layer(&self, job: &JobId, spec: &LayerSpec) -> ServiceResult<LayerId>;
    fn create_task(&self, job: &JobId, spec: &TaskSpec) -> ServiceResult<TaskId>;
    fn pause(&self, job: &JobId, paused: bool, expiry: Option<Duration>) -> ServiceResult<()>;
    fn create_dependency(&self, edge: &DepEdge) -> ServiceResult<()>;
    fn job_state(&self, job: &JobId) -> ServiceResult<Option<JobState>>;
    fn layer_state(&self, layer: &LayerId) -> ServiceResult<Option<JobState>>;
    fn task_state(&self, task: &TaskId) -> ServiceResult<Option<JobState>>;
}

/// A blob as stored per (bucket, key). Always a JSON map so writers can merge.
pub type Blob = serde_json::Map<String, serde_json::Value>;

/// Bucket-scoped key/value blob store. No transactions, no locks: all writes
/// must go through read-merge-write with [`merge_blobs`].
pub trait SharedStore: Send + Sync {
    fn get(&self, bucket: &BucketId, key: &str) -> ServiceResult<Option<Blob>>;
    fn put(&self, bucket: &BucketId, key: &str, blob: &Blob) -> ServiceResult<()>;
}

/// The commutative merge every store writer must apply before a put:
/// first writer wins per key, union across keys.
pub fn merge_blobs(existing: &Blob, incoming: &Blob) -> Blob {
    let mut merged = existing.clone();
    for (key, value) in incoming {
        if !merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Production frame-range source.
pub trait ProductionData: Send + Sync {
    /// The range of one kind for an area; `Ok(None)` when production has none.
    fn range(&self, area: &str, kind: RangeSource) -> ServiceResult<Option<FrameSet>>;
}

/// Published-version registry for output locations.
pub trait VersionRegistry: Send + Sync {
    /// Highest registered version for an output location. `Ok(None)` means
    /// the location is unknown to the registry; `Ok(Some(0))` is a known
    /// location with nothing published yet.
    fn highest_version(&self, area: &str, pass_name: &str) -> ServiceResult<Option<i64>>;
    /// The current source-of-truth project version for an area.
    fn source_version(&self, area: &str) -> ServiceResult<Option<i64>>;
}

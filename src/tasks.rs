//! # Resumable tasks
//!
//! Operations that mutate more than one store (record deletes and
//! descendant prunes) persist their intent as a resumable task before
//! touching any store. A crash mid-operation leaves the task grabbable, so
//! a restarted node can re-drive it to completion, achieving eventual
//! atomicity.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::{Provider, TaskStore};
use crate::{Result, unexpected};

/// Seconds before an in-flight task is considered abandoned and grabbable.
const TIMEOUT_SECS: u64 = 120;

/// A task that can be re-driven after a crash.
pub trait Task: Serialize + DeserializeOwned + Send + Sync {
    /// Run the task to completion. Must be idempotent: the task may be
    /// re-driven from any point.
    fn run(&self, owner: &str, provider: &impl Provider)
    -> impl Future<Output = Result<()>> + Send;
}

/// The kind of operation a stored task re-drives.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum TaskType {
    /// A record delete (and optional descendant prune).
    RecordsDelete,
}

/// A persisted task awaiting completion.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResumableTask {
    /// The task's unique identifier.
    pub task_id: String,

    /// The operation the task re-drives.
    pub task_type: TaskType,

    /// The serialized task payload.
    pub task: Value,

    /// Epoch seconds after which the task may be grabbed by another client.
    pub timeout: u64,

    /// Number of times the task has been re-driven.
    pub retry_count: u64,
}

/// Register the task then run it, extending its timeout while it runs and
/// deleting it on completion.
///
/// # Errors
///
/// Fails when the task itself or any store operation fails.
pub async fn run<T: Task>(
    owner: &str, task_type: TaskType, task: T, provider: &impl Provider,
) -> Result<()> {
    let task_id = uuid::Uuid::new_v4().to_string();

    // persist intent before touching any store
    let resumable = ResumableTask {
        task_id: task_id.clone(),
        task_type,
        task: serde_json::to_value(&task).map_err(|e| unexpected!("issue serializing task: {e}"))?,
        timeout: 0,
        retry_count: 0,
    };
    TaskStore::register(provider, owner, &resumable, TIMEOUT_SECS).await?;

    let result = task.run(owner, provider).await;

    TaskStore::delete(provider, owner, &task_id).await?;
    result
}

/// Grab and re-drive timed-out tasks for the tenant. Called on node
/// restart to complete operations interrupted by a crash.
///
/// # Errors
///
/// Fails when a grabbed task cannot be decoded or re-driven.
pub async fn resume<T: Task>(owner: &str, provider: &impl Provider) -> Result<()> {
    loop {
        let grabbed = TaskStore::grab(provider, owner, 25).await?;
        if grabbed.is_empty() {
            return Ok(());
        }

        for resumable in grabbed {
            let task: T = serde_json::from_value(resumable.task.clone())
                .map_err(|e| unexpected!("issue decoding task: {e}"))?;
            task.run(owner, provider).await?;
            TaskStore::delete(provider, owner, &resumable.task_id).await?;
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::schema::Job;

/// What a handler reports back: a success payload recorded as the job's
/// output, or an error routed through the retry policy.
pub(crate) type HandlerResult = anyhow::Result<Value>;

/// Type-erased job handler shared by a worker's handler tasks.
pub(crate) type BoxedHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A running worker loop, tracked so it can be cancelled and joined.
pub(crate) struct WorkerHandle {
    pub(crate) name: String,
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

/// Registry of running workers, keyed by worker id.
#[derive(Default)]
pub(crate) struct WorkerRegistry {
    workers: Mutex<HashMap<Uuid, WorkerHandle>>,
}

impl WorkerRegistry {
    pub(crate) fn insert(&self, id: Uuid, handle: WorkerHandle) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.insert(id, handle);
    }

    pub(crate) fn remove(&self, id: Uuid) -> Option<WorkerHandle> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.remove(&id)
    }

    pub(crate) fn drain(&self) -> Vec<WorkerHandle> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.drain().map(|(_, handle)| handle).collect()
    }
}

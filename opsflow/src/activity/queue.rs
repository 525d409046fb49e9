//! Named task queues with worker pools.
//!
//! A task queue is an isolation boundary: each activity registers on
//! exactly one queue, and only that queue's workers execute it. A queue
//! with no workers accepts dispatches and holds them until a worker
//! pool is started, so a stalled pipeline resumes where it left off.

use crate::activity::Activity;
use crate::errors::ActivityError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Job {
    name: String,
    input: Value,
    reply: oneshot::Sender<Result<Value, ActivityError>>,
}

/// A named queue routing activity invocations to a worker pool.
pub struct TaskQueue {
    name: String,
    registry: parking_lot::RwLock<HashMap<String, Arc<dyn Activity>>>,
    tx: mpsc::UnboundedSender<Job>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Creates an empty queue with no workers.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.into(),
            registry: parking_lot::RwLock::new(HashMap::new()),
            tx,
            rx: Arc::new(Mutex::new(rx)),
            workers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// The queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers an activity under `name`, replacing any previous
    /// registration.
    pub fn register(&self, name: impl Into<String>, activity: Arc<dyn Activity>) {
        self.registry.write().insert(name.into(), activity);
    }

    /// Returns true if an activity is registered under `name`.
    #[must_use]
    pub fn has_activity(&self, name: &str) -> bool {
        self.registry.read().contains_key(name)
    }

    /// Starts `count` workers draining this queue.
    pub fn start_workers(self: &Arc<Self>, count: usize) {
        let mut workers = self.workers.lock();
        for _ in 0..count {
            let queue = Arc::clone(self);
            workers.push(tokio::spawn(async move { queue.worker_loop().await }));
        }
    }

    /// Number of live worker tasks.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Enqueues an invocation and returns the reply channel.
    ///
    /// The receiver resolves when a worker finishes the attempt. If the
    /// queue is shut down before then, the receiver yields a recv error.
    pub fn dispatch(
        &self,
        name: impl Into<String>,
        input: Value,
    ) -> oneshot::Receiver<Result<Value, ActivityError>> {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            name: name.into(),
            input,
            reply,
        };
        if let Err(err) = self.tx.send(job) {
            // Channel closed during shutdown; report through the reply.
            let _ = err.0.reply.send(Err(ActivityError::transient(
                "dispatch",
                format!("task queue '{}' is closed", self.name),
            )));
        }
        rx
    }

    /// Aborts all workers. Jobs already enqueued stay in the channel
    /// and run if workers are started again.
    pub fn shutdown(&self) {
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            // Hold the receiver lock only while waiting for a job, so
            // sibling workers can pick up the next one concurrently.
            let job = {
                let mut rx = self.rx.lock().await;
                match rx.recv().await {
                    Some(job) => job,
                    None => return,
                }
            };

            let activity = self.registry.read().get(&job.name).cloned();
            let result = match activity {
                Some(activity) => {
                    debug!(queue = %self.name, activity = %job.name, "executing activity");
                    activity.execute(job.input).await
                }
                None => {
                    warn!(queue = %self.name, activity = %job.name, "activity not registered");
                    Err(ActivityError::fatal(
                        job.name.clone(),
                        format!("activity not registered on queue '{}'", self.name),
                    ))
                }
            };
            // The caller may have timed out and dropped the receiver.
            let _ = job.reply.send(result);
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}

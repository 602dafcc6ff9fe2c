//! Asynchronous delivery of connection events.
//!
//! [`NotificationPool`] runs a handful of worker threads. Every task is routed by a key
//! (the plugin id), and a key always lands on the same worker, so events for one plugin
//! are delivered in the order they were queued while different plugins proceed in
//! parallel. Each worker queue is bounded; when it is full the caller waits for room.
//! [`StateHub`] republishes state changes to observers outside the supervisor.

use crate::connection::ConnectionState;
use crate::descriptor::PluginId;
use crate::error::ConnectionError;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Pending tasks each worker accepts before `dispatch` waits.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub struct NotificationPool {
    queues: Vec<SyncSender<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationPool {
    pub fn new(workers: usize) -> Self {
        Self::with_queue_capacity(workers, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(workers: usize, capacity: usize) -> Self {
        let count = workers.max(1);
        let mut queues = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = mpsc::sync_channel::<Task>(capacity.max(1));
            let spawned = thread::Builder::new()
                .name(format!("hostlink-notify-{index}"))
                .spawn(move || run_worker(rx));
            match spawned {
                Ok(handle) => {
                    queues.push(tx);
                    handles.push(handle);
                }
                Err(err) => {
                    tracing::error!(worker = index, error = %err, "failed to spawn notification worker");
                }
            }
        }
        Self {
            queues,
            workers: Mutex::new(handles),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    /// Queues `task` behind every earlier task with the same key, waiting while that
    /// worker's queue is full.
    pub fn dispatch<F>(&self, key: &str, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.queues.is_empty() {
            // No worker could be started; deliver inline rather than drop the event.
            task();
            return;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.queues.len() as u64) as usize;
        let queue = &self.queues[index];
        let stopped = match queue.try_send(Box::new(task)) {
            Ok(()) => return,
            Err(TrySendError::Full(task)) => {
                tracing::debug!(worker = index, "notification queue full; waiting");
                match queue.send(task) {
                    Ok(()) => return,
                    Err(mpsc::SendError(task)) => task,
                }
            }
            Err(TrySendError::Disconnected(task)) => task,
        };
        tracing::warn!(worker = index, "notification worker stopped; delivering inline");
        stopped();
    }

    /// Stops accepting work, drains queued tasks and joins the workers.
    pub fn shutdown(self) {
        let NotificationPool { queues, workers } = self;
        drop(queues);
        let handles = std::mem::take(&mut *workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn run_worker(tasks: Receiver<Task>) {
    for task in tasks {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!("connection listener panicked");
        }
    }
}

/// A state change as seen by observers outside the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEvent {
    pub plugin_id: PluginId,
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ConnectionError>,
    pub timestamp_ms: u64,
}

impl StateEvent {
    pub fn now(plugin_id: PluginId, state: ConnectionState, error: Option<ConnectionError>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            plugin_id,
            state,
            error,
            timestamp_ms,
        }
    }
}

/// Process-wide channel carrying every [`StateEvent`].
#[derive(Default)]
pub struct StateHub {
    subscribers: Mutex<Vec<Sender<StateEvent>>>,
}

impl StateHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<StateEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: &StateEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

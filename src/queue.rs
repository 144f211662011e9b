use crate::error::LaunchError;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    drain: Option<AbortHandle>,
    running: Option<AbortHandle>,
    shut_down: bool,
}

/// Runs submitted futures one at a time, in submission order.
///
/// At most one drain task is alive; it exits once the queue is empty and the next
/// submit schedules a fresh one. Each task runs in its own spawned task, so a panic
/// is logged and the drain moves on to the next one.
#[derive(Clone)]
pub struct SerialTaskQueue {
    runtime: Handle,
    state: Arc<Mutex<QueueState>>,
}

impl SerialTaskQueue {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Appends a task. Callable from any thread.
    pub fn submit<F>(&self, task: F) -> Result<(), LaunchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.shut_down {
            return Err(LaunchError::QueueShutdown);
        }
        state.tasks.push_back(Box::pin(task));
        if state.drain.is_none() {
            trace!(queued = state.tasks.len(), "Scheduling queue drain");
            let shared = Arc::clone(&self.state);
            let handle = self.runtime.spawn(Self::drain(shared));
            state.drain = Some(handle.abort_handle());
        }
        Ok(())
    }

    async fn drain(state: Arc<Mutex<QueueState>>) {
        loop {
            let running = {
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                match guard.tasks.pop_front() {
                    Some(task) => {
                        let running = tokio::spawn(task);
                        guard.running = Some(running.abort_handle());
                        running
                    }
                    None => {
                        guard.drain = None;
                        return;
                    }
                }
            };
            let outcome = running.await;
            state.lock().unwrap_or_else(PoisonError::into_inner).running = None;
            if let Err(e) = outcome {
                if e.is_panic() {
                    warn!("Queued task panicked");
                } else {
                    trace!("Queued task cancelled");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).shut_down
    }

    /// Discards queued tasks and rejects new ones. A task already running finishes.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.shut_down = true;
        let dropped = state.tasks.len();
        state.tasks.clear();
        debug!(dropped, "Task queue shut down");
    }

    /// Like [`shutdown`](Self::shutdown), but also aborts the running task and
    /// hands back the ones that never started.
    pub fn shutdown_now(&self) -> Vec<Task> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.shut_down = true;
        if let Some(drain) = state.drain.take() {
            drain.abort();
        }
        if let Some(running) = state.running.take() {
            running.abort();
        }
        let pending: Vec<Task> = state.tasks.drain(..).collect();
        debug!(pending = pending.len(), "Task queue shut down immediately");
        pending
    }
}

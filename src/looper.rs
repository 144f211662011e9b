//! The main looper: one thread that owns all registry (or host) state.
//!
//! Jobs are boxed closures executed in FIFO order. A job that panics is logged and the
//! looper keeps going.

use crate::error::RootServiceError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs callbacks somewhere. Connection callbacks are delivered through one of these.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs the job on the calling thread.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Returned by [`Looper::run_and_wait`] when the job never produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LooperError {
    #[error("looper has quit")]
    Quit,
    #[error("job panicked")]
    Panicked,
}

enum Message {
    Run(Job),
    Quit,
}

struct Shared {
    name: String,
    thread: ThreadId,
    tx: mpsc::UnboundedSender<Message>,
}

/// Handle to a looper thread. Clones share the same thread.
#[derive(Clone)]
pub struct Looper {
    shared: Arc<Shared>,
}

/// Drives a looper prepared on the current thread.
pub struct LoopRunner {
    looper: Looper,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl LoopRunner {
    /// Processes jobs until [`Looper::quit`] is called or every handle is dropped.
    pub fn run(mut self) {
        debug!(looper = %self.looper.shared.name, "Looper started");
        while let Some(message) = self.rx.blocking_recv() {
            match message {
                Message::Run(job) => {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(looper = %self.looper.shared.name, "Job panicked");
                    }
                }
                Message::Quit => break,
            }
        }
        debug!(looper = %self.looper.shared.name, "Looper stopped");
    }

    pub fn looper(&self) -> &Looper {
        &self.looper
    }
}

impl Looper {
    /// Makes the current thread a looper; call [`LoopRunner::run`] to start processing.
    pub fn prepare(name: &str) -> (Looper, LoopRunner) {
        let (tx, rx) = mpsc::unbounded_channel();
        let looper = Looper {
            shared: Arc::new(Shared {
                name: name.to_string(),
                thread: thread::current().id(),
                tx,
            }),
        };
        let runner = LoopRunner {
            looper: looper.clone(),
            rx,
        };
        (looper, runner)
    }

    /// Starts a dedicated looper thread.
    pub fn spawn(name: &str) -> std::io::Result<Looper> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let thread_name = name.to_string();
        thread::Builder::new().name(thread_name.clone()).spawn(move || {
            let (looper, runner) = Looper::prepare(&thread_name);
            if handle_tx.send(looper).is_ok() {
                runner.run();
            }
        })?;
        handle_rx
            .recv()
            .map_err(|_| std::io::Error::other("looper thread exited during startup"))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    pub fn enforce_current(&self) -> Result<(), RootServiceError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(RootServiceError::NotOnMainThread)
        }
    }

    /// Queues `f` behind everything already posted.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.tx.send(Message::Run(Box::new(f))).is_err() {
            trace!(looper = %self.shared.name, "Dropping job posted after quit");
        }
    }

    /// Runs `f` now if on the looper thread, otherwise posts it.
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            f();
        } else {
            self.post(f);
        }
    }

    /// Runs `f` on the looper and blocks until it returns.
    ///
    /// Must not be called from inside an async task.
    pub fn run_and_wait<F, R>(&self, f: F) -> Result<R, LooperError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return catch_unwind(AssertUnwindSafe(f)).map_err(|_| LooperError::Panicked);
        }
        let (tx, rx) = oneshot::channel();
        let job = move || {
            let _ = tx.send(f());
        };
        self.shared
            .tx
            .send(Message::Run(Box::new(job)))
            .map_err(|_| LooperError::Quit)?;
        // A panicking job drops the sender without a value.
        rx.blocking_recv().map_err(|_| LooperError::Panicked)
    }

    /// Stops the looper after the jobs already queued.
    pub fn quit(&self) {
        let _ = self.shared.tx.send(Message::Quit);
    }
}

impl Executor for Looper {
    fn execute(&self, job: Job) {
        self.post(job);
    }
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Looper").field("name", &self.shared.name).finish()
    }
}

//! Client side: the binding registry and the process-wide facade that drives launches.

mod registry;

pub use registry::{ServiceBindingRegistry, ServiceConnection, ServiceInfo};

use crate::broadcast::{BroadcastBus, SocketBus};
use crate::config::RuntimeConfig;
use crate::error::{LaunchError, Result};
use crate::handshake::{handshake_action, HandshakeReceiver, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::intent::Intent;
use crate::launcher::{LaunchAction, LaunchTask};
use crate::looper::{Executor, Looper};
use crate::queue::SerialTaskQueue;
use crate::shell::ShellRunner;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

pub type LaunchFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<(), LaunchError>> + Send + 'a>>;

/// Executes a launch task, normally by feeding it to an elevated shell.
pub trait TaskRunner: Send + Sync + 'static {
    fn run<'a>(&'a self, task: &'a LaunchTask) -> LaunchFuture<'a>;
}

impl TaskRunner for ShellRunner {
    fn run<'a>(&'a self, task: &'a LaunchTask) -> LaunchFuture<'a> {
        Box::pin(ShellRunner::run(self, task))
    }
}

/// How long queued launches wait for their handshake.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub handshake: Duration,
    /// A stop launch only answers if a daemon survived; don't hold the queue for long.
    pub stop: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
            stop: Duration::from_secs(5),
        }
    }
}

/// Process-wide client runtime: registry, launch queue, shell and handshake bus.
///
/// `bind`, `unbind` and `stop` must be called on the registry's looper.
pub struct RootServiceClient {
    registry: Arc<ServiceBindingRegistry>,
    queue: SerialTaskQueue,
    runner: Arc<dyn TaskRunner>,
    bus: Arc<dyn BroadcastBus>,
    timeouts: Timeouts,
}

impl RootServiceClient {
    pub fn new(
        registry: Arc<ServiceBindingRegistry>,
        runner: Arc<dyn TaskRunner>,
        bus: Arc<dyn BroadcastBus>,
        runtime: Handle,
        timeouts: Timeouts,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue: SerialTaskQueue::new(runtime),
            runner,
            bus,
            timeouts,
        })
    }

    /// Wires up the real shell runner and socket bus from configuration.
    pub fn from_config(config: &RuntimeConfig, looper: Looper, runtime: Handle) -> Result<Arc<Self>> {
        let launcher = config.launcher()?;
        let runner = ShellRunner::for_elevation(config.elevation).with_timeout(config.shell_timeout());
        let bus = SocketBus::new(config.broadcast_dir(), runtime.clone());
        let timeouts = Timeouts {
            handshake: config.handshake_timeout(),
            stop: config.stop_timeout(),
        };
        info!(package = %launcher.package, elevation = ?config.elevation, "Root service client ready");
        Ok(Self::new(
            ServiceBindingRegistry::new(launcher, looper),
            Arc::new(runner),
            Arc::new(bus),
            runtime,
            timeouts,
        ))
    }

    pub fn registry(&self) -> &Arc<ServiceBindingRegistry> {
        &self.registry
    }

    pub fn looper(&self) -> &Looper {
        self.registry.looper()
    }

    /// Binds `conn`, launching a host if needed. Callbacks go through `executor`.
    pub fn bind(
        &self,
        intent: &Intent,
        executor: Arc<dyn Executor>,
        conn: Arc<dyn ServiceConnection>,
    ) -> Result<()> {
        if let Some(task) = self.registry.bind(intent, executor, conn)? {
            self.schedule(task);
        }
        Ok(())
    }

    /// Like [`bind`](Self::bind) with callbacks delivered on the main looper.
    pub fn bind_on_main(&self, intent: &Intent, conn: Arc<dyn ServiceConnection>) -> Result<()> {
        let executor: Arc<dyn Executor> = Arc::new(self.looper().clone());
        self.bind(intent, executor, conn)
    }

    pub fn unbind(&self, conn: &Arc<dyn ServiceConnection>) -> Result<()> {
        self.registry.unbind(conn)
    }

    pub fn stop(&self, intent: &Intent) -> Result<()> {
        if let Some(task) = self.registry.stop(intent)? {
            self.schedule(task);
        }
        Ok(())
    }

    /// Waits until every launch queued so far has run.
    ///
    /// Their results are posted to the looper and may still be pending there.
    pub async fn flush(&self) -> std::result::Result<(), LaunchError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue.submit(async move {
            let _ = tx.send(());
        })?;
        rx.await.map_err(|_| LaunchError::QueueShutdown)
    }

    /// Drops queued launches. Binds waiting on them never complete.
    pub fn shutdown(&self) {
        let dropped = self.queue.shutdown_now();
        debug!(dropped = dropped.len(), "Client shut down");
    }

    /// Queues: register for the handshake, run the shell, wait, report on the looper.
    fn schedule(&self, task: LaunchTask) {
        let registry = Arc::clone(&self.registry);
        let runner = Arc::clone(&self.runner);
        let bus = Arc::clone(&self.bus);
        let daemon = task.is_daemon();
        let stopping = task.action() == LaunchAction::StopServer;
        let timeout = if stopping {
            self.timeouts.stop
        } else {
            self.timeouts.handshake
        };

        let job = async move {
            let action = handshake_action(task.component(), daemon);
            let result = async {
                let receiver = HandshakeReceiver::register(bus.as_ref(), action)
                    .map_err(LaunchError::Connect)?;
                runner.run(&task).await?;
                receiver.wait(timeout).await
            }
            .await;

            let looper = registry.looper().clone();
            looper.post(move || {
                let reported = match result {
                    Ok(handshake) => registry.on_handshake(handshake),
                    Err(LaunchError::Timeout(_)) if stopping => {
                        debug!(component = %task.component(), "No daemon answered the stop");
                        Ok(())
                    }
                    Err(e) if stopping => {
                        warn!(component = %task.component(), error = %e, "Stop launch failed");
                        Ok(())
                    }
                    Err(e) => registry.on_launch_failed(daemon, &e),
                };
                if let Err(e) = reported {
                    warn!(error = %e, "Could not report launch result");
                }
            });
        };

        if let Err(e) = self.queue.submit(job) {
            warn!(error = %e, "Launch rejected");
            if !stopping {
                if let Err(e) = self.registry.on_launch_failed(daemon, &e) {
                    warn!(error = %e, "Could not report launch rejection");
                }
            }
        }
    }
}

//! Client-side table of bound services.
//!
//! Many local connections share one remote capability per [`ServiceKey`]. Binds that
//! arrive before a host is running are parked and replayed once its handshake arrives.
//! Every entry point must be called on the main looper; state is never touched elsewhere.

use crate::binder::Binder;
use crate::death::{DeathHandler, DeathWatcher};
use crate::error::{LaunchError, Result, RootServiceError};
use crate::handshake::Handshake;
use crate::intent::{ComponentName, Intent, ServiceKey};
use crate::launcher::{LaunchAction, LaunchTask, Launcher};
use crate::looper::{Executor, Looper};
use crate::manager::{ManagerProxy, Messenger, MessengerStub};
use crate::protocol::MessengerMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Callbacks for one logical binding. Delivered through the executor given to `bind`.
pub trait ServiceConnection: Send + Sync + 'static {
    fn on_service_connected(&self, name: &ComponentName, service: Binder);

    fn on_service_disconnected(&self, name: &ComponentName);

    /// The service's bind hook returned nothing.
    fn on_null_binding(&self, _name: &ComponentName) {}

    /// The host never came up. The bind is dropped; bind again to retry.
    fn on_bind_failed(&self, _name: &ComponentName, _error: &LaunchError) {}
}

/// Identity of a connection: the address of its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnKey(usize);

impl ConnKey {
    fn of(conn: &Arc<dyn ServiceConnection>) -> Self {
        ConnKey(Arc::as_ptr(conn) as *const () as usize)
    }
}

struct RemoteProcess {
    id: u64,
    daemon: bool,
    manager: ManagerProxy,
    watcher: Arc<DeathWatcher>,
    _death: Arc<ProcessDeath>,
}

struct RemoteServiceRecord {
    binder: Binder,
    process: u64,
    ref_count: usize,
}

struct ConnectionRecord {
    key: ServiceKey,
    conn: Arc<dyn ServiceConnection>,
    executor: Arc<dyn Executor>,
}

struct PendingTask {
    intent: Intent,
    key: ServiceKey,
    conn: Arc<dyn ServiceConnection>,
    executor: Arc<dyn Executor>,
}

#[derive(Default)]
struct State {
    remote: Option<Arc<RemoteProcess>>,
    daemon: Option<Arc<RemoteProcess>>,
    remote_en_route: bool,
    daemon_en_route: bool,
    pending: Vec<PendingTask>,
    services: HashMap<ServiceKey, RemoteServiceRecord>,
    connections: HashMap<ConnKey, ConnectionRecord>,
}

impl State {
    fn slot(&self, daemon: bool) -> &Option<Arc<RemoteProcess>> {
        if daemon {
            &self.daemon
        } else {
            &self.remote
        }
    }

    fn slot_mut(&mut self, daemon: bool) -> &mut Option<Arc<RemoteProcess>> {
        if daemon {
            &mut self.daemon
        } else {
            &mut self.remote
        }
    }

    fn en_route_mut(&mut self, daemon: bool) -> &mut bool {
        if daemon {
            &mut self.daemon_en_route
        } else {
            &mut self.remote_en_route
        }
    }

    /// Removes every connection bound to `key` and returns them for notification.
    fn take_connections(&mut self, key: &ServiceKey) -> Vec<ConnectionRecord> {
        let keys: Vec<ConnKey> = self
            .connections
            .iter()
            .filter(|(_, record)| record.key == *key)
            .map(|(k, _)| *k)
            .collect();
        keys.iter()
            .filter_map(|k| self.connections.remove(k))
            .collect()
    }
}

fn notify_disconnected(records: Vec<ConnectionRecord>) {
    for record in records {
        let ConnectionRecord { key, conn, executor } = record;
        executor.execute(Box::new(move || conn.on_service_disconnected(&key.component)));
    }
}

/// Snapshot of one cached service, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub key: ServiceKey,
    pub ref_count: usize,
}

pub struct ServiceBindingRegistry {
    package: String,
    looper: Looper,
    launcher: Launcher,
    state: Mutex<State>,
    next_process: AtomicU64,
    this: Weak<ServiceBindingRegistry>,
}

impl ServiceBindingRegistry {
    pub fn new(launcher: Launcher, looper: Looper) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            package: launcher.package.clone(),
            looper,
            launcher,
            state: Mutex::new(State::default()),
            next_process: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn looper(&self) -> &Looper {
        &self.looper
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `conn` to the service named by `intent`.
    ///
    /// Returns a launch task when a host has to be started first; the caller runs it and
    /// reports the handshake (or failure) back. At most one task is handed out per process
    /// flavor until that happens.
    pub fn bind(
        &self,
        intent: &Intent,
        executor: Arc<dyn Executor>,
        conn: Arc<dyn ServiceConnection>,
    ) -> Result<Option<LaunchTask>> {
        self.looper.enforce_current()?;
        let key = ServiceKey::from_intent(intent, &self.package)?;
        let ckey = ConnKey::of(&conn);
        {
            let state = self.state();
            let pending = state.pending.iter().any(|t| ConnKey::of(&t.conn) == ckey);
            if let Some(record) = state.connections.get(&ckey) {
                return Err(RootServiceError::ConnectionInUse(record.key.to_string()));
            }
            if pending {
                return Err(RootServiceError::ConnectionInUse(key.to_string()));
            }
        }

        let task = PendingTask {
            intent: intent.clone(),
            key,
            conn,
            executor,
        };
        let Err(task) = self.try_bind(task) else {
            return Ok(None);
        };

        let daemon = task.key.daemon;
        let component = task.key.component.clone();
        let mut state = self.state();
        state.pending.push(task);
        let en_route = state.en_route_mut(daemon);
        if *en_route {
            debug!(%component, daemon, "Launch already in flight; bind parked");
            return Ok(None);
        }
        *en_route = true;
        info!(%component, daemon, "Launching privileged process");
        Ok(Some(self.launcher.task(&component, LaunchAction::start(daemon))))
    }

    /// Resolves `task` against the cache or a live process. Hands the task back if no
    /// process is available.
    fn try_bind(&self, task: PendingTask) -> std::result::Result<(), PendingTask> {
        let ckey = ConnKey::of(&task.conn);
        let mut state = self.state();
        if let Some(record) = state.services.get_mut(&task.key) {
            record.ref_count += 1;
            let binder = record.binder.clone();
            debug!(key = %task.key, refs = record.ref_count, "Reusing bound service");
            state.connections.insert(
                ckey,
                ConnectionRecord {
                    key: task.key.clone(),
                    conn: Arc::clone(&task.conn),
                    executor: Arc::clone(&task.executor),
                },
            );
            drop(state);
            Self::deliver_connected(&task, binder);
            return Ok(());
        }

        let Some(process) = state.slot(task.key.daemon).clone() else {
            return Err(task);
        };
        drop(state);

        match process.manager.bind(&task.intent) {
            Ok(Some(binder)) => {
                let mut state = self.state();
                state.services.insert(
                    task.key.clone(),
                    RemoteServiceRecord {
                        binder: binder.clone(),
                        process: process.id,
                        ref_count: 1,
                    },
                );
                state.connections.insert(
                    ckey,
                    ConnectionRecord {
                        key: task.key.clone(),
                        conn: Arc::clone(&task.conn),
                        executor: Arc::clone(&task.executor),
                    },
                );
                drop(state);
                info!(key = %task.key, "Service bound");
                Self::deliver_connected(&task, binder);
                Ok(())
            }
            Ok(None) => {
                debug!(key = %task.key, "Null binding");
                let name = task.key.component.clone();
                let conn = Arc::clone(&task.conn);
                task.executor
                    .execute(Box::new(move || conn.on_null_binding(&name)));
                Ok(())
            }
            Err(e) => {
                warn!(key = %task.key, error = %e, "Remote bind failed; dropping process");
                self.process_died(process.daemon, process.id);
                Err(task)
            }
        }
    }

    fn deliver_connected(task: &PendingTask, binder: Binder) {
        let name = task.key.component.clone();
        let conn = Arc::clone(&task.conn);
        task.executor
            .execute(Box::new(move || conn.on_service_connected(&name, binder)));
    }

    /// A host answered. Connects to it and replays the parked binds for its flavor.
    pub fn on_handshake(&self, handshake: Handshake) -> Result<()> {
        self.looper.enforce_current()?;
        let daemon = handshake.is_daemon;
        let manager = ManagerProxy::new(handshake.manager);

        let messenger = Binder::new(MessengerStub(LivenessMessenger {
            registry: self.this.clone(),
            looper: self.looper.clone(),
        }));
        if let Err(e) = manager.connect(messenger) {
            warn!(daemon, error = %e, "Could not connect to privileged process");
            self.on_launch_failed(daemon, &LaunchError::Connect(e))?;
            return Ok(());
        }

        let id = self.next_process.fetch_add(1, Ordering::Relaxed);
        let death = Arc::new(ProcessDeath {
            registry: self.this.clone(),
            id,
            daemon,
        });
        let handler = Arc::downgrade(&death) as Weak<dyn DeathHandler>;
        let watcher = match DeathWatcher::watch(manager.binder().clone(), self.looper.clone(), handler) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(daemon, error = %e, "Privileged process died during handshake");
                self.on_launch_failed(daemon, &LaunchError::Connect(e))?;
                return Ok(());
            }
        };

        let tasks = {
            let mut state = self.state();
            let occupied = state
                .slot(daemon)
                .as_ref()
                .filter(|p| p.manager.binder().is_alive())
                .map(|p| p.manager.binder().same_object(manager.binder()));
            if let Some(same) = occupied {
                if same {
                    debug!(daemon, "Handshake from already connected process");
                } else {
                    // A second host for the same slot; keep the one we already use.
                    warn!(daemon, "Ignoring handshake from a second privileged process");
                }
                watcher.release();
                *state.en_route_mut(daemon) = false;
                std::mem::take(&mut state.pending)
            } else {
                *state.slot_mut(daemon) = Some(Arc::new(RemoteProcess {
                    id,
                    daemon,
                    manager,
                    watcher,
                    _death: death,
                }));
                *state.en_route_mut(daemon) = false;
                info!(daemon, process = id, "Privileged process connected");
                std::mem::take(&mut state.pending)
            }
        };
        self.replay(tasks, daemon);
        Ok(())
    }

    /// Replays parked binds in order; ones that still cannot complete stay parked.
    fn replay(&self, tasks: Vec<PendingTask>, daemon: bool) {
        let mut kept = Vec::new();
        for task in tasks {
            if task.key.daemon != daemon {
                kept.push(task);
                continue;
            }
            if let Err(task) = self.try_bind(task) {
                debug!(key = %task.key, "Bind still pending after handshake");
                kept.push(task);
            }
        }
        let mut state = self.state();
        kept.append(&mut state.pending);
        state.pending = kept;
    }

    /// The launch for this flavor failed or timed out. Parked binds are dropped.
    pub fn on_launch_failed(&self, daemon: bool, error: &LaunchError) -> Result<()> {
        self.looper.enforce_current()?;
        let failed: Vec<PendingTask> = {
            let mut state = self.state();
            *state.en_route_mut(daemon) = false;
            let (failed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|t| t.key.daemon == daemon);
            state.pending = kept;
            failed
        };
        warn!(daemon, error = %error, dropped = failed.len(), "Privileged process launch failed");
        for task in failed {
            let name = task.key.component.clone();
            let conn = task.conn;
            let error = error.clone();
            task.executor
                .execute(Box::new(move || conn.on_bind_failed(&name, &error)));
        }
        Ok(())
    }

    /// Drops `conn`'s binding. The last reference also unbinds remotely.
    pub fn unbind(&self, conn: &Arc<dyn ServiceConnection>) -> Result<()> {
        self.looper.enforce_current()?;
        let ckey = ConnKey::of(conn);
        let mut state = self.state();

        let Some(record) = state.connections.remove(&ckey) else {
            let before = state.pending.len();
            state.pending.retain(|t| ConnKey::of(&t.conn) != ckey);
            if state.pending.len() != before {
                debug!("Cancelled pending bind");
            }
            return Ok(());
        };

        let key = record.key.clone();
        let mut remote_unbind = None;
        if let Some(service) = state.services.get_mut(&key) {
            service.ref_count -= 1;
            debug!(%key, refs = service.ref_count, "Unbound connection");
            if service.ref_count == 0 {
                let process = service.process;
                state.services.remove(&key);
                remote_unbind = [state.remote.as_ref(), state.daemon.as_ref()]
                    .into_iter()
                    .flatten()
                    .find(|p| p.id == process)
                    .map(|p| p.manager.clone());
            }
        }
        drop(state);

        notify_disconnected(vec![record]);
        if let Some(manager) = remote_unbind {
            info!(%key, "Last connection gone; unbinding remotely");
            if let Err(e) = manager.unbind(&key.component) {
                warn!(%key, error = %e, "Remote unbind failed");
            }
        }
        Ok(())
    }

    /// Stops the service named by `intent`.
    ///
    /// With no live daemon, returns a task that starts a process only to stop an orphaned one.
    pub fn stop(&self, intent: &Intent) -> Result<Option<LaunchTask>> {
        self.looper.enforce_current()?;
        let key = ServiceKey::from_intent(intent, &self.package)?;
        let process = self.state().slot(key.daemon).clone();
        let Some(process) = process else {
            if key.daemon {
                info!(%key, "No live daemon; launching stop");
                return Ok(Some(self.launcher.task(&key.component, LaunchAction::StopServer)));
            }
            return Ok(None);
        };

        self.stop_internal(&key);
        if let Err(e) = process.manager.stop(&key.component, -1, None) {
            warn!(%key, error = %e, "Remote stop failed");
        }
        Ok(None)
    }

    fn stop_internal(&self, key: &ServiceKey) {
        let records = {
            let mut state = self.state();
            if state.services.remove(key).is_none() {
                return;
            }
            state.take_connections(key)
        };
        info!(%key, connections = records.len(), "Service stopped");
        notify_disconnected(records);
    }

    fn on_service_stopped(&self, component: ComponentName, daemon: bool) {
        if self.looper.enforce_current().is_err() {
            return;
        }
        self.stop_internal(&ServiceKey::new(component, daemon));
    }

    /// Clears the slot if it still holds process `id`, and drops its services.
    fn process_died(&self, daemon: bool, id: u64) {
        let (process, records) = {
            let mut state = self.state();
            let slot = state.slot_mut(daemon);
            let process = match slot.take() {
                Some(p) if p.id == id => p,
                other => {
                    *slot = other;
                    return;
                }
            };
            let keys: Vec<ServiceKey> = state
                .services
                .iter()
                .filter(|(_, s)| s.process == id)
                .map(|(k, _)| k.clone())
                .collect();
            let mut records = Vec::new();
            for key in &keys {
                state.services.remove(key);
                records.extend(state.take_connections(key));
            }
            (process, records)
        };
        process.watcher.release();
        warn!(daemon, process = id, disconnected = records.len(), "Privileged process died");
        notify_disconnected(records);
    }

    pub fn is_connected(&self, daemon: bool) -> bool {
        self.state().slot(daemon).is_some()
    }

    pub fn is_launch_pending(&self, daemon: bool) -> bool {
        let state = self.state();
        if daemon {
            state.daemon_en_route
        } else {
            state.remote_en_route
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.state()
            .services
            .iter()
            .map(|(key, record)| ServiceInfo {
                key: key.clone(),
                ref_count: record.ref_count,
            })
            .collect()
    }

    pub fn ref_count(&self, key: &ServiceKey) -> Option<usize> {
        self.state().services.get(key).map(|r| r.ref_count)
    }
}

struct ProcessDeath {
    registry: Weak<ServiceBindingRegistry>,
    id: u64,
    daemon: bool,
}

impl DeathHandler for ProcessDeath {
    fn on_binder_died(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.process_died(self.daemon, self.id);
        }
    }
}

/// Receives `ServiceStopped` from hosts and hands it to the looper.
struct LivenessMessenger {
    registry: Weak<ServiceBindingRegistry>,
    looper: Looper,
}

impl Messenger for LivenessMessenger {
    fn on_message(&self, message: MessengerMessage) {
        let MessengerMessage::ServiceStopped { component, daemon } = message;
        let registry = self.registry.clone();
        self.looper.post(move || {
            if let Some(registry) = registry.upgrade() {
                registry.on_service_stopped(component, daemon);
            }
        });
    }
}

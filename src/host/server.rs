//! The privileged side: owns service containers and the clients that use them.
//!
//! Every table lives behind `state`, which only the host looper locks. Manager calls arrive
//! on transport threads and hop onto the looper with `run_and_wait`, so a bind reply is
//! only sent after the service has produced its capability. Service hooks run on the
//! looper too, with the lock released.

use super::observer::CodePathObserver;
use crate::binder::Binder;
use crate::broadcast::BroadcastBus;
use crate::death::{DeathHandler, DeathWatcher};
use crate::env;
use crate::error::{ChannelError, HostError};
use crate::handshake::handshake_action;
use crate::intent::{ComponentName, Intent};
use crate::looper::Looper;
use crate::manager::{Manager, ManagerProxy, ManagerStub, MessengerProxy};
use crate::protocol::{BroadcastAddress, MessengerMessage};
use crate::service::{RootService, ServiceContext, ServiceControl, ServiceFactoryRegistry};
use crate::transport::Connection;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

/// How long an on-demand host waits for its first client.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why the host stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The last service was destroyed
    NoActiveServices,
    /// The package's code image changed on disk
    PackageUpdated,
    /// No client connected in time
    IdleTimeout,
}

#[derive(Debug, Clone)]
pub struct HostOptions {
    pub package: String,
    pub daemon: bool,
    /// Where a daemon host registers its manager socket
    pub service_dir: PathBuf,
    /// Code image to watch for package updates
    pub code_path: Option<PathBuf>,
    pub idle_timeout: Duration,
    pub code_check_interval: Duration,
}

impl HostOptions {
    /// Options resolved from the environment the launcher set up.
    pub fn from_env(package: impl Into<String>, daemon: bool) -> Self {
        Self {
            package: package.into(),
            daemon,
            service_dir: env::service_dir(),
            code_path: env::code_path(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            code_check_interval: Duration::from_secs(2),
        }
    }
}

/// `<service_dir>/<package>.daemon.sock`
pub fn daemon_socket_path(service_dir: &Path, package: &str) -> PathBuf {
    service_dir.join(format!("{package}.daemon.sock"))
}

/// The manager of a daemon already registered for `package`, if one answers.
pub async fn connect_daemon(service_dir: &Path, package: &str) -> Option<ManagerProxy> {
    let path = daemon_socket_path(service_dir, package);
    if !path.exists() {
        return None;
    }
    match Connection::connect(&path, None).await {
        Ok(conn) => conn.root().ok().map(ManagerProxy::new),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Stale daemon socket");
            None
        }
    }
}

struct ServiceContainer {
    /// `None` only while one of its hooks is running.
    service: Option<Box<dyn RootService>>,
    users: BTreeSet<u32>,
    /// Filtered intent of the first bind; set once bound.
    intent: Option<Intent>,
    binder: Option<Binder>,
    rebind: bool,
}

struct ClientProcess {
    messenger: MessengerProxy,
    _watcher: Arc<DeathWatcher>,
    _death: Arc<ClientDeath>,
}

#[derive(Default)]
struct HostState {
    services: HashMap<ComponentName, ServiceContainer>,
    clients: HashMap<u32, ClientProcess>,
}

struct DaemonSocket {
    path: PathBuf,
    task: AbortHandle,
}

impl Drop for DaemonSocket {
    fn drop(&mut self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            trace!(path = %self.path.display(), error = %e, "Daemon socket already gone");
        }
    }
}

/// Background work that any thread may cancel.
#[derive(Default)]
struct Tasks {
    idle: Option<AbortHandle>,
    observer: Option<AbortHandle>,
    daemon: Option<DaemonSocket>,
}

/// The runtime object of a privileged process.
pub struct RootServiceHost {
    this: Weak<Self>,
    options: HostOptions,
    looper: Looper,
    runtime: Handle,
    factories: ServiceFactoryRegistry,
    bus: Arc<dyn BroadcastBus>,
    manager: Binder,
    state: Mutex<HostState>,
    tasks: Mutex<Tasks>,
    exit: watch::Sender<Option<ExitReason>>,
}

impl RootServiceHost {
    pub fn new(
        options: HostOptions,
        looper: Looper,
        runtime: Handle,
        factories: ServiceFactoryRegistry,
        bus: Arc<dyn BroadcastBus>,
    ) -> Arc<Self> {
        let (exit, _) = watch::channel(None);
        Arc::new_cyclic(|this: &Weak<Self>| Self {
            this: this.clone(),
            manager: Binder::new(ManagerStub(HostManager(this.clone()))),
            options,
            looper,
            runtime,
            factories,
            bus,
            state: Mutex::new(HostState::default()),
            tasks: Mutex::new(Tasks::default()),
            exit,
        })
    }

    /// The capability handed to clients.
    pub fn manager(&self) -> &Binder {
        &self.manager
    }

    pub fn looper(&self) -> &Looper {
        &self.looper
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    pub fn is_daemon(&self) -> bool {
        self.options.daemon
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn strong(&self) -> Result<Arc<Self>, HostError> {
        self.this.upgrade().ok_or(HostError::LooperGone)
    }

    /// Brings the host up for `component`: creates it eagerly, registers the daemon
    /// socket (daemon hosts), arms the idle exit (on-demand hosts) and hands the manager
    /// to `uid`.
    ///
    /// Blocks on the looper; must not be called from an async task.
    pub fn start(&self, component: &ComponentName, uid: u32) -> Result<(), HostError> {
        let host = self.strong()?;
        if self.options.daemon {
            self.clear_daemon_socket()?;
        }
        let target = component.clone();
        self.looper
            .run_and_wait(move || host.create_service(&target))
            .map_err(|_| HostError::LooperGone)??;

        if self.options.daemon {
            self.register_daemon()?;
        } else {
            self.start_idle_timer();
        }
        self.watch_code_path();

        let address = self.bus.address(&handshake_action(component, self.options.daemon));
        if let Err(e) = self.broadcast_to(uid, &address) {
            warn!(%component, uid, error = %e, "Initial handshake failed");
        }
        info!(
            %component,
            uid,
            daemon = self.options.daemon,
            pid = env::current_pid(),
            "Root service host started"
        );
        Ok(())
    }

    /// Resolves once the host decided to exit.
    pub async fn exited(&self) -> ExitReason {
        let mut rx = self.exit.subscribe();
        let reason = rx.wait_for(Option::is_some).await.ok().and_then(|r| *r);
        reason.unwrap_or(ExitReason::NoActiveServices)
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        *self.exit.borrow()
    }

    /// Cancels background work and removes the daemon socket.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks();
        if let Some(idle) = tasks.idle.take() {
            idle.abort();
        }
        if let Some(observer) = tasks.observer.take() {
            observer.abort();
        }
        tasks.daemon = None;
        debug!("Host background tasks stopped");
    }

    /// Hosted components, read on the looper.
    pub fn active_services(&self) -> Vec<ComponentName> {
        let Some(host) = self.this.upgrade() else {
            return Vec::new();
        };
        self.looper
            .run_and_wait(move || host.lock().services.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Uids bound to `component`, read on the looper.
    pub fn users(&self, component: &ComponentName) -> Option<Vec<u32>> {
        let host = self.this.upgrade()?;
        let component = component.clone();
        self.looper
            .run_and_wait(move || {
                host.lock()
                    .services
                    .get(&component)
                    .map(|c| c.users.iter().copied().collect())
            })
            .ok()
            .flatten()
    }

    fn exit(&self, reason: ExitReason) {
        let first = self.exit.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            info!(?reason, "Host exiting");
        }
    }

    /// Exits when nothing is hosted any more. Returns true if it did.
    fn exit_if_empty(&self) -> bool {
        let empty = self.lock().services.is_empty();
        if empty {
            self.exit(ExitReason::NoActiveServices);
        }
        empty
    }

    fn broadcast_to(&self, uid: u32, address: &BroadcastAddress) -> Result<(), ChannelError> {
        debug!(uid, action = %address.action, "Sending manager");
        self.bus.send(address, &self.manager, self.options.daemon, uid)
    }

    fn start_idle_timer(&self) {
        let host = self.this.clone();
        let looper = self.looper.clone();
        let timeout = self.options.idle_timeout;
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            looper.post(move || {
                if let Some(host) = host.upgrade() {
                    host.on_idle_timeout();
                }
            });
        });
        if let Some(previous) = self.tasks().idle.replace(task.abort_handle()) {
            previous.abort();
        }
        trace!(?timeout, "Idle exit armed");
    }

    fn cancel_idle_timer(&self) {
        if let Some(idle) = self.tasks().idle.take() {
            idle.abort();
            trace!("Idle exit cancelled");
        }
    }

    fn on_idle_timeout(&self) {
        if self.lock().clients.is_empty() {
            info!(timeout = ?self.options.idle_timeout, "No client connected");
            self.exit(ExitReason::IdleTimeout);
        }
    }

    fn watch_code_path(&self) {
        let Some(path) = self.options.code_path.clone() else {
            debug!("No code path to watch");
            return;
        };
        let host = self.this.clone();
        let looper = self.looper.clone();
        let handle = CodePathObserver::new(path)
            .with_interval(self.options.code_check_interval)
            .spawn(&self.runtime, move || {
                looper.post(move || {
                    if let Some(host) = host.upgrade() {
                        host.on_package_updated();
                    }
                });
            });
        if let Some(previous) = self.tasks().observer.replace(handle) {
            previous.abort();
        }
    }

    /// Removes a socket left behind by a dead daemon. Fails if a daemon still
    /// accepts on it.
    fn clear_daemon_socket(&self) -> Result<(), HostError> {
        let path = daemon_socket_path(&self.options.service_dir, &self.options.package);
        if !path.exists() {
            return Ok(());
        }
        if std::os::unix::net::UnixStream::connect(&path).is_ok() {
            return Err(HostError::DaemonRunning(path));
        }
        debug!(path = %path.display(), "Removing stale daemon socket");
        std::fs::remove_file(&path)?;
        Ok(())
    }

    fn register_daemon(&self) -> Result<(), HostError> {
        use std::os::unix::fs::PermissionsExt;

        std::fs::create_dir_all(&self.options.service_dir)?;
        let path = daemon_socket_path(&self.options.service_dir, &self.options.package);
        let listener = {
            let _guard = self.runtime.enter();
            UnixListener::bind(&path)?
        };
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;
        let task = self
            .runtime
            .spawn(serve_daemon(listener, self.manager.clone()));
        info!(path = %path.display(), "Daemon manager registered");
        self.tasks().daemon = Some(DaemonSocket {
            path,
            task: task.abort_handle(),
        });
        Ok(())
    }

    /// Instantiates `component` unless it is already hosted. Runs on the looper.
    fn create_service(&self, component: &ComponentName) -> Result<(), HostError> {
        if self.lock().services.contains_key(component) {
            return Ok(());
        }
        let mut service = self.factories.create(component)?;
        let control: Weak<dyn ServiceControl> = self.this.clone();
        let context = ServiceContext::new(
            component.clone(),
            self.options.daemon,
            self.looper.clone(),
            control,
        );
        self.lock().services.insert(
            component.clone(),
            ServiceContainer {
                service: None,
                users: BTreeSet::new(),
                intent: None,
                binder: None,
                rebind: false,
            },
        );
        service.on_create(&context);
        if let Some(container) = self.lock().services.get_mut(component) {
            container.service = Some(service);
        }
        info!(%component, "Service created");
        Ok(())
    }

    fn connect_internal(&self, caller: u32, messenger: Binder) {
        if self.lock().clients.contains_key(&caller) {
            trace!(caller, "Client already connected");
            return;
        }
        let death = Arc::new(ClientDeath {
            host: self.this.clone(),
            uid: caller,
        });
        let handler = Arc::downgrade(&death) as Weak<dyn DeathHandler>;
        let watcher = match DeathWatcher::watch(messenger.clone(), self.looper.clone(), handler) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(caller, error = %e, "Client died before connecting");
                return;
            }
        };
        self.lock().clients.insert(
            caller,
            ClientProcess {
                messenger: MessengerProxy::new(messenger),
                _watcher: watcher,
                _death: death,
            },
        );
        self.cancel_idle_timer();
        info!(caller, "Client connected");
    }

    fn bind_internal(&self, caller: u32, intent: Intent) -> Option<Binder> {
        let Some(component) = intent.component.clone() else {
            warn!(caller, "Bind without a component");
            return None;
        };
        if component.package != self.options.package {
            warn!(caller, %component, package = %self.options.package, "Bind for a foreign package");
            return None;
        }
        if !self.lock().clients.contains_key(&caller) {
            warn!(caller, %component, "Bind from a client that never connected");
            return None;
        }
        if let Err(e) = self.create_service(&component) {
            error!(%component, error = %e, "Service could not be created");
            return None;
        }

        let (mut service, captured, rebind) = {
            let mut state = self.lock();
            let container = state.services.get_mut(&component)?;
            let Some(service) = container.service.take() else {
                warn!(%component, "Service is busy in a lifecycle hook");
                return None;
            };
            // A null binding is not kept, so the next bind asks the service again.
            let captured = container.binder.as_ref().and(container.intent.clone());
            (service, captured, container.rebind)
        };

        let first = match &captured {
            None => Some((service.on_bind(&intent), intent.clone_filter())),
            Some(previous) => {
                if rebind {
                    service.on_rebind(previous);
                }
                None
            }
        };

        let mut state = self.lock();
        let container = state.services.get_mut(&component)?;
        container.service = Some(service);
        if let Some((binder, filtered)) = first {
            container.binder = binder;
            container.intent = Some(filtered);
        }
        container.rebind = false;
        container.users.insert(caller);
        debug!(caller, %component, users = container.users.len(), "Bound");
        container.binder.clone()
    }

    /// Drops `uid` from `component`, or everyone when `uid` is `None` (forced).
    ///
    /// Returns the users that lost the container to a forced teardown.
    fn teardown(&self, component: &ComponentName, uid: Option<u32>) -> Vec<u32> {
        let (mut service, intent, had_users, displaced) = {
            let mut state = self.lock();
            let Some(container) = state.services.get_mut(component) else {
                return Vec::new();
            };
            let had_users = !container.users.is_empty();
            let displaced = match uid {
                Some(uid) => {
                    if !container.users.remove(&uid) || !container.users.is_empty() {
                        return Vec::new();
                    }
                    Vec::new()
                }
                None => std::mem::take(&mut container.users).into_iter().collect(),
            };
            let Some(service) = container.service.take() else {
                warn!(%component, "Teardown while a lifecycle hook is running");
                return displaced;
            };
            (service, container.intent.clone(), had_users, displaced)
        };

        // A retained daemon service already saw its unbind when the last user left.
        let retained = had_users && intent.as_ref().is_some_and(|i| service.on_unbind(i));
        let force = uid.is_none();
        if force || !self.options.daemon || !retained {
            service.on_destroy();
            self.lock().services.remove(component);
            info!(%component, force, "Service destroyed");
        } else {
            let mut state = self.lock();
            if let Some(container) = state.services.get_mut(component) {
                container.service = Some(service);
                container.rebind = true;
            }
            debug!(%component, "Service retained by daemon");
        }
        displaced
    }

    fn notify_stopped(&self, component: &ComponentName, uids: impl IntoIterator<Item = u32>) {
        let messengers: Vec<(u32, MessengerProxy)> = {
            let state = self.lock();
            uids.into_iter()
                .filter_map(|uid| state.clients.get(&uid).map(|c| (uid, c.messenger.clone())))
                .collect()
        };
        let message = MessengerMessage::ServiceStopped {
            component: component.clone(),
            daemon: self.options.daemon,
        };
        for (uid, messenger) in messengers {
            if let Err(e) = messenger.send(&message) {
                debug!(uid, %component, error = %e, "Could not notify client");
            }
        }
    }

    fn unbind_internal(&self, caller: u32, component: &ComponentName) {
        debug!(caller, %component, "Unbind");
        self.teardown(component, Some(caller));
        self.exit_if_empty();
    }

    fn stop_internal(&self, caller: u32, component: &ComponentName, uid: i32, reply_to: Option<BroadcastAddress>) {
        let target = u32::try_from(uid)
            .ok()
            .filter(|_| caller == 0)
            .unwrap_or(caller);
        info!(caller, target, %component, "Stop");
        let displaced = self.teardown(component, None);
        self.notify_stopped(component, displaced.into_iter().filter(|u| *u != target));
        if self.exit_if_empty() {
            return;
        }
        if let Some(address) = reply_to {
            if let Err(e) = self.broadcast_to(target, &address) {
                warn!(target, error = %e, "Re-broadcast after stop failed");
            }
        }
    }

    fn broadcast_internal(&self, caller: u32, uid: u32, reply_to: BroadcastAddress) {
        let target = if caller == 0 { uid } else { caller };
        if let Err(e) = self.broadcast_to(target, &reply_to) {
            warn!(target, error = %e, "Broadcast failed");
        }
    }

    fn on_client_died(&self, uid: u32) {
        let components: Vec<ComponentName> = {
            let mut state = self.lock();
            if state.clients.remove(&uid).is_none() {
                return;
            }
            state
                .services
                .iter()
                .filter(|(_, c)| c.users.contains(&uid))
                .map(|(name, _)| name.clone())
                .collect()
        };
        info!(uid, services = components.len(), "Client died");
        for component in &components {
            self.teardown(component, Some(uid));
        }
        if self.exit_if_empty() {
            return;
        }
        if !self.options.daemon && self.lock().clients.is_empty() {
            self.start_idle_timer();
        }
    }

    fn on_package_updated(&self) {
        let components: Vec<ComponentName> = self.lock().services.keys().cloned().collect();
        warn!(services = components.len(), "Package code changed; stopping everything");
        for component in &components {
            self.teardown(component, None);
        }
        self.exit(ExitReason::PackageUpdated);
    }
}

impl ServiceControl for RootServiceHost {
    fn stop_service(&self, component: &ComponentName) {
        if !self.lock().services.contains_key(component) {
            return;
        }
        debug!(%component, "Service stopped itself");
        let displaced = self.teardown(component, None);
        self.notify_stopped(component, displaced);
        self.exit_if_empty();
    }
}

struct ClientDeath {
    host: Weak<RootServiceHost>,
    uid: u32,
}

impl DeathHandler for ClientDeath {
    fn on_binder_died(&self) {
        if let Some(host) = self.host.upgrade() {
            host.on_client_died(self.uid);
        }
    }
}

async fn serve_daemon(listener: UnixListener, manager: Binder) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!(error = %e, "Daemon accept failed");
                return;
            }
        };
        let uid = match stream.peer_cred() {
            Ok(cred) => cred.uid(),
            Err(e) => {
                warn!(error = %e, "No peer credentials");
                continue;
            }
        };
        if !env::privileged_peer(uid) {
            warn!(uid, "Rejected unprivileged daemon connection");
            continue;
        }
        match Connection::establish(stream, Some(manager.clone())) {
            Ok(conn) => debug!(id = conn.id(), uid, "Daemon connection"),
            Err(e) => warn!(uid, error = %e, "Daemon connection failed"),
        }
    }
}

/// Manager surface; every call hops onto the host looper.
struct HostManager(Weak<RootServiceHost>);

impl HostManager {
    fn on_looper<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&RootServiceHost) -> R + Send + 'static,
        R: Send + 'static,
    {
        let host = self.0.upgrade()?;
        let looper = host.looper.clone();
        match looper.run_and_wait(move || f(&host)) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(error = %e, "Host looper unavailable");
                None
            }
        }
    }
}

impl Manager for HostManager {
    fn connect(&self, caller: u32, messenger: Binder) {
        self.on_looper(move |host| host.connect_internal(caller, messenger));
    }

    fn bind(&self, caller: u32, intent: Intent) -> Option<Binder> {
        self.on_looper(move |host| host.bind_internal(caller, intent))
            .flatten()
    }

    fn unbind(&self, caller: u32, component: ComponentName) {
        self.on_looper(move |host| host.unbind_internal(caller, &component));
    }

    fn stop(&self, caller: u32, component: ComponentName, uid: i32, reply_to: Option<BroadcastAddress>) {
        self.on_looper(move |host| host.stop_internal(caller, &component, uid, reply_to));
    }

    fn broadcast(&self, caller: u32, uid: u32, reply_to: BroadcastAddress) {
        self.on_looper(move |host| host.broadcast_internal(caller, uid, reply_to));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{BinderObject, CallContext, Parcel};
    use crate::broadcast::{HandshakeSink, LocalBus};
    use crate::manager::{Messenger, MessengerStub};

    const PKG: &str = "io.example";

    struct Echo;

    impl BinderObject for Echo {
        fn on_transact(&self, _: u32, d: Parcel, _: &CallContext) -> Result<Parcel, ChannelError> {
            Ok(d)
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        log: Log,
        retain: bool,
        null: bool,
    }

    impl Recorder {
        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    impl RootService for Recorder {
        fn on_create(&mut self, ctx: &ServiceContext) {
            self.push(format!("create {}", ctx.component().short_class()));
        }

        fn on_bind(&mut self, intent: &Intent) -> Option<Binder> {
            self.push(format!("bind extras={}", intent.extras.len()));
            (!self.null).then(|| Binder::new(Echo))
        }

        fn on_rebind(&mut self, intent: &Intent) {
            self.push(format!("rebind extras={}", intent.extras.len()));
        }

        fn on_unbind(&mut self, _: &Intent) -> bool {
            self.push("unbind".into());
            self.retain
        }

        fn on_destroy(&mut self) {
            self.push("destroy".into());
        }
    }

    #[derive(Default)]
    struct Inbox(Mutex<Vec<MessengerMessage>>);

    impl Messenger for Arc<Inbox> {
        fn on_message(&self, message: MessengerMessage) {
            self.0.lock().unwrap().push(message);
        }
    }

    struct Collect(Mutex<Vec<(Binder, bool)>>);

    impl HandshakeSink for Collect {
        fn deliver(&self, manager: Binder, daemon: bool) -> bool {
            self.0.lock().unwrap().push((manager, daemon));
            true
        }
    }

    struct Fixture {
        rt: tokio::runtime::Runtime,
        bus: Arc<LocalBus>,
        host: Arc<RootServiceHost>,
        log: Log,
    }

    impl Fixture {
        fn new(daemon: bool, retain: bool) -> Self {
            Self::with(daemon, retain, |_| {})
        }

        fn with(daemon: bool, retain: bool, configure: impl FnOnce(&mut HostOptions)) -> Self {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let log: Log = Arc::default();
            let mut factories = ServiceFactoryRegistry::new();
            for (class, null) in [("io.example.Svc", false), ("io.example.Other", false), ("io.example.Null", true)] {
                let log = Arc::clone(&log);
                factories.register(class, move || {
                    Box::new(Recorder {
                        log: Arc::clone(&log),
                        retain,
                        null,
                    }) as Box<dyn RootService>
                });
            }
            let bus = LocalBus::new();
            let mut options = HostOptions {
                package: PKG.into(),
                daemon,
                service_dir: std::env::temp_dir(),
                code_path: None,
                idle_timeout: Duration::from_millis(100),
                code_check_interval: Duration::from_millis(10),
            };
            configure(&mut options);
            let host = RootServiceHost::new(
                options,
                Looper::spawn("host-test").unwrap(),
                rt.handle().clone(),
                factories,
                bus.clone(),
            );
            Self { rt, bus, host, log }
        }

        fn client(&self, uid: u32) -> (ManagerProxy, Arc<Inbox>) {
            let inbox = Arc::new(Inbox::default());
            let proxy = ManagerProxy::new(self.host.manager().with_calling_uid(uid));
            proxy
                .connect(Binder::new(MessengerStub(Arc::clone(&inbox))))
                .unwrap();
            (proxy, inbox)
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn wait_exit(&self) -> Option<ExitReason> {
            self.rt
                .block_on(async { tokio::time::timeout(Duration::from_secs(5), self.host.exited()).await })
                .ok()
        }
    }

    fn svc() -> ComponentName {
        ComponentName::new(PKG, ".Svc")
    }

    #[test]
    fn test_bind_requires_connect() {
        let f = Fixture::new(false, false);
        let proxy = ManagerProxy::new(f.host.manager().with_calling_uid(10_001));
        assert!(proxy.bind(&Intent::for_component(svc())).unwrap().is_none());
        assert!(f.host.active_services().is_empty());
    }

    #[test]
    fn test_first_bind_captures_and_shares_capability() {
        let f = Fixture::new(false, false);
        let (a, _) = f.client(10_001);
        let (b, _) = f.client(10_002);

        let first = a
            .bind(&Intent::for_component(svc()).extra("k", "v"))
            .unwrap()
            .unwrap();
        let second = b.bind(&Intent::for_component(svc())).unwrap().unwrap();
        assert!(first.same_object(&second));
        assert_eq!(f.log(), vec!["create Svc", "bind extras=1"]);
        assert_eq!(f.host.users(&svc()), Some(vec![10_001, 10_002]));
    }

    #[test]
    fn test_null_binding_and_foreign_package() {
        let f = Fixture::new(false, false);
        let (a, _) = f.client(10_001);
        assert!(a
            .bind(&Intent::for_component(ComponentName::new(PKG, ".Null")))
            .unwrap()
            .is_none());
        assert!(a
            .bind(&Intent::for_component(ComponentName::new("other.pkg", ".Svc")))
            .unwrap()
            .is_none());
        assert!(a
            .bind(&Intent::for_component(ComponentName::new(PKG, ".Missing")))
            .unwrap()
            .is_none());
        assert_eq!(f.host.active_services(), vec![ComponentName::new(PKG, ".Null")]);
    }

    #[test]
    fn test_last_unbind_destroys_and_exits() {
        let f = Fixture::new(false, true);
        let (a, _) = f.client(10_001);
        let (b, _) = f.client(10_002);
        a.bind(&Intent::for_component(svc())).unwrap();
        b.bind(&Intent::for_component(svc())).unwrap();

        a.unbind(&svc()).unwrap();
        assert_eq!(f.host.exit_reason(), None);
        b.unbind(&svc()).unwrap();

        // Retention is ignored outside daemon mode.
        assert_eq!(f.log(), vec!["create Svc", "bind extras=0", "unbind", "destroy"]);
        assert_eq!(f.wait_exit(), Some(ExitReason::NoActiveServices));
    }

    #[test]
    fn test_daemon_retains_and_rebinds_with_captured_intent() {
        let f = Fixture::new(true, true);
        let (a, _) = f.client(10_001);
        a.bind(&Intent::for_component(svc()).extra("k", "v")).unwrap();
        a.unbind(&svc()).unwrap();
        assert_eq!(f.host.users(&svc()), Some(Vec::new()));

        a.bind(&Intent::for_component(svc()).extra("x", "y")).unwrap();
        a.bind(&Intent::for_component(svc())).unwrap();
        assert_eq!(
            f.log(),
            vec!["create Svc", "bind extras=1", "unbind", "rebind extras=0"]
        );
        assert_eq!(f.host.exit_reason(), None);
    }

    #[test]
    fn test_daemon_without_retention_destroys() {
        let f = Fixture::new(true, false);
        let (a, _) = f.client(10_001);
        a.bind(&Intent::for_component(svc())).unwrap();
        a.unbind(&svc()).unwrap();
        assert_eq!(f.log().last().map(String::as_str), Some("destroy"));
        assert_eq!(f.wait_exit(), Some(ExitReason::NoActiveServices));
    }

    #[test]
    fn test_stop_notifies_others_and_rebroadcasts() {
        let f = Fixture::new(true, true);
        let (a, inbox_a) = f.client(10_001);
        let (b, inbox_b) = f.client(10_002);
        a.bind(&Intent::for_component(svc())).unwrap();
        b.bind(&Intent::for_component(svc())).unwrap();
        a.bind(&Intent::for_component(ComponentName::new(PKG, ".Other")))
            .unwrap();

        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let _registration = f.bus.register("again", sink.clone()).unwrap();
        a.stop(&svc(), -1, Some(f.bus.address("again"))).unwrap();

        assert!(inbox_a.0.lock().unwrap().is_empty());
        assert_eq!(
            *inbox_b.0.lock().unwrap(),
            vec![MessengerMessage::ServiceStopped {
                component: svc(),
                daemon: true
            }]
        );
        let delivered = sink.0.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].1);
        assert_eq!(f.host.active_services(), vec![ComponentName::new(PKG, ".Other")]);
    }

    #[test]
    fn test_client_death_unbinds_everywhere() {
        let f = Fixture::new(false, false);
        let inbox = Arc::new(Inbox::default());
        let messenger = Binder::new(MessengerStub(Arc::clone(&inbox)));
        let proxy = ManagerProxy::new(f.host.manager().with_calling_uid(10_001));
        proxy.connect(messenger.clone()).unwrap();
        proxy.bind(&Intent::for_component(svc())).unwrap();

        messenger.kill();
        assert_eq!(f.wait_exit(), Some(ExitReason::NoActiveServices));
        assert!(f.log().contains(&"destroy".to_string()));
    }

    #[test]
    fn test_idle_exit_without_connect() {
        let f = Fixture::new(false, false);
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let action = handshake_action(&svc(), false);
        let _registration = f.bus.register(&action, sink.clone()).unwrap();

        f.host.start(&svc(), 10_001).unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert_eq!(f.log(), vec!["create Svc"]);
        assert_eq!(f.wait_exit(), Some(ExitReason::IdleTimeout));
    }

    #[test]
    fn test_connect_cancels_idle_exit() {
        let f = Fixture::new(false, false);
        let action = handshake_action(&svc(), false);
        let _registration = f
            .bus
            .register(&action, Arc::new(Collect(Mutex::new(Vec::new()))))
            .unwrap();
        f.host.start(&svc(), 10_001).unwrap();
        let _client = f.client(10_001);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(f.host.exit_reason(), None);
    }

    #[test]
    fn test_package_update_tears_down_silently() {
        let dir = tempfile::tempdir().unwrap();
        let code = dir.path().join("base.apk");
        std::fs::write(&code, b"v1").unwrap();

        let f = Fixture::with(true, true, |options| {
            options.code_path = Some(code.clone());
            options.service_dir = dir.path().to_path_buf();
        });
        f.host.start(&svc(), 10_001).unwrap();
        assert!(daemon_socket_path(dir.path(), PKG).exists());
        let (a, inbox) = f.client(10_001);
        a.bind(&Intent::for_component(svc())).unwrap();

        std::fs::remove_file(&code).unwrap();
        assert_eq!(f.wait_exit(), Some(ExitReason::PackageUpdated));
        assert!(inbox.0.lock().unwrap().is_empty());
        assert_eq!(f.log().last().map(String::as_str), Some("destroy"));

        f.host.shutdown();
        assert!(!daemon_socket_path(dir.path(), PKG).exists());
    }

    #[test]
    fn test_second_daemon_leaves_live_socket_alone() {
        let dir = tempfile::tempdir().unwrap();
        let first = Fixture::with(true, true, |o| o.service_dir = dir.path().to_path_buf());
        first.host.start(&svc(), 10_001).unwrap();
        let socket = daemon_socket_path(dir.path(), PKG);
        assert!(socket.exists());

        let second = Fixture::with(true, true, |o| o.service_dir = dir.path().to_path_buf());
        let err = second.host.start(&svc(), 10_001).unwrap_err();
        assert!(matches!(err, HostError::DaemonRunning(path) if path == socket));
        assert!(second.log().is_empty());
        assert!(socket.exists());
        assert!(std::os::unix::net::UnixStream::connect(&socket).is_ok());

        first.host.shutdown();
    }

    #[test]
    fn test_stale_daemon_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = daemon_socket_path(dir.path(), PKG);
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        let f = Fixture::with(true, true, |o| o.service_dir = dir.path().to_path_buf());
        f.host.start(&svc(), 10_001).unwrap();
        assert!(std::os::unix::net::UnixStream::connect(&socket).is_ok());
        f.host.shutdown();
    }

    #[test]
    fn test_forced_stop_of_idle_retained_service_skips_unbind() {
        let f = Fixture::new(true, true);
        let (a, _) = f.client(10_001);
        a.bind(&Intent::for_component(svc())).unwrap();
        a.bind(&Intent::for_component(ComponentName::new(PKG, ".Other")))
            .unwrap();
        a.unbind(&svc()).unwrap();
        a.stop(&svc(), -1, None).unwrap();

        assert_eq!(
            f.log(),
            vec!["create Svc", "bind extras=0", "create Other", "bind extras=0", "unbind", "destroy"]
        );
        assert_eq!(f.host.active_services(), vec![ComponentName::new(PKG, ".Other")]);
    }

    #[test]
    fn test_null_binding_asks_again() {
        let f = Fixture::new(false, false);
        let (a, _) = f.client(10_001);
        let null = ComponentName::new(PKG, ".Null");
        assert!(a.bind(&Intent::for_component(null.clone())).unwrap().is_none());
        assert!(a
            .bind(&Intent::for_component(null).extra("k", "v"))
            .unwrap()
            .is_none());
        assert_eq!(f.log(), vec!["create Null", "bind extras=0", "bind extras=1"]);
    }

    #[test]
    fn test_stop_self_forces_teardown() {
        let f = Fixture::new(true, true);
        let (a, inbox) = f.client(10_001);
        a.bind(&Intent::for_component(svc())).unwrap();
        let host = Arc::clone(&f.host);
        f.host
            .looper()
            .run_and_wait(move || host.stop_service(&svc()))
            .unwrap();
        assert_eq!(f.wait_exit(), Some(ExitReason::NoActiveServices));
        assert_eq!(inbox.0.lock().unwrap().len(), 1);
    }
}

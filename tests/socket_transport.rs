//! A host and a client talking over real Unix sockets.

use rootservice::broadcast::{BroadcastBus, SocketBus};
use rootservice::env;
use rootservice::handshake::{handshake_action, Handshake, HandshakeReceiver};
use rootservice::host::{connect_daemon, daemon_socket_path};
use rootservice::manager::{ManagerProxy, Messenger, MessengerStub};
use rootservice::protocol::MessengerMessage;
use rootservice::{
    Binder, BinderObject, CallContext, ChannelError, ComponentName, ExitReason, HostOptions, Intent,
    Looper, Parcel, RootService, RootServiceHost, ServiceFactoryRegistry,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;

const PKG: &str = "io.example";

struct WhoAmI;

impl BinderObject for WhoAmI {
    fn on_transact(&self, _: u32, data: Parcel, ctx: &CallContext) -> Result<Parcel, ChannelError> {
        let mut reply = ctx.calling_uid.to_le_bytes().to_vec();
        reply.extend_from_slice(&data.data);
        Ok(Parcel::from_data(reply))
    }
}

#[derive(Default)]
struct Echo;

impl RootService for Echo {
    fn on_bind(&mut self, _intent: &Intent) -> Option<Binder> {
        Some(Binder::new(WhoAmI))
    }
}

#[derive(Default)]
struct Inbox(Mutex<Vec<MessengerMessage>>);

/// Shared handle so the test keeps reading what the stub receives.
#[derive(Clone, Default)]
struct InboxHandle(Arc<Inbox>);

impl Messenger for InboxHandle {
    fn on_message(&self, message: MessengerMessage) {
        self.0 .0.lock().unwrap().push(message);
    }
}

struct Setup {
    rt: Runtime,
    broadcast: TempDir,
    services: TempDir,
    bus: Arc<SocketBus>,
}

impl Setup {
    fn new() -> Self {
        let rt = Runtime::new().unwrap();
        let broadcast = TempDir::new().unwrap();
        let services = TempDir::new().unwrap();
        let bus = Arc::new(SocketBus::new(broadcast.path(), rt.handle().clone()));
        Self {
            rt,
            broadcast,
            services,
            bus,
        }
    }

    fn host(&self, daemon: bool) -> Arc<RootServiceHost> {
        let mut factories = ServiceFactoryRegistry::new();
        factories.register_default::<Echo>("io.example.Echo");
        let options = HostOptions {
            package: PKG.to_string(),
            daemon,
            service_dir: self.services.path().to_path_buf(),
            code_path: None,
            idle_timeout: Duration::from_secs(10),
            code_check_interval: Duration::from_secs(2),
        };
        // The host broadcasts from its own bus, as a separate process would.
        let bus: Arc<dyn BroadcastBus> = Arc::new(SocketBus::new(self.broadcast.path(), self.rt.handle().clone()));
        RootServiceHost::new(options, Looper::spawn("host").unwrap(), self.rt.handle().clone(), factories, bus)
    }

    fn receiver(&self, daemon: bool) -> HandshakeReceiver {
        HandshakeReceiver::register(self.bus.as_ref(), handshake_action(&echo(), daemon)).unwrap()
    }

    fn wait(&self, receiver: HandshakeReceiver) -> Handshake {
        self.rt.block_on(receiver.wait(Duration::from_secs(5))).unwrap()
    }
}

fn echo() -> ComponentName {
    ComponentName::new(PKG, ".Echo")
}

#[test]
fn handshake_and_bind_over_sockets() {
    let setup = Setup::new();
    let receiver = setup.receiver(false);
    let host = setup.host(false);
    host.start(&echo(), env::current_uid()).unwrap();

    let handshake = setup.wait(receiver);
    assert!(!handshake.is_daemon);
    assert!(!handshake.manager.is_local());

    let manager = ManagerProxy::new(handshake.manager);
    let inbox = InboxHandle::default();
    manager.connect(Binder::new(MessengerStub(inbox.clone()))).unwrap();
    let service = manager
        .bind(&Intent::for_component(echo()))
        .unwrap()
        .expect("service binder");

    let reply = service.transact(7, Parcel::from_data(b"hi".to_vec())).unwrap();
    assert_eq!(&reply.data[..4], &env::current_uid().to_le_bytes());
    assert_eq!(&reply.data[4..], b"hi");
    assert_eq!(host.users(&echo()), Some(vec![env::current_uid()]));

    manager.unbind(&echo()).unwrap();
    let reason = setup
        .rt
        .block_on(async { tokio::time::timeout(Duration::from_secs(5), host.exited()).await })
        .unwrap();
    assert_eq!(reason, ExitReason::NoActiveServices);
    host.shutdown();
}

#[test]
fn closing_the_client_connection_counts_as_death() {
    let setup = Setup::new();
    let receiver = setup.receiver(false);
    let host = setup.host(false);
    host.start(&echo(), env::current_uid()).unwrap();

    let manager = ManagerProxy::new(setup.wait(receiver).manager);
    let inbox = InboxHandle::default();
    manager.connect(Binder::new(MessengerStub(inbox.clone()))).unwrap();
    manager.bind(&Intent::for_component(echo())).unwrap();

    // The client goes away without unbinding.
    manager.binder().kill();
    let reason = setup
        .rt
        .block_on(async { tokio::time::timeout(Duration::from_secs(5), host.exited()).await })
        .unwrap();
    assert_eq!(reason, ExitReason::NoActiveServices);
    assert!(host.active_services().is_empty());
    host.shutdown();
}

#[test]
fn running_daemon_answers_through_its_socket() {
    let setup = Setup::new();
    let receiver = setup.receiver(true);
    let host = setup.host(true);
    host.start(&echo(), env::current_uid()).unwrap();
    setup.wait(receiver);

    let socket = daemon_socket_path(setup.services.path(), PKG);
    assert!(socket.exists());

    // A second launch finds the daemon and asks it to re-send the handshake.
    let receiver = setup.receiver(true);
    let daemon = setup
        .rt
        .block_on(connect_daemon(setup.services.path(), PKG))
        .expect("daemon reachable");
    let address = setup.bus.address(receiver.action());
    daemon.broadcast(env::current_uid(), address).unwrap();
    let handshake = setup.wait(receiver);
    assert!(handshake.is_daemon);

    let manager = ManagerProxy::new(handshake.manager);
    manager
        .connect(Binder::new(MessengerStub(InboxHandle::default())))
        .unwrap();
    assert!(manager.bind(&Intent::for_component(echo()).daemon()).unwrap().is_some());

    host.shutdown();
    assert!(!socket.exists());
}

#[test]
fn no_daemon_means_no_socket() {
    let setup = Setup::new();
    assert!(setup
        .rt
        .block_on(connect_daemon(setup.services.path(), PKG))
        .is_none());
}

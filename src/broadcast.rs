//! Buses that carry a host's manager capability back to the client.
//!
//! [`SocketBus`] is the real out-of-band channel between processes: every registration
//! listens on its own Unix socket and a delivery is one connection. [`LocalBus`] delivers
//! in-process and is what embedded hosts and tests use.

use crate::binder::{Binder, RemoteChannel};
use crate::env;
use crate::error::ChannelError;
use crate::protocol::{BroadcastAddress, HandshakeHello};
use crate::transport::{self, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives deliveries for one registered action.
pub trait HandshakeSink: Send + Sync {
    /// Returns false when the delivery was not wanted (duplicate).
    fn deliver(&self, manager: Binder, daemon: bool) -> bool;
}

/// Unregisters its action when dropped.
pub struct Registration {
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    fn new(unregister: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unregister: Some(Box::new(unregister)),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

pub trait BroadcastBus: Send + Sync {
    /// Where senders should deliver to reach a receiver registered for `action` here.
    fn address(&self, action: &str) -> BroadcastAddress;

    fn register(&self, action: &str, sink: Arc<dyn HandshakeSink>) -> Result<Registration, ChannelError>;

    /// Deliver `manager` to the receiver at `address`; `uid` is the receiving client.
    fn send(
        &self,
        address: &BroadcastAddress,
        manager: &Binder,
        daemon: bool,
        uid: u32,
    ) -> Result<(), ChannelError>;
}

/// 64-bit FNV-1a, used to keep socket names short and path-safe.
fn fnv64(input: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    input
        .bytes()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}

pub fn socket_path(dir: &Path, action: &str) -> PathBuf {
    dir.join(format!("hs-{:016x}.sock", fnv64(action)))
}

/// Unix-socket bus rooted at a broadcast directory.
pub struct SocketBus {
    dir: PathBuf,
    runtime: Handle,
}

impl SocketBus {
    pub fn new(dir: impl Into<PathBuf>, runtime: Handle) -> Self {
        Self {
            dir: dir.into(),
            runtime,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn accept_loop(listener: UnixListener, action: String, sink: Arc<dyn HandshakeSink>) {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!(%action, error = %e, "Handshake accept failed");
                    return;
                }
            };
            if let Err(e) = Self::receive(stream, &action, &sink).await {
                warn!(%action, error = %e, "Rejected handshake delivery");
            }
        }
    }

    async fn receive(
        mut stream: UnixStream,
        action: &str,
        sink: &Arc<dyn HandshakeSink>,
    ) -> Result<(), ChannelError> {
        let uid = stream.peer_cred()?.uid();
        if !env::privileged_peer(uid) {
            return Err(ChannelError::Remote(format!("sender uid {uid} is not privileged")));
        }
        let frame = tokio::time::timeout(HELLO_TIMEOUT, transport::read_frame(&mut stream))
            .await
            .map_err(|_| ChannelError::Io("timed out waiting for hello".to_string()))??;
        let hello = HandshakeHello::from_bytes(&frame)?;
        if hello.action != action {
            return Err(ChannelError::Protocol(format!("unexpected action '{}'", hello.action)));
        }
        let conn = Connection::establish(stream, None)?;
        let manager = conn.root()?;
        debug!(%action, sender_uid = uid, daemon = hello.daemon, "Handshake received");
        if !sink.deliver(manager, hello.daemon) {
            conn.close();
        }
        Ok(())
    }

    async fn deliver(path: PathBuf, hello: HandshakeHello, manager: Binder) -> Result<(), ChannelError> {
        let mut stream = UnixStream::connect(&path).await?;
        transport::write_frame(&mut stream, &hello.to_bytes()?).await?;
        Connection::establish(stream, Some(manager))?;
        Ok(())
    }
}

impl BroadcastBus for SocketBus {
    fn address(&self, action: &str) -> BroadcastAddress {
        BroadcastAddress {
            dir: self.dir.to_string_lossy().into_owned(),
            action: action.to_string(),
        }
    }

    fn register(&self, action: &str, sink: Arc<dyn HandshakeSink>) -> Result<Registration, ChannelError> {
        use std::os::unix::fs::PermissionsExt;

        std::fs::create_dir_all(&self.dir)?;
        let path = socket_path(&self.dir, action);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = {
            let _guard = self.runtime.enter();
            UnixListener::bind(&path)?
        };
        // Privileged senders are checked by peer uid, not file mode.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;
        info!(%action, path = %path.display(), "Listening for handshake");

        let task = self
            .runtime
            .spawn(Self::accept_loop(listener, action.to_string(), sink));
        let action = action.to_string();
        Ok(Registration::new(move || {
            task.abort();
            if let Err(e) = std::fs::remove_file(&path) {
                trace!(%action, error = %e, "Handshake socket already gone");
            }
        }))
    }

    fn send(
        &self,
        address: &BroadcastAddress,
        manager: &Binder,
        daemon: bool,
        uid: u32,
    ) -> Result<(), ChannelError> {
        let path = socket_path(Path::new(&address.dir), &address.action);
        let hello = HandshakeHello {
            action: address.action.clone(),
            daemon,
        };
        let manager = manager.clone();
        debug!(action = %address.action, uid, path = %path.display(), "Broadcasting handshake");
        self.runtime.spawn(async move {
            if let Err(e) = Self::deliver(path, hello, manager).await {
                warn!(error = %e, "Handshake delivery failed");
            }
        });
        Ok(())
    }
}

/// In-process bus.
#[derive(Default)]
pub struct LocalBus {
    sinks: Arc<Mutex<HashMap<String, Arc<dyn HandshakeSink>>>>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_registered(&self, action: &str) -> bool {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(action)
    }
}

impl BroadcastBus for LocalBus {
    fn address(&self, action: &str) -> BroadcastAddress {
        BroadcastAddress {
            dir: String::new(),
            action: action.to_string(),
        }
    }

    fn register(&self, action: &str, sink: Arc<dyn HandshakeSink>) -> Result<Registration, ChannelError> {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(action.to_string(), Arc::clone(&sink));
        let sinks = Arc::clone(&self.sinks);
        let action = action.to_string();
        Ok(Registration::new(move || {
            let mut sinks = sinks.lock().unwrap_or_else(PoisonError::into_inner);
            if sinks.get(&action).is_some_and(|s| Arc::ptr_eq(s, &sink)) {
                sinks.remove(&action);
            }
        }))
    }

    fn send(
        &self,
        address: &BroadcastAddress,
        manager: &Binder,
        daemon: bool,
        uid: u32,
    ) -> Result<(), ChannelError> {
        let sink = self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address.action)
            .cloned();
        match sink {
            Some(sink) => {
                sink.deliver(manager.with_calling_uid(uid), daemon);
                Ok(())
            }
            None => Err(ChannelError::Io(format!("no receiver for '{}'", address.action))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{BinderObject, CallContext, Parcel};

    struct Uid;

    impl BinderObject for Uid {
        fn on_transact(&self, _: u32, _: Parcel, ctx: &CallContext) -> Result<Parcel, ChannelError> {
            Ok(Parcel::from_data(ctx.calling_uid.to_le_bytes().to_vec()))
        }
    }

    struct Collect(tokio::sync::mpsc::UnboundedSender<(Binder, bool)>);

    impl HandshakeSink for Collect {
        fn deliver(&self, manager: Binder, daemon: bool) -> bool {
            self.0.send((manager, daemon)).is_ok()
        }
    }

    #[test]
    fn test_socket_names_are_stable() {
        let dir = Path::new("/tmp/b");
        let a = socket_path(dir, "rootservice.intent.action.HANDSHAKE/p/p.S");
        assert_eq!(a, socket_path(dir, "rootservice.intent.action.HANDSHAKE/p/p.S"));
        assert_ne!(a, socket_path(dir, "rootservice.intent.action.HANDSHAKE/p/p.S#daemon"));
        assert_eq!(fnv64(""), 0xcbf2_9ce4_8422_2325);
    }

    #[test]
    fn test_local_bus_applies_receiver_uid() {
        let bus = LocalBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let registration = bus.register("act", Arc::new(Collect(tx))).unwrap();
        bus.send(&bus.address("act"), &Binder::new(Uid), true, 10_050).unwrap();

        let (manager, daemon) = rx.try_recv().unwrap();
        assert!(daemon);
        let reply = manager.transact(1, Parcel::new()).unwrap();
        assert_eq!(reply.data, 10_050u32.to_le_bytes());

        drop(registration);
        assert!(!bus.is_registered("act"));
        assert!(bus.send(&bus.address("act"), &Binder::new(Uid), false, 0).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_socket_bus_delivers_manager() {
        let dir = tempfile::tempdir().unwrap();
        let bus = SocketBus::new(dir.path(), Handle::current());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _registration = bus.register("act", Arc::new(Collect(tx))).unwrap();

        bus.send(&bus.address("act"), &Binder::new(Uid), false, 0).unwrap();
        let (manager, daemon) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!daemon);
        assert!(!manager.is_local());
        let reply = tokio::task::spawn_blocking(move || manager.transact(1, Parcel::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.data, env::current_uid().to_le_bytes());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropping_registration_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let bus = SocketBus::new(dir.path(), Handle::current());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let registration = bus.register("act", Arc::new(Collect(tx))).unwrap();
        let path = socket_path(dir.path(), "act");
        assert!(path.exists());
        drop(registration);
        assert!(!path.exists());
    }
}

//! Socket transport for capabilities.
//!
//! A [`Connection`] wraps a connected Unix stream. Each side may export a root object
//! (handle 0); further objects are exported on demand when a local [`Binder`] is passed
//! inside a parcel. Incoming calls run on tokio's blocking pool and report the peer's
//! kernel-verified uid as the caller.
//!
//! Exports are reference counted across the connection: the sender counts how often it
//! sent a handle, the receiver counts how often it got it, and once the receiver's last
//! proxy is gone it sends a `Release` with its count. The export is dropped when the
//! counts meet, so a handle that is in flight again survives the release.

use crate::binder::{Binder, CallContext, Lifeline, Parcel, RemoteChannel, RemoteRef};
use crate::error::ChannelError;
use crate::protocol::{MessageFrame, WireBinder, WireMessage, WireStatus};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Handle of the object each side exports up front.
pub const ROOT_HANDLE: u64 = 0;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&MessageFrame::encode(bytes)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = MessageFrame::read_length(&len_buf)?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

type ReplyResult = Result<Parcel, ChannelError>;

#[derive(Default)]
struct Exports {
    next_id: u64,
    objects: HashMap<u64, Binder>,
    by_local: HashMap<usize, u64>,
    /// Times each non-root handle went out in a frame.
    sent: HashMap<u64, u64>,
}

impl Exports {
    fn export(&mut self, binder: &Binder) -> Option<u64> {
        let local = binder.local_id()?;
        let id = match self.by_local.get(&local) {
            Some(id) => *id,
            None => {
                self.next_id += 1;
                let id = self.next_id;
                self.objects.insert(id, binder.clone());
                self.by_local.insert(local, id);
                id
            }
        };
        if id != ROOT_HANDLE {
            *self.sent.entry(id).or_default() += 1;
        }
        Some(id)
    }

    /// Returns the object once the peer has released every copy it was sent.
    fn release(&mut self, id: u64, count: u64) -> Option<Binder> {
        let sent = self.sent.get_mut(&id)?;
        *sent = sent.saturating_sub(count);
        if *sent > 0 {
            return None;
        }
        self.sent.remove(&id);
        let binder = self.objects.remove(&id)?;
        if let Some(local) = binder.local_id() {
            self.by_local.remove(&local);
        }
        Some(binder)
    }
}

struct Import {
    proxy: Weak<RemoteRef>,
    received: u64,
}

/// One end of a capability connection.
pub struct Connection {
    id: u64,
    peer_uid: u32,
    this: Weak<Connection>,
    runtime: Handle,
    lifeline: Arc<Lifeline>,
    writer: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    reader: Mutex<Option<AbortHandle>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ReplyResult>>>,
    exports: Mutex<Exports>,
    imports: Mutex<HashMap<u64, Import>>,
    next_call: AtomicU64,
}

impl Connection {
    /// Connect to a listening socket, exporting `root` as handle 0.
    pub async fn connect(path: &Path, root: Option<Binder>) -> Result<Arc<Self>, ChannelError> {
        let stream = UnixStream::connect(path).await?;
        Self::establish(stream, root)
    }

    /// Start serving an already-connected stream. Must be called inside a tokio runtime.
    pub fn establish(stream: UnixStream, root: Option<Binder>) -> Result<Arc<Self>, ChannelError> {
        let runtime = Handle::try_current()
            .map_err(|_| ChannelError::Io("no tokio runtime for connection".to_string()))?;
        let peer_uid = stream.peer_cred()?.uid();
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let mut exports = Exports::default();
        if let Some(root) = root {
            if let Some(local) = root.local_id() {
                exports.objects.insert(ROOT_HANDLE, root);
                exports.by_local.insert(local, ROOT_HANDLE);
            } else {
                return Err(ChannelError::Unsupported("root object must be local"));
            }
        }

        let conn = Arc::new_cyclic(|this| Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_uid,
            this: this.clone(),
            runtime: runtime.clone(),
            lifeline: Lifeline::new(),
            writer: Mutex::new(Some(tx)),
            reader: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            exports: Mutex::new(exports),
            imports: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
        });

        runtime.spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!(error = %e, "Connection write failed");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let reader_conn = Arc::clone(&conn);
        let reader = runtime.spawn(async move {
            reader_conn.read_loop(read_half).await;
        });
        *conn.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader.abort_handle());

        debug!(id = conn.id, peer_uid, "Connection established");
        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Uid of the process on the other end, from `SO_PEERCRED`.
    pub fn peer_uid(&self) -> u32 {
        self.peer_uid
    }

    pub fn is_alive(&self) -> bool {
        self.lifeline.is_alive()
    }

    /// Proxy for the peer's root object.
    pub fn root(&self) -> Result<Binder, ChannelError> {
        let this = self.this.upgrade().ok_or(ChannelError::DeadObject)?;
        Ok(Binder::remote(this, ROOT_HANDLE))
    }

    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        loop {
            let frame = match read_frame(&mut read_half).await {
                Ok(frame) => frame,
                Err(e) => {
                    trace!(id = self.id, error = %e, "Connection read ended");
                    break;
                }
            };
            let message = match WireMessage::from_bytes(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(id = self.id, error = %e, "Dropping connection on malformed frame");
                    break;
                }
            };
            match message {
                WireMessage::Transact {
                    id,
                    target,
                    code,
                    oneway,
                    data,
                    binders,
                } => {
                    let conn = Arc::clone(&self);
                    self.runtime.spawn_blocking(move || {
                        conn.dispatch(id, target, code, oneway, data, binders);
                    });
                }
                WireMessage::Reply {
                    id,
                    status,
                    data,
                    binders,
                } => {
                    let result = match status {
                        WireStatus::Ok => self
                            .decode_binders(&binders)
                            .map(|binders| Parcel { data, binders }),
                        WireStatus::DeadObject => Err(ChannelError::DeadObject),
                        WireStatus::Failed { message } => Err(ChannelError::Remote(message)),
                    };
                    let waiter = self
                        .pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => trace!(id = self.id, call = id, "Reply for unknown call"),
                    }
                }
                WireMessage::Release { handle, count } => {
                    let released = self
                        .exports
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .release(handle, count);
                    if released.is_some() {
                        trace!(id = self.id, handle, "Export released");
                    }
                }
            }
        }
        self.shutdown();
    }

    /// Runs an incoming call on the blocking pool.
    fn dispatch(
        &self,
        call: u64,
        target: u64,
        code: u32,
        oneway: bool,
        data: Vec<u8>,
        binders: Vec<WireBinder>,
    ) {
        let object = self
            .exports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .objects
            .get(&target)
            .cloned();

        let result = match object {
            Some(binder) if binder.is_alive() => match (binder.local_object(), self.decode_binders(&binders)) {
                (Some(object), Ok(binders)) => {
                    let ctx = CallContext {
                        calling_uid: self.peer_uid,
                    };
                    object.on_transact(code, Parcel { data, binders }, &ctx)
                }
                (None, _) => Err(ChannelError::Unsupported("exported object is not local")),
                (_, Err(e)) => Err(e),
            },
            _ => Err(ChannelError::DeadObject),
        };

        if oneway {
            if let Err(e) = result {
                debug!(id = self.id, target, code, error = %e, "Oneway call failed");
            }
            return;
        }

        let reply = match result {
            Ok(parcel) => match self.encode_binders(&parcel.binders) {
                Ok(binders) => WireMessage::Reply {
                    id: call,
                    status: WireStatus::Ok,
                    data: parcel.data,
                    binders,
                },
                Err(e) => Self::failed_reply(call, &e),
            },
            Err(e) => Self::failed_reply(call, &e),
        };
        if let Err(e) = self.send(&reply) {
            debug!(id = self.id, call, error = %e, "Could not send reply");
        }
    }

    fn failed_reply(call: u64, err: &ChannelError) -> WireMessage {
        let status = match err {
            ChannelError::DeadObject => WireStatus::DeadObject,
            other => WireStatus::Failed {
                message: other.to_string(),
            },
        };
        WireMessage::Reply {
            id: call,
            status,
            data: Vec::new(),
            binders: Vec::new(),
        }
    }

    fn send(&self, message: &WireMessage) -> Result<(), ChannelError> {
        let frame = MessageFrame::encode(&message.to_bytes()?);
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match writer.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| ChannelError::DeadObject),
            None => Err(ChannelError::DeadObject),
        }
    }

    fn encode_binders(&self, binders: &[Binder]) -> Result<Vec<WireBinder>, ChannelError> {
        let mut exports = self.exports.lock().unwrap_or_else(PoisonError::into_inner);
        binders
            .iter()
            .map(|binder| match binder.remote_handle() {
                Some((channel, handle)) if channel == self.id => Ok(WireBinder::Receiver(handle)),
                Some(_) => Err(ChannelError::Unsupported(
                    "cannot forward a proxy to a different connection",
                )),
                None => exports
                    .export(binder)
                    .map(WireBinder::Sender)
                    .ok_or(ChannelError::Unsupported("binder cannot be exported")),
            })
            .collect()
    }

    fn decode_binders(&self, binders: &[WireBinder]) -> Result<Vec<Binder>, ChannelError> {
        let this = self.this.upgrade().ok_or(ChannelError::DeadObject)?;
        // Locks are taken per item: a proxy dropped on the error path calls back
        // into `release`.
        binders
            .iter()
            .map(|wire| match *wire {
                WireBinder::Sender(ROOT_HANDLE) => Ok(Binder::remote(this.clone(), ROOT_HANDLE)),
                WireBinder::Sender(handle) => Ok(self.import(&this, handle)),
                WireBinder::Receiver(id) => self
                    .exports
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .objects
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| ChannelError::Protocol(format!("unknown object {id}"))),
            })
            .collect()
    }

    /// One proxy per live handle, counting every time the peer sent it.
    fn import(&self, this: &Arc<Connection>, handle: u64) -> Binder {
        let mut imports = self.imports.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = imports.entry(handle).or_insert_with(|| Import {
            proxy: Weak::new(),
            received: 0,
        });
        entry.received += 1;
        let proxy = match entry.proxy.upgrade() {
            Some(proxy) => proxy,
            None => {
                let proxy = RemoteRef::new(Arc::clone(this) as Arc<dyn RemoteChannel>, handle);
                entry.proxy = Arc::downgrade(&proxy);
                proxy
            }
        };
        Binder::from_remote(proxy)
    }

    /// Number of objects the peer can currently reach, root included.
    pub fn exported_count(&self) -> usize {
        self.exports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .objects
            .len()
    }

    fn shutdown(&self) {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reader) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            reader.abort();
        }
        // Dropping the senders fails every outstanding call with DeadObject.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.imports.lock().unwrap_or_else(PoisonError::into_inner).clear();
        let released = std::mem::take(&mut *self.exports.lock().unwrap_or_else(PoisonError::into_inner));
        if self.lifeline.is_alive() {
            debug!(id = self.id, exported = released.objects.len(), "Connection closed");
        }
        self.lifeline.kill();
    }
}

impl RemoteChannel for Connection {
    fn transact(
        &self,
        handle: u64,
        code: u32,
        data: Parcel,
        oneway: bool,
    ) -> Result<Parcel, ChannelError> {
        if !self.is_alive() {
            return Err(ChannelError::DeadObject);
        }
        let binders = self.encode_binders(&data.binders)?;
        let id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let message = WireMessage::Transact {
            id,
            target: handle,
            code,
            oneway,
            data: data.data,
            binders,
        };

        if oneway {
            self.send(&message)?;
            return Ok(Parcel::new());
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        if let Err(e) = self.send(&message) {
            self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
            return Err(e);
        }
        // Callers are looper or blocking-pool threads, never async tasks.
        rx.blocking_recv().unwrap_or(Err(ChannelError::DeadObject))
    }

    fn lifeline(&self) -> &Arc<Lifeline> {
        &self.lifeline
    }

    fn close(&self) {
        self.shutdown();
    }

    fn channel_id(&self) -> u64 {
        self.id
    }

    fn release(&self, handle: u64) {
        if handle == ROOT_HANDLE {
            return;
        }
        let count = {
            let mut imports = self.imports.lock().unwrap_or_else(PoisonError::into_inner);
            // A fresh proxy for the same handle may have taken over the entry.
            let replaced = imports.get(&handle).map(|import| import.proxy.strong_count() > 0);
            match replaced {
                Some(false) => imports.remove(&handle).map(|import| import.received),
                _ => None,
            }
        };
        let Some(count) = count else {
            return;
        };
        if !self.is_alive() {
            return;
        }
        if let Err(e) = self.send(&WireMessage::Release { handle, count }) {
            trace!(id = self.id, handle, error = %e, "Could not release handle");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_uid", &self.peer_uid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{BinderObject, DeathRecipient};
    use std::sync::atomic::AtomicBool;

    /// Replies with the caller uid, or calls back into a passed capability.
    struct Responder;

    impl BinderObject for Responder {
        fn on_transact(
            &self,
            code: u32,
            mut data: Parcel,
            ctx: &CallContext,
        ) -> Result<Parcel, ChannelError> {
            match code {
                1 => Ok(Parcel::from_data(ctx.calling_uid.to_le_bytes().to_vec())),
                2 => {
                    let callback = data
                        .take_binder()
                        .ok_or_else(|| ChannelError::Protocol("missing callback".into()))?;
                    callback.transact(1, Parcel::new())
                }
                3 => Ok(Parcel::new().with_binder(Binder::new(Responder))),
                _ => Err(ChannelError::Remote(format!("bad code {code}"))),
            }
        }
    }

    struct Flag(AtomicBool);

    impl DeathRecipient for Flag {
        fn binder_died(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = UnixStream::pair().unwrap();
        let server = Connection::establish(a, Some(Binder::new(Responder))).unwrap();
        let client = Connection::establish(b, None).unwrap();
        (server, client)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_call_reports_peer_uid() {
        let (_server, client) = pair();
        let root = client.root().unwrap();
        let reply = tokio::task::spawn_blocking(move || root.transact(1, Parcel::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.data, crate::env::current_uid().to_le_bytes());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_callback_capability_crosses_back() {
        let (_server, client) = pair();
        let root = client.root().unwrap();
        let reply = tokio::task::spawn_blocking(move || {
            root.transact(2, Parcel::new().with_binder(Binder::new(Responder)))
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply.data.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_returned_capability_is_a_proxy() {
        let (_server, client) = pair();
        let root = client.root().unwrap();
        let nested = tokio::task::spawn_blocking(move || {
            let mut reply = root.transact(3, Parcel::new())?;
            let nested = reply.take_binder().ok_or(ChannelError::DeadObject)?;
            assert!(!nested.is_local());
            nested.transact(1, Parcel::new())
        })
        .await
        .unwrap();
        assert!(nested.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_errors_propagate() {
        let (_server, client) = pair();
        let root = client.root().unwrap();
        let err = tokio::task::spawn_blocking(move || root.transact(99, Parcel::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ChannelError::Remote(m) if m.contains("bad code 99")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_peer_close_kills_proxies() {
        let (server, client) = pair();
        let root = client.root().unwrap();
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        root.link_to_death(flag.clone()).unwrap();

        server.close();
        for _ in 0..100 {
            if flag.0.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(flag.0.load(Ordering::SeqCst));
        assert!(!root.is_alive());
        let err = tokio::task::spawn_blocking(move || root.transact(1, Parcel::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, ChannelError::DeadObject);
    }

    /// Hands out the same nested object on every call.
    struct Keeper(Binder);

    impl BinderObject for Keeper {
        fn on_transact(&self, _: u32, _: Parcel, _: &CallContext) -> Result<Parcel, ChannelError> {
            Ok(Parcel::new().with_binder(self.0.clone()))
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if done() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        done()
    }

    async fn fetch(root: &Binder, code: u32) -> Binder {
        let root = root.clone();
        tokio::task::spawn_blocking(move || root.transact(code, Parcel::new()))
            .await
            .unwrap()
            .unwrap()
            .take_binder()
            .expect("nested binder")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropped_proxy_releases_export() {
        let (server, client) = pair();
        let root = client.root().unwrap();
        let nested = fetch(&root, 3).await;
        assert_eq!(server.exported_count(), 2);

        drop(nested);
        assert!(wait_until(|| server.exported_count() == 1).await);
        assert!(client.imports.lock().unwrap().is_empty());
        assert!(root.is_alive());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_export_survives_while_any_proxy_lives() {
        let (a, b) = UnixStream::pair().unwrap();
        let server = Connection::establish(a, Some(Binder::new(Keeper(Binder::new(Responder))))).unwrap();
        let client = Connection::establish(b, None).unwrap();
        let root = client.root().unwrap();

        let first = fetch(&root, 0).await;
        let second = fetch(&root, 0).await;
        assert!(first.same_object(&second));
        assert_eq!(client.imports.lock().unwrap()[&1].received, 2);

        drop(first);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.exported_count(), 2);
        let still = second.clone();
        let reply = tokio::task::spawn_blocking(move || still.transact(1, Parcel::new()))
            .await
            .unwrap();
        assert!(reply.is_ok());

        drop(second);
        assert!(wait_until(|| server.exported_count() == 1).await);

        // Sent again after the release, the object gets a fresh export.
        let again = fetch(&root, 0).await;
        assert_eq!(server.exported_count(), 2);
        assert_eq!(again.remote_handle().map(|(_, handle)| handle), Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_root_is_dead_object() {
        let (a, b) = UnixStream::pair().unwrap();
        let _left = Connection::establish(a, None).unwrap();
        let right = Connection::establish(b, None).unwrap();
        let root = right.root().unwrap();
        let err = tokio::task::spawn_blocking(move || root.transact(1, Parcel::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, ChannelError::DeadObject);
    }
}

//! Capability handles.
//!
//! A [`Binder`] is either a local object living in this process or a proxy for an object
//! exported by a peer over a [`crate::transport::Connection`]. Both kinds support the same
//! three operations the runtime relies on: transact a call, link a death recipient, and
//! check liveness.

use crate::error::ChannelError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Payload of a transaction: opaque bytes plus any capabilities passed along.
#[derive(Default, Clone)]
pub struct Parcel {
    pub data: Vec<u8>,
    pub binders: Vec<Binder>,
}

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            data,
            binders: Vec::new(),
        }
    }

    pub fn with_binder(mut self, binder: Binder) -> Self {
        self.binders.push(binder);
        self
    }

    /// Removes and returns the first capability, if any.
    pub fn take_binder(&mut self) -> Option<Binder> {
        if self.binders.is_empty() {
            None
        } else {
            Some(self.binders.remove(0))
        }
    }
}

impl std::fmt::Debug for Parcel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parcel")
            .field("data_len", &self.data.len())
            .field("binders", &self.binders.len())
            .finish()
    }
}

/// Who is calling: the transport fills this in, callers cannot forge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub calling_uid: u32,
}

/// An object that can receive transactions.
pub trait BinderObject: Send + Sync + 'static {
    fn on_transact(&self, code: u32, data: Parcel, ctx: &CallContext)
        -> Result<Parcel, ChannelError>;
}

/// Notified once when the object behind a capability goes away.
pub trait DeathRecipient: Send + Sync {
    fn binder_died(&self);
}

/// Token returned by [`Binder::link_to_death`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeathLink(u64);

/// Liveness state shared by every handle to the same object (or connection).
pub struct Lifeline {
    dead: AtomicBool,
    next_link: AtomicU64,
    recipients: Mutex<Vec<(u64, Arc<dyn DeathRecipient>)>>,
}

impl Lifeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dead: AtomicBool::new(false),
            next_link: AtomicU64::new(1),
            recipients: Mutex::new(Vec::new()),
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::Acquire)
    }

    fn link(&self, recipient: Arc<dyn DeathRecipient>) -> Result<DeathLink, ChannelError> {
        let mut recipients = self.recipients.lock().unwrap_or_else(PoisonError::into_inner);
        // Checked under the lock so a concurrent kill() either sees us or we see it.
        if !self.is_alive() {
            return Err(ChannelError::DeadObject);
        }
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        recipients.push((id, recipient));
        Ok(DeathLink(id))
    }

    fn unlink(&self, link: DeathLink) -> bool {
        let mut recipients = self.recipients.lock().unwrap_or_else(PoisonError::into_inner);
        let before = recipients.len();
        recipients.retain(|(id, _)| *id != link.0);
        recipients.len() != before
    }

    /// Marks the object dead and notifies every linked recipient exactly once.
    pub fn kill(&self) {
        let drained = {
            let mut recipients = self.recipients.lock().unwrap_or_else(PoisonError::into_inner);
            if self.dead.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *recipients)
        };
        trace!(recipients = drained.len(), "Lifeline killed");
        for (_, recipient) in drained {
            recipient.binder_died();
        }
    }
}

/// The remote half of a capability, implemented by the socket transport.
pub trait RemoteChannel: Send + Sync {
    fn transact(
        &self,
        handle: u64,
        code: u32,
        data: Parcel,
        oneway: bool,
    ) -> Result<Parcel, ChannelError>;

    fn lifeline(&self) -> &Arc<Lifeline>;

    /// Drops the underlying connection.
    fn close(&self);

    /// Stable identity of the connection, used to compare proxies.
    fn channel_id(&self) -> u64;

    /// The last proxy for `handle` in this process went away.
    fn release(&self, handle: u64);
}

/// One imported handle, shared by every proxy [`Binder`] cloned from it.
pub(crate) struct RemoteRef {
    channel: Arc<dyn RemoteChannel>,
    handle: u64,
}

impl RemoteRef {
    pub(crate) fn new(channel: Arc<dyn RemoteChannel>, handle: u64) -> Arc<Self> {
        Arc::new(Self { channel, handle })
    }
}

impl Drop for RemoteRef {
    fn drop(&mut self) {
        self.channel.release(self.handle);
    }
}

struct LocalNode {
    object: Arc<dyn BinderObject>,
    lifeline: Arc<Lifeline>,
}

#[derive(Clone)]
enum Target {
    Local(Arc<LocalNode>),
    Remote(Arc<RemoteRef>),
}

/// A capability handle.
#[derive(Clone)]
pub struct Binder {
    target: Target,
    /// Uid reported to local objects; remote peers are identified by the transport instead.
    calling_uid: u32,
}

impl Binder {
    /// Wraps a local object. Calls made through this handle carry the current process uid.
    pub fn new<O: BinderObject>(object: O) -> Self {
        Self::from_arc(Arc::new(object))
    }

    pub fn from_arc(object: Arc<dyn BinderObject>) -> Self {
        Self {
            target: Target::Local(Arc::new(LocalNode {
                object,
                lifeline: Lifeline::new(),
            })),
            calling_uid: crate::env::current_uid(),
        }
    }

    pub(crate) fn remote(channel: Arc<dyn RemoteChannel>, handle: u64) -> Self {
        Self::from_remote(RemoteRef::new(channel, handle))
    }

    pub(crate) fn from_remote(remote: Arc<RemoteRef>) -> Self {
        Self {
            target: Target::Remote(remote),
            calling_uid: crate::env::current_uid(),
        }
    }

    /// Same object, but local calls report `uid` as the caller.
    ///
    /// In-process deliveries use this to stand in for the kernel-provided peer identity.
    pub fn with_calling_uid(&self, uid: u32) -> Self {
        Self {
            target: self.target.clone(),
            calling_uid: uid,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.target, Target::Local(_))
    }

    pub fn is_alive(&self) -> bool {
        self.lifeline().is_alive()
    }

    fn lifeline(&self) -> &Arc<Lifeline> {
        match &self.target {
            Target::Local(node) => &node.lifeline,
            Target::Remote(remote) => remote.channel.lifeline(),
        }
    }

    pub(crate) fn local_object(&self) -> Option<&Arc<dyn BinderObject>> {
        match &self.target {
            Target::Local(node) => Some(&node.object),
            Target::Remote(_) => None,
        }
    }

    /// `(channel id, handle)` for proxies.
    pub(crate) fn remote_handle(&self) -> Option<(u64, u64)> {
        match &self.target {
            Target::Local(_) => None,
            Target::Remote(remote) => Some((remote.channel.channel_id(), remote.handle)),
        }
    }

    /// Address of the local node, used to deduplicate exports.
    pub(crate) fn local_id(&self) -> Option<usize> {
        match &self.target {
            Target::Local(node) => Some(Arc::as_ptr(node) as *const () as usize),
            Target::Remote(_) => None,
        }
    }

    /// True when both handles refer to the same object.
    pub fn same_object(&self, other: &Binder) -> bool {
        match (&self.target, &other.target) {
            (Target::Local(a), Target::Local(b)) => Arc::ptr_eq(a, b),
            (Target::Remote(a), Target::Remote(b)) => {
                a.channel.channel_id() == b.channel.channel_id() && a.handle == b.handle
            }
            _ => false,
        }
    }

    pub fn transact(&self, code: u32, data: Parcel) -> Result<Parcel, ChannelError> {
        self.transact_inner(code, data, false)
    }

    /// Fire-and-forget call; the peer's reply (if any) is discarded.
    pub fn transact_oneway(&self, code: u32, data: Parcel) -> Result<(), ChannelError> {
        self.transact_inner(code, data, true).map(|_| ())
    }

    fn transact_inner(&self, code: u32, data: Parcel, oneway: bool) -> Result<Parcel, ChannelError> {
        match &self.target {
            Target::Local(node) => {
                if !node.lifeline.is_alive() {
                    return Err(ChannelError::DeadObject);
                }
                let ctx = CallContext {
                    calling_uid: self.calling_uid,
                };
                node.object.on_transact(code, data, &ctx)
            }
            Target::Remote(remote) => remote.channel.transact(remote.handle, code, data, oneway),
        }
    }

    /// Fails with [`ChannelError::DeadObject`] if the object is already gone.
    pub fn link_to_death(&self, recipient: Arc<dyn DeathRecipient>) -> Result<DeathLink, ChannelError> {
        self.lifeline().link(recipient)
    }

    /// Returns false if the link was already removed (or fired).
    pub fn unlink_to_death(&self, link: DeathLink) -> bool {
        self.lifeline().unlink(link)
    }

    /// Kills the object: local objects are marked dead, proxies close their connection.
    pub fn kill(&self) {
        match &self.target {
            Target::Local(node) => node.lifeline.kill(),
            Target::Remote(remote) => remote.channel.close(),
        }
    }
}

impl std::fmt::Debug for Binder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            Target::Local(node) => write!(f, "Binder(local@{:p})", Arc::as_ptr(node)),
            Target::Remote(remote) => {
                write!(f, "Binder(remote {}:{})", remote.channel.channel_id(), remote.handle)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Echo;

    impl BinderObject for Echo {
        fn on_transact(
            &self,
            code: u32,
            mut data: Parcel,
            ctx: &CallContext,
        ) -> Result<Parcel, ChannelError> {
            data.data.push(code as u8);
            data.data.extend_from_slice(&ctx.calling_uid.to_le_bytes());
            Ok(data)
        }
    }

    struct Counter(AtomicUsize);

    impl DeathRecipient for Counter {
        fn binder_died(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn local_transact_reports_calling_uid() {
        let binder = Binder::new(Echo).with_calling_uid(10_123);
        let reply = binder.transact(7, Parcel::from_data(vec![1])).unwrap();
        assert_eq!(reply.data[0], 1);
        assert_eq!(reply.data[1], 7);
        assert_eq!(&reply.data[2..], &10_123u32.to_le_bytes());
    }

    #[test]
    fn kill_notifies_each_recipient_once() {
        let binder = Binder::new(Echo);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        binder.link_to_death(counter.clone()).unwrap();
        binder.kill();
        binder.kill();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(!binder.is_alive());
        assert_eq!(
            binder.transact(1, Parcel::new()).unwrap_err(),
            ChannelError::DeadObject
        );
    }

    #[test]
    fn link_on_dead_object_fails() {
        let binder = Binder::new(Echo);
        binder.kill();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        assert_eq!(
            binder.link_to_death(counter).unwrap_err(),
            ChannelError::DeadObject
        );
    }

    #[test]
    fn unlink_prevents_notification() {
        let binder = Binder::new(Echo);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let link = binder.link_to_death(counter.clone()).unwrap();
        assert!(binder.unlink_to_death(link));
        assert!(!binder.unlink_to_death(link));
        binder.kill();
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn uid_views_share_identity_and_liveness() {
        let binder = Binder::new(Echo);
        let view = binder.with_calling_uid(42);
        assert!(binder.same_object(&view));
        view.kill();
        assert!(!binder.is_alive());
    }
}

//! Typed views over the manager and messenger capabilities.
//!
//! Proxies encode a call into a parcel and decode the reply. [`ManagerStub`] and
//! [`MessengerStub`] do the reverse on the receiving side and hand the decoded call to a
//! [`Manager`] or [`Messenger`] implementation.

use crate::binder::{Binder, BinderObject, CallContext, Parcel};
use crate::error::ChannelError;
use crate::intent::{ComponentName, Intent};
use crate::protocol::{
    BroadcastAddress, ManagerReply, ManagerRequest, MessengerMessage, MANAGER_CALL, MESSENGER_SEND,
};
use tracing::trace;

/// The privileged host's manager surface. `caller` is the transport-verified uid.
pub trait Manager: Send + Sync + 'static {
    fn connect(&self, caller: u32, messenger: Binder);
    fn bind(&self, caller: u32, intent: Intent) -> Option<Binder>;
    fn unbind(&self, caller: u32, component: ComponentName);
    fn stop(&self, caller: u32, component: ComponentName, uid: i32, reply_to: Option<BroadcastAddress>);
    fn broadcast(&self, caller: u32, uid: u32, reply_to: BroadcastAddress);
}

/// Receives liveness messages from a host.
pub trait Messenger: Send + Sync + 'static {
    fn on_message(&self, message: MessengerMessage);
}

/// Exposes a [`Manager`] as a capability.
pub struct ManagerStub<M>(pub M);

impl<M: Manager> BinderObject for ManagerStub<M> {
    fn on_transact(&self, code: u32, mut data: Parcel, ctx: &CallContext) -> Result<Parcel, ChannelError> {
        if code != MANAGER_CALL {
            return Err(ChannelError::Protocol(format!("unknown manager code {code}")));
        }
        let request = ManagerRequest::from_bytes(&data.data)?;
        trace!(caller = ctx.calling_uid, ?request, "Manager call");
        let caller = ctx.calling_uid;
        let reply = match request {
            ManagerRequest::Connect => {
                let messenger = data
                    .take_binder()
                    .ok_or_else(|| ChannelError::Protocol("connect without messenger".to_string()))?;
                self.0.connect(caller, messenger);
                return ok_reply(ManagerReply::Ok);
            }
            ManagerRequest::Bind { intent } => match self.0.bind(caller, intent) {
                Some(binder) => {
                    let mut parcel = ok_reply(ManagerReply::Bound { bound: true })?;
                    parcel.binders.push(binder);
                    return Ok(parcel);
                }
                None => ManagerReply::Bound { bound: false },
            },
            ManagerRequest::Unbind { component } => {
                self.0.unbind(caller, component);
                ManagerReply::Ok
            }
            ManagerRequest::Stop {
                component,
                uid,
                reply_to,
            } => {
                self.0.stop(caller, component, uid, reply_to);
                ManagerReply::Ok
            }
            ManagerRequest::Broadcast { uid, reply_to } => {
                self.0.broadcast(caller, uid, reply_to);
                ManagerReply::Ok
            }
        };
        ok_reply(reply)
    }
}

fn ok_reply(reply: ManagerReply) -> Result<Parcel, ChannelError> {
    Ok(Parcel::from_data(reply.to_bytes()?))
}

/// Client-side handle to a host's manager.
#[derive(Clone, Debug)]
pub struct ManagerProxy {
    binder: Binder,
}

impl ManagerProxy {
    pub fn new(binder: Binder) -> Self {
        Self { binder }
    }

    pub fn binder(&self) -> &Binder {
        &self.binder
    }

    fn call(&self, request: &ManagerRequest, binders: Vec<Binder>) -> Result<(ManagerReply, Parcel), ChannelError> {
        let parcel = Parcel {
            data: request.to_bytes()?,
            binders,
        };
        let reply = self.binder.transact(MANAGER_CALL, parcel)?;
        Ok((ManagerReply::from_bytes(&reply.data)?, reply))
    }

    pub fn connect(&self, messenger: Binder) -> Result<(), ChannelError> {
        self.call(&ManagerRequest::Connect, vec![messenger]).map(|_| ())
    }

    /// `Ok(None)` is a null binding.
    pub fn bind(&self, intent: &Intent) -> Result<Option<Binder>, ChannelError> {
        let request = ManagerRequest::Bind {
            intent: intent.clone(),
        };
        match self.call(&request, Vec::new())? {
            (ManagerReply::Bound { bound: true }, mut parcel) => parcel
                .take_binder()
                .map(Some)
                .ok_or_else(|| ChannelError::Protocol("bind reply without capability".to_string())),
            (ManagerReply::Bound { bound: false }, _) => Ok(None),
            (other, _) => Err(ChannelError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    pub fn unbind(&self, component: &ComponentName) -> Result<(), ChannelError> {
        let request = ManagerRequest::Unbind {
            component: component.clone(),
        };
        self.call(&request, Vec::new()).map(|_| ())
    }

    pub fn stop(
        &self,
        component: &ComponentName,
        uid: i32,
        reply_to: Option<BroadcastAddress>,
    ) -> Result<(), ChannelError> {
        let request = ManagerRequest::Stop {
            component: component.clone(),
            uid,
            reply_to,
        };
        self.call(&request, Vec::new()).map(|_| ())
    }

    pub fn broadcast(&self, uid: u32, reply_to: BroadcastAddress) -> Result<(), ChannelError> {
        self.call(&ManagerRequest::Broadcast { uid, reply_to }, Vec::new())
            .map(|_| ())
    }
}

/// Exposes a [`Messenger`] as a capability.
pub struct MessengerStub<M>(pub M);

impl<M: Messenger> BinderObject for MessengerStub<M> {
    fn on_transact(&self, code: u32, data: Parcel, _ctx: &CallContext) -> Result<Parcel, ChannelError> {
        if code != MESSENGER_SEND {
            return Err(ChannelError::Protocol(format!("unknown messenger code {code}")));
        }
        self.0.on_message(MessengerMessage::from_bytes(&data.data)?);
        Ok(Parcel::new())
    }
}

/// Host-side handle to a client's liveness messenger.
#[derive(Clone, Debug)]
pub struct MessengerProxy {
    binder: Binder,
}

impl MessengerProxy {
    pub fn new(binder: Binder) -> Self {
        Self { binder }
    }

    pub fn binder(&self) -> &Binder {
        &self.binder
    }

    pub fn send(&self, message: &MessengerMessage) -> Result<(), ChannelError> {
        self.binder
            .transact_oneway(MESSENGER_SEND, Parcel::from_data(message.to_bytes()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    struct Echo;

    impl BinderObject for Echo {
        fn on_transact(&self, _: u32, d: Parcel, _: &CallContext) -> Result<Parcel, ChannelError> {
            Ok(d)
        }
    }

    impl Manager for std::sync::Arc<Recording> {
        fn connect(&self, caller: u32, _messenger: Binder) {
            self.calls.lock().unwrap().push(format!("connect {caller}"));
        }

        fn bind(&self, caller: u32, intent: Intent) -> Option<Binder> {
            self.calls.lock().unwrap().push(format!("bind {caller}"));
            intent.get_extra("null").is_none().then(|| Binder::new(Echo))
        }

        fn unbind(&self, caller: u32, component: ComponentName) {
            self.calls.lock().unwrap().push(format!("unbind {caller} {component}"));
        }

        fn stop(&self, caller: u32, component: ComponentName, uid: i32, reply_to: Option<BroadcastAddress>) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("stop {caller} {component} {uid} {}", reply_to.is_some()));
        }

        fn broadcast(&self, caller: u32, uid: u32, reply_to: BroadcastAddress) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("broadcast {caller} {uid} {}", reply_to.action));
        }
    }

    #[test]
    fn test_proxy_drives_stub() {
        let recording = std::sync::Arc::new(Recording::default());
        let proxy = ManagerProxy::new(Binder::new(ManagerStub(recording.clone())).with_calling_uid(10_001));
        let component = ComponentName::new("p", ".S");

        proxy.connect(Binder::new(Echo)).unwrap();
        assert!(proxy.bind(&Intent::for_component(component.clone())).unwrap().is_some());
        assert!(proxy
            .bind(&Intent::for_component(component.clone()).extra("null", "1"))
            .unwrap()
            .is_none());
        proxy.unbind(&component).unwrap();
        proxy.stop(&component, -1, None).unwrap();
        proxy
            .broadcast(
                7,
                BroadcastAddress {
                    dir: String::new(),
                    action: "a".into(),
                },
            )
            .unwrap();

        assert_eq!(
            *recording.calls.lock().unwrap(),
            vec![
                "connect 10001",
                "bind 10001",
                "bind 10001",
                "unbind 10001 p/.S",
                "stop 10001 p/.S -1 false",
                "broadcast 10001 7 a",
            ]
        );
    }

    #[test]
    fn test_connect_requires_messenger() {
        let recording = std::sync::Arc::new(Recording::default());
        let stub = Binder::new(ManagerStub(recording));
        let parcel = Parcel::from_data(ManagerRequest::Connect.to_bytes().unwrap());
        assert!(matches!(
            stub.transact(MANAGER_CALL, parcel),
            Err(ChannelError::Protocol(_))
        ));
    }

    #[test]
    fn test_messenger_roundtrip() {
        struct Sink(Mutex<Vec<MessengerMessage>>);
        impl Messenger for std::sync::Arc<Sink> {
            fn on_message(&self, message: MessengerMessage) {
                self.0.lock().unwrap().push(message);
            }
        }
        let sink = std::sync::Arc::new(Sink(Mutex::new(Vec::new())));
        let proxy = MessengerProxy::new(Binder::new(MessengerStub(sink.clone())));
        let msg = MessengerMessage::ServiceStopped {
            component: ComponentName::new("p", ".S"),
            daemon: true,
        };
        proxy.send(&msg).unwrap();
        assert_eq!(*sink.0.lock().unwrap(), vec![msg]);
    }
}

use crate::binder::Binder;
use crate::broadcast::{BroadcastBus, HandshakeSink, Registration};
use crate::error::{ChannelError, LaunchError};
use crate::intent::ComponentName;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

pub const HANDSHAKE_ACTION_PREFIX: &str = "rootservice.intent.action.HANDSHAKE";

/// How long a client waits for a freshly launched host.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Broadcast action for the host serving `component` in the given process flavor.
pub fn handshake_action(component: &ComponentName, daemon: bool) -> String {
    let mut action = format!("{HANDSHAKE_ACTION_PREFIX}/{}", component.flatten());
    if daemon {
        action.push_str("#daemon");
    }
    action
}

/// What a host sends back once it is ready.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub manager: Binder,
    pub is_daemon: bool,
}

struct Latch {
    action: String,
    tx: Mutex<Option<oneshot::Sender<Handshake>>>,
}

impl HandshakeSink for Latch {
    fn deliver(&self, manager: Binder, daemon: bool) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => tx
                .send(Handshake {
                    manager,
                    is_daemon: daemon,
                })
                .is_ok(),
            None => {
                debug!(action = %self.action, "Ignoring duplicate handshake");
                false
            }
        }
    }
}

/// One-shot receiver for a host's manager capability.
///
/// Unregisters from the bus when it is dropped, which `wait` does on return.
pub struct HandshakeReceiver {
    action: String,
    rx: oneshot::Receiver<Handshake>,
    _registration: Registration,
}

impl HandshakeReceiver {
    pub fn register(bus: &dyn BroadcastBus, action: impl Into<String>) -> Result<Self, ChannelError> {
        let action = action.into();
        let (tx, rx) = oneshot::channel();
        let latch = Arc::new(Latch {
            action: action.clone(),
            tx: Mutex::new(Some(tx)),
        });
        let registration = bus.register(&action, latch)?;
        Ok(Self {
            action,
            rx,
            _registration: registration,
        })
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub async fn wait(self, timeout: Duration) -> Result<Handshake, LaunchError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(handshake)) => {
                info!(action = %self.action, daemon = handshake.is_daemon, "Handshake complete");
                Ok(handshake)
            }
            Ok(Err(_)) => Err(LaunchError::ReceiverClosed),
            Err(_) => Err(LaunchError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{BinderObject, CallContext, Parcel};
    use crate::broadcast::LocalBus;

    struct Nop;

    impl BinderObject for Nop {
        fn on_transact(&self, _: u32, d: Parcel, _: &CallContext) -> Result<Parcel, ChannelError> {
            Ok(d)
        }
    }

    #[test]
    fn test_action_names() {
        let c = ComponentName::new("io.example", ".Svc");
        assert_eq!(
            handshake_action(&c, false),
            "rootservice.intent.action.HANDSHAKE/io.example/io.example.Svc"
        );
        assert!(handshake_action(&c, true).ends_with("#daemon"));
    }

    #[tokio::test]
    async fn test_first_delivery_wins() {
        let bus = LocalBus::new();
        let receiver = HandshakeReceiver::register(bus.as_ref(), "act").unwrap();
        let first = Binder::new(Nop);
        bus.send(&bus.address("act"), &first, true, 0).unwrap();
        bus.send(&bus.address("act"), &Binder::new(Nop), false, 0).unwrap();

        let handshake = receiver.wait(Duration::from_secs(1)).await.unwrap();
        assert!(handshake.is_daemon);
        assert!(handshake.manager.same_object(&first));
        assert!(!bus.is_registered("act"));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let bus = LocalBus::new();
        let receiver = HandshakeReceiver::register(bus.as_ref(), "act").unwrap();
        let err = receiver.wait(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, LaunchError::Timeout(Duration::from_millis(20)));
        assert!(!bus.is_registered("act"));
    }
}

//! Services bundled with the `rootsvc` binary.

use rootservice::{env, Binder, BinderObject, CallContext, ChannelError, Intent, Parcel, RootService};
use rootservice::{ServiceContext, ServiceFactoryRegistry};
use tracing::info;

pub(crate) const PING_SERVICE: &str = "rootservice.demo.PingService";

const PING: u32 = 1;

/// Answers pings with the host's pid and uid.
#[derive(Default)]
pub(crate) struct PingService {
    component: Option<String>,
}

impl RootService for PingService {
    fn on_create(&mut self, ctx: &ServiceContext) {
        info!(component = %ctx.component(), daemon = ctx.is_daemon(), "Ping service created");
        self.component = Some(ctx.component().to_string());
    }

    fn on_bind(&mut self, _intent: &Intent) -> Option<Binder> {
        Some(Binder::new(Pinger))
    }

    fn on_unbind(&mut self, intent: &Intent) -> bool {
        intent.is_daemon()
    }

    fn on_destroy(&mut self) {
        info!(component = ?self.component, "Ping service destroyed");
    }
}

struct Pinger;

impl BinderObject for Pinger {
    fn on_transact(&self, code: u32, data: Parcel, ctx: &CallContext) -> Result<Parcel, ChannelError> {
        if code != PING {
            return Err(ChannelError::Protocol(format!("unknown ping code {code}")));
        }
        let message = String::from_utf8_lossy(&data.data);
        let reply = format!(
            "pong from pid {} uid {} to uid {}: {message}",
            env::current_pid(),
            env::current_uid(),
            ctx.calling_uid
        );
        Ok(Parcel::from_data(reply.into_bytes()))
    }
}

/// Blocking; call from a looper or blocking-pool thread.
pub(crate) fn ping(binder: &Binder, message: &str) -> Result<String, ChannelError> {
    let reply = binder.transact(PING, Parcel::from_data(message.as_bytes().to_vec()))?;
    Ok(String::from_utf8_lossy(&reply.data).into_owned())
}

pub(crate) fn factories() -> ServiceFactoryRegistry {
    let mut factories = ServiceFactoryRegistry::new();
    factories.register_default::<PingService>(PING_SERVICE);
    factories
}

pub mod binder;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod death;
pub mod env;
pub mod error;
pub mod handshake;
pub mod host;
pub mod intent;
pub mod launcher;
pub mod logging;
pub mod looper;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod service;
pub mod shell;
pub mod transport;

pub use binder::{Binder, BinderObject, CallContext, Parcel};
pub use client::{RootServiceClient, ServiceBindingRegistry, ServiceConnection, TaskRunner};
pub use config::RuntimeConfig;
pub use error::{ChannelError, HostError, LaunchError, Result, RootServiceError};
pub use host::{ExitReason, HostOptions, RootServiceHost};
pub use intent::{ComponentName, Intent, ServiceKey};
pub use looper::Looper;
pub use service::{RootService, ServiceContext, ServiceFactoryRegistry};

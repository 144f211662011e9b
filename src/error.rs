use std::time::Duration;
use thiserror::Error;

/// A remote capability is dead or a transaction could not be completed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("remote object is dead")]
    DeadObject,

    #[error("transport I/O failure: {0}")]
    Io(String),

    #[error("malformed transaction: {0}")]
    Protocol(String),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Io(e.to_string())
    }
}

impl From<rkyv::rancor::Error> for ChannelError {
    fn from(e: rkyv::rancor::Error) -> Self {
        ChannelError::Protocol(e.to_string())
    }
}

/// The privileged process could not be launched or never answered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("failed to prepare launch: {0}")]
    Io(String),

    #[error("privileged shell exited with status {0}")]
    ShellFailed(i32),

    #[error("privileged shell did not finish within {0:?}")]
    ShellTimeout(Duration),

    #[error("no handshake from privileged process within {0:?}")]
    Timeout(Duration),

    #[error("handshake receiver closed before delivery")]
    ReceiverClosed,

    #[error("privileged process rejected connection: {0}")]
    Connect(ChannelError),

    #[error("task queue has been shut down")]
    QueueShutdown,
}

impl From<std::io::Error> for LaunchError {
    fn from(e: std::io::Error) -> Self {
        LaunchError::Io(e.to_string())
    }
}

/// Failures inside the privileged host.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("no factory registered for service class '{0}'")]
    ServiceResolution(String),

    #[error("intent has no component")]
    MissingComponent,

    #[error("unknown launch action '{0}'")]
    UnknownAction(String),

    #[error("unknown entry point '{0}'")]
    UnknownEntryPoint(String),

    #[error("invalid trampoline arguments: {0}")]
    InvalidArguments(String),

    #[error("main looper is gone")]
    LooperGone,

    #[error("a daemon is already listening on {}", .0.display())]
    DaemonRunning(std::path::PathBuf),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the client-side API.
#[derive(Error, Debug)]
pub enum RootServiceError {
    #[error("this method can only be called on the main looper thread")]
    NotOnMainThread,

    #[error("the intent does not have a component set")]
    MissingComponent,

    #[error("root services outside of package '{expected}' are not supported (got '{actual}')")]
    ForeignPackage { expected: String, actual: String },

    #[error("connection is already bound to {0}")]
    ConnectionInUse(String),

    #[error("invalid component name '{0}'")]
    InvalidComponent(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RootServiceError>;

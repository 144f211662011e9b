//! The privileged process: host runtime, code-path watch and trampoline entry.

mod observer;
mod server;
pub mod trampoline;

pub use observer::CodePathObserver;
pub use server::{
    connect_daemon, daemon_socket_path, ExitReason, HostOptions, RootServiceHost, DEFAULT_IDLE_TIMEOUT,
};

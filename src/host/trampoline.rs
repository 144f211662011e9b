//! Entry point of the privileged process spawned by the launch line.
//!
//! argv: `[-X<opt>...] [--debuggable] --nice-name=<name> <entry> <component> <uid> <action>`

use super::server::{connect_daemon, HostOptions, RootServiceHost};
use crate::broadcast::{BroadcastBus, SocketBus};
use crate::env;
use crate::error::HostError;
use crate::handshake::handshake_action;
use crate::intent::ComponentName;
use crate::launcher::{LaunchAction, HOST_ENTRY_POINT};
use crate::logging;
use crate::looper::Looper;
use crate::manager::ManagerProxy;
use crate::service::ServiceFactoryRegistry;
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const DEBUGGER_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug, Clone)]
#[command(name = "rootsvc-main", disable_help_flag = true, disable_version_flag = true)]
pub struct TrampolineArgs {
    /// Runtime options meant for a managed launcher; accepted and ignored
    #[arg(short = 'X', action = clap::ArgAction::Append, allow_hyphen_values = true)]
    pub runtime_options: Vec<String>,

    #[arg(long)]
    pub debuggable: bool,

    /// Process name, `<package>:priv:<uid>`
    #[arg(long = "nice-name")]
    pub nice_name: String,

    pub entry: String,

    /// Flattened component of the first service
    pub component: String,

    /// Uid of the launching client
    pub uid: u32,

    pub action: String,
}

/// The launch line always passes `--nice-name=`; a normal CLI invocation never does.
pub fn is_trampoline_invocation<I, S>(args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter().any(|a| a.as_ref().starts_with("--nice-name="))
}

/// Validated trampoline request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub nice_name: String,
    pub component: ComponentName,
    pub uid: u32,
    pub action: LaunchAction,
}

impl TryFrom<TrampolineArgs> for Invocation {
    type Error = HostError;

    fn try_from(args: TrampolineArgs) -> Result<Self, Self::Error> {
        if args.entry != HOST_ENTRY_POINT {
            return Err(HostError::UnknownEntryPoint(args.entry));
        }
        let component = ComponentName::unflatten(&args.component)
            .ok_or_else(|| HostError::InvalidArguments(format!("bad component '{}'", args.component)))?;
        let action = args
            .action
            .parse()
            .map_err(|_| HostError::UnknownAction(args.action.clone()))?;
        Ok(Self {
            nice_name: args.nice_name,
            component,
            uid: args.uid,
            action,
        })
    }
}

/// Parses argv (including the program name) into an invocation.
pub fn parse<I, S>(argv: I) -> Result<Invocation, HostError>
where
    I: IntoIterator<Item = S>,
    S: Into<std::ffi::OsString> + Clone,
{
    let args = TrampolineArgs::try_parse_from(argv)
        .map_err(|e| HostError::InvalidArguments(e.kind().to_string()))?;
    debug!(?args, "Trampoline arguments");
    Invocation::try_from(args)
}

/// Points stdout and stderr at `/dev/null`; they belong to the launching shell.
fn silence_stdio() -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let null = std::fs::OpenOptions::new().write(true).open("/dev/null")?;
    for fd in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_process_name(name: &str) {
    // The kernel keeps 15 bytes plus the terminator.
    let truncated: Vec<u8> = name.bytes().filter(|b| *b != 0).take(15).collect();
    let Ok(name) = std::ffi::CString::new(truncated) else {
        return;
    };
    // SAFETY: PR_SET_NAME reads a NUL-terminated string that outlives the call.
    unsafe {
        libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_process_name(_name: &str) {}

fn wait_for_debugger(timeout: Duration) {
    info!(pid = env::current_pid(), "Waiting for debugger");
    let deadline = Instant::now() + timeout;
    while !env::debugger_attached() {
        if Instant::now() >= deadline {
            warn!(?timeout, "No debugger attached; continuing");
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("Debugger attached");
}

/// Hands off to a daemon that is already running. Returns true when one answered.
fn hand_off(runtime: &tokio::runtime::Runtime, invocation: &Invocation, bus: &SocketBus) -> bool {
    let service_dir = env::service_dir();
    let package = &invocation.component.package;
    let Some(manager): Option<ManagerProxy> = runtime.block_on(connect_daemon(&service_dir, package)) else {
        return false;
    };
    let address = bus.address(&handshake_action(&invocation.component, true));
    let result = match invocation.action {
        LaunchAction::StopServer => {
            let uid = i32::try_from(invocation.uid).unwrap_or(-1);
            manager.stop(&invocation.component, uid, Some(address))
        }
        _ => manager.broadcast(invocation.uid, address),
    };
    match result {
        Ok(()) => info!(action = %invocation.action, "Handed off to running daemon"),
        Err(e) => warn!(action = %invocation.action, error = %e, "Running daemon did not answer"),
    }
    true
}

/// Runs the host for `invocation` until it exits. Returns the process exit code.
pub fn run(invocation: Invocation, factories: ServiceFactoryRegistry) -> i32 {
    match execute(invocation, factories) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Host failed");
            1
        }
    }
}

fn execute(invocation: Invocation, factories: ServiceFactoryRegistry) -> Result<(), HostError> {
    set_process_name(&invocation.nice_name);
    if env::debugger_requested() {
        wait_for_debugger(DEBUGGER_WAIT);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("rootsvc-io")
        .build()?;
    let bus = Arc::new(SocketBus::new(env::broadcast_dir(), runtime.handle().clone()));
    let daemon = invocation.action.is_daemon();

    if daemon && hand_off(&runtime, &invocation, &bus) {
        return Ok(());
    }
    if invocation.action == LaunchAction::StopServer {
        debug!(component = %invocation.component, "No daemon to stop");
        return Ok(());
    }

    let (looper, runner) = Looper::prepare("main");
    let host = RootServiceHost::new(
        HostOptions::from_env(invocation.component.package.clone(), daemon),
        looper,
        runtime.handle().clone(),
        factories,
        bus.clone(),
    );
    match host.start(&invocation.component, invocation.uid) {
        Err(HostError::DaemonRunning(path)) => {
            info!(path = %path.display(), "Another daemon came up first");
            host.shutdown();
            hand_off(&runtime, &invocation, &bus);
            return Ok(());
        }
        started => started?,
    }

    let waiter = Arc::clone(&host);
    runtime.spawn(async move {
        let reason = waiter.exited().await;
        debug!(?reason, "Stopping main looper");
        waiter.looper().quit();
    });
    runner.run();

    host.shutdown();
    info!(reason = ?host.exit_reason(), "Host exited");
    Ok(())
}

/// Process entry for trampoline mode: silences stdio, sets up logging, runs the host.
pub fn main(argv: Vec<String>, factories: ServiceFactoryRegistry) -> i32 {
    if let Err(e) = silence_stdio() {
        warn!(error = %e, "Could not detach from the launching shell");
    }
    if let Err(e) = logging::init_host(&env::service_dir(), env::verbose_logging()) {
        warn!(error = %e, "Host log file unavailable");
    }
    match parse(argv) {
        Ok(invocation) => run(invocation, factories),
        Err(e) => {
            error!(error = %e, "Invalid trampoline arguments");
            1
        }
    }
}

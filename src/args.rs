use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rootsvc")]
#[command(version)]
#[command(about = "Launch, bind and stop services in a privileged process", long_about = None)]
pub(crate) struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Bind a service, launching its privileged host if needed
    Bind {
        /// Component to bind (e.g., io.example/.PingService)
        component: String,

        /// Bind in the daemon host, which outlives this client
        #[arg(short, long)]
        daemon: bool,

        /// Message to send through the demo ping capability
        #[arg(short, long)]
        ping: Option<String>,

        /// Seconds to stay bound before unbinding
        #[arg(long, default_value = "0")]
        hold: u64,
    },

    /// Stop a service, in this client's host or a running daemon
    Stop {
        /// Component to stop
        component: String,

        /// Target the daemon host
        #[arg(short, long)]
        daemon: bool,
    },

    /// List service classes this binary can host
    Services,

    /// Show or change runtime configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigCommands {
    /// Show the effective configuration
    Show {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the config file location
    Path,

    /// Set a value in the config file
    Set {
        /// One of: package, elevation, launch_binary, staging_dir, api_level, verbose
        key: String,
        value: String,
    },
}

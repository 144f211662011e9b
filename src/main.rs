mod args;
mod commands;
mod demo;
mod init;

use args::{Cli, Commands};
use clap::Parser;
use rootservice::host::trampoline;

fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    // Spawned by a launch line: become the privileged host.
    if trampoline::is_trampoline_invocation(argv.iter().skip(1)) {
        std::process::exit(trampoline::main(argv, demo::factories()));
    }

    let cli = Cli::parse();
    init::initialize(cli.verbose);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli.command))
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Bind {
            component,
            daemon,
            ping,
            hold,
        } => commands::bind::cmd_bind(&component, daemon, ping, hold).await?,
        Commands::Stop { component, daemon } => commands::stop::cmd_stop(&component, daemon).await?,
        Commands::Services => commands::services::cmd_services()?,
        Commands::Config { command } => commands::config::cmd_config(command)?,
    }
    Ok(())
}

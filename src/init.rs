use rootservice::{env, logging};

/// Loads `.env` and sets up stderr logging for CLI mode.
pub(crate) fn initialize(verbose: bool) {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring .env: {e}");
        }
    }
    logging::init_cli(verbose || env::verbose_logging());
    tracing::trace!(config_dir = %env::config_dir().display(), "CLI initialized");
}

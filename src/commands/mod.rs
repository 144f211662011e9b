pub(crate) mod bind;
pub(crate) mod config;
pub(crate) mod services;
pub(crate) mod stop;

use rootservice::{Looper, RootServiceClient, RuntimeConfig};
use std::sync::Arc;
use tokio::runtime::Handle;

/// A client with its own main looper thread.
pub(crate) fn client(config: &RuntimeConfig) -> anyhow::Result<Arc<RootServiceClient>> {
    let looper = Looper::spawn("main")?;
    Ok(RootServiceClient::from_config(config, looper, Handle::current())?)
}

/// Runs `f` on `looper` from async code.
pub(crate) async fn on_looper<F, R>(looper: &Looper, f: F) -> anyhow::Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let looper = looper.clone();
    let result = tokio::task::spawn_blocking(move || looper.run_and_wait(f)).await?;
    Ok(result?)
}

use rootservice::{ComponentName, Intent, RuntimeConfig};
use std::sync::Arc;

use super::{client, on_looper};

pub(crate) async fn cmd_stop(component: &str, daemon: bool) -> anyhow::Result<()> {
    let config = RuntimeConfig::load()?;
    let component: ComponentName = component.parse()?;
    if !daemon {
        // On-demand hosts belong to the client that launched them and die with it.
        println!("Only daemon services outlive their client; nothing to stop for {component}");
        return Ok(());
    }
    let client = client(&config)?;
    let intent = Intent::for_component(component.clone()).daemon();

    let c = Arc::clone(&client);
    on_looper(client.looper(), move || c.stop(&intent)).await??;
    client.flush().await?;
    on_looper(client.looper(), || ()).await?;

    println!("Stop requested for {component}");
    client.looper().quit();
    Ok(())
}

use anyhow::{anyhow, bail};
use rootservice::{Binder, ComponentName, Intent, LaunchError, RuntimeConfig, ServiceConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{client, on_looper};
use crate::demo;

enum Event {
    Connected(Binder),
    Null,
    Failed(String),
    Disconnected,
}

struct CliConnection {
    tx: mpsc::UnboundedSender<Event>,
}

impl CliConnection {
    fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl ServiceConnection for CliConnection {
    fn on_service_connected(&self, name: &ComponentName, service: Binder) {
        tracing::debug!(%name, "Connected");
        self.emit(Event::Connected(service));
    }

    fn on_service_disconnected(&self, name: &ComponentName) {
        tracing::debug!(%name, "Disconnected");
        self.emit(Event::Disconnected);
    }

    fn on_null_binding(&self, _name: &ComponentName) {
        self.emit(Event::Null);
    }

    fn on_bind_failed(&self, _name: &ComponentName, error: &LaunchError) {
        self.emit(Event::Failed(error.to_string()));
    }
}

pub(crate) async fn cmd_bind(
    component: &str,
    daemon: bool,
    ping: Option<String>,
    hold: u64,
) -> anyhow::Result<()> {
    let config = RuntimeConfig::load()?;
    let component: ComponentName = component.parse()?;
    let client = client(&config)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn: Arc<dyn ServiceConnection> = Arc::new(CliConnection { tx });
    let mut intent = Intent::for_component(component.clone());
    if daemon {
        intent = intent.daemon();
    }

    let (c, cn) = (Arc::clone(&client), Arc::clone(&conn));
    on_looper(client.looper(), move || c.bind_on_main(&intent, cn)).await??;

    let wait = config.handshake_timeout() + config.shell_timeout();
    let event = tokio::time::timeout(wait, rx.recv())
        .await
        .map_err(|_| anyhow!("timed out waiting for {component}"))?;
    match event {
        Some(Event::Connected(binder)) => {
            println!("Connected to {component}");
            if let Some(message) = ping {
                let reply = tokio::task::spawn_blocking(move || demo::ping(&binder, &message)).await??;
                println!("{reply}");
            }
        }
        Some(Event::Null) => println!("{component} returned a null binding"),
        Some(Event::Failed(e)) => bail!("bind failed: {e}"),
        Some(Event::Disconnected) | None => bail!("{component} disconnected"),
    }

    if hold > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(hold)) => {}
            Some(Event::Disconnected) = rx.recv() => println!("{component} disconnected"),
        }
    }

    let c = Arc::clone(&client);
    on_looper(client.looper(), move || c.unbind(&conn)).await??;
    client.shutdown();
    client.looper().quit();
    Ok(())
}

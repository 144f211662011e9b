use anyhow::{bail, Context};
use rootservice::RuntimeConfig;

use crate::args::ConfigCommands;

pub(crate) fn cmd_config(command: Option<ConfigCommands>) -> anyhow::Result<()> {
    match command {
        Some(ConfigCommands::Show { json }) => cmd_config_show(json),
        Some(ConfigCommands::Path) => {
            println!("{}", RuntimeConfig::config_path().display());
            Ok(())
        }
        Some(ConfigCommands::Set { key, value }) => cmd_config_set(&key, &value),
        None => cmd_config_show(false),
    }
}

fn cmd_config_show(json: bool) -> anyhow::Result<()> {
    let config = RuntimeConfig::load()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let show = |label: &str, value: String| println!("{label:<18} {value}");
    let or_default = |value: Option<String>| value.unwrap_or_else(|| "default".to_string());

    show("Package", config.package.clone().unwrap_or_else(|| "not set".to_string()));
    show("Elevation", format!("{:?}", config.elevation).to_lowercase());
    show("Launch binary", or_default(config.launch_binary.clone()));
    show(
        "Staging dir",
        or_default(config.staging_dir.as_ref().map(|p| p.display().to_string())),
    );
    show("Broadcast dir", config.broadcast_dir().display().to_string());
    show("Handshake timeout", format!("{:?}", config.handshake_timeout()));
    show("Config file", RuntimeConfig::config_path().display().to_string());
    Ok(())
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => bail!("Invalid value '{}'. Use 'true' or 'false'.", value),
    }
}

fn cmd_config_set(key: &str, value: &str) -> anyhow::Result<()> {
    let path = RuntimeConfig::config_path();
    let mut config = RuntimeConfig::load_from(&path)?;
    match key {
        "package" => config.package = Some(value.to_string()),
        "elevation" => config.elevation = value.parse().map_err(anyhow::Error::msg)?,
        "launch_binary" => config.launch_binary = Some(value.to_string()),
        "staging_dir" => config.staging_dir = Some(value.into()),
        "api_level" => {
            config.api_level = Some(value.parse().with_context(|| format!("'{value}' is not an API level"))?)
        }
        "verbose" => config.verbose = Some(parse_bool(value)?),
        other => bail!("Unknown config key '{other}'"),
    }
    config.save_to(&path)?;
    println!("Set {key} = {value}");
    Ok(())
}

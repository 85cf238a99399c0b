use std::path::PathBuf;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use log::{debug, info};

mod beacon;
mod config;
mod manager;
mod messages;
mod monitor;
mod mqtt;
mod notifier;
mod presence;
mod scanner;

/// Watches for BLE beacons and posts presence notifications over MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let cli = Cli::parse();
    let config_contents = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;

    let config: config::AppConfig = toml::de::from_str(&config_contents)?;

    info!("Region: {}", config.region());
    debug!("Scan config: {:?}", config.scan());

    let (mqtt_client, eventloop) = mqtt::MqttClient::new(&config.mqtt);
    mqtt_client.subscribe().await?;

    let bt_manager = Manager::new().await?;

    // get the first bluetooth adapter
    let adapters = bt_manager.adapters().await?;
    let central = adapters
        .into_iter()
        .next()
        .context("no bluetooth adapter found")?;

    let core = manager::Manager::new(central, &config, mqtt_client, eventloop);
    core.run_loop().await?;

    Ok(())
}

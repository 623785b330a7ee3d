use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::{LevelFilter, info};

mod bridge;
mod config;
mod discovery;
mod link;
mod messages;
mod mqtt;
mod presence;
mod publisher;
mod sender;
mod sensor;
mod udp_link;
mod wire;

use link::Link as _;
use udp_link::{LinkMode, UdpLink};

#[derive(Parser, Debug)]
#[command(version, about = "Bridge sensor telemetry from a broadcast link to MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Role {
    /// Sample the configured sensors and broadcast their readings
    Publish,
    /// Listen on the link and republish readings to the MQTT broker
    Bridge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let config = config::AppConfig::load(&cli.config)?;

    match cli.role {
        Role::Publish => run_publisher(&config).await,
        Role::Bridge => run_bridge(&config).await,
    }
}

async fn run_publisher(config: &config::AppConfig) -> anyhow::Result<()> {
    let publisher_config = config
        .publisher
        .as_ref()
        .context("publish role requires a [publisher] section")?;

    let (link, channels) = UdpLink::bring_up(&config.link, LinkMode::Transmit)
        .context("bringing up broadcast link")?;
    let address = link.address();
    let sender = sender::ReliableSender::new(link, channels.delivery, publisher_config.retry_policy());
    info!(
        "Sending from {} (worst-case send latency {:?})",
        address,
        sender.policy().worst_case()
    );

    publisher::Publisher::new(publisher_config, sender)
        .run_loop()
        .await
}

async fn run_bridge(config: &config::AppConfig) -> anyhow::Result<()> {
    let mqtt_config = config
        .mqtt
        .as_ref()
        .context("bridge role requires an [mqtt] section")?;
    let bridge_config = config.bridge.clone().unwrap_or_default();

    let (_link, channels) = UdpLink::bring_up(&config.link, LinkMode::Receive)
        .context("bringing up broadcast link")?;

    let (mqtt_client, eventloop) = mqtt::MqttClient::new(mqtt_config);
    info!(
        "Bridging to MQTT broker {} (availability={})",
        mqtt_config.host,
        if bridge_config.publish_availability() { "yes" } else { "no" }
    );

    bridge::Bridge::new(&bridge_config, channels.packets, mqtt_client, eventloop)
        .run_loop()
        .await
}

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, bail};
use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::presence::DEFAULT_DEVICE_TIMEOUT;
use crate::sender::{DELIVERY_TIMEOUT, MAX_RETRIES, RETRY_DELAY, RetryPolicy};
use crate::wire::Category;

const DEFAULT_PORT_BASE: u16 = 47100;
const MAX_CONFIGURABLE_RETRIES: u8 = 10;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub link: LinkConfig,
    pub mqtt: Option<MqttConfig>,
    pub bridge: Option<BridgeConfig>,
    pub publisher: Option<PublisherConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let channel = self.link.channel();
        if !(1..=13).contains(&channel) {
            bail!("link.channel must be between 1 and 13, got {}", channel);
        }
        if let Some(publisher) = &self.publisher {
            if publisher.name.trim().is_empty() {
                bail!("publisher.name must not be empty");
            }
            if publisher.max_retries.unwrap_or(MAX_RETRIES) > MAX_CONFIGURABLE_RETRIES {
                bail!("publisher.max_retries must be at most {}", MAX_CONFIGURABLE_RETRIES);
            }
            for sensor in &publisher.sensors {
                if sensor.interval_seconds == Some(0) {
                    bail!("sensor {}: interval_seconds must be positive", sensor.name);
                }
            }
        }
        if let Some(bridge) = &self.bridge {
            if bridge.sweep_interval_seconds == Some(0) {
                bail!("bridge.sweep_interval_seconds must be positive");
            }
        }
        Ok(())
    }
}

/// Settings of the broadcast link. Every node on the same channel hears every
/// other node.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct LinkConfig {
    pub channel: Option<u8>,
    pub long_range_mode: Option<bool>,
    pub address: Option<MacAddress>,
    pub port_base: Option<u16>,
    pub broadcast_ip: Option<IpAddr>,
    pub bind_ip: Option<IpAddr>,
}

impl LinkConfig {
    pub fn channel(&self) -> u8 {
        self.channel.unwrap_or(1)
    }

    pub fn long_range_mode(&self) -> bool {
        self.long_range_mode.unwrap_or(true)
    }

    /// Each channel gets its own UDP port.
    pub fn port(&self) -> u16 {
        self.port_base
            .unwrap_or(DEFAULT_PORT_BASE)
            .saturating_add(u16::from(self.channel()))
    }

    pub fn broadcast_ip(&self) -> IpAddr {
        self.broadcast_ip.unwrap_or(IpAddr::V4(Ipv4Addr::BROADCAST))
    }

    pub fn bind_ip(&self) -> IpAddr {
        self.bind_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Configured address, or the MAC of the first host interface.
    pub fn link_address(&self) -> anyhow::Result<MacAddress> {
        if let Some(address) = self.address {
            return Ok(address);
        }
        mac_address::get_mac_address()
            .context("reading host MAC address")?
            .context("no interface with a MAC address found, set link.address")
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub discovery_prefix: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct BridgeConfig {
    pub publish_availability: Option<bool>,
    pub device_timeout_seconds: Option<u64>,
    pub sweep_interval_seconds: Option<u64>,
    pub manufacturer: Option<String>,
}

impl BridgeConfig {
    pub fn publish_availability(&self) -> bool {
        self.publish_availability.unwrap_or(true)
    }

    pub fn device_timeout(&self) -> Duration {
        self.device_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DEVICE_TIMEOUT)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.unwrap_or(60))
    }

    pub fn manufacturer(&self) -> &str {
        self.manufacturer.as_deref().unwrap_or("espressif")
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PublisherConfig {
    pub name: String,
    pub firmware_version: Option<String>,
    pub model: Option<String>,
    pub max_retries: Option<u8>,
    pub retry_delay_ms: Option<u64>,
    pub delivery_timeout_ms: Option<u64>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

impl PublisherConfig {
    pub fn firmware_version(&self) -> &str {
        self.firmware_version
            .as_deref()
            .unwrap_or(env!("CARGO_PKG_VERSION"))
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(std::env::consts::ARCH)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(MAX_RETRIES),
            retry_delay: self
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(RETRY_DELAY),
            delivery_timeout: self
                .delivery_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DELIVERY_TIMEOUT),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct SensorConfig {
    pub name: String,
    pub kind: Option<Category>,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub unit: Option<String>,
    pub icon: Option<String>,
    pub accuracy_decimals: Option<i8>,
    /// Shell command whose output is the sensor value.
    pub command: String,
    pub interval_seconds: Option<u64>,
    pub on_change_only: Option<bool>,
}

impl SensorConfig {
    pub fn kind(&self) -> Category {
        self.kind.unwrap_or(Category::Sensor)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.unwrap_or(60))
    }

    pub fn on_change_only(&self) -> bool {
        self.on_change_only.unwrap_or(false)
    }
}

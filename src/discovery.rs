//! Broker-side rendering of received lines.
//!
//! Every well-formed line produces a discovery document and a state update.
//! Discovery is republished on every reception, not only the first one, so a
//! broker that lost its retained messages is repopulated by the next packet.

use log::debug;
use rumqttc::QoS;
use serde_derive::Serialize;

use crate::messages::DeviceAnnouncement;
use crate::presence::DeviceKey;
use crate::wire::{Category, Frame};

/// A publish operation waiting to be handed to the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl Publication {
    fn retained(topic: String, payload: String) -> Self {
        Publication {
            topic,
            payload,
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct SensorDiscovery<'a> {
    #[serde(rename = "dev_cla", skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(rename = "unit_of_meas", skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(rename = "stat_cla", skip_serializing_if = "Option::is_none")]
    state_class: Option<&'a str>,
    #[serde(flatten)]
    common: CommonDiscovery<'a>,
}

#[derive(Debug, Serialize)]
struct BinarySensorDiscovery<'a> {
    #[serde(rename = "dev_cla", skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(flatten)]
    common: CommonDiscovery<'a>,
}

#[derive(Debug, Serialize)]
struct CommonDiscovery<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
    #[serde(rename = "stat_t")]
    state_topic: String,
    #[serde(rename = "avty_t", skip_serializing_if = "Option::is_none")]
    availability_topic: Option<String>,
    #[serde(rename = "uniq_id")]
    unique_id: String,
    #[serde(rename = "dev")]
    device: DeviceInfo<'a>,
}

#[derive(Debug, Serialize)]
struct DeviceInfo<'a> {
    ids: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    sw: &'a str,
    mdl: &'a str,
    mf: &'a str,
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() { None } else { Some(value) }
}

pub fn state_topic(device_name: &str, category: Category, measurement_name: &str) -> String {
    format!(
        "{}/{}/{}/state",
        device_name,
        category.topic_segment(),
        measurement_name
    )
}

pub fn config_topic(
    discovery_prefix: &str,
    device_name: &str,
    category: Category,
    measurement_name: &str,
) -> String {
    format!(
        "{}/{}/{}/{}/config",
        discovery_prefix,
        category.topic_segment(),
        device_name,
        measurement_name
    )
}

pub fn availability_topic(device_name: &str) -> String {
    format!("{}/status", device_name)
}

#[derive(Debug, Clone)]
pub struct DiscoveryPublisher {
    manufacturer: String,
    publish_availability: bool,
}

impl DiscoveryPublisher {
    pub fn new(manufacturer: &str, publish_availability: bool) -> Self {
        DiscoveryPublisher {
            manufacturer: manufacturer.to_string(),
            publish_availability,
        }
    }

    /// Discovery config followed by state for one received line.
    ///
    /// Lines without a device or measurement name cannot be addressed and
    /// yield nothing.
    pub fn handle(
        &self,
        frame: &Frame<'_>,
        device_key: &DeviceKey,
        discovery_prefix: &str,
    ) -> Result<Vec<Publication>, serde_json::Error> {
        let device_name = frame.device_name();
        let measurement_name = frame.measurement_name();
        if device_name.is_empty() || measurement_name.is_empty() {
            debug!("Ignoring unaddressable line from {}", device_key);
            return Ok(Vec::new());
        }

        let category = frame.category();
        let state_topic = state_topic(device_name, category, measurement_name);

        let common = CommonDiscovery {
            name: non_empty(measurement_name),
            icon: frame.icon(),
            state_topic: state_topic.clone(),
            availability_topic: self
                .publish_availability
                .then(|| availability_topic(device_name)),
            unique_id: format!("{}_{}", device_key, measurement_name),
            device: DeviceInfo {
                ids: device_key.as_str(),
                name: non_empty(device_name),
                sw: frame.firmware_version(),
                mdl: frame.model(),
                mf: &self.manufacturer,
            },
        };

        let document = match category {
            Category::BinarySensor => serde_json::to_string(&BinarySensorDiscovery {
                device_class: non_empty(frame.device_class()),
                common,
            })?,
            Category::Sensor | Category::TextSensor => serde_json::to_string(&SensorDiscovery {
                device_class: non_empty(frame.device_class()),
                unit_of_measurement: non_empty(frame.unit()),
                state_class: non_empty(frame.state_class()),
                common,
            })?,
        };

        let config_topic = config_topic(discovery_prefix, device_name, category, measurement_name);
        debug!("Discovery {} for {}", config_topic, device_key);

        Ok(vec![
            Publication::retained(config_topic, document),
            Publication::retained(state_topic, frame.value().to_string()),
        ])
    }

    /// `{device}/status` update for a presence change, when enabled.
    pub fn availability(&self, announcement: &DeviceAnnouncement) -> Option<Publication> {
        if !self.publish_availability {
            return None;
        }
        debug!(
            "Availability of {} ({}): {}",
            announcement.name,
            announcement.device_key,
            announcement.presence.as_payload()
        );
        Some(Publication::retained(
            availability_topic(&announcement.name),
            announcement.presence.as_payload().to_string(),
        ))
    }
}

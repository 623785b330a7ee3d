use std::time::Duration;

use log::{debug, error, info};
use rumqttc::MqttOptions;

use crate::{config, discovery::Publication};

const DEFAULT_CLIENT_ID: &str = "now-mqtt-rs";
const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    discovery_prefix: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

        let mut mqttoptions =
            MqttOptions::new(client_id, config.host.clone(), config.port.unwrap_or(1883));

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                discovery_prefix: config
                    .discovery_prefix
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string()),
            },
            eventloop,
        )
    }

    pub fn discovery_prefix(&self) -> &str {
        &self.discovery_prefix
    }

    /// Drives the connection. Publishes queued by [`MqttClient::publish`] only
    /// go out while this is running.
    pub async fn event_loop(mut eventloop: rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        info!("Connected to MQTT broker");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::PubAck(ack)) => {
                        debug!("Publish {} acknowledged", ack.pkid);
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        debug!("Disconnect sent");
                        break;
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Queues a publish without waiting. Fails when the request queue is
    /// full, which happens while the broker is unreachable.
    pub fn publish(&self, publication: Publication) -> Result<(), rumqttc::ClientError> {
        debug!(
            "Publishing {} ({} bytes, retain={})",
            publication.topic,
            publication.payload.len(),
            publication.retain
        );
        self.client.try_publish(
            publication.topic,
            publication.qos,
            publication.retain,
            publication.payload,
        )
    }

    pub fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.try_disconnect()
    }
}

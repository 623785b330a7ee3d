use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::BridgeConfig;
use crate::discovery::{DiscoveryPublisher, Publication};
use crate::link::ReceivedPacket;
use crate::mqtt::MqttClient;
use crate::presence::{DeviceKey, PresenceTracker};
use crate::wire;

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Packet handling and presence bookkeeping, independent of the broker
/// connection.
pub struct BridgeCore {
    tracker: PresenceTracker,
    discovery: DiscoveryPublisher,
}

impl BridgeCore {
    pub fn new(config: &BridgeConfig) -> Self {
        BridgeCore {
            tracker: PresenceTracker::new(config.device_timeout()),
            discovery: DiscoveryPublisher::new(
                config.manufacturer(),
                config.publish_availability(),
            ),
        }
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    pub fn on_packet(
        &mut self,
        packet: &ReceivedPacket,
        now_ms: u64,
        discovery_prefix: &str,
    ) -> Vec<Publication> {
        let frame = match wire::decode(&packet.payload) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("Ignoring malformed packet from {}: {}", packet.source, err);
                return Vec::new();
            }
        };

        let device_key = DeviceKey::from(&packet.source);
        debug!("Received from {}: {}", device_key, frame.tokens().join(":"));
        trace!("Decoded {:?}", frame.to_reading());

        let mut publications = Vec::new();
        if !frame.device_name().is_empty() {
            if let Some(announcement) =
                self.tracker
                    .touch(&device_key, frame.device_name(), now_ms)
            {
                publications.extend(self.discovery.availability(&announcement));
            }
        }

        match self.discovery.handle(&frame, &device_key, discovery_prefix) {
            Ok(rendered) => publications.extend(rendered),
            Err(err) => error!("Error rendering discovery for {}: {}", device_key, err),
        }
        publications
    }

    pub fn on_sweep(&mut self, now_ms: u64) -> Vec<Publication> {
        self.tracker
            .sweep(now_ms)
            .iter()
            .filter_map(|announcement| self.discovery.availability(announcement))
            .collect()
    }
}

pub struct Bridge {
    core: BridgeCore,
    packets: mpsc::Receiver<ReceivedPacket>,
    mqtt_client: MqttClient,
    mqtt_event_loop: rumqttc::EventLoop,
    sweep_interval: Duration,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        packets: mpsc::Receiver<ReceivedPacket>,
        mqtt_client: MqttClient,
        mqtt_event_loop: rumqttc::EventLoop,
    ) -> Self {
        Bridge {
            core: BridgeCore::new(config),
            packets,
            mqtt_client,
            mqtt_event_loop,
            sweep_interval: config.sweep_interval(),
        }
    }

    pub async fn run_loop(self) -> anyhow::Result<()> {
        let Bridge {
            mut core,
            mut packets,
            mqtt_client,
            mqtt_event_loop,
            sweep_interval,
        } = self;

        let mqtt_handle = tokio::task::spawn(MqttClient::event_loop(mqtt_event_loop));

        let started = Instant::now();
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        sweep.tick().await;

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                packet = packets.recv() => {
                    let Some(packet) = packet else {
                        warn!("Link receive channel closed");
                        break;
                    };
                    let publications =
                        core.on_packet(&packet, elapsed_ms(started), mqtt_client.discovery_prefix());
                    publish_all(&mqtt_client, publications);
                }
                _ = sweep.tick() => {
                    let publications = core.on_sweep(elapsed_ms(started));
                    debug!(
                        "Sweep done, {}/{} devices online",
                        core.tracker().online_count(),
                        core.tracker().len()
                    );
                    publish_all(&mqtt_client, publications);
                }
                result = &mut shutdown => {
                    if let Err(err) = result {
                        error!("Error waiting for shutdown signal: {:?}", err);
                    }
                    info!("Shutting down bridge");
                    break;
                }
            }
        }

        if let Err(err) = mqtt_client.disconnect() {
            warn!("Could not queue MQTT disconnect: {:?}", err);
            mqtt_handle.abort();
        }
        if tokio::time::timeout(DISCONNECT_GRACE, mqtt_handle).await.is_err() {
            debug!("MQTT event loop did not stop in time");
        }
        info!("Exiting bridge event loop");

        Ok(())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Hands publications to the broker client without waiting on it, so an
/// unreachable broker never stalls packet handling or the sweep. Returns how
/// many were queued; the rest are dropped.
fn publish_all(client: &MqttClient, publications: Vec<Publication>) -> usize {
    let mut queued = 0;
    for publication in publications {
        let topic = publication.topic.clone();
        match client.publish(publication) {
            Ok(()) => queued += 1,
            Err(err) => warn!("Dropping publish to {}: {:?}", topic, err),
        }
    }
    queued
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context as _, bail};
use log::{debug, info, warn};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{PublisherConfig, SensorConfig};
use crate::link::Link;
use crate::sender::{ReliableSender, SendOutcome};
use crate::sensor::{DeviceIdentity, Sensor};

const SAMPLE_QUEUE: usize = 32;

#[derive(Debug, Default)]
pub struct SendStats {
    /// Every completed send, whatever its outcome.
    pub sent: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug)]
struct Sample {
    sensor: usize,
    output: String,
}

/// Samples every configured sensor and broadcasts its readings. All sends go
/// through one [`ReliableSender`], so only one line is ever in flight.
pub struct Publisher<L: Link> {
    identity: DeviceIdentity,
    sensor_configs: Vec<SensorConfig>,
    sensors: Vec<Sensor>,
    sender: ReliableSender<L>,
    stats: Arc<SendStats>,
}

impl<L: Link> Publisher<L> {
    pub fn new(config: &PublisherConfig, mut sender: ReliableSender<L>) -> Self {
        let stats = Arc::new(SendStats::default());

        let counter = stats.clone();
        sender.add_on_send_success(move || {
            counter.delivered.fetch_add(1, Ordering::Relaxed);
        });
        let counter = stats.clone();
        sender.add_on_send_failure(move || {
            counter.failed.fetch_add(1, Ordering::Relaxed);
        });

        Publisher {
            identity: DeviceIdentity {
                name: config.name.clone(),
                firmware_version: config.firmware_version().to_string(),
                model: config.model().to_string(),
            },
            sensor_configs: config.sensors.clone(),
            sensors: config.sensors.iter().map(Sensor::from_config).collect(),
            sender,
            stats,
        }
    }

    pub fn stats(&self) -> &SendStats {
        &self.stats
    }

    pub async fn run_loop(mut self) -> anyhow::Result<()> {
        if self.sensor_configs.is_empty() {
            bail!("no sensors configured for publisher {}", self.identity.name);
        }

        let (tx, mut rx) = mpsc::channel(SAMPLE_QUEUE);
        let pollers: Vec<JoinHandle<()>> = self
            .sensor_configs
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, config)| tokio::task::spawn(poll_sensor(index, config, tx.clone())))
            .collect();
        drop(tx);

        info!(
            "Publishing {} sensors as {} ({} {})",
            self.sensors.len(),
            self.identity.name,
            self.identity.model,
            self.identity.firmware_version
        );

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                sample = rx.recv() => {
                    let Some(sample) = sample else {
                        warn!("All sensor pollers stopped");
                        break;
                    };
                    self.on_sample(sample.sensor, &sample.output).await;
                }
                _ = &mut shutdown => {
                    info!("Shutting down publisher");
                    break;
                }
            }
        }

        for poller in &pollers {
            poller.abort();
        }
        futures::future::join_all(pollers).await;

        let stats = self.stats();
        info!(
            "Lines sent: {}, delivered: {}, failed: {}",
            stats.sent.load(Ordering::Relaxed),
            stats.delivered.load(Ordering::Relaxed),
            stats.failed.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// Parses one command output for the given sensor and sends the resulting
    /// reading. Returns `None` if nothing was sent.
    async fn on_sample(&mut self, index: usize, output: &str) -> Option<SendOutcome> {
        let on_change_only = self.sensor_configs.get(index)?.on_change_only();
        let sensor = self.sensors.get_mut(index)?;

        let Some(value) = sensor.parse(output) else {
            warn!("Sensor {}: unusable output {:?}", sensor.name, output.trim());
            return None;
        };
        if !sensor.publish_state(value) && on_change_only {
            debug!("Sensor {}: unchanged, skipping", sensor.name);
            return None;
        }

        let reading = sensor.reading(&self.identity)?;
        let line = reading.encode();
        info!("Publishing: {}", line);

        let outcome = self.sender.send(line.as_bytes()).await;
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Sent {} = {} ({} after {} attempts)",
            reading.measurement_name,
            reading.value,
            if outcome.is_delivered() { "delivered" } else { "failed" },
            outcome.attempts()
        );
        Some(outcome)
    }
}

async fn poll_sensor(index: usize, config: SensorConfig, samples: mpsc::Sender<Sample>) {
    let mut ticker = tokio::time::interval(config.interval());
    loop {
        ticker.tick().await;
        match run_command(&config.command).await {
            Ok(output) => {
                if samples
                    .send(Sample {
                        sensor: index,
                        output,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => warn!("Sensor {}: {:#}", config.name, err),
        }
    }
}

async fn run_command(command: &str) -> anyhow::Result<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .with_context(|| format!("spawning {:?}", command))?;
    if !output.status.success() {
        bail!("{:?} exited with {}", command, output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

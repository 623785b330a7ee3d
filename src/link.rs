//! Broadcast link abstraction.
//!
//! A link accepts or rejects a broadcast request synchronously. Whether the
//! frame actually went out is reported later as a [`DeliveryReport`], and
//! frames heard from other nodes arrive as [`ReceivedPacket`]s. Both travel on
//! channels handed out when the link is brought up.

use mac_address::MacAddress;
use thiserror::Error;

use crate::wire::MAX_LINE_LEN;

pub const BROADCAST_BYTES: [u8; 6] = [0xFF; 6];

pub fn broadcast_address() -> MacAddress {
    MacAddress::new(BROADCAST_BYTES)
}

pub trait Link: Send + Sync {
    /// Queues `payload` for transmission to `destination`.
    fn broadcast(&self, destination: &MacAddress, payload: &[u8]) -> Result<(), LinkError>;

    /// This node's own link address.
    fn address(&self) -> MacAddress;
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("payload of {size} bytes exceeds the {max} byte link limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("transmit queue full")]
    QueueFull,
    #[error("link not ready: {0}")]
    NotReady(#[from] std::io::Error),
}

impl LinkError {
    pub fn check_size(payload: &[u8]) -> Result<(), LinkError> {
        if payload.len() > MAX_LINE_LEN {
            return Err(LinkError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_LINE_LEN,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryReport {
    pub destination: MacAddress,
    pub success: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub source: MacAddress,
    pub payload: Vec<u8>,
}

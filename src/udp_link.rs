//! [`Link`] over UDP broadcast on the local network.
//!
//! Each datagram carries the sender's 6-byte link address followed by the
//! payload, so receivers can key devices the same way they would on a radio.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use log::{debug, info, warn};
use mac_address::MacAddress;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::link::{DeliveryReport, Link, LinkError, ReceivedPacket};
use crate::wire::MAX_LINE_LEN;

const HEADER_LEN: usize = 6;
const RECEIVE_QUEUE: usize = 64;
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkMode {
    /// Sends only; binds an ephemeral port.
    Transmit,
    /// Listens on the channel port.
    Receive,
}

pub struct LinkChannels {
    pub delivery: mpsc::UnboundedReceiver<DeliveryReport>,
    pub packets: mpsc::Receiver<ReceivedPacket>,
}

pub struct UdpLink {
    socket: std::net::UdpSocket,
    address: MacAddress,
    target: SocketAddr,
    reports: mpsc::UnboundedSender<DeliveryReport>,
}

impl UdpLink {
    /// Binds the link socket. Must be called from within a tokio runtime when
    /// `mode` is [`LinkMode::Receive`].
    pub fn bring_up(config: &LinkConfig, mode: LinkMode) -> anyhow::Result<(Self, LinkChannels)> {
        let address = config.link_address()?;
        let port = match mode {
            LinkMode::Transmit => 0,
            LinkMode::Receive => config.port(),
        };
        let bind_addr = SocketAddr::new(config.bind_ip(), port);

        let socket = std::net::UdpSocket::bind(bind_addr)
            .with_context(|| format!("binding link socket on {}", bind_addr))?;
        socket
            .set_broadcast(true)
            .context("enabling broadcast on link socket")?;
        socket
            .set_nonblocking(true)
            .context("making link socket non-blocking")?;

        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (packet_tx, packet_rx) = mpsc::channel(RECEIVE_QUEUE);

        if mode == LinkMode::Receive {
            let listener = socket
                .try_clone()
                .and_then(UdpSocket::from_std)
                .context("registering link socket with the runtime")?;
            tokio::spawn(receive_loop(listener, address, packet_tx));
        }

        info!(
            "Link up (address={}, channel={}, port={}, long_range={})",
            address,
            config.channel(),
            config.port(),
            if config.long_range_mode() { "yes" } else { "no" }
        );

        Ok((
            UdpLink {
                socket,
                address,
                target: SocketAddr::new(config.broadcast_ip(), config.port()),
                reports: report_tx,
            },
            LinkChannels {
                delivery: report_rx,
                packets: packet_rx,
            },
        ))
    }
}

impl Link for UdpLink {
    /// Every frame goes to the network broadcast address; `destination` is only
    /// echoed back in the delivery report.
    fn broadcast(&self, destination: &MacAddress, payload: &[u8]) -> Result<(), LinkError> {
        LinkError::check_size(payload)?;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&self.address.bytes());
        frame.extend_from_slice(payload);

        match self.socket.send_to(&frame, self.target) {
            Ok(sent) => {
                let _ = self.reports.send(DeliveryReport {
                    destination: *destination,
                    success: sent == frame.len(),
                });
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(LinkError::QueueFull),
            Err(err) => Err(LinkError::NotReady(err)),
        }
    }

    fn address(&self) -> MacAddress {
        self.address
    }
}

async fn receive_loop(
    socket: UdpSocket,
    own_address: MacAddress,
    packets: mpsc::Sender<ReceivedPacket>,
) {
    let mut buf = [0u8; HEADER_LEN + MAX_LINE_LEN];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("Link receive error: {}", err);
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                continue;
            }
        };

        let Some(packet) = parse_datagram(&buf[..len]) else {
            debug!("Ignoring runt datagram ({} bytes) from {}", len, from);
            continue;
        };
        if packet.source == own_address {
            continue;
        }

        if packets.send(packet).await.is_err() {
            debug!("Packet receiver dropped, stopping link receive loop");
            break;
        }
    }
}

fn parse_datagram(datagram: &[u8]) -> Option<ReceivedPacket> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    let (header, payload) = datagram.split_at(HEADER_LEN);
    let mut source = [0u8; HEADER_LEN];
    source.copy_from_slice(header);
    Some(ReceivedPacket {
        source: MacAddress::new(source),
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datagram() {
        let mut datagram = vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        datagram.extend_from_slice(b"kitchen:::");

        let packet = parse_datagram(&datagram).unwrap();
        assert_eq!(
            packet.source,
            MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
        );
        assert_eq!(packet.payload, b"kitchen:::");

        assert!(parse_datagram(&[1, 2, 3]).is_none());
        assert_eq!(parse_datagram(&[0; HEADER_LEN]).map(|p| p.payload.len()), Some(0));
    }

    #[tokio::test]
    async fn test_rejects_oversized_payload() {
        let config = LinkConfig {
            address: Some(MacAddress::new([2, 0, 0, 0, 0, 1])),
            bind_ip: Some("127.0.0.1".parse().unwrap()),
            broadcast_ip: Some("127.0.0.1".parse().unwrap()),
            ..LinkConfig::default()
        };
        let (link, _channels) = UdpLink::bring_up(&config, LinkMode::Transmit)
            .unwrap();

        let err = link
            .broadcast(&crate::link::broadcast_address(), &[b'x'; MAX_LINE_LEN + 1])
            .unwrap_err();
        assert!(matches!(err, LinkError::PayloadTooLarge { size, .. } if size == MAX_LINE_LEN + 1));
    }

    #[tokio::test]
    async fn test_loopback_delivery() {
        let receiver_config = LinkConfig {
            address: Some(MacAddress::new([2, 0, 0, 0, 0, 1])),
            bind_ip: Some("127.0.0.1".parse().unwrap()),
            broadcast_ip: Some("127.0.0.1".parse().unwrap()),
            port_base: Some(39_000 + (std::process::id() % 1000) as u16),
            ..LinkConfig::default()
        };
        let sender_config = LinkConfig {
            address: Some(MacAddress::new([2, 0, 0, 0, 0, 2])),
            ..receiver_config.clone()
        };

        let (_rx_link, mut rx_channels) = UdpLink::bring_up(&receiver_config, LinkMode::Receive).unwrap();
        let (tx_link, mut tx_channels) = UdpLink::bring_up(&sender_config, LinkMode::Transmit).unwrap();

        tx_link
            .broadcast(&crate::link::broadcast_address(), b"hello")
            .unwrap();

        let report = tx_channels.delivery.recv().await.unwrap();
        assert!(report.success);

        let packet = tokio::time::timeout(Duration::from_secs(5), rx_channels.packets.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.source, tx_link.address());
        assert_eq!(packet.payload, b"hello");
    }
}

//! UDP broadcast/multicast peer discovery: `SENTINEL_DISCOVERY|peer_id|tcp_port[|sender_ip]`.

use crate::error::{discovery_failed, invalid_config, CoreError};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const DISCOVERY_TAG: &str = "SENTINEL_DISCOVERY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryAnnouncement {
    pub peer_id: String,
    pub tcp_port: u16,
    pub sender_ip: Option<String>,
}

impl DiscoveryAnnouncement {
    pub fn encode(&self) -> String {
        match &self.sender_ip {
            Some(ip) => format!("{DISCOVERY_TAG}|{}|{}|{ip}", self.peer_id, self.tcp_port),
            None => format!("{DISCOVERY_TAG}|{}|{}", self.peer_id, self.tcp_port),
        }
    }

    pub fn decode(datagram: &str) -> Result<Self, CoreError> {
        let mut parts = datagram.trim().split('|');
        let tag = parts.next().unwrap_or("");
        if tag != DISCOVERY_TAG {
            return Err(invalid_config(format!("not a discovery datagram: {tag}")));
        }
        let peer_id = parts
            .next()
            .ok_or_else(|| invalid_config("discovery datagram missing peer_id"))?
            .to_string();
        let tcp_port: u16 = parts
            .next()
            .ok_or_else(|| invalid_config("discovery datagram missing tcp_port"))?
            .parse()
            .map_err(|_| invalid_config("discovery datagram has non-numeric tcp_port"))?;
        let sender_ip = parts.next().map(|s| s.to_string());
        Ok(Self { peer_id, tcp_port, sender_ip })
    }
}

pub struct DiscoveryService {
    socket: UdpSocket,
    local_peer_id: String,
    tcp_port: u16,
    broadcast_addr: SocketAddr,
}

impl DiscoveryService {
    pub async fn bind(
        listen_port: u16,
        broadcast_addr: SocketAddr,
        local_peer_id: impl Into<String>,
        tcp_port: u16,
    ) -> Result<Self, CoreError> {
        let socket = UdpSocket::bind(("0.0.0.0", listen_port))
            .await
            .map_err(|e| discovery_failed(format!("bind failed: {e}")))?;
        socket.set_broadcast(true).map_err(|e| discovery_failed(format!("set_broadcast failed: {e}")))?;
        Ok(Self { socket, local_peer_id: local_peer_id.into(), tcp_port, broadcast_addr })
    }

    pub async fn announce(&self) -> Result<(), CoreError> {
        let announcement = DiscoveryAnnouncement {
            peer_id: self.local_peer_id.clone(),
            tcp_port: self.tcp_port,
            sender_ip: None,
        };
        let datagram = announcement.encode();
        self.socket
            .send_to(datagram.as_bytes(), self.broadcast_addr)
            .await
            .map_err(|e| discovery_failed(format!("send failed: {e}")))?;
        debug!(datagram, "sent discovery announcement");
        Ok(())
    }

    /// Receives one datagram, returning `None` (and logging) for malformed
    /// or self-originated packets rather than erroring the caller's loop.
    pub async fn recv_one(&self) -> Result<Option<(DiscoveryAnnouncement, SocketAddr)>, CoreError> {
        let mut buf = [0u8; 512];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| discovery_failed(format!("recv failed: {e}")))?;
        let text = String::from_utf8_lossy(&buf[..len]);
        match DiscoveryAnnouncement::decode(&text) {
            Ok(announcement) if announcement.peer_id == self.local_peer_id => Ok(None),
            Ok(announcement) => {
                info!(peer_id = %announcement.peer_id, %from, "discovered peer");
                Ok(Some((announcement, from)))
            }
            Err(e) => {
                warn!(%from, error = %e, "ignoring malformed discovery datagram");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip_without_sender_ip() {
        let announcement = DiscoveryAnnouncement { peer_id: "peer-a".to_string(), tcp_port: 9001, sender_ip: None };
        let decoded = DiscoveryAnnouncement::decode(&announcement.encode()).unwrap();
        assert_eq!(decoded, announcement);
    }

    #[test]
    fn encode_decode_roundtrip_with_sender_ip() {
        let announcement = DiscoveryAnnouncement {
            peer_id: "peer-b".to_string(),
            tcp_port: 9002,
            sender_ip: Some("192.168.1.5".to_string()),
        };
        let decoded = DiscoveryAnnouncement::decode(&announcement.encode()).unwrap();
        assert_eq!(decoded, announcement);
    }

    #[test]
    fn rejects_wrong_tag() {
        assert!(DiscoveryAnnouncement::decode("NOT_SENTINEL|a|1").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(DiscoveryAnnouncement::decode("SENTINEL_DISCOVERY|a|not-a-port").is_err());
    }

    #[tokio::test]
    async fn announce_and_receive_over_loopback() {
        let receiver = DiscoveryService::bind(0, "127.0.0.1:0".parse().unwrap(), "receiver", 7000).await.unwrap();
        let receiver_port = receiver.socket.local_addr().unwrap().port();

        let sender = DiscoveryService::bind(
            0,
            format!("127.0.0.1:{receiver_port}").parse().unwrap(),
            "sender",
            7001,
        )
        .await
        .unwrap();
        sender.announce().await.unwrap();

        let (announcement, _from) = receiver.recv_one().await.unwrap().unwrap();
        assert_eq!(announcement.peer_id, "sender");
        assert_eq!(announcement.tcp_port, 7001);
    }
}

// UDP transport
//
// Owns the agent's socket. Every outbound datagram is framed through the
// keyring; every inbound datagram is decrypted and decoded before it
// reaches the protocol. Failures on either path are counted and dropped,
// matching the lossy-datagram model the failure detector already assumes.

use crate::error::Result;
use crate::keyring::Keyring;
use crate::membership::MemberId;
use crate::transport::wire::GossipMessage;
use crate::transport::TransportStats;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

/// Largest datagram the transport will receive
pub const MAX_DATAGRAM: usize = 65536;

/// Keyring-framed UDP transport
pub struct UdpTransport {
    socket: UdpSocket,
    keyring: Arc<RwLock<Keyring>>,
    stats: Arc<TransportStats>,
}

impl UdpTransport {
    /// Bind the agent socket
    pub async fn bind(addr: SocketAddr, keyring: Arc<RwLock<Keyring>>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            keyring,
            stats: Arc::new(TransportStats::default()),
        })
    }

    /// The bound local address. Resolves the actual port when the agent
    /// was configured with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Shared handle to the transport counters
    pub fn stats(&self) -> Arc<TransportStats> {
        self.stats.clone()
    }

    /// Encode, encrypt, and send one message. Send failures are treated
    /// as silent datagram loss: counted, logged at trace level, never
    /// propagated.
    pub async fn send(&self, message: &GossipMessage, addr: MemberId) {
        let encoded = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(to = %addr, error = %e, "Dropping unencodable message");
                return;
            }
        };

        let sealed = {
            let ring = self.keyring.read().await;
            match ring.encrypt(&encoded) {
                Ok(sealed) => sealed,
                Err(e) => {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(to = %addr, error = %e, "Dropping message that failed encryption");
                    return;
                }
            }
        };

        match self.socket.send_to(&sealed, addr).await {
            Ok(_) => {
                self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(to = %addr, error = %e, "Datagram send failed");
            }
        }
    }

    /// Receive one datagram and run it through decryption and decoding.
    /// Returns `None` for datagrams that were dropped on the way in; the
    /// caller just polls again.
    pub async fn recv(&self, buf: &mut [u8]) -> Option<(GossipMessage, SocketAddr)> {
        let (len, from) = match self.socket.recv_from(buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::trace!(error = %e, "Datagram receive failed");
                return None;
            }
        };

        let plaintext = {
            let ring = self.keyring.read().await;
            match ring.decrypt(&buf[..len]) {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    self.stats
                        .failed_verifications
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(from = %from, "Dropping datagram that failed verification");
                    return None;
                }
            }
        };

        match GossipMessage::decode(&plaintext) {
            Ok(message) => {
                self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
                Some((message, from))
            }
            Err(e) => {
                self.stats
                    .malformed_messages
                    .fetch_add(1, Ordering::Relaxed);
                tracing::trace!(from = %from, error = %e, "Dropping malformed datagram");
                None
            }
        }
    }
}

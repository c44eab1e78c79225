// Agent configuration
//
// All tunables for the membership agent live here. Validation happens once,
// at agent construction; a configuration that fails validation prevents
// startup and is the only fatal error surface of the agent.

use crate::error::{GossipError, Result};
use crate::keyring::KEY_LEN;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Membership agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Address the UDP transport binds to
    pub bind_addr: SocketAddr,

    /// Time between successive direct probes
    pub protocol_period: Duration,

    /// How long to wait for an ack before falling back to indirect probes.
    /// Must be strictly less than `protocol_period`.
    pub ack_timeout: Duration,

    /// Fan-out for indirect probes
    pub num_proxies: usize,

    /// Initial probe sequence number (useful when restarting with
    /// persisted state)
    pub initial_sequence: u32,

    /// Symmetric keys for datagram encryption, newest first.
    /// Every key must be exactly 32 bytes.
    pub keys: Vec<Vec<u8>>,

    /// Cluster-wide associated authenticated data. Must be agreed
    /// out-of-band and identical on every node.
    pub aad: Vec<u8>,

    /// Suspicion timeout multiplier
    pub suspicion_mult: u32,

    /// Gossip retransmit multiplier for piggybacked updates
    pub gossip_retransmit_mult: u32,

    /// Maximum number of updates piggybacked per datagram
    pub max_piggyback: usize,

    /// Capacity of the membership event channel
    pub event_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7946".parse().unwrap(),
            protocol_period: Duration::from_millis(1000),
            ack_timeout: Duration::from_millis(500),
            num_proxies: 3,
            initial_sequence: 0,
            keys: Vec::new(),
            aad: Vec::new(),
            suspicion_mult: 3,
            gossip_retransmit_mult: 4,
            max_piggyback: 8,
            event_capacity: 1000,
        }
    }
}

impl AgentConfig {
    /// Replace the key list with keys decoded from hex strings, newest first
    pub fn with_hex_keys(mut self, hex_keys: &[&str]) -> Result<Self> {
        let mut keys = Vec::with_capacity(hex_keys.len());
        for raw in hex_keys {
            let key = hex::decode(raw)
                .map_err(|e| GossipError::Configuration(format!("Invalid hex key: {}", e)))?;
            keys.push(key);
        }
        self.keys = keys;
        Ok(self)
    }

    /// Validate the configuration. Called by the agent constructor.
    pub fn validate(&self) -> Result<()> {
        if self.protocol_period.is_zero() {
            return Err(GossipError::Configuration(
                "protocol_period must be positive".to_string(),
            ));
        }
        if self.ack_timeout.is_zero() {
            return Err(GossipError::Configuration(
                "ack_timeout must be positive".to_string(),
            ));
        }
        if self.ack_timeout >= self.protocol_period {
            return Err(GossipError::Configuration(format!(
                "ack_timeout ({:?}) must be strictly less than protocol_period ({:?})",
                self.ack_timeout, self.protocol_period
            )));
        }
        if self.num_proxies == 0 {
            return Err(GossipError::Configuration(
                "num_proxies must be at least 1".to_string(),
            ));
        }
        if self.suspicion_mult == 0 {
            return Err(GossipError::Configuration(
                "suspicion_mult must be at least 1".to_string(),
            ));
        }
        if self.max_piggyback == 0 {
            return Err(GossipError::Configuration(
                "max_piggyback must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(GossipError::Configuration(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if self.keys.is_empty() {
            return Err(GossipError::EmptyKeyring);
        }
        for key in &self.keys {
            if key.len() != KEY_LEN {
                return Err(GossipError::BadKeyLength {
                    expected: KEY_LEN,
                    actual: key.len(),
                });
            }
        }
        Ok(())
    }
}

// Wire format
//
// Protocol datagrams as they appear after keyring decryption. Encoding is
// bincode with the standard configuration; the enum discriminant is the
// message tag. The encoding must stay stable across nodes, so changes here
// are wire-protocol changes.

use crate::error::{GossipError, Result};
use crate::membership::{GossipUpdate, Incarnation, MemberId};
use serde::{Deserialize, Serialize};

/// Hard cap on the piggyback list a decoded datagram may carry. Senders
/// stay below this via their configured `max_piggyback`.
pub const MAX_PIGGYBACK: usize = 64;

/// Protocol messages exchanged between agents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum GossipMessage {
    /// Direct probe. `target_inc` is the incarnation the prober currently
    /// holds for the target, letting the target notice stale views.
    Ping {
        seq: u32,
        from: MemberId,
        target_inc: Incarnation,
        updates: Vec<GossipUpdate>,
    },

    /// Probe acknowledgement carrying the responder's own incarnation
    Ack {
        seq: u32,
        from: MemberId,
        inc: Incarnation,
        updates: Vec<GossipUpdate>,
    },

    /// Request to probe `target` on behalf of `from`
    PingReq {
        seq: u32,
        from: MemberId,
        target: MemberId,
        updates: Vec<GossipUpdate>,
    },

    /// Negative acknowledgement for a relayed probe that timed out
    Nack { seq: u32 },
}

impl GossipMessage {
    /// Sequence number carried by any message variant
    pub fn seq(&self) -> u32 {
        match self {
            GossipMessage::Ping { seq, .. }
            | GossipMessage::Ack { seq, .. }
            | GossipMessage::PingReq { seq, .. }
            | GossipMessage::Nack { seq } => *seq,
        }
    }

    /// Piggybacked updates, if the variant carries any
    pub fn updates(&self) -> &[GossipUpdate] {
        match self {
            GossipMessage::Ping { updates, .. }
            | GossipMessage::Ack { updates, .. }
            | GossipMessage::PingReq { updates, .. } => updates,
            GossipMessage::Nack { .. } => &[],
        }
    }

    /// Encode for transmission
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| GossipError::Serialization(format!("Failed to encode message: {}", e)))
    }

    /// Decode a decrypted datagram. Rejects trailing garbage and
    /// over-long piggyback lists.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (message, consumed): (GossipMessage, usize) =
            bincode::decode_from_slice(data, bincode::config::standard())
                .map_err(|e| GossipError::Serialization(format!("Failed to decode message: {}", e)))?;
        if consumed != data.len() {
            return Err(GossipError::Serialization(format!(
                "Trailing bytes after message: {}",
                data.len() - consumed
            )));
        }
        if message.updates().len() > MAX_PIGGYBACK {
            return Err(GossipError::Serialization(format!(
                "Piggyback list exceeds bound: {}",
                message.updates().len()
            )));
        }
        Ok(message)
    }
}

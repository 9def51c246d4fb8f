//! Wire encoding.
//!
//! Uses postcard for compact, byte-stable encoding. The transport sees only
//! opaque byte payloads; the message kind travels as the enum tag.

use crate::{CoreError, CoreResult, Member, Message, Packet, Update};
use serde::{Deserialize, Serialize};

/// Trait for wire serialization
pub trait Encode: Serialize {
    /// Encode to bytes
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized
    fn encode(&self) -> CoreResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| CoreError::Encoding(e.to_string()))
    }

    /// Get encoded length
    fn encoded_len(&self) -> usize {
        postcard::to_allocvec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

// Types opt in explicitly so only wire types are encodable.
impl Encode for Member {}
impl Encode for Update {}
impl Encode for Message {}

impl Encode for Packet {}

impl Packet {
    /// Encode, refusing to exceed `limit` bytes
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PacketTooLarge`] if the encoding does not fit
    pub fn encode_bounded(&self, limit: usize) -> CoreResult<Vec<u8>> {
        let bytes = self.encode()?;
        if bytes.len() > limit {
            return Err(CoreError::PacketTooLarge {
                size: bytes.len(),
                limit,
            });
        }
        Ok(bytes)
    }
}

/// Trait for wire deserialization
pub trait Decode<'de>: Deserialize<'de> {
    /// Decode from bytes
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid encoding
    fn decode(data: &'de [u8]) -> CoreResult<Self>
    where
        Self: Sized,
    {
        postcard::from_bytes(data).map_err(CoreError::from)
    }
}

impl<'de, T: Deserialize<'de>> Decode<'de> for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemberStatus, Node};
    use proptest::prelude::*;

    fn member(name: &str) -> Member {
        Member::new(name, "10.0.0.1:7946".parse().unwrap())
            .with_status(MemberStatus::Suspect)
            .with_incarnation(9)
            .with_meta(b"zone=a".to_vec())
    }

    #[test]
    fn test_packet_decodes_to_same_message() {
        let packet = Packet::new(Message::IndirectPing {
            seq: 77,
            target: Node::new("t", "10.0.0.9:7946".parse().unwrap()),
        })
        .with_gossip(vec![Update::new(member("x"), "y")]);

        let bytes = packet.encode().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        let update = Update::new(member("abc"), "origin");
        assert_eq!(update.encoded_len(), update.encode().unwrap().len());
    }

    #[test]
    fn test_encode_bounded_rejects_oversized() {
        let gossip = (0..50).map(|i| Update::new(member(&format!("node-{i}")), "o")).collect();
        let packet = Packet::new(Message::Gossip).with_gossip(gossip);
        let err = packet.encode_bounded(256).unwrap_err();
        assert!(matches!(err, CoreError::PacketTooLarge { limit: 256, .. }));
    }

    #[test]
    fn test_invalid_decode() {
        let invalid = &[0xFF, 0xFF, 0xFF];
        let result = Packet::decode(invalid);
        assert!(matches!(result, Err(CoreError::InvalidEncoding(_))));
    }

    proptest! {
        #[test]
        fn prop_garbage_never_panics(bytes: Vec<u8>) {
            let _ = Packet::decode(&bytes);
            let _ = Message::decode(&bytes);
        }

        #[test]
        fn prop_encode_deterministic(seq: u32, target in "[a-z]{1,12}") {
            let packet = Packet::new(Message::Ping { seq, target });
            prop_assert_eq!(packet.encode().unwrap(), packet.encode().unwrap());
        }
    }
}

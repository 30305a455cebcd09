use std::{fmt, str::FromStr};

use alloy_primitives::{hex, Address, Keccak256, Signature};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use libp2p::Multiaddr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::SwarmAddress;

/// Domain prefix of the peer-record sign payload.
pub const HANDSHAKE_PREFIX: &[u8] = b"voyager-handshake-";

/// Errors produced while constructing or verifying peer records.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The record's signature, overlay or underlay did not verify.
    #[error("invalid address")]
    InvalidAddress,
    /// Signing failed while constructing a record.
    #[error("signer failure: {0}")]
    Signer(#[from] alloy_signer::Error),
}

/// Derives an overlay address from an Ethereum address and a network id.
pub fn overlay_address(eth: &Address, network_id: u64) -> SwarmAddress {
    let mut hasher = Keccak256::new();
    hasher.update(eth);
    hasher.update(network_id.to_le_bytes());
    SwarmAddress::from(hasher.finalize())
}

/// A signed peer record binding an overlay address to an underlay.
///
/// The signature covers `"voyager-handshake-" || underlay || overlay ||
/// network_id_be` and is made with the key the overlay is derived from, so
/// verification re-derives the overlay from the recovered public key and
/// compares it bit for bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    overlay: SwarmAddress,
    underlay: Multiaddr,
    signature: Signature,
}

impl NodeRecord {
    /// Creates and signs a record for the given signer and underlay.
    pub fn new(
        signer: &PrivateKeySigner,
        underlay: Multiaddr,
        network_id: u64,
    ) -> Result<Self, RecordError> {
        let overlay = overlay_address(&signer.address(), network_id);
        let payload = sign_payload(&underlay.to_vec(), &overlay, network_id);
        let signature = signer.sign_message_sync(&payload)?;
        Ok(Self {
            overlay,
            underlay,
            signature,
        })
    }

    /// Parses and verifies a record received from the wire.
    ///
    /// Any failure collapses into [`RecordError::InvalidAddress`]: a record
    /// that does not verify carries no usable information.
    pub fn parse(
        underlay: &[u8],
        overlay: &[u8],
        signature: &[u8],
        network_id: u64,
    ) -> Result<Self, RecordError> {
        if overlay.len() != crate::HASH_SIZE {
            return Err(RecordError::InvalidAddress);
        }
        let overlay = SwarmAddress::from_slice(overlay);
        let signature =
            Signature::try_from(signature).map_err(|_| RecordError::InvalidAddress)?;

        let payload = sign_payload(underlay, &overlay, network_id);
        let recovered = signature
            .recover_address_from_msg(&payload)
            .map_err(|_| RecordError::InvalidAddress)?;
        if overlay_address(&recovered, network_id) != overlay {
            return Err(RecordError::InvalidAddress);
        }

        let underlay =
            Multiaddr::try_from(underlay.to_vec()).map_err(|_| RecordError::InvalidAddress)?;
        Ok(Self {
            overlay,
            underlay,
            signature,
        })
    }

    /// Assembles a record without verifying the signature.
    ///
    /// For trusted contexts only: deserialization of already-verified books
    /// and test fixtures. Anything arriving from the wire goes through
    /// [`NodeRecord::parse`].
    pub fn new_unverified(
        overlay: SwarmAddress,
        underlay: Multiaddr,
        signature: Signature,
    ) -> Self {
        Self {
            overlay,
            underlay,
            signature,
        }
    }

    /// The overlay address the record binds.
    pub fn overlay(&self) -> &SwarmAddress {
        &self.overlay
    }

    /// The underlay the peer is reachable at.
    pub fn underlay(&self) -> &Multiaddr {
        &self.underlay
    }

    /// The record signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The 65-byte signature in wire form.
    pub fn signature_bytes(&self) -> [u8; crate::SIGNATURE_SIZE] {
        self.signature.as_bytes()
    }
}

/// Builds the signed payload of a peer record.
pub fn sign_payload(underlay: &[u8], overlay: &SwarmAddress, network_id: u64) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(HANDSHAKE_PREFIX.len() + underlay.len() + crate::HASH_SIZE + 8);
    payload.extend_from_slice(HANDSHAKE_PREFIX);
    payload.extend_from_slice(underlay);
    payload.extend_from_slice(overlay.as_slice());
    payload.extend_from_slice(&network_id.to_be_bytes());
    payload
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[overlay: {}, underlay: {}]", self.overlay, self.underlay)
    }
}

#[derive(Serialize, Deserialize)]
struct RecordRepr {
    overlay: String,
    underlay: String,
    signature: String,
}

// Records persist in the address book as JSON with hex/string fields; the
// signature is stored verbatim and not re-verified on load.
impl Serialize for NodeRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RecordRepr {
            overlay: self.overlay.to_string(),
            underlay: self.underlay.to_string(),
            signature: hex::encode_prefixed(self.signature.as_bytes()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let repr = RecordRepr::deserialize(deserializer)?;
        let overlay = SwarmAddress::from_str(&repr.overlay).map_err(D::Error::custom)?;
        let underlay = Multiaddr::from_str(&repr.underlay).map_err(D::Error::custom)?;
        let raw = hex::decode(&repr.signature).map_err(D::Error::custom)?;
        let signature =
            Signature::try_from(raw.as_slice()).map_err(D::Error::custom)?;
        Ok(Self {
            overlay,
            underlay,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_NETWORK_ID: u64 = 1;

    fn test_underlay() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/7070".parse().unwrap()
    }

    #[test]
    fn parse_roundtrip() {
        let signer = PrivateKeySigner::random();
        let record = NodeRecord::new(&signer, test_underlay(), TEST_NETWORK_ID).unwrap();

        let parsed = NodeRecord::parse(
            &record.underlay().to_vec(),
            record.overlay().as_slice(),
            &record.signature_bytes(),
            TEST_NETWORK_ID,
        )
        .unwrap();

        assert_eq!(parsed, record);
        assert_eq!(
            parsed.overlay(),
            &overlay_address(&signer.address(), TEST_NETWORK_ID)
        );
    }

    #[test]
    fn network_id_mismatch_is_invalid() {
        let signer = PrivateKeySigner::random();
        let record = NodeRecord::new(&signer, test_underlay(), 1).unwrap();

        let err = NodeRecord::parse(
            &record.underlay().to_vec(),
            record.overlay().as_slice(),
            &record.signature_bytes(),
            2,
        )
        .unwrap_err();
        assert!(matches!(err, RecordError::InvalidAddress));
    }

    #[test]
    fn foreign_overlay_is_invalid() {
        let signer = PrivateKeySigner::random();
        let record = NodeRecord::new(&signer, test_underlay(), TEST_NETWORK_ID).unwrap();
        let foreign = overlay_address(&PrivateKeySigner::random().address(), TEST_NETWORK_ID);

        let err = NodeRecord::parse(
            &record.underlay().to_vec(),
            foreign.as_slice(),
            &record.signature_bytes(),
            TEST_NETWORK_ID,
        )
        .unwrap_err();
        assert!(matches!(err, RecordError::InvalidAddress));
    }

    #[test]
    fn overlay_differs_per_network() {
        let signer = PrivateKeySigner::random();
        let eth = signer.address();
        assert_ne!(overlay_address(&eth, 1), overlay_address(&eth, 2));
    }

    #[test]
    fn json_roundtrip() {
        let signer = PrivateKeySigner::random();
        let record = NodeRecord::new(&signer, test_underlay(), TEST_NETWORK_ID).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let decoded: NodeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, decoded);
    }
}

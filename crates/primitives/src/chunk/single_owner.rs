use alloy_primitives::{Address, Keccak256, Signature, B256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use bytes::{Bytes, BytesMut};

use super::ChunkBody;
use crate::{ChunkError, Span, SwarmAddress, HASH_SIZE, SIGNATURE_SIZE};

const ID_SIZE: usize = HASH_SIZE;
const MIN_SOC_FIELDS_SIZE: usize = ID_SIZE + SIGNATURE_SIZE;

/// A single-owner chunk: `id || signature || span || payload`.
///
/// The address is derived from the identifier and the owner recovered from
/// the signature, so the same owner can publish mutable content under a
/// stable address while the wrapped payload stays content-verifiable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleOwnerChunk {
    id: B256,
    owner: Address,
    signature: Signature,
    body: ChunkBody,
}

impl SingleOwnerChunk {
    /// Creates and signs a chunk owned by `signer`.
    pub fn new(
        id: B256,
        data: impl Into<Bytes>,
        signer: &PrivateKeySigner,
    ) -> Result<Self, ChunkError> {
        let data = data.into();
        let body = ChunkBody::new(data.len() as Span, data)?;
        let digest = Self::to_sign(&id, &body.hash());
        let signature = signer.sign_hash_sync(&digest)?;
        Ok(Self {
            id,
            owner: signer.address(),
            signature,
            body,
        })
    }

    /// Parses the wire form, recovering the owner from the signature.
    pub fn from_bytes(value: &[u8]) -> Result<Self, ChunkError> {
        if value.len() < MIN_SOC_FIELDS_SIZE {
            return Err(ChunkError::InsufficientData {
                min_size: MIN_SOC_FIELDS_SIZE,
                actual_size: value.len(),
            });
        }
        // SAFETY: slice indexing is guarded by the length check above.
        let id = B256::from_slice(&value[..ID_SIZE]);
        let signature = Signature::try_from(&value[ID_SIZE..MIN_SOC_FIELDS_SIZE])?;
        let body = ChunkBody::from_bytes(&value[MIN_SOC_FIELDS_SIZE..])?;
        let digest = Self::to_sign(&id, &body.hash());
        let owner = signature.recover_address_from_prehash(&digest)?;
        Ok(Self {
            id,
            owner,
            signature,
            body,
        })
    }

    /// The digest the owner signs: `keccak256(id || wrapped_address)`.
    fn to_sign(id: &B256, wrapped_address: &SwarmAddress) -> B256 {
        let mut hasher = Keccak256::new();
        hasher.update(id);
        hasher.update(wrapped_address);
        hasher.finalize()
    }

    /// The single-owner address: `keccak256(id || owner)`.
    pub fn address(&self) -> SwarmAddress {
        soc_address(&self.id, &self.owner)
    }

    /// Whether the recovered owner reproduces `address`.
    pub fn verify(&self, address: &SwarmAddress) -> bool {
        let digest = Self::to_sign(&self.id, &self.body.hash());
        match self.signature.recover_address_from_prehash(&digest) {
            Ok(owner) => owner == self.owner && *address == self.address(),
            Err(_) => false,
        }
    }

    /// The chunk identifier.
    pub fn id(&self) -> &B256 {
        &self.id
    }

    /// The owner recovered at parse time.
    pub fn owner(&self) -> &Address {
        &self.owner
    }

    /// The wrapped span-prefixed body.
    pub fn body(&self) -> &ChunkBody {
        &self.body
    }

    /// The full wire form.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(MIN_SOC_FIELDS_SIZE + self.body.size());
        out.extend_from_slice(self.id.as_slice());
        out.extend_from_slice(&self.signature.as_bytes());
        out.extend_from_slice(&self.body.to_bytes());
        out.freeze()
    }
}

/// The address a single-owner chunk with `id` and `owner` must live at.
pub fn soc_address(id: &B256, owner: &Address) -> SwarmAddress {
    let mut hasher = Keccak256::new();
    hasher.update(id);
    hasher.update(owner);
    SwarmAddress::from(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer() -> PrivateKeySigner {
        PrivateKeySigner::random()
    }

    #[test]
    fn roundtrip_recovers_owner() {
        let signer = test_signer();
        let chunk = SingleOwnerChunk::new(B256::repeat_byte(3), vec![1u8, 2, 3], &signer).unwrap();
        let decoded = SingleOwnerChunk::from_bytes(&chunk.to_bytes()).unwrap();
        assert_eq!(decoded.owner(), &signer.address());
        assert_eq!(decoded.address(), chunk.address());
        assert!(decoded.verify(&chunk.address()));
    }

    #[test]
    fn address_binds_id_and_owner() {
        let signer = test_signer();
        let a = SingleOwnerChunk::new(B256::repeat_byte(1), vec![0u8; 8], &signer).unwrap();
        let b = SingleOwnerChunk::new(B256::repeat_byte(2), vec![0u8; 8], &signer).unwrap();
        assert_ne!(a.address(), b.address());

        let other = SingleOwnerChunk::new(B256::repeat_byte(1), vec![0u8; 8], &test_signer()).unwrap();
        assert_ne!(a.address(), other.address());
    }

    #[test]
    fn verify_rejects_foreign_address() {
        let signer = test_signer();
        let chunk = SingleOwnerChunk::new(B256::ZERO, vec![9u8; 16], &signer).unwrap();
        assert!(!chunk.verify(&SwarmAddress::new([0x11; 32])));
    }

    #[test]
    fn from_bytes_rejects_short_input() {
        let err = SingleOwnerChunk::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, ChunkError::InsufficientData { .. }));
    }

    #[test]
    fn tampered_payload_changes_recovered_owner() {
        let signer = test_signer();
        let chunk = SingleOwnerChunk::new(B256::repeat_byte(7), vec![5u8; 32], &signer).unwrap();
        let address = chunk.address();
        let mut wire = chunk.to_bytes().to_vec();
        *wire.last_mut().unwrap() ^= 0xff;
        // Recovery yields some owner, but never one reproducing the address.
        match SingleOwnerChunk::from_bytes(&wire) {
            Ok(tampered) => assert!(!tampered.verify(&address)),
            Err(_) => {}
        }
    }
}

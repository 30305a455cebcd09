use std::fmt;

use voyager_primitives::SwarmAddress;

use crate::{FileError, ENCRYPTED_REFERENCE_SIZE, KEY_SIZE, REFERENCE_SIZE};

/// A reference to a chunk: its address, plus the decryption key when the
/// tree is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// The chunk address.
    pub address: SwarmAddress,
    /// The chunk decryption key, present iff the tree is encrypted.
    pub key: Option<[u8; KEY_SIZE]>,
}

impl Reference {
    /// A plain (unencrypted) reference.
    pub fn plain(address: SwarmAddress) -> Self {
        Self { address, key: None }
    }

    /// Serialized size of this reference.
    pub fn size(&self) -> usize {
        match self.key {
            Some(_) => ENCRYPTED_REFERENCE_SIZE,
            None => REFERENCE_SIZE,
        }
    }

    /// The wire form: `address` or `address || key`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(self.address.as_slice());
        if let Some(key) = &self.key {
            out.extend_from_slice(key);
        }
        out
    }

    /// Parses a reference of either size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FileError> {
        match bytes.len() {
            REFERENCE_SIZE => Ok(Self::plain(SwarmAddress::from_slice(bytes))),
            ENCRYPTED_REFERENCE_SIZE => {
                let mut key = [0u8; KEY_SIZE];
                key.copy_from_slice(&bytes[REFERENCE_SIZE..]);
                Ok(Self {
                    address: SwarmAddress::from_slice(&bytes[..REFERENCE_SIZE]),
                    key: Some(key),
                })
            }
            len => Err(FileError::InvalidReference(len)),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            None => write!(f, "{}", self.address),
            Some(key) => {
                write!(f, "{}", self.address)?;
                for byte in key {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_roundtrip() {
        let reference = Reference::plain(SwarmAddress::new([0x11; 32]));
        let bytes = reference.to_bytes();
        assert_eq!(bytes.len(), REFERENCE_SIZE);
        assert_eq!(Reference::from_bytes(&bytes).unwrap(), reference);
    }

    #[test]
    fn encrypted_roundtrip() {
        let reference = Reference {
            address: SwarmAddress::new([0x11; 32]),
            key: Some([0x22; 32]),
        };
        let bytes = reference.to_bytes();
        assert_eq!(bytes.len(), ENCRYPTED_REFERENCE_SIZE);
        assert_eq!(Reference::from_bytes(&bytes).unwrap(), reference);
    }

    #[test]
    fn bad_length_is_rejected() {
        assert!(matches!(
            Reference::from_bytes(&[0u8; 40]),
            Err(FileError::InvalidReference(40))
        ));
    }
}

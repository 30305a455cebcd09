use aes::Aes256;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};

use crate::KEY_SIZE;

type ChunkCipher = Ctr128BE<Aes256>;

/// Applies the AES-256-CTR keystream in place. CTR is an involution, so
/// the same call encrypts and decrypts.
pub(crate) fn apply_keystream(key: &[u8; KEY_SIZE], data: &mut [u8]) {
    let mut cipher = ChunkCipher::new(key.into(), &[0u8; 16].into());
    cipher.apply_keystream(data);
}

/// Draws a fresh chunk key.
pub(crate) fn random_key() -> [u8; KEY_SIZE] {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystream_is_an_involution() {
        let key = random_key();
        let plain = b"some chunk payload".to_vec();
        let mut data = plain.clone();

        apply_keystream(&key, &mut data);
        assert_ne!(data, plain);
        apply_keystream(&key, &mut data);
        assert_eq!(data, plain);
    }

    #[test]
    fn distinct_keys_distinct_streams() {
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        apply_keystream(&random_key(), &mut a);
        apply_keystream(&random_key(), &mut b);
        assert_ne!(a, b);
    }
}

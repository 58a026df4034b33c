//! NAT crypto: key-derivation hashes, the AES-CBC schedules and the
//! challenge handshake.
//!
//! Two schedules exist. The *legacy* schedule protects the Tree
//! device-ID exchange and folds the device serial into key/IV arrays
//! taken straight from configuration. The *modern* schedule protects the
//! authorization challenge and replaces those arrays with hashes of the
//! encrypted-AES-key/IV blobs. The formulas differ on purpose:
//! `~(serial ^ k)` legacy vs `~serial ^ k` modern. Do not normalise.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::config::CryptoConfig;
use crate::error::LinkError;

/// Magic constant opening every handshake plaintext.
pub const CRYPTO_MAGIC: u32 = 0xDEAD_BEEF;

/// Robert Sedgwick's string hash.
pub fn rs_hash(data: &[u8]) -> u32 {
    let b: u32 = 378_551;
    let mut a: u32 = 63_689;
    let mut hash: u32 = 0;
    for &c in data {
        hash = hash.wrapping_mul(a).wrapping_add(c as u32);
        a = a.wrapping_mul(b);
    }
    hash
}

/// Justin Sobel's bitwise hash.
pub fn js_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = 1_315_423_911;
    for &c in data {
        hash ^= hash
            .wrapping_shl(5)
            .wrapping_add(c as u32)
            .wrapping_add(hash >> 2);
    }
    hash
}

/// Daniel Bernstein's hash.
pub fn djb_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &c in data {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(c as u32);
    }
    hash
}

/// Donald Knuth's hash from The Art of Computer Programming.
pub fn dek_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = data.len() as u32;
    for &c in data {
        hash = (hash.wrapping_shl(5) ^ (hash >> 27)) ^ c as u32;
    }
    hash
}

fn words_to_bytes(words: [u32; 4]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, w) in words.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
    out
}

/// Immutable crypto material derived once at boot and shared by every
/// device on the bus.
#[derive(Debug, Clone)]
pub struct CryptoContext {
    legacy_key: [u32; 4],
    legacy_iv: [u32; 4],
    algo_key: [u32; 4],
    algo_iv: [u32; 4],
    master_device_id: [u8; 12],
}

impl CryptoContext {
    /// Derive the per-bus material from the boot configuration.
    ///
    /// The modern key/IV arrays hash the *textual* hex blobs, matching
    /// the firmware, which never decodes them before hashing.
    pub fn new(config: &CryptoConfig) -> Result<Self, LinkError> {
        let key_blob = config.aes_key.as_bytes();
        let iv_blob = config.aes_iv.as_bytes();
        let master = hex::decode(&config.master_device_id)
            .map_err(|e| LinkError::CryptoConfig(format!("master device id: {e}")))?;
        let master_device_id: [u8; 12] = master
            .try_into()
            .map_err(|_| LinkError::CryptoConfig("master device id must be 12 bytes".into()))?;

        Ok(Self {
            legacy_key: config.legacy_key,
            legacy_iv: config.legacy_iv,
            algo_key: [
                dek_hash(key_blob),
                js_hash(key_blob),
                djb_hash(key_blob),
                rs_hash(key_blob),
            ],
            algo_iv: [
                dek_hash(iv_blob),
                js_hash(iv_blob),
                djb_hash(iv_blob),
                rs_hash(iv_blob),
            ],
            master_device_id,
        })
    }

    /// STM32 device-ID configured for extensions.
    pub fn master_device_id(&self) -> [u8; 12] {
        self.master_device_id
    }

    /// Key/IV for the legacy device-ID exchange of `serial`.
    pub fn legacy_key_iv(&self, serial: u32) -> ([u8; 16], [u8; 16]) {
        let key = self.legacy_key.map(|k| !(serial ^ k));
        let iv = self.legacy_iv.map(|v| serial ^ v);
        (words_to_bytes(key), words_to_bytes(iv))
    }

    /// Key/IV for the modern challenge packet of `serial`.
    pub fn modern_key_iv(&self, serial: u32) -> ([u8; 16], [u8; 16]) {
        let key = self.algo_key.map(|k| !serial ^ k);
        let iv = self.algo_iv.map(|v| serial ^ v);
        (words_to_bytes(key), words_to_bytes(iv))
    }
}

/// Session material derived from a solved challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    key: [u32; 4],
    iv: u32,
}

impl SessionKeys {
    /// AES key for post-handshake data packets: `iv ^ key[i]`.
    pub fn data_key(&self) -> [u8; 16] {
        words_to_bytes(self.key.map(|k| self.iv ^ k))
    }

    /// AES IV for post-handshake data packets: the session IV repeated.
    pub fn data_iv(&self) -> [u8; 16] {
        words_to_bytes([self.iv; 4])
    }
}

/// Solve a challenge: hash `deviceID ‖ random ‖ serial` into the session
/// key, and the same buffer XORed with 0xA5 into the session IV.
pub fn solve_challenge(device_id: &[u8; 12], random: u32, serial: u32) -> SessionKeys {
    let mut buf = [0u8; 20];
    buf[..12].copy_from_slice(device_id);
    buf[12..16].copy_from_slice(&random.to_le_bytes());
    buf[16..20].copy_from_slice(&serial.to_le_bytes());

    let key = [rs_hash(&buf), js_hash(&buf), djb_hash(&buf), dek_hash(&buf)];

    let mut xored = buf;
    for b in xored.iter_mut() {
        *b ^= 0xA5;
    }
    SessionKeys {
        key,
        iv: rs_hash(&xored),
    }
}

/// AES-128-CBC encryption in place, no padding.
pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<(), LinkError> {
    if data.len() % 16 != 0 {
        return Err(LinkError::CipherLength(data.len()));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut prev = *iv;
    for block in data.chunks_exact_mut(16) {
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        prev.copy_from_slice(block);
    }
    Ok(())
}

/// AES-128-CBC decryption in place, no padding.
pub fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<(), LinkError> {
    if data.len() % 16 != 0 {
        return Err(LinkError::CipherLength(data.len()));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut prev = *iv;
    for block in data.chunks_exact_mut(16) {
        let mut saved = [0u8; 16];
        saved.copy_from_slice(block);
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        prev = saved;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_reference_values() {
        assert_eq!(rs_hash(b""), 0);
        assert_eq!(rs_hash(b"a"), 97);
        assert_eq!(js_hash(b""), 1_315_423_911);
        assert_eq!(djb_hash(b""), 5381);
        assert_eq!(djb_hash(b"a"), 177_670);
        assert_eq!(dek_hash(b""), 0);
        assert_eq!(dek_hash(b"a"), 65);
    }

    #[test]
    fn cbc_round_trip() {
        let key = [0x42u8; 16];
        let iv = [0x07u8; 16];
        let plain: Vec<u8> = (0..32).collect();
        let mut data = plain.clone();
        cbc_encrypt(&key, &iv, &mut data).unwrap();
        assert_ne!(data, plain);
        cbc_decrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn cbc_chains_blocks() {
        let key = [0x42u8; 16];
        let iv = [0u8; 16];
        // Identical plaintext blocks must not produce identical
        // ciphertext blocks under CBC.
        let mut data = [0xAAu8; 32];
        cbc_encrypt(&key, &iv, &mut data).unwrap();
        assert_ne!(data[..16], data[16..]);
    }

    #[test]
    fn cbc_rejects_partial_blocks() {
        let key = [0u8; 16];
        let iv = [0u8; 16];
        let mut data = [0u8; 15];
        assert!(cbc_encrypt(&key, &iv, &mut data).is_err());
        assert!(cbc_decrypt(&key, &iv, &mut data).is_err());
    }

    #[test]
    fn session_keys_follow_data_schedule() {
        let device_id = [0x11u8; 12];
        let session = solve_challenge(&device_id, 0x1234_5678, 0xDEAD_0001);
        let iv_bytes = session.data_iv();
        // The data IV is the session IV serialised four times.
        assert_eq!(iv_bytes[0..4], iv_bytes[4..8]);
        assert_eq!(iv_bytes[0..4], iv_bytes[12..16]);
        // Same inputs, same session.
        assert_eq!(
            session,
            solve_challenge(&device_id, 0x1234_5678, 0xDEAD_0001)
        );
        // A different random must change the key.
        assert_ne!(
            session.data_key(),
            solve_challenge(&device_id, 0x1234_5679, 0xDEAD_0001).data_key()
        );
    }
}

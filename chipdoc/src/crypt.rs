//! 3DES, Retail MAC and key derivation.
//!
//! Basic Access Control and the Secure Messaging channel both use two-key
//! triple-DES in EDE mode:
//! ```plain
//! encrypt((K1, K2), D) = encrypt(K1, decrypt(K2, encrypt(K1, D)))
//! ```
//! with Cipher Block Chaining, and the Retail MAC (ISO/IEC 9797-1
//! algorithm 3): single DES in CBC over the message under K1, with the final
//! state decrypted under K2 and re-encrypted under K1.
//!
//! The key derivation function is:
//! ```plain
//! keydata = sha1(seed || counter)[0..16]
//! ```
//! with the counter as a big-endian 32-bit value (1 for encryption keys,
//! 2 for MAC keys) and the DES parity bit of each key byte fixed up.


use cipher::block_padding::NoPadding;
use cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use des::{Des, TdesEde2};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;


/// Block size of DES and 3DES in bytes.
pub const BLOCK_SIZE: usize = 8;

/// Size of a two-key 3DES key in bytes.
pub const KEY_SIZE: usize = 16;


/// Derives a 16-byte key from a seed and a counter.
pub fn derive_key(key_seed: &[u8], counter: u32) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut hasher = Sha1::new();
    hasher.update(key_seed);
    hasher.update(counter.to_be_bytes());
    let digest = hasher.finalize();

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&digest[0..KEY_SIZE]);
    set_parity_bits(&mut *key);
    key
}

/// The key derivation function for encryption purposes.
pub fn derive_encryption_key(key_seed: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    derive_key(key_seed, 1)
}

/// The key derivation function for message authentication purposes.
pub fn derive_mac_key(key_seed: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    derive_key(key_seed, 2)
}

/// DES keys use only seven bits per byte; the lowest bit of each byte makes
/// its population count odd.
fn set_parity_bits(key: &mut [u8]) {
    for byte in key {
        *byte &= 0xFE;
        *byte |= 1 ^ (byte.count_ones() as u8 & 1);
    }
}


/// Encrypts pre-padded data in-place with 3DES-CBC.
pub fn encrypt_padded_data(data: &mut [u8], key: &[u8; KEY_SIZE], iv: &[u8; BLOCK_SIZE]) {
    let length = data.len();
    debug_assert_eq!(length % BLOCK_SIZE, 0);
    let encryptor = cbc::Encryptor::<TdesEde2>::new(key.into(), iv.into());
    encryptor.encrypt_padded_mut::<NoPadding>(data, length).unwrap();
}

/// Decrypts data in-place with 3DES-CBC. Does not strip padding.
pub fn decrypt_padded_data(data: &mut [u8], key: &[u8; KEY_SIZE], iv: &[u8; BLOCK_SIZE]) {
    debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
    let decryptor = cbc::Decryptor::<TdesEde2>::new(key.into(), iv.into());
    decryptor.decrypt_padded_mut::<NoPadding>(data).unwrap();
}


/// Generates the Retail MAC of pre-padded data.
pub fn retail_mac(key: &[u8; KEY_SIZE], data: &[u8]) -> [u8; BLOCK_SIZE] {
    debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
    let des1 = Des::new_from_slice(&key[0..8]).unwrap();
    let des2 = Des::new_from_slice(&key[8..16]).unwrap();

    let mut state = [0u8; BLOCK_SIZE];
    for block in data.chunks_exact(BLOCK_SIZE) {
        for (state_byte, block_byte) in state.iter_mut().zip(block.iter()) {
            *state_byte ^= *block_byte;
        }
        des1.encrypt_block((&mut state).into());
    }
    des2.decrypt_block((&mut state).into());
    des1.encrypt_block((&mut state).into());
    state
}

/// Verifies the Retail MAC of pre-padded data in constant time.
pub fn verify_retail_mac(key: &[u8; KEY_SIZE], data: &[u8], expected_mac: &[u8]) -> bool {
    let calculated_mac = retail_mac(key, data);
    calculated_mac[..].ct_eq(expected_mac).into()
}

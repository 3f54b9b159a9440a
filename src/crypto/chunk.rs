// PdfChunk - Encrypted PDF chunk download core
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Per-chunk AES decryption
//!
//! # Wire Format
//! - Each chunk is encrypted independently: `IV (16 bytes) || AES-128-CBC(PKCS#7)`
//! - Chunk key: first 16 bytes of `SHA-256("{base_key}_{index}")`
//! - Chunk 0 may carry the plaintext `%PDF-` signature in front of the
//!   ciphertext; those 5 bytes are kept and only the remainder is decrypted
//!
//! # Failure Handling
//! Under [`DecryptFailurePolicy::Fallback`] decryption never fails: input that
//! is too short, misaligned or badly padded is returned unchanged, since some
//! deployments serve unencrypted chunks. [`DecryptFailurePolicy::Strict`]
//! turns the same conditions into [`PdfDownloadError::DecryptionFailed`].

use crate::error::{PdfDownloadError, Result};
use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// AES-128 key length in bytes
pub const KEY_LEN: usize = 16;

/// CBC initialization vector length in bytes
pub const IV_LEN: usize = 16;

/// Plaintext signature that may precede the ciphertext of chunk 0
pub const PDF_SIGNATURE: &[u8] = b"%PDF-";

/// Whether chunk payloads are decrypted at all
///
/// `Passthrough` is chosen per download request, for servers that deliver
/// plaintext chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecryptMode {
    #[default]
    Decrypt,
    Passthrough,
}

/// Behaviour when a chunk cannot be decrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecryptFailurePolicy {
    /// Return the original bytes and log a warning
    #[default]
    Fallback,
    /// Fail the chunk
    Strict,
}

/// Derive the chunk-specific AES key
///
/// Every chunk gets its own key even though all chunks of a file share the
/// same base key.
pub fn derive_chunk_key(base_key: &str, index: usize) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(format!("{}_{}", base_key, index).as_bytes());
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

/// Decrypt `IV || ciphertext` with AES-128-CBC and PKCS#7 padding
///
/// # Errors
/// - Input shorter than one IV
/// - Ciphertext that is empty, not block aligned, or badly padded
pub fn decrypt_aes_cbc(data: &[u8], key: &[u8; KEY_LEN]) -> std::result::Result<Vec<u8>, String> {
    if data.len() < IV_LEN {
        return Err(format!("{} bytes is too short to contain an IV", data.len()));
    }

    let (iv, ciphertext) = data.split_at(IV_LEN);
    let decryptor = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| e.to_string())?;

    let mut buffer = ciphertext.to_vec();
    let plaintext = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| format!("unpad failed: {}", e))?;

    Ok(plaintext.to_vec())
}

/// Encrypt with AES-128-CBC and PKCS#7 padding, returning `IV || ciphertext`
pub fn encrypt_aes_cbc(plaintext: &[u8], key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Vec<u8> {
    let encryptor = Aes128CbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Encrypt a plaintext chunk the way the report service does
///
/// Uses a random IV, so two calls give different ciphertexts that both
/// decrypt to `plaintext`.
pub fn encrypt_chunk(plaintext: &[u8], base_key: &str, index: usize) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    encrypt_aes_cbc(plaintext, &derive_chunk_key(base_key, index), &iv)
}

/// Decrypt one chunk, falling back to the original bytes on any failure
pub fn decrypt_chunk(encrypted: &[u8], base_key: &str, index: usize) -> Vec<u8> {
    match ChunkDecryptor::default().decrypt(encrypted, base_key, index, DecryptMode::Decrypt) {
        Ok(data) => data,
        // fallback policy never errors
        Err(_) => encrypted.to_vec(),
    }
}

/// Chunk decryptor with a configurable failure policy
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkDecryptor {
    failure_policy: DecryptFailurePolicy,
}

impl ChunkDecryptor {
    pub fn new(failure_policy: DecryptFailurePolicy) -> Self {
        Self { failure_policy }
    }

    pub fn failure_policy(&self) -> DecryptFailurePolicy {
        self.failure_policy
    }

    /// Decrypt a chunk payload
    ///
    /// Deterministic: the same input, key and index always give the same output.
    ///
    /// # Errors
    /// Only under [`DecryptFailurePolicy::Strict`].
    pub fn decrypt(
        &self,
        encrypted: &[u8],
        base_key: &str,
        index: usize,
        mode: DecryptMode,
    ) -> Result<Vec<u8>> {
        if mode == DecryptMode::Passthrough {
            return Ok(encrypted.to_vec());
        }

        let key = derive_chunk_key(base_key, index);

        // Plaintext signature in front of chunk 0
        if index == 0 && encrypted.starts_with(PDF_SIGNATURE) {
            let (header, remainder) = encrypted.split_at(PDF_SIGNATURE.len());
            if remainder.is_empty() {
                return Ok(encrypted.to_vec());
            }

            debug!(chunk_index = index, "plaintext signature found, decrypting remainder");
            return match decrypt_aes_cbc(remainder, &key) {
                Ok(plaintext) => {
                    let mut out = Vec::with_capacity(header.len() + plaintext.len());
                    out.extend_from_slice(header);
                    out.extend_from_slice(&plaintext);
                    Ok(out)
                }
                Err(message) => self.on_failure(encrypted, index, message),
            };
        }

        match decrypt_aes_cbc(encrypted, &key) {
            Ok(plaintext) => {
                debug!(
                    chunk_index = index,
                    size = plaintext.len(),
                    head = %hex::encode(&plaintext[..plaintext.len().min(8)]),
                    "chunk decrypted"
                );
                Ok(plaintext)
            }
            Err(message) => self.on_failure(encrypted, index, message),
        }
    }

    fn on_failure(&self, original: &[u8], index: usize, message: String) -> Result<Vec<u8>> {
        match self.failure_policy {
            DecryptFailurePolicy::Fallback => {
                warn!(
                    chunk_index = index,
                    reason = %message,
                    "decryption failed, keeping original bytes (payload may be unencrypted)"
                );
                Ok(original.to_vec())
            }
            DecryptFailurePolicy::Strict => {
                Err(PdfDownloadError::DecryptionFailed { index, message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_KEY: &str = "report-key";

    #[test]
    fn test_derive_chunk_key_known_values() {
        assert_eq!(
            hex::encode(derive_chunk_key(BASE_KEY, 0)),
            "5f3a4cb223883c30d83e79460b3c079b"
        );
        assert_eq!(
            hex::encode(derive_chunk_key(BASE_KEY, 12)),
            "f3be80a3bf87eeaf596eef46d60eaade"
        );
        assert_ne!(derive_chunk_key(BASE_KEY, 1), derive_chunk_key(BASE_KEY, 2));
    }

    #[test]
    fn test_decrypt_known_ciphertext() {
        let encrypted = hex::decode(
            "000102030405060708090a0b0c0d0e0f70ffd931daab1b626d4df90394124919",
        )
        .unwrap();
        assert_eq!(decrypt_chunk(&encrypted, BASE_KEY, 1), b"hello chunk");
    }

    #[test]
    fn test_round_trip() {
        let plaintext: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let encrypted = encrypt_chunk(&plaintext, BASE_KEY, 3);
        assert_ne!(encrypted[IV_LEN..], plaintext[..]);
        assert_eq!(decrypt_chunk(&encrypted, BASE_KEY, 3), plaintext);
    }

    #[test]
    fn test_encrypt_pads_aligned_and_empty_input() {
        let key = derive_chunk_key(BASE_KEY, 0);
        let iv = [7u8; IV_LEN];

        let aligned = encrypt_aes_cbc(&[1u8; 32], &key, &iv);
        assert_eq!(aligned.len(), IV_LEN + 48);
        assert_eq!(&aligned[..IV_LEN], &iv);
        assert_eq!(decrypt_aes_cbc(&aligned, &key).unwrap(), vec![1u8; 32]);

        let empty = encrypt_aes_cbc(b"", &key, &iv);
        assert_eq!(empty.len(), IV_LEN + 16);
        assert!(decrypt_aes_cbc(&empty, &key).unwrap().is_empty());
    }

    #[test]
    fn test_decrypt_is_idempotent() {
        let encrypted = encrypt_chunk(b"same input twice", BASE_KEY, 7);
        let first = decrypt_chunk(&encrypted, BASE_KEY, 7);
        let second = decrypt_chunk(&encrypted, BASE_KEY, 7);
        assert_eq!(first, second);
    }

    #[test]
    fn test_chunk_zero_plaintext_header() {
        let key = derive_chunk_key(BASE_KEY, 0);
        let mut chunk = PDF_SIGNATURE.to_vec();
        chunk.extend(encrypt_aes_cbc(b"1.7\n%body", &key, &[9u8; IV_LEN]));

        let decrypted = decrypt_chunk(&chunk, BASE_KEY, 0);
        assert_eq!(&decrypted[..5], PDF_SIGNATURE);
        assert_eq!(&decrypted[5..], b"1.7\n%body");
    }

    #[test]
    fn test_bare_header_returned_unchanged() {
        assert_eq!(decrypt_chunk(PDF_SIGNATURE, BASE_KEY, 0), PDF_SIGNATURE);
    }

    #[test]
    fn test_short_input_falls_back() {
        let data = b"tiny";
        assert_eq!(decrypt_chunk(data, BASE_KEY, 4), data);
    }

    #[test]
    fn test_wrong_key_falls_back_or_differs() {
        // misaligned ciphertext can never unpad
        let mut data = vec![0u8; IV_LEN];
        data.extend_from_slice(b"not a block multiple");
        assert_eq!(decrypt_chunk(&data, BASE_KEY, 2), data);
    }

    #[test]
    fn test_strict_policy_reports_failure() {
        let decryptor = ChunkDecryptor::new(DecryptFailurePolicy::Strict);
        let result = decryptor.decrypt(b"short", BASE_KEY, 5, DecryptMode::Decrypt);
        assert!(matches!(
            result,
            Err(PdfDownloadError::DecryptionFailed { index: 5, .. })
        ));
    }

    #[test]
    fn test_passthrough_mode() {
        let encrypted = encrypt_chunk(b"secret", BASE_KEY, 1);
        let decryptor = ChunkDecryptor::default();
        let out = decryptor
            .decrypt(&encrypted, BASE_KEY, 1, DecryptMode::Passthrough)
            .unwrap();
        assert_eq!(out, encrypted);
    }
}

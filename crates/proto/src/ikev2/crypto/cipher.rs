//! AEAD ciphers for the SK and SKF payloads
//!
//! Implements the authenticated encryption used by RFC 7296 Section 3.14;
//! the associated data is always the final IKE header of the datagram
//! carrying the encrypted payload.

use crate::ikev2::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit, Nonce, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305 as ChaCha;

/// All supported suites use a 12-byte AEAD nonce internally
const NONCE_LEN: usize = 12;

fn seal<A>(key: &[u8], nonce: &[u8; NONCE_LEN], payload: Payload<'_, '_>) -> Result<Vec<u8>>
where
    A: Aead + KeyInit,
{
    A::new_from_slice(key)
        .map_err(|_| Error::CryptoError("AEAD key rejected".into()))?
        .encrypt(Nonce::<A>::from_slice(nonce), payload)
        .map_err(|_| Error::CryptoError("AEAD seal failed".into()))
}

fn open<A>(key: &[u8], nonce: &[u8; NONCE_LEN], payload: Payload<'_, '_>) -> Result<Vec<u8>>
where
    A: Aead + KeyInit,
{
    A::new_from_slice(key)
        .map_err(|_| Error::CryptoError("AEAD key rejected".into()))?
        .decrypt(Nonce::<A>::from_slice(nonce), payload)
        .map_err(|_| Error::CryptoError("AEAD open failed".into()))
}

/// Cipher algorithm for SK payload encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-GCM with 128-bit key (AEAD)
    AesGcm128,
    /// AES-GCM with 256-bit key (AEAD)
    AesGcm256,
    /// ChaCha20-Poly1305 (AEAD)
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    /// Key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            CipherAlgorithm::AesGcm128 => 16,
            CipherAlgorithm::AesGcm256 => 32,
            CipherAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    /// Length of the IV transmitted in the payload
    pub fn iv_len(self) -> usize {
        match self {
            // GCM sends an 8-byte explicit IV (RFC 4106); the 4-byte
            // salt is implicit and zero here.
            CipherAlgorithm::AesGcm128 | CipherAlgorithm::AesGcm256 => 8,
            // ChaCha transmits the full nonce (RFC 7539).
            CipherAlgorithm::ChaCha20Poly1305 => 12,
        }
    }

    /// Authentication tag length in bytes
    pub fn tag_len(self) -> usize {
        16
    }

    fn check_lengths(self, key: &[u8], iv: &[u8]) -> Result<()> {
        if key.len() != self.key_len() {
            return Err(Error::InvalidKeyLength {
                expected: self.key_len(),
                actual: key.len(),
            });
        }
        if iv.len() != self.iv_len() {
            return Err(Error::InvalidIvLength {
                expected: self.iv_len(),
                actual: iv.len(),
            });
        }
        Ok(())
    }

    /// Widen the wire IV to the full nonce, zero-filling the salt
    fn nonce_from_iv(self, iv: &[u8]) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..iv.len()].copy_from_slice(iv);
        nonce
    }

    /// Encrypt with AEAD
    ///
    /// # Arguments
    ///
    /// * `key` - Encryption key (SK_e)
    /// * `iv` - Explicit IV transmitted in the payload
    /// * `plaintext` - Data to encrypt
    /// * `aad` - Additional authenticated data (the IKE header)
    ///
    /// # Errors
    ///
    /// Returns an error on key/IV length mismatch or cipher failure.
    ///
    /// # Returns
    ///
    /// Ciphertext with the authentication tag appended.
    pub fn encrypt(self, key: &[u8], iv: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.check_lengths(key, iv)?;
        let nonce = self.nonce_from_iv(iv);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match self {
            CipherAlgorithm::AesGcm128 => seal::<Aes128Gcm>(key, &nonce, payload),
            CipherAlgorithm::AesGcm256 => seal::<Aes256Gcm>(key, &nonce, payload),
            CipherAlgorithm::ChaCha20Poly1305 => seal::<ChaCha>(key, &nonce, payload),
        }
    }

    /// Decrypt with AEAD, verifying the tag
    ///
    /// # Errors
    ///
    /// Returns an error on key/IV length mismatch or integrity failure;
    /// callers must treat integrity failure as a silent drop.
    pub fn decrypt(self, key: &[u8], iv: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.check_lengths(key, iv)?;
        if ciphertext.len() < self.tag_len() {
            return Err(Error::BufferTooShort {
                required: self.tag_len(),
                available: ciphertext.len(),
            });
        }
        let nonce = self.nonce_from_iv(iv);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match self {
            CipherAlgorithm::AesGcm128 => open::<Aes128Gcm>(key, &nonce, payload),
            CipherAlgorithm::AesGcm256 => open::<Aes256Gcm>(key, &nonce, payload),
            CipherAlgorithm::ChaCha20Poly1305 => open::<ChaCha>(key, &nonce, payload),
        }
    }
}

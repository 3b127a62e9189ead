//! Pseudo-Random Function (PRF) implementations
//!
//! Used for SKEYSEED derivation (RFC 7296 Section 2.14) by the exchange
//! handlers and for stateless cookie generation by the DoS gate.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};

/// HMAC over the concatenation of `parts`, keyed with `key`
///
/// Feeding the parts one by one spares the callers the concatenation
/// buffers prf+ would otherwise allocate per block.
fn keyed_mac<M>(key: &[u8], parts: &[&[u8]]) -> Vec<u8>
where
    M: Mac + KeyInit,
{
    let mut mac = <M as Mac>::new_from_slice(key).expect("any key length fits an HMAC");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// PRF algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlgorithm {
    /// HMAC-SHA2-256
    HmacSha256,
    /// HMAC-SHA2-384
    HmacSha384,
    /// HMAC-SHA2-512
    HmacSha512,
}

impl PrfAlgorithm {
    /// PRF output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha256 => 32,
            PrfAlgorithm::HmacSha384 => 48,
            PrfAlgorithm::HmacSha512 => 64,
        }
    }

    /// Compute the PRF over `data` keyed with `key`
    pub fn compute(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        self.compute_parts(key, &[data])
    }

    /// Compute the PRF over the concatenation of `parts`
    pub fn compute_parts(self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        match self {
            PrfAlgorithm::HmacSha256 => keyed_mac::<Hmac<Sha256>>(key, parts),
            PrfAlgorithm::HmacSha384 => keyed_mac::<Hmac<Sha384>>(key, parts),
            PrfAlgorithm::HmacSha512 => keyed_mac::<Hmac<Sha512>>(key, parts),
        }
    }

    /// Compute prf+ key expansion (RFC 7296 Section 2.13)
    ///
    /// ```text
    /// prf+ (K,S) = T1 | T2 | T3 | ...
    /// T1 = prf (K, S | 0x01)
    /// Tn = prf (K, Tn-1 | S | n)
    /// ```
    ///
    /// The block counter is a single octet, so prf+ can produce at most
    /// 255 blocks of keying material.
    pub fn prf_plus(self, key: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
        let mut keymat = Vec::with_capacity(len + self.output_len());
        let mut block: Vec<u8> = Vec::new();
        for n in 1u8..=u8::MAX {
            block = self.compute_parts(key, &[&block, seed, &[n]]);
            keymat.extend_from_slice(&block);
            if keymat.len() >= len {
                break;
            }
        }
        keymat.truncate(len);
        keymat
    }
}

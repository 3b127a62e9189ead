//! Cryptographic interfaces consumed by the demultiplexer
//!
//! The engine itself only needs authenticated encryption for the SK/SKF
//! payloads and a PRF for stateless cookies; handlers use the same
//! primitives for SKEYSEED derivation.

pub mod cipher;
pub mod prf;

pub use cipher::CipherAlgorithm;
pub use prf::PrfAlgorithm;

/// Directional AEAD keys held by an SA once key derivation completed
///
/// `sk_e_send` protects what we emit, `sk_e_recv` authenticates what the
/// peer sends; which of SK_ei/SK_er each one is depends on the SA role.
#[derive(Clone)]
pub struct SaKeys {
    /// Negotiated AEAD algorithm
    pub cipher: CipherAlgorithm,

    /// Key for outbound SK payloads
    pub sk_e_send: Vec<u8>,

    /// Key for inbound SK payloads
    pub sk_e_recv: Vec<u8>,
}

impl std::fmt::Debug for SaKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log key material
        f.debug_struct("SaKeys")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sa_keys_debug_hides_material() {
        let keys = SaKeys {
            cipher: CipherAlgorithm::AesGcm128,
            sk_e_send: vec![0xAA; 16],
            sk_e_recv: vec![0xBB; 16],
        };
        let rendered = format!("{:?}", keys);
        assert!(!rendered.contains("aa"));
        assert!(!rendered.contains("170"));
        assert!(rendered.contains("AesGcm128"));
    }
}

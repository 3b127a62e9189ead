//! Stateless DoS cookies (RFC 7296 Section 2.6)
//!
//! Above the half-open soft threshold the responder answers IKE_SA_INIT
//! requests with a COOKIE notification instead of allocating state. The
//! token binds the peer address, its SPI and its nonce to a local secret,
//! so a returning initiator proves reachability without the responder
//! remembering anything.

use super::constants::COOKIE_SIZE;
use super::crypto::PrfAlgorithm;
use rand::RngCore;
use std::net::IpAddr;

/// Generates and verifies stateless cookies
pub struct CookieJar {
    secret: [u8; 32],
}

impl CookieJar {
    /// Jar with a fresh random secret
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        CookieJar { secret }
    }

    /// Jar with a fixed secret, for tests
    pub fn with_secret(secret: [u8; 32]) -> Self {
        CookieJar { secret }
    }

    /// The cookie for (peer address, initiator SPI, initiator nonce)
    pub fn cookie_for(&self, peer: IpAddr, spi_i: u64, nonce_i: &[u8]) -> Vec<u8> {
        let mut input = Vec::with_capacity(16 + 8 + nonce_i.len());
        match peer {
            IpAddr::V4(ip) => input.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => input.extend_from_slice(&ip.octets()),
        }
        input.extend_from_slice(&spi_i.to_be_bytes());
        input.extend_from_slice(nonce_i);

        let cookie = PrfAlgorithm::HmacSha256.compute(&self.secret, &input);
        debug_assert_eq!(cookie.len(), COOKIE_SIZE);
        cookie
    }

    /// Does a presented cookie match what we would mint now?
    pub fn verify(&self, peer: IpAddr, spi_i: u64, nonce_i: &[u8], presented: &[u8]) -> bool {
        presented == self.cookie_for(peer, spi_i, nonce_i).as_slice()
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        CookieJar::new()
    }
}

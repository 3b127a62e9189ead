//! Protocol engine for the Keryx IPsec keying daemon.
//!
//! This crate implements the IKEv2 (RFC 7296) control plane core: the
//! message demultiplexer, the table-driven state machine, encrypted
//! fragment reassembly (RFC 7383), Message-ID windowing and the
//! completion path that advances, suspends or destroys Security
//! Associations.
//!
//! # Example
//!
//! ```rust
//! use keryx_proto::ikev2::message::IkeHeader;
//! use keryx_proto::ikev2::constants::{ExchangeType, IkeFlags, PayloadType};
//!
//! // Parse a wire header
//! let header = IkeHeader::new(
//!     0x0102030405060708,
//!     0,
//!     PayloadType::Sa as u8,
//!     ExchangeType::IkeSaInit,
//!     IkeFlags::request(true),
//!     0,
//!     28,
//! );
//! let wire = header.to_bytes();
//! let parsed = IkeHeader::from_bytes(&wire).unwrap();
//! assert_eq!(parsed.initiator_spi, 0x0102030405060708);
//! ```
//!
//! # Security
//!
//! - No unsafe code
//! - All cryptographic operations use RustCrypto crates
//! - Decrypt failures are dropped silently; no oracle is exposed
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 Protocol
//! - [RFC 7383](https://datatracker.ietf.org/doc/html/rfc7383) - IKEv2 Message Fragmentation

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ikev2;

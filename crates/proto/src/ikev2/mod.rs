//! IKEv2 (Internet Key Exchange v2) state demultiplexer
//!
//! This module implements the IKEv2 control-plane core as defined in
//! RFC 7296, with encrypted-fragment support from RFC 7383.
//!
//! # Architecture
//!
//! ```text
//! datagram in
//!   │
//!   ▼
//! Engine::process_packet (exchange)
//!   ├── classify by exchange type × role, SA lookup       (sa)
//!   ├── DoS gate: half-open census, stateless cookies     (cookie)
//!   ├── busy / retransmit checks                          (msgid)
//!   ├── transition selection over the static table        (state)
//!   │     ├── clear payload decode + verify               (payload)
//!   │     ├── SKF fragment collection                     (fragment)
//!   │     └── SK decrypt + encrypted payload verify       (crypto)
//!   ├── handler invocation (ExchangeHandlers)
//!   └── completion: advance / emancipate / reply / delete
//! ```
//!
//! The engine is single-owner: one event-loop task ([`service`]) feeds it
//! datagrams and timer ticks. Long-running cryptographic work is modelled
//! as handler suspension; the suspended message digest is owned by its SA
//! until [`exchange::Engine::resume`] re-enters the dispatcher.
//!
//! # Message Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       IKE SA Initiator's SPI                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       IKE SA Responder's SPI                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Message ID                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            Length                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 Protocol
//! - [RFC 7383](https://datatracker.ietf.org/doc/html/rfc7383) - Message Fragmentation

pub mod config;
pub mod constants;
pub mod cookie;
pub mod crypto;
pub mod error;
pub mod exchange;
pub mod fragment;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod msgid;
pub mod payload;
pub mod sa;
pub mod service;
pub mod state;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use exchange::{Engine, SaActions};
pub use sa::{Sa, SaRole, SaSerial};
pub use state::{ExchangeHandlers, HandlerId, SaState, TransitionResult};

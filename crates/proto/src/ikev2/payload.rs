//! Payload classification: decode and verify
//!
//! Splits an incoming message into a chain of payload digests
//! (RFC 7296 Section 3.2) and matches the decoded set against the
//! expected-payload signature of a state transition.
//!
//! Unknown payloads are handled per RFC 7296 Section 2.5: a set critical
//! bit aborts the message with UNSUPPORTED_CRITICAL_PAYLOAD, a clear one
//! is logged and skipped without interrupting the walk.

use super::constants::*;
use super::error::{Error, Result};
use super::message::{IkeHeader, NotifyPayload, PayloadHeader, SkfHeader};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// One decoded payload
#[derive(Debug, Clone)]
pub struct PayloadDigest {
    /// Payload type number, raw
    pub payload_type: u8,

    /// Critical bit from the generic header
    pub critical: bool,

    /// Next-payload field from the generic header
    ///
    /// For SK/SKF this names the first embedded payload rather than a
    /// sibling (RFC 7296 Section 3.14).
    pub next_payload: u8,

    /// Payload body, excluding the generic header
    pub body: Vec<u8>,
}

/// Result of one payload-chain decode pass
#[derive(Debug, Clone, Default)]
pub struct PayloadSummary {
    /// The pass ran (distinguishes "not yet parsed" from "empty")
    pub parsed: bool,

    /// Payload types seen at least once
    pub seen: PayloadTypeSet,

    /// Payload types seen more than once
    pub repeated: PayloadTypeSet,

    /// Decode failure, as the notification that should answer it
    pub error: Option<NotifyType>,

    /// Notification data accompanying `error`
    pub error_data: Vec<u8>,
}

/// Decode a payload chain into `digests`
///
/// Walks the chain starting at `first_np`, appending one digest per
/// decoded payload. The walk stops at the chain end, at the first SK/SKF
/// payload (its content is nested), or at the first error; errors are
/// reported in the summary, not as a `Result`, because a partial decode
/// still matters to the caller.
pub fn decode_payloads(
    buf: &[u8],
    first_np: u8,
    digests: &mut Vec<PayloadDigest>,
) -> PayloadSummary {
    let mut summary = PayloadSummary {
        parsed: true,
        ..Default::default()
    };

    let mut np = first_np;
    let mut offset = 0usize;

    while np != PayloadType::None.to_u8() {
        if digests.len() >= MAX_PAYLOADS_PER_MESSAGE {
            warn!(
                limit = MAX_PAYLOADS_PER_MESSAGE,
                "more than {} payloads in message; ignored", MAX_PAYLOADS_PER_MESSAGE
            );
            summary.error = Some(NotifyType::InvalidSyntax);
            break;
        }

        let header = match PayloadHeader::from_bytes(&buf[offset..]) {
            Ok(h) => h,
            Err(_) => {
                warn!("malformed payload in packet");
                summary.error = Some(NotifyType::InvalidSyntax);
                break;
            }
        };

        let end = offset + header.length as usize;
        if end > buf.len() {
            warn!("payload length {} overruns message", header.length);
            summary.error = Some(NotifyType::InvalidSyntax);
            break;
        }

        if PayloadType::from_u8(np).is_none() {
            // RFC 7296 2.5: critical means reject the whole message,
            // non-critical means skip and keep walking.
            if header.critical {
                warn!(payload_type = np, "message contained an unknown critical payload type");
                summary.error = Some(NotifyType::UnsupportedCriticalPayload);
                summary.error_data = vec![np];
                break;
            }
            debug!(
                payload_type = np,
                "non-critical unknown payload ignored"
            );
            np = header.next_payload;
            offset = end;
            continue;
        }

        if np >= PayloadTypeSet::BIT_LIMIT {
            debug!(payload_type = np, "payload type above bitset limit");
            summary.error = Some(NotifyType::InvalidSyntax);
            break;
        }

        if summary.seen.contains_raw(np) {
            summary.repeated.insert_raw(np);
        }
        summary.seen.insert_raw(np);

        let body = buf[offset + PayloadHeader::SIZE..end].to_vec();
        debug!(payload_type = np, len = body.len(), "decoded payload");

        digests.push(PayloadDigest {
            payload_type: np,
            critical: header.critical,
            next_payload: header.next_payload,
            body,
        });

        // SK and SKF terminate the walk: their next-payload field names
        // the first *embedded* payload (RFC 7296 3.14).
        if np == PayloadType::Sk.to_u8() || np == PayloadType::Skf.to_u8() {
            np = PayloadType::None.to_u8();
        } else {
            np = header.next_payload;
        }
        offset = end;
    }

    summary
}

/// Expected payloads of one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedPayloads {
    /// Payloads that must be present
    pub required: PayloadTypeSet,

    /// Payloads that may be present
    pub optional: PayloadTypeSet,

    /// A Notify of this type must be present
    pub notification: Option<NotifyType>,
}

impl ExpectedPayloads {
    /// Expect nothing
    pub const EMPTY: ExpectedPayloads = ExpectedPayloads {
        required: PayloadTypeSet::EMPTY,
        optional: PayloadTypeSet::EMPTY,
        notification: None,
    };
}

/// Mismatches between a decoded message and an expected signature
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadErrors {
    /// Required payloads that were absent
    pub missing: PayloadTypeSet,

    /// Present payloads that were neither required, optional nor
    /// allowed everywhere
    pub unexpected: PayloadTypeSet,

    /// Repeated payloads outside the repeatable set
    pub excessive: PayloadTypeSet,

    /// Required notification that was absent
    pub missing_notification: Option<NotifyType>,
}

impl PayloadErrors {
    /// True when any check failed
    pub fn bad(&self) -> bool {
        !self.missing.is_empty()
            || !self.unexpected.is_empty()
            || !self.excessive.is_empty()
            || self.missing_notification.is_some()
    }
}

/// Match a decoded payload set against an expected signature
pub fn verify_payloads(
    digests: &[PayloadDigest],
    summary: &PayloadSummary,
    expected: &ExpectedPayloads,
) -> PayloadErrors {
    // SKF stands in for SK when it arrives alone.
    let mut seen = summary.seen;
    if seen.contains(PayloadType::Skf) && !seen.contains(PayloadType::Sk) {
        seen = seen
            .difference(PayloadTypeSet::of(PayloadType::Skf))
            .union(PayloadTypeSet::of(PayloadType::Sk));
    }

    let mut errors = PayloadErrors {
        missing: expected.required.difference(seen),
        unexpected: seen
            .difference(expected.required)
            .difference(expected.optional)
            .difference(EVERYWHERE_PAYLOADS),
        excessive: summary.repeated.difference(REPEATABLE_PAYLOADS),
        missing_notification: None,
    };

    if let Some(wanted) = expected.notification {
        let found = digests
            .iter()
            .filter(|d| d.payload_type == PayloadType::Notify.to_u8())
            .filter_map(|d| NotifyPayload::from_payload_data(&d.body).ok())
            .any(|n| n.notify_type == wanted);
        if !found {
            errors.missing_notification = Some(wanted);
        }
    }

    errors
}

/// Everything known about one incoming message
///
/// Fills in incrementally as the dispatcher advances: header and raw
/// packet at ingest, clear payloads on demand during transition
/// selection, encrypted payloads after decryption, and finally the
/// selected transition and the owning SA.
#[derive(Debug, Clone)]
pub struct MessageDigest {
    /// The raw datagram, truncated to the header's length field
    pub packet: Vec<u8>,

    /// Parsed IKE header
    pub header: IkeHeader,

    /// Sender endpoint
    pub sender: SocketAddr,

    /// Decoded payloads, message order; encrypted payloads are appended
    /// after the clear ones once decryption happens
    pub digests: Vec<PayloadDigest>,

    /// Clear payload summary
    pub message_payloads: PayloadSummary,

    /// Encrypted payload summary
    pub encrypted_payloads: PayloadSummary,

    /// Index of the selected transition in the static table
    pub transition: Option<usize>,

    /// Serial of the SA this message resolved to
    pub sa_serial: Option<super::sa::SaSerial>,
}

impl MessageDigest {
    /// Ingest a raw datagram
    ///
    /// # Errors
    ///
    /// Returns an error when the header is malformed or the datagram is
    /// shorter than the header's length field. Trailing bytes beyond the
    /// length field are trimmed.
    pub fn parse(datagram: &[u8], sender: SocketAddr) -> Result<Self> {
        let header = IkeHeader::from_bytes(datagram)?;
        let len = header.length as usize;
        if datagram.len() < len {
            return Err(Error::BufferTooShort {
                required: len,
                available: datagram.len(),
            });
        }

        Ok(MessageDigest {
            packet: datagram[..len].to_vec(),
            header,
            sender,
            digests: Vec::new(),
            message_payloads: PayloadSummary::default(),
            encrypted_payloads: PayloadSummary::default(),
            transition: None,
            sa_serial: None,
        })
    }

    /// True when the response flag is clear
    pub fn is_request(&self) -> bool {
        self.header.flags.is_request()
    }

    /// True when the response flag is set
    pub fn is_response(&self) -> bool {
        self.header.flags.is_response()
    }

    /// Decode the clear payload chain, once
    pub fn decode_clear(&mut self) {
        if self.message_payloads.parsed {
            return;
        }
        let buf = self.packet[IKE_HEADER_SIZE..].to_vec();
        self.message_payloads =
            decode_payloads(&buf, self.header.next_payload, &mut self.digests);
    }

    /// Decode a decrypted payload chain, appending to the digest array
    pub fn decode_encrypted(&mut self, plaintext: &[u8], first_np: u8) {
        self.encrypted_payloads = decode_payloads(plaintext, first_np, &mut self.digests);
    }

    /// Iterate the digests of one payload type, in message order
    pub fn chain(&self, pt: PayloadType) -> impl Iterator<Item = &PayloadDigest> {
        let raw = pt.to_u8();
        self.digests.iter().filter(move |d| d.payload_type == raw)
    }

    /// First digest of a payload type
    pub fn first(&self, pt: PayloadType) -> Option<&PayloadDigest> {
        self.chain(pt).next()
    }

    /// First Notify payload carrying the given type
    pub fn first_notify(&self, nt: NotifyType) -> Option<NotifyPayload> {
        self.chain(PayloadType::Notify)
            .filter_map(|d| NotifyPayload::from_payload_data(&d.body).ok())
            .find(|n| n.notify_type == nt)
    }

    /// Parsed Encrypted Fragment sub-header, when the message carries SKF
    pub fn skf(&self) -> Option<(SkfHeader, &PayloadDigest)> {
        let digest = self.first(PayloadType::Skf)?;
        let header = SkfHeader::from_bytes(&digest.body).ok()?;
        Some((header, digest))
    }

    /// Count of received notifications, for statistics
    pub fn notify_count(&self) -> usize {
        self.chain(PayloadType::Notify).count()
    }
}

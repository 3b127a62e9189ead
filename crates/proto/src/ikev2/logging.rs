//! Structured logging for the demultiplexer
//!
//! Contextual log events built on the `tracing` framework, tagged with
//! SA serial, state and exchange so one SA's life can be followed
//! through an interleaved log.
//!
//! # Log Levels
//!
//! - **TRACE**: payload walks, per-message bookkeeping
//! - **DEBUG**: dropped duplicates, fragment collection, selector misses
//! - **INFO**: state transitions, establishment, emancipation
//! - **WARN**: payload errors, cookie challenges, retransmit exhaustion
//! - **ERROR**: fatal transition results, internal errors

use super::constants::ExchangeType;
use super::payload::PayloadErrors;
use super::sa::SaSerial;
use tracing::{debug, error, info, warn};

/// Log a completed state transition
pub fn log_state_transition(serial: SaSerial, from: &str, to: &str, story: &str) {
    info!(
        sa = %serial,
        state_from = from,
        state_to = to,
        story = story,
        "state transition"
    );
}

/// Log an inbound message once its SA is known
pub fn log_message_recv(
    serial: Option<SaSerial>,
    exchange: ExchangeType,
    msgid: u32,
    response: bool,
    size: usize,
) {
    debug!(
        sa = serial.map(|s| s.0),
        exchange = exchange.name(),
        msgid = msgid,
        role = if response { "response" } else { "request" },
        size_bytes = size,
        "received IKE message"
    );
}

/// Log an outbound datagram
pub fn log_message_send(serial: SaSerial, peer: &str, size: usize) {
    debug!(
        sa = %serial,
        peer = peer,
        size_bytes = size,
        "sending IKE message"
    );
}

/// Log a response retransmission
pub fn log_retransmit_answered(serial: SaSerial, msgid: u32) {
    debug!(
        sa = %serial,
        msgid = msgid,
        "retransmitting recorded response"
    );
}

/// Log a cookie challenge, which allocates no state
pub fn log_cookie_challenge(peer: &str, spi_i: u64) {
    warn!(
        peer = peer,
        spi_i = %hex::encode(spi_i.to_be_bytes()),
        "half-open threshold reached, demanding cookie"
    );
}

/// Log the payload errors that kept a message from matching any transition
pub fn log_payload_errors(
    serial: Option<SaSerial>,
    exchange: ExchangeType,
    errors: &PayloadErrors,
) {
    warn!(
        sa = serial.map(|s| s.0),
        exchange = exchange.name(),
        missing = %errors.missing.describe(),
        unexpected = %errors.unexpected.describe(),
        excessive = %errors.excessive.describe(),
        missing_notification = ?errors.missing_notification,
        "dropping unexpected message"
    );
}

/// Log an IKE SA rekey emancipation
pub fn log_emancipation(old: SaSerial, new: SaSerial, spi_i: u64, spi_r: u64) {
    info!(
        old_sa = %old,
        new_sa = %new,
        spi_i = %hex::encode(spi_i.to_be_bytes()),
        spi_r = %hex::encode(spi_r.to_be_bytes()),
        "rekeyed IKE SA emancipated, children migrated"
    );
}

/// Log SA deletion with its reason
pub fn log_sa_deleted(serial: SaSerial, state: &str, reason: &str) {
    info!(
        sa = %serial,
        state = state,
        reason = reason,
        "SA deleted"
    );
}

/// Log a handler suspension
pub fn log_suspension(serial: SaSerial, state: &str) {
    debug!(
        sa = %serial,
        state = state,
        "transition suspended awaiting asynchronous work"
    );
}

/// Log a fatal transition outcome
pub fn log_fatal(serial: SaSerial, state: &str) {
    error!(
        sa = %serial,
        state = state,
        "fatal error, deleting SA"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::constants::PayloadType;
    use crate::ikev2::constants::PayloadTypeSet;

    #[test]
    fn test_logging_functions() {
        // Exercises the formatting paths; output needs a subscriber.
        log_state_transition(SaSerial(1), "PARENT_I1", "PARENT_I2", "process reply");
        log_message_recv(Some(SaSerial(1)), ExchangeType::IkeAuth, 1, false, 200);
        log_message_recv(None, ExchangeType::IkeSaInit, 0, false, 300);
        log_message_send(SaSerial(1), "192.0.2.1:500", 96);
        log_retransmit_answered(SaSerial(1), 1);
        log_cookie_challenge("192.0.2.1:500", 0xdead);
        log_payload_errors(
            None,
            ExchangeType::IkeSaInit,
            &PayloadErrors {
                missing: PayloadTypeSet::of(PayloadType::Ke),
                ..Default::default()
            },
        );
        log_emancipation(SaSerial(1), SaSerial(2), 0xAA, 0xBB);
        log_sa_deleted(SaSerial(1), "PARENT_I1", "retransmission budget exhausted");
        log_suspension(SaSerial(1), "PARENT_R1");
        log_fatal(SaSerial(1), "PARENT_R1");
    }
}

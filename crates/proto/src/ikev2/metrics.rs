//! Statistics counters for the demultiplexer
//!
//! Atomic counters covering the dispatcher's decision points. Cloning
//! the struct shares the underlying counters, so the service task and
//! an exporter can hold the same instance.

use super::state::TransitionResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Demultiplexer metrics
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    /// Requests received
    pub requests_received: Arc<AtomicU64>,

    /// Responses received
    pub responses_received: Arc<AtomicU64>,

    /// Messages dropped before transition selection (bad header, role
    /// mismatch, busy SA, out-of-window)
    pub early_drops: Arc<AtomicU64>,

    /// Duplicate requests answered from the recorded response
    pub retransmits_answered: Arc<AtomicU64>,

    /// Cookie challenges sent
    pub cookies_sent: Arc<AtomicU64>,

    /// Requests accepted with a valid cookie
    pub cookies_accepted: Arc<AtomicU64>,

    /// Exchanges dropped by the half-open hard limit
    pub half_open_drops: Arc<AtomicU64>,

    /// Encrypted payloads failing their integrity check
    pub decrypt_failures: Arc<AtomicU64>,

    /// Fragment sets successfully reassembled
    pub fragment_sets_reassembled: Arc<AtomicU64>,

    /// Fragment sets discarded (superseded or corrupt)
    pub fragment_sets_discarded: Arc<AtomicU64>,

    /// Notify payloads received
    pub notifies_received: Arc<AtomicU64>,

    /// Handler invocations
    pub handler_invocations: Arc<AtomicU64>,

    /// Transitions completing Ok
    pub transitions_ok: Arc<AtomicU64>,

    /// Transitions suspending
    pub transitions_suspended: Arc<AtomicU64>,

    /// Transitions ignored
    pub transitions_ignored: Arc<AtomicU64>,

    /// Transitions failing with a notification
    pub transitions_failed: Arc<AtomicU64>,

    /// Transitions ending in Drop or Fatal
    pub transitions_fatal: Arc<AtomicU64>,

    /// SAs created
    pub sas_created: Arc<AtomicU64>,

    /// SAs deleted
    pub sas_deleted: Arc<AtomicU64>,

    /// IKE SAs replaced through rekey emancipation
    pub emancipations: Arc<AtomicU64>,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Requests received
    pub requests_received: u64,
    /// Responses received
    pub responses_received: u64,
    /// Early drops
    pub early_drops: u64,
    /// Retransmits answered
    pub retransmits_answered: u64,
    /// Cookie challenges sent
    pub cookies_sent: u64,
    /// Valid cookies accepted
    pub cookies_accepted: u64,
    /// Half-open hard-limit drops
    pub half_open_drops: u64,
    /// Integrity failures
    pub decrypt_failures: u64,
    /// Fragment sets reassembled
    pub fragment_sets_reassembled: u64,
    /// Fragment sets discarded
    pub fragment_sets_discarded: u64,
    /// Notifies received
    pub notifies_received: u64,
    /// Handler invocations
    pub handler_invocations: u64,
    /// Ok transitions
    pub transitions_ok: u64,
    /// Suspended transitions
    pub transitions_suspended: u64,
    /// Ignored transitions
    pub transitions_ignored: u64,
    /// Failed transitions
    pub transitions_failed: u64,
    /// Fatal transitions
    pub transitions_fatal: u64,
    /// SAs created
    pub sas_created: u64,
    /// SAs deleted
    pub sas_deleted: u64,
    /// Emancipations
    pub emancipations: u64,
}

impl EngineMetrics {
    /// Fresh zeroed counters
    pub fn new() -> Self {
        EngineMetrics::default()
    }

    /// Count a received message by role
    pub fn record_message(&self, response: bool) {
        if response {
            self.responses_received.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a pre-selection drop
    pub fn record_early_drop(&self) {
        self.early_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a retransmitted response
    pub fn record_retransmit_answered(&self) {
        self.retransmits_answered.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a cookie challenge
    pub fn record_cookie_sent(&self) {
        self.cookies_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a valid returned cookie
    pub fn record_cookie_accepted(&self) {
        self.cookies_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a hard-limit drop
    pub fn record_half_open_drop(&self) {
        self.half_open_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an integrity failure
    pub fn record_decrypt_failure(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a completed reassembly
    pub fn record_fragments_reassembled(&self) {
        self.fragment_sets_reassembled
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count a discarded fragment set
    pub fn record_fragments_discarded(&self) {
        self.fragment_sets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Count received notifications
    pub fn record_notifies(&self, count: usize) {
        self.notifies_received
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Count a handler invocation
    pub fn record_handler_invocation(&self) {
        self.handler_invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a transition outcome
    pub fn record_transition(&self, result: &TransitionResult) {
        let counter = match result {
            TransitionResult::Ok => &self.transitions_ok,
            TransitionResult::Suspend => &self.transitions_suspended,
            TransitionResult::Ignore => &self.transitions_ignored,
            TransitionResult::Fail(_) => &self.transitions_failed,
            TransitionResult::Drop | TransitionResult::Fatal => &self.transitions_fatal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an SA creation
    pub fn record_sa_created(&self) {
        self.sas_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an SA deletion
    pub fn record_sa_deleted(&self) {
        self.sas_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an emancipation
    pub fn record_emancipation(&self) {
        self.emancipations.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            early_drops: self.early_drops.load(Ordering::Relaxed),
            retransmits_answered: self.retransmits_answered.load(Ordering::Relaxed),
            cookies_sent: self.cookies_sent.load(Ordering::Relaxed),
            cookies_accepted: self.cookies_accepted.load(Ordering::Relaxed),
            half_open_drops: self.half_open_drops.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            fragment_sets_reassembled: self.fragment_sets_reassembled.load(Ordering::Relaxed),
            fragment_sets_discarded: self.fragment_sets_discarded.load(Ordering::Relaxed),
            notifies_received: self.notifies_received.load(Ordering::Relaxed),
            handler_invocations: self.handler_invocations.load(Ordering::Relaxed),
            transitions_ok: self.transitions_ok.load(Ordering::Relaxed),
            transitions_suspended: self.transitions_suspended.load(Ordering::Relaxed),
            transitions_ignored: self.transitions_ignored.load(Ordering::Relaxed),
            transitions_failed: self.transitions_failed.load(Ordering::Relaxed),
            transitions_fatal: self.transitions_fatal.load(Ordering::Relaxed),
            sas_created: self.sas_created.load(Ordering::Relaxed),
            sas_deleted: self.sas_deleted.load(Ordering::Relaxed),
            emancipations: self.emancipations.load(Ordering::Relaxed),
        }
    }
}

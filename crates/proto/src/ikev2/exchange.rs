//! The message demultiplexer and completion path
//!
//! [`Engine::process_packet`] takes a raw datagram through
//! classification, the DoS gate, duplicate suppression, transition
//! selection, fragment collection, decryption and payload verification,
//! then hands the message to the row's handler and applies the result:
//! advance, suspend, reply, or destroy.
//!
//! The engine is single-owner. One task feeds it datagrams and timer
//! ticks; handlers run inline and suspend instead of blocking.

use super::config::EngineConfig;
use super::constants::*;
use super::cookie::CookieJar;
use super::crypto::SaKeys;
use super::error::{Error, Result};
use super::fragment::{self, FragmentStatus};
use super::logging;
use super::message::{notify_response_for, peek_skf_number, MessageBuilder, NotifyPayload};
use super::metrics::EngineMetrics;
use super::msgid::{RequestDisposition, ResponseDisposition};
use super::payload::{verify_payloads, MessageDigest, PayloadErrors};
use super::sa::{RecordedMessage, Sa, SaRole, SaSerial, SaTable, TimerKind};
use super::state::{
    initiate_transition, ExchangeHandlers, SaState, TimeoutEvent, Transition, TransitionResult,
    TRANSITIONS,
};
use keryx_platform::{KernelIpsec, NullKernel, PlatformResult};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

/// A timer that fired during [`Engine::poll_timers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTimer {
    /// SA the timer belonged to
    pub serial: SaSerial,
    /// What fired
    pub kind: TimerKind,
}

/// Facilities a transition handler may use
///
/// Wraps the SA the transition runs on (taken out of the table for the
/// duration of the call) together with the table, so handlers can spawn
/// children and reach the parent record without aliasing.
pub struct SaActions<'a> {
    sa: &'a mut Sa,
    table: &'a mut SaTable,
    config: &'a EngineConfig,
    metrics: &'a EngineMetrics,
    kernel: &'a mut dyn KernelIpsec,
    switch_to: Option<SaSerial>,
    suppress_msgid_update: bool,
}

impl<'a> SaActions<'a> {
    /// The SA the transition runs on
    pub fn sa(&self) -> &Sa {
        self.sa
    }

    /// Mutable access to the SA
    pub fn sa_mut(&mut self) -> &mut Sa {
        self.sa
    }

    /// The parent IKE SA, for child transitions
    pub fn parent(&self) -> Option<&Sa> {
        self.sa.parent.and_then(|p| self.table.get(p))
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        self.config
    }

    /// Peer endpoint of the SA
    pub fn peer(&self) -> SocketAddr {
        self.sa.peer
    }

    /// Message ID the next outbound request will carry
    pub fn next_request_msgid(&self) -> u32 {
        match self.sa.parent.and_then(|p| self.table.get(p)) {
            Some(parent) => parent.msgid.next_outbound(),
            None => self.sa.msgid.next_outbound(),
        }
    }

    /// Record the reply packet; the completion path emits it
    ///
    /// Replies live on the IKE SA so duplicate requests can be answered
    /// even when a child computed them.
    pub fn record_reply(&mut self, message: RecordedMessage) {
        match self.sa.parent {
            Some(parent) => {
                if let Some(ike) = self.table.get_mut(parent) {
                    ike.recorded_response = Some(message);
                }
            }
            None => self.sa.recorded_response = Some(message),
        }
    }

    /// Record an outbound request for the retransmission timer
    pub fn record_request(&mut self, message: RecordedMessage) {
        self.sa.record_outbound(message);
    }

    /// Install the SA's AEAD keys and mark SKEYSEED derived
    pub fn set_keys(&mut self, keys: SaKeys) {
        self.sa.keys = Some(keys);
        self.sa.skeyseed_computed = true;
    }

    /// Note the new IKE SPI pair negotiated by an IKE rekey
    pub fn set_rekey_spis(&mut self, spi_i: u64, spi_r: u64) {
        self.sa.rekey_spis = Some((spi_i, spi_r));
    }

    /// Register a CHILD SA under the running (IKE) SA
    pub fn spawn_child(&mut self, role: SaRole, state: SaState, msgid: u32) -> SaSerial {
        let serial = self.table.allocate_serial();
        let child = Sa::new_child(serial, self.sa, role, state, msgid);
        self.metrics.record_sa_created();
        self.table.insert(child)
    }

    /// Retarget the completion path at a child
    ///
    /// The row's next state then applies to the child instead of the SA
    /// the handler ran on.
    pub fn switch_to_child(&mut self, serial: SaSerial) {
        self.switch_to = Some(serial);
    }

    /// Mutable access to a spawned child
    pub fn child_mut(&mut self, serial: SaSerial) -> Option<&mut Sa> {
        self.table.get_mut(serial)
    }

    /// Restart the Message-ID counters, as after a COOKIE challenge
    ///
    /// The completion path skips its usual counter update for this
    /// transition; the rebuilt request starts from Message ID zero.
    pub fn restart_message_ids(&mut self) {
        self.sa.msgid.restart();
        self.suppress_msgid_update = true;
    }

    /// The kernel data plane, for SA installation by AUTH/CREATE handlers
    pub fn kernel(&mut self) -> &mut dyn KernelIpsec {
        self.kernel
    }

    /// Allocate a local IPComp CPI and remember it on the SA
    ///
    /// # Errors
    ///
    /// Returns an error when the kernel cannot allocate one.
    pub fn allocate_cpi(&mut self) -> PlatformResult<u16> {
        let cpi = self.kernel.get_my_cpi()?;
        self.sa.ipcomp_cpi = Some(cpi);
        Ok(cpi)
    }
}

/// The IKEv2 demultiplexer
pub struct Engine<H: ExchangeHandlers> {
    config: EngineConfig,
    handlers: H,
    sas: SaTable,
    cookies: CookieJar,
    metrics: EngineMetrics,
    kernel: Box<dyn KernelIpsec>,
    outbox: Vec<(SocketAddr, Vec<u8>)>,
}

impl<H: ExchangeHandlers> Engine<H> {
    /// New engine with the given configuration and handlers
    ///
    /// Starts with a no-op kernel; production embedders install a real
    /// one with [`Engine::set_kernel`].
    pub fn new(config: EngineConfig, handlers: H) -> Self {
        Engine {
            config,
            handlers,
            sas: SaTable::new(),
            cookies: CookieJar::new(),
            metrics: EngineMetrics::new(),
            kernel: Box::new(NullKernel::default()),
            outbox: Vec::new(),
        }
    }

    /// Install the kernel data-plane implementation
    pub fn set_kernel(&mut self, kernel: Box<dyn KernelIpsec>) {
        self.kernel = kernel;
    }

    /// The SA table
    pub fn sas(&self) -> &SaTable {
        &self.sas
    }

    /// Mutable access to one SA
    pub fn sa_mut(&mut self, serial: SaSerial) -> Option<&mut Sa> {
        self.sas.get_mut(serial)
    }

    /// Shared metrics handle
    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.clone()
    }

    /// The installed handlers
    pub fn handlers(&self) -> &H {
        &self.handlers
    }

    /// Mutable access to the installed handlers
    pub fn handlers_mut(&mut self) -> &mut H {
        &mut self.handlers
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Pin the cookie secret, for tests
    pub fn set_cookie_secret(&mut self, secret: [u8; 32]) {
        self.cookies = CookieJar::with_secret(secret);
    }

    /// Datagrams queued for transmission, draining the queue
    pub fn take_outbox(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.outbox)
    }

    fn fresh_spi() -> u64 {
        loop {
            let spi: u64 = rand::thread_rng().gen();
            if spi != 0 {
                return spi;
            }
        }
    }

    fn parent_or_self(&self, serial: SaSerial) -> SaSerial {
        self.sas
            .get(serial)
            .and_then(|sa| sa.parent)
            .unwrap_or(serial)
    }

    /// Create an IKE SA we will initiate, in its start state
    pub fn create_ike_initiator(&mut self, peer: SocketAddr) -> SaSerial {
        let serial = self.sas.allocate_serial();
        let sa = Sa::new_initiator(serial, Self::fresh_spi(), peer);
        self.metrics.record_sa_created();
        self.sas.insert(sa)
    }

    /// Create a child record ready to initiate a CREATE_CHILD_SA exchange
    ///
    /// `state` selects the flavor: [`SaState::CreateChildI0`],
    /// [`SaState::RekeyChildI0`] or [`SaState::RekeyIkeI0`].
    ///
    /// # Errors
    ///
    /// Returns an error when the parent is unknown or `state` is not a
    /// child start state.
    pub fn create_child_initiator(
        &mut self,
        parent: SaSerial,
        state: SaState,
    ) -> Result<SaSerial> {
        if !matches!(
            state,
            SaState::CreateChildI0 | SaState::RekeyChildI0 | SaState::RekeyIkeI0
        ) {
            return Err(Error::InvalidState(format!(
                "{} is not a child start state",
                state.name()
            )));
        }
        let serial = self.sas.allocate_serial();
        let parent_sa = self
            .sas
            .get(parent)
            .ok_or_else(|| Error::SaNotFound(parent.to_string()))?;
        let child = Sa::new_child(serial, parent_sa, SaRole::Initiator, state, 0);
        self.metrics.record_sa_created();
        Ok(self.sas.insert(child))
    }

    /// Start the outbound exchange for an SA in a start state
    ///
    /// Queues the SA when the request window is closed; the completion
    /// path releases it once the outstanding response arrives.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown SA or one with no outbound row.
    pub fn initiate(&mut self, serial: SaSerial) -> Result<()> {
        let sa = self
            .sas
            .get(serial)
            .ok_or_else(|| Error::SaNotFound(serial.to_string()))?;
        let idx = initiate_transition(sa.state).ok_or_else(|| {
            Error::InvalidState(format!("no outbound transition from {}", sa.state.name()))
        })?;

        let ike = self.parent_or_self(serial);
        let window_open = self
            .sas
            .get(ike)
            .map(|sa| sa.msgid.window_open(self.config.window_size))
            .unwrap_or(false);
        if !window_open {
            debug!(sa = %serial, ike = %ike, "request window closed, queueing send");
            if let Some(ike_sa) = self.sas.get_mut(ike) {
                ike_sa.pending_sends.push_back(serial);
            }
            return Ok(());
        }

        self.run_handler(serial, None, idx);
        Ok(())
    }

    /// Re-enter the dispatcher after asynchronous work completed
    ///
    /// A no-op when the SA has been deleted in the meantime or nothing
    /// is suspended on it.
    pub fn resume(&mut self, serial: SaSerial) {
        let Some(sa) = self.sas.get_mut(serial) else {
            debug!(sa = %serial, "resume for deleted SA ignored");
            return;
        };
        if !sa.busy {
            return;
        }
        sa.busy = false;
        let Some(md) = sa.suspended_md.take() else {
            return;
        };
        self.process_state_packet(Some(serial), md);
    }

    /// Process one received datagram
    pub fn process_packet(&mut self, datagram: &[u8], sender: SocketAddr) {
        let mut md = match MessageDigest::parse(datagram, sender) {
            Ok(md) => md,
            Err(err) => {
                debug!(peer = %sender, error = %err, "dropping unparseable datagram");
                self.metrics.record_early_drop();
                return;
            }
        };

        self.metrics.record_message(md.is_response());
        let ix = md.header.exchange_type;
        let msgid = md.header.message_id;
        let sent_by_ike_initiator = md.header.flags.is_initiator();

        logging::log_message_recv(None, ix, msgid, md.is_response(), md.packet.len());

        // 1. Classification: find the SA the packet addresses. The only
        // time there is none is a responder's first sight of an
        // IKE_SA_INIT request.
        let serial: Option<SaSerial> = if ix == ExchangeType::IkeSaInit {
            // The message ID of the initial exchange is always zero.
            if msgid != 0 {
                warn!("dropping IKE_SA_INIT message containing non-zero message ID");
                self.metrics.record_early_drop();
                return;
            }
            if md.is_request() {
                if !sent_by_ike_initiator {
                    warn!("dropping IKE_SA_INIT request with conflicting IKE initiator flag");
                    self.metrics.record_early_drop();
                    return;
                }
                // 3.1: SPIr MUST be zero in the first message,
                // including cookie repeats.
                if md.header.responder_spi != 0 {
                    warn!("dropping IKE_SA_INIT request with non-zero responder SPI");
                    self.metrics.record_early_drop();
                    return;
                }
                match self.sas.find_by_initiator_spi(md.header.initiator_spi) {
                    Some(existing) => {
                        debug!(sa = %existing, "possible duplicate IKE_SA_INIT");
                        Some(existing)
                    }
                    None => {
                        // 2. DoS gating happens before any state exists.
                        if !self.dos_gate(&mut md) {
                            return;
                        }
                        None
                    }
                }
            } else {
                if sent_by_ike_initiator {
                    warn!("dropping IKE_SA_INIT response with conflicting IKE initiator flag");
                    self.metrics.record_early_drop();
                    return;
                }
                let Some(existing) = self.sas.find_by_initiator_spi(md.header.initiator_spi)
                else {
                    debug!("no matching state for IKE_SA_INIT response; discarding packet");
                    self.metrics.record_early_drop();
                    return;
                };
                // Only the first response is interesting.
                if self
                    .sas
                    .get(existing)
                    .map(|sa| sa.msgid.lastack.is_some())
                    .unwrap_or(true)
                {
                    debug!(sa = %existing, "already processed IKE_SA_INIT response; discarding");
                    self.metrics.record_early_drop();
                    return;
                }
                // Learn the responder's SPI.
                self.sas.rehash_spis(
                    existing,
                    md.header.initiator_spi,
                    md.header.responder_spi,
                );
                Some(existing)
            }
        } else if md.is_request() {
            match self
                .sas
                .find_by_spi_pair(md.header.initiator_spi, md.header.responder_spi)
            {
                Some(existing) => Some(existing),
                None => {
                    debug!(
                        exchange = ix.name(),
                        "message request has no corresponding IKE SA"
                    );
                    self.metrics.record_early_drop();
                    return;
                }
            }
        } else {
            // A response: the CHILD SA waiting on this message ID wins,
            // then the IKE SA with its window checks.
            let Some(ike) = self
                .sas
                .find_by_spi_pair(md.header.initiator_spi, md.header.responder_spi)
            else {
                debug!(
                    exchange = ix.name(),
                    "message response has no matching IKE SA"
                );
                self.metrics.record_early_drop();
                return;
            };
            match self
                .sas
                .find_child_by_msgid(ike, msgid, SaRole::Initiator)
            {
                Some(child) => Some(child),
                None => {
                    let msgids = &self.sas.get(ike).expect("indexed").msgid;
                    match msgids.response_disposition(msgid) {
                        ResponseDisposition::Fresh => Some(ike),
                        ResponseDisposition::OldResponse => {
                            debug!(sa = %ike, msgid, "dropping retransmitted response");
                            self.metrics.record_early_drop();
                            return;
                        }
                        ResponseDisposition::Unsolicited => {
                            debug!(sa = %ike, msgid, "dropping unasked response");
                            self.metrics.record_early_drop();
                            return;
                        }
                    }
                }
            }
        };

        // 3. The I(Initiator) bit must match the IKE SA's role.
        if let Some(s) = serial {
            let ike = self.parent_or_self(s);
            let role = self.sas.get(ike).expect("resolved").role;
            let mismatch = match role {
                SaRole::Initiator => sent_by_ike_initiator,
                SaRole::Responder => !sent_by_ike_initiator,
            };
            if mismatch {
                warn!(sa = %s, "message I(Initiator) flag conflicts with SA role; dropping");
                self.metrics.record_early_drop();
                return;
            }
        }

        // 4. A busy SA is mid-transition; new inbound work is dropped,
        // not queued.
        if let Some(s) = serial {
            if self.sas.get(s).map(|sa| sa.busy).unwrap_or(false) {
                debug!(sa = %s, "SA is busy processing; dropping message");
                self.metrics.record_early_drop();
                return;
            }
        }

        // 5. Duplicate requests answer from the recorded response and
        // never reach a handler.
        if let Some(s) = serial {
            if md.is_request() && self.handled_as_retransmit(s, &md) {
                return;
            }
        }

        md.sa_serial = serial;
        self.process_state_packet(serial, md);
    }

    /// The responder-side gate in front of state creation
    ///
    /// Returns false when the packet was fully handled (dropped or
    /// answered statelessly).
    fn dos_gate(&mut self, md: &mut MessageDigest) -> bool {
        let half_open = self.sas.half_open_count();

        if half_open >= self.config.half_open_hard_limit {
            debug!("overloaded with half-open IKE SAs; dropping new exchange");
            self.metrics.record_half_open_drop();
            return false;
        }

        // The cookie equation needs Ni, so the whole chain gets parsed
        // up front.
        md.decode_clear();
        if let Some(error) = md.message_payloads.error {
            if half_open >= self.config.half_open_soft_limit {
                debug!("under DoS pressure, not responding to invalid packet");
            } else {
                let data = md.message_payloads.error_data.clone();
                let reply = notify_response_for(&md.header, false, error, data);
                self.outbox.push((md.sender, reply));
            }
            return false;
        }

        if half_open >= self.config.half_open_soft_limit {
            let nonce = match md.first(PayloadType::Nonce) {
                Some(digest) => digest.body.clone(),
                None => {
                    debug!("IKE_SA_INIT request without nonce under DoS pressure; dropping");
                    return false;
                }
            };
            let peer_ip = md.sender.ip();
            let spi_i = md.header.initiator_spi;

            // Accept only when the first payload is the returned cookie.
            let presented = md
                .digests
                .first()
                .filter(|d| d.payload_type == PayloadType::Notify.to_u8())
                .and_then(|d| NotifyPayload::from_payload_data(&d.body).ok())
                .filter(|n| n.notify_type == NotifyType::Cookie);

            let valid = presented
                .map(|n| self.cookies.verify(peer_ip, spi_i, &nonce, &n.data))
                .unwrap_or(false);

            if !valid {
                let cookie = self.cookies.cookie_for(peer_ip, spi_i, &nonce);
                let reply =
                    notify_response_for(&md.header, false, NotifyType::Cookie, cookie);
                logging::log_cookie_challenge(&md.sender.to_string(), spi_i);
                self.metrics.record_cookie_sent();
                self.outbox.push((md.sender, reply));
                return false;
            }
            self.metrics.record_cookie_accepted();
        }

        true
    }

    /// Answer a duplicate request from the recorded response
    ///
    /// Returns true when the message was consumed.
    fn handled_as_retransmit(&mut self, serial: SaSerial, md: &MessageDigest) -> bool {
        let ike = self.parent_or_self(serial);
        let msgid = md.header.message_id;
        let disposition = self
            .sas
            .get(ike)
            .expect("resolved")
            .msgid
            .request_disposition(msgid);

        match disposition {
            RequestDisposition::Fresh => false,
            RequestDisposition::OldDuplicate => {
                debug!(sa = %ike, msgid, "received too old retransmit; dropping");
                self.metrics.record_early_drop();
                true
            }
            RequestDisposition::ReplyPending => {
                debug!(
                    sa = %ike,
                    msgid,
                    "cannot retransmit response, reply still being computed"
                );
                self.metrics.record_early_drop();
                true
            }
            RequestDisposition::Retransmit => {
                // For a fragmented duplicate only fragment 1 triggers
                // the resend, or every fragment would.
                let resend = peek_skf_number(&md.packet).map_or(true, |n| n == 1);
                if resend {
                    let ike_sa = self.sas.get(ike).expect("resolved");
                    let peer = ike_sa.peer;
                    match ike_sa.recorded_response.clone() {
                        Some(recorded) => {
                            logging::log_retransmit_answered(ike, msgid);
                            self.metrics.record_retransmit_answered();
                            for datagram in recorded.datagrams() {
                                self.outbox.push((peer, datagram.clone()));
                            }
                        }
                        None => {
                            warn!(
                                sa = %ike,
                                msgid,
                                "retransmission but no stored packet to retransmit"
                            );
                        }
                    }
                } else {
                    debug!(sa = %ike, msgid, "ignoring retransmit of non-first fragment");
                }
                true
            }
        }
    }

    /// Select a transition and drive it to completion
    fn process_state_packet(&mut self, serial: Option<SaSerial>, mut md: MessageDigest) {
        let from_state = serial
            .and_then(|s| self.sas.get(s))
            .map(|sa| sa.state)
            .unwrap_or(SaState::ParentR0);
        let ix = md.header.exchange_type;

        let mut message_errors: Option<PayloadErrors> = None;
        let mut encrypted_errors: Option<PayloadErrors> = None;
        let mut selected: Option<usize> = None;

        for (idx, t) in TRANSITIONS.iter().enumerate() {
            if t.recv_exchange != Some(ix) {
                continue;
            }
            // For CREATE_CHILD_SA the from-state check is skipped: the
            // encrypted payload signature decides between rekey-IKE,
            // rekey-child and new-child.
            if t.from != from_state && ix != ExchangeType::CreateChildSa {
                continue;
            }
            if !t.ike_i.matches(md.header.flags.is_initiator()) {
                continue;
            }
            if !t.msg_r.matches(md.header.flags.is_response()) {
                continue;
            }

            // A plausible row: parse the clear chain, once.
            if !md.message_payloads.parsed {
                md.decode_clear();
                if let Some(error) = md.message_payloads.error {
                    // Only an IKE_SA_INIT request earns a response;
                    // anything later must be authenticated first.
                    if ix == ExchangeType::IkeSaInit && md.is_request() {
                        let data = md.message_payloads.error_data.clone();
                        let reply = notify_response_for(&md.header, false, error, data);
                        self.outbox.push((md.sender, reply));
                    }
                    self.metrics.record_early_drop();
                    return;
                }
            }

            let errors = verify_payloads(&md.digests, &md.message_payloads, &t.message_payloads);
            if errors.bad() {
                message_errors = Some(errors);
                continue;
            }

            if !t.message_payloads.required.contains(PayloadType::Sk) {
                selected = Some(idx);
                break;
            }

            // SK rows require state.
            let Some(sa_serial) = serial else {
                debug!("encrypted exchange without an SA; dropping");
                self.metrics.record_early_drop();
                return;
            };

            if !md.encrypted_payloads.parsed {
                // Fragments first. Completion is only signalled on the
                // first arrival of the last fragment; a re-entry after
                // SKEYSEED computation skips collection.
                let have_all = self
                    .sas
                    .get(sa_serial)
                    .and_then(|sa| sa.fragments.as_ref())
                    .map(|f| f.is_complete())
                    .unwrap_or(false);

                if md.message_payloads.seen.contains(PayloadType::Skf) && !have_all {
                    if !self.collect_incoming_fragment(sa_serial, &md) {
                        return;
                    }
                }

                // Does this row only apply while SKEYSEED is missing?
                if t.no_skeyseed {
                    let computed = self
                        .sas
                        .get(sa_serial)
                        .map(|sa| sa.skeyseed_computed)
                        .unwrap_or(false);
                    if computed {
                        continue;
                    }
                    selected = Some(idx);
                    break;
                }

                // Decrypt; anything lacking integrity is dropped
                // without a response.
                let Some((plaintext, first_np)) = self.decrypt_sk(sa_serial, &md) else {
                    self.metrics.record_decrypt_failure();
                    debug!(sa = %sa_serial, "encrypted payload seems to be corrupt; dropping packet");
                    return;
                };
                md.decode_encrypted(&plaintext, first_np);

                if let Some(error) = md.encrypted_payloads.error {
                    // 2.21.2: an error inside the protected payload of a
                    // request gets a protected answer; a response is
                    // dropped. The SA is finished either way.
                    if md.is_request() {
                        let data = md.encrypted_payloads.error_data.clone();
                        self.send_notify_reply(Some(sa_serial), &md, error, data);
                    }
                    self.metrics
                        .record_transition(&TransitionResult::Fatal);
                    logging::log_fatal(
                        sa_serial,
                        self.sas
                            .get(sa_serial)
                            .map(|sa| sa.state.name())
                            .unwrap_or("?"),
                    );
                    self.delete_sa(sa_serial, "bad encrypted payload chain");
                    return;
                }
            }

            let errors =
                verify_payloads(&md.digests, &md.encrypted_payloads, &t.encrypted_payloads);
            if errors.bad() {
                encrypted_errors = Some(errors);
                continue;
            }

            selected = Some(idx);
            break;
        }

        let Some(idx) = selected else {
            // No transition matched: count the notifications, report the
            // nearest miss, and answer requests.
            self.metrics.record_notifies(md.notify_count());
            if let Some(errors) = message_errors.as_ref().or(encrypted_errors.as_ref()) {
                logging::log_payload_errors(serial, ix, errors);
                self.fail_with(serial, &md, NotifyType::InvalidSyntax);
            } else if md.is_request() {
                self.send_notify_reply(serial, &md, NotifyType::InvalidIkeSpi, Vec::new());
            }
            return;
        };

        md.transition = Some(idx);
        self.metrics.record_notifies(md.notify_count());

        // A new responder SA exists from the first valid SA_INIT request
        // that survived the gate.
        let mut target = match serial {
            Some(s) => s,
            None => {
                let serial = self.sas.allocate_serial();
                let sa = Sa::new_responder(
                    serial,
                    md.header.initiator_spi,
                    Self::fresh_spi(),
                    md.sender,
                );
                self.metrics.record_sa_created();
                self.sas.insert(sa)
            }
        };

        if ix == ExchangeType::IkeSaInit {
            let advertised = md.first_notify(NotifyType::FragmentationSupported).is_some();
            if let Some(sa) = self.sas.get_mut(target) {
                sa.peer_supports_fragmentation |= advertised;
            }
        }

        // CREATE_CHILD_SA morphs onto a child record before dispatch.
        if ix == ExchangeType::CreateChildSa {
            let row = &TRANSITIONS[idx];
            if md.is_request() {
                if self
                    .sas
                    .find_child_by_msgid(target, md.header.message_id, SaRole::Responder)
                    .is_some()
                {
                    debug!(
                        sa = %target,
                        msgid = md.header.message_id,
                        "CREATE_CHILD_SA request retransmission ignored"
                    );
                    return;
                }
                let child_serial = self.sas.allocate_serial();
                let parent = self.sas.get(target).expect("resolved");
                let child = Sa::new_child(
                    child_serial,
                    parent,
                    SaRole::Responder,
                    row.from,
                    md.header.message_id,
                );
                self.metrics.record_sa_created();
                self.sas.insert(child);
                target = child_serial;
            } else {
                let is_child = self.sas.get(target).map(|sa| sa.is_child()).unwrap_or(false);
                if !is_child {
                    debug!(
                        sa = %target,
                        msgid = md.header.message_id,
                        "rejecting CREATE_CHILD_SA response with no matching child state"
                    );
                    return;
                }
            }
        }

        md.sa_serial = Some(target);
        self.run_handler(target, Some(md), idx);
    }

    /// Validate and store one incoming fragment
    ///
    /// Returns true only when the set just became complete.
    fn collect_incoming_fragment(&mut self, serial: SaSerial, md: &MessageDigest) -> bool {
        let Some((skf, digest)) = md.skf() else {
            debug!("SKF payload too short; dropping");
            return false;
        };
        let aad = md.packet[..IKE_HEADER_SIZE].to_vec();
        let data = digest.body[super::message::SkfHeader::SIZE..].to_vec();
        let next_payload = digest.next_payload;
        let policy_allowed = self.config.fragmentation_allowed;

        // The advertisement arrived on the IKE SA during SA_INIT.
        let ike = self.parent_or_self(serial);
        let peer_advertised = self
            .sas
            .get(ike)
            .map(|sa| sa.peer_supports_fragmentation)
            .unwrap_or(false);

        let Some(sa) = self.sas.get_mut(serial) else {
            return false;
        };

        let had_buffer = sa.fragments.is_some();
        if !fragment::check_fragment(
            &skf,
            next_payload,
            policy_allowed,
            peer_advertised,
            &mut sa.fragments,
        ) {
            return false;
        }
        if had_buffer && sa.fragments.is_none() {
            // check_fragment dropped a superseded set
            self.metrics.record_fragments_discarded();
        }

        let sa = self.sas.get_mut(serial).expect("still present");
        // If the peer fragments, respond in kind without waiting for
        // retransmits.
        sa.seen_fragments = true;

        match fragment::collect_fragment(&skf, next_payload, aad, data, &mut sa.fragments) {
            FragmentStatus::Complete => true,
            FragmentStatus::MoreNeeded => false,
        }
    }

    /// Decrypt the SK payload or the completed fragment set
    ///
    /// The keys are the owning IKE SA's: a CHILD SA's exchange is
    /// protected by its parent. Returns the plaintext chain and its
    /// first payload type, or `None` on any integrity failure (the
    /// caller drops silently).
    fn decrypt_sk(&mut self, serial: SaSerial, md: &MessageDigest) -> Option<(Vec<u8>, u8)> {
        let ike = self.parent_or_self(serial);
        let keys: SaKeys = self.sas.get(ike)?.keys.clone()?;
        let sa = self.sas.get_mut(serial)?;

        if let Some(buffer) = sa.fragments.take() {
            let first_np = buffer.first_next_payload();
            match buffer.reassemble(keys.cipher, &keys.sk_e_recv) {
                Ok(plaintext) => {
                    self.metrics.record_fragments_reassembled();
                    Some((plaintext, first_np))
                }
                Err(err) => {
                    debug!(sa = %serial, error = %err, "fragment reassembly failed; discarding set");
                    self.metrics.record_fragments_discarded();
                    None
                }
            }
        } else {
            let digest = md.first(PayloadType::Sk)?;
            let iv_len = keys.cipher.iv_len();
            if digest.body.len() < iv_len {
                return None;
            }
            let (iv, ciphertext) = digest.body.split_at(iv_len);
            let aad = &md.packet[..IKE_HEADER_SIZE];
            match keys.cipher.decrypt(&keys.sk_e_recv, iv, ciphertext, aad) {
                Ok(plaintext) => Some((plaintext, digest.next_payload)),
                Err(_) => None,
            }
        }
    }

    /// Invoke the row's handler and complete the transition
    fn run_handler(&mut self, target: SaSerial, md: Option<MessageDigest>, idx: usize) {
        let row = &TRANSITIONS[idx];
        let Some(mut sa) = self.sas.take(target) else {
            return;
        };

        self.metrics.record_handler_invocation();
        let mut actions = SaActions {
            sa: &mut sa,
            table: &mut self.sas,
            config: &self.config,
            metrics: &self.metrics,
            kernel: self.kernel.as_mut(),
            switch_to: None,
            suppress_msgid_update: false,
        };
        let result = self.handlers.handle(row.handler, &mut actions, md.as_ref());
        let switch = actions.switch_to;
        let suppress = actions.suppress_msgid_update;
        self.sas.restore(sa);

        let final_target = switch.unwrap_or(target);
        self.metrics.record_transition(&result);
        self.complete(final_target, md, idx, result, suppress);
    }

    /// Apply a transition result (the completion path)
    fn complete(
        &mut self,
        target: SaSerial,
        md: Option<MessageDigest>,
        idx: usize,
        result: TransitionResult,
        suppress_msgid_update: bool,
    ) {
        match result {
            TransitionResult::Ok => {
                self.success_transition(target, md.as_ref(), idx, suppress_msgid_update);
            }
            TransitionResult::Suspend => {
                if let Some(sa) = self.sas.get_mut(target) {
                    sa.busy = true;
                    sa.suspended_md = md;
                    logging::log_suspension(target, sa.state.name());
                }
            }
            TransitionResult::Ignore => {}
            TransitionResult::Drop => {
                // be very very quiet
                self.delete_sa(target, "dropped by handler");
            }
            TransitionResult::Fatal => {
                let state = self
                    .sas
                    .get(target)
                    .map(|sa| sa.state.name())
                    .unwrap_or("?");
                logging::log_fatal(target, state);
                self.delete_sa(target, "fatal error");
            }
            TransitionResult::Fail(notification) => {
                if let Some(md) = md.as_ref() {
                    self.fail_with(Some(target), md, notification);
                } else {
                    debug!(sa = %target, notify = ?notification, "outbound transition failed");
                    self.delete_sa(target, "failed to initiate");
                }
            }
        }
    }

    /// The Fail(n) arm: notify the peer when we are the exchange
    /// responder, then delete or park the SA
    ///
    /// A failed response changes nothing: acting on it would let a
    /// spoofed reply tear down an SA.
    fn fail_with(
        &mut self,
        serial: Option<SaSerial>,
        md: &MessageDigest,
        notification: NotifyType,
    ) {
        if md.is_response() {
            return;
        }
        self.send_notify_reply(serial, md, notification, Vec::new());
        let Some(serial) = serial else {
            return;
        };
        if md.header.exchange_type == ExchangeType::IkeSaInit {
            self.delete_sa(serial, "failed initial exchange");
        } else if let Some(sa) = self.sas.get_mut(serial) {
            // Keep the carcass briefly so peer retransmits die quietly.
            debug!(sa = %serial, "forcing SA to a discard event");
            sa.arm_timer(TimerKind::Discard, Instant::now() + self.config.discard_wait);
        }
    }

    /// Emit a Notify answering `md`, protected when keys exist
    fn send_notify_reply(
        &mut self,
        serial: Option<SaSerial>,
        md: &MessageDigest,
        notification: NotifyType,
        data: Vec<u8>,
    ) {
        let ike = serial.map(|s| self.parent_or_self(s));
        let ike_sa = ike.and_then(|s| self.sas.get(s));

        let reply = match ike_sa {
            Some(sa) => {
                let local_is_initiator = sa.role == SaRole::Initiator;
                match &sa.keys {
                    Some(keys) => {
                        let notify = NotifyPayload::for_ike_sa(notification, data);
                        let built = MessageBuilder::new(
                            sa.spi_i,
                            sa.spi_r,
                            md.header.exchange_type,
                            IkeFlags::response(local_is_initiator),
                            md.header.message_id,
                        )
                        .notify(&notify)
                        .seal(keys.cipher, &keys.sk_e_send);
                        match built {
                            Ok(reply) => reply,
                            Err(err) => {
                                warn!(error = %err, "failed to seal notification response");
                                return;
                            }
                        }
                    }
                    None => notify_response_for(
                        &md.header,
                        local_is_initiator,
                        notification,
                        data,
                    ),
                }
            }
            None => notify_response_for(&md.header, false, notification, data),
        };

        self.outbox.push((md.sender, reply));
    }

    /// Advance the SA for a successful transition
    fn success_transition(
        &mut self,
        target: SaSerial,
        md: Option<&MessageDigest>,
        idx: usize,
        suppress_msgid_update: bool,
    ) {
        let row = &TRANSITIONS[idx];
        let Some(from_state) = self.sas.get(target).map(|sa| sa.state) else {
            debug!("transition completed but no state object remains");
            return;
        };
        // Resolved before a possible emancipation: the reply to the
        // rekey exchange was recorded on, and is retransmitted by, the
        // IKE SA that received it.
        let reply_owner = self.parent_or_self(target);

        // Leaving an IKE-rekey state means the child grows up: it takes
        // the new SPIs, inherits every sibling and retires its parent.
        if matches!(from_state, SaState::RekeyIkeR | SaState::RekeyIkeI) {
            if !suppress_msgid_update {
                self.update_msgid_counters(target, md);
            }
            self.emancipate(target, row);
        } else {
            if let Some(sa) = self.sas.get_mut(target) {
                sa.state = row.to;
            }
            if from_state != row.to {
                logging::log_state_transition(target, from_state.name(), row.to.name(), row.story);
            }
            if !suppress_msgid_update {
                self.update_msgid_counters(target, md);
            }
        }

        // A child reaching its established state establishes the parent
        // it was negotiated under.
        if row.to.is_established_child() {
            if let Some(parent) = self.sas.get(target).and_then(|sa| sa.parent) {
                if let Some(parent_sa) = self.sas.get_mut(parent) {
                    let promoted = match parent_sa.state {
                        SaState::ParentI2 => Some(SaState::ParentI3),
                        SaState::ParentR1 => Some(SaState::ParentR2),
                        _ => None,
                    };
                    if let Some(next) = promoted {
                        let old = parent_sa.state;
                        parent_sa.state = next;
                        logging::log_state_transition(
                            parent,
                            old.name(),
                            next.name(),
                            "IKE SA established",
                        );
                    }
                }
            }
        }

        if row.send_reply {
            self.emit_recorded(target, reply_owner, md);
        }

        self.schedule_timeout(target, row, from_state);
        self.release_next_send(target);
    }

    /// Send what the handler recorded: the reply to a request, or a new
    /// outbound request
    fn emit_recorded(&mut self, target: SaSerial, ike: SaSerial, md: Option<&MessageDigest>) {
        let answering_request = md.map(|m| m.is_request()).unwrap_or(false);

        if answering_request {
            let Some(ike_sa) = self.sas.get_mut(ike) else {
                return;
            };
            let peer = ike_sa.peer;
            match ike_sa.recorded_response.clone() {
                Some(recorded) => {
                    ike_sa.msgid.note_replied();
                    for datagram in recorded.datagrams() {
                        logging::log_message_send(ike, &peer.to_string(), datagram.len());
                        self.outbox.push((peer, datagram.clone()));
                    }
                }
                None => {
                    warn!(sa = %target, "transition wants a reply sent but none was recorded");
                }
            }
        } else {
            // A new request: bind the child to the message ID it used,
            // then mint the next one.
            let msgid_used = self
                .sas
                .get(ike)
                .map(|sa| sa.msgid.next_outbound())
                .unwrap_or(0);
            if target != ike {
                self.sas.set_child_msgid(target, msgid_used);
            }
            let Some(sa) = self.sas.get(target) else {
                return;
            };
            let peer = sa.peer;
            match sa.recorded.clone() {
                Some(recorded) => {
                    for datagram in recorded.datagrams() {
                        logging::log_message_send(target, &peer.to_string(), datagram.len());
                        self.outbox.push((peer, datagram.clone()));
                    }
                    if let Some(ike_sa) = self.sas.get_mut(ike) {
                        ike_sa.msgid.note_request_sent();
                    }
                }
                None => {
                    warn!(sa = %target, "transition wants a request sent but none was recorded");
                }
            }
        }
    }

    /// Update the IKE SA's Message-ID counters for a processed message
    fn update_msgid_counters(&mut self, target: SaSerial, md: Option<&MessageDigest>) {
        let Some(md) = md else {
            return;
        };
        let ike = self.parent_or_self(target);
        let Some(ike_sa) = self.sas.get_mut(ike) else {
            return;
        };
        if md.is_response() {
            ike_sa.msgid.note_response_accepted(md.header.message_id);
        } else {
            ike_sa.msgid.note_request_accepted(md.header.message_id);
        }
    }

    /// Promote the rekey child into the replacement IKE SA
    fn emancipate(&mut self, target: SaSerial, row: &Transition) {
        let Some(child) = self.sas.get(target) else {
            return;
        };
        let Some(old_parent) = child.parent else {
            debug!(sa = %target, "emancipation without a parent; advancing state only");
            if let Some(sa) = self.sas.get_mut(target) {
                sa.state = row.to;
            }
            return;
        };
        let (spi_i, spi_r) = match child.rekey_spis {
            Some(spis) => spis,
            None => {
                warn!(sa = %target, "emancipating without negotiated SPIs; keeping old pair");
                (child.spi_i, child.spi_r)
            }
        };

        self.sas.emancipate_child(target, spi_i, spi_r);
        self.sas.migrate_children(old_parent, target);
        if let Some(sa) = self.sas.get_mut(target) {
            sa.state = row.to;
        }

        // The replaced IKE SA lingers briefly, then goes away.
        if let Some(old) = self.sas.get_mut(old_parent) {
            old.arm_timer(TimerKind::Discard, Instant::now() + self.config.discard_wait);
        }

        self.metrics.record_emancipation();
        logging::log_emancipation(old_parent, target, spi_i, spi_r);
    }

    /// Arm the row's timeout and, for fresh CHILD SAs, liveness probes
    fn schedule_timeout(&mut self, target: SaSerial, row: &Transition, from_state: SaState) {
        let now = Instant::now();
        let Some(sa) = self.sas.get_mut(target) else {
            return;
        };

        match row.timeout {
            TimeoutEvent::Retransmit => {
                sa.retransmit_attempts = 0;
                sa.arm_timer(TimerKind::Retransmit, now + self.config.retransmit_interval);
            }
            TimeoutEvent::SaReplace => {
                sa.arm_timer(TimerKind::Replace, now + self.config.replace_after);
            }
            TimeoutEvent::Discard => {
                sa.arm_timer(TimerKind::Discard, now + self.config.discard_wait);
            }
            TimeoutEvent::Retain => {}
            TimeoutEvent::None => {
                debug!(story = row.story, "transition has unspecified timeout event");
            }
        }

        if row.to != from_state && row.to.is_established_child() {
            if let Some(dpd) = self.config.dpd.as_ref().filter(|d| d.enabled) {
                debug!(sa = %target, "liveness enabled, scheduling probes");
                sa.liveness_at = Some(now + dpd.interval);
            }
        }
    }

    /// Start the next queued exchange when the window opened
    fn release_next_send(&mut self, target: SaSerial) {
        let ike = self.parent_or_self(target);
        let next = {
            let Some(ike_sa) = self.sas.get_mut(ike) else {
                return;
            };
            if !ike_sa.msgid.window_open(self.config.window_size) {
                return;
            }
            ike_sa.pending_sends.pop_front()
        };
        if let Some(next) = next {
            debug!(sa = %next, ike = %ike, "window open, sending queued request");
            if let Err(err) = self.initiate(next) {
                debug!(sa = %next, error = %err, "queued send failed");
            }
        }
    }

    /// Delete an SA and every child it still owns
    pub fn delete_sa(&mut self, serial: SaSerial, reason: &str) {
        for child in self.sas.children_of(serial) {
            if let Some(sa) = self.sas.remove(child) {
                self.metrics.record_sa_deleted();
                logging::log_sa_deleted(child, sa.state.name(), "parent deleted");
            }
        }
        if let Some(sa) = self.sas.remove(serial) {
            self.metrics.record_sa_deleted();
            logging::log_sa_deleted(serial, sa.state.name(), reason);
        }
    }

    /// Fire expired timers
    ///
    /// Retransmission timers re-send the recorded request until the
    /// budget runs out; replacement and discard timers delete; liveness
    /// timers re-arm and are surfaced to the caller, which owns probe
    /// policy.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<FiredTimer> {
        let mut fired = Vec::new();

        for serial in self.sas.serials() {
            // Liveness runs on its own slot so it never displaces the
            // lifetime timer.
            let dpd_interval = self.config.dpd.as_ref().map(|d| d.interval);
            if let Some(sa) = self.sas.get_mut(serial) {
                if let Some(at) = sa.liveness_at {
                    if at <= now {
                        sa.liveness_at = Some(now + dpd_interval.unwrap_or_default());
                        fired.push(FiredTimer {
                            serial,
                            kind: TimerKind::Liveness,
                        });
                    }
                }
            }

            let kind = {
                let Some(sa) = self.sas.get_mut(serial) else {
                    continue;
                };
                let Some((kind, deadline)) = sa.timer else {
                    continue;
                };
                if deadline > now {
                    continue;
                }
                sa.timer = None;
                kind
            };

            match kind {
                TimerKind::Retransmit => {
                    let resend = {
                        let sa = self.sas.get_mut(serial).expect("present");
                        if sa.retransmit_attempts >= self.config.max_retransmits {
                            None
                        } else {
                            sa.retransmit_attempts += 1;
                            sa.arm_timer(
                                TimerKind::Retransmit,
                                now + self.config.retransmit_interval,
                            );
                            Some((sa.peer, sa.recorded.clone()))
                        }
                    };
                    match resend {
                        None => {
                            self.delete_sa(serial, "retransmission budget exhausted");
                        }
                        Some((peer, Some(recorded))) => {
                            for datagram in recorded.datagrams() {
                                self.outbox.push((peer, datagram.clone()));
                            }
                        }
                        Some((_, None)) => {}
                    }
                }
                TimerKind::Replace => {
                    self.delete_sa(serial, "lifetime expired");
                }
                TimerKind::Discard => {
                    self.delete_sa(serial, "discard timer");
                }
                TimerKind::Liveness => {
                    // liveness uses its own slot; nothing to do here
                }
            }
            fired.push(FiredTimer { serial, kind });
        }

        fired
    }
}

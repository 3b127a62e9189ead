//! Security Association records and the process-wide SA table
//!
//! One record type serves both IKE and CHILD SAs, the way the state
//! space is shared: a CHILD SA is a record with `parent` set, looked up
//! through the (parent serial, message ID) index. Children hold the
//! parent's serial rather than a reference, so the only way between
//! records is through the table.

use super::crypto::SaKeys;
use super::fragment::FragmentBuffer;
use super::msgid::MsgidState;
use super::payload::MessageDigest;
use super::state::{SaState, StateCategory};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::debug;

/// Monotonically assigned SA identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SaSerial(pub u64);

impl fmt::Display for SaSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role this end played when the SA was created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaRole {
    /// We initiated the exchange that created the SA
    Initiator,
    /// The peer initiated it
    Responder,
}

/// Last transmitted message, retained for retransmission
#[derive(Debug, Clone)]
pub enum RecordedMessage {
    /// A single datagram
    Whole(Vec<u8>),
    /// A fragmented message, one datagram per fragment
    Fragments(Vec<Vec<u8>>),
}

impl RecordedMessage {
    /// The datagrams to (re)send, in order
    pub fn datagrams(&self) -> impl Iterator<Item = &Vec<u8>> {
        match self {
            RecordedMessage::Whole(one) => std::slice::from_ref(one).iter(),
            RecordedMessage::Fragments(many) => many.iter(),
        }
    }
}

/// Kind of the single-shot timer armed on an SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Re-send the recorded request
    Retransmit,
    /// Replace (rekey) or expire the SA
    Replace,
    /// Discard a provisional SA that never completed
    Discard,
    /// Send a liveness probe
    Liveness,
}

/// One Security Association
#[derive(Debug)]
pub struct Sa {
    /// Table-assigned identifier
    pub serial: SaSerial,

    /// Initiator SPI of the owning IKE SA
    pub spi_i: u64,

    /// Responder SPI of the owning IKE SA (zero until learned)
    pub spi_r: u64,

    /// Role at creation
    pub role: SaRole,

    /// Current state
    pub state: SaState,

    /// Message-ID windows (meaningful on IKE SAs)
    pub msgid: MsgidState,

    /// Message ID of the exchange that created this record
    ///
    /// Children are found by (parent, this value) while their creating
    /// exchange is in flight.
    pub exchange_msgid: u32,

    /// Parent IKE SA, set on children
    pub parent: Option<SaSerial>,

    /// SKEYSEED has been derived; encrypted payloads can be processed
    pub skeyseed_computed: bool,

    /// Negotiated AEAD keys, absent during early states
    pub keys: Option<SaKeys>,

    /// Reassembly buffer for an in-progress fragmented message
    pub fragments: Option<FragmentBuffer>,

    /// Last request we sent, kept for the retransmission timer
    pub recorded: Option<RecordedMessage>,

    /// Last response we sent, replayed on duplicate requests
    ///
    /// Lives on the IKE SA even when a child computed the reply.
    pub recorded_response: Option<RecordedMessage>,

    /// Children queued for window space, oldest first
    pub pending_sends: VecDeque<SaSerial>,

    /// A transition is in progress; new inbound messages are dropped
    pub busy: bool,

    /// Message digest parked by a suspended handler
    pub suspended_md: Option<MessageDigest>,

    /// Peer endpoint
    pub peer: SocketAddr,

    /// New IKE SPI pair learned during an IKE rekey, consumed at
    /// emancipation
    pub rekey_spis: Option<(u64, u64)>,

    /// Peer advertised IKEV2_FRAGMENTATION_SUPPORTED
    pub peer_supports_fragmentation: bool,

    /// Peer actually sent us fragments; respond in kind
    pub seen_fragments: bool,

    /// Negotiated IPComp CPI
    pub ipcomp_cpi: Option<u16>,

    /// Initiator traffic selectors, wire form
    pub ts_i: Option<Vec<u8>>,

    /// Responder traffic selectors, wire form
    pub ts_r: Option<Vec<u8>>,

    /// Armed single-shot timer
    pub timer: Option<(TimerKind, Instant)>,

    /// Next liveness probe, kept apart from the lifetime timer
    pub liveness_at: Option<Instant>,

    /// Retransmissions sent for the current request
    pub retransmit_attempts: u32,
}

impl Sa {
    fn blank(serial: SaSerial, role: SaRole, state: SaState, peer: SocketAddr) -> Self {
        Sa {
            serial,
            spi_i: 0,
            spi_r: 0,
            role,
            state,
            msgid: MsgidState::new(),
            exchange_msgid: 0,
            parent: None,
            skeyseed_computed: false,
            keys: None,
            fragments: None,
            recorded: None,
            recorded_response: None,
            pending_sends: VecDeque::new(),
            busy: false,
            suspended_md: None,
            peer,
            rekey_spis: None,
            peer_supports_fragmentation: false,
            seen_fragments: false,
            ipcomp_cpi: None,
            ts_i: None,
            ts_r: None,
            timer: None,
            liveness_at: None,
            retransmit_attempts: 0,
        }
    }

    /// New IKE SA for an exchange we initiate
    pub fn new_initiator(serial: SaSerial, spi_i: u64, peer: SocketAddr) -> Self {
        let mut sa = Sa::blank(serial, SaRole::Initiator, SaState::ParentI0, peer);
        sa.spi_i = spi_i;
        sa
    }

    /// New IKE SA answering a peer's IKE_SA_INIT
    pub fn new_responder(serial: SaSerial, spi_i: u64, spi_r: u64, peer: SocketAddr) -> Self {
        let mut sa = Sa::blank(serial, SaRole::Responder, SaState::ParentR0, peer);
        sa.spi_i = spi_i;
        sa.spi_r = spi_r;
        sa
    }

    /// New CHILD SA under `parent`, created by the exchange `msgid`
    pub fn new_child(
        serial: SaSerial,
        parent: &Sa,
        role: SaRole,
        state: SaState,
        msgid: u32,
    ) -> Self {
        let mut sa = Sa::blank(serial, role, state, parent.peer);
        sa.spi_i = parent.spi_i;
        sa.spi_r = parent.spi_r;
        sa.parent = Some(parent.serial);
        sa.exchange_msgid = msgid;
        sa
    }

    /// True for CHILD SA records
    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    /// Record an outbound message for later retransmission
    pub fn record_outbound(&mut self, message: RecordedMessage) {
        self.retransmit_attempts = 0;
        self.recorded = Some(message);
    }

    /// Arm (or re-arm) the single-shot timer
    pub fn arm_timer(&mut self, kind: TimerKind, deadline: Instant) {
        self.timer = Some((kind, deadline));
    }

    /// Cancel any armed timer
    pub fn cancel_timer(&mut self) {
        self.timer = None;
    }
}

/// The process-wide SA table with its three lookup indices
///
/// Only the event-loop task mutates the table; the indices are derived
/// views maintained in lockstep with every mutation.
#[derive(Debug, Default)]
pub struct SaTable {
    next_serial: u64,
    by_serial: HashMap<SaSerial, Sa>,
    by_spi_pair: HashMap<(u64, u64), SaSerial>,
    by_initiator_spi: HashMap<u64, SaSerial>,
    by_parent_msgid: HashMap<(SaSerial, u32), SaSerial>,
}

impl SaTable {
    /// Empty table
    pub fn new() -> Self {
        SaTable::default()
    }

    /// Mint the next SA serial
    pub fn allocate_serial(&mut self) -> SaSerial {
        self.next_serial += 1;
        SaSerial(self.next_serial)
    }

    fn index(&mut self, sa: &Sa) {
        if sa.is_child() {
            self.by_parent_msgid
                .insert((sa.parent.expect("child"), sa.exchange_msgid), sa.serial);
        } else {
            self.by_spi_pair.insert((sa.spi_i, sa.spi_r), sa.serial);
            self.by_initiator_spi.insert(sa.spi_i, sa.serial);
        }
    }

    fn unindex(&mut self, sa: &Sa) {
        if sa.is_child() {
            let key = (sa.parent.expect("child"), sa.exchange_msgid);
            if self.by_parent_msgid.get(&key) == Some(&sa.serial) {
                self.by_parent_msgid.remove(&key);
            }
        } else {
            if self.by_spi_pair.get(&(sa.spi_i, sa.spi_r)) == Some(&sa.serial) {
                self.by_spi_pair.remove(&(sa.spi_i, sa.spi_r));
            }
            if self.by_initiator_spi.get(&sa.spi_i) == Some(&sa.serial) {
                self.by_initiator_spi.remove(&sa.spi_i);
            }
        }
    }

    /// Insert a new SA
    pub fn insert(&mut self, sa: Sa) -> SaSerial {
        let serial = sa.serial;
        self.index(&sa);
        self.by_serial.insert(serial, sa);
        serial
    }

    /// Remove an SA, cancelling its timer
    pub fn remove(&mut self, serial: SaSerial) -> Option<Sa> {
        let mut sa = self.by_serial.remove(&serial)?;
        sa.cancel_timer();
        self.unindex(&sa);
        debug!(sa = %serial, state = sa.state.name(), "SA removed from table");
        Some(sa)
    }

    /// Borrow an SA
    pub fn get(&self, serial: SaSerial) -> Option<&Sa> {
        self.by_serial.get(&serial)
    }

    /// Mutably borrow an SA
    pub fn get_mut(&mut self, serial: SaSerial) -> Option<&mut Sa> {
        self.by_serial.get_mut(&serial)
    }

    /// Take an SA out for a handler invocation
    ///
    /// The indices keep pointing at the serial; `restore` refreshes them
    /// once the handler returns.
    pub fn take(&mut self, serial: SaSerial) -> Option<Sa> {
        self.by_serial.remove(&serial)
    }

    /// Put a taken SA back, refreshing its index entries
    pub fn restore(&mut self, sa: Sa) {
        self.index(&sa);
        self.by_serial.insert(sa.serial, sa);
    }

    /// Lookup by the full SPI pair (all post-INIT exchanges)
    pub fn find_by_spi_pair(&self, spi_i: u64, spi_r: u64) -> Option<SaSerial> {
        self.by_spi_pair.get(&(spi_i, spi_r)).copied()
    }

    /// Lookup by initiator SPI alone (SA_INIT request and response)
    pub fn find_by_initiator_spi(&self, spi_i: u64) -> Option<SaSerial> {
        self.by_initiator_spi.get(&spi_i).copied()
    }

    /// Find the CHILD SA created by exchange `msgid` under `parent`
    pub fn find_child_by_msgid(
        &self,
        parent: SaSerial,
        msgid: u32,
        role: SaRole,
    ) -> Option<SaSerial> {
        let serial = self.by_parent_msgid.get(&(parent, msgid)).copied()?;
        let sa = self.get(serial)?;
        if sa.role == role {
            Some(serial)
        } else {
            debug!(
                sa = %serial,
                "child state has an unexpected SA role"
            );
            None
        }
    }

    /// Re-key an SA under new SPIs (SA_INIT response, emancipation)
    pub fn rehash_spis(&mut self, serial: SaSerial, spi_i: u64, spi_r: u64) {
        let Some(mut sa) = self.by_serial.remove(&serial) else {
            return;
        };
        self.unindex(&sa);
        sa.spi_i = spi_i;
        sa.spi_r = spi_r;
        self.index(&sa);
        self.by_serial.insert(serial, sa);
    }

    /// SAs in a half-open state, for the DoS gate
    pub fn half_open_count(&self) -> usize {
        self.by_serial
            .values()
            .filter(|sa| sa.state.category() == StateCategory::HalfOpenIke)
            .count()
    }

    /// Serials of all children of `parent`
    pub fn children_of(&self, parent: SaSerial) -> Vec<SaSerial> {
        let mut children: Vec<SaSerial> = self
            .by_serial
            .values()
            .filter(|sa| sa.parent == Some(parent))
            .map(|sa| sa.serial)
            .collect();
        children.sort();
        children
    }

    /// Re-key the index entry of a child whose creating exchange was
    /// assigned its Message ID at send time
    pub fn set_child_msgid(&mut self, serial: SaSerial, msgid: u32) {
        let Some(mut sa) = self.by_serial.remove(&serial) else {
            return;
        };
        self.unindex(&sa);
        sa.exchange_msgid = msgid;
        self.index(&sa);
        self.by_serial.insert(serial, sa);
    }

    /// Promote a rekey CHILD SA into a full IKE SA under new SPIs
    ///
    /// The record loses its parent, restarts its Message-ID counters and
    /// is re-indexed by SPI pair. The caller migrates siblings and
    /// retires the old IKE SA.
    pub fn emancipate_child(&mut self, serial: SaSerial, spi_i: u64, spi_r: u64) {
        let Some(mut sa) = self.by_serial.remove(&serial) else {
            return;
        };
        self.unindex(&sa);
        sa.parent = None;
        sa.spi_i = spi_i;
        sa.spi_r = spi_r;
        sa.msgid.restart();
        self.index(&sa);
        self.by_serial.insert(serial, sa);
    }

    /// Move every child of `from` under `to`
    ///
    /// Used at emancipation: the rekeyed IKE SA inherits all live
    /// children of the one it replaces.
    pub fn migrate_children(&mut self, from: SaSerial, to: SaSerial) {
        for serial in self.children_of(from) {
            if serial == to {
                continue;
            }
            let Some(mut child) = self.by_serial.remove(&serial) else {
                continue;
            };
            self.unindex(&child);
            child.parent = Some(to);
            self.index(&child);
            self.by_serial.insert(serial, child);
            debug!(child = %serial, from = %from, to = %to, "child migrated to rekeyed IKE SA");
        }
    }

    /// All serials, unordered
    pub fn serials(&self) -> Vec<SaSerial> {
        self.by_serial.keys().copied().collect()
    }

    /// Number of live SAs
    pub fn len(&self) -> usize {
        self.by_serial.len()
    }

    /// True when the table is empty
    pub fn is_empty(&self) -> bool {
        self.by_serial.is_empty()
    }
}

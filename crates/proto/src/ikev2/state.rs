//! Finite states and the state-transition table
//!
//! The table is the machine: each row names one admissible arc, giving
//! the state it leaves, the exchange and flag shape of the message that
//! drives it, the payload signature before and after decryption, the
//! handler that does the work and the timer armed on success. The
//! dispatcher scans rows in declaration order, so a row demanding a
//! specific notification wins over a generic one for the same state.
//!
//! ```text
//! Initiator                         Responder
//! -------------------------------------------------------------------
//! IKE_SA_INIT:
//! HDR, SAi1, KEi, Ni            -->
//!                                 <--  HDR, SAr1, KEr, Nr, [CERTREQ]
//! IKE_AUTH:
//! HDR, SK {IDi, [CERT,] [CERTREQ,]
//!        [IDr,] AUTH, SAi2,
//!        TSi, TSr}              -->
//!                                 <--  HDR, SK {IDr, [CERT,] AUTH,
//!                                           SAr2, TSi, TSr}
//! CREATE_CHILD_SA (new child / rekey child / rekey IKE):
//! HDR, SK {SA, Ni, [KEi], [N(REKEY_SA)], [TSi, TSr]} -->
//!                                 <--  HDR, SK {SA, Nr, [KEr], [TSi, TSr]}
//! ```

use super::constants::{ExchangeType, NotifyType, PayloadType, PayloadTypeSet};
use super::payload::{ExpectedPayloads, MessageDigest};

/// IKE and CHILD SA states
///
/// One contiguous space for both kinds of SA; the CHILD states
/// (`IpsecI`/`IpsecR` and the create/rekey intermediates) live on child
/// records, everything else on the IKE SA itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaState {
    /// Initiator, nothing sent yet
    ParentI0,
    /// Initiator, IKE_SA_INIT request sent
    ParentI1,
    /// Initiator, IKE_AUTH request sent
    ParentI2,
    /// Initiator, IKE SA established
    ParentI3,
    /// Responder, no valid IKE_SA_INIT processed yet
    ParentR0,
    /// Responder, IKE_SA_INIT reply sent
    ParentR1,
    /// Responder, IKE SA established
    ParentR2,
    /// Child initiator, CREATE_CHILD_SA not yet sent
    CreateChildI0,
    /// Child initiator, CREATE_CHILD_SA request sent
    CreateChildI,
    /// Child responder processing a CREATE_CHILD_SA request
    CreateChildR,
    /// Child-rekey initiator, request not yet sent
    RekeyChildI0,
    /// Child-rekey initiator, request sent
    RekeyChildI,
    /// IKE-rekey initiator, request not yet sent
    RekeyIkeI0,
    /// IKE-rekey initiator, request sent
    RekeyIkeI,
    /// IKE-rekey responder processing the request
    RekeyIkeR,
    /// CHILD SA established, we initiated
    IpsecI,
    /// CHILD SA established, peer initiated
    IpsecR,
    /// IKE SA delete exchange outstanding
    IkeSaDel,
    /// CHILD SA delete exchange outstanding
    ChildSaDel,
}

/// DoS-accounting category of a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCategory {
    /// Not counted
    Ignore,
    /// IKE SA before authentication completed
    HalfOpenIke,
    /// IKE SA past the initial exchange but not yet authenticated
    OpenIke,
    /// Authenticated IKE SA
    EstablishedIke,
    /// Established CHILD SA
    EstablishedChild,
    /// Informational-only state
    Informational,
}

impl SaState {
    /// Short name for log lines
    pub fn name(self) -> &'static str {
        match self {
            SaState::ParentI0 => "PARENT_I0",
            SaState::ParentI1 => "PARENT_I1",
            SaState::ParentI2 => "PARENT_I2",
            SaState::ParentI3 => "PARENT_I3",
            SaState::ParentR0 => "PARENT_R0",
            SaState::ParentR1 => "PARENT_R1",
            SaState::ParentR2 => "PARENT_R2",
            SaState::CreateChildI0 => "CREATE_CHILD_I0",
            SaState::CreateChildI => "CREATE_CHILD_I",
            SaState::CreateChildR => "CREATE_CHILD_R",
            SaState::RekeyChildI0 => "REKEY_CHILD_I0",
            SaState::RekeyChildI => "REKEY_CHILD_I",
            SaState::RekeyIkeI0 => "REKEY_IKE_I0",
            SaState::RekeyIkeI => "REKEY_IKE_I",
            SaState::RekeyIkeR => "REKEY_IKE_R",
            SaState::IpsecI => "IPSEC_I",
            SaState::IpsecR => "IPSEC_R",
            SaState::IkeSaDel => "IKESA_DEL",
            SaState::ChildSaDel => "CHILDSA_DEL",
        }
    }

    /// Category used by half-open accounting and liveness decisions
    pub fn category(self) -> StateCategory {
        match self {
            // Only counted once the SA_INIT packet left the host
            SaState::ParentI0 => StateCategory::Ignore,

            // I1 counts as half-open too: a spoofed plaintext packet can
            // trigger an outgoing IKE SA under on-demand policies.
            SaState::ParentI1 | SaState::ParentR0 | SaState::ParentR1 => {
                StateCategory::HalfOpenIke
            }

            SaState::ParentI2 => StateCategory::OpenIke,

            SaState::CreateChildI0
            | SaState::CreateChildI
            | SaState::CreateChildR
            | SaState::RekeyChildI0
            | SaState::RekeyChildI
            | SaState::RekeyIkeI0
            | SaState::RekeyIkeI
            | SaState::RekeyIkeR
            | SaState::ParentI3
            | SaState::ParentR2
            | SaState::IkeSaDel => StateCategory::EstablishedIke,

            SaState::IpsecI | SaState::IpsecR => StateCategory::EstablishedChild,

            SaState::ChildSaDel => StateCategory::Informational,
        }
    }

    /// True for the two established CHILD SA states
    pub fn is_established_child(self) -> bool {
        self.category() == StateCategory::EstablishedChild
    }
}

/// Constraint on a header flag bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagExpect {
    /// Bit must be set
    Set,
    /// Bit must be clear
    Clear,
    /// Don't care
    Either,
}

impl FlagExpect {
    /// Does an observed bit satisfy the constraint?
    pub fn matches(self, bit: bool) -> bool {
        match self {
            FlagExpect::Set => bit,
            FlagExpect::Clear => !bit,
            FlagExpect::Either => true,
        }
    }
}

/// Timer armed when a transition completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// Arm the request retransmission timer
    Retransmit,
    /// Arm the SA replacement (rekey) timer
    SaReplace,
    /// Arm a short discard timer for a provisional SA
    Discard,
    /// Keep whatever timer is already armed
    Retain,
    /// No timer specified
    None,
}

/// Outcome of a transition handler
///
/// One sum type instead of sentinel codes threaded through the layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// Advance the state, send the reply if the row asks for one
    Ok,
    /// Asynchronous work outstanding; park the message on the SA
    Suspend,
    /// No state change; the message is released
    Ignore,
    /// Destroy the SA silently
    Drop,
    /// Destroy the SA and notify the admin channel
    Fatal,
    /// Reject with a notification; the responder answers with it
    Fail(NotifyType),
}

/// Names the external processor a row dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerId {
    /// Outbound rows: build and record the initial request
    Initiate,
    /// SA_INIT reply carrying only a notification (COOKIE, INVALID_KE)
    SaInitResponseNotification,
    /// SA_INIT reply; derive keys and initiate IKE_AUTH
    SaInitResponse,
    /// AUTH reply carrying a known failure notification
    AuthFailureNotification,
    /// AUTH reply establishing the SA and first child
    AuthResponse,
    /// AUTH reply carrying an unknown notification
    AuthUnknownNotification,
    /// SA_INIT request; build the SA_INIT reply
    SaInitRequest,
    /// AUTH request arriving before SKEYSEED exists; start the DH work
    AuthRequestNoSkeyseed,
    /// AUTH request; authenticate and build the reply
    AuthRequest,
    /// CREATE_CHILD_SA request rekeying the IKE SA
    RekeyIkeRequest,
    /// CREATE_CHILD_SA reply finishing our IKE rekey
    RekeyIkeResponse,
    /// CREATE_CHILD_SA reply finishing our child create/rekey
    CreateChildResponse,
    /// CREATE_CHILD_SA request creating or rekeying a child
    CreateChildRequest,
    /// INFORMATIONAL processing (notifies, deletes, liveness)
    Informational,
}

/// One admissible arc of the state machine
#[derive(Debug, Clone)]
pub struct Transition {
    /// Human-readable description for logs
    pub story: &'static str,

    /// State the arc leaves
    pub from: SaState,

    /// State the arc enters on success
    pub to: SaState,

    /// Constraint on the I(Initiator) header bit
    pub ike_i: FlagExpect,

    /// Constraint on the R(Response) header bit
    pub msg_r: FlagExpect,

    /// Emit the recorded reply packet on success
    pub send_reply: bool,

    /// Row only applies while SKEYSEED has not been derived
    pub no_skeyseed: bool,

    /// Exchange type the row consumes; `None` for outbound-only rows
    pub recv_exchange: Option<ExchangeType>,

    /// Expected clear payloads
    pub message_payloads: ExpectedPayloads,

    /// Expected payloads after decryption
    pub encrypted_payloads: ExpectedPayloads,

    /// Processor driving the SA forward
    pub handler: HandlerId,

    /// Timer armed on success
    pub timeout: TimeoutEvent,
}

const fn expect(required: PayloadTypeSet, optional: PayloadTypeSet) -> ExpectedPayloads {
    ExpectedPayloads {
        required,
        optional,
        notification: None,
    }
}

const fn expect_notify(required: PayloadTypeSet, notification: NotifyType) -> ExpectedPayloads {
    ExpectedPayloads {
        required,
        optional: PayloadTypeSet::EMPTY,
        notification: Some(notification),
    }
}

const SK: PayloadTypeSet = PayloadTypeSet::of(PayloadType::Sk);
const EMPTY: PayloadTypeSet = PayloadTypeSet::EMPTY;

/// The transition table
///
/// Rows for the same `from` state are contiguous and tried in order.
pub static TRANSITIONS: &[Transition] = &[
    // no state:   --> CREATE_CHILD IKE Rekey Request
    // HDR, SAi, KEi, Ni -->
    Transition {
        story: "initiate CREATE_CHILD_SA IKE rekey",
        from: SaState::RekeyIkeI0,
        to: SaState::RekeyIkeI,
        ike_i: FlagExpect::Clear,
        msg_r: FlagExpect::Set,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: None,
        message_payloads: ExpectedPayloads::EMPTY,
        encrypted_payloads: ExpectedPayloads::EMPTY,
        handler: HandlerId::Initiate,
        timeout: TimeoutEvent::Retransmit,
    },
    // no state:   --> CREATE IPsec Rekey Request
    // HDR, SAi1, N(REKEY_SA), {KEi,} Ni TSi TSr -->
    Transition {
        story: "initiate CREATE_CHILD_SA IPsec rekey",
        from: SaState::RekeyChildI0,
        to: SaState::RekeyChildI,
        ike_i: FlagExpect::Clear,
        msg_r: FlagExpect::Set,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: None,
        message_payloads: ExpectedPayloads::EMPTY,
        encrypted_payloads: ExpectedPayloads::EMPTY,
        handler: HandlerId::Initiate,
        timeout: TimeoutEvent::Retransmit,
    },
    // no state:   --> CREATE IPsec Child Request
    // HDR, SAi1, {KEi,} Ni TSi TSr -->
    Transition {
        story: "initiate CREATE_CHILD_SA IPsec SA",
        from: SaState::CreateChildI0,
        to: SaState::CreateChildI,
        ike_i: FlagExpect::Clear,
        msg_r: FlagExpect::Set,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: None,
        message_payloads: ExpectedPayloads::EMPTY,
        encrypted_payloads: ExpectedPayloads::EMPTY,
        handler: HandlerId::Initiate,
        timeout: TimeoutEvent::Retransmit,
    },
    // no state:   --> I1
    // HDR, SAi1, KEi, Ni -->
    Transition {
        story: "initiate IKE_SA_INIT",
        from: SaState::ParentI0,
        to: SaState::ParentI1,
        ike_i: FlagExpect::Clear,
        msg_r: FlagExpect::Set,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: None,
        message_payloads: ExpectedPayloads::EMPTY,
        encrypted_payloads: ExpectedPayloads::EMPTY,
        handler: HandlerId::Initiate,
        timeout: TimeoutEvent::Retransmit,
    },
    // I1: <-- HDR, N   (COOKIE, INVALID_KE_PAYLOAD, ...)
    Transition {
        story: "initiator: process SA_INIT reply notification",
        from: SaState::ParentI1,
        to: SaState::ParentI1,
        ike_i: FlagExpect::Clear,
        msg_r: FlagExpect::Set,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::IkeSaInit),
        message_payloads: expect(PayloadTypeSet::of(PayloadType::Notify), EMPTY),
        encrypted_payloads: ExpectedPayloads::EMPTY,
        handler: HandlerId::SaInitResponseNotification,
        timeout: TimeoutEvent::Retain,
    },
    // I1 --> I2: <-- HDR, SAr1, KEr, Nr, [CERTREQ]
    Transition {
        story: "initiator: process IKE_SA_INIT reply, initiate IKE_AUTH",
        from: SaState::ParentI1,
        to: SaState::ParentI2,
        ike_i: FlagExpect::Clear,
        msg_r: FlagExpect::Set,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::IkeSaInit),
        message_payloads: expect(
            PayloadTypeSet::of(PayloadType::Sa)
                .with(PayloadType::Ke)
                .with(PayloadType::Nonce),
            PayloadTypeSet::of(PayloadType::CertReq),
        ),
        encrypted_payloads: ExpectedPayloads::EMPTY,
        handler: HandlerId::SaInitResponse,
        timeout: TimeoutEvent::Retransmit,
    },
    // I2: AUTH failure notifications win over the generic AUTH reply row
    Transition {
        story: "initiator: process INVALID_SYNTAX AUTH notification",
        from: SaState::ParentI2,
        to: SaState::ParentI2,
        ike_i: FlagExpect::Clear,
        msg_r: FlagExpect::Set,
        send_reply: false,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::IkeAuth),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect_notify(
            PayloadTypeSet::of(PayloadType::Notify),
            NotifyType::InvalidSyntax,
        ),
        handler: HandlerId::AuthFailureNotification,
        timeout: TimeoutEvent::None,
    },
    Transition {
        story: "initiator: process AUTHENTICATION_FAILED AUTH notification",
        from: SaState::ParentI2,
        to: SaState::ParentI2,
        ike_i: FlagExpect::Clear,
        msg_r: FlagExpect::Set,
        send_reply: false,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::IkeAuth),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect_notify(
            PayloadTypeSet::of(PayloadType::Notify),
            NotifyType::AuthenticationFailed,
        ),
        handler: HandlerId::AuthFailureNotification,
        timeout: TimeoutEvent::None,
    },
    Transition {
        story: "initiator: process UNSUPPORTED_CRITICAL_PAYLOAD AUTH notification",
        from: SaState::ParentI2,
        to: SaState::ParentI2,
        ike_i: FlagExpect::Clear,
        msg_r: FlagExpect::Set,
        send_reply: false,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::IkeAuth),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect_notify(
            PayloadTypeSet::of(PayloadType::Notify),
            NotifyType::UnsupportedCriticalPayload,
        ),
        handler: HandlerId::AuthFailureNotification,
        timeout: TimeoutEvent::None,
    },
    // I2 --> established: <-- HDR, SK {IDr, [CERT,] AUTH, SAr2, TSi, TSr}
    Transition {
        story: "initiator: process IKE_AUTH response",
        from: SaState::ParentI2,
        to: SaState::IpsecI,
        ike_i: FlagExpect::Clear,
        msg_r: FlagExpect::Set,
        send_reply: false,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::IkeAuth),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(
            PayloadTypeSet::of(PayloadType::IdR)
                .with(PayloadType::Auth)
                .with(PayloadType::Sa)
                .with(PayloadType::TsI)
                .with(PayloadType::TsR),
            PayloadTypeSet::of(PayloadType::Cert).with(PayloadType::Cp),
        ),
        handler: HandlerId::AuthResponse,
        timeout: TimeoutEvent::SaReplace,
    },
    Transition {
        story: "initiator: process IKE_AUTH response containing unknown notification",
        from: SaState::ParentI2,
        to: SaState::ParentI2,
        ike_i: FlagExpect::Clear,
        msg_r: FlagExpect::Set,
        send_reply: false,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::IkeAuth),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(PayloadTypeSet::of(PayloadType::Notify), EMPTY),
        handler: HandlerId::AuthUnknownNotification,
        timeout: TimeoutEvent::None,
    },
    // R0 --> R1: <-- HDR, SAi1, KEi, Ni
    //            HDR, SAr1, KEr, Nr, [CERTREQ] -->
    Transition {
        story: "respond to IKE_SA_INIT",
        from: SaState::ParentR0,
        to: SaState::ParentR1,
        ike_i: FlagExpect::Set,
        msg_r: FlagExpect::Clear,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::IkeSaInit),
        message_payloads: expect(
            PayloadTypeSet::of(PayloadType::Sa)
                .with(PayloadType::Ke)
                .with(PayloadType::Nonce),
            EMPTY,
        ),
        encrypted_payloads: ExpectedPayloads::EMPTY,
        handler: HandlerId::SaInitRequest,
        timeout: TimeoutEvent::Discard,
    },
    // R1: the AUTH request is what triggers the DH computation; until
    // SKEYSEED exists the packet cannot be decrypted.
    Transition {
        story: "responder: process IKE_AUTH request (no SKEYSEED)",
        from: SaState::ParentR1,
        to: SaState::ParentR1,
        ike_i: FlagExpect::Set,
        msg_r: FlagExpect::Clear,
        send_reply: true,
        no_skeyseed: true,
        recv_exchange: Some(ExchangeType::IkeAuth),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: ExpectedPayloads::EMPTY,
        handler: HandlerId::AuthRequestNoSkeyseed,
        timeout: TimeoutEvent::SaReplace,
    },
    // R1 --> established: <-- HDR, SK {IDi, [CERT,] [CERTREQ,] [IDr,]
    //                                  AUTH, SAi2, TSi, TSr}
    Transition {
        story: "responder: process IKE_AUTH request",
        from: SaState::ParentR1,
        to: SaState::IpsecR,
        ike_i: FlagExpect::Set,
        msg_r: FlagExpect::Clear,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::IkeAuth),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(
            PayloadTypeSet::of(PayloadType::IdI)
                .with(PayloadType::Auth)
                .with(PayloadType::Sa)
                .with(PayloadType::TsI)
                .with(PayloadType::TsR),
            PayloadTypeSet::of(PayloadType::Cert)
                .with(PayloadType::CertReq)
                .with(PayloadType::IdR)
                .with(PayloadType::Cp),
        ),
        handler: HandlerId::AuthRequest,
        timeout: TimeoutEvent::SaReplace,
    },
    // Rekey IKE: HDR, SK {SA, Ni, KEi} --> <-- HDR, SK {SA, Nr, KEr}
    Transition {
        story: "respond to CREATE_CHILD_SA IKE rekey",
        from: SaState::RekeyIkeR,
        to: SaState::ParentR2,
        ike_i: FlagExpect::Either,
        msg_r: FlagExpect::Clear,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::CreateChildSa),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(
            PayloadTypeSet::of(PayloadType::Sa)
                .with(PayloadType::Nonce)
                .with(PayloadType::Ke),
            PayloadTypeSet::of(PayloadType::Notify),
        ),
        handler: HandlerId::RekeyIkeRequest,
        timeout: TimeoutEvent::SaReplace,
    },
    Transition {
        story: "process CREATE_CHILD_SA IKE rekey response",
        from: SaState::RekeyIkeI,
        to: SaState::ParentI3,
        ike_i: FlagExpect::Either,
        msg_r: FlagExpect::Set,
        send_reply: false,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::CreateChildSa),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(
            PayloadTypeSet::of(PayloadType::Sa)
                .with(PayloadType::Nonce)
                .with(PayloadType::Ke),
            PayloadTypeSet::of(PayloadType::Notify),
        ),
        handler: HandlerId::RekeyIkeResponse,
        timeout: TimeoutEvent::SaReplace,
    },
    // New child / rekey child: HDR, SK {SA, Ni, [KEi], TSi, TSr}
    Transition {
        story: "process CREATE_CHILD_SA IPsec SA response",
        from: SaState::CreateChildI,
        to: SaState::IpsecI,
        ike_i: FlagExpect::Either,
        msg_r: FlagExpect::Set,
        send_reply: false,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::CreateChildSa),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(
            PayloadTypeSet::of(PayloadType::Sa)
                .with(PayloadType::Nonce)
                .with(PayloadType::TsI)
                .with(PayloadType::TsR),
            PayloadTypeSet::of(PayloadType::Ke).with(PayloadType::Notify),
        ),
        handler: HandlerId::CreateChildResponse,
        timeout: TimeoutEvent::SaReplace,
    },
    Transition {
        story: "respond to CREATE_CHILD_SA IPsec SA request",
        from: SaState::CreateChildR,
        to: SaState::IpsecR,
        ike_i: FlagExpect::Either,
        msg_r: FlagExpect::Clear,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::CreateChildSa),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(
            PayloadTypeSet::of(PayloadType::Sa)
                .with(PayloadType::Nonce)
                .with(PayloadType::TsI)
                .with(PayloadType::TsR),
            PayloadTypeSet::of(PayloadType::Ke).with(PayloadType::Notify),
        ),
        handler: HandlerId::CreateChildRequest,
        timeout: TimeoutEvent::SaReplace,
    },
    // INFORMATIONAL: HDR, SK {[N,] [D,] [CP,] ...}
    Transition {
        story: "I3: INFORMATIONAL request",
        from: SaState::ParentI3,
        to: SaState::ParentI3,
        ike_i: FlagExpect::Either,
        msg_r: FlagExpect::Clear,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::Informational),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(
            EMPTY,
            PayloadTypeSet::of(PayloadType::Notify)
                .with(PayloadType::Delete)
                .with(PayloadType::Cp),
        ),
        handler: HandlerId::Informational,
        timeout: TimeoutEvent::Retain,
    },
    Transition {
        story: "I3: INFORMATIONAL response",
        from: SaState::ParentI3,
        to: SaState::ParentI3,
        ike_i: FlagExpect::Either,
        msg_r: FlagExpect::Set,
        send_reply: false,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::Informational),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(
            EMPTY,
            PayloadTypeSet::of(PayloadType::Notify)
                .with(PayloadType::Delete)
                .with(PayloadType::Cp),
        ),
        handler: HandlerId::Informational,
        timeout: TimeoutEvent::Retain,
    },
    Transition {
        story: "R2: process INFORMATIONAL request",
        from: SaState::ParentR2,
        to: SaState::ParentR2,
        ike_i: FlagExpect::Either,
        msg_r: FlagExpect::Clear,
        send_reply: true,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::Informational),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(
            EMPTY,
            PayloadTypeSet::of(PayloadType::Notify)
                .with(PayloadType::Delete)
                .with(PayloadType::Cp),
        ),
        handler: HandlerId::Informational,
        timeout: TimeoutEvent::Retain,
    },
    Transition {
        story: "R2: process INFORMATIONAL response",
        from: SaState::ParentR2,
        to: SaState::ParentR2,
        ike_i: FlagExpect::Either,
        msg_r: FlagExpect::Set,
        send_reply: false,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::Informational),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(
            EMPTY,
            PayloadTypeSet::of(PayloadType::Notify)
                .with(PayloadType::Delete)
                .with(PayloadType::Cp),
        ),
        handler: HandlerId::Informational,
        timeout: TimeoutEvent::Retain,
    },
    Transition {
        story: "IKE_SA_DEL: process INFORMATIONAL",
        from: SaState::IkeSaDel,
        to: SaState::IkeSaDel,
        ike_i: FlagExpect::Either,
        msg_r: FlagExpect::Either,
        send_reply: false,
        no_skeyseed: false,
        recv_exchange: Some(ExchangeType::Informational),
        message_payloads: expect(SK, EMPTY),
        encrypted_payloads: expect(
            EMPTY,
            PayloadTypeSet::of(PayloadType::Notify)
                .with(PayloadType::Delete)
                .with(PayloadType::Cp),
        ),
        handler: HandlerId::Informational,
        timeout: TimeoutEvent::Retain,
    },
];

/// Index of the outbound row leaving `from`, if one exists
pub fn initiate_transition(from: SaState) -> Option<usize> {
    TRANSITIONS
        .iter()
        .position(|t| t.from == from && t.recv_exchange.is_none())
}

/// Structural checks over the table, used by tests
///
/// Rows for the same state must be contiguous so declaration order is
/// meaningful, and an encrypted signature requires SK among the clear
/// payloads.
pub fn transition_table_is_coherent() -> bool {
    let mut seen: Vec<SaState> = Vec::new();
    let mut prev: Option<SaState> = None;
    for t in TRANSITIONS {
        if prev != Some(t.from) {
            if seen.contains(&t.from) {
                return false;
            }
            seen.push(t.from);
            prev = Some(t.from);
        }
        let wants_encrypted = t.encrypted_payloads != ExpectedPayloads::EMPTY;
        if wants_encrypted && !t.message_payloads.required.contains(PayloadType::Sk) {
            return false;
        }
        if t.no_skeyseed && !t.message_payloads.required.contains(PayloadType::Sk) {
            return false;
        }
    }
    true
}

/// The consumed handler interface
///
/// The engine drives classification, decryption and completion; the
/// handlers own the exchange semantics (proposal selection, key
/// derivation, authentication) and are supplied by the embedding
/// application.
pub trait ExchangeHandlers {
    /// Drive the SA forward for one selected transition
    ///
    /// The handler may mutate the SA through `actions`, record a reply
    /// packet, register a CHILD SA, or suspend for asynchronous work.
    /// `md` is `None` on outbound rows, which have no inbound message.
    fn handle(
        &mut self,
        id: HandlerId,
        actions: &mut super::exchange::SaActions<'_>,
        md: Option<&MessageDigest>,
    ) -> TransitionResult;
}

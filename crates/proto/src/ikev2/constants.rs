//! IKEv2 protocol constants from RFC 7296 and RFC 7383

/// IKE version 2 (major version = 2, minor version = 0)
pub const IKE_VERSION: u8 = 0x20;

/// Maximum IKE message size (64KB - 1)
pub const MAX_IKE_MESSAGE_SIZE: u32 = 65535;

/// IKE header size (28 bytes)
pub const IKE_HEADER_SIZE: usize = 28;

/// Generic payload header size (4 bytes)
pub const PAYLOAD_HEADER_SIZE: usize = 4;

/// Maximum number of payloads accepted in one message
pub const MAX_PAYLOADS_PER_MESSAGE: usize = 20;

/// Maximum number of encrypted fragments per message (RFC 7383)
pub const MAX_IKE_FRAGMENTS: u16 = 32;

/// Cap on the total reassembled plaintext of a fragmented message
pub const MAX_FRAGMENT_REASSEMBLY_SIZE: usize = 256 * 1024;

/// Size of the stateless DoS cookie (HMAC-SHA-256 output)
pub const COOKIE_SIZE: usize = 32;

/// Minimum nonce size (RFC 7296 Section 2.10)
pub const MIN_NONCE_SIZE: usize = 16;

/// Maximum nonce size (RFC 7296 Section 2.10)
pub const MAX_NONCE_SIZE: usize = 256;

/// Exchange Types (RFC 7296 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// IKE_SA_INIT exchange (34)
    IkeSaInit = 34,
    /// IKE_AUTH exchange (35)
    IkeAuth = 35,
    /// CREATE_CHILD_SA exchange (36)
    CreateChildSa = 36,
    /// INFORMATIONAL exchange (37)
    Informational = 37,
}

impl ExchangeType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            34 => Some(ExchangeType::IkeSaInit),
            35 => Some(ExchangeType::IkeAuth),
            36 => Some(ExchangeType::CreateChildSa),
            37 => Some(ExchangeType::Informational),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Short name for log lines
    pub fn name(self) -> &'static str {
        match self {
            ExchangeType::IkeSaInit => "IKE_SA_INIT",
            ExchangeType::IkeAuth => "IKE_AUTH",
            ExchangeType::CreateChildSa => "CREATE_CHILD_SA",
            ExchangeType::Informational => "INFORMATIONAL",
        }
    }
}

/// IKE message flags (RFC 7296 Section 3.1)
///
/// The R (response) bit identifies the message role within an exchange;
/// the I (initiator) bit identifies which peer initially created the SA
/// and therefore which SPI in the header is whose. The two are unrelated
/// outside the initial exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkeFlags(u8);

impl IkeFlags {
    /// Response flag (bit 5)
    pub const RESPONSE: u8 = 0x20;
    /// Version flag (bit 4)
    pub const VERSION: u8 = 0x10;
    /// Initiator flag (bit 3)
    pub const INITIATOR: u8 = 0x08;

    /// Create new flags, masking to the defined bits
    pub fn new(value: u8) -> Self {
        IkeFlags(value & 0x38)
    }

    /// Create flags for a request
    pub fn request(is_initiator: bool) -> Self {
        if is_initiator {
            IkeFlags(Self::INITIATOR)
        } else {
            IkeFlags(0)
        }
    }

    /// Create flags for a response
    pub fn response(is_initiator: bool) -> Self {
        let mut flags = Self::RESPONSE;
        if is_initiator {
            flags |= Self::INITIATOR;
        }
        IkeFlags(flags)
    }

    /// Check if this is a response
    pub fn is_response(self) -> bool {
        (self.0 & Self::RESPONSE) != 0
    }

    /// Check if this is a request
    pub fn is_request(self) -> bool {
        !self.is_response()
    }

    /// Check if the IKE SA initiator sent this message
    pub fn is_initiator(self) -> bool {
        (self.0 & Self::INITIATOR) != 0
    }

    /// Get raw value
    pub fn value(self) -> u8 {
        self.0
    }
}

/// Payload Types (RFC 7296 Section 3.2, RFC 7383 Section 2.5)
///
/// All assigned values fit below 64 so a payload set is one machine word;
/// the decoder rejects anything at 64 or above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// No next payload (0)
    None = 0,
    /// Security Association (33)
    Sa = 33,
    /// Key Exchange (34)
    Ke = 34,
    /// Identification - Initiator (35)
    IdI = 35,
    /// Identification - Responder (36)
    IdR = 36,
    /// Certificate (37)
    Cert = 37,
    /// Certificate Request (38)
    CertReq = 38,
    /// Authentication (39)
    Auth = 39,
    /// Nonce (40)
    Nonce = 40,
    /// Notify (41)
    Notify = 41,
    /// Delete (42)
    Delete = 42,
    /// Vendor ID (43)
    Vendor = 43,
    /// Traffic Selector - Initiator (44)
    TsI = 44,
    /// Traffic Selector - Responder (45)
    TsR = 45,
    /// Encrypted and Authenticated (46)
    Sk = 46,
    /// Configuration (47)
    Cp = 47,
    /// Extensible Authentication (48)
    Eap = 48,
    /// Encrypted and Authenticated Fragment (53, RFC 7383)
    Skf = 53,
}

impl PayloadType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadType::None),
            33 => Some(PayloadType::Sa),
            34 => Some(PayloadType::Ke),
            35 => Some(PayloadType::IdI),
            36 => Some(PayloadType::IdR),
            37 => Some(PayloadType::Cert),
            38 => Some(PayloadType::CertReq),
            39 => Some(PayloadType::Auth),
            40 => Some(PayloadType::Nonce),
            41 => Some(PayloadType::Notify),
            42 => Some(PayloadType::Delete),
            43 => Some(PayloadType::Vendor),
            44 => Some(PayloadType::TsI),
            45 => Some(PayloadType::TsR),
            46 => Some(PayloadType::Sk),
            47 => Some(PayloadType::Cp),
            48 => Some(PayloadType::Eap),
            53 => Some(PayloadType::Skf),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A set of payload types, one bit per type number
///
/// Payload numbers are below 64 by construction, so the whole set fits in
/// a `u64`. Used for seen/repeated tracking in the decoder and for the
/// expected-payload signatures in the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadTypeSet(u64);

impl PayloadTypeSet {
    /// The empty set
    pub const EMPTY: PayloadTypeSet = PayloadTypeSet(0);

    /// Highest representable payload type number, exclusive
    pub const BIT_LIMIT: u8 = 64;

    /// Set containing one payload type
    pub const fn of(pt: PayloadType) -> Self {
        PayloadTypeSet(1u64 << (pt as u8))
    }

    /// Return this set with `pt` added
    pub const fn with(self, pt: PayloadType) -> Self {
        PayloadTypeSet(self.0 | (1u64 << (pt as u8)))
    }

    /// Insert a raw payload type number; caller must have range-checked it
    pub fn insert_raw(&mut self, np: u8) {
        debug_assert!(np < Self::BIT_LIMIT);
        self.0 |= 1u64 << np;
    }

    /// Membership test on a typed payload
    pub fn contains(self, pt: PayloadType) -> bool {
        self.contains_raw(pt as u8)
    }

    /// Membership test on a raw payload number
    pub fn contains_raw(self, np: u8) -> bool {
        np < Self::BIT_LIMIT && (self.0 & (1u64 << np)) != 0
    }

    /// Set union
    pub const fn union(self, other: Self) -> Self {
        PayloadTypeSet(self.0 | other.0)
    }

    /// Set difference
    pub const fn difference(self, other: Self) -> Self {
        PayloadTypeSet(self.0 & !other.0)
    }

    /// Set intersection
    pub const fn intersection(self, other: Self) -> Self {
        PayloadTypeSet(self.0 & other.0)
    }

    /// True when no bit is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the raw payload numbers in the set, ascending
    pub fn iter_raw(self) -> impl Iterator<Item = u8> {
        (0..Self::BIT_LIMIT).filter(move |np| self.contains_raw(*np))
    }

    /// Comma-separated type numbers for log lines
    pub fn describe(self) -> String {
        let names: Vec<String> = self
            .iter_raw()
            .map(|np| match PayloadType::from_u8(np) {
                Some(pt) => format!("{:?}", pt),
                None => format!("{}", np),
            })
            .collect();
        names.join(",")
    }
}

/// Payloads that may appear in any message (RFC 7296 Sections 3.10, 3.12)
pub const EVERYWHERE_PAYLOADS: PayloadTypeSet =
    PayloadTypeSet::of(PayloadType::Notify).with(PayloadType::Vendor);

/// Payloads for which repetition is legitimate
pub const REPEATABLE_PAYLOADS: PayloadTypeSet = PayloadTypeSet::of(PayloadType::Notify)
    .with(PayloadType::Delete)
    .with(PayloadType::Cp)
    .with(PayloadType::Vendor)
    .with(PayloadType::Cert)
    .with(PayloadType::CertReq);

/// Notify message types (RFC 7296 Section 3.10.1)
///
/// Only the codes the engine itself generates or matches on get a
/// variant; everything else round-trips through `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyType {
    /// UNSUPPORTED_CRITICAL_PAYLOAD (1)
    UnsupportedCriticalPayload,
    /// INVALID_IKE_SPI (4)
    InvalidIkeSpi,
    /// INVALID_SYNTAX (7)
    InvalidSyntax,
    /// INVALID_MESSAGE_ID (9)
    InvalidMessageId,
    /// NO_PROPOSAL_CHOSEN (14)
    NoProposalChosen,
    /// INVALID_KE_PAYLOAD (17)
    InvalidKePayload,
    /// AUTHENTICATION_FAILED (24)
    AuthenticationFailed,
    /// TS_UNACCEPTABLE (38)
    TsUnacceptable,
    /// COOKIE (16390)
    Cookie,
    /// REKEY_SA (16393)
    RekeySa,
    /// IKEV2_FRAGMENTATION_SUPPORTED (16430)
    FragmentationSupported,
    /// Any other notify code
    Other(u16),
}

impl NotifyType {
    /// Convert from the wire value
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => NotifyType::UnsupportedCriticalPayload,
            4 => NotifyType::InvalidIkeSpi,
            7 => NotifyType::InvalidSyntax,
            9 => NotifyType::InvalidMessageId,
            14 => NotifyType::NoProposalChosen,
            17 => NotifyType::InvalidKePayload,
            24 => NotifyType::AuthenticationFailed,
            38 => NotifyType::TsUnacceptable,
            16390 => NotifyType::Cookie,
            16393 => NotifyType::RekeySa,
            16430 => NotifyType::FragmentationSupported,
            other => NotifyType::Other(other),
        }
    }

    /// Convert to the wire value
    pub fn to_u16(self) -> u16 {
        match self {
            NotifyType::UnsupportedCriticalPayload => 1,
            NotifyType::InvalidIkeSpi => 4,
            NotifyType::InvalidSyntax => 7,
            NotifyType::InvalidMessageId => 9,
            NotifyType::NoProposalChosen => 14,
            NotifyType::InvalidKePayload => 17,
            NotifyType::AuthenticationFailed => 24,
            NotifyType::TsUnacceptable => 38,
            NotifyType::Cookie => 16390,
            NotifyType::RekeySa => 16393,
            NotifyType::FragmentationSupported => 16430,
            NotifyType::Other(v) => v,
        }
    }

    /// True for error-class notifications (code below 16384)
    pub fn is_error(self) -> bool {
        self.to_u16() < 16384
    }
}

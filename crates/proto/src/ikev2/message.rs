//! IKEv2 message structures, parsing and construction
//!
//! Implements the IKE header and generic payload framing from RFC 7296
//! Section 3, the Encrypted Fragment framing from RFC 7383 Section 2.5,
//! and a builder that produces whole datagrams (plain, sealed, or sealed
//! and fragmented).

use super::constants::*;
use super::crypto::CipherAlgorithm;
use super::error::{Error, Result};
use rand::RngCore;

/// IKE message header (28 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Initiator's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Responder's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Message ID                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Length                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeHeader {
    /// Initiator's Security Parameter Index
    pub initiator_spi: u64,

    /// Responder's Security Parameter Index (zero in an IKE_SA_INIT request)
    pub responder_spi: u64,

    /// First payload type, kept raw so unknown types survive
    pub next_payload: u8,

    /// Protocol version (must be 0x20 for IKEv2)
    pub version: u8,

    /// Exchange type
    pub exchange_type: ExchangeType,

    /// Message flags
    pub flags: IkeFlags,

    /// Message ID (request/response matching and windowing)
    pub message_id: u32,

    /// Total message length in bytes (including header)
    pub length: u32,
}

impl IkeHeader {
    /// Create a new IKE header
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initiator_spi: u64,
        responder_spi: u64,
        next_payload: u8,
        exchange_type: ExchangeType,
        flags: IkeFlags,
        message_id: u32,
        length: u32,
    ) -> Self {
        IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload,
            version: IKE_VERSION,
            exchange_type,
            flags,
            message_id,
            length,
        }
    }

    /// Parse an IKE header from the start of a datagram
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is shorter than 28 bytes, the
    /// version is not 0x20, the exchange type is unknown, or the length
    /// field is out of range.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < IKE_HEADER_SIZE {
            return Err(Error::BufferTooShort {
                required: IKE_HEADER_SIZE,
                available: data.len(),
            });
        }

        let initiator_spi = u64::from_be_bytes(data[0..8].try_into().expect("8 bytes"));
        let responder_spi = u64::from_be_bytes(data[8..16].try_into().expect("8 bytes"));

        let next_payload = data[16];

        let version = data[17];
        if version != IKE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let exchange_type =
            ExchangeType::from_u8(data[18]).ok_or(Error::UnsupportedExchangeType(data[18]))?;

        let flags = IkeFlags::new(data[19]);

        let message_id = u32::from_be_bytes(data[20..24].try_into().expect("4 bytes"));
        let length = u32::from_be_bytes(data[24..28].try_into().expect("4 bytes"));

        if length > MAX_IKE_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(length));
        }
        if (length as usize) < IKE_HEADER_SIZE {
            return Err(Error::InvalidLength {
                expected: IKE_HEADER_SIZE,
                actual: length as usize,
            });
        }

        Ok(IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload,
            version,
            exchange_type,
            flags,
            message_id,
            length,
        })
    }

    /// Serialize to the 28-byte wire form
    pub fn to_bytes(&self) -> [u8; IKE_HEADER_SIZE] {
        let mut bytes = [0u8; IKE_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.initiator_spi.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.responder_spi.to_be_bytes());
        bytes[16] = self.next_payload;
        bytes[17] = self.version;
        bytes[18] = self.exchange_type.to_u8();
        bytes[19] = self.flags.value();
        bytes[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }
}

/// Generic IKE payload header (4 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |C|  RESERVED   |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Next payload type, raw
    pub next_payload: u8,

    /// Critical bit
    pub critical: bool,

    /// Total payload length including this header
    pub length: u16,
}

impl PayloadHeader {
    /// Payload header size
    pub const SIZE: usize = PAYLOAD_HEADER_SIZE;

    /// Create a new payload header
    pub fn new(next_payload: u8, critical: bool, length: u16) -> Self {
        PayloadHeader {
            next_payload,
            critical,
            length,
        }
    }

    /// Parse a payload header
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is too short or the length field is
    /// smaller than the header itself.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::BufferTooShort {
                required: Self::SIZE,
                available: data.len(),
            });
        }

        let next_payload = data[0];
        let critical = (data[1] & 0x80) != 0;
        let length = u16::from_be_bytes([data[2], data[3]]);

        if (length as usize) < Self::SIZE {
            return Err(Error::InvalidLength {
                expected: Self::SIZE,
                actual: length as usize,
            });
        }

        Ok(PayloadHeader {
            next_payload,
            critical,
            length,
        })
    }

    /// Serialize to wire form
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.next_payload;
        bytes[1] = if self.critical { 0x80 } else { 0x00 };
        bytes[2..4].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Payload body length, excluding the header
    pub fn data_length(&self) -> usize {
        self.length as usize - Self::SIZE
    }
}

/// Encrypted Fragment framing (RFC 7383 Section 2.5)
///
/// The SKF payload body starts with fragment number and total, followed
/// by the IV and the ciphertext of this fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkfHeader {
    /// Fragment number, 1-based
    pub number: u16,

    /// Total number of fragments in the message
    pub total: u16,
}

impl SkfHeader {
    /// SKF sub-header size
    pub const SIZE: usize = 4;

    /// Parse from the start of an SKF payload body
    ///
    /// # Errors
    ///
    /// Returns an error if the body is shorter than 4 bytes.
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        if body.len() < Self::SIZE {
            return Err(Error::BufferTooShort {
                required: Self::SIZE,
                available: body.len(),
            });
        }
        Ok(SkfHeader {
            number: u16::from_be_bytes([body[0], body[1]]),
            total: u16::from_be_bytes([body[2], body[3]]),
        })
    }

    /// Serialize to wire form
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.number.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.total.to_be_bytes());
        bytes
    }
}

/// Notify payload (RFC 7296 Section 3.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Protocol ID (0 for IKE SA notifications)
    pub protocol_id: u8,

    /// SPI the notification refers to, when present
    pub spi: Vec<u8>,

    /// Notify message type
    pub notify_type: NotifyType,

    /// Notification data
    pub data: Vec<u8>,
}

impl NotifyPayload {
    /// Status or error notification about the IKE SA itself
    pub fn for_ike_sa(notify_type: NotifyType, data: Vec<u8>) -> Self {
        NotifyPayload {
            protocol_id: 0,
            spi: Vec::new(),
            notify_type,
            data,
        }
    }

    /// Parse from a Notify payload body
    ///
    /// # Errors
    ///
    /// Returns an error on truncation or an SPI size pointing past the
    /// end of the body.
    pub fn from_payload_data(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: body.len(),
            });
        }
        let protocol_id = body[0];
        let spi_size = body[1] as usize;
        let notify_type = NotifyType::from_u16(u16::from_be_bytes([body[2], body[3]]));

        if body.len() < 4 + spi_size {
            return Err(Error::InvalidPayload(format!(
                "Notify SPI size {} exceeds payload",
                spi_size
            )));
        }
        let spi = body[4..4 + spi_size].to_vec();
        let data = body[4 + spi_size..].to_vec();

        Ok(NotifyPayload {
            protocol_id,
            spi,
            notify_type,
            data,
        })
    }

    /// Serialize to a Notify payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + self.spi.len() + self.data.len());
        body.push(self.protocol_id);
        body.push(self.spi.len() as u8);
        body.extend_from_slice(&self.notify_type.to_u16().to_be_bytes());
        body.extend_from_slice(&self.spi);
        body.extend_from_slice(&self.data);
        body
    }
}

/// Delete payload (RFC 7296 Section 3.11)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol ID (1 = IKE, 3 = ESP)
    pub protocol_id: u8,

    /// SPIs being deleted, each `spi_size` bytes
    pub spis: Vec<Vec<u8>>,
}

impl DeletePayload {
    /// Parse from a Delete payload body
    ///
    /// # Errors
    ///
    /// Returns an error when the declared SPI count does not fit the body.
    pub fn from_payload_data(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: body.len(),
            });
        }
        let protocol_id = body[0];
        let spi_size = body[1] as usize;
        let count = u16::from_be_bytes([body[2], body[3]]) as usize;

        if body.len() < 4 + spi_size * count {
            return Err(Error::InvalidPayload(format!(
                "Delete payload declares {} SPIs of {} bytes but carries {}",
                count,
                spi_size,
                body.len() - 4
            )));
        }

        let mut spis = Vec::with_capacity(count);
        for i in 0..count {
            let at = 4 + i * spi_size;
            spis.push(body[at..at + spi_size].to_vec());
        }

        Ok(DeletePayload { protocol_id, spis })
    }

    /// Serialize to a Delete payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        let spi_size = self.spis.first().map(|s| s.len()).unwrap_or(0);
        let mut body = Vec::with_capacity(4 + spi_size * self.spis.len());
        body.push(self.protocol_id);
        body.push(spi_size as u8);
        body.extend_from_slice(&(self.spis.len() as u16).to_be_bytes());
        for spi in &self.spis {
            body.extend_from_slice(spi);
        }
        body
    }
}

/// Builds whole IKE datagrams from an ordered payload list
///
/// The builder fixes up the next-payload chain and the length fields;
/// `seal` variants encrypt the payload chain into SK/SKF payloads with
/// the final IKE header as associated data.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    initiator_spi: u64,
    responder_spi: u64,
    exchange_type: ExchangeType,
    flags: IkeFlags,
    message_id: u32,
    payloads: Vec<(u8, bool, Vec<u8>)>,
}

impl MessageBuilder {
    /// Start a message with the given header fields
    pub fn new(
        initiator_spi: u64,
        responder_spi: u64,
        exchange_type: ExchangeType,
        flags: IkeFlags,
        message_id: u32,
    ) -> Self {
        MessageBuilder {
            initiator_spi,
            responder_spi,
            exchange_type,
            flags,
            message_id,
            payloads: Vec::new(),
        }
    }

    /// Append a payload
    pub fn payload(mut self, payload_type: PayloadType, body: Vec<u8>) -> Self {
        self.payloads.push((payload_type.to_u8(), false, body));
        self
    }

    /// Append a payload with a raw type number and explicit critical bit
    pub fn raw_payload(mut self, payload_type: u8, critical: bool, body: Vec<u8>) -> Self {
        self.payloads.push((payload_type, critical, body));
        self
    }

    /// Append a Notify payload
    pub fn notify(self, notify: &NotifyPayload) -> Self {
        self.payload(PayloadType::Notify, notify.to_payload_data())
    }

    /// Encode the payload chain without a header
    ///
    /// Returns the first payload type and the chained bytes.
    fn encode_chain(&self) -> (u8, Vec<u8>) {
        let first = self
            .payloads
            .first()
            .map(|(pt, _, _)| *pt)
            .unwrap_or(PayloadType::None.to_u8());

        let mut out = Vec::new();
        for (i, (_, critical, body)) in self.payloads.iter().enumerate() {
            let next = self
                .payloads
                .get(i + 1)
                .map(|(pt, _, _)| *pt)
                .unwrap_or(PayloadType::None.to_u8());
            let header = PayloadHeader::new(
                next,
                *critical,
                (PayloadHeader::SIZE + body.len()) as u16,
            );
            out.extend_from_slice(&header.to_bytes());
            out.extend_from_slice(body);
        }
        (first, out)
    }

    fn header(&self, next_payload: u8, length: u32) -> IkeHeader {
        IkeHeader::new(
            self.initiator_spi,
            self.responder_spi,
            next_payload,
            self.exchange_type,
            self.flags,
            self.message_id,
            length,
        )
    }

    /// Build an unencrypted datagram
    pub fn build(&self) -> Vec<u8> {
        let (first, chain) = self.encode_chain();
        let header = self.header(first, (IKE_HEADER_SIZE + chain.len()) as u32);

        let mut out = Vec::with_capacity(header.length as usize);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&chain);
        out
    }

    /// Build a datagram with the payload chain sealed into one SK payload
    ///
    /// # Errors
    ///
    /// Returns an error when the cipher rejects the key.
    pub fn seal(&self, cipher: CipherAlgorithm, key: &[u8]) -> Result<Vec<u8>> {
        let (first, chain) = self.encode_chain();

        let mut iv = vec![0u8; cipher.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);

        let sk_body_len = iv.len() + chain.len() + cipher.tag_len();
        let total_len = IKE_HEADER_SIZE + PayloadHeader::SIZE + sk_body_len;
        let header = self.header(PayloadType::Sk.to_u8(), total_len as u32);
        let header_bytes = header.to_bytes();

        let ciphertext = cipher.encrypt(key, &iv, &chain, &header_bytes)?;

        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&header_bytes);
        let ph = PayloadHeader::new(first, false, (PayloadHeader::SIZE + sk_body_len) as u16);
        out.extend_from_slice(&ph.to_bytes());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Build `total` datagrams with the payload chain split over SKF payloads
    ///
    /// Each fragment is sealed independently; its own final header is the
    /// associated data (RFC 7383 Section 2.5).
    ///
    /// # Errors
    ///
    /// Returns an error for a zero or oversized fragment count, or when
    /// the cipher rejects the key.
    pub fn seal_fragmented(
        &self,
        cipher: CipherAlgorithm,
        key: &[u8],
        total: u16,
    ) -> Result<Vec<Vec<u8>>> {
        if total == 0 || total > MAX_IKE_FRAGMENTS {
            return Err(Error::InvalidParameter(format!(
                "fragment count {} out of range",
                total
            )));
        }

        let (first, chain) = self.encode_chain();
        let chunk = chain.len().div_ceil(total as usize).max(1);

        let mut out = Vec::with_capacity(total as usize);
        for number in 1..=total {
            let at = chunk * (number as usize - 1);
            let piece = if at >= chain.len() {
                &[][..]
            } else {
                &chain[at..(at + chunk).min(chain.len())]
            };

            let mut iv = vec![0u8; cipher.iv_len()];
            rand::thread_rng().fill_bytes(&mut iv);

            let skf_body_len = SkfHeader::SIZE + iv.len() + piece.len() + cipher.tag_len();
            let total_len = IKE_HEADER_SIZE + PayloadHeader::SIZE + skf_body_len;
            let header = self.header(PayloadType::Skf.to_u8(), total_len as u32);
            let header_bytes = header.to_bytes();

            let ciphertext = cipher.encrypt(key, &iv, piece, &header_bytes)?;

            // Only the first fragment names the first inner payload
            let np = if number == 1 {
                first
            } else {
                PayloadType::None.to_u8()
            };

            let mut frag = Vec::with_capacity(total_len);
            frag.extend_from_slice(&header_bytes);
            let ph =
                PayloadHeader::new(np, false, (PayloadHeader::SIZE + skf_body_len) as u16);
            frag.extend_from_slice(&ph.to_bytes());
            frag.extend_from_slice(&SkfHeader { number, total }.to_bytes());
            frag.extend_from_slice(&iv);
            frag.extend_from_slice(&ciphertext);
            out.push(frag);
        }
        Ok(out)
    }
}

/// Build the unencrypted Notify response answering a bad or gated request
///
/// Echoes the SPIs, exchange type and Message ID of the incoming header
/// and sets the response flag. Used for cookie challenges and pre-state
/// error notifications where no SA exists yet.
pub fn notify_response_for(
    request: &IkeHeader,
    local_is_initiator: bool,
    notify_type: NotifyType,
    data: Vec<u8>,
) -> Vec<u8> {
    MessageBuilder::new(
        request.initiator_spi,
        request.responder_spi,
        request.exchange_type,
        IkeFlags::response(local_is_initiator),
        request.message_id,
    )
    .notify(&NotifyPayload::for_ike_sa(notify_type, data))
    .build()
}

/// Fragment number of the leading SKF payload, if the datagram has one
///
/// The retransmit path only answers fragment 1 of a repeated fragmented
/// request; this peeks just far enough to decide.
pub fn peek_skf_number(datagram: &[u8]) -> Option<u16> {
    let header = IkeHeader::from_bytes(datagram).ok()?;
    if header.next_payload != PayloadType::Skf.to_u8() {
        return None;
    }
    let body_at = IKE_HEADER_SIZE + PayloadHeader::SIZE;
    let skf = SkfHeader::from_bytes(datagram.get(body_at..)?).ok()?;
    Some(skf.number)
}

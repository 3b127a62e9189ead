//! Shared fixture for the end-to-end demultiplexer tests
//!
//! `TestHandlers` implements just enough exchange semantics to drive two
//! engines against each other: fixed nonces, a key derived from both,
//! and wire-correct request/reply construction for every handler the
//! transition table can dispatch.

#![allow(dead_code)]

use keryx_proto::ikev2::constants::{ExchangeType, IkeFlags, NotifyType, PayloadType};
use keryx_proto::ikev2::crypto::{CipherAlgorithm, PrfAlgorithm, SaKeys};
use keryx_proto::ikev2::exchange::{Engine, SaActions};
use keryx_proto::ikev2::message::{MessageBuilder, NotifyPayload};
use keryx_proto::ikev2::payload::MessageDigest;
use keryx_proto::ikev2::sa::{RecordedMessage, SaRole, SaSerial};
use keryx_proto::ikev2::state::{ExchangeHandlers, HandlerId, SaState, TransitionResult};
use keryx_proto::ikev2::EngineConfig;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Fixed initiator nonce
pub const NI: [u8; 32] = [0x11; 32];

/// Fixed responder nonce
pub const NR: [u8; 32] = [0x22; 32];

pub fn init_addr() -> SocketAddr {
    "192.0.2.1:500".parse().unwrap()
}

pub fn resp_addr() -> SocketAddr {
    "192.0.2.2:500".parse().unwrap()
}

/// The key both sides derive once they hold both nonces
pub fn derive_test_keys(ni: &[u8], nr: &[u8]) -> SaKeys {
    let mut seed = ni.to_vec();
    seed.extend_from_slice(nr);
    let k = PrfAlgorithm::HmacSha256.compute(b"keryx-test-skeyseed", &seed);
    SaKeys {
        cipher: CipherAlgorithm::AesGcm128,
        sk_e_send: k[..16].to_vec(),
        sk_e_recv: k[..16].to_vec(),
    }
}

/// Scripted exchange semantics for the tests
#[derive(Default)]
pub struct TestHandlers {
    /// (ni, nr) seen per IKE SA serial
    nonces: HashMap<u64, (Option<Vec<u8>>, Option<Vec<u8>>)>,

    /// Proposed new initiator SPI per rekey child serial
    rekey_new_spi: HashMap<u64, u64>,

    /// Split the IKE_AUTH request over three fragments
    pub fragment_auth: bool,

    /// Times the AUTH request handler ran
    pub auth_request_invocations: u32,

    /// Times the AUTH response handler ran
    pub auth_response_invocations: u32,

    /// Times the informational handler ran
    pub informational_invocations: u32,
}

impl TestHandlers {
    pub fn new() -> Self {
        TestHandlers::default()
    }

    fn frag_support() -> NotifyPayload {
        NotifyPayload::for_ike_sa(NotifyType::FragmentationSupported, Vec::new())
    }

    fn parent_keys(actions: &SaActions<'_>) -> SaKeys {
        let sa = actions.sa();
        if let Some(keys) = sa.keys.clone() {
            return keys;
        }
        actions
            .parent()
            .and_then(|p| p.keys.clone())
            .expect("parent keys derived")
    }

    fn initiate(&mut self, actions: &mut SaActions<'_>) -> TransitionResult {
        let msgid = actions.next_request_msgid();
        let state = actions.sa().state;
        let serial = actions.sa().serial;
        let spi_i = actions.sa().spi_i;
        let spi_r = actions.sa().spi_r;

        match state {
            SaState::ParentI0 => {
                let request = MessageBuilder::new(
                    spi_i,
                    0,
                    ExchangeType::IkeSaInit,
                    IkeFlags::request(true),
                    msgid,
                )
                .payload(PayloadType::Sa, vec![0xA1; 8])
                .payload(PayloadType::Ke, vec![0xA2; 32])
                .payload(PayloadType::Nonce, NI.to_vec())
                .notify(&Self::frag_support())
                .build();
                self.nonces.insert(serial.0, (Some(NI.to_vec()), None));
                actions.record_request(RecordedMessage::Whole(request));
                TransitionResult::Ok
            }
            SaState::CreateChildI0 => {
                let keys = Self::parent_keys(actions);
                let request = MessageBuilder::new(
                    spi_i,
                    spi_r,
                    ExchangeType::CreateChildSa,
                    IkeFlags::request(actions.parent().expect("child").role == SaRole::Initiator),
                    msgid,
                )
                .payload(PayloadType::Sa, vec![0xB1; 8])
                .payload(PayloadType::Nonce, vec![0xB2; 32])
                .payload(PayloadType::TsI, vec![0xB3; 16])
                .payload(PayloadType::TsR, vec![0xB4; 16])
                .seal(keys.cipher, &keys.sk_e_send)
                .expect("seal child request");
                actions.record_request(RecordedMessage::Whole(request));
                TransitionResult::Ok
            }
            SaState::RekeyChildI0 => {
                let keys = Self::parent_keys(actions);
                let rekey = NotifyPayload {
                    protocol_id: 3,
                    spi: vec![0, 0, 0, 1],
                    notify_type: NotifyType::RekeySa,
                    data: Vec::new(),
                };
                let request = MessageBuilder::new(
                    spi_i,
                    spi_r,
                    ExchangeType::CreateChildSa,
                    IkeFlags::request(actions.parent().expect("child").role == SaRole::Initiator),
                    msgid,
                )
                .notify(&rekey)
                .payload(PayloadType::Sa, vec![0xB1; 8])
                .payload(PayloadType::Nonce, vec![0xB2; 32])
                .payload(PayloadType::TsI, vec![0xB3; 16])
                .payload(PayloadType::TsR, vec![0xB4; 16])
                .seal(keys.cipher, &keys.sk_e_send)
                .expect("seal rekey child request");
                actions.record_request(RecordedMessage::Whole(request));
                TransitionResult::Ok
            }
            SaState::RekeyIkeI0 => {
                let keys = Self::parent_keys(actions);
                let new_spi_i = 0x7700_0000_0000_0000 | serial.0;
                self.rekey_new_spi.insert(serial.0, new_spi_i);
                let request = MessageBuilder::new(
                    spi_i,
                    spi_r,
                    ExchangeType::CreateChildSa,
                    IkeFlags::request(actions.parent().expect("child").role == SaRole::Initiator),
                    msgid,
                )
                .payload(PayloadType::Sa, new_spi_i.to_be_bytes().to_vec())
                .payload(PayloadType::Ke, vec![0xC2; 32])
                .payload(PayloadType::Nonce, vec![0xC3; 32])
                .seal(keys.cipher, &keys.sk_e_send)
                .expect("seal IKE rekey request");
                actions.record_request(RecordedMessage::Whole(request));
                TransitionResult::Ok
            }
            other => panic!("initiate from unexpected state {:?}", other),
        }
    }

    fn sa_init_request(
        &mut self,
        actions: &mut SaActions<'_>,
        md: &MessageDigest,
    ) -> TransitionResult {
        let ni = md
            .first(PayloadType::Nonce)
            .expect("verified payload")
            .body
            .clone();
        self.nonces
            .insert(actions.sa().serial.0, (Some(ni), Some(NR.to_vec())));

        let reply = MessageBuilder::new(
            actions.sa().spi_i,
            actions.sa().spi_r,
            ExchangeType::IkeSaInit,
            IkeFlags::response(false),
            md.header.message_id,
        )
        .payload(PayloadType::Sa, vec![0xA1; 8])
        .payload(PayloadType::Ke, vec![0xA4; 32])
        .payload(PayloadType::Nonce, NR.to_vec())
        .notify(&Self::frag_support())
        .build();
        actions.record_reply(RecordedMessage::Whole(reply));
        TransitionResult::Ok
    }

    fn sa_init_response(
        &mut self,
        actions: &mut SaActions<'_>,
        md: &MessageDigest,
    ) -> TransitionResult {
        let serial = actions.sa().serial;
        let ni = self
            .nonces
            .get(&serial.0)
            .and_then(|(ni, _)| ni.clone())
            .expect("nonce recorded at initiate");
        let nr = md
            .first(PayloadType::Nonce)
            .expect("verified payload")
            .body
            .clone();
        let keys = derive_test_keys(&ni, &nr);
        actions.set_keys(keys.clone());

        let builder = MessageBuilder::new(
            actions.sa().spi_i,
            actions.sa().spi_r,
            ExchangeType::IkeAuth,
            IkeFlags::request(true),
            actions.next_request_msgid(),
        )
        .payload(PayloadType::IdI, b"initiator@test".to_vec())
        .payload(PayloadType::Auth, vec![0xD1; 32])
        .payload(PayloadType::Sa, vec![0xD2; 8])
        .payload(PayloadType::TsI, vec![0xD3; 16])
        .payload(PayloadType::TsR, vec![0xD4; 16]);

        let recorded = if self.fragment_auth {
            let frags = builder
                .seal_fragmented(keys.cipher, &keys.sk_e_send, 3)
                .expect("fragment AUTH request");
            RecordedMessage::Fragments(frags)
        } else {
            RecordedMessage::Whole(
                builder
                    .seal(keys.cipher, &keys.sk_e_send)
                    .expect("seal AUTH request"),
            )
        };
        actions.record_request(recorded);
        TransitionResult::Ok
    }

    fn auth_request_no_skeyseed(&mut self, actions: &mut SaActions<'_>) -> TransitionResult {
        let serial = actions.sa().serial;
        let (ni, nr) = self
            .nonces
            .get(&serial.0)
            .cloned()
            .expect("nonces recorded at SA_INIT");
        let keys = derive_test_keys(&ni.expect("ni"), &nr.expect("nr"));
        actions.set_keys(keys);
        // The DH work is "offloaded"; the test loop resumes us.
        TransitionResult::Suspend
    }

    fn auth_request(
        &mut self,
        actions: &mut SaActions<'_>,
        md: &MessageDigest,
    ) -> TransitionResult {
        self.auth_request_invocations += 1;
        assert!(md.first(PayloadType::Auth).is_some());
        assert!(md.first(PayloadType::IdI).is_some());

        let keys = actions.sa().keys.clone().expect("keys derived");
        let fragment = actions.sa().seen_fragments;
        let builder = MessageBuilder::new(
            actions.sa().spi_i,
            actions.sa().spi_r,
            ExchangeType::IkeAuth,
            IkeFlags::response(false),
            md.header.message_id,
        )
        .payload(PayloadType::IdR, b"responder@test".to_vec())
        .payload(PayloadType::Auth, vec![0xD5; 32])
        .payload(PayloadType::Sa, vec![0xD2; 8])
        .payload(PayloadType::TsI, vec![0xD3; 16])
        .payload(PayloadType::TsR, vec![0xD4; 16]);

        let recorded = if fragment {
            RecordedMessage::Fragments(
                builder
                    .seal_fragmented(keys.cipher, &keys.sk_e_send, 3)
                    .expect("fragment AUTH reply"),
            )
        } else {
            RecordedMessage::Whole(
                builder
                    .seal(keys.cipher, &keys.sk_e_send)
                    .expect("seal AUTH reply"),
            )
        };
        actions.record_reply(recorded);

        let child = actions.spawn_child(
            SaRole::Responder,
            SaState::CreateChildR,
            md.header.message_id,
        );
        actions.switch_to_child(child);
        TransitionResult::Ok
    }

    fn auth_response(
        &mut self,
        actions: &mut SaActions<'_>,
        md: &MessageDigest,
    ) -> TransitionResult {
        self.auth_response_invocations += 1;
        assert!(md.first(PayloadType::Auth).is_some());
        assert!(md.first(PayloadType::IdR).is_some());

        let child = actions.spawn_child(
            SaRole::Initiator,
            SaState::CreateChildI,
            md.header.message_id,
        );
        actions.switch_to_child(child);
        TransitionResult::Ok
    }

    fn sa_init_response_notification(
        &mut self,
        actions: &mut SaActions<'_>,
        md: &MessageDigest,
    ) -> TransitionResult {
        let Some(cookie) = md.first_notify(NotifyType::Cookie) else {
            return TransitionResult::Ignore;
        };

        // Start over, presenting the cookie first.
        actions.restart_message_ids();
        let request = MessageBuilder::new(
            actions.sa().spi_i,
            0,
            ExchangeType::IkeSaInit,
            IkeFlags::request(true),
            0,
        )
        .notify(&NotifyPayload::for_ike_sa(NotifyType::Cookie, cookie.data))
        .payload(PayloadType::Sa, vec![0xA1; 8])
        .payload(PayloadType::Ke, vec![0xA2; 32])
        .payload(PayloadType::Nonce, NI.to_vec())
        .notify(&Self::frag_support())
        .build();
        self.nonces
            .insert(actions.sa().serial.0, (Some(NI.to_vec()), None));
        actions.record_request(RecordedMessage::Whole(request));
        TransitionResult::Ok
    }

    fn rekey_ike_request(
        &mut self,
        actions: &mut SaActions<'_>,
        md: &MessageDigest,
    ) -> TransitionResult {
        let sa_body = &md.first(PayloadType::Sa).expect("verified payload").body;
        let new_spi_i = u64::from_be_bytes(sa_body[..8].try_into().unwrap());
        let new_spi_r = 0x8800_0000_0000_0000 | actions.sa().serial.0;
        actions.set_rekey_spis(new_spi_i, new_spi_r);

        let keys = Self::parent_keys(actions);
        // The rekeyed IKE SA keeps the same key schedule in this fixture.
        actions.set_keys(keys.clone());

        let reply = MessageBuilder::new(
            actions.sa().spi_i,
            actions.sa().spi_r,
            ExchangeType::CreateChildSa,
            IkeFlags::response(false),
            md.header.message_id,
        )
        .payload(PayloadType::Sa, new_spi_r.to_be_bytes().to_vec())
        .payload(PayloadType::Nonce, vec![0xC4; 32])
        .payload(PayloadType::Ke, vec![0xC5; 32])
        .seal(keys.cipher, &keys.sk_e_send)
        .expect("seal IKE rekey reply");
        actions.record_reply(RecordedMessage::Whole(reply));
        TransitionResult::Ok
    }

    fn rekey_ike_response(
        &mut self,
        actions: &mut SaActions<'_>,
        md: &MessageDigest,
    ) -> TransitionResult {
        let sa_body = &md.first(PayloadType::Sa).expect("verified payload").body;
        let new_spi_r = u64::from_be_bytes(sa_body[..8].try_into().unwrap());
        let new_spi_i = *self
            .rekey_new_spi
            .get(&actions.sa().serial.0)
            .expect("SPI proposed at initiate");
        actions.set_rekey_spis(new_spi_i, new_spi_r);

        let keys = Self::parent_keys(actions);
        actions.set_keys(keys);
        TransitionResult::Ok
    }

    fn create_child_request(
        &mut self,
        actions: &mut SaActions<'_>,
        md: &MessageDigest,
    ) -> TransitionResult {
        let keys = Self::parent_keys(actions);
        let reply = MessageBuilder::new(
            actions.sa().spi_i,
            actions.sa().spi_r,
            ExchangeType::CreateChildSa,
            IkeFlags::response(actions.parent().expect("child").role == SaRole::Initiator),
            md.header.message_id,
        )
        .payload(PayloadType::Sa, vec![0xB1; 8])
        .payload(PayloadType::Nonce, vec![0xB5; 32])
        .payload(PayloadType::TsI, vec![0xB3; 16])
        .payload(PayloadType::TsR, vec![0xB4; 16])
        .seal(keys.cipher, &keys.sk_e_send)
        .expect("seal child reply");
        actions.record_reply(RecordedMessage::Whole(reply));
        TransitionResult::Ok
    }

    fn informational(
        &mut self,
        actions: &mut SaActions<'_>,
        md: &MessageDigest,
    ) -> TransitionResult {
        self.informational_invocations += 1;
        if md.is_request() {
            let keys = actions.sa().keys.clone().expect("established SA");
            let reply = MessageBuilder::new(
                actions.sa().spi_i,
                actions.sa().spi_r,
                ExchangeType::Informational,
                IkeFlags::response(actions.sa().role == SaRole::Initiator),
                md.header.message_id,
            )
            .seal(keys.cipher, &keys.sk_e_send)
            .expect("seal informational reply");
            actions.record_reply(RecordedMessage::Whole(reply));
        }
        TransitionResult::Ok
    }
}

impl ExchangeHandlers for TestHandlers {
    fn handle(
        &mut self,
        id: HandlerId,
        actions: &mut SaActions<'_>,
        md: Option<&MessageDigest>,
    ) -> TransitionResult {
        match id {
            HandlerId::Initiate => self.initiate(actions),
            HandlerId::SaInitRequest => self.sa_init_request(actions, md.expect("inbound")),
            HandlerId::SaInitResponse => self.sa_init_response(actions, md.expect("inbound")),
            HandlerId::SaInitResponseNotification => {
                self.sa_init_response_notification(actions, md.expect("inbound"))
            }
            HandlerId::AuthRequestNoSkeyseed => self.auth_request_no_skeyseed(actions),
            HandlerId::AuthRequest => self.auth_request(actions, md.expect("inbound")),
            HandlerId::AuthResponse => self.auth_response(actions, md.expect("inbound")),
            HandlerId::AuthFailureNotification => TransitionResult::Fatal,
            HandlerId::AuthUnknownNotification => TransitionResult::Ignore,
            HandlerId::RekeyIkeRequest => self.rekey_ike_request(actions, md.expect("inbound")),
            HandlerId::RekeyIkeResponse => self.rekey_ike_response(actions, md.expect("inbound")),
            HandlerId::CreateChildRequest => {
                self.create_child_request(actions, md.expect("inbound"))
            }
            HandlerId::CreateChildResponse => TransitionResult::Ok,
            HandlerId::Informational => self.informational(actions, md.expect("inbound")),
        }
    }
}

/// Install a test subscriber once; `RUST_LOG=debug` then shows the
/// engine's trace of a failing scenario
pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Engine with default configuration and fresh handlers
pub fn new_engine() -> Engine<TestHandlers> {
    init_tracing();
    Engine::new(EngineConfig::default(), TestHandlers::new())
}

/// Engine with a custom configuration
pub fn new_engine_with(config: EngineConfig) -> Engine<TestHandlers> {
    init_tracing();
    Engine::new(config, TestHandlers::new())
}

/// Re-enter every SA parked by a suspended handler
pub fn resume_suspended(engine: &mut Engine<TestHandlers>) {
    let parked: Vec<SaSerial> = engine
        .sas()
        .serials()
        .into_iter()
        .filter(|s| {
            engine
                .sas()
                .get(*s)
                .map(|sa| sa.busy && sa.suspended_md.is_some())
                .unwrap_or(false)
        })
        .collect();
    for serial in parked {
        engine.resume(serial);
    }
}

/// Move every queued datagram from one engine into the other
///
/// Returns the delivered datagrams so tests can replay them.
pub fn deliver(
    from: &mut Engine<TestHandlers>,
    from_addr: SocketAddr,
    to: &mut Engine<TestHandlers>,
) -> Vec<Vec<u8>> {
    let outbox = from.take_outbox();
    let mut delivered = Vec::with_capacity(outbox.len());
    for (_, datagram) in outbox {
        to.process_packet(&datagram, from_addr);
        resume_suspended(to);
        delivered.push(datagram);
    }
    delivered
}

/// Serial of the (first) IKE SA in an engine's table
pub fn ike_serial(engine: &Engine<TestHandlers>) -> SaSerial {
    let mut serials: Vec<SaSerial> = engine
        .sas()
        .serials()
        .into_iter()
        .filter(|s| engine.sas().get(*s).map(|sa| !sa.is_child()).unwrap_or(false))
        .collect();
    serials.sort();
    serials[0]
}

/// Serials of all children of an IKE SA, ordered
pub fn children(engine: &Engine<TestHandlers>, parent: SaSerial) -> Vec<SaSerial> {
    engine.sas().children_of(parent)
}

/// Run a clean IKE_SA_INIT + IKE_AUTH handshake between two engines
///
/// Returns (initiator engine, responder engine, initiator IKE serial,
/// responder IKE serial).
pub fn establish_pair() -> (
    Engine<TestHandlers>,
    Engine<TestHandlers>,
    SaSerial,
    SaSerial,
) {
    let mut init = new_engine();
    let mut resp = new_engine();

    let i_serial = init.create_ike_initiator(resp_addr());
    init.initiate(i_serial).expect("initiate");

    deliver(&mut init, init_addr(), &mut resp); // SA_INIT request
    deliver(&mut resp, resp_addr(), &mut init); // SA_INIT reply, AUTH request queued
    deliver(&mut init, init_addr(), &mut resp); // AUTH request
    deliver(&mut resp, resp_addr(), &mut init); // AUTH reply

    let r_serial = ike_serial(&resp);
    (init, resp, i_serial, r_serial)
}

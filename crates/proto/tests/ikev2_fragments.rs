//! Fragmented IKE_AUTH flows (RFC 7383)

mod common;

use common::*;
use keryx_proto::ikev2::constants::{ExchangeType, IkeFlags, PayloadType};
use keryx_proto::ikev2::message::MessageBuilder;
use keryx_proto::ikev2::state::SaState;

/// Run SA_INIT between two engines with a fragmenting initiator and
/// return everything needed to play with the AUTH fragments.
fn init_exchange_with_fragmented_auth() -> (
    keryx_proto::ikev2::Engine<TestHandlers>,
    keryx_proto::ikev2::Engine<TestHandlers>,
    Vec<Vec<u8>>,
) {
    let mut init = new_engine();
    let mut resp = new_engine();
    init.handlers_mut().fragment_auth = true;

    let i_serial = init.create_ike_initiator(resp_addr());
    init.initiate(i_serial).unwrap();

    deliver(&mut init, init_addr(), &mut resp);
    deliver(&mut resp, resp_addr(), &mut init);

    // The AUTH request left as three SKF datagrams.
    let frags: Vec<Vec<u8>> = init.take_outbox().into_iter().map(|(_, d)| d).collect();
    assert_eq!(frags.len(), 3);
    (init, resp, frags)
}

#[test]
fn test_fragmented_auth_reassembles_out_of_order() {
    let (_init, mut resp, frags) = init_exchange_with_fragmented_auth();

    // Arrival order 2, 3, 1: the handler runs once, after fragment 1.
    resp.process_packet(&frags[1], init_addr());
    resume_suspended(&mut resp);
    assert_eq!(resp.handlers().auth_request_invocations, 0);

    resp.process_packet(&frags[2], init_addr());
    resume_suspended(&mut resp);
    assert_eq!(resp.handlers().auth_request_invocations, 0);

    resp.process_packet(&frags[0], init_addr());
    resume_suspended(&mut resp);
    assert_eq!(resp.handlers().auth_request_invocations, 1);

    assert_eq!(
        resp.sas().get(ike_serial(&resp)).unwrap().state,
        SaState::ParentR2
    );
    assert_eq!(resp.metrics().snapshot().fragment_sets_reassembled, 1);
}

#[test]
fn test_any_arrival_permutation_reassembles() {
    for order in [[0usize, 1, 2], [2, 0, 1], [1, 0, 2], [2, 1, 0]] {
        let (_init, mut resp, frags) = init_exchange_with_fragmented_auth();
        for &i in &order {
            resp.process_packet(&frags[i], init_addr());
            resume_suspended(&mut resp);
        }
        assert_eq!(
            resp.handlers().auth_request_invocations,
            1,
            "order {:?}",
            order
        );
        assert_eq!(
            resp.sas().get(ike_serial(&resp)).unwrap().state,
            SaState::ParentR2,
            "order {:?}",
            order
        );
    }
}

#[test]
fn test_duplicate_fragment_is_ignored() {
    let (_init, mut resp, frags) = init_exchange_with_fragmented_auth();

    resp.process_packet(&frags[0], init_addr());
    resp.process_packet(&frags[0], init_addr());
    resp.process_packet(&frags[1], init_addr());
    assert_eq!(resp.handlers().auth_request_invocations, 0);

    resp.process_packet(&frags[2], init_addr());
    resume_suspended(&mut resp);
    assert_eq!(resp.handlers().auth_request_invocations, 1);
}

#[test]
fn test_fragmented_request_gets_fragmented_reply() {
    let (_init, mut resp, frags) = init_exchange_with_fragmented_auth();

    for frag in &frags {
        resp.process_packet(frag, init_addr());
        resume_suspended(&mut resp);
    }

    // Having seen fragments, the responder answers in fragments.
    let reply: Vec<Vec<u8>> = resp.take_outbox().into_iter().map(|(_, d)| d).collect();
    assert_eq!(reply.len(), 3);
}

fn manual_auth_fragments(resp: &keryx_proto::ikev2::Engine<TestHandlers>, total: u16) -> Vec<Vec<u8>> {
    let keys = derive_test_keys(&NI, &NR);
    let sa = resp.sas().get(ike_serial(resp)).unwrap();
    MessageBuilder::new(
        sa.spi_i,
        sa.spi_r,
        ExchangeType::IkeAuth,
        IkeFlags::request(true),
        1,
    )
    .payload(PayloadType::IdI, b"initiator@test".to_vec())
    .payload(PayloadType::Auth, vec![0xD1; 32])
    .payload(PayloadType::Sa, vec![0xD2; 8])
    .payload(PayloadType::TsI, vec![0xD3; 16])
    .payload(PayloadType::TsR, vec![0xD4; 16])
    .seal_fragmented(keys.cipher, &keys.sk_e_send, total)
    .unwrap()
}

#[test]
fn test_larger_total_supersedes_stored_fragments() {
    let mut init = new_engine();
    let mut resp = new_engine();

    let i_serial = init.create_ike_initiator(resp_addr());
    init.initiate(i_serial).unwrap();
    deliver(&mut init, init_addr(), &mut resp);
    deliver(&mut resp, resp_addr(), &mut init);
    init.take_outbox();

    // 1/3 arrives, then the peer restarts with a 5-fragment set
    // (ratcheted-down MTU). The stored fragment is discarded and the
    // five-set reassembles.
    let three_set = manual_auth_fragments(&resp, 3);
    let five_set = manual_auth_fragments(&resp, 5);

    resp.process_packet(&three_set[0], init_addr());
    assert_eq!(resp.handlers().auth_request_invocations, 0);

    for frag in &five_set {
        resp.process_packet(frag, init_addr());
        resume_suspended(&mut resp);
    }

    assert_eq!(resp.handlers().auth_request_invocations, 1);
    assert_eq!(
        resp.sas().get(ike_serial(&resp)).unwrap().state,
        SaState::ParentR2
    );
    assert!(resp.metrics().snapshot().fragment_sets_discarded >= 1);
}

#[test]
fn test_smaller_total_is_dropped() {
    let mut init = new_engine();
    let mut resp = new_engine();

    let i_serial = init.create_ike_initiator(resp_addr());
    init.initiate(i_serial).unwrap();
    deliver(&mut init, init_addr(), &mut resp);
    deliver(&mut resp, resp_addr(), &mut init);
    init.take_outbox();

    let five_set = manual_auth_fragments(&resp, 5);
    let three_set = manual_auth_fragments(&resp, 3);

    resp.process_packet(&five_set[0], init_addr());
    // A shrunken total never displaces the stored set.
    resp.process_packet(&three_set[1], init_addr());

    for frag in &five_set[1..] {
        resp.process_packet(frag, init_addr());
        resume_suspended(&mut resp);
    }
    assert_eq!(resp.handlers().auth_request_invocations, 1);
}

#[test]
fn test_fragments_rejected_when_policy_forbids() {
    let mut init = new_engine();
    let config = keryx_proto::ikev2::EngineConfig::builder()
        .with_fragmentation(false)
        .build()
        .unwrap();
    let mut resp = new_engine_with(config);

    let i_serial = init.create_ike_initiator(resp_addr());
    init.initiate(i_serial).unwrap();
    deliver(&mut init, init_addr(), &mut resp);
    deliver(&mut resp, resp_addr(), &mut init);
    init.take_outbox();

    for frag in manual_auth_fragments(&resp, 3) {
        resp.process_packet(&frag, init_addr());
        resume_suspended(&mut resp);
    }
    assert_eq!(resp.handlers().auth_request_invocations, 0);
}

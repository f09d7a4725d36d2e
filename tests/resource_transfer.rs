mod common;

use microreticulum::bytes::Bytes;
use microreticulum::crypt::sha256;
use microreticulum::transport::TransportEvent;
use microreticulum::Transport;

fn establish_link(
    a: &mut Transport,
    b: &mut Transport,
    seed: &str,
) -> microreticulum::LinkId {
    let mut destination = common::named_destination(seed, "test", "resource");
    destination.set_accept_link_requests(true);
    let dest_hash = a.register_destination(destination).expect("register");

    a.announce(&dest_hash, None).expect("announce");
    common::pump(&mut [&mut *a, &mut *b], 5);

    let link_id = b.open_link(&dest_hash).expect("open link");
    common::pump_until(&mut [&mut *a, &mut *b], 1, 50, |event| {
        matches!(event, TransportEvent::LinkEstablished { .. })
    })
    .expect("link established");

    link_id
}

/// 1 KiB of repetitive data: compresses into a single advertisement-plus-a-
/// few-parts transfer whose reassembled bytes match the input.
#[test]
fn small_resource_single_segment() {
    common::init_logging();
    let (mut a, mut b) = common::linked_pair("res-a", "res-b");
    let link_id = establish_link(&mut a, &mut b, "small-resource");

    let data: Vec<u8> = b"HELLO_RETICULUM_RESOURCE_TEST_DATA_"
        .iter()
        .copied()
        .cycle()
        .take(1024)
        .collect();

    b.link_mut(&link_id)
        .expect("link")
        .send_resource(Bytes::from_vec(data.clone()), true)
        .expect("send resource");

    let complete = common::pump_until(&mut [&mut a, &mut b], 0, 200, |event| {
        matches!(event, TransportEvent::ResourceReceived { .. })
    });

    match complete {
        Some(TransportEvent::ResourceReceived { data: received, .. }) => {
            assert_eq!(received.as_slice(), data.as_slice());
        }
        _ => panic!("resource did not complete"),
    }

    let sent = common::pump_until(&mut [&mut a, &mut b], 1, 50, |event| {
        matches!(event, TransportEvent::ResourceSent { .. })
    });
    assert!(sent.is_some(), "sender never saw the proof");
}

/// 2 MiB of deterministic incompressible data crosses as two segments and
/// reassembles through the segment accumulator into the original buffer.
#[test]
fn large_resource_two_segments() {
    common::init_logging();
    let (mut a, mut b) = common::linked_pair("seg-a", "seg-b");
    let link_id = establish_link(&mut a, &mut b, "large-resource");

    // Deterministic SHA-256 chain, concatenated to 2 MiB.
    let mut data = Vec::with_capacity(2 * 1024 * 1024);
    let mut digest = sha256(b"MICRORETICULUM_SEGMENT_TEST_SEED_");
    while data.len() < 2 * 1024 * 1024 {
        data.extend_from_slice(&digest);
        digest = sha256(&digest);
    }
    data.truncate(2 * 1024 * 1024);

    b.link_mut(&link_id)
        .expect("link")
        .send_resource(Bytes::from_vec(data.clone()), true)
        .expect("send resource");

    let assembled = common::pump_until(&mut [&mut a, &mut b], 0, 20_000, |event| {
        matches!(event, TransportEvent::ResourceAssembled { .. })
    });

    match assembled {
        Some(TransportEvent::ResourceAssembled { data: received, .. }) => {
            assert_eq!(received.len(), data.len());
            assert!(received.as_slice() == data.as_slice(), "reassembled bytes differ");
        }
        _ => panic!("multi-segment resource did not assemble"),
    }
}

/// Closing the link mid-transfer fails the in-flight resource on the
/// receiving side.
#[test]
fn link_close_fails_inflight_resource() {
    common::init_logging();
    let (mut a, mut b) = common::linked_pair("fail-a", "fail-b");
    let link_id = establish_link(&mut a, &mut b, "failing-resource");

    let data = vec![0xA7u8; 200 * 1024];
    b.link_mut(&link_id)
        .expect("link")
        .send_resource(Bytes::from_vec(data), true)
        .expect("send resource");

    // Let the transfer start, then tear the link down.
    common::pump(&mut [&mut a, &mut b], 4);
    b.close_link(&link_id);

    let failed = common::pump_until(&mut [&mut a, &mut b], 0, 50, |event| {
        matches!(
            event,
            TransportEvent::ResourceFailed { .. } | TransportEvent::LinkClosed { .. }
        )
    });
    assert!(failed.is_some(), "receiver did not observe the failure");
}

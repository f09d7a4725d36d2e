mod common;

use microreticulum::destination::ProofStrategy;
use microreticulum::transport::TransportEvent;

/// Full handshake over the wire followed by 100 encrypted echo round-trips,
/// with the link staying active throughout.
#[test]
fn link_handshake_and_echo_exchange() {
    common::init_logging();
    let (mut a, mut b) = common::linked_pair("peer-a", "peer-b");

    let mut destination = common::named_destination("echo-service", "test", "echo");
    destination.set_accept_link_requests(true);
    destination.set_proof_strategy(ProofStrategy::ProveAll);
    let dest_hash = a.register_destination(destination).expect("register");

    a.announce(&dest_hash, Some(b"echo service")).expect("announce");

    let announced = common::pump_until(&mut [&mut a, &mut b], 1, 50, |event| {
        matches!(event, TransportEvent::AnnounceReceived { destination, .. } if *destination == dest_hash)
    });
    assert!(announced.is_some(), "announce did not arrive");

    let link_id = b.open_link(&dest_hash).expect("open link");

    let established = common::pump_until(&mut [&mut a, &mut b], 1, 50, |event| {
        matches!(event, TransportEvent::LinkEstablished { link_id: id } if *id == link_id)
    });
    assert!(established.is_some(), "link did not activate on the initiator");

    // The responder side reports the same link id.
    common::pump(&mut [&mut a, &mut b], 5);
    assert!(a.link_mut(&link_id).is_some());

    for i in 1..=100u32 {
        let message = format!("TEST_MESSAGE_{}", i);
        b.link_mut(&link_id).expect("link").send(message.as_bytes()).expect("send");

        let received = common::pump_until(&mut [&mut a, &mut b], 0, 20, |event| {
            matches!(event, TransportEvent::LinkDataReceived { link_id: id, data }
                if *id == link_id && data.as_slice() == message.as_bytes())
        });
        assert!(received.is_some(), "message {} not delivered", i);

        let echo = format!("ECHO {}", message);
        a.link_mut(&link_id).expect("link").send(echo.as_bytes()).expect("send");

        let echoed = common::pump_until(&mut [&mut a, &mut b], 1, 20, |event| {
            matches!(event, TransportEvent::LinkDataReceived { link_id: id, data }
                if *id == link_id && data.as_slice() == echo.as_bytes())
        });
        assert!(echoed.is_some(), "echo {} not delivered", i);
    }

    assert_eq!(
        b.link_mut(&link_id).expect("link").status(),
        microreticulum::LinkStatus::Active
    );
    assert_eq!(
        a.link_mut(&link_id).expect("link").status(),
        microreticulum::LinkStatus::Active
    );
}

/// Closing a link tears the peer's side down too.
#[test]
fn link_close_propagates() {
    common::init_logging();
    let (mut a, mut b) = common::linked_pair("close-a", "close-b");

    let mut destination = common::named_destination("close-service", "test", "close");
    destination.set_accept_link_requests(true);
    let dest_hash = a.register_destination(destination).expect("register");

    a.announce(&dest_hash, None).expect("announce");
    common::pump(&mut [&mut a, &mut b], 5);

    let link_id = b.open_link(&dest_hash).expect("open link");
    let established = common::pump_until(&mut [&mut a, &mut b], 1, 50, |event| {
        matches!(event, TransportEvent::LinkEstablished { link_id: id } if *id == link_id)
    });
    assert!(established.is_some());

    b.close_link(&link_id);

    let closed_on_a = common::pump_until(&mut [&mut a, &mut b], 0, 20, |event| {
        matches!(event, TransportEvent::LinkClosed { link_id: id } if *id == link_id)
    });
    assert!(closed_on_a.is_some(), "peer did not observe the close");

    // Closed links leave the local tables on both sides.
    common::pump(&mut [&mut a, &mut b], 2);
    assert!(a.link_mut(&link_id).is_none());
    assert!(b.link_mut(&link_id).is_none());
}

/// Link-layer request/response RPC with a handler registered on the
/// destination.
#[test]
fn request_response_over_transport() {
    common::init_logging();
    let (mut a, mut b) = common::linked_pair("rpc-a", "rpc-b");

    let mut destination = common::named_destination("rpc-service", "test", "rpc");
    destination.set_accept_link_requests(true);
    destination.register_request_handler(
        "status/echo",
        Box::new(|data: &[u8]| {
            let mut reply = b"reply:".to_vec();
            reply.extend_from_slice(data);
            Some(reply)
        }),
    );
    let dest_hash = a.register_destination(destination).expect("register");

    a.announce(&dest_hash, None).expect("announce");
    common::pump(&mut [&mut a, &mut b], 5);

    let link_id = b.open_link(&dest_hash).expect("open link");
    common::pump_until(&mut [&mut a, &mut b], 1, 50, |event| {
        matches!(event, TransportEvent::LinkEstablished { .. })
    })
    .expect("link");

    let request_id = b
        .link_mut(&link_id)
        .expect("link")
        .send_request("status/echo", Some(b"ping"), std::time::Duration::from_secs(10))
        .expect("request");

    let response = common::pump_until(&mut [&mut a, &mut b], 1, 50, |event| {
        matches!(event, TransportEvent::RequestResponse { request_id: id, .. } if *id == request_id)
    });

    match response {
        Some(TransportEvent::RequestResponse { data, .. }) => {
            assert_eq!(data.as_slice(), b"reply:ping");
        }
        _ => panic!("no response received"),
    }
}

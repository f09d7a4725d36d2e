mod common;

use microreticulum::channel::stream::{RawChannelReader, RawChannelWriter};
use microreticulum::transport::TransportEvent;
use microreticulum::Transport;

fn establish_link(
    a: &mut Transport,
    b: &mut Transport,
    seed: &str,
) -> microreticulum::LinkId {
    let mut destination = common::named_destination(seed, "test", "buffer");
    destination.set_accept_link_requests(true);
    let dest_hash = a.register_destination(destination).expect("register");

    a.announce(&dest_hash, None).expect("announce");
    common::pump(&mut [&mut *a, &mut *b], 5);

    let link_id = b.open_link(&dest_hash).expect("open link");
    common::pump_until(&mut [&mut *a, &mut *b], 1, 50, |event| {
        matches!(event, TransportEvent::LinkEstablished { .. })
    })
    .expect("link established");
    common::pump(&mut [&mut *a, &mut *b], 2);

    link_id
}

/// 32 KiB of patterned data crosses a stream pair intact, ending in EOF.
#[test]
fn buffer_32k_roundtrip() {
    common::init_logging();
    let (mut a, mut b) = common::linked_pair("buf-a", "buf-b");
    let link_id = establish_link(&mut a, &mut b, "buffer-service");

    let reader = RawChannelReader::new(1, a.link_mut(&link_id).expect("link").channel_mut());
    let writer = RawChannelWriter::new(1);

    let data: Vec<u8> = (0..32_768usize).map(|i| (i % 256) as u8).collect();

    let mut written = 0;
    let mut stalled = 0;
    while written < data.len() {
        let sent = writer
            .write(b.link_mut(&link_id).expect("link"), &data[written..])
            .expect("write");
        written += sent;

        if sent == 0 {
            stalled += 1;
            assert!(stalled < 1000, "writer made no progress");
        } else {
            stalled = 0;
        }

        common::pump(&mut [&mut a, &mut b], 2);
    }

    // Let the final burst drain so the EOF message has a window slot.
    common::pump(&mut [&mut a, &mut b], 5);
    writer.close(b.link_mut(&link_id).expect("link")).expect("close");
    common::pump(&mut [&mut a, &mut b], 10);

    let mut received = Vec::with_capacity(data.len());
    let mut buf = [0u8; 4096];
    loop {
        let count = reader.read(&mut buf);
        if count == 0 {
            if reader.at_eof() {
                break;
            }
            common::pump(&mut [&mut a, &mut b], 2);
            continue;
        }
        received.extend_from_slice(&buf[..count]);
    }

    assert_eq!(received.len(), data.len());
    assert!(received == data, "stream bytes differ");
    assert!(reader.at_eof());
}

/// `readline` hands back newline-delimited slices, then the unterminated
/// tail at EOF.
#[test]
fn buffer_readline_delimits_lines() {
    common::init_logging();
    let (mut a, mut b) = common::linked_pair("line-a", "line-b");
    let link_id = establish_link(&mut a, &mut b, "line-service");

    let reader = RawChannelReader::new(2, a.link_mut(&link_id).expect("link").channel_mut());
    let writer = RawChannelWriter::new(2);

    let text = b"first line\nsecond line\ntrailing";
    let sent = writer
        .write(b.link_mut(&link_id).expect("link"), text)
        .expect("write");
    assert_eq!(sent, text.len());
    writer.close(b.link_mut(&link_id).expect("link")).expect("close");

    common::pump(&mut [&mut a, &mut b], 10);

    assert_eq!(reader.readline().expect("line"), b"first line\n");
    assert_eq!(reader.readline().expect("line"), b"second line\n");
    assert_eq!(reader.readline().expect("tail"), b"trailing");
    assert!(reader.readline().is_none());
    assert!(reader.at_eof());
}

/// The ready callback reports newly buffered bytes as stream data lands.
#[test]
fn buffer_ready_callback_fires() {
    common::init_logging();
    let (mut a, mut b) = common::linked_pair("cb-a", "cb-b");
    let link_id = establish_link(&mut a, &mut b, "callback-service");

    let reader = RawChannelReader::new(3, a.link_mut(&link_id).expect("link").channel_mut());
    let writer = RawChannelWriter::new(3);

    let observed = std::rc::Rc::new(std::cell::Cell::new(0usize));
    {
        let sink = observed.clone();
        reader.set_ready_callback(move |available| sink.set(available));
    }

    writer
        .write(b.link_mut(&link_id).expect("link"), b"notify me")
        .expect("write");
    common::pump(&mut [&mut a, &mut b], 5);

    assert_eq!(observed.get(), 9);
    assert_eq!(reader.ready(), 9);
}

#![allow(dead_code)]

use microreticulum::config::TransportConfig;
use microreticulum::destination::{DestinationName, SingleInputDestination};
use microreticulum::identity::PrivateIdentity;
use microreticulum::iface::pipe::PipeInterface;
use microreticulum::transport::{Transport, TransportEvent};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn transport(name: &str) -> Transport {
    Transport::new(
        TransportConfig::named(name),
        PrivateIdentity::new_from_name(&format!("node.{}", name)),
    )
}

pub fn transport_node(name: &str) -> Transport {
    Transport::new(
        TransportConfig::transport_node(name),
        PrivateIdentity::new_from_name(&format!("node.{}", name)),
    )
}

/// Two transports joined by an in-memory pipe.
pub fn linked_pair(name_a: &str, name_b: &str) -> (Transport, Transport) {
    let mut a = transport(name_a);
    let mut b = transport(name_b);

    let (pipe_a, pipe_b) = PipeInterface::named_pair(name_a, name_b);
    a.add_interface(Box::new(pipe_a)).expect("interface");
    b.add_interface(Box::new(pipe_b)).expect("interface");

    (a, b)
}

/// Ticks every transport `rounds` times in order.
pub fn pump(transports: &mut [&mut Transport], rounds: usize) {
    for _ in 0..rounds {
        for transport in transports.iter_mut() {
            transport.tick();
        }
    }
}

/// Pumps until `predicate` matches a drained event on the observed node or
/// `max_rounds` passes, returning the matched event. Other events drain away.
pub fn pump_until<F>(
    transports: &mut [&mut Transport],
    observed: usize,
    max_rounds: usize,
    mut predicate: F,
) -> Option<TransportEvent>
where
    F: FnMut(&TransportEvent) -> bool,
{
    for _ in 0..max_rounds {
        for transport in transports.iter_mut() {
            transport.tick();
        }
        let events = transports[observed].drain_events();
        for event in events {
            if predicate(&event) {
                return Some(event);
            }
        }
    }
    None
}

pub fn named_destination(seed: &str, app_name: &str, aspect: &str) -> SingleInputDestination {
    let identity = PrivateIdentity::new_from_name(seed);
    SingleInputDestination::new(identity, DestinationName::new(app_name, aspect))
}

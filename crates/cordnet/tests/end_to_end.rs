//! Two engines wired back-to-back through the in-memory transport.

use std::{net::SocketAddr, time::Duration};

use cordnet::{
    crc32,
    host::{Host, HostConfig},
    loopback::{LinkConfig, LoopbackIo},
    time::Timestamp,
    DatagramIo, Event, Packet, PeerId, PeerState, RangeCoder,
};

type TestHost = Host<LoopbackIo>;

fn pair_with(a_to_b: LinkConfig, b_to_a: LinkConfig) -> (TestHost, TestHost, SocketAddr) {
    let (io_a, io_b) = LoopbackIo::pair_with(a_to_b, b_to_a);
    let b_addr = io_b.local_addr().expect("loopback addr");
    let a = Host::new(io_a, HostConfig::default()).expect("host a");
    let b = Host::new(io_b, HostConfig::default()).expect("host b");
    (a, b, b_addr)
}

fn pair() -> (TestHost, TestHost, SocketAddr) {
    pair_with(LinkConfig::default(), LinkConfig::default())
}

/// Services both hosts until traffic stops flowing and both go quiet,
/// collecting all events.
fn pump(a: &mut TestHost, b: &mut TestHost, events_a: &mut Vec<Event>, events_b: &mut Vec<Event>) {
    loop {
        let before = a.total_sent_packets() + b.total_sent_packets();
        let mut progressed = false;
        while let Some(event) = a.service(0).expect("service a") {
            events_a.push(event);
            progressed = true;
        }
        while let Some(event) = b.service(0).expect("service b") {
            events_b.push(event);
            progressed = true;
        }
        if !progressed && a.total_sent_packets() + b.total_sent_packets() == before {
            return;
        }
    }
}

/// Pumps while stepping both hosts' clocks forward, driving retransmission
/// and timeout logic without wall-clock sleeps.
fn pump_with_time(
    a: &mut TestHost,
    b: &mut TestHost,
    events_a: &mut Vec<Event>,
    events_b: &mut Vec<Event>,
    start: Timestamp,
    step_ms: u32,
    rounds: u32,
) {
    let mut now = start;
    for _ in 0..rounds {
        a.set_time(now);
        b.set_time(now);
        pump(a, b, events_a, events_b);
        now = now.plus(step_ms);
    }
}

/// Services both hosts against the real clock for `duration`, letting
/// datagrams held back by link latency mature and deliver.
fn pump_for(
    a: &mut TestHost,
    b: &mut TestHost,
    events_a: &mut Vec<Event>,
    events_b: &mut Vec<Event>,
    duration: Duration,
) {
    let deadline = std::time::Instant::now() + duration;
    while std::time::Instant::now() < deadline {
        while let Some(event) = a.service(10).expect("service a") {
            events_a.push(event);
        }
        while let Some(event) = b.service(10).expect("service b") {
            events_b.push(event);
        }
    }
}

fn establish(a: &mut TestHost, b: &mut TestHost, b_addr: SocketAddr) -> (PeerId, PeerId) {
    let peer_at_a = a.connect(b_addr, 4, 0).expect("connect");
    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump(a, b, &mut events_a, &mut events_b);

    assert!(events_a
        .iter()
        .any(|event| matches!(event, Event::Connect { peer, .. } if *peer == peer_at_a)));
    let peer_at_b = events_b
        .iter()
        .find_map(|event| match event {
            Event::Connect { peer, .. } => Some(*peer),
            _ => None,
        })
        .expect("acceptor saw no connect");
    (peer_at_a, peer_at_b)
}

fn received_payloads(events: &[Event]) -> Vec<&Packet> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Receive { packet, .. } => Some(packet),
            _ => None,
        })
        .collect()
}

#[test]
fn handshake() {
    let (mut a, mut b, b_addr) = pair();
    let (peer_at_a, peer_at_b) = establish(&mut a, &mut b, b_addr);

    assert_eq!(
        a.peer(peer_at_a).connect_id(),
        b.peer(peer_at_b).connect_id()
    );
    assert_eq!(a.peer(peer_at_a).outgoing_peer_id(), peer_at_b.0);
    assert_eq!(b.peer(peer_at_b).outgoing_peer_id(), peer_at_a.0);
    assert_eq!(4, a.peer(peer_at_a).channel_count());
    assert!(a.check_events().is_none());

    // a manual ping round-trips silently and feeds the RTT estimator
    a.ping(peer_at_a);
    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump(&mut a, &mut b, &mut events_a, &mut events_b);
    assert!(events_a.is_empty());
    assert!(events_b.is_empty());
}

#[test]
fn broadcast_reaches_connected_peers() {
    let (mut a, mut b, b_addr) = pair();
    establish(&mut a, &mut b, b_addr);

    a.broadcast(1, &Packet::reliable(&b"to everyone"[..]));
    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump(&mut a, &mut b, &mut events_a, &mut events_b);

    let received = received_payloads(&events_b);
    assert_eq!(1, received.len());
    assert_eq!(&b"to everyone"[..], &received[0].data[..]);
}

#[test]
fn reliable_echo_through_loss() {
    // seed 40 realizes 999 drops across the 10,000 lossy datagrams below
    let (mut a, mut b, b_addr) = pair_with(
        LinkConfig {
            seed: 40,
            ..LinkConfig::default()
        },
        LinkConfig::default(),
    );
    let (peer_at_a, _) = establish(&mut a, &mut b, b_addr);

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());

    // drop 10% of A -> B datagrams from here on
    a.socket_mut().set_loss(0.1);

    let total = 10_000u32;
    for i in 0..total {
        // hold both clocks still so nothing retransmits mid-burst; sending
        // and flushing one message at a time puts each in its own datagram
        a.set_time(Timestamp(1_000));
        b.set_time(Timestamp(1_000));
        a.send(peer_at_a, 0, Packet::reliable(format!("msg-{i}").into_bytes()))
            .expect("send");
        pump(&mut a, &mut b, &mut events_a, &mut events_b);
    }

    // heal the link and step time forward so the lost commands time out and
    // retransmit
    a.socket_mut().set_loss(0.0);
    pump_with_time(
        &mut a,
        &mut b,
        &mut events_a,
        &mut events_b,
        Timestamp(1_300),
        300,
        20,
    );

    let received = received_payloads(&events_b);
    assert_eq!(total as usize, received.len());
    for (i, packet) in received.iter().enumerate() {
        assert_eq!(format!("msg-{i}").as_bytes(), &packet.data[..]);
    }

    // the peer for B measured the losses: each dropped datagram carried one
    // reliable command, so about a tenth of the traffic timed out
    let lost = a.peer(peer_at_a).packets_lost();
    assert!((950..=1050).contains(&lost), "{lost} of {total} packets lost");
}

#[test]
fn fragmentation_reassembles_large_message() {
    let (mut a, mut b, b_addr) = pair();
    let (peer_at_a, _) = establish(&mut a, &mut b, b_addr);

    // 1 MB of LCG noise; far beyond the MTU, so ~750 fragments
    let payload = (0u64..1_000_000)
        .map(|i| (i.wrapping_mul(1_103_515_245).wrapping_add(12_345) & 0xFF) as u8)
        .collect::<Vec<_>>();
    a.send(peer_at_a, 0, Packet::reliable(payload.clone()))
        .expect("send");

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump_with_time(
        &mut a,
        &mut b,
        &mut events_a,
        &mut events_b,
        Timestamp(1_000),
        50,
        100,
    );

    let received = received_payloads(&events_b);
    assert_eq!(1, received.len(), "expected one reassembled packet");
    assert_eq!(payload.len(), received[0].len());
    assert_eq!(payload, received[0].data);
}

#[test]
fn zero_length_packet_is_delivered() {
    let (mut a, mut b, b_addr) = pair();
    let (peer_at_a, _) = establish(&mut a, &mut b, b_addr);

    a.send(peer_at_a, 2, Packet::reliable(Vec::new())).expect("send");
    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump(&mut a, &mut b, &mut events_a, &mut events_b);

    let received = events_b
        .iter()
        .find_map(|event| match event {
            Event::Receive {
                channel_id, packet, ..
            } => Some((*channel_id, packet.clone())),
            _ => None,
        })
        .expect("no packet received");
    assert_eq!(2, received.0);
    assert!(received.1.is_empty());
}

#[test]
fn unsequenced_delivers_each_group_at_most_once() {
    let (mut a, mut b, b_addr) = pair();
    let (peer_at_a, _) = establish(&mut a, &mut b, b_addr);

    let total = 64u32;
    for i in 0..total {
        a.send(peer_at_a, 0, Packet::unsequenced(i.to_be_bytes().to_vec()))
            .expect("send");
    }
    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump(&mut a, &mut b, &mut events_a, &mut events_b);

    let mut seen = received_payloads(&events_b)
        .iter()
        .map(|packet| u32::from_be_bytes(packet.data[..4].try_into().expect("4 bytes")))
        .collect::<Vec<_>>();
    let delivered = seen.len();
    assert!(delivered <= total as usize);
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(delivered, seen.len(), "duplicate unsequenced delivery");
    // a lossless link delivers everything
    assert_eq!(total as usize, delivered);
}

#[test]
fn throttle_drop_over_latency() {
    let (mut a, mut b, b_addr) = pair_with(
        LinkConfig {
            latency: Duration::from_millis(200),
            ..LinkConfig::default()
        },
        LinkConfig {
            latency: Duration::from_millis(200),
            ..LinkConfig::default()
        },
    );
    let peer_at_a = a.connect(b_addr, 1, 0).expect("connect");

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump_for(
        &mut a,
        &mut b,
        &mut events_a,
        &mut events_b,
        Duration::from_secs(2),
    );
    assert!(
        events_a
            .iter()
            .any(|event| matches!(event, Event::Connect { .. })),
        "handshake never completed over the delayed link"
    );

    // hold the throttle at half scale: every unreliable packet rolls
    // against a 16-in-32 acceptance
    a.peer_mut(peer_at_a).set_packet_throttle(16, 16);

    let total = 1_000u32;
    for i in 0..total {
        let mut data = vec![0u8; 1_000];
        data[..4].copy_from_slice(&i.to_be_bytes());
        a.send(peer_at_a, 0, Packet::unreliable(data)).expect("send");
    }
    pump_for(
        &mut a,
        &mut b,
        &mut events_a,
        &mut events_b,
        Duration::from_secs(2),
    );

    let received = received_payloads(&events_b)
        .iter()
        .map(|packet| u32::from_be_bytes(packet.data[..4].try_into().expect("4 bytes")))
        .collect::<Vec<_>>();
    let delivered = received.len() as u32;
    assert!(
        (400..=600).contains(&delivered),
        "{delivered} of {total} delivered"
    );
    // survivors arrive in submission order
    assert!(received.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn timeout_disconnects_with_zero_data() {
    let (mut a, mut b, b_addr) = pair();
    let (peer_at_a, _) = establish(&mut a, &mut b, b_addr);
    a.peer_mut(peer_at_a).set_timeout(8, 2000, 6000);

    // sever A -> B without telling anyone
    a.socket_mut().set_loss(1.0);
    // something reliable in flight that will never be acknowledged
    a.send(peer_at_a, 0, Packet::reliable(&b"are you there"[..]))
        .expect("send");

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump_with_time(
        &mut a,
        &mut b,
        &mut events_a,
        &mut events_b,
        Timestamp(100_000),
        500,
        100,
    );

    let disconnect = events_a
        .iter()
        .find_map(|event| match event {
            Event::Disconnect { peer, data } => Some((*peer, *data)),
            _ => None,
        })
        .expect("connection never timed out");
    assert_eq!((peer_at_a, 0), disconnect);
    assert_eq!(PeerState::Disconnected, a.peer(peer_at_a).state());
}

#[test]
fn compression_shrinks_low_entropy_traffic() {
    let (mut a, mut b, b_addr) = pair();
    a.compress(Some(Box::new(RangeCoder::new())));
    b.compress(Some(Box::new(RangeCoder::new())));
    let (peer_at_a, _) = establish(&mut a, &mut b, b_addr);

    let sent_before = a.total_sent_data();
    let total = 100usize;
    for _ in 0..total {
        a.send(peer_at_a, 0, Packet::reliable(vec![b'A'; 1024]))
            .expect("send");
    }

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump_with_time(
        &mut a,
        &mut b,
        &mut events_a,
        &mut events_b,
        Timestamp(1_000),
        100,
        50,
    );

    let received = received_payloads(&events_b);
    assert_eq!(total, received.len());
    assert!(received
        .iter()
        .all(|packet| packet.data.iter().all(|&byte| byte == b'A') && packet.len() == 1024));

    let on_wire = a.total_sent_data() - sent_before;
    assert!(
        on_wire < (total * 1024) as u64,
        "{on_wire} bytes on the wire for {} bytes of payload",
        total * 1024
    );
}

#[test]
fn checksummed_traffic_round_trips() {
    let (mut a, mut b, b_addr) = pair();
    a.set_checksum(Some(crc32::checksum_slices));
    b.set_checksum(Some(crc32::checksum_slices));
    let (peer_at_a, peer_at_b) = establish(&mut a, &mut b, b_addr);

    a.send(peer_at_a, 0, Packet::reliable(&b"checked"[..]))
        .expect("send");
    b.send(peer_at_b, 0, Packet::reliable(&b"double checked"[..]))
        .expect("send");

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump(&mut a, &mut b, &mut events_a, &mut events_b);

    assert_eq!(
        &b"checked"[..],
        &received_payloads(&events_b)[0].data[..]
    );
    assert_eq!(
        &b"double checked"[..],
        &received_payloads(&events_a)[0].data[..]
    );
}

#[test]
fn graceful_disconnect_notifies_both_sides() {
    let (mut a, mut b, b_addr) = pair();
    let (peer_at_a, peer_at_b) = establish(&mut a, &mut b, b_addr);

    a.disconnect(peer_at_a, 1234);
    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump(&mut a, &mut b, &mut events_a, &mut events_b);

    assert!(events_a
        .iter()
        .any(|event| matches!(event, Event::Disconnect { peer, .. } if *peer == peer_at_a)));
    assert!(events_b
        .iter()
        .any(|event| matches!(event, Event::Disconnect { peer, data: 1234 } if *peer == peer_at_b)));
    assert_eq!(PeerState::Disconnected, a.peer(peer_at_a).state());
    assert_eq!(PeerState::Disconnected, b.peer(peer_at_b).state());
}

#[test]
fn service_blocks_no_longer_than_its_timeout() {
    let (io_a, _io_b) = LoopbackIo::pair();
    let mut host = Host::new(io_a, HostConfig::default()).expect("host");
    let started = std::time::Instant::now();
    let event = host.service(50).expect("service");
    assert!(event.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
}

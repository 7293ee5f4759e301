// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Active-message transport over a localhost loopback: framing, gathered
// sends, completions and disconnect notification.

use std::time::{Duration, Instant};

use tsbnet::transport::{AmWorker, Body, IoSegment, TransportEvent, FLAG_RNDV};

const STEP: Duration = Duration::from_millis(20);
const DEADLINE: Duration = Duration::from_secs(10);

struct Pair {
    server: AmWorker,
    client: AmWorker,
    server_events: Vec<TransportEvent>,
    client_events: Vec<TransportEvent>,
    client_ep: usize,
}

fn connect_pair() -> Pair {
    let mut server = AmWorker::new().unwrap();
    server.listen(0).unwrap();
    let port = server.listen_port().unwrap();

    let mut client = AmWorker::new().unwrap();
    let client_ep = client.connect("127.0.0.1", port).unwrap();

    let mut pair = Pair {
        server,
        client,
        server_events: Vec::new(),
        client_events: Vec::new(),
        client_ep,
    };
    pair.pump_until(|p| {
        p.client_events
            .iter()
            .any(|e| matches!(e, TransportEvent::Connected { .. }))
            && p.server_events
                .iter()
                .any(|e| matches!(e, TransportEvent::Accepted { .. }))
    });
    pair
}

impl Pair {
    fn pump_until(&mut self, mut done: impl FnMut(&Pair) -> bool) {
        let deadline = Instant::now() + DEADLINE;
        while !done(self) {
            assert!(Instant::now() < deadline, "loopback test timed out");
            let mut ev = Vec::new();
            self.server.poll_events(Some(STEP), &mut ev).unwrap();
            self.server_events.append(&mut ev);
            self.client.poll_events(Some(STEP), &mut ev).unwrap();
            self.client_events.append(&mut ev);
        }
    }

    fn server_messages(&self) -> Vec<(u64, u64, Vec<u8>, Vec<u8>)> {
        self.server_events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Message {
                    am_id,
                    flags,
                    header,
                    body,
                    ..
                } => Some((*am_id, *flags, header.clone(), body.clone())),
                _ => None,
            })
            .collect()
    }
}

#[test]
fn message_round_trip() {
    let mut pair = connect_pair();
    pair.client
        .send(
            pair.client_ep,
            21,
            vec![1, 2, 3, 4],
            Body::Bytes(b"descriptor".to_vec()),
        )
        .unwrap();

    pair.pump_until(|p| !p.server_messages().is_empty());
    let messages = pair.server_messages();
    assert_eq!(messages.len(), 1);
    let (am_id, _, header, body) = &messages[0];
    assert_eq!(*am_id, 21);
    assert_eq!(header, &[1, 2, 3, 4]);
    assert_eq!(body, b"descriptor");

    // the sender observes a completion for the frame
    pair.pump_until(|p| {
        p.client_events
            .iter()
            .any(|e| matches!(e, TransportEvent::SendComplete { .. }))
    });
}

#[test]
fn empty_message() {
    let mut pair = connect_pair();
    pair.client
        .send(pair.client_ep, 60, Vec::new(), Body::None)
        .unwrap();
    pair.pump_until(|p| !p.server_messages().is_empty());
    let (am_id, _, header, body) = &pair.server_messages()[0];
    assert_eq!(*am_id, 60);
    assert!(header.is_empty());
    assert!(body.is_empty());
}

#[test]
fn gathered_segments_arrive_back_to_back() {
    let mut pair = connect_pair();

    let seg_a: &'static [u8] = Box::leak(vec![0xAAu8; 300].into_boxed_slice());
    let seg_b: &'static [u8] = Box::leak(vec![0xBBu8; 500].into_boxed_slice());
    let body = Body::Gather {
        owned: b"desc-bytes".to_vec(),
        segments: vec![
            IoSegment {
                ptr: seg_a.as_ptr(),
                len: seg_a.len(),
            },
            IoSegment {
                ptr: seg_b.as_ptr(),
                len: seg_b.len(),
            },
        ],
    };
    pair.client.send(pair.client_ep, 70, vec![7], body).unwrap();

    pair.pump_until(|p| !p.server_messages().is_empty());
    let (_, _, _, received) = &pair.server_messages()[0];
    assert_eq!(received.len(), 10 + 300 + 500);
    assert_eq!(&received[..10], b"desc-bytes");
    assert!(received[10..310].iter().all(|&b| b == 0xAA));
    assert!(received[310..].iter().all(|&b| b == 0xBB));
}

#[test]
fn large_body_sets_rndv_and_survives_partial_writes() {
    let mut pair = connect_pair();
    let payload: Vec<u8> = (0..2_000_000u32).map(|i| i as u8).collect();
    pair.client
        .send(pair.client_ep, 70, Vec::new(), Body::Bytes(payload.clone()))
        .unwrap();

    pair.pump_until(|p| !p.server_messages().is_empty());
    let (_, flags, _, body) = &pair.server_messages()[0];
    assert_ne!(flags & FLAG_RNDV, 0);
    assert_eq!(body, &payload);
}

#[test]
fn several_messages_keep_order() {
    let mut pair = connect_pair();
    for i in 0..10u64 {
        pair.client
            .send(pair.client_ep, i, Vec::new(), Body::Bytes(vec![i as u8; 100]))
            .unwrap();
    }
    pair.pump_until(|p| p.server_messages().len() == 10);
    let ids: Vec<u64> = pair.server_messages().iter().map(|m| m.0).collect();
    assert_eq!(ids, (0..10).collect::<Vec<_>>());
}

#[test]
fn close_produces_disconnect_on_the_peer() {
    let mut pair = connect_pair();
    let client_ep = pair.client_ep;
    pair.client.close(client_ep, false);
    pair.pump_until(|p| {
        p.server_events
            .iter()
            .any(|e| matches!(e, TransportEvent::Disconnected { .. }))
    });
}

#[test]
fn send_to_unknown_endpoint_fails() {
    let mut worker = AmWorker::new().unwrap();
    assert!(worker.send(123, 20, Vec::new(), Body::None).is_err());
}

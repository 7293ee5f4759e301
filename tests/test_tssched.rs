// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Scheduler end to end against scripted sender and builder peers:
// registration, announcement, capacity-aware assignment and the release
// broadcast.

use std::time::{Duration, Instant};

use tsbnet::protocol::{
    pack_header, unpack_header, AM_BUILDER_REGISTER, AM_BUILDER_STATUS, AM_SCHED_RELEASE_ST,
    AM_SCHED_SEND_TS, AM_SENDER_ANNOUNCE_ST, AM_SENDER_REGISTER,
};
use tsbnet::subtimeslice::TsCollectionDescriptor;
use tsbnet::system::StopToken;
use tsbnet::transport::{AmWorker, Body, TransportEvent};
use tsbnet::tssched::TsScheduler;

const STEP: Duration = Duration::from_millis(20);
const DEADLINE: Duration = Duration::from_secs(15);

struct Peer {
    worker: AmWorker,
    ep: usize,
    connected: bool,
    messages: Vec<(u64, Vec<u8>, Vec<u8>)>,
}

impl Peer {
    fn connect(port: u16) -> Self {
        let mut worker = AmWorker::new().unwrap();
        let ep = worker.connect("127.0.0.1", port).unwrap();
        Self {
            worker,
            ep,
            connected: false,
            messages: Vec::new(),
        }
    }

    fn pump(&mut self) {
        let mut events = Vec::new();
        self.worker.poll_events(Some(STEP), &mut events).unwrap();
        for event in events {
            match event {
                TransportEvent::Connected { .. } => self.connected = true,
                TransportEvent::Message {
                    am_id, header, body, ..
                } => self.messages.push((am_id, header, body)),
                _ => {}
            }
        }
    }

    fn wait(&mut self, mut done: impl FnMut(&Self) -> bool) {
        let deadline = Instant::now() + DEADLINE;
        while !done(self) {
            assert!(Instant::now() < deadline, "peer timed out");
            self.pump();
        }
    }

    fn send(&mut self, am_id: u64, header: Vec<u8>, body: Body) {
        self.worker.send(self.ep, am_id, header, body).unwrap();
    }
}

fn test_port() -> u16 {
    20000 + (std::process::id() % 20000) as u16
}

#[test]
fn announce_assign_release() {
    let port = test_port();
    let scheduler = TsScheduler::new(port, Duration::from_secs(10)).unwrap();
    let stop = StopToken::new();
    let sched_thread = {
        let stop = stop.clone();
        std::thread::spawn(move || scheduler.run(stop).unwrap())
    };

    // sender side: register and announce timeslice 5
    let mut sender = Peer::connect(port);
    sender.wait(|p| p.connected);
    sender.send(
        AM_SENDER_REGISTER,
        b"127.0.0.1:13131".to_vec(),
        Body::None,
    );
    let desc_body = vec![0u8; 48];
    sender.send(
        AM_SENDER_ANNOUNCE_ST,
        pack_header(&[5, desc_body.len() as u64, 4096]),
        Body::Bytes(desc_body),
    );

    // builder side: register and report plenty of capacity
    let mut builder = Peer::connect(port);
    builder.wait(|p| p.connected);
    builder.send(AM_BUILDER_REGISTER, b"build-node:1".to_vec(), Body::None);
    builder.send(
        AM_BUILDER_STATUS,
        pack_header(&[1 << 30, 0]),
        Body::None,
    );

    // the assignment arrives at the builder
    let deadline = Instant::now() + DEADLINE;
    while !builder.messages.iter().any(|(id, _, _)| *id == AM_SCHED_SEND_TS) {
        assert!(Instant::now() < deadline, "no assignment received");
        sender.pump();
        builder.pump();
    }
    let (_, header, body) = builder
        .messages
        .iter()
        .find(|(id, _, _)| *id == AM_SCHED_SEND_TS)
        .unwrap();
    let hdr = unpack_header(header, 3).unwrap();
    assert_eq!(hdr[0], 5);
    assert_eq!(hdr[1], body.len() as u64);
    assert_eq!(hdr[2], 48 + 4096);

    let collection = TsCollectionDescriptor::from_bytes(body).unwrap();
    assert_eq!(collection.ts_id, 5);
    assert_eq!(collection.senders.len(), 1);
    assert_eq!(collection.senders[0].sender_id, "127.0.0.1:13131");
    assert_eq!(collection.senders[0].desc_size, 48);
    assert_eq!(collection.senders[0].content_size, 4096);

    // after the grace period the sender is told to drop the id
    let deadline = Instant::now() + DEADLINE;
    while !sender.messages.iter().any(|(id, _, _)| *id == AM_SCHED_RELEASE_ST) {
        assert!(Instant::now() < deadline, "no release received");
        sender.pump();
        builder.pump();
    }
    let release = sender
        .messages
        .iter()
        .find(|(id, _, _)| *id == AM_SCHED_RELEASE_ST)
        .unwrap();
    assert_eq!(unpack_header(&release.1, 1).unwrap()[0], 5);

    stop.request_stop();
    sched_thread.join().unwrap();
}

#[test]
fn assignment_waits_for_builder_capacity() {
    let port = test_port() + 1;
    let scheduler = TsScheduler::new(port, Duration::from_secs(10)).unwrap();
    let stop = StopToken::new();
    let sched_thread = {
        let stop = stop.clone();
        std::thread::spawn(move || scheduler.run(stop).unwrap())
    };

    let mut sender = Peer::connect(port);
    sender.wait(|p| p.connected);
    sender.send(AM_SENDER_REGISTER, b"127.0.0.1:13131".to_vec(), Body::None);
    let desc_body = vec![0u8; 32];
    sender.send(
        AM_SENDER_ANNOUNCE_ST,
        pack_header(&[1, 32, 1 << 20]),
        Body::Bytes(desc_body),
    );

    // a builder with too little room must not receive the assignment
    let mut builder = Peer::connect(port);
    builder.wait(|p| p.connected);
    builder.send(AM_BUILDER_REGISTER, b"tiny-builder".to_vec(), Body::None);
    builder.send(AM_BUILDER_STATUS, pack_header(&[1024, 0]), Body::None);

    let settle = Instant::now() + Duration::from_secs(1);
    while Instant::now() < settle {
        sender.pump();
        builder.pump();
    }
    assert!(!builder.messages.iter().any(|(id, _, _)| *id == AM_SCHED_SEND_TS));

    // more capacity reported: the assignment follows
    builder.send(AM_BUILDER_STATUS, pack_header(&[1 << 24, 0]), Body::None);
    builder.wait(|p| p.messages.iter().any(|(id, _, _)| *id == AM_SCHED_SEND_TS));

    stop.request_stop();
    sched_thread.join().unwrap();
}

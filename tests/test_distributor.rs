// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Item distribution: stride/offset filters, the three queueing
// policies, completion-driven handover and disconnect release.

use std::time::{Duration, Instant};

use tsbnet::distributor::{DistributorCore, ItemId, WorkerId, WorkerPort, WorkerQueuePolicy};

/// Records every outbound message; sends can be forced to fail.
#[derive(Default)]
struct RecordingPort {
    sent: Vec<(WorkerId, ItemId)>,
    heartbeats: Vec<WorkerId>,
    disconnects: Vec<WorkerId>,
    fail_sends: bool,
}

impl WorkerPort for RecordingPort {
    fn send_work_item(&mut self, worker: WorkerId, id: ItemId, _payload: &[u8]) -> bool {
        if self.fail_sends {
            return false;
        }
        self.sent.push((worker, id));
        true
    }

    fn send_heartbeat(&mut self, worker: WorkerId) {
        self.heartbeats.push(worker);
    }

    fn send_disconnect(&mut self, worker: WorkerId) {
        self.disconnects.push(worker);
    }
}

fn register(core: &mut DistributorCore, port: &mut RecordingPort, worker: WorkerId, args: &str) {
    assert!(core.on_worker_message(port, worker, &format!("REGISTER {args}")));
}

fn complete(core: &mut DistributorCore, port: &mut RecordingPort, worker: WorkerId, id: ItemId) {
    assert!(core.on_worker_message(port, worker, &format!("COMPLETE {id}")));
}

fn items_for(port: &RecordingPort, worker: WorkerId) -> Vec<ItemId> {
    port.sent
        .iter()
        .filter(|(w, _)| *w == worker)
        .map(|(_, i)| *i)
        .collect()
}

// --- stride/offset distribution ---

#[test]
fn stride_offset_and_skip_policy() {
    let mut core = DistributorCore::new();
    let mut port = RecordingPort::default();
    register(&mut core, &mut port, 1, "2 0 fully_async workerA");
    register(&mut core, &mut port, 2, "2 1 fully_async workerB");
    register(&mut core, &mut port, 3, "3 0 skip workerC");

    // items 0..6 arrive while all workers are idle; nobody completes
    for id in 0..7u64 {
        core.on_new_item(&mut port, id, Vec::new());
    }

    // A gets its first matching item immediately, the rest queue up; C is
    // busy with 0 when 3 and 6 arrive and skips them
    assert_eq!(items_for(&port, 1), vec![0]);
    assert_eq!(items_for(&port, 2), vec![1]);
    assert_eq!(items_for(&port, 3), vec![0]);

    // completions drain the queues in order
    let mut a_items = items_for(&port, 1);
    for _ in 0..3 {
        let last = *a_items.last().unwrap();
        complete(&mut core, &mut port, 1, last);
        a_items = items_for(&port, 1);
    }
    assert_eq!(a_items, vec![0, 2, 4, 6]);

    complete(&mut core, &mut port, 2, 1);
    complete(&mut core, &mut port, 2, 3);
    assert_eq!(items_for(&port, 2), vec![1, 3, 5]);

    // C never receives the skipped items
    complete(&mut core, &mut port, 3, 0);
    assert_eq!(items_for(&port, 3), vec![0]);
}

#[test]
fn unmatched_items_complete_immediately() {
    let mut core = DistributorCore::new();
    let mut port = RecordingPort::default();
    register(&mut core, &mut port, 1, "4 3 fully_async w");

    core.on_new_item(&mut port, 0, Vec::new());
    core.on_new_item(&mut port, 3, Vec::new());
    // 0 matches nobody and completes at once; 3 is outstanding at the worker
    assert_eq!(core.take_completed(), vec![0]);
}

#[test]
fn no_workers_means_everything_completes() {
    let mut core = DistributorCore::new();
    let mut port = RecordingPort::default();
    for id in 0..5u64 {
        core.on_new_item(&mut port, id, Vec::new());
    }
    assert_eq!(core.take_completed(), vec![0, 1, 2, 3, 4]);
}

// --- prebuffer_one ---

#[test]
fn prebuffer_one_keeps_only_the_newest() {
    let mut core = DistributorCore::new();
    let mut port = RecordingPort::default();
    register(&mut core, &mut port, 1, "1 0 prebuffer_one w");

    core.on_new_item(&mut port, 0, Vec::new());
    assert_eq!(items_for(&port, 1), vec![0]);

    // worker is busy; 1 and 2 arrive, only 2 must remain buffered
    core.on_new_item(&mut port, 1, Vec::new());
    core.on_new_item(&mut port, 2, Vec::new());
    // the overwritten item 1 is released immediately
    assert_eq!(core.take_completed(), vec![1]);

    complete(&mut core, &mut port, 1, 0);
    assert_eq!(items_for(&port, 1), vec![0, 2]);
    assert_eq!(core.take_completed(), vec![0]);
}

// --- completions and error handling ---

#[test]
fn completion_of_last_reference_reports_once() {
    let mut core = DistributorCore::new();
    let mut port = RecordingPort::default();
    register(&mut core, &mut port, 1, "1 0 fully_async a");
    register(&mut core, &mut port, 2, "1 0 fully_async b");

    core.on_new_item(&mut port, 7, Vec::new());
    assert!(core.take_completed().is_empty());

    complete(&mut core, &mut port, 1, 7);
    assert!(core.take_completed().is_empty());
    complete(&mut core, &mut port, 2, 7);
    assert_eq!(core.take_completed(), vec![7]);
    // a stray second completion is ignored
    core.on_worker_message(&mut port, 2, "COMPLETE 7");
    assert!(core.take_completed().is_empty());
}

#[test]
fn unknown_worker_completion_is_ignored() {
    let mut core = DistributorCore::new();
    let mut port = RecordingPort::default();
    assert!(core.on_worker_message(&mut port, 99, "COMPLETE 1"));
}

#[test]
fn malformed_registration_closes_the_worker() {
    let mut core = DistributorCore::new();
    let mut port = RecordingPort::default();
    assert!(!core.on_worker_message(&mut port, 1, "REGISTER nonsense"));
    assert!(!core.on_worker_message(&mut port, 1, "REGISTER 0 0 fully_async w"));
    assert!(!core.on_worker_message(&mut port, 1, "REGISTER 2 5 fully_async w"));
    assert!(!core.on_worker_message(&mut port, 1, "REGISTER 2 0 bogus_policy w"));
    assert_eq!(core.worker_count(), 0);
}

#[test]
fn disconnect_releases_outstanding_and_waiting_items() {
    let mut core = DistributorCore::new();
    let mut port = RecordingPort::default();
    register(&mut core, &mut port, 1, "1 0 fully_async w");

    core.on_new_item(&mut port, 0, Vec::new());
    core.on_new_item(&mut port, 1, Vec::new());
    core.on_new_item(&mut port, 2, Vec::new());
    assert!(core.take_completed().is_empty());

    core.on_worker_disconnect(1);
    let mut done = core.take_completed();
    done.sort_unstable();
    assert_eq!(done, vec![0, 1, 2]);
    assert_eq!(core.worker_count(), 0);
}

#[test]
fn failed_send_keeps_the_item_waiting() {
    let mut core = DistributorCore::new();
    let mut port = RecordingPort {
        fail_sends: true,
        ..Default::default()
    };
    register(&mut core, &mut port, 1, "1 0 fully_async w");
    core.on_new_item(&mut port, 0, Vec::new());
    assert!(port.sent.is_empty());
    assert!(core.take_completed().is_empty());

    // once sends work again the worker is handed new items directly; the
    // waiting item follows on the next completion
    port.fail_sends = false;
    core.on_new_item(&mut port, 1, Vec::new());
    assert_eq!(items_for(&port, 1), vec![1]);
    complete(&mut core, &mut port, 1, 1);
    assert_eq!(items_for(&port, 1), vec![1, 0]);
}

// --- heartbeats ---

#[test]
fn idle_workers_get_heartbeats() {
    let mut core = DistributorCore::new();
    let mut port = RecordingPort::default();
    register(&mut core, &mut port, 1, "1 0 fully_async idle");
    register(&mut core, &mut port, 2, "1 0 fully_async busy");
    core.on_new_item(&mut port, 1, Vec::new());
    complete(&mut core, &mut port, 1, 1);
    // worker 2 still holds item 1 outstanding

    let later = Instant::now() + Duration::from_secs(5);
    core.on_tick(&mut port, later);
    assert!(port.heartbeats.contains(&1));
    assert!(!port.heartbeats.contains(&2));
}

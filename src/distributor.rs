// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Item distributor: fans work items from one in-process producer out to
// worker consumers, each subscribing to `id mod stride == offset` with
// its own queueing policy. The item table here holds the only strong
// references; when the last interested worker lets go, the producer is
// told the backing memory can be freed.
//
// Worker wire: `REGISTER <stride> <offset> <policy> <name>` and
// `COMPLETE <id>` inbound; `WORK_ITEM <id>` (plus payload), `HEARTBEAT`
// and `DISCONNECT` outbound. Idle workers get a heartbeat so they can
// detect broker death.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, error, info, trace, warn};
use mio::Waker;

use crate::protocol::{
    AM_WORKER_COMMAND, AM_WORKER_DISCONNECT, AM_WORKER_HEARTBEAT, AM_WORKER_ITEM,
};
use crate::system::StopToken;
use crate::transport::{AmWorker, Body, EndpointId, TransportEvent};

/// Sequence number identifying a work item (the timeslice id).
pub type ItemId = u64;

/// Opaque worker identity (the transport connection).
pub type WorkerId = usize;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// How items queue up for a busy worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerQueuePolicy {
    /// Every matching item is delivered, queueing while the worker is busy.
    FullyAsync,
    /// Only the newest matching item is kept back for a busy worker.
    PrebufferOne,
    /// Busy workers are skipped; nothing is queued.
    Skip,
}

impl std::str::FromStr for WorkerQueuePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fully_async" => Ok(Self::FullyAsync),
            "prebuffer_one" => Ok(Self::PrebufferOne),
            "skip" => Ok(Self::Skip),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for WorkerQueuePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::FullyAsync => "fully_async",
            Self::PrebufferOne => "prebuffer_one",
            Self::Skip => "skip",
        })
    }
}

/// Outbound half of the worker wire, so the distribution logic can be
/// driven without sockets.
pub trait WorkerPort {
    /// Deliver an item. Returns `false` if the send could not be issued.
    fn send_work_item(&mut self, worker: WorkerId, id: ItemId, payload: &[u8]) -> bool;
    fn send_heartbeat(&mut self, worker: WorkerId);
    fn send_disconnect(&mut self, worker: WorkerId);
}

struct Worker {
    stride: u64,
    offset: u64,
    queue_policy: WorkerQueuePolicy,
    client_name: String,
    waiting_items: VecDeque<ItemId>,
    outstanding_items: VecDeque<ItemId>,
    next_heartbeat: Instant,
}

impl Worker {
    fn wants_item(&self, id: ItemId) -> bool {
        id % self.stride == self.offset
    }
}

struct ItemEntry {
    payload: Vec<u8>,
    refs: usize,
}

/// Distribution state machine: workers, the item table, completions.
pub struct DistributorCore {
    workers: HashMap<WorkerId, Worker>,
    items: HashMap<ItemId, ItemEntry>,
    completed_items: Vec<ItemId>,
}

impl DistributorCore {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
            items: HashMap::new(),
            completed_items: Vec::new(),
        }
    }

    /// Items whose last reference dropped since the previous call.
    pub fn take_completed(&mut self) -> Vec<ItemId> {
        std::mem::take(&mut self.completed_items)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn drop_ref(&mut self, id: ItemId) {
        if let Some(entry) = self.items.get_mut(&id) {
            entry.refs -= 1;
            if entry.refs == 0 {
                self.items.remove(&id);
                self.completed_items.push(id);
            }
        }
    }

    /// Handle a command frame from a worker. Returns `false` when the
    /// worker must be disconnected (malformed registration).
    pub fn on_worker_message(
        &mut self,
        port: &mut dyn WorkerPort,
        worker_id: WorkerId,
        command: &str,
    ) -> bool {
        if let Some(rest) = command.strip_prefix("REGISTER ") {
            return self.on_register(worker_id, rest);
        }
        if let Some(rest) = command.strip_prefix("COMPLETE ") {
            self.on_complete(port, worker_id, rest);
            return true;
        }
        warn!("worker {worker_id}: unknown command '{command}'");
        true
    }

    fn on_register(&mut self, worker_id: WorkerId, args: &str) -> bool {
        let mut it = args.split_whitespace();
        let parsed = (|| {
            let stride: u64 = it.next()?.parse().ok()?;
            let offset: u64 = it.next()?.parse().ok()?;
            let policy: WorkerQueuePolicy = it.next()?.parse().ok()?;
            let name = it.next()?.to_owned();
            if stride == 0 || offset >= stride {
                return None;
            }
            Some((stride, offset, policy, name))
        })();
        match parsed {
            Some((stride, offset, queue_policy, client_name)) => {
                info!(
                    "worker '{client_name}' registered: stride {stride} offset {offset} \
                     policy {queue_policy}"
                );
                self.workers.insert(
                    worker_id,
                    Worker {
                        stride,
                        offset,
                        queue_policy,
                        client_name,
                        waiting_items: VecDeque::new(),
                        outstanding_items: VecDeque::new(),
                        next_heartbeat: Instant::now() + HEARTBEAT_INTERVAL,
                    },
                );
                true
            }
            None => {
                error!("worker {worker_id}: malformed registration '{args}'");
                false
            }
        }
    }

    fn on_complete(&mut self, port: &mut dyn WorkerPort, worker_id: WorkerId, args: &str) {
        let Ok(id) = args.trim().parse::<ItemId>() else {
            warn!("worker {worker_id}: malformed completion '{args}'");
            return;
        };
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            warn!("completion from unknown worker {worker_id}");
            return;
        };
        let Some(pos) = worker.outstanding_items.iter().position(|&i| i == id) else {
            warn!(
                "worker '{}': completion for item {id} not outstanding",
                worker.client_name
            );
            return;
        };
        worker.outstanding_items.remove(pos);
        trace!("worker '{}' completed item {id}", worker.client_name);
        self.drop_ref(id);

        // hand over the next waiting item, if any
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            if let Some(next) = worker.waiting_items.pop_front() {
                worker.outstanding_items.push_back(next);
                worker.next_heartbeat = Instant::now() + HEARTBEAT_INTERVAL;
                let payload = self
                    .items
                    .get(&next)
                    .map(|e| e.payload.clone())
                    .unwrap_or_default();
                if !port.send_work_item(worker_id, next, &payload) {
                    // undo and keep it waiting
                    if let Some(worker) = self.workers.get_mut(&worker_id) {
                        worker.outstanding_items.retain(|&i| i != next);
                        worker.waiting_items.push_front(next);
                    }
                }
            }
        }
    }

    /// Distribute a new item to every matching worker. Items nobody keeps
    /// complete immediately.
    pub fn on_new_item(&mut self, port: &mut dyn WorkerPort, id: ItemId, payload: Vec<u8>) {
        self.items.insert(
            id,
            ItemEntry {
                payload,
                refs: 1, // the distribution pass below holds one reference
            },
        );

        let worker_ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for worker_id in worker_ids {
            let worker = self.workers.get_mut(&worker_id).unwrap();
            if !worker.wants_item(id) {
                continue;
            }
            if worker.queue_policy == WorkerQueuePolicy::PrebufferOne {
                let dropped: Vec<ItemId> = worker.waiting_items.drain(..).collect();
                for old in dropped {
                    self.drop_ref(old);
                }
            }
            let worker = self.workers.get_mut(&worker_id).unwrap();
            if worker.outstanding_items.is_empty() {
                // idle: deliver immediately
                worker.outstanding_items.push_back(id);
                worker.next_heartbeat = Instant::now() + HEARTBEAT_INTERVAL;
                self.items.get_mut(&id).unwrap().refs += 1;
                let payload = self.items[&id].payload.clone();
                if !port.send_work_item(worker_id, id, &payload) {
                    let worker = self.workers.get_mut(&worker_id).unwrap();
                    worker.outstanding_items.retain(|&i| i != id);
                    if worker.queue_policy == WorkerQueuePolicy::Skip {
                        self.drop_ref(id);
                    } else {
                        worker.waiting_items.push_back(id);
                    }
                }
            } else if worker.queue_policy != WorkerQueuePolicy::Skip {
                worker.waiting_items.push_back(id);
                self.items.get_mut(&id).unwrap().refs += 1;
            }
        }

        // release the distribution pass's reference
        self.drop_ref(id);
    }

    /// A worker went away: release everything it held.
    pub fn on_worker_disconnect(&mut self, worker_id: WorkerId) {
        let Some(worker) = self.workers.remove(&worker_id) else {
            error!("disconnect from unknown worker {worker_id}");
            return;
        };
        info!("worker '{}' disconnected", worker.client_name);
        for id in worker.waiting_items.iter().chain(worker.outstanding_items.iter()) {
            self.drop_ref(*id);
        }
    }

    /// Send heartbeats to workers that have been idle for a while.
    pub fn on_tick(&mut self, port: &mut dyn WorkerPort, now: Instant) {
        for (&worker_id, worker) in self.workers.iter_mut() {
            if worker.outstanding_items.is_empty() && worker.next_heartbeat <= now {
                port.send_heartbeat(worker_id);
                worker.next_heartbeat = now + HEARTBEAT_INTERVAL;
            }
        }
    }
}

impl Default for DistributorCore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Producer link (in-process)
// ---------------------------------------------------------------------------

enum ProducerMsg {
    NewItem(ItemId, Vec<u8>),
}

/// Producer-side handle: publish items, poll completions.
pub struct ItemProducer {
    tx: Sender<ProducerMsg>,
    completions: Receiver<ItemId>,
    waker: Arc<Waker>,
}

impl ItemProducer {
    /// Publish a work item to the distributor.
    pub fn send_work_item(&self, id: ItemId, payload: Vec<u8>) {
        let _ = self.tx.send(ProducerMsg::NewItem(id, payload));
        let _ = self.waker.wake();
    }

    /// Pop one fully-processed item id, if any.
    pub fn try_receive_completion(&self) -> Option<ItemId> {
        self.completions.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// The broker loop
// ---------------------------------------------------------------------------

struct TransportPort<'a> {
    worker: &'a mut AmWorker,
}

impl WorkerPort for TransportPort<'_> {
    fn send_work_item(&mut self, worker: WorkerId, id: ItemId, payload: &[u8]) -> bool {
        let header = format!("WORK_ITEM {id}").into_bytes();
        let body = if payload.is_empty() {
            Body::None
        } else {
            Body::Bytes(payload.to_vec())
        };
        self.worker.send(worker, AM_WORKER_ITEM, header, body).is_ok()
    }

    fn send_heartbeat(&mut self, worker: WorkerId) {
        let _ = self
            .worker
            .send(worker, AM_WORKER_HEARTBEAT, b"HEARTBEAT".to_vec(), Body::None);
    }

    fn send_disconnect(&mut self, worker: WorkerId) {
        let _ = self.worker.send(
            worker,
            AM_WORKER_DISCONNECT,
            b"DISCONNECT".to_vec(),
            Body::None,
        );
    }
}

/// The worker-facing broker. Owns its own transport worker and runs on a
/// dedicated thread.
pub struct ItemDistributor {
    worker: AmWorker,
    core: DistributorCore,
    producer_rx: Receiver<ProducerMsg>,
    completions_tx: Sender<ItemId>,
    listen_port: u16,
}

impl ItemDistributor {
    /// Create the broker and its in-process producer handle.
    pub fn new(listen_port: u16) -> std::io::Result<(Self, ItemProducer)> {
        let worker = AmWorker::new()?;
        let (tx, producer_rx) = crossbeam_channel::unbounded();
        let (completions_tx, completions) = crossbeam_channel::unbounded();
        let producer = ItemProducer {
            tx,
            completions,
            waker: worker.waker(),
        };
        Ok((
            Self {
                worker,
                core: DistributorCore::new(),
                producer_rx,
                completions_tx,
                listen_port,
            },
            producer,
        ))
    }

    pub fn run(mut self, stop: StopToken) {
        crate::system::set_thread_name("distributor");

        if let Err(e) = self.worker.listen(self.listen_port) {
            error!("distributor failed to listen on port {}: {e}", self.listen_port);
            return;
        }

        let mut events = Vec::new();
        while !stop.stop_requested() {
            if let Err(e) = self.worker.poll_events(Some(POLL_TIMEOUT), &mut events) {
                error!("distributor poll failed: {e}");
                break;
            }
            for event in events.drain(..) {
                self.handle_event(event);
            }
            self.drain_producer();
            let mut port = TransportPort {
                worker: &mut self.worker,
            };
            self.core.on_tick(&mut port, Instant::now());
            for id in self.core.take_completed() {
                let _ = self.completions_tx.send(id);
            }
        }
        info!("item distributor stopped");
    }

    fn drain_producer(&mut self) {
        loop {
            match self.producer_rx.try_recv() {
                Ok(ProducerMsg::NewItem(id, payload)) => {
                    trace!("{id}| new work item, {} payload bytes", payload.len());
                    let mut port = TransportPort {
                        worker: &mut self.worker,
                    };
                    self.core.on_new_item(&mut port, id, payload);
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Accepted { ep, peer } => {
                debug!("worker connection from {peer} as {ep}");
            }
            TransportEvent::Message {
                ep, am_id, header, ..
            } => {
                if am_id != AM_WORKER_COMMAND {
                    error!("unexpected message id {am_id} from worker {ep}");
                    return;
                }
                let command = String::from_utf8_lossy(&header).into_owned();
                let mut port = TransportPort {
                    worker: &mut self.worker,
                };
                if !self.core.on_worker_message(&mut port, ep, &command) {
                    port.send_disconnect(ep);
                    self.worker.close(ep, false);
                }
            }
            TransportEvent::Disconnected { ep, .. } => {
                self.core.on_worker_disconnect(ep);
            }
            TransportEvent::Connected { .. }
            | TransportEvent::SendComplete { .. }
            | TransportEvent::SendFailed { .. } => {}
        }
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Timeslice scheduler: the authoritative map from timeslice id to the
// senders that announced it and the builder chosen to collect it. A
// timeslice is assigned once every live sender has announced it (or its
// deadline passed), to the least-loaded builder with enough room; after
// the assignment reaches the builder, every sender gets a release.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::protocol::{
    pack_header, unpack_header, AM_BUILDER_REGISTER, AM_BUILDER_STATUS, AM_SCHED_RELEASE_ST,
    AM_SCHED_SEND_TS, AM_SENDER_ANNOUNCE_ST, AM_SENDER_REGISTER, AM_SENDER_RETRACT_ST,
};
use crate::subtimeslice::{StId, TsCollectionDescriptor, TsCollectionEntry};
use crate::system::StopToken;
use crate::transport::{AmWorker, Body, EndpointId, SendToken, TransportEvent};

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const CHECK_INTERVAL: Duration = Duration::from_millis(100);
/// Grace period between delivering an assignment and releasing the senders,
/// so the builder's pulls do not race the release.
const RELEASE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct AnnouncedSt {
    id: StId,
    desc_size: u64,
    content_size: u64,
}

struct SenderConn {
    id: String,
    announced_sts: Vec<AnnouncedSt>,
}

struct BuilderConn {
    id: String,
    bytes_available: u64,
    bytes_processed: u64,
    /// Cumulative bytes of assignments handed to this builder; the
    /// outstanding load is this minus the reported processed bytes.
    bytes_assigned: u64,
}

impl BuilderConn {
    fn outstanding(&self) -> u64 {
        self.bytes_assigned.saturating_sub(self.bytes_processed)
    }
}

struct TsState {
    deadline: Instant,
    assigned: Option<EndpointId>,
}

enum SchedTask {
    CheckAssignments,
    ReleaseTs(StId),
}

/// The timeslice scheduler worker.
pub struct TsScheduler {
    worker: AmWorker,
    listen_port: u16,
    connections: HashMap<EndpointId, SocketAddr>,
    sender_connections: HashMap<EndpointId, SenderConn>,
    builder_connections: HashMap<EndpointId, BuilderConn>,
    ts_state: BTreeMap<StId, TsState>,
    active_send_requests: HashMap<SendToken, (EndpointId, StId)>,
    assign_timeout: Duration,
    tasks: crate::timer::TaskQueue<SchedTask>,
}

impl TsScheduler {
    pub fn new(listen_port: u16, assign_timeout: Duration) -> std::io::Result<Self> {
        Ok(Self {
            worker: AmWorker::new()?,
            listen_port,
            connections: HashMap::new(),
            sender_connections: HashMap::new(),
            builder_connections: HashMap::new(),
            ts_state: BTreeMap::new(),
            active_send_requests: HashMap::new(),
            assign_timeout,
            tasks: crate::timer::TaskQueue::new(),
        })
    }

    pub fn run(mut self, stop: StopToken) -> std::io::Result<()> {
        crate::system::set_thread_name("tssched");
        self.worker.listen(self.listen_port)?;
        self.tasks
            .add(SchedTask::CheckAssignments, Instant::now() + CHECK_INTERVAL);

        let mut events = Vec::new();
        while !stop.stop_requested() {
            let now = Instant::now();
            let timeout = match self.tasks.when_next() {
                Some(when) => when.saturating_duration_since(now).min(POLL_TIMEOUT),
                None => POLL_TIMEOUT,
            };
            self.worker.poll_events(Some(timeout), &mut events)?;
            for event in events.drain(..) {
                self.handle_event(event);
            }
            let now = Instant::now();
            while let Some(task) = self.tasks.pop_due(now) {
                match task {
                    SchedTask::CheckAssignments => {
                        self.check_assignments();
                        self.tasks
                            .add(SchedTask::CheckAssignments, now + CHECK_INTERVAL);
                    }
                    SchedTask::ReleaseTs(id) => self.complete_assignment(id),
                }
            }
        }
        info!("timeslice scheduler stopped");
        Ok(())
    }

    // --- events ---

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Accepted { ep, peer } => {
                debug!("accepted connection from {peer}");
                self.connections.insert(ep, peer);
            }
            TransportEvent::Connected { .. } => {}
            TransportEvent::Message {
                ep,
                am_id,
                header,
                body,
                ..
            } => self.handle_message(ep, am_id, &header, &body),
            TransportEvent::SendComplete { token, .. } => {
                if let Some((_builder_ep, id)) = self.active_send_requests.remove(&token) {
                    // Let the builder pull from the senders before they are
                    // told to drop the id.
                    self.tasks
                        .add(SchedTask::ReleaseTs(id), Instant::now() + RELEASE_DELAY);
                }
            }
            TransportEvent::SendFailed { token, .. } => {
                if let Some((builder_ep, id)) = self.active_send_requests.remove(&token) {
                    warn!("{id}| assignment send to builder failed, rescheduling");
                    if let Some(ts) = self.ts_state.get_mut(&id) {
                        if ts.assigned == Some(builder_ep) {
                            ts.assigned = None;
                        }
                    }
                }
            }
            TransportEvent::Disconnected { ep, error } => self.handle_disconnect(ep, error),
        }
    }

    fn handle_disconnect(&mut self, ep: EndpointId, error: Option<String>) {
        match self.connections.remove(&ep) {
            Some(peer) => match error {
                Some(e) => error!("endpoint {peer} failed: {e}"),
                None => info!("endpoint {peer} disconnected"),
            },
            None => error!("received disconnect for unknown endpoint"),
        }

        if let Some(sender) = self.sender_connections.remove(&ep) {
            info!(
                "removing disconnected sender '{}' with {} announcements",
                sender.id,
                sender.announced_sts.len()
            );
        }
        if let Some(builder) = self.builder_connections.remove(&ep) {
            info!("removing disconnected builder '{}'", builder.id);
            // Unfinished assignments to this builder go back into the pool.
            for (id, ts) in self.ts_state.iter_mut() {
                if ts.assigned == Some(ep) {
                    debug!("{id}| reopening assignment of lost builder");
                    ts.assigned = None;
                }
            }
        }
    }

    fn handle_message(&mut self, ep: EndpointId, am_id: u64, header: &[u8], body: &[u8]) {
        match am_id {
            AM_SENDER_REGISTER => self.handle_sender_register(ep, header, body),
            AM_SENDER_ANNOUNCE_ST => self.handle_sender_announce(ep, header, body),
            AM_SENDER_RETRACT_ST => self.handle_sender_retract(ep, header, body),
            AM_BUILDER_REGISTER => self.handle_builder_register(ep, header, body),
            AM_BUILDER_STATUS => self.handle_builder_status(ep, header, body),
            _ => error!("unexpected message id {am_id} on endpoint {ep}"),
        }
    }

    // --- sender messages ---

    fn handle_sender_register(&mut self, ep: EndpointId, header: &[u8], body: &[u8]) {
        if header.is_empty() || !body.is_empty() {
            error!("invalid sender registration received");
            return;
        }
        let sender_id = String::from_utf8_lossy(header).into_owned();
        debug!("accepted sender registration with id {sender_id}");
        self.sender_connections.insert(
            ep,
            SenderConn {
                id: sender_id,
                announced_sts: Vec::new(),
            },
        );
    }

    fn handle_sender_announce(&mut self, ep: EndpointId, header: &[u8], body: &[u8]) {
        let Some(hdr) = unpack_header(header, 3) else {
            error!("invalid sender announcement received");
            return;
        };
        let (id, desc_size, content_size) = (hdr[0], hdr[1], hdr[2]);
        if desc_size != body.len() as u64 {
            error!("invalid header data in sender announcement");
            return;
        }
        let Some(sender) = self.sender_connections.get_mut(&ep) else {
            error!("received announcement from unknown sender");
            return;
        };

        sender.announced_sts.push(AnnouncedSt {
            id,
            desc_size,
            content_size,
        });
        debug!(
            "{id}| announcement from sender '{}', desc {desc_size}B content {content_size}B",
            sender.id
        );

        let deadline = Instant::now() + self.assign_timeout;
        self.ts_state.entry(id).or_insert(TsState {
            deadline,
            assigned: None,
        });
        self.try_assign(id);
    }

    fn handle_sender_retract(&mut self, ep: EndpointId, header: &[u8], body: &[u8]) {
        let Some(hdr) = unpack_header(header, 1) else {
            error!("invalid sender retraction received");
            return;
        };
        if !body.is_empty() {
            error!("invalid sender retraction received");
            return;
        }
        let id = hdr[0];
        let Some(sender) = self.sender_connections.get_mut(&ep) else {
            error!("received retraction from unknown sender");
            return;
        };
        trace!("{id}| retraction from sender '{}'", sender.id);
        sender.announced_sts.retain(|st| st.id != id);
    }

    // --- builder messages ---

    fn handle_builder_register(&mut self, ep: EndpointId, header: &[u8], body: &[u8]) {
        if header.is_empty() || !body.is_empty() {
            error!("invalid builder registration received");
            return;
        }
        let builder_id = String::from_utf8_lossy(header).into_owned();
        debug!("accepted builder registration with id {builder_id}");
        self.builder_connections.insert(
            ep,
            BuilderConn {
                id: builder_id,
                bytes_available: 0,
                bytes_processed: 0,
                bytes_assigned: 0,
            },
        );
    }

    fn handle_builder_status(&mut self, ep: EndpointId, header: &[u8], body: &[u8]) {
        let Some(hdr) = unpack_header(header, 2) else {
            error!("invalid builder status received");
            return;
        };
        if !body.is_empty() {
            error!("invalid builder status received");
            return;
        }
        let Some(builder) = self.builder_connections.get_mut(&ep) else {
            error!("received status from unknown builder");
            return;
        };
        builder.bytes_available = hdr[0];
        builder.bytes_processed = hdr[1];
        trace!(
            "builder '{}' status: {} available, {} processed",
            builder.id,
            builder.bytes_available,
            builder.bytes_processed
        );
    }

    // --- assignment ---

    /// Sweep for timeslices that became assignable by deadline.
    fn check_assignments(&mut self) {
        let ids: Vec<StId> = self
            .ts_state
            .iter()
            .filter(|(_, ts)| ts.assigned.is_none())
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            self.try_assign(id);
        }
    }

    fn announcements_for(&self, id: StId) -> Vec<(EndpointId, AnnouncedSt)> {
        let mut out = Vec::new();
        for (&ep, sender) in &self.sender_connections {
            if let Some(st) = sender.announced_sts.iter().find(|st| st.id == id) {
                out.push((ep, st.clone()));
            }
        }
        out
    }

    /// Assign `id` if every live sender has announced it or its deadline
    /// passed, and a builder with enough room exists.
    fn try_assign(&mut self, id: StId) {
        let Some(ts) = self.ts_state.get(&id) else {
            return;
        };
        if ts.assigned.is_some() {
            return;
        }

        let announcements = self.announcements_for(id);
        if announcements.is_empty() {
            return;
        }
        let all_announced = announcements.len() == self.sender_connections.len();
        if !all_announced && Instant::now() < ts.deadline {
            return;
        }

        let total_size: u64 = announcements
            .iter()
            .map(|(_, st)| st.desc_size + st.content_size)
            .sum();

        // Least-loaded builder whose capacity would not go negative.
        let candidate = self
            .builder_connections
            .iter()
            .filter(|(_, b)| b.bytes_available >= b.outstanding() + total_size)
            .min_by_key(|(_, b)| b.outstanding())
            .map(|(&ep, _)| ep);
        let Some(builder_ep) = candidate else {
            trace!("{id}| no builder with {total_size} free bytes");
            return;
        };

        let collection = TsCollectionDescriptor {
            ts_id: id,
            senders: announcements
                .iter()
                .map(|(ep, st)| TsCollectionEntry {
                    sender_id: self.sender_connections[ep].id.clone(),
                    desc_size: st.desc_size,
                    content_size: st.content_size,
                })
                .collect(),
        };
        let body = collection.to_bytes();
        let header = pack_header(&[id, body.len() as u64, total_size]);

        match self
            .worker
            .send(builder_ep, AM_SCHED_SEND_TS, header, Body::Bytes(body))
        {
            Ok(token) => {
                debug!(
                    "{id}| assigned to builder '{}' ({} senders, {total_size}B)",
                    self.builder_connections[&builder_ep].id,
                    collection.senders.len()
                );
                self.active_send_requests.insert(token, (builder_ep, id));
                self.ts_state.get_mut(&id).unwrap().assigned = Some(builder_ep);
                self.builder_connections
                    .get_mut(&builder_ep)
                    .unwrap()
                    .bytes_assigned += total_size;
            }
            Err(e) => {
                error!("{id}| failed to send assignment: {e}");
            }
        }
    }

    /// The assignment reached the builder: release the id on every sender
    /// and forget it. Skipped when the assignment was reopened in the
    /// meantime (builder loss).
    fn complete_assignment(&mut self, id: StId) {
        match self.ts_state.get(&id) {
            Some(ts) if ts.assigned.is_some() => {}
            _ => return,
        }
        trace!("{id}| assignment delivered, releasing senders");
        let header = pack_header(&[id]);
        let eps: Vec<EndpointId> = self.sender_connections.keys().copied().collect();
        for ep in eps {
            if let Err(e) = self
                .worker
                .send(ep, AM_SCHED_RELEASE_ST, header.clone(), Body::None)
            {
                warn!("{id}| failed to send release: {e}");
            }
            if let Some(sender) = self.sender_connections.get_mut(&ep) {
                sender.announced_sts.retain(|st| st.id != id);
            }
        }
        self.ts_state.remove(&id);
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Timeslice builder: registers with the scheduler, pulls the assigned
// subtimeslices from every announcing sender, assembles them into one
// contiguous shared-memory allocation and publishes the finished work
// item. Capacity is reported to the scheduler once a second.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::distributor::ItemProducer;
use crate::protocol::{
    pack_header, unpack_header, AM_BUILDER_REGISTER, AM_BUILDER_REQUEST_ST, AM_BUILDER_STATUS,
    AM_SCHED_SEND_TS, AM_SENDER_SEND_ST,
};
use crate::sender::{DEFAULT_SCHEDULER_PORT, DEFAULT_SENDER_PORT};
use crate::subtimeslice::{st_flags, StDescriptor, StId, TsCollectionDescriptor};
use crate::system::StopToken;
use crate::transport::{parse_address, AmWorker, Body, EndpointId, TransportEvent};
use crate::tsbuffer::TsBuffer;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

struct SenderLink {
    ep: EndpointId,
    connected: bool,
    pending_requests: Vec<StId>,
}

struct Assembly {
    offset: u64,
    cursor: u64,
    remaining: HashSet<String>,
    parts: Vec<StDescriptor>,
    incomplete: bool,
    deadline: Instant,
}

enum TsbTask {
    SchedConnect,
    ReportStatus,
    CheckTimeouts,
}

/// The timeslice assembly loop of a build node.
pub struct TsBuilder {
    worker: AmWorker,
    buffer: TsBuffer,
    producer: ItemProducer,
    builder_id: String,
    sched_host: String,
    sched_port: u16,
    sched_ep: Option<EndpointId>,
    sched_registered: bool,
    senders: HashMap<String, SenderLink>,
    ep_to_sender: HashMap<EndpointId, String>,
    assemblies: HashMap<StId, Assembly>,
    assembly_timeout: Duration,
    tasks: crate::timer::TaskQueue<TsbTask>,
    timeslice_count: u64,
}

impl TsBuilder {
    pub fn new(
        buffer: TsBuffer,
        producer: ItemProducer,
        tssched_address: &str,
        assembly_timeout: Duration,
    ) -> std::io::Result<Self> {
        let builder_id = format!(
            "{}:{}",
            crate::system::current_hostname(),
            crate::system::current_pid()
        );
        let (sched_host, sched_port) = parse_address(tssched_address, DEFAULT_SCHEDULER_PORT);
        Ok(Self {
            worker: AmWorker::new()?,
            buffer,
            producer,
            builder_id,
            sched_host,
            sched_port,
            sched_ep: None,
            sched_registered: false,
            senders: HashMap::new(),
            ep_to_sender: HashMap::new(),
            assemblies: HashMap::new(),
            assembly_timeout,
            tasks: crate::timer::TaskQueue::new(),
            timeslice_count: 0,
        })
    }

    pub fn run(mut self, stop: StopToken) -> std::io::Result<()> {
        crate::system::set_thread_name("ts-builder");

        self.try_sched_connect();
        self.tasks
            .add(TsbTask::ReportStatus, Instant::now() + STATUS_INTERVAL);
        self.tasks
            .add(TsbTask::CheckTimeouts, Instant::now() + Duration::from_secs(1));

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
            self.drain_completions();
            let now = Instant::now();
            while let Some(task) = self.tasks.pop_due(now) {
                match task {
                    TsbTask::SchedConnect => self.try_sched_connect(),
                    TsbTask::ReportStatus => {
                        self.report_status();
                        self.tasks.add(TsbTask::ReportStatus, now + STATUS_INTERVAL);
                    }
                    TsbTask::CheckTimeouts => {
                        self.check_timeouts(now);
                        self.tasks
                            .add(TsbTask::CheckTimeouts, now + Duration::from_secs(1));
                    }
                }
            }
        }
        info!(
            "timeslice builder stopped after {} timeslices",
            self.timeslice_count
        );
        Ok(())
    }

    // --- scheduler link ---

    fn try_sched_connect(&mut self) {
        if self.sched_ep.is_none() {
            match self.worker.connect(&self.sched_host, self.sched_port) {
                Ok(ep) => {
                    debug!("connecting to scheduler at {}:{}", self.sched_host, self.sched_port);
                    self.sched_ep = Some(ep);
                }
                Err(e) => warn!("failed to connect to scheduler: {e}"),
            }
        }
        self.tasks
            .add(TsbTask::SchedConnect, Instant::now() + RECONNECT_INTERVAL);
    }

    fn report_status(&mut self) {
        let Some(ep) = self.sched_ep else { return };
        if !self.sched_registered {
            return;
        }
        let header = pack_header(&[self.buffer.bytes_available(), self.buffer.bytes_processed()]);
        if let Err(e) = self.worker.send(ep, AM_BUILDER_STATUS, header, Body::None) {
            warn!("failed to send status to scheduler: {e}");
        }
    }

    // --- events ---

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { ep } => {
                if Some(ep) == self.sched_ep {
                    info!("connected to scheduler");
                    let header = self.builder_id.clone().into_bytes();
                    match self.worker.send(ep, AM_BUILDER_REGISTER, header, Body::None) {
                        Ok(_) => {
                            self.sched_registered = true;
                            info!("registered with scheduler as '{}'", self.builder_id);
                            self.report_status();
                        }
                        Err(e) => error!("failed to register with scheduler: {e}"),
                    }
                } else if let Some(sender_id) = self.ep_to_sender.get(&ep).cloned() {
                    debug!("connected to sender '{sender_id}'");
                    if let Some(link) = self.senders.get_mut(&sender_id) {
                        link.connected = true;
                        let pending = std::mem::take(&mut link.pending_requests);
                        for id in pending {
                            self.request_subtimeslice(ep, id);
                        }
                    }
                }
            }
            TransportEvent::Accepted { .. } => {}
            TransportEvent::Message {
                ep,
                am_id,
                header,
                body,
                ..
            } => self.handle_message(ep, am_id, &header, &body),
            TransportEvent::SendComplete { .. } | TransportEvent::SendFailed { .. } => {}
            TransportEvent::Disconnected { ep, error } => {
                if Some(ep) == self.sched_ep {
                    match error {
                        Some(e) => error!("scheduler link failed: {e}"),
                        None => info!("scheduler closed the connection"),
                    }
                    self.sched_ep = None;
                    self.sched_registered = false;
                } else if let Some(sender_id) = self.ep_to_sender.remove(&ep) {
                    warn!("sender '{sender_id}' disconnected");
                    self.senders.remove(&sender_id);
                    // components from this sender will never arrive
                    let affected: Vec<StId> = self
                        .assemblies
                        .iter()
                        .filter(|(_, a)| a.remaining.contains(&sender_id))
                        .map(|(&id, _)| id)
                        .collect();
                    for id in affected {
                        self.component_missing(id, &sender_id);
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, ep: EndpointId, am_id: u64, header: &[u8], body: &[u8]) {
        match am_id {
            AM_SCHED_SEND_TS => self.handle_assignment(header, body),
            AM_SENDER_SEND_ST => self.handle_subtimeslice(ep, header, body),
            _ => error!("unexpected message id {am_id} on endpoint {ep}"),
        }
    }

    /// A new assignment: allocate buffer space and pull from every sender.
    fn handle_assignment(&mut self, header: &[u8], body: &[u8]) {
        let Some(hdr) = unpack_header(header, 3) else {
            error!("invalid assignment received");
            return;
        };
        let (id, desc_size, total_size) = (hdr[0], hdr[1], hdr[2]);
        if desc_size != body.len() as u64 {
            error!("invalid header data in assignment");
            return;
        }
        let collection = match TsCollectionDescriptor::from_bytes(body) {
            Ok(c) => c,
            Err(e) => {
                error!("{id}| undecodable collection descriptor: {e}");
                return;
            }
        };
        if collection.ts_id != id || collection.senders.is_empty() {
            error!("{id}| inconsistent collection descriptor");
            return;
        }
        if self.assemblies.contains_key(&id) {
            warn!("{id}| duplicate assignment ignored");
            return;
        }

        let Some(offset) = self.buffer.allocate(id, total_size) else {
            error!("{id}| no buffer space for {total_size} bytes, dropping assignment");
            return;
        };
        debug!(
            "{id}| assignment with {} senders, {total_size} bytes",
            collection.senders.len()
        );

        let mut assembly = Assembly {
            offset,
            cursor: 0,
            remaining: HashSet::new(),
            parts: Vec::new(),
            incomplete: false,
            deadline: Instant::now() + self.assembly_timeout,
        };
        for entry in &collection.senders {
            assembly.remaining.insert(entry.sender_id.clone());
        }
        self.assemblies.insert(id, assembly);

        for entry in collection.senders {
            self.pull_from_sender(&entry.sender_id, id);
        }
    }

    fn pull_from_sender(&mut self, sender_id: &str, id: StId) {
        if let Some(link) = self.senders.get_mut(sender_id) {
            if link.connected {
                let ep = link.ep;
                self.request_subtimeslice(ep, id);
            } else {
                link.pending_requests.push(id);
            }
            return;
        }

        let (host, port) = parse_address(sender_id, DEFAULT_SENDER_PORT);
        match self.worker.connect(&host, port) {
            Ok(ep) => {
                self.senders.insert(
                    sender_id.to_owned(),
                    SenderLink {
                        ep,
                        connected: false,
                        pending_requests: vec![id],
                    },
                );
                self.ep_to_sender.insert(ep, sender_id.to_owned());
            }
            Err(e) => {
                error!("failed to connect to sender '{sender_id}': {e}");
                self.component_missing(id, sender_id);
            }
        }
    }

    fn request_subtimeslice(&mut self, ep: EndpointId, id: StId) {
        let header = pack_header(&[id]);
        if let Err(e) = self.worker.send(ep, AM_BUILDER_REQUEST_ST, header, Body::None) {
            error!("{id}| failed to request subtimeslice: {e}");
        }
    }

    /// A subtimeslice arrived: copy it into the assembly and rebase its
    /// component offsets. An empty reply counts as a missing component.
    fn handle_subtimeslice(&mut self, ep: EndpointId, header: &[u8], body: &[u8]) {
        let Some(hdr) = unpack_header(header, 3) else {
            error!("invalid subtimeslice message received");
            return;
        };
        let (id, desc_size, content_size) = (hdr[0], hdr[1], hdr[2]);
        let Some(sender_id) = self.ep_to_sender.get(&ep).cloned() else {
            error!("{id}| subtimeslice from unknown sender endpoint {ep}");
            return;
        };

        if desc_size == 0 && content_size == 0 {
            warn!("{id}| sender '{sender_id}' no longer holds the subtimeslice");
            self.component_missing(id, &sender_id);
            return;
        }
        if body.len() as u64 != desc_size + content_size {
            error!("{id}| inconsistent subtimeslice sizes from '{sender_id}'");
            self.component_missing(id, &sender_id);
            return;
        }

        let mut part = match StDescriptor::from_bytes(&body[..desc_size as usize]) {
            Ok(d) => d,
            Err(e) => {
                error!("{id}| undecodable subtimeslice descriptor: {e}");
                self.component_missing(id, &sender_id);
                return;
            }
        };

        let Some(assembly) = self.assemblies.get_mut(&id) else {
            warn!("{id}| subtimeslice for unknown assembly");
            return;
        };
        if !assembly.remaining.remove(&sender_id) {
            warn!("{id}| duplicate subtimeslice from '{sender_id}'");
            return;
        }

        // the payload lands at the assembly cursor; component offsets are
        // relative to the payload start
        let base = assembly.cursor;
        let payload = &body[desc_size as usize..];
        let offset = assembly.offset;
        for c in &mut part.components {
            c.descriptor.offset += base;
            c.content.offset += base;
        }
        assembly.cursor += payload.len() as u64;
        assembly.parts.push(part);
        let done = assembly.remaining.is_empty();
        self.buffer.write(offset, base, payload);
        trace!(
            "{id}| component from '{sender_id}' stored, {} bytes{}",
            payload.len(),
            if done { ", assembly complete" } else { "" }
        );

        if done {
            self.finish_assembly(id);
        }
    }

    /// A sender cannot deliver its part of `id`; proceed without it.
    fn component_missing(&mut self, id: StId, sender_id: &str) {
        let Some(assembly) = self.assemblies.get_mut(&id) else {
            return;
        };
        assembly.remaining.remove(sender_id);
        assembly.incomplete = true;
        if assembly.remaining.is_empty() {
            self.finish_assembly(id);
        }
    }

    /// All parts arrived (or were given up on): merge the descriptors and
    /// publish the work item.
    fn finish_assembly(&mut self, id: StId) {
        let Some(assembly) = self.assemblies.remove(&id) else {
            return;
        };
        if assembly.parts.is_empty() {
            warn!("{id}| nothing assembled, dropping timeslice");
            self.buffer.free(id);
            return;
        }

        let mut merged = StDescriptor {
            start_time_ns: assembly.parts[0].start_time_ns,
            duration_ns: assembly.parts[0].duration_ns,
            flags: 0,
            components: Vec::new(),
        };
        for part in assembly.parts {
            merged.flags |= part.flags;
            merged.components.extend(part.components);
        }
        if assembly.incomplete {
            merged.set_flag(st_flags::INCOMPLETE);
        }

        self.timeslice_count += 1;
        debug!(
            "{id}| timeslice assembled: {} components, incomplete={}",
            merged.components.len(),
            merged.has_flag(st_flags::INCOMPLETE)
        );

        let item = self.buffer.work_item(assembly.offset, merged);
        self.producer.send_work_item(id, item.to_bytes());
    }

    /// Space comes back when the distributor reports the last worker done.
    fn drain_completions(&mut self) {
        while let Some(id) = self.producer.try_receive_completion() {
            self.buffer.free(id);
        }
    }

    /// Assemblies that outlived their deadline complete incomplete.
    fn check_timeouts(&mut self, now: Instant) {
        let overdue: Vec<StId> = self
            .assemblies
            .iter()
            .filter(|(_, a)| a.deadline <= now && !a.remaining.is_empty())
            .map(|(&id, _)| id)
            .collect();
        for id in overdue {
            warn!("{id}| assembly timed out, finishing incomplete");
            if let Some(assembly) = self.assemblies.get_mut(&id) {
                assembly.remaining.clear();
                assembly.incomplete = true;
            }
            self.finish_assembly(id);
        }
    }
}

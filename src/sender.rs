// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Subtimeslice sender: owns the process's one connection to the
// timeslice scheduler, accepts connections from timeslice builders, and
// serves announced subtimeslices on demand with gathered sends straight
// from the channel arena.
//
// Producer threads push announcements and retractions into mutex-guarded
// queues and kick the worker; every announced id eventually produces
// exactly one local completion (served, retracted, or flushed on a
// scheduler disconnect).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use mio::Waker;

use crate::protocol::{
    pack_header, unpack_header, AM_BUILDER_REQUEST_ST, AM_SCHED_RELEASE_ST, AM_SENDER_ANNOUNCE_ST,
    AM_SENDER_REGISTER, AM_SENDER_RETRACT_ST, AM_SENDER_SEND_ST,
};
use crate::subtimeslice::{
    DataDescriptor, ShmIovec, StComponentDescriptor, StDescriptor, StId, SubTimesliceHandle,
};
use crate::system::StopToken;
use crate::transport::{
    parse_address, AmWorker, Body, EndpointId, IoSegment, SendToken, TransportEvent,
};

/// Default scheduler listen port.
pub const DEFAULT_SCHEDULER_PORT: u16 = 13130;
/// Default sender listen port.
pub const DEFAULT_SENDER_PORT: u16 = 13131;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Read-only base of the arena the announced iovecs point into.
#[derive(Clone, Copy)]
pub struct ArenaRef {
    base: *const u8,
    len: u64,
}

unsafe impl Send for ArenaRef {}

impl ArenaRef {
    /// # Safety
    /// `base..base+len` must stay mapped for the sender's lifetime.
    pub unsafe fn new(base: *const u8, len: u64) -> Self {
        Self { base, len }
    }

    fn segment(&self, iov: &ShmIovec) -> IoSegment {
        assert!(iov.offset + iov.len <= self.len, "iovec outside the arena");
        IoSegment {
            ptr: unsafe { self.base.add(iov.offset as usize) },
            len: iov.len as usize,
        }
    }
}

struct PendingQueues {
    announcements: VecDeque<(StId, SubTimesliceHandle)>,
    retractions: VecDeque<StId>,
}

struct SenderShared {
    queues: Mutex<PendingQueues>,
    completions: Mutex<VecDeque<StId>>,
    stopped: AtomicBool,
}

/// Producer-side handle: announce/retract subtimeslices, poll completions.
#[derive(Clone)]
pub struct SenderHandle {
    shared: Arc<SenderShared>,
    waker: Arc<Waker>,
}

impl SenderHandle {
    /// Queue a subtimeslice announcement.
    pub fn announce_subtimeslice(&self, id: StId, st: SubTimesliceHandle) {
        {
            let mut q = self.shared.queues.lock().unwrap();
            q.announcements.push_back((id, st));
        }
        let _ = self.waker.wake();
    }

    /// Withdraw an announcement. An id still sitting in the announcement
    /// queue short-circuits to a local completion without touching the wire.
    pub fn retract_subtimeslice(&self, id: StId) {
        {
            let mut q = self.shared.queues.lock().unwrap();
            if let Some(pos) = q.announcements.iter().position(|(i, _)| *i == id) {
                q.announcements.remove(pos);
                self.shared.completions.lock().unwrap().push_back(id);
                return;
            }
            q.retractions.push_back(id);
        }
        let _ = self.waker.wake();
    }

    /// Pop one completed id, if any.
    pub fn try_receive_completion(&self) -> Option<StId> {
        self.shared.completions.lock().unwrap().pop_front()
    }

    /// Whether the sender loop has terminated.
    pub fn has_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

struct Announced {
    desc: Vec<u8>,
    iovecs: Vec<ShmIovec>,
    content_size: u64,
}

enum SenderTask {
    TrySchedConnect,
}

/// The subtimeslice sender worker. Runs on its own thread via [`run`].
pub struct StSender {
    worker: AmWorker,
    shared: Arc<SenderShared>,
    arena: ArenaRef,
    sender_id: String,
    listen_port: u16,
    sched_host: String,
    sched_port: u16,
    sched_ep: Option<EndpointId>,
    sched_registered: bool,
    announced: HashMap<StId, Announced>,
    active_send_requests: HashMap<SendToken, StId>,
    tasks: crate::timer::TaskQueue<SenderTask>,
}

impl StSender {
    pub fn new(
        listen_port: u16,
        sender_id: String,
        tssched_address: &str,
        arena: ArenaRef,
    ) -> std::io::Result<(Self, SenderHandle)> {
        let worker = AmWorker::new()?;
        let shared = Arc::new(SenderShared {
            queues: Mutex::new(PendingQueues {
                announcements: VecDeque::new(),
                retractions: VecDeque::new(),
            }),
            completions: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
        });
        let handle = SenderHandle {
            shared: Arc::clone(&shared),
            waker: worker.waker(),
        };
        let (sched_host, sched_port) = parse_address(tssched_address, DEFAULT_SCHEDULER_PORT);
        Ok((
            Self {
                worker,
                shared,
                arena,
                sender_id,
                listen_port,
                sched_host,
                sched_port,
                sched_ep: None,
                sched_registered: false,
                announced: HashMap::new(),
                active_send_requests: HashMap::new(),
                tasks: crate::timer::TaskQueue::new(),
            },
            handle,
        ))
    }

    /// The cooperative worker loop: progress the transport, drain the
    /// queues, run timer tasks, block up to one second.
    pub fn run(mut self, stop: StopToken) {
        crate::system::set_thread_name("st-sender");

        if let Err(e) = self.worker.listen(self.listen_port) {
            error!("failed to listen on port {}: {e}", self.listen_port);
            self.shared.stopped.store(true, Ordering::Release);
            return;
        }
        self.try_sched_connect();

        let mut events = Vec::new();
        while !stop.stop_requested() {
            let now = Instant::now();
            let timeout = match self.tasks.when_next() {
                Some(when) => when.saturating_duration_since(now).min(POLL_TIMEOUT),
                None => POLL_TIMEOUT,
            };
            if let Err(e) = self.worker.poll_events(Some(timeout), &mut events) {
                error!("transport poll failed: {e}");
                break;
            }
            for event in events.drain(..) {
                self.handle_event(event);
            }
            self.handle_queues();
            let now = Instant::now();
            while let Some(task) = self.tasks.pop_due(now) {
                match task {
                    SenderTask::TrySchedConnect => self.try_sched_connect(),
                }
            }
        }

        self.sched_disconnect();
        self.shared.stopped.store(true, Ordering::Release);
        info!("subtimeslice sender stopped");
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
            .add(SenderTask::TrySchedConnect, Instant::now() + RECONNECT_INTERVAL);
    }

    fn sched_register(&mut self) {
        let ep = match self.sched_ep {
            Some(ep) => ep,
            None => return,
        };
        let header = self.sender_id.clone().into_bytes();
        match self.worker.send(ep, AM_SENDER_REGISTER, header, Body::None) {
            Ok(_) => {
                self.sched_registered = true;
                info!("registered with scheduler as '{}'", self.sender_id);
            }
            Err(e) => error!("failed to send registration message: {e}"),
        }
    }

    /// Scheduler gone: every announced id completes locally so the
    /// builder loop can release its buffer space.
    fn sched_disconnect(&mut self) {
        self.sched_registered = false;
        if let Some(ep) = self.sched_ep.take() {
            self.worker.close(ep, false);
        }
        let flushed: Vec<StId> = self.announced.drain().map(|(id, _)| id).collect();
        for id in flushed {
            debug!("{id}| flushing announced subtimeslice");
            self.put_completion(id);
        }
    }

    // --- events ---

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { ep } => {
                if Some(ep) == self.sched_ep {
                    info!("connected to scheduler");
                    self.sched_register();
                }
            }
            TransportEvent::Accepted { ep, peer } => {
                debug!("accepted builder connection from {peer} as endpoint {ep}");
            }
            TransportEvent::Message {
                ep,
                am_id,
                header,
                body,
                ..
            } => self.handle_message(ep, am_id, &header, &body),
            TransportEvent::SendComplete { token, .. } => {
                if let Some(id) = self.active_send_requests.remove(&token) {
                    trace!("{id}| subtimeslice send completed");
                    self.put_completion(id);
                }
            }
            TransportEvent::SendFailed { token, .. } => {
                if let Some(id) = self.active_send_requests.remove(&token) {
                    error!("{id}| subtimeslice send failed");
                    self.put_completion(id);
                }
            }
            TransportEvent::Disconnected { ep, error } => {
                if Some(ep) == self.sched_ep {
                    match error {
                        Some(e) => error!("scheduler link failed: {e}"),
                        None => info!("scheduler closed the connection"),
                    }
                    self.sched_disconnect();
                } else {
                    debug!("builder endpoint {ep} disconnected");
                }
            }
        }
    }

    fn handle_message(&mut self, ep: EndpointId, am_id: u64, header: &[u8], body: &[u8]) {
        match am_id {
            AM_SCHED_RELEASE_ST => {
                let Some(hdr) = unpack_header(header, 1) else {
                    error!("invalid release message received");
                    return;
                };
                let id = hdr[0];
                if self.announced.remove(&id).is_some() {
                    debug!("{id}| released by scheduler");
                    self.put_completion(id);
                } else {
                    warn!("{id}| release for unknown subtimeslice");
                }
            }
            AM_BUILDER_REQUEST_ST => {
                let Some(hdr) = unpack_header(header, 1) else {
                    error!("invalid builder request received");
                    return;
                };
                if !body.is_empty() {
                    error!("invalid builder request received");
                    return;
                }
                self.serve_builder_request(ep, hdr[0]);
            }
            _ => {
                error!("unexpected message id {am_id} on endpoint {ep}");
            }
        }
    }

    /// Zero-copy reply to a builder pull: descriptor bytes first, then the
    /// content ranges straight out of the arena. Unknown ids get an empty
    /// reply.
    fn serve_builder_request(&mut self, ep: EndpointId, id: StId) {
        trace!("{id}| builder request on endpoint {ep}");

        let Some(st) = self.announced.remove(&id) else {
            warn!("{id}| requested subtimeslice not found");
            let header = pack_header(&[id, 0, 0]);
            if let Err(e) = self.worker.send(ep, AM_SENDER_SEND_ST, header, Body::None) {
                error!("{id}| failed to send empty reply: {e}");
            }
            return;
        };

        let header = pack_header(&[id, st.desc.len() as u64, st.content_size]);
        let segments: Vec<IoSegment> = st.iovecs.iter().map(|v| self.arena.segment(v)).collect();
        let body = Body::Gather {
            owned: st.desc,
            segments,
        };
        match self.worker.send(ep, AM_SENDER_SEND_ST, header, body) {
            Ok(token) => {
                self.active_send_requests.insert(token, id);
            }
            Err(e) => {
                error!("{id}| failed to send subtimeslice: {e}");
                self.put_completion(id);
            }
        }
    }

    // --- queues ---

    fn handle_queues(&mut self) {
        let (announcements, retractions) = {
            let mut guard = self.shared.queues.lock().unwrap();
            let q = &mut *guard;
            if q.announcements.is_empty() && q.retractions.is_empty() {
                return;
            }
            (
                std::mem::take(&mut q.announcements),
                std::mem::take(&mut q.retractions),
            )
        };

        if !self.sched_registered {
            trace!("scheduler not registered, completing announcements locally");
            for (id, _) in announcements {
                self.put_completion(id);
            }
            for id in retractions {
                self.handle_retraction(id);
            }
            return;
        }

        for id in retractions {
            self.handle_retraction(id);
        }
        for (id, st) in announcements {
            self.handle_announcement(id, st);
        }
    }

    fn handle_retraction(&mut self, id: StId) {
        if self.announced.remove(&id).is_some() {
            debug!("{id}| retracting subtimeslice");
            if let Some(ep) = self.sched_ep {
                let header = pack_header(&[id]);
                if let Err(e) = self
                    .worker
                    .send(ep, AM_SENDER_RETRACT_ST, header, Body::None)
                {
                    error!("{id}| failed to send retraction: {e}");
                }
            }
            self.put_completion(id);
        } else {
            warn!("{id}| attempted to retract unknown subtimeslice");
        }
    }

    /// Lay the component blocks out back to back, serialize the resulting
    /// descriptor and announce it to the scheduler. The iovec list is kept
    /// for the eventual builder pull.
    fn handle_announcement(&mut self, id: StId, st: SubTimesliceHandle) {
        let mut desc = StDescriptor {
            start_time_ns: st.start_time_ns,
            duration_ns: st.duration_ns,
            flags: st.flags,
            components: Vec::new(),
        };
        let mut iovecs = Vec::new();
        let mut offset: u64 = 0;

        for c in &st.components {
            let descriptors_size = c.descriptors_size();
            iovecs.extend_from_slice(&c.descriptors);
            let descriptor = DataDescriptor {
                offset,
                size: descriptors_size,
            };
            offset += descriptors_size;

            let contents_size = c.contents_size();
            iovecs.extend_from_slice(&c.contents);
            let content = DataDescriptor {
                offset,
                size: contents_size,
            };
            offset += contents_size;

            desc.components.push(StComponentDescriptor {
                descriptor,
                content,
                missing_microslices: c.missing_microslices,
            });
        }

        let desc_bytes = desc.to_bytes();
        let header = pack_header(&[id, desc_bytes.len() as u64, offset]);

        let ep = match self.sched_ep {
            Some(ep) => ep,
            None => {
                self.put_completion(id);
                return;
            }
        };
        if let Err(e) = self.worker.send(
            ep,
            AM_SENDER_ANNOUNCE_ST,
            header,
            Body::Bytes(desc_bytes.clone()),
        ) {
            error!("{id}| failed to announce subtimeslice: {e}");
            self.put_completion(id);
            return;
        }
        trace!("{id}| announced subtimeslice, {} components", desc.components.len());

        self.announced.insert(
            id,
            Announced {
                desc: desc_bytes,
                iovecs,
                content_size: offset,
            },
        );
    }

    fn put_completion(&self, id: StId) {
        self.shared.completions.lock().unwrap().push_back(id);
    }
}

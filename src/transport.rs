// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Active-message transport: small typed messages (id + packed header +
// optional body) over non-blocking TCP, driven by a single poll loop.
// Bodies can be gathered from shared-memory ranges without copying into
// the send path. Cross-thread inputs kick the loop through the waker.
//
// The owning thread repeatedly: (a) progresses the worker, (b) drains
// its queues, (c) runs timer tasks, (d) blocks on the poll with a
// bounded timeout. All endpoint state is mutated only on that thread.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use thiserror::Error;

/// Frame flag: the header was copied at send time (always set).
pub const FLAG_COPY_HEADER: u64 = 1 << 0;
/// Frame flag: rendezvous transfer requested for a large payload.
pub const FLAG_RNDV: u64 = 1 << 1;

/// Payloads above this size are flagged for rendezvous delivery.
pub const RNDV_THRESHOLD: usize = 8192;

const FRAME_HDR_LEN: usize = 32;
const MAX_HEADER_LEN: u64 = 1 << 20;
const MAX_BODY_LEN: u64 = 1 << 30;

const TOKEN_WAKER: Token = Token(usize::MAX - 1);
const TOKEN_LISTENER: Token = Token(usize::MAX - 2);

/// Connection identity within one worker.
pub type EndpointId = usize;

/// Identifies an in-flight send until its completion event.
pub type SendToken = u64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to resolve address '{0}'")]
    Resolve(String),
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One byte range of a gathered send body.
///
/// Raw-pointer based so announced subtimeslices can reference the channel
/// rings without copying; the referenced arena outlives the worker.
#[derive(Debug, Clone, Copy)]
pub struct IoSegment {
    pub ptr: *const u8,
    pub len: usize,
}

unsafe impl Send for IoSegment {}

/// Body of an outgoing message.
pub enum Body {
    None,
    /// An owned byte buffer.
    Bytes(Vec<u8>),
    /// An owned prefix (e.g. a serialized descriptor) followed by borrowed
    /// shared-memory ranges, written back to back.
    Gather {
        owned: Vec<u8>,
        segments: Vec<IoSegment>,
    },
}

impl Body {
    fn len(&self) -> u64 {
        match self {
            Body::None => 0,
            Body::Bytes(b) => b.len() as u64,
            Body::Gather { owned, segments } => {
                owned.len() as u64 + segments.iter().map(|s| s.len as u64).sum::<u64>()
            }
        }
    }
}

/// Events produced by the worker.
#[derive(Debug)]
pub enum TransportEvent {
    /// An outbound connection is established.
    Connected { ep: EndpointId },
    /// An inbound connection was accepted on the listener.
    Accepted { ep: EndpointId, peer: SocketAddr },
    /// A complete message arrived.
    Message {
        ep: EndpointId,
        am_id: u64,
        flags: u64,
        header: Vec<u8>,
        body: Vec<u8>,
    },
    /// A send was fully handed to the kernel; its referenced memory may be
    /// reused.
    SendComplete { ep: EndpointId, token: SendToken },
    /// A send was dropped because the connection failed first.
    SendFailed { ep: EndpointId, token: SendToken },
    /// The endpoint is gone (peer close or error).
    Disconnected {
        ep: EndpointId,
        error: Option<String>,
    },
}

struct PendingSend {
    token: SendToken,
    frame_hdr: [u8; FRAME_HDR_LEN],
    header: Vec<u8>,
    body: Body,
    written: usize,
}

impl PendingSend {
    fn total_len(&self) -> usize {
        FRAME_HDR_LEN + self.header.len() + self.body.len() as usize
    }

    /// Remaining byte ranges starting at the write progress.
    fn remaining_slices(&self) -> Vec<IoSlice<'_>> {
        let mut chunks: Vec<(*const u8, usize)> = vec![
            (self.frame_hdr.as_ptr(), FRAME_HDR_LEN),
            (self.header.as_ptr(), self.header.len()),
        ];
        match &self.body {
            Body::None => {}
            Body::Bytes(b) => chunks.push((b.as_ptr(), b.len())),
            Body::Gather { owned, segments } => {
                chunks.push((owned.as_ptr(), owned.len()));
                for seg in segments {
                    chunks.push((seg.ptr, seg.len));
                }
            }
        }

        let mut slices = Vec::with_capacity(chunks.len());
        let mut skip = self.written;
        for (ptr, len) in chunks {
            if skip >= len {
                skip -= len;
                continue;
            }
            // Safety: every chunk points into self (frame header, header,
            // owned body) or into an arena range that the caller keeps
            // mapped until the send completes.
            let bytes = unsafe { std::slice::from_raw_parts(ptr.add(skip), len - skip) };
            slices.push(IoSlice::new(bytes));
            skip = 0;
        }
        slices
    }
}

enum ConnState {
    Connecting,
    Open,
}

struct Connection {
    stream: TcpStream,
    state: ConnState,
    read_buf: Vec<u8>,
    send_queue: VecDeque<PendingSend>,
}

/// The active-message worker: listener, endpoints, poll loop.
pub struct AmWorker {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    listener: Option<TcpListener>,
    conns: Slab<Connection>,
    next_send_token: SendToken,
    /// Events generated outside the poll step (immediate completions).
    pending: VecDeque<TransportEvent>,
}

impl AmWorker {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), TOKEN_WAKER)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            waker,
            listener: None,
            conns: Slab::new(),
            next_send_token: 0,
            pending: VecDeque::new(),
        })
    }

    /// Handle for waking the poll from other threads.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Start accepting connections on `port` (all interfaces).
    pub fn listen(&mut self, port: u16) -> io::Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
        let mut listener = TcpListener::bind(addr)?;
        self.poll
            .registry()
            .register(&mut listener, TOKEN_LISTENER, Interest::READABLE)?;
        debug!("listening for connections on port {port}");
        self.listener = Some(listener);
        Ok(())
    }

    /// The local listener port (useful when bound to port 0).
    pub fn listen_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    /// Open a connection to `host:port`. Completion is reported through a
    /// `Connected` (or `Disconnected`) event.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<EndpointId, TransportError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve(format!("{host}:{port}")))?
            .next()
            .ok_or_else(|| TransportError::Resolve(format!("{host}:{port}")))?;

        let mut stream = TcpStream::connect(addr)?;
        let entry = self.conns.vacant_entry();
        let ep = entry.key();
        self.poll.registry().register(
            &mut stream,
            Token(ep),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        entry.insert(Connection {
            stream,
            state: ConnState::Connecting,
            read_buf: Vec::new(),
            send_queue: VecDeque::new(),
        });
        trace!("connecting to {addr} as endpoint {ep}");
        Ok(ep)
    }

    /// Queue an active message. The returned token is echoed in the
    /// `SendComplete` / `SendFailed` event.
    pub fn send(
        &mut self,
        ep: EndpointId,
        am_id: u64,
        header: Vec<u8>,
        body: Body,
    ) -> Result<SendToken, TransportError> {
        if !self.conns.contains(ep) {
            return Err(TransportError::UnknownEndpoint(ep));
        }

        let mut flags = FLAG_COPY_HEADER;
        if body.len() as usize > RNDV_THRESHOLD {
            flags |= FLAG_RNDV;
        }

        let token = self.next_send_token;
        self.next_send_token += 1;

        let mut frame_hdr = [0u8; FRAME_HDR_LEN];
        frame_hdr[0..8].copy_from_slice(&am_id.to_le_bytes());
        frame_hdr[8..16].copy_from_slice(&flags.to_le_bytes());
        frame_hdr[16..24].copy_from_slice(&(header.len() as u64).to_le_bytes());
        frame_hdr[24..32].copy_from_slice(&body.len().to_le_bytes());

        self.conns[ep].send_queue.push_back(PendingSend {
            token,
            frame_hdr,
            header,
            body,
            written: 0,
        });

        // Eager flush; completions surface on the next poll step.
        if matches!(self.conns[ep].state, ConnState::Open) {
            self.flush_endpoint(ep);
        }
        Ok(token)
    }

    /// Drop an endpoint after a best-effort flush of queued sends.
    pub fn close(&mut self, ep: EndpointId, force: bool) {
        if !self.conns.contains(ep) {
            return;
        }
        if !force {
            self.flush_endpoint(ep);
        }
        if self.conns.contains(ep) {
            let mut conn = self.conns.remove(ep);
            let _ = self.poll.registry().deregister(&mut conn.stream);
            for p in conn.send_queue {
                self.pending.push_back(TransportEvent::SendFailed {
                    ep,
                    token: p.token,
                });
            }
        }
    }

    /// Whether the endpoint still exists.
    pub fn is_open(&self, ep: EndpointId) -> bool {
        self.conns.contains(ep)
    }

    /// Progress IO, then block up to `timeout` for new readiness. Events
    /// are appended to `out`.
    pub fn poll_events(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<TransportEvent>,
    ) -> io::Result<()> {
        // Immediate completions first; don't block while work is pending.
        let timeout = if self.pending.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        out.extend(self.pending.drain(..));

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        let writable: Vec<bool> = self.events.iter().map(|e| e.is_writable()).collect();
        for (i, token) in tokens.iter().enumerate() {
            match *token {
                TOKEN_WAKER => {} // queue kick; caller drains its queues
                TOKEN_LISTENER => self.accept_all(),
                Token(ep) => {
                    if writable[i] {
                        self.handle_writable(ep);
                    }
                    // reads only once the connection is established
                    let open = self
                        .conns
                        .get(ep)
                        .map_or(false, |c| matches!(c.state, ConnState::Open));
                    if open {
                        self.handle_readable(ep);
                    }
                }
            }
        }

        out.extend(self.pending.drain(..));
        Ok(())
    }

    // --- internal ---

    fn accept_all(&mut self) {
        loop {
            let listener = match &self.listener {
                Some(l) => l,
                None => return,
            };
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let entry = self.conns.vacant_entry();
                    let ep = entry.key();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(ep),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        error!("failed to register accepted connection: {e}");
                        continue;
                    }
                    entry.insert(Connection {
                        stream,
                        state: ConnState::Open,
                        read_buf: Vec::new(),
                        send_queue: VecDeque::new(),
                    });
                    debug!("accepted connection from {peer} as endpoint {ep}");
                    self.pending.push_back(TransportEvent::Accepted { ep, peer });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn handle_writable(&mut self, ep: EndpointId) {
        if !self.conns.contains(ep) {
            return;
        }
        if matches!(self.conns[ep].state, ConnState::Connecting) {
            // Connect completion: an error is reported via take_error.
            match self.conns[ep].stream.take_error() {
                Ok(None) => {
                    if self.conns[ep].stream.peer_addr().is_ok() {
                        self.conns[ep].state = ConnState::Open;
                        self.pending.push_back(TransportEvent::Connected { ep });
                    } else {
                        return; // still in progress
                    }
                }
                Ok(Some(e)) => {
                    self.drop_endpoint(ep, Some(e.to_string()));
                    return;
                }
                Err(e) => {
                    self.drop_endpoint(ep, Some(e.to_string()));
                    return;
                }
            }
        }
        self.flush_endpoint(ep);
    }

    /// Write queued frames until done or the socket blocks. Completed
    /// frames produce `SendComplete` events.
    fn flush_endpoint(&mut self, ep: EndpointId) {
        enum Outcome {
            Progress,
            Completed(SendToken),
            Blocked,
            Idle,
            Failed(String),
        }

        loop {
            let outcome = {
                let conn = match self.conns.get_mut(ep) {
                    Some(c) => c,
                    None => return,
                };
                let stream = &mut conn.stream;
                match conn.send_queue.front_mut() {
                    None => Outcome::Idle,
                    Some(front) => {
                        let slices = front.remaining_slices();
                        match stream.write_vectored(&slices) {
                            Ok(0) => Outcome::Failed("connection closed during send".into()),
                            Ok(n) => {
                                front.written += n;
                                if front.written >= front.total_len() {
                                    let token = front.token;
                                    conn.send_queue.pop_front();
                                    Outcome::Completed(token)
                                } else {
                                    Outcome::Progress
                                }
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Outcome::Blocked,
                            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                                Outcome::Progress
                            }
                            Err(e) => Outcome::Failed(e.to_string()),
                        }
                    }
                }
            };
            match outcome {
                Outcome::Progress => {}
                Outcome::Completed(token) => {
                    self.pending
                        .push_back(TransportEvent::SendComplete { ep, token });
                }
                Outcome::Blocked | Outcome::Idle => return,
                Outcome::Failed(e) => {
                    self.drop_endpoint(ep, Some(e));
                    return;
                }
            }
        }
    }

    fn handle_readable(&mut self, ep: EndpointId) {
        let mut buf = [0u8; 65536];
        loop {
            let conn = match self.conns.get_mut(ep) {
                Some(c) => c,
                None => return,
            };
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    self.drop_endpoint(ep, None);
                    return;
                }
                Ok(n) => {
                    conn.read_buf.extend_from_slice(&buf[..n]);
                    if !self.parse_frames(ep) {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.drop_endpoint(ep, Some(e.to_string()));
                    return;
                }
            }
        }
    }

    /// Extract complete frames from the read buffer. Returns `false` if the
    /// endpoint was dropped on a malformed frame.
    fn parse_frames(&mut self, ep: EndpointId) -> bool {
        let mut consumed = 0;
        loop {
            let conn = &self.conns[ep];
            let buf = &conn.read_buf[consumed..];
            if buf.len() < FRAME_HDR_LEN {
                break;
            }
            let am_id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
            let flags = u64::from_le_bytes(buf[8..16].try_into().unwrap());
            let header_len = u64::from_le_bytes(buf[16..24].try_into().unwrap());
            let body_len = u64::from_le_bytes(buf[24..32].try_into().unwrap());

            if header_len > MAX_HEADER_LEN || body_len > MAX_BODY_LEN {
                error!("endpoint {ep}: oversized frame ({header_len}+{body_len}), resetting");
                self.conns[ep].read_buf.drain(..consumed);
                self.drop_endpoint(ep, Some("oversized frame".into()));
                return false;
            }

            let total = FRAME_HDR_LEN + header_len as usize + body_len as usize;
            if buf.len() < total {
                break;
            }
            let header = buf[FRAME_HDR_LEN..FRAME_HDR_LEN + header_len as usize].to_vec();
            let body = buf[FRAME_HDR_LEN + header_len as usize..total].to_vec();
            consumed += total;
            trace!(
                "endpoint {ep}: message am_id={am_id} header={}B body={}B",
                header.len(),
                body.len()
            );
            self.pending.push_back(TransportEvent::Message {
                ep,
                am_id,
                flags,
                header,
                body,
            });
        }
        if consumed > 0 {
            self.conns[ep].read_buf.drain(..consumed);
        }
        true
    }

    fn drop_endpoint(&mut self, ep: EndpointId, error: Option<String>) {
        if !self.conns.contains(ep) {
            return;
        }
        let mut conn = self.conns.remove(ep);
        let _ = self.poll.registry().deregister(&mut conn.stream);
        for p in conn.send_queue {
            self.pending.push_back(TransportEvent::SendFailed {
                ep,
                token: p.token,
            });
        }
        self.pending
            .push_back(TransportEvent::Disconnected { ep, error });
    }
}

/// Split `host[:port]` into host and port, falling back to `default_port`.
pub fn parse_address(address: &str, default_port: u16) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) => (host.to_owned(), p),
            Err(_) => (address.to_owned(), default_port),
        },
        None => (address.to_owned(), default_port),
    }
}

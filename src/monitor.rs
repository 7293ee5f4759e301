// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Telemetry: components queue metrics into a mutex-guarded vector; a
// dedicated sink thread drains it into one or more sinks with a 10 s
// flush timeout. Queuing never blocks the data path.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};

const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// Queue length at which the sink thread is kicked early.
const QUEUE_PRESSURE: usize = 1024;

/// A metric field value (InfluxDB line protocol types).
#[derive(Debug, Clone)]
pub enum FieldValue {
    F64(f64),
    U64(u64),
    I64(i64),
    Bool(bool),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}
impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        Self::F64(f64::from(v))
    }
}
impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}
impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}
impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// One measurement point.
#[derive(Debug, Clone)]
pub struct Metric {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp_ns: u64,
}

/// Where drained metrics go.
trait MonitorSink: Send {
    fn flush(&mut self, metrics: &[Metric]);
}

struct Queue {
    metrics: Vec<Metric>,
    shutdown: bool,
}

struct Inner {
    queue: Mutex<Queue>,
    kick: Condvar,
}

/// Telemetry hub. Clone-cheap handle; dropping the last handle stops the
/// sink thread after a final flush.
pub struct Monitor {
    inner: Arc<Inner>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Monitor {
    /// Create a monitor from a sink URI:
    /// `file:PATH` or `influx1:HOST:PORT:DATABASE`.
    pub fn new(uri: &str) -> io::Result<Self> {
        let sink = make_sink(uri)?;
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue {
                metrics: Vec::new(),
                shutdown: false,
            }),
            kick: Condvar::new(),
        });
        let thread = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("monitor".into())
                .spawn(move || sink_loop(&inner, sink))
                .expect("failed to spawn monitor thread")
        };
        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    /// Queue a metric point; never blocks on IO.
    pub fn queue_metric(
        &self,
        measurement: &str,
        tags: Vec<(String, String)>,
        fields: Vec<(String, FieldValue)>,
    ) {
        let metric = Metric {
            measurement: measurement.to_owned(),
            tags,
            fields,
            timestamp_ns: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
        };
        let mut q = self.inner.queue.lock().unwrap();
        q.metrics.push(metric);
        if q.metrics.len() >= QUEUE_PRESSURE {
            self.inner.kick.notify_one();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        {
            let mut q = self.inner.queue.lock().unwrap();
            q.shutdown = true;
        }
        self.inner.kick.notify_one();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn sink_loop(inner: &Inner, mut sink: Box<dyn MonitorSink>) {
    crate::system::set_thread_name("monitor");
    let mut q = inner.queue.lock().unwrap();
    loop {
        let shutdown = q.shutdown;
        let mut batch = std::mem::take(&mut q.metrics);
        drop(q);

        if !batch.is_empty() {
            // self-observation point appended to every flush
            batch.push(Metric {
                measurement: "Monitor".to_owned(),
                tags: Vec::new(),
                fields: vec![("points".to_owned(), FieldValue::U64(batch.len() as u64))],
                timestamp_ns: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0),
            });
            sink.flush(&batch);
        }
        if shutdown {
            return;
        }

        q = inner.queue.lock().unwrap();
        if q.metrics.is_empty() && !q.shutdown {
            let (guard, _) = inner.kick.wait_timeout(q, FLUSH_INTERVAL).unwrap();
            q = guard;
        }
    }
}

fn make_sink(uri: &str) -> io::Result<Box<dyn MonitorSink>> {
    if let Some(path) = uri.strip_prefix("file:") {
        return Ok(Box::new(FileSink {
            path: path.to_owned(),
        }));
    }
    if let Some(rest) = uri.strip_prefix("influx1:") {
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 3 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid influx1 URI '{uri}', expected influx1:HOST:PORT:DATABASE"),
            ));
        }
        let port: u16 = parts[1].parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port in '{uri}'"))
        })?;
        return Ok(Box::new(InfluxSink {
            host: parts[0].to_owned(),
            port,
            database: parts[2].to_owned(),
        }));
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unknown monitor URI scheme '{uri}'"),
    ))
}

// ---------------------------------------------------------------------------
// Line protocol
// ---------------------------------------------------------------------------

fn escape_tag(out: &mut String, s: &str) {
    for c in s.chars() {
        if c == ',' || c == ' ' || c == '=' {
            out.push('\\');
        }
        out.push(c);
    }
}

fn format_lines(metrics: &[Metric]) -> String {
    let mut out = String::new();
    for m in metrics {
        escape_tag(&mut out, &m.measurement);
        for (k, v) in &m.tags {
            out.push(',');
            escape_tag(&mut out, k);
            out.push('=');
            escape_tag(&mut out, v);
        }
        out.push(' ');
        for (i, (k, v)) in m.fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            escape_tag(&mut out, k);
            out.push('=');
            match v {
                FieldValue::F64(x) => {
                    let _ = write!(out, "{x}");
                }
                FieldValue::U64(x) => {
                    let _ = write!(out, "{x}u");
                }
                FieldValue::I64(x) => {
                    let _ = write!(out, "{x}i");
                }
                FieldValue::Bool(x) => {
                    let _ = write!(out, "{x}");
                }
            }
        }
        let _ = writeln!(out, " {}", m.timestamp_ns);
    }
    out
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

struct FileSink {
    path: String,
}

impl MonitorSink for FileSink {
    fn flush(&mut self, metrics: &[Metric]) {
        let lines = format_lines(metrics);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(lines.as_bytes()));
        if let Err(e) = result {
            warn!("monitor: failed to write metrics to '{}': {e}", self.path);
        }
    }
}

struct InfluxSink {
    host: String,
    port: u16,
    database: String,
}

impl MonitorSink for InfluxSink {
    fn flush(&mut self, metrics: &[Metric]) {
        let body = format_lines(metrics);
        if let Err(e) = self.post(&body) {
            warn!(
                "monitor: failed to post {} metrics to influx at {}:{}: {e}",
                metrics.len(),
                self.host,
                self.port
            );
        } else {
            debug!("monitor: posted {} metric lines", metrics.len());
        }
    }
}

impl InfluxSink {
    fn post(&self, body: &str) -> io::Result<()> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        let request = format!(
            "POST /write?db={}&precision=ns HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            self.database,
            self.host,
            self.port,
            body.len()
        );
        stream.write_all(request.as_bytes())?;
        stream.write_all(body.as_bytes())?;

        let mut response = String::new();
        stream.take(4096).read_to_string(&mut response)?;
        let status = response
            .lines()
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .unwrap_or("");
        if !status.starts_with('2') {
            error!("monitor: influx returned status {status}");
        }
        Ok(())
    }
}

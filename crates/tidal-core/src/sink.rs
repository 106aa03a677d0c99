//! Delivery targets.
//!
//! A sink receives every published batch, in order, from exactly one worker
//! at a time. Sinks are created from a textual specification
//! (`"<name> <params>"`, several joined by `;`) through a [`SinkRegistry`];
//! names that are not registered are loaded as plugins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tidal_metrics::{EpochClock, LatencyHistogram};
use tidal_proto::Message;
use tidal_ring::{RingError, RingMode, RingWriter, WriterOptions};

use crate::error::SinkError;
use crate::plugin::PluginSink;

/// A delivery target. Dropping the sink destroys it.
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Deliver one batch. A failed batch is not retried.
    fn deliver(&mut self, messages: &[Message]) -> Result<(), SinkError>;
}

/// Creates a sink from the parameter part of its specification.
pub type SinkFactory = fn(&str) -> Result<Box<dyn Sink>, SinkError>;

/// Split `"<name> <params>"` at the first space.
pub fn split_spec(spec: &str) -> (&str, &str) {
    let spec = spec.trim();
    match spec.split_once(char::is_whitespace) {
        Some((name, params)) => (name, params.trim()),
        None => (spec, ""),
    }
}

pub struct SinkRegistry {
    factories: HashMap<String, SinkFactory>,
    plugin_dir: PathBuf,
}

impl SinkRegistry {
    /// Registry without any sink.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            plugin_dir: PathBuf::from("."),
        }
    }

    /// Registry with the `log`, `latency` and `mmap` sinks.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("log", LogSink::create);
        registry.register("latency", LatencySink::create);
        registry.register("mmap", MmapSink::create);
        registry
    }

    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Register `factory` under `name`, returning the factory it replaces.
    pub fn register(&mut self, name: &str, factory: SinkFactory) -> Option<SinkFactory> {
        self.factories.insert(name.to_string(), factory)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Create a sink from `spec`; `;` separated parts become a [`SinkChain`].
    pub fn create(&self, spec: &str) -> Result<Box<dyn Sink>, SinkError> {
        let parts: Vec<&str> = spec
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        match parts.as_slice() {
            [] => Err(SinkError::Empty),
            [single] => self.create_one(single),
            _ => {
                let sinks = parts
                    .iter()
                    .map(|part| self.create_one(part))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Box::new(SinkChain::new(sinks)))
            }
        }
    }

    fn create_one(&self, spec: &str) -> Result<Box<dyn Sink>, SinkError> {
        let (name, params) = split_spec(spec);
        let sink = match self.factories.get(name) {
            Some(factory) => factory(params)?,
            None => Box::new(PluginSink::load(&self.plugin_dir, name, params)?),
        };
        tracing::info!(sink = %sink.name(), params, "sink created");
        Ok(sink)
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Several sinks fed from one cursor, in order.
pub struct SinkChain {
    name: String,
    sinks: Vec<Box<dyn Sink>>,
}

impl SinkChain {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        let name = sinks.iter().map(|s| s.name()).collect::<Vec<_>>().join(";");
        Self { name, sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Sink for SinkChain {
    fn name(&self) -> &str {
        &self.name
    }

    /// Every member sees the batch; the first failure is reported.
    fn deliver(&mut self, messages: &[Message]) -> Result<(), SinkError> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.deliver(messages) {
                tracing::warn!(sink = %sink.name(), error = %e, "chained sink failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Writes one log line per record.
pub struct LogSink {
    name: String,
    records: u64,
}

impl LogSink {
    pub fn create(params: &str) -> Result<Box<dyn Sink>, SinkError> {
        let name = match params {
            "" => "log".to_string(),
            label => format!("log:{label}"),
        };
        Ok(Box::new(Self { name, records: 0 }))
    }
}

impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, messages: &[Message]) -> Result<(), SinkError> {
        for msg in messages {
            tracing::info!(target: "tidal::records", sink = %self.name, "{msg}");
        }
        self.records += messages.len() as u64;
        Ok(())
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        tracing::debug!(sink = %self.name, records = self.records, "log sink closed");
    }
}

/// Histogram of engine-to-sink latency, reported every `report_every` records.
pub struct LatencySink {
    histogram: LatencyHistogram,
    clock: EpochClock,
    report_every: u64,
    pending: u64,
}

impl LatencySink {
    pub const DEFAULT_REPORT_EVERY: u64 = 100_000;

    pub fn create(params: &str) -> Result<Box<dyn Sink>, SinkError> {
        let report_every = match params {
            "" => Self::DEFAULT_REPORT_EVERY,
            n => n
                .parse::<u64>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| SinkError::params("latency", format!("bad report interval '{n}'")))?,
        };
        Ok(Box::new(Self::new(report_every)))
    }

    pub fn new(report_every: u64) -> Self {
        Self {
            histogram: LatencyHistogram::new(),
            clock: EpochClock::new(),
            report_every,
            pending: 0,
        }
    }

    pub fn histogram(&self) -> &LatencyHistogram {
        &self.histogram
    }
}

impl Sink for LatencySink {
    fn name(&self) -> &str {
        "latency"
    }

    fn deliver(&mut self, messages: &[Message]) -> Result<(), SinkError> {
        let now = self.clock.now_nanos();
        for msg in messages {
            let engine_time = msg.engine_time;
            if engine_time != 0 {
                self.histogram.record(now - engine_time);
                self.pending += 1;
            }
        }
        if self.pending >= self.report_every {
            self.histogram.log_summary("engine->sink");
            self.histogram.reset();
            self.pending = 0;
        }
        Ok(())
    }
}

impl Drop for LatencySink {
    fn drop(&mut self) {
        if self.histogram.count() > 0 {
            self.histogram.log_summary("engine->sink");
        }
    }
}

/// Forwards every batch to a cooperating process through a shared-memory ring.
///
/// Parameters: `<path> [pooling|blocking] [overload_timeout_secs]`. The ring
/// handshake runs in the background; batches delivered before a reader has
/// attached are dropped. A failed write closes the sink for good: every later
/// batch is rejected without touching the ring.
pub struct MmapSink {
    name: String,
    running: Arc<AtomicBool>,
    pending: Option<JoinHandle<Result<RingWriter, RingError>>>,
    writer: Option<RingWriter>,
    dropped: u64,
}

impl MmapSink {
    pub fn create(params: &str) -> Result<Box<dyn Sink>, SinkError> {
        let mut args = params.split_whitespace();
        let path = args
            .next()
            .map(PathBuf::from)
            .ok_or_else(|| SinkError::params("mmap", "missing ring path"))?;

        let mut options = WriterOptions::default();
        if let Some(mode) = args.next() {
            options.mode = match mode {
                "pooling" | "1" => RingMode::Pooling,
                "blocking" | "0" => RingMode::Blocking,
                other => return Err(SinkError::params("mmap", format!("bad mode '{other}'"))),
            };
        }
        if let Some(secs) = args.next() {
            let secs: u64 = secs
                .parse()
                .map_err(|_| SinkError::params("mmap", format!("bad overload timeout '{secs}'")))?;
            options.overload_timeout = Duration::from_secs(secs);
        }

        Ok(Box::new(Self::open(path, options)?))
    }

    pub fn open(path: PathBuf, options: WriterOptions) -> Result<Self, SinkError> {
        let name = format!("mmap:{}", path.display());
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let pending = std::thread::Builder::new()
            .name("tidal-mmap-handshake".into())
            .spawn(move || RingWriter::create(&path, options, &flag))
            .map_err(|e| SinkError::Delivery(format!("cannot start ring handshake: {e}")))?;

        Ok(Self {
            name,
            running,
            pending: Some(pending),
            writer: None,
            dropped: 0,
        })
    }

    /// Whether the reader side has attached.
    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    fn poll_handshake(&mut self) -> Result<(), SinkError> {
        if !self.pending.as_ref().is_some_and(|h| h.is_finished()) {
            return Ok(());
        }
        let Some(handle) = self.pending.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(Ok(writer)) => {
                tracing::info!(sink = %self.name, dropped = self.dropped, "ring reader attached");
                self.writer = Some(writer);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SinkError::Delivery("ring handshake thread panicked".into())),
        }
    }
}

impl Sink for MmapSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, messages: &[Message]) -> Result<(), SinkError> {
        if self.writer.is_none() {
            self.poll_handshake()?;
        }
        match self.writer.as_mut() {
            Some(writer) => match writer.write(messages) {
                Ok(()) => Ok(()),
                Err(e) => {
                    // A stalled or closed reader is not coming back on this ring.
                    tracing::error!(sink = %self.name, error = %e, "ring closed, dropping writer");
                    self.writer = None;
                    Err(e.into())
                }
            },
            None if self.pending.is_some() => {
                self.dropped += messages.len() as u64;
                Ok(())
            }
            None => Err(RingError::Closed.into()),
        }
    }
}

impl Drop for MmapSink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.pending.take() {
            let _ = handle.join();
        }
        if self.dropped > 0 {
            tracing::warn!(sink = %self.name, dropped = self.dropped, "records dropped before reader attached");
        }
    }
}

//! Delivery worker pool.
//!
//! Every sink has one [`Cursor`]: its position in the broadcast list. Cursors
//! circulate through a shared work queue; a worker pops one, delivers what
//! the sink has not seen yet, and pushes it back. Holding the cursor is what
//! gives a sink exclusive access, so a sink is never called concurrently.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use tidal_metrics::EpochClock;
use tidal_proto::Message;

use crate::error::{EngineError, Result, SinkError};
use crate::list::BroadcastList;
use crate::pool::NodeHandle;
use crate::shutdown::Shutdown;
use crate::sink::Sink;
use crate::slots::SlotRing;

/// Nodes a worker delivers to one sink before moving on to the next cursor.
pub const MAX_NODES_PER_TURN: usize = 64;

/// Idle period after which a flushed sink receives a heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub workers: usize,
    pub pooling: bool,
    pub idle_wait: Duration,
    pub respawn: bool,
    pub cpu_affinity: Vec<usize>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            pooling: false,
            idle_wait: Duration::from_micros(300),
            respawn: true,
            cpu_affinity: Vec::new(),
        }
    }
}

/// A sink together with its position in the broadcast list.
pub struct Cursor {
    sink: Box<dyn Sink>,
    /// Last node handed to the sink; we hold one reference on it.
    last: Option<NodeHandle>,
    /// Whether the last delivered record carried the flush flag.
    flushed: bool,
    last_activity: Instant,
    delivered: u64,
}

impl Cursor {
    /// Attach `sink` to `list`. It sees every node published from now on.
    pub fn new(sink: Box<dyn Sink>, list: &BroadcastList) -> Self {
        Self {
            sink,
            last: list.attach(),
            // An idle stream counts as flushed, so heartbeats start at once.
            flushed: true,
            last_activity: Instant::now(),
            delivered: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    pub fn last(&self) -> Option<NodeHandle> {
        self.last
    }

    /// Records delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Deliver up to `max_nodes` new nodes. Returns how many were passed.
    ///
    /// The cursor moves past a node before delivering it, so a failed batch
    /// is never delivered again.
    pub fn advance(&mut self, list: &BroadcastList, max_nodes: usize) -> std::result::Result<usize, SinkError> {
        let pool = list.pool();
        let mut passed = 0;
        while passed < max_nodes {
            let Some(next) = list.next(self.last) else {
                break;
            };
            if let Some(prev) = self.last.replace(next) {
                pool.release(prev);
            }
            passed += 1;

            let messages = pool.get(next).messages();
            let Some(tail) = messages.last() else {
                continue;
            };
            self.flushed = tail.is_flush();
            self.last_activity = Instant::now();
            self.deliver(messages)?;
        }
        Ok(passed)
    }

    /// Send a heartbeat if the stream is flushed and has been idle long enough.
    pub fn heartbeat(&mut self, clock: &EpochClock) -> std::result::Result<bool, SinkError> {
        if !self.flushed || self.last_activity.elapsed() < HEARTBEAT_INTERVAL {
            return Ok(false);
        }
        let now = clock.now_nanos();
        let mut ping = Message::heartbeat(now);
        ping.set_engine_time(now);
        ping.set_flush(true);
        self.last_activity = Instant::now();
        self.deliver(&[ping])?;
        Ok(true)
    }

    fn deliver(&mut self, messages: &[Message]) -> std::result::Result<(), SinkError> {
        let sink = &mut self.sink;
        match panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(messages))) {
            Ok(result) => result?,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                return Err(SinkError::Delivery(format!("sink panicked: {reason}")));
            }
        }
        self.delivered += messages.len() as u64;
        Ok(())
    }

    /// Leave the list, releasing every node the sink has not passed yet.
    pub fn detach(self, list: &BroadcastList) {
        list.detach(self.last);
    }
}

struct WorkerContext {
    list: Arc<BroadcastList>,
    queue: SlotRing<Box<Cursor>>,
    options: WorkerOptions,
    shutdown: Shutdown,
    clock: EpochClock,
    live: AtomicUsize,
    next_id: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Worker threads sharing the cursor queue.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
}

impl WorkerPool {
    pub fn start(
        list: Arc<BroadcastList>,
        sinks: Vec<Box<dyn Sink>>,
        options: WorkerOptions,
        shutdown: Shutdown,
    ) -> Result<Self> {
        if options.workers == 0 {
            return Err(EngineError::Config("at least one worker is required".into()));
        }

        let queue = SlotRing::with_capacity(sinks.len().max(1));
        for sink in sinks {
            if queue.push(Box::new(Cursor::new(sink, &list))).is_err() {
                return Err(EngineError::Config("cursor queue overflow".into()));
            }
        }

        let ctx = Arc::new(WorkerContext {
            list,
            queue,
            options,
            shutdown,
            clock: EpochClock::new(),
            live: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        });

        let pool = Self { ctx };
        for _ in 0..pool.ctx.options.workers {
            if let Err(e) = spawn_worker(&pool.ctx) {
                pool.stop();
                return Err(EngineError::Spawn(e));
            }
        }
        tracing::info!(
            workers = pool.ctx.options.workers,
            sinks = pool.ctx.queue.len(),
            pooling = pool.ctx.options.pooling,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Workers currently running.
    pub fn live_workers(&self) -> usize {
        self.ctx.live.load(Ordering::Acquire)
    }

    /// Cancel, join every worker and destroy the sinks.
    pub fn stop(&self) {
        self.ctx.shutdown.cancel();
        self.ctx.list.notifier().wake_all();

        // A failing worker may spawn a replacement while we join.
        loop {
            let handles = std::mem::take(&mut *self.ctx.handles.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("worker thread panicked");
                }
            }
        }

        while let Some(cursor) = self.ctx.queue.pop() {
            tracing::debug!(sink = %cursor.name(), delivered = cursor.delivered(), "sink closed");
            cursor.detach(&self.ctx.list);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(ctx: &Arc<WorkerContext>) -> io::Result<()> {
    let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
    let core = match ctx.options.cpu_affinity.as_slice() {
        [] => None,
        cores => Some(cores[id % cores.len()]),
    };

    ctx.live.fetch_add(1, Ordering::AcqRel);
    let worker_ctx = Arc::clone(ctx);
    let spawned = thread::Builder::new()
        .name(format!("tidal-worker-{id}"))
        .spawn(move || run_worker(worker_ctx, id, core));

    match spawned {
        Ok(handle) => {
            let mut handles = ctx.handles.lock();
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
            Ok(())
        }
        Err(e) => {
            ctx.live.fetch_sub(1, Ordering::AcqRel);
            Err(e)
        }
    }
}

fn run_worker(ctx: Arc<WorkerContext>, id: usize, core: Option<usize>) {
    if let Some(core) = core {
        if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
            tracing::warn!(worker = id, core, "failed to pin worker");
        }
    }
    tracing::debug!(worker = id, ?core, "worker started");

    let failed = worker_loop(&ctx, id);
    ctx.live.fetch_sub(1, Ordering::AcqRel);

    if failed && ctx.options.respawn && ctx.shutdown.is_running() {
        match spawn_worker(&ctx) {
            Ok(()) => tracing::info!(worker = id, "replacement worker spawned"),
            Err(e) => tracing::error!(worker = id, error = %e, "failed to respawn worker"),
        }
    }
    tracing::debug!(worker = id, "worker stopped");
}

/// Returns `true` if the worker leaves because a sink failed.
fn worker_loop(ctx: &WorkerContext, id: usize) -> bool {
    let list = &*ctx.list;
    let backoff = Backoff::new();

    while ctx.shutdown.is_running() {
        let seen = list.notifier().epoch();
        let mut progressed = false;

        for _ in 0..ctx.queue.capacity() {
            let Some(mut cursor) = ctx.queue.pop() else {
                break;
            };

            let outcome = match cursor.advance(list, MAX_NODES_PER_TURN) {
                Ok(0) => cursor.heartbeat(&ctx.clock).map(|_| 0),
                other => other,
            };
            let failed_sink = outcome.is_err().then(|| cursor.name().to_string());
            if let Err(cursor) = ctx.queue.push(cursor) {
                tracing::error!(sink = %cursor.name(), "cursor queue full, dropping sink");
                cursor.detach(list);
            }

            match outcome {
                Ok(passed) => progressed |= passed > 0,
                Err(e) => {
                    let sink = failed_sink.unwrap_or_default();
                    tracing::error!(worker = id, sink = %sink, error = %e, "sink delivery failed");
                    return true;
                }
            }
        }

        if progressed {
            backoff.reset();
        } else if ctx.options.pooling {
            backoff.snooze();
        } else {
            list.notifier().wait(seen, ctx.options.idle_wait);
        }
    }
    false
}

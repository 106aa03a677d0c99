//! The distribution engine.
//!
//! Producers push raw record bytes through an [`IngestBuffer`] (the writable
//! view of a pool node) and call [`Engine::proceed`]. Every complete record
//! is validated against the connection's [`IntegrityContext`], stamped with
//! engine time, and the node is published to the broadcast list, where the
//! worker pool picks it up for every sink.

use std::sync::Arc;

use parking_lot::Mutex;
use tidal_metrics::EpochClock;
use tidal_proto::{
    Clear, HexSample, Hello, Instrument, Message, MessageKind, MessageParser, CLEAR_FROM_DISCONNECT,
    MESSAGE_SIZE,
};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::integrity::IntegrityContext;
use crate::list::BroadcastList;
use crate::pool::{NodeHandle, NodePool, NODE_BYTES, NODE_CAPACITY};
use crate::shutdown::Shutdown;
use crate::sink::{Sink, SinkRegistry};
use crate::worker::{WorkerOptions, WorkerPool};

/// State shared by the engine, its contexts and buffers.
struct Shared {
    list: Arc<BroadcastList>,
    clock: EpochClock,
}

impl Shared {
    #[inline]
    fn pool(&self) -> &NodePool {
        self.list.pool()
    }

    /// Hand an owned, filled node to the list.
    fn publish_node(&self, handle: NodeHandle, len: usize) {
        self.pool().get(handle).set_len(len);
        self.list.publish(handle);
    }

    /// Publish already validated records, flushing after the last one.
    fn broadcast(&self, messages: &[Message]) -> Result<()> {
        let now = self.clock.now_nanos();
        let chunks = messages.chunks(NODE_CAPACITY);
        let last_chunk = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.enumerate() {
            let handle = self.pool().allocate()?;
            // SAFETY: freshly allocated, owned until published.
            let storage = unsafe { self.pool().get(handle).storage_mut() };
            for (slot, msg) in storage.iter_mut().zip(chunk) {
                *slot = *msg;
                slot.set_engine_time(now);
                slot.set_flush(false);
            }
            if i == last_chunk {
                storage[chunk.len() - 1].set_flush(true);
            }
            self.publish_node(handle, chunk.len());
        }
        Ok(())
    }
}

/// One producer connection.
///
/// Dropping the context closes every instrument it still has open and
/// broadcasts a disconnect clear record for each.
pub struct IngestContext {
    shared: Arc<Shared>,
    integrity: Mutex<IntegrityContext>,
}

impl IngestContext {
    pub fn name(&self) -> String {
        self.integrity.lock().name().to_string()
    }

    /// Number of instruments defined on this connection.
    pub fn instruments(&self) -> usize {
        self.integrity.lock().len()
    }
}

impl Drop for IngestContext {
    fn drop(&mut self) {
        let integrity = self.integrity.get_mut();
        let closed = integrity.disconnect();
        if closed.is_empty() {
            tracing::debug!(ctx = %integrity.name(), "context closed");
            return;
        }

        let now = self.shared.clock.now_nanos();
        let clears: Vec<Message> = closed
            .iter()
            .map(|state| {
                Message::from_record(&Clear::new(
                    state.security_id,
                    CLEAR_FROM_DISCONNECT,
                    now.max(state.time),
                ))
            })
            .collect();

        match self.shared.broadcast(&clears) {
            Ok(()) => tracing::info!(ctx = %integrity.name(), instruments = clears.len(), "context closed, instruments cleared"),
            Err(e) => tracing::error!(ctx = %integrity.name(), error = %e, "failed to broadcast disconnect clears"),
        }
    }
}

/// Writable byte view of a pool node owned by one producer.
pub struct IngestBuffer {
    shared: Arc<Shared>,
    handle: NodeHandle,
    filled: usize,
}

impl IngestBuffer {
    /// Bytes not yet filled.
    pub fn spare(&mut self) -> &mut [u8] {
        // SAFETY: the buffer owns its node until it publishes it.
        let bytes = unsafe { self.shared.pool().get(self.handle).bytes_mut() };
        &mut bytes[self.filled..]
    }

    /// Mark `n` more bytes of [`IngestBuffer::spare`] as filled.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.filled + n <= NODE_BYTES);
        self.filled = (self.filled + n).min(NODE_BYTES);
    }

    /// Bytes filled so far, including a trailing partial record.
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_full(&self) -> bool {
        self.filled == NODE_BYTES
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle
    }
}

impl Drop for IngestBuffer {
    fn drop(&mut self) {
        self.shared.pool().release(self.handle);
    }
}

pub struct Engine {
    shared: Arc<Shared>,
    workers: WorkerPool,
    shutdown: Shutdown,
}

impl Engine {
    /// Create the sinks named in `config` and start the worker pool.
    pub fn start(config: &Config, registry: &SinkRegistry, shutdown: Shutdown) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let sinks = config
            .sink_specs()
            .into_iter()
            .map(|spec| {
                registry
                    .create(&spec)
                    .map_err(|source| EngineError::Sink { spec, source })
            })
            .collect::<Result<Vec<_>>>()?;

        let engine = &config.engine;
        let options = WorkerOptions {
            workers: engine.workers,
            pooling: engine.pooling,
            idle_wait: engine.idle_wait(),
            respawn: engine.respawn_workers,
            cpu_affinity: engine.cpu_affinity.clone(),
        };
        Self::with_sinks(engine.pool_nodes, sinks, options, shutdown)
    }

    /// Start with already created sinks.
    pub fn with_sinks(
        pool_nodes: usize,
        sinks: Vec<Box<dyn Sink>>,
        options: WorkerOptions,
        shutdown: Shutdown,
    ) -> Result<Self> {
        if pool_nodes < 2 {
            return Err(EngineError::Config("at least 2 pool nodes are required".into()));
        }
        let consumers = sinks.len();
        let list = Arc::new(BroadcastList::new(NodePool::new(pool_nodes)));
        let workers = WorkerPool::start(Arc::clone(&list), sinks, options, shutdown.clone())?;

        tracing::info!(pool_nodes, sinks = consumers, "engine started");
        Ok(Self {
            shared: Arc::new(Shared {
                list,
                clock: EpochClock::new(),
            }),
            workers,
            shutdown,
        })
    }

    /// Open a producer connection context.
    pub fn context_create(&self, name: &str) -> IngestContext {
        tracing::info!(ctx = name, "context created");
        IngestContext {
            shared: Arc::clone(&self.shared),
            integrity: Mutex::new(IntegrityContext::new(name)),
        }
    }

    /// Take a node from the pool as a producer buffer. Never blocks.
    pub fn alloc_buffer(&self) -> Result<IngestBuffer> {
        let handle = self.shared.pool().allocate()?;
        Ok(IngestBuffer {
            shared: Arc::clone(&self.shared),
            handle,
            filled: 0,
        })
    }

    /// Give a buffer back without publishing it.
    pub fn free_buffer(&self, buffer: IngestBuffer) {
        drop(buffer);
    }

    /// Validate and publish the complete records of `buffer`.
    ///
    /// Returns `true` if a node was published. A trailing partial record is
    /// kept at the start of the buffer for the next call. Any error is fatal
    /// to the connection.
    pub fn proceed(&self, buffer: &mut IngestBuffer, ctx: &IngestContext) -> Result<bool> {
        let shared = &*self.shared;
        let whole = MessageParser::whole_records(buffer.filled);
        let tail = buffer.filled % MESSAGE_SIZE;
        if whole == 0 {
            return Ok(false);
        }

        // Taken up front so a failure leaves the integrity context untouched.
        let next = shared.pool().allocate()?;

        let node = shared.pool().get(buffer.handle);
        // SAFETY: the buffer owns its node until it publishes it.
        let storage = unsafe { node.storage_mut() };
        let now = shared.clock.now_nanos();

        // Held until publication so per-instrument order survives shared contexts.
        let mut integrity = ctx.integrity.lock();
        let mut kept = 0;
        for i in 0..whole {
            let mut msg = storage[i];
            let kind = match check_record(&msg, &mut integrity) {
                Ok(kind) => kind,
                Err(e) => {
                    tracing::error!(
                        ctx = %integrity.name(),
                        record = i,
                        error = %e,
                        sample = %HexSample(bytemuck::bytes_of(&msg)),
                        "protocol violation"
                    );
                    shared.pool().release(next);
                    return Err(e);
                }
            };

            if !kind.is_broadcast() {
                if let Some(hello) = msg.record::<Hello>() {
                    let name = hello.name;
                    tracing::info!(
                        ctx = %integrity.name(),
                        producer = tidal_proto::ascii_str(&name),
                        "producer hello"
                    );
                }
                continue;
            }

            msg.set_engine_time(now);
            msg.set_flush(false);
            storage[kept] = msg;
            kept += 1;
        }

        let tail_start = whole * MESSAGE_SIZE;
        if kept == 0 {
            shared.pool().release(next);
            // SAFETY: as above.
            let bytes = unsafe { node.bytes_mut() };
            bytes.copy_within(tail_start..tail_start + tail, 0);
            buffer.filled = tail;
            return Ok(false);
        }

        if tail == 0 {
            storage[kept - 1].set_flush(true);
        }

        if tail > 0 {
            // SAFETY: both nodes are owned by this buffer right now.
            let (from, to) = unsafe { (node.bytes_mut(), shared.pool().get(next).bytes_mut()) };
            to[..tail].copy_from_slice(&from[tail_start..tail_start + tail]);
        }

        shared.publish_node(buffer.handle, kept);
        drop(integrity);

        buffer.handle = next;
        buffer.filled = tail;
        Ok(true)
    }

    /// Validate and publish `messages` on behalf of an in-process producer.
    pub fn publish(&self, ctx: &IngestContext, messages: &[Message]) -> Result<()> {
        let mut buffer = self.alloc_buffer()?;
        for chunk in messages.chunks(NODE_CAPACITY) {
            let bytes: &[u8] = bytemuck::cast_slice(chunk);
            buffer.spare()[..bytes.len()].copy_from_slice(bytes);
            buffer.commit(bytes.len());
            self.proceed(&mut buffer, ctx)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &NodePool {
        self.shared.pool()
    }

    /// Nodes published so far.
    pub fn published(&self) -> u64 {
        self.shared.list.published()
    }

    /// Sinks currently attached to the broadcast list.
    pub fn consumers(&self) -> usize {
        self.shared.list.consumers() as usize
    }

    pub fn live_workers(&self) -> usize {
        self.workers.live_workers()
    }

    pub fn shutdown_token(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Stop the workers and destroy the sinks.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.workers.stop();
        tracing::info!(published = self.published(), "engine stopped");
    }
}

fn check_record(msg: &Message, integrity: &mut IntegrityContext) -> Result<MessageKind> {
    let kind = MessageParser::validate(msg)?;
    if msg.time() == 0 {
        return Err(EngineError::TimeNotSet);
    }
    if let Some(instrument) = msg.record::<Instrument>() {
        instrument.verify()?;
    }
    integrity.check(kind, msg)?;
    Ok(kind)
}

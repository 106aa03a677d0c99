//! # Tidal Core
//!
//! Lock-free fan-out of market-data batches from many producers to many
//! sinks.
//!
//! ## Design Principles
//! - Every node is allocated at startup; exhaustion is backpressure, not growth
//! - Producers append to the broadcast list with a single CAS
//! - A sink is driven by one worker at a time, through its cursor
//! - Nodes are recycled by reference countdown, never by a global lock

pub mod config;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod list;
pub mod plugin;
pub mod pool;
pub mod shutdown;
pub mod sink;
pub mod slots;
pub mod worker;

pub use config::{Config, ConfigError, EngineConfig, LogConfig, RingConfig};
pub use engine::{Engine, IngestBuffer, IngestContext};
pub use error::{EngineError, Result, SinkError};
pub use integrity::{InstrumentState, IntegrityContext};
pub use list::{BroadcastList, Notifier};
pub use plugin::{PluginSink, SinkVTable, SINK_ABI_VERSION};
pub use pool::{Node, NodeHandle, NodePool, NODE_BYTES, NODE_CAPACITY};
pub use shutdown::Shutdown;
pub use sink::{split_spec, LatencySink, LogSink, MmapSink, Sink, SinkChain, SinkFactory, SinkRegistry};
pub use slots::SlotRing;
pub use worker::{Cursor, WorkerOptions, WorkerPool};

//! Importer specifications and their supervising threads.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tidal_core::{Engine, Shutdown};

use crate::error::{ImportError, Result};
use crate::mmap::MmapImporter;
use crate::pipe::PipeImporter;
use crate::tcp::TcpImporter;

/// Pause before a failed importer is started again.
pub const RESTART_PAUSE: Duration = Duration::from_secs(5);

/// Where producer records come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportSpec {
    /// `tcp <addr>` or `tcp <port>` (all interfaces).
    Tcp(SocketAddr),
    /// `pipe <path>`
    Pipe(PathBuf),
    /// `mmap <path>`
    Mmap(PathBuf),
}

impl FromStr for ImportSpec {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ImportError::InvalidSpec {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let (kind, arg) = tidal_core::split_spec(s.trim());
        if arg.is_empty() {
            return Err(invalid("missing argument"));
        }
        match kind {
            "tcp" => {
                if let Ok(addr) = arg.parse::<SocketAddr>() {
                    return Ok(ImportSpec::Tcp(addr));
                }
                let port = arg.parse::<u16>().map_err(|_| invalid("expected an address or a port"))?;
                Ok(ImportSpec::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)))
            }
            "pipe" => Ok(ImportSpec::Pipe(PathBuf::from(arg))),
            "mmap" => Ok(ImportSpec::Mmap(PathBuf::from(arg))),
            _ => Err(invalid("unknown importer")),
        }
    }
}

impl fmt::Display for ImportSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportSpec::Tcp(addr) => write!(f, "tcp {addr}"),
            ImportSpec::Pipe(path) => write!(f, "pipe {}", path.display()),
            ImportSpec::Mmap(path) => write!(f, "mmap {}", path.display()),
        }
    }
}

impl ImportSpec {
    /// Run the importer once, until it fails, its source closes or shutdown.
    pub fn run(&self, engine: &Arc<Engine>, shutdown: &Shutdown) -> Result<()> {
        match self {
            ImportSpec::Tcp(addr) => TcpImporter::bind(*addr)?.run(engine, shutdown),
            ImportSpec::Pipe(path) => PipeImporter::open(path)?.run(engine, shutdown),
            ImportSpec::Mmap(path) => MmapImporter::new(path).run(engine, shutdown),
        }
    }
}

/// Run `spec` on its own thread, restarting it after every failure until
/// shutdown.
pub fn spawn_importer(engine: Arc<Engine>, spec: ImportSpec, shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("tidal-import-{}", thread_label(&spec)))
        .spawn(move || supervise(&engine, &spec, &shutdown, RESTART_PAUSE))
}

fn thread_label(spec: &ImportSpec) -> &'static str {
    match spec {
        ImportSpec::Tcp(_) => "tcp",
        ImportSpec::Pipe(_) => "pipe",
        ImportSpec::Mmap(_) => "mmap",
    }
}

fn supervise(engine: &Arc<Engine>, spec: &ImportSpec, shutdown: &Shutdown, pause: Duration) {
    tracing::info!(%spec, "importer started");
    while shutdown.is_running() {
        match spec.run(engine, shutdown) {
            Ok(()) if !shutdown.is_running() => break,
            Ok(()) => tracing::info!(%spec, "importer source closed, restarting"),
            Err(e) => tracing::error!(%spec, error = %e, "importer failed, restarting"),
        }
        sleep_while_running(shutdown, pause);
    }
    tracing::info!(%spec, "importer stopped");
}

/// Sleep in one second steps so shutdown is noticed.
fn sleep_while_running(shutdown: &Shutdown, pause: Duration) {
    let step = Duration::from_secs(1).min(pause);
    let mut slept = Duration::ZERO;
    while slept < pause && shutdown.is_running() {
        thread::sleep(step);
        slept += step;
    }
}

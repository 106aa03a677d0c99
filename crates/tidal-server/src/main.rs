//! tidal - market data distribution hub.
//!
//! Usage: `tidal [config.toml]`. Without a path the built-in defaults are
//! used. `RUST_LOG` overrides the configured log level.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tidal_core::{Config, ConfigError, Engine, EngineError, Shutdown, SinkRegistry};
use tidal_net::{spawn_importer, ImportError, ImportSpec};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SIGNAL_POLL: Duration = Duration::from_millis(100);

static SIGNALLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
enum AppError {
    #[error("usage: tidal [config.toml]")]
    Usage,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error("failed to spawn importer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

fn main() {
    let config = match load_config(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tidal: {e}");
            std::process::exit(2);
        }
    };
    init_tracing(&config.log.level);

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "tidal failed");
        std::process::exit(1);
    }
}

fn load_config(mut args: impl Iterator<Item = String>) -> Result<Config, AppError> {
    let path = args.next().map(PathBuf::from);
    if args.next().is_some() {
        return Err(AppError::Usage);
    }
    match path {
        Some(path) if path.as_os_str() == "-h" || path.as_os_str() == "--help" => Err(AppError::Usage),
        Some(path) => Ok(Config::load(path)?),
        None => Ok(Config::default()),
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

extern "C" fn on_signal(_: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn parse_imports(config: &Config) -> Result<Vec<ImportSpec>, AppError> {
    Ok(config
        .imports
        .iter()
        .map(|s| s.parse())
        .collect::<Result<Vec<ImportSpec>, ImportError>>()?)
}

fn run(config: Config) -> Result<(), AppError> {
    tracing::info!(name = %config.name, version = env!("CARGO_PKG_VERSION"), "tidal starting");
    let imports = parse_imports(&config)?;
    if imports.is_empty() {
        tracing::warn!("no importers configured, nothing will be distributed");
    }

    install_signal_handlers();
    let shutdown = Shutdown::new();
    let registry = SinkRegistry::new().with_plugin_dir(config.engine.plugin_dir.clone());
    let engine = Arc::new(Engine::start(&config, &registry, shutdown.clone())?);

    let importers = imports
        .into_iter()
        .map(|spec| spawn_importer(Arc::clone(&engine), spec, shutdown.clone()))
        .collect::<std::io::Result<Vec<JoinHandle<()>>>>();
    let importers = match importers {
        Ok(importers) => importers,
        Err(e) => {
            shutdown.cancel();
            return Err(e.into());
        }
    };

    while shutdown.is_running() && !SIGNALLED.load(Ordering::SeqCst) {
        thread::sleep(SIGNAL_POLL);
    }
    tracing::info!("shutting down");
    shutdown.cancel();

    for handle in importers {
        if handle.join().is_err() {
            tracing::error!("importer thread panicked");
        }
    }
    match Arc::try_unwrap(engine) {
        Ok(engine) => engine.shutdown(),
        Err(_) => tracing::warn!("engine still referenced at exit"),
    }
    tracing::info!("tidal stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_no_arguments_uses_defaults() {
        let config = load_config(args(&[])).unwrap();
        assert_eq!(config.name, "tidal");
        assert!(parse_imports(&config).unwrap().is_empty());
    }

    #[test]
    fn test_config_file_argument() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidal.toml");
        std::fs::write(&path, "name = \"edge\"\nimports = [\"tcp 9100\", \"pipe /tmp/p\"]\n").unwrap();

        let config = load_config(args(&[path.to_str().unwrap()])).unwrap();
        assert_eq!(config.name, "edge");
        let imports = parse_imports(&config).unwrap();
        assert_eq!(imports[0], ImportSpec::Tcp("0.0.0.0:9100".parse().unwrap()));
        assert_eq!(imports[1], ImportSpec::Pipe("/tmp/p".into()));
    }

    #[test]
    fn test_usage_errors() {
        assert!(matches!(load_config(args(&["a.toml", "b.toml"])), Err(AppError::Usage)));
        assert!(matches!(load_config(args(&["--help"])), Err(AppError::Usage)));
        assert!(matches!(
            load_config(args(&["/nonexistent/tidal.toml"])),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_bad_import_rejected() {
        let mut config = Config::default();
        config.imports = vec!["udp 9000".into()];
        assert!(matches!(parse_imports(&config), Err(AppError::Import(_))));
    }
}

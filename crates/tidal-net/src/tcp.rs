//! TCP importer: one listening socket, one thread per producer connection.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tidal_core::{Engine, Shutdown};

use crate::error::{ImportError, Result};
use crate::pump::Pump;

const SERVER: Token = Token(0);
const STREAM: Token = Token(1);

/// Producer connections served at once.
pub const MAX_CONNECTIONS: usize = 32;

/// Poll tick; bounds how late shutdown is noticed.
pub const POLL_TICK: Duration = Duration::from_millis(50);

/// A connection silent for this long is dropped.
pub const FEED_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TcpImporter {
    poll: Poll,
    listener: TcpListener,
    addr: SocketAddr,
    feed_timeout: Duration,
}

impl TcpImporter {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = listen_socket(addr).map_err(|e| ImportError::io(format!("bind {addr}"), e))?;
        let mut listener = TcpListener::from_std(socket.into());
        let addr = listener.local_addr().map_err(|e| ImportError::io("local_addr", e))?;

        let poll = Poll::new().map_err(|e| ImportError::io("poll", e))?;
        poll.registry()
            .register(&mut listener, SERVER, Interest::READABLE)
            .map_err(|e| ImportError::io("register listener", e))?;

        tracing::info!(%addr, "tcp importer listening");
        Ok(Self {
            poll,
            listener,
            addr,
            feed_timeout: FEED_TIMEOUT,
        })
    }

    pub fn with_feed_timeout(mut self, timeout: Duration) -> Self {
        self.feed_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept producers until shutdown, then wait for their threads.
    pub fn run(mut self, engine: &Arc<Engine>, shutdown: &Shutdown) -> Result<()> {
        let live = Arc::new(AtomicUsize::new(0));
        let mut connections: Vec<JoinHandle<()>> = Vec::new();
        let mut events = Events::with_capacity(16);

        while shutdown.is_running() {
            match self.poll.poll(&mut events, Some(POLL_TICK)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ImportError::io("poll", e)),
            }
            connections.retain(|h| !h.is_finished());

            if events.iter().any(|e| e.token() == SERVER) {
                self.accept_connections(engine, shutdown, &live, &mut connections)?;
            }
        }

        for handle in connections {
            let _ = handle.join();
        }
        Ok(())
    }

    fn accept_connections(
        &mut self,
        engine: &Arc<Engine>,
        shutdown: &Shutdown,
        live: &Arc<AtomicUsize>,
        connections: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let count = live.load(Ordering::Acquire);
                    if count >= MAX_CONNECTIONS {
                        tracing::warn!(%peer, count, "connection limit reached, refusing producer");
                        continue;
                    }
                    live.fetch_add(1, Ordering::AcqRel);
                    if count + 1 == MAX_CONNECTIONS {
                        tracing::warn!(count = count + 1, "connection limit reached");
                    }

                    let conn = Connection {
                        engine: Arc::clone(engine),
                        shutdown: shutdown.clone(),
                        live: Arc::clone(live),
                        feed_timeout: self.feed_timeout,
                        peer,
                    };
                    let spawned = thread::Builder::new()
                        .name(format!("tidal-tcp-{peer}"))
                        .spawn(move || conn.serve(stream));
                    match spawned {
                        Ok(handle) => connections.push(handle),
                        Err(e) => {
                            live.fetch_sub(1, Ordering::AcqRel);
                            tracing::error!(%peer, error = %e, "failed to spawn connection thread");
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ImportError::io("accept", e)),
            }
        }
        Ok(())
    }
}

fn listen_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket)
}

struct Connection {
    engine: Arc<Engine>,
    shutdown: Shutdown,
    live: Arc<AtomicUsize>,
    feed_timeout: Duration,
    peer: SocketAddr,
}

impl Connection {
    fn serve(self, stream: TcpStream) {
        let peer = self.peer;
        tracing::info!(%peer, "producer connected");
        match self.pump(stream) {
            Ok(received) => tracing::info!(%peer, received, "producer disconnected"),
            Err(e) => tracing::error!(%peer, error = %e, "producer connection failed"),
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    fn pump(&self, mut stream: TcpStream) -> Result<u64> {
        stream.set_nodelay(true).map_err(|e| ImportError::io("set_nodelay", e))?;
        let mut poll = Poll::new().map_err(|e| ImportError::io("poll", e))?;
        poll.registry()
            .register(&mut stream, STREAM, Interest::READABLE)
            .map_err(|e| ImportError::io("register stream", e))?;

        let mut pump = Pump::new(&self.engine, &self.peer.to_string())?;
        let mut events = Events::with_capacity(4);

        while self.shutdown.is_running() {
            match poll.poll(&mut events, Some(POLL_TICK)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ImportError::io("poll", e)),
            }
            if events.is_empty() {
                if pump.idle() > self.feed_timeout {
                    return Err(ImportError::FeedTimeout(self.feed_timeout));
                }
                continue;
            }

            // Edge triggered: drain until the socket would block.
            loop {
                match stream.read(pump.spare()) {
                    Ok(0) => return Ok(pump.received()),
                    Ok(n) => pump.commit(n)?,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(ImportError::io("read", e)),
                }
            }
        }
        Ok(pump.received())
    }
}

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use owo_colors::OwoColorize;
use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::Instrument;

use super::session::{Session, SessionOpts, SessionStatus, Sessions};
use crate::mapping::Target;

/// Whether `e` means the process could not get a socket at all.
pub fn is_exhaustion(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::OutOfMemory
        || matches!(
            e.raw_os_error(),
            Some(libc::ENOMEM | libc::ENFILE | libc::EMFILE | libc::ENOBUFS)
        )
}

#[derive(Debug, Error)]
#[error("cannot listen on {addr}: {source}")]
pub struct BindError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

impl BindError {
    pub fn is_exhaustion(&self) -> bool {
        is_exhaustion(&self.source)
    }
}

#[derive(Debug, Clone)]
pub struct ListenerOpts {
    pub bind: IpAddr,
    pub backlog: u32,
    pub session: Arc<SessionOpts>,
}

impl Default for ListenerOpts {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backlog: 128,
            session: Arc::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Binding,
    Listening,
    Draining,
    Stopped,
    Failed(String),
}

impl ListenerState {
    pub fn is_listening(&self) -> bool {
        matches!(self, Self::Listening)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Binding => "binding",
            Self::Listening => "listening",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Failed(_) => "failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {reason}", self.name()),
            None => f.write_str(self.name()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    pub external_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub accepted_count: u64,
    pub failed_connects: u64,
    pub active_session_count: usize,
    pub sessions: Vec<SessionStatus>,
}

/// Counters shared between a listener and its accept loop.
#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    failed: AtomicU64,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the server socket of one external port.
pub struct Listener {
    port: u16,
    target: Target,
    opts: ListenerOpts,
    state: ListenerState,
    counters: Arc<Counters>,
    sessions: Sessions,
    running: Option<Running>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("port", &self.port)
            .field("target", &self.target)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Listener {
    pub fn new(port: u16, target: Target, opts: ListenerOpts) -> Self {
        Self {
            port,
            target,
            opts,
            state: ListenerState::Idle,
            counters: Arc::default(),
            sessions: Sessions::default(),
            running: None,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> &ListenerState {
        &self.state
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.opts.bind, self.port)
    }

    fn bind(&self) -> io::Result<TcpListener> {
        let addr = self.addr();

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };

        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(self.opts.backlog)
    }

    /// Bind the port and start accepting.
    ///
    /// Returns once the listener is either `Listening` or `Failed`. Calling
    /// this on a listener that is already listening is a no-op.
    pub async fn start(&mut self) -> Result<(), BindError> {
        if self.state.is_listening() {
            return Ok(());
        }

        let addr = self.addr();
        self.state = ListenerState::Binding;
        debug!("binding {}", display!(addr));

        let listener = match self.bind() {
            Ok(x) => x,
            Err(source) => {
                let e = BindError { addr, source };

                error!("{e}");
                self.state = ListenerState::Failed(e.source.to_string());
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);

        let accept = AcceptLoop {
            listener,
            port: self.port,
            target: self.target.clone(),
            session_opts: Arc::clone(&self.opts.session),
            counters: Arc::clone(&self.counters),
            sessions: self.sessions.clone(),
            shutdown: shutdown_rx,
        };

        let span = error_span!("listener", port = self.port);
        let task = tokio::spawn(accept.run().instrument(span));

        self.running = Some(Running { shutdown, task });
        self.state = ListenerState::Listening;

        info!("forwarding {} to {}", display!(addr), display!(self.target));
        Ok(())
    }

    /// Stop accepting and close the server socket.
    ///
    /// Sessions that were already accepted keep running. Safe to call in
    /// any state.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            if !matches!(self.state, ListenerState::Failed(_)) {
                self.state = ListenerState::Stopped;
            }
            return;
        };

        self.state = ListenerState::Draining;

        // The loop may already be gone, in which case there is nothing to
        // wake.
        let _ = running.shutdown.send(true);
        if let Err(e) = running.task.await {
            warn!("accept loop on port {} ended abnormally: {e}", self.port);
        }

        self.state = ListenerState::Stopped;
        info!(
            "stopped forwarding port {}, {} session(s) still draining",
            self.port,
            self.sessions.len()
        );
    }

    pub fn accepted_count(&self) -> u64 {
        self.counters.accepted.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ListenerStatus {
        ListenerStatus {
            external_port: self.port,
            target_host: self.target.host.clone(),
            target_port: self.target.port,
            state: self.state.name(),
            reason: self.state.reason().map(str::to_owned),
            accepted_count: self.accepted_count(),
            failed_connects: self.counters.failed.load(Ordering::Relaxed),
            active_session_count: self.sessions.len(),
            sessions: self.sessions.status(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
        }
    }
}

struct AcceptLoop {
    listener: TcpListener,
    port: u16,
    target: Target,
    session_opts: Arc<SessionOpts>,
    counters: Arc<Counters>,
    sessions: Sessions,
    shutdown: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(mut self) {
        loop {
            let (stream, addr) = tokio::select! {
                biased;

                _ = self.shutdown.changed() => break,

                x = self.listener.accept() => match x {
                    Ok(x) => x,
                    Err(e) => {
                        warn!("failed to accept connection: {}", display!(e));

                        // Running out of descriptors makes accept fail
                        // immediately until something is closed.
                        if is_exhaustion(&e) {
                            sleep(Duration::from_millis(100)).await;
                        }
                        continue;
                    }
                },
            };

            self.spawn_session(stream, addr);
        }

        debug!("accept loop exited");
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        let id = self.counters.accepted.fetch_add(1, Ordering::Relaxed) + 1;

        let session = Session {
            id,
            client_addr: addr,
            target: self.target.clone(),
            opts: Arc::clone(&self.session_opts),
            stats: Arc::default(),
        };

        let stats = Arc::clone(&session.stats);
        let counters = Arc::clone(&self.counters);
        let span = error_span!("session", port = self.port, id, from = %addr);

        self.sessions.spawn(
            id,
            addr,
            &stats,
            async move {
                info!("connected");

                match session.run(stream).await {
                    Ok(()) => {}
                    Err(e) if e.is_connect_failure() => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!("{}", e.bright_red());
                    }
                    Err(e) => {
                        info!("closed: {e}");
                    }
                }
            }
            .instrument(span),
        );
    }
}

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use socket2::SockRef;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::mapping::Target;

#[derive(Debug, Clone)]
pub struct SessionOpts {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            buffer_size: 8192,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Relaying,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToTarget => f.write_str("client->target"),
            Self::TargetToClient => f.write_str("target->client"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot connect to upstream {target}: {source}")]
    UpstreamUnreachable {
        target: Target,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to upstream {target} after {timeout:?}")]
    ConnectTimeout { target: Target, timeout: Duration },

    #[error("idle for {timeout:?}")]
    IdleTimeout { timeout: Duration },

    #[error("{direction}: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    /// Whether the session never reached the upstream.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnreachable { .. } | Self::ConnectTimeout { .. }
        )
    }
}

/// Counters of one session, shared with status queries.
#[derive(Debug)]
pub struct SessionStats {
    state: Mutex<SessionState>,
    client_to_target: AtomicU64,
    target_to_client: AtomicU64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            state: Mutex::new(SessionState::Connecting),
            client_to_target: AtomicU64::new(0),
            target_to_client: AtomicU64::new(0),
        }
    }
}

impl SessionStats {
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn client_to_target(&self) -> u64 {
        self.client_to_target.load(Ordering::Relaxed)
    }

    pub fn target_to_client(&self) -> u64 {
        self.target_to_client.load(Ordering::Relaxed)
    }

    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::ClientToTarget => &self.client_to_target,
            Direction::TargetToClient => &self.target_to_client,
        }
    }
}

/// Last time any byte moved in either direction.
#[derive(Debug)]
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// One relayed connection between an accepted client and the target.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub client_addr: SocketAddr,
    pub target: Target,
    pub opts: Arc<SessionOpts>,
    pub stats: Arc<SessionStats>,
}

impl Session {
    /// Connect to the target and relay until both directions are done.
    ///
    /// The client socket is closed by the time this returns, whatever the
    /// outcome.
    pub async fn run(self, client: TcpStream) -> Result<(), SessionError> {
        let r = self.relay(client).await;

        match &r {
            Ok(()) | Err(SessionError::IdleTimeout { .. }) => {
                self.stats.set_state(SessionState::Closed)
            }
            Err(_) => self.stats.set_state(SessionState::Failed),
        }

        r
    }

    async fn connect(&self) -> Result<TcpStream, SessionError> {
        let target = &self.target;
        let connect = TcpStream::connect((target.host.as_str(), target.port));

        match timeout(self.opts.connect_timeout, connect).await {
            Ok(Ok(x)) => Ok(x),
            Ok(Err(source)) => Err(SessionError::UpstreamUnreachable {
                target: target.clone(),
                source,
            }),
            Err(_) => Err(SessionError::ConnectTimeout {
                target: target.clone(),
                timeout: self.opts.connect_timeout,
            }),
        }
    }

    async fn relay(&self, mut client: TcpStream) -> Result<(), SessionError> {
        let mut upstream = self.connect().await?;

        if let Err(e) = client.set_nodelay(true) {
            debug!("cannot set TCP_NODELAY on client: {e}");
        }
        if let Err(e) = SockRef::from(&client).set_keepalive(true) {
            debug!("cannot set SO_KEEPALIVE on client: {e}");
        }
        if let Err(e) = upstream.set_nodelay(true) {
            debug!("cannot set TCP_NODELAY on upstream: {e}");
        }

        self.stats.set_state(SessionState::Relaying);
        info!("relaying to {}", self.target);

        let activity = Activity::new();
        let (client_rx, client_tx) = client.split();
        let (upstream_rx, upstream_tx) = upstream.split();

        tokio::try_join!(
            self.pipe(client_rx, upstream_tx, Direction::ClientToTarget, &activity),
            self.pipe(upstream_rx, client_tx, Direction::TargetToClient, &activity),
        )?;

        info!(
            "disconnected, {} bytes up, {} bytes down",
            self.stats.client_to_target(),
            self.stats.target_to_client()
        );
        Ok(())
    }

    async fn pipe<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        direction: Direction,
        activity: &Activity,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let idle_timeout = self.opts.idle_timeout;
        let io_error = |source: io::Error| SessionError::Io { direction, source };

        let mut buf = vec![0u8; self.opts.buffer_size];
        loop {
            // The deadline moves with traffic in either direction.
            let wait = idle_timeout.saturating_sub(activity.idle_for());
            if wait.is_zero() {
                return Err(SessionError::IdleTimeout {
                    timeout: idle_timeout,
                });
            }

            let n = match timeout(wait, reader.read(&mut buf)).await {
                Ok(x) => x.map_err(io_error)?,
                Err(_) => continue,
            };

            if n == 0 {
                trace!("{direction} reached eof");
                // The peer may already be gone; the other direction decides.
                let _ = writer.shutdown().await;
                return Ok(());
            }

            match timeout(idle_timeout, writer.write_all(&buf[..n])).await {
                Ok(x) => x.map_err(io_error)?,
                Err(_) => {
                    return Err(SessionError::IdleTimeout {
                        timeout: idle_timeout,
                    });
                }
            }

            self.stats
                .counter(direction)
                .fetch_add(n as u64, Ordering::Relaxed);
            activity.touch();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: u64,
    pub client_address: SocketAddr,
    pub state: SessionState,
    pub bytes_client_to_target: u64,
    pub bytes_target_to_client: u64,
}

#[derive(Debug)]
struct Tracked {
    client_addr: SocketAddr,
    stats: Arc<SessionStats>,
    abort: AbortHandle,
}

#[derive(Debug, Default)]
struct SessionsInner {
    live: Mutex<HashMap<u64, Tracked>>,
    emptied: Notify,
}

/// Registry of the running sessions of one listener.
///
/// Every spawned session task is tracked here and removes itself when it
/// finishes or is aborted.
#[derive(Debug, Clone, Default)]
pub struct Sessions {
    inner: Arc<SessionsInner>,
}

struct Untrack {
    sessions: Sessions,
    id: u64,
}

impl Drop for Untrack {
    fn drop(&mut self) {
        let mut live = self.sessions.lock();
        live.remove(&self.id);
        if live.is_empty() {
            self.sessions.inner.emptied.notify_waiters();
        }
    }
}

impl Sessions {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Tracked>> {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn spawn<F>(&self, id: u64, client_addr: SocketAddr, stats: &Arc<SessionStats>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let untrack = Untrack {
            sessions: self.clone(),
            id,
        };

        // Held across the spawn so the task cannot untrack itself before it
        // has been tracked.
        let mut live = self.lock();

        let handle = tokio::spawn(async move {
            let _untrack = untrack;
            fut.await;
        });

        live.insert(
            id,
            Tracked {
                client_addr,
                stats: Arc::clone(stats),
                abort: handle.abort_handle(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> Vec<SessionStatus> {
        let mut out: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, x)| SessionStatus {
                session_id: *id,
                client_address: x.client_addr,
                state: x.stats.state(),
                bytes_client_to_target: x.stats.client_to_target(),
                bytes_target_to_client: x.stats.target_to_client(),
            })
            .collect();

        out.sort_by_key(|x| x.session_id);
        out
    }

    /// Wait until every tracked session has finished.
    pub async fn wait_empty(&self) {
        loop {
            let emptied = self.inner.emptied.notified();
            if self.is_empty() {
                return;
            }
            emptied.await;
        }
    }

    pub fn abort_all(&self) {
        let handles: Vec<AbortHandle> = self.lock().values().map(|x| x.abort.clone()).collect();

        for handle in handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (mut s, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        addr
    }

    fn session(target: SocketAddr, client_addr: SocketAddr, opts: SessionOpts) -> Session {
        Session {
            id: 1,
            client_addr,
            target: Target {
                host: target.ip().to_string(),
                port: target.port(),
            },
            opts: Arc::new(opts),
            stats: Arc::default(),
        }
    }

    /// Accepts one client and relays it to `target` in a background task.
    async fn relay_once(
        target: SocketAddr,
        opts: SessionOpts,
    ) -> (TcpStream, tokio::task::JoinHandle<(Result<(), SessionError>, Arc<SessionStats>)>) {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let (client, addr) = front.accept().await.unwrap();
            let session = session(target, addr, opts);
            let stats = Arc::clone(&session.stats);
            (session.run(client).await, stats)
        });

        let client = TcpStream::connect(front_addr).await.unwrap();
        (client, task)
    }

    #[tokio::test]
    async fn relays_bytes_both_ways() {
        let upstream = echo_upstream().await;
        let (mut client, task) = relay_once(upstream, SessionOpts::default()).await;

        let payload: Vec<u8> = (0..100_000u32).map(|x| x as u8).collect();
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        let (r, stats) = task.await.unwrap();
        r.unwrap();
        assert_eq!(stats.state(), SessionState::Closed);
        assert_eq!(stats.client_to_target(), payload.len() as u64);
        assert_eq!(stats.target_to_client(), payload.len() as u64);
    }

    #[tokio::test]
    async fn half_close_lets_reply_drain() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        // Reads the whole request, then answers after the client has
        // stopped sending.
        let server = tokio::spawn(async move {
            let (mut s, _) = upstream.accept().await.unwrap();
            let mut req = Vec::new();
            s.read_to_end(&mut req).await.unwrap();
            s.write_all(b"pong").await.unwrap();
            req
        });

        let (mut client, task) = relay_once(upstream_addr, SessionOpts::default()).await;
        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();

        assert_eq!(server.await.unwrap(), b"ping");
        assert_eq!(reply, b"pong");
        task.await.unwrap().0.unwrap();
    }

    #[tokio::test]
    async fn unreachable_upstream_fails_and_closes_client() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let (mut client, task) = relay_once(dead_addr, SessionOpts::default()).await;

        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        let (r, stats) = task.await.unwrap();
        assert!(r.unwrap_err().is_connect_failure());
        assert_eq!(stats.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn upstream_reset_fails_session_and_closes_client() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        // Reads the first request, then resets the connection.
        tokio::spawn(async move {
            let (mut s, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            SockRef::from(&s).set_linger(Some(Duration::ZERO)).unwrap();
            drop(s);
        });

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let mut client = TcpStream::connect(front_addr).await.unwrap();
        let (accepted, addr) = front.accept().await.unwrap();

        let sessions = Sessions::default();
        let s = session(upstream_addr, addr, SessionOpts::default());
        let stats = Arc::clone(&s.stats);
        let (done, outcome) = tokio::sync::oneshot::channel();
        sessions.spawn(s.id, addr, &stats, async move {
            let _ = done.send(s.run(accepted).await);
        });

        client.write_all(b"hello").await.unwrap();

        // The client leg goes down too, by EOF or by reset.
        let mut buf = Vec::new();
        let read = timeout(Duration::from_secs(5), client.read_to_end(&mut buf)).await;
        assert!(read.is_ok(), "client leg was left open");
        assert!(buf.is_empty());

        let r = timeout(Duration::from_secs(5), outcome).await.unwrap().unwrap();
        assert!(matches!(r, Err(SessionError::Io { .. })), "{r:?}");

        timeout(Duration::from_secs(5), sessions.wait_empty())
            .await
            .unwrap();
        assert_eq!(stats.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn idle_session_is_closed() {
        let upstream = echo_upstream().await;
        let opts = SessionOpts {
            idle_timeout: Duration::from_millis(200),
            ..SessionOpts::default()
        };

        let (mut client, task) = relay_once(upstream, opts).await;

        let mut buf = Vec::new();
        let read = timeout(Duration::from_secs(5), client.read_to_end(&mut buf)).await;
        assert!(read.is_ok(), "relay did not close an idle session");

        let (r, stats) = task.await.unwrap();
        assert!(matches!(r, Err(SessionError::IdleTimeout { .. })));
        assert_eq!(stats.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn registry_tracks_and_aborts() {
        let sessions = Sessions::default();
        let s = session(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            SessionOpts::default(),
        );

        sessions.spawn(s.id, s.client_addr, &s.stats, std::future::pending());
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.status()[0].session_id, 1);

        sessions.abort_all();
        timeout(Duration::from_secs(5), sessions.wait_empty())
            .await
            .unwrap();
        assert!(sessions.is_empty());
    }
}

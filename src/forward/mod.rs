use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{JoinError, spawn_blocking};
use tokio::time::timeout;

pub mod listener;
pub mod session;

use self::listener::{BindError, Listener, ListenerOpts, ListenerStatus};
use self::session::Sessions;
use crate::mapping::{self, Mapping, Snapshot};
use crate::store::{MappingStore, StoreError};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("cannot load mappings: {0}")]
    Store(#[from] StoreError),

    #[error("mapping store task failed: {0}")]
    Load(#[from] JoinError),

    #[error("out of sockets while starting port {port}, retry later: {source}")]
    Exhausted {
        port: u16,
        #[source]
        source: BindError,
        report: Box<Reconcile>,
    },
}

impl ForwardError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// What was done before giving up, if the snapshot got applied at all.
    pub fn report(&self) -> Option<&Reconcile> {
        match self {
            Self::Exhausted { report, .. } => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortFailure {
    pub external_port: u16,
    pub reason: String,
}

/// What a reconciliation pass did, per port.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Reconcile {
    #[serde(skip)]
    pub snapshot: Snapshot,
    pub active_mappings: usize,
    pub started: Vec<u16>,
    pub restarted: Vec<u16>,
    pub stopped: Vec<u16>,
    pub unchanged: Vec<u16>,
    pub failed: Vec<PortFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwardStatus {
    pub running: bool,
    pub active_forwards: usize,
    pub total_forwards: usize,
    pub active_sessions: usize,
    pub draining_sessions: usize,
    pub forwards: Vec<ListenerStatus>,
}

#[derive(Debug, Default)]
struct Live {
    running: bool,
    listeners: BTreeMap<u16, Listener>,
    // Sessions of listeners that have been stopped but are still relaying.
    draining: Vec<Sessions>,
}

impl Live {
    async fn retire(&mut self, mut listener: Listener) {
        listener.stop().await;

        let sessions = listener.sessions();
        if !sessions.is_empty() {
            self.draining.push(sessions.clone());
        }
    }

    fn prune(&mut self) {
        self.draining.retain(|x| !x.is_empty());
    }
}

/// Keeps one [`Listener`] per active mapping.
#[derive(Debug)]
pub struct Forwarder {
    store: Arc<dyn MappingStore>,
    opts: ListenerOpts,
    live: Mutex<Live>,
}

impl Forwarder {
    pub fn new(store: Arc<dyn MappingStore>, opts: ListenerOpts) -> Self {
        Self {
            store,
            opts,
            live: Mutex::default(),
        }
    }

    /// Read the store off the runtime and normalise what it returns.
    pub async fn load(&self) -> Result<Snapshot, ForwardError> {
        let store = Arc::clone(&self.store);
        let mappings = spawn_blocking(move || store.list_active()).await??;
        Ok(mapping::snapshot(mappings))
    }

    /// Start a listener for every active mapping that does not have one.
    pub async fn start_all(&self) -> Result<Reconcile, ForwardError> {
        let snapshot = self.load().await?;
        let report = self.apply(&snapshot).await?;

        info!(
            "started {} of {} forward(s)",
            report.started.len() + report.unchanged.len(),
            report.active_mappings
        );
        Ok(report)
    }

    /// Re-read the store and bring the live listeners in line with it.
    ///
    /// If the store cannot be read the live listeners are left as they are.
    pub async fn reload(&self) -> Result<Reconcile, ForwardError> {
        info!("reloading mappings");
        let snapshot = self.load().await?;
        self.apply(&snapshot).await
    }

    /// Reconcile the live listeners against `snapshot`.
    ///
    /// Listeners whose mapping is unchanged are not touched. Removed ports
    /// are stopped, ports whose target changed are restarted, new ports are
    /// started, and ports that previously failed to bind are retried.
    pub async fn apply(&self, snapshot: &Snapshot) -> Result<Reconcile, ForwardError> {
        let mut live = self.live.lock().await;
        live.running = true;
        live.prune();

        let mut report = Reconcile {
            snapshot: snapshot.clone(),
            active_mappings: snapshot.len(),
            ..Reconcile::default()
        };

        let stale: Vec<u16> = live
            .listeners
            .iter()
            .filter(|(port, listener)| match snapshot.get(port) {
                Some(mapping) => mapping.target() != *listener.target(),
                None => true,
            })
            .map(|(port, _)| *port)
            .collect();

        for port in &stale {
            if let Some(listener) = live.listeners.remove(port) {
                live.retire(listener).await;
            }

            if !snapshot.contains_key(port) {
                report.stopped.push(*port);
            }
        }

        let mut exhausted = None;

        for (port, mapping) in snapshot {
            let listener = live
                .listeners
                .entry(*port)
                .or_insert_with(|| Listener::new(*port, mapping.target(), self.opts.clone()));

            if listener.state().is_listening() {
                report.unchanged.push(*port);
                continue;
            }

            match listener.start().await {
                Ok(()) if stale.contains(port) => report.restarted.push(*port),
                Ok(()) => report.started.push(*port),
                Err(e) => {
                    report.failed.push(PortFailure {
                        external_port: *port,
                        reason: e.to_string(),
                    });

                    if e.is_exhaustion() && exhausted.is_none() {
                        exhausted = Some((*port, e));
                    }
                }
            }
        }

        debug!(
            "reconciled: started {:?}, restarted {:?}, stopped {:?}, unchanged {:?}, failed {}",
            report.started,
            report.restarted,
            report.stopped,
            report.unchanged,
            report.failed.len()
        );

        match exhausted {
            Some((port, source)) => Err(ForwardError::Exhausted {
                port,
                source,
                report: Box::new(report),
            }),
            None => Ok(report),
        }
    }

    /// Forward one port outside of the store.
    ///
    /// Returns `false` if the port is already being forwarded. The next
    /// reload brings the port back in line with the store.
    pub async fn start_forwarding(&self, mapping: &Mapping) -> Result<bool, BindError> {
        let mut live = self.live.lock().await;
        let port = mapping.external_port;

        if live
            .listeners
            .get(&port)
            .is_some_and(|x| x.state().is_listening())
        {
            warn!("port {port} is already being forwarded");
            return Ok(false);
        }

        let mut listener = Listener::new(port, mapping.target(), self.opts.clone());
        let r = listener.start().await;

        // A failed listener stays visible in the status.
        live.listeners.insert(port, listener);

        r.map(|()| true)
    }

    /// Stop forwarding one port. Returns `false` if it was not forwarded.
    pub async fn stop_forwarding(&self, port: u16) -> bool {
        let mut live = self.live.lock().await;

        match live.listeners.remove(&port) {
            Some(listener) => {
                live.retire(listener).await;
                true
            }
            None => false,
        }
    }

    /// Stop every listener. Sessions already accepted keep running.
    pub async fn stop_all(&self) {
        let mut live = self.live.lock().await;

        let listeners = std::mem::take(&mut live.listeners);
        let n = listeners.len();

        for (_, listener) in listeners {
            live.retire(listener).await;
        }

        live.running = false;
        info!("stopped {n} forward(s)");
    }

    /// Stop every listener, give sessions `grace` to finish, then abort the
    /// rest.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop_all().await;

        let draining = {
            let mut live = self.live.lock().await;
            live.prune();
            live.draining.clone()
        };

        if draining.is_empty() {
            return;
        }

        let wait_all = async {
            for sessions in &draining {
                sessions.wait_empty().await;
            }
        };

        if timeout(grace, wait_all).await.is_err() {
            let n: usize = draining.iter().map(Sessions::len).sum();
            warn!("aborting {n} session(s) still open after {}", display!(grace));

            for sessions in &draining {
                sessions.abort_all();
            }
        }
    }

    pub async fn status(&self) -> ForwardStatus {
        let mut live = self.live.lock().await;
        live.prune();

        let forwards: Vec<ListenerStatus> = live.listeners.values().map(Listener::status).collect();

        ForwardStatus {
            running: live.running,
            active_forwards: live
                .listeners
                .values()
                .filter(|x| x.state().is_listening())
                .count(),
            total_forwards: forwards.len(),
            active_sessions: forwards.iter().map(|x| x.active_session_count).sum(),
            draining_sessions: live.draining.iter().map(Sessions::len).sum(),
            forwards,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write as _};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::store::JsonStore;
    use crate::mapping::Target;

    #[derive(Debug, Default)]
    struct MemStore {
        mappings: std::sync::Mutex<Vec<Mapping>>,
        broken: AtomicBool,
    }

    impl MemStore {
        fn set(&self, mappings: Vec<Mapping>) {
            *self.mappings.lock().unwrap() = mappings;
        }
    }

    impl MappingStore for MemStore {
        fn list_active(&self) -> Result<Vec<Mapping>, StoreError> {
            if self.broken.load(Ordering::Relaxed) {
                return Err(StoreError::Read {
                    path: "memory".into(),
                    source: io::Error::other("store is broken"),
                });
            }

            Ok(self.mappings.lock().unwrap().clone())
        }
    }

    fn forwarder(store: &Arc<MemStore>) -> Forwarder {
        let opts = ListenerOpts {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ListenerOpts::default()
        };

        Forwarder::new(Arc::clone(store) as Arc<dyn MappingStore>, opts)
    }

    async fn free_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    /// Echo server that prefixes every reply with `tag`.
    async fn upstream(tag: &'static [u8]) -> Target {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (mut s, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match s.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let mut reply = tag.to_vec();
                                reply.extend_from_slice(&buf[..n]);
                                if s.write_all(&reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Target {
            host: "127.0.0.1".into(),
            port,
        }
    }

    async fn roundtrip(client: &mut TcpStream, msg: &[u8]) -> Vec<u8> {
        client.write_all(msg).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    async fn ping(port: u16, msg: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        roundtrip(&mut client, msg).await
    }

    #[tokio::test]
    async fn start_all_forwards_every_mapping() {
        let (a, b) = (free_port().await, free_port().await);
        let store = Arc::new(MemStore::default());
        store.set(vec![
            Mapping::new(a, upstream(b"a:").await),
            Mapping::new(b, upstream(b"b:").await),
        ]);

        let fwd = forwarder(&store);
        let report = fwd.start_all().await.unwrap();
        assert_eq!(report.started, vec![a.min(b), a.max(b)]);
        assert_eq!(
            report.snapshot.keys().copied().collect::<Vec<_>>(),
            report.started
        );

        assert_eq!(ping(a, b"ping").await, b"a:ping");
        assert_eq!(ping(b, b"ping").await, b"b:ping");

        let status = fwd.status().await;
        assert!(status.running);
        assert_eq!(status.active_forwards, 2);
        assert_eq!(status.total_forwards, 2);
    }

    #[tokio::test]
    async fn loads_json_store_on_blocking_pool() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"external_port": 9000, "target_host": "127.0.0.1", "target_port": 9100}}]"#
        )
        .unwrap();

        let fwd = Forwarder::new(
            Arc::new(JsonStore::new(file.path())),
            ListenerOpts::default(),
        );

        let snapshot = fwd.load().await.unwrap();
        assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![9000]);
    }

    #[tokio::test]
    async fn bind_failure_is_per_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = taken.local_addr().unwrap().port();
        let ok = free_port().await;

        let store = Arc::new(MemStore::default());
        store.set(vec![
            Mapping::new(busy, upstream(b"x:").await),
            Mapping::new(ok, upstream(b"y:").await),
        ]);

        let fwd = forwarder(&store);
        let report = fwd.start_all().await.unwrap();

        assert_eq!(report.started, vec![ok]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].external_port, busy);

        let status = fwd.status().await;
        assert_eq!(status.active_forwards, 1);
        let failed = status
            .forwards
            .iter()
            .find(|x| x.external_port == busy)
            .unwrap();
        assert_eq!(failed.state, "failed");
        assert!(failed.reason.is_some());

        assert_eq!(ping(ok, b"hi").await, b"y:hi");

        // once the port is free a reload picks it up
        drop(taken);
        let report = fwd.reload().await.unwrap();
        assert_eq!(report.started, vec![busy]);
        assert_eq!(report.unchanged, vec![ok]);
    }

    #[tokio::test]
    async fn stop_forwarding_leaves_other_ports() {
        let (a, b) = (free_port().await, free_port().await);
        let store = Arc::new(MemStore::default());
        store.set(vec![
            Mapping::new(a, upstream(b"a:").await),
            Mapping::new(b, upstream(b"b:").await),
        ]);

        let fwd = forwarder(&store);
        fwd.start_all().await.unwrap();

        assert!(fwd.stop_forwarding(a).await);
        assert!(!fwd.stop_forwarding(a).await);

        assert!(TcpStream::connect(("127.0.0.1", a)).await.is_err());
        assert_eq!(ping(b, b"still").await, b"b:still");
        assert_eq!(fwd.status().await.total_forwards, 1);
    }

    #[tokio::test]
    async fn reload_only_touches_changed_ports() {
        let (a, b, c) = (free_port().await, free_port().await, free_port().await);
        let store = Arc::new(MemStore::default());
        store.set(vec![
            Mapping::new(a, upstream(b"a:").await),
            Mapping::new(b, upstream(b"b1:").await),
            Mapping::new(c, upstream(b"c:").await),
        ]);

        let fwd = forwarder(&store);
        fwd.start_all().await.unwrap();

        // a session on the unchanged port stays up across the reload
        let mut held = TcpStream::connect(("127.0.0.1", a)).await.unwrap();
        assert_eq!(roundtrip(&mut held, b"1").await, b"a:1");

        let d = free_port().await;
        let mut next = store.list_active().unwrap();
        next.retain(|x| x.external_port != c);
        next[1] = Mapping::new(b, upstream(b"b2:").await);
        next.push(Mapping::new(d, upstream(b"d:").await));
        store.set(next);

        let report = fwd.reload().await.unwrap();
        assert_eq!(report.unchanged, vec![a]);
        assert_eq!(report.restarted, vec![b]);
        assert_eq!(report.stopped, vec![c]);
        assert_eq!(report.started, vec![d]);

        assert_eq!(roundtrip(&mut held, b"2").await, b"a:2");
        assert_eq!(ping(b, b"x").await, b"b2:x");
        assert_eq!(ping(d, b"x").await, b"d:x");
        assert!(TcpStream::connect(("127.0.0.1", c)).await.is_err());

        let status = fwd.status().await;
        let forward_a = status.forwards.iter().find(|x| x.external_port == a).unwrap();
        assert_eq!(forward_a.accepted_count, 1);
    }

    #[tokio::test]
    async fn broken_store_keeps_live_set() {
        let a = free_port().await;
        let store = Arc::new(MemStore::default());
        store.set(vec![Mapping::new(a, upstream(b"a:").await)]);

        let fwd = forwarder(&store);
        fwd.start_all().await.unwrap();

        store.broken.store(true, Ordering::Relaxed);
        assert!(matches!(fwd.reload().await, Err(ForwardError::Store(_))));

        assert_eq!(ping(a, b"ok").await, b"a:ok");
        assert_eq!(fwd.status().await.active_forwards, 1);
    }

    #[tokio::test]
    async fn stop_all_then_status_is_empty() {
        let a = free_port().await;
        let store = Arc::new(MemStore::default());
        store.set(vec![Mapping::new(a, upstream(b"a:").await)]);

        let fwd = forwarder(&store);
        fwd.start_all().await.unwrap();
        fwd.stop_all().await;

        let status = fwd.status().await;
        assert!(!status.running);
        assert_eq!(status.total_forwards, 0);
        assert_eq!(status.active_sessions, 0);
        assert!(TcpStream::connect(("127.0.0.1", a)).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_aborts_lingering_sessions() {
        let a = free_port().await;
        let store = Arc::new(MemStore::default());
        store.set(vec![Mapping::new(a, upstream(b"a:").await)]);

        let fwd = forwarder(&store);
        fwd.start_all().await.unwrap();

        let mut held = TcpStream::connect(("127.0.0.1", a)).await.unwrap();
        assert_eq!(roundtrip(&mut held, b"1").await, b"a:1");

        fwd.shutdown(Duration::from_millis(100)).await;

        let mut buf = Vec::new();
        let closed = timeout(Duration::from_secs(5), held.read_to_end(&mut buf)).await;
        assert!(closed.is_ok(), "session outlived a hard shutdown");

        let drained = timeout(Duration::from_secs(5), async {
            while fwd.status().await.draining_sessions != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn start_forwarding_twice() {
        let a = free_port().await;
        let store = Arc::new(MemStore::default());
        let fwd = forwarder(&store);

        let mapping = Mapping::new(a, upstream(b"a:").await);
        assert!(fwd.start_forwarding(&mapping).await.unwrap());
        assert!(!fwd.start_forwarding(&mapping).await.unwrap());
        assert_eq!(ping(a, b"m").await, b"a:m");

        // not in the store, so a reload removes it
        let report = fwd.reload().await.unwrap();
        assert_eq!(report.stopped, vec![a]);
    }
}

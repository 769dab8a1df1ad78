use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use eyre::{Context, Result, bail};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::Config;
use crate::config::control::Control;
use crate::control;
use crate::forward::listener::ListenerOpts;
use crate::forward::{ForwardError, ForwardStatus, Forwarder, Reconcile};
use crate::proxy::ProxyRouter;
use crate::signal::{Event, Signals};
use crate::store::{JsonStore, MappingStore, StaticStore};

/// How long sessions get to finish on exit before they are cut.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub timestamp: String,
    pub active_mappings: usize,
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub status: &'static str,
    pub active_mappings: usize,
    pub mappings: Vec<u16>,
    pub timestamp: String,
    pub control_port: Option<u16>,
    pub forwarding: ForwardStatus,
}

#[derive(Debug, Serialize)]
pub struct Reloaded {
    pub status: &'static str,
    pub active_mappings: usize,
    pub timestamp: String,
    pub forwarding: Reconcile,
}

fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug)]
pub struct App {
    forwarder: Forwarder,
    router: ProxyRouter,
    control: Control,
    control_port: OnceLock<u16>,
}

impl TryFrom<Config> for App {
    type Error = eyre::Report;

    fn try_from(config: Config) -> Result<Self> {
        let store: Arc<dyn MappingStore> = match config.store {
            Some(path) => Arc::new(JsonStore::new(path)),
            None if !config.forward.is_empty() => Arc::new(StaticStore::new(config.forward)),
            None => bail!("no mapping source configured, add a 'store' or 'forward' directive"),
        };

        let opts = ListenerOpts {
            bind: config.listener.bind,
            backlog: config.listener.backlog,
            session: Arc::new(config.session),
        };

        Ok(Self::new(store, opts, config.control, config.proxy.timeout))
    }
}

impl App {
    pub fn new(
        store: Arc<dyn MappingStore>,
        opts: ListenerOpts,
        control: Control,
        proxy_timeout: Duration,
    ) -> Self {
        Self {
            forwarder: Forwarder::new(store, opts),
            router: ProxyRouter::new(proxy_timeout),
            control,
            control_port: OnceLock::new(),
        }
    }

    pub fn router(&self) -> &ProxyRouter {
        &self.router
    }

    #[cfg(test)]
    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// The port the control endpoint ended up on, once it is bound.
    pub fn control_port(&self) -> Option<u16> {
        self.control_port.get().copied()
    }

    /// Bring listeners and routes in line with the store. Both are built
    /// from the same snapshot.
    pub async fn reload(&self) -> Result<Reloaded, ForwardError> {
        let r = self.forwarder.reload().await;
        self.settle(r)
    }

    async fn start(&self) -> Result<Reloaded, ForwardError> {
        let r = self.forwarder.start_all().await;
        self.settle(r)
    }

    /// Swap the routes to whatever snapshot the forwarder applied, even
    /// when it gave up part way.
    fn settle(&self, r: Result<Reconcile, ForwardError>) -> Result<Reloaded, ForwardError> {
        match r {
            Ok(forwarding) => {
                let active_mappings = self.routes(&forwarding);
                Ok(Reloaded {
                    status: "reloaded",
                    active_mappings,
                    timestamp: timestamp(),
                    forwarding,
                })
            }
            Err(e) => {
                if let Some(report) = e.report() {
                    self.routes(report);
                }
                Err(e)
            }
        }
    }

    fn routes(&self, report: &Reconcile) -> usize {
        let active_mappings = self.router.reload(&report.snapshot);

        for x in &report.failed {
            warn!("port {} is not forwarded: {}", x.external_port, x.reason);
        }

        info!(
            "{active_mappings} active mapping(s): {} started, {} restarted, {} stopped, {} unchanged",
            report.started.len(),
            report.restarted.len(),
            report.stopped.len(),
            report.unchanged.len()
        );

        active_mappings
    }

    /// Forward one port from the store outside of a reload. `Ok(None)`
    /// means the store has no active mapping for it.
    pub async fn start_forwarding(&self, port: u16) -> Result<Option<bool>> {
        let snapshot = self.forwarder.load().await?;
        let Some(mapping) = snapshot.get(&port) else {
            return Ok(None);
        };

        let started = self.forwarder.start_forwarding(mapping).await?;
        Ok(Some(started))
    }

    pub async fn stop_forwarding(&self, port: u16) -> bool {
        self.forwarder.stop_forwarding(port).await
    }

    pub fn health(&self) -> Health {
        Health {
            status: "healthy",
            timestamp: timestamp(),
            active_mappings: self.router.snapshot().len(),
        }
    }

    pub async fn status(&self) -> Status {
        let routes = self.router.snapshot();
        let forwarding = self.forwarder.status().await;

        Status {
            status: if forwarding.running {
                "running"
            } else {
                "stopped"
            },
            active_mappings: routes.len(),
            mappings: routes.ports(),
            timestamp: timestamp(),
            control_port: self.control_port(),
            forwarding,
        }
    }

    /// Validate the store and log what would be forwarded.
    pub async fn check(&self) -> Result<()> {
        let snapshot = self
            .forwarder
            .load()
            .await
            .context("failed to read mappings")?;

        for mapping in snapshot.values() {
            if mapping.description.is_empty() {
                info!("{}", display!(mapping));
            } else {
                info!("{} ({})", display!(mapping), mapping.description);
            }
        }

        info!("{} active mapping(s)", snapshot.len());
        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        let me = Arc::new(self);
        me._run().await
    }

    async fn _run(self: Arc<Self>) -> Result<()> {
        info!("starting...");
        let mut signals = Signals::new().context("failed to register signal handlers")?;

        self.start().await.context("failed to start forwarding")?;

        let listener = control::bind(self.control.addr, self.control.probe).await?;
        let port = listener.local_addr()?.port();
        let _ = self.control_port.set(port);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(control::serve(listener, Arc::clone(&self), shutdown_rx));

        loop {
            match signals.next().await {
                Event::Reload => {
                    if let Err(e) = self.reload().await {
                        error!("reload failed: {e:#}");
                    }
                }
                Event::Terminate => break,
            }
        }

        info!("exiting...");
        let _ = shutdown.send(true);
        if let Err(e) = server.await {
            warn!("control server ended abnormally: {e}");
        }

        self.forwarder.shutdown(SHUTDOWN_GRACE).await;
        Ok(())
    }
}

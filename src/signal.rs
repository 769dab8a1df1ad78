use eyre::Result;
use tokio::signal::unix::{Signal, SignalKind, signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Reload,
    Terminate,
}

#[derive(Debug)]
pub struct Signals {
    int: Signal,
    term: Signal,
    hup: Signal,
}

impl Signals {
    pub fn new() -> Result<Self> {
        Ok(Self {
            int: signal(SignalKind::interrupt())?,
            term: signal(SignalKind::terminate())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    /// SIGHUP asks for a reload, SIGINT and SIGTERM for an exit.
    pub async fn next(&mut self) -> Event {
        tokio::select! {
            _ = self.int.recv() => Event::Terminate,
            _ = self.term.recv() => Event::Terminate,
            _ = self.hup.recv() => Event::Reload,
        }
    }
}

use std::net::{AddrParseError, Ipv4Addr, SocketAddr};
use std::num::ParseIntError;
use std::time::Duration;

use thiserror::Error;

use super::parse::{Parse, ParseStream, seconds, value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub addr: SocketAddr,
    pub probe: u16,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 8080),
            probe: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseControlError {
    #[error("expected control <ip>:<port>")]
    ExpectedAddress,

    #[error("invalid control address: {0}")]
    InvalidAddress(AddrParseError),

    #[error("expected a number for 'probe'")]
    ExpectedProbe,

    #[error("invalid probe count: {0}")]
    InvalidProbe(ParseIntError),

    #[error("probe count must be at least 1")]
    ZeroProbe,
}

impl Parse for Control {
    type Output = Self;
    type Error = ParseControlError;

    // Syntax: control <ip>:<port> [probe <n>]
    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error> {
        use ParseControlError::*;

        let addr = value(stream, ExpectedAddress, InvalidAddress)?;
        let mut probe = Self::default().probe;

        while let Some(x) = stream.next() {
            match x {
                "probe" => probe = value(stream, ExpectedProbe, InvalidProbe)?,
                _ => warn!("ignoring unknown property '{x}'"),
            }
        }

        if probe == 0 {
            return Err(ZeroProbe);
        }

        Ok(Self { addr, probe })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub timeout: Duration,
}

impl Default for Proxy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseProxyError {
    #[error("expected a delay for 'timeout'")]
    ExpectedTimeout,

    #[error("invalid timeout: {0}")]
    InvalidTimeout(ParseIntError),

    #[error("timeout must be at least 1 second")]
    ZeroTimeout,
}

impl Parse for Proxy {
    type Output = Self;
    type Error = ParseProxyError;

    // Syntax: proxy [timeout <secs>]
    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error> {
        use ParseProxyError::*;

        let mut out = Self::default();

        while let Some(x) = stream.next() {
            match x {
                "timeout" => out.timeout = seconds(stream, ExpectedTimeout, InvalidTimeout)?,
                _ => warn!("ignoring unknown property '{x}'"),
            }
        }

        if out.timeout.is_zero() {
            return Err(ZeroTimeout);
        }

        Ok(out)
    }
}

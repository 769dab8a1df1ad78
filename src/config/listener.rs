use std::net::{AddrParseError, IpAddr, Ipv4Addr};
use std::num::ParseIntError;

use thiserror::Error;

use super::parse::{Parse, ParseStream, value};

pub const MIN_BACKLOG: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub bind: IpAddr,
    pub backlog: u32,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backlog: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseListenerError {
    #[error("expected an address for 'bind'")]
    ExpectedBind,

    #[error("invalid bind address: {0}")]
    InvalidBind(AddrParseError),

    #[error("expected a number for 'backlog'")]
    ExpectedBacklog,

    #[error("invalid backlog: {0}")]
    InvalidBacklog(ParseIntError),

    #[error("backlog must be at least {MIN_BACKLOG}")]
    BacklogTooSmall,
}

impl Parse for Listener {
    type Output = Self;
    type Error = ParseListenerError;

    // Syntax: listener [bind <ip>] [backlog <n>]
    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error> {
        use ParseListenerError::*;

        let mut out = Self::default();

        while let Some(x) = stream.next() {
            match x {
                "bind" => out.bind = value(stream, ExpectedBind, InvalidBind)?,
                "backlog" => out.backlog = value(stream, ExpectedBacklog, InvalidBacklog)?,
                _ => warn!("ignoring unknown property '{x}'"),
            }
        }

        if out.backlog < MIN_BACKLOG {
            return Err(BacklogTooSmall);
        }

        Ok(out)
    }
}

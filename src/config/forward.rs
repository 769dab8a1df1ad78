use std::num::ParseIntError;

use thiserror::Error;

use super::parse::{Parse, ParseStream, value};
use crate::mapping::{Mapping, ParseTargetError, Target};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseForwardError {
    #[error("expected external port")]
    ExpectedPort,

    #[error("invalid external port: {0}")]
    InvalidPort(ParseIntError),

    #[error("external port 0 is not allowed")]
    ZeroPort,

    #[error("expected literal 'to'")]
    ExpectedTo,

    #[error("expected target <host>:<port>")]
    ExpectedTarget,

    #[error("invalid target: {0}")]
    InvalidTarget(ParseTargetError),

    #[error("expected a description for 'desc'")]
    ExpectedDescription,
}

impl Parse for Mapping {
    type Output = Self;
    type Error = ParseForwardError;

    // Syntax: forward <port> to <host>:<port> [desc <text>] [inactive]
    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error> {
        use ParseForwardError::*;

        let port: u16 = value(stream, ExpectedPort, InvalidPort)?;
        if port == 0 {
            return Err(ZeroPort);
        }

        if stream.next().ok_or(ExpectedTo)? != "to" {
            return Err(ExpectedTo);
        }

        let target: Target = value(stream, ExpectedTarget, InvalidTarget)?;
        let mut mapping = Mapping::new(port, target);

        while let Some(x) = stream.next() {
            match x {
                "desc" => {
                    mapping.description = stream.next().ok_or(ExpectedDescription)?.to_owned();
                }

                "inactive" => {
                    mapping.active = false;
                }

                _ => {
                    warn!("ignoring unknown property '{x}'");
                }
            }
        }

        Ok(mapping)
    }
}

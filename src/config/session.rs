use std::num::ParseIntError;
use std::ops::RangeInclusive;

use thiserror::Error;

use super::parse::{Parse, ParseStream, seconds, value};
use crate::forward::session::SessionOpts;

const BUFFER_SIZES: RangeInclusive<usize> = 1024..=1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseSessionError {
    #[error("expected a delay for 'connect-timeout'")]
    ExpectedConnectTimeout,

    #[error("invalid connect timeout: {0}")]
    InvalidConnectTimeout(ParseIntError),

    #[error("expected a delay for 'idle-timeout'")]
    ExpectedIdleTimeout,

    #[error("invalid idle timeout: {0}")]
    InvalidIdleTimeout(ParseIntError),

    #[error("timeouts must be at least 1 second")]
    ZeroTimeout,

    #[error("expected a size for 'buffer'")]
    ExpectedBuffer,

    #[error("invalid buffer size: {0}")]
    InvalidBuffer(ParseIntError),

    #[error("buffer size must be between {} and {} bytes", BUFFER_SIZES.start(), BUFFER_SIZES.end())]
    BufferOutOfRange,
}

impl Parse for SessionOpts {
    type Output = Self;
    type Error = ParseSessionError;

    // Syntax: session [connect-timeout <secs>] [idle-timeout <secs>] [buffer <bytes>]
    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error> {
        use ParseSessionError::*;

        let mut out = Self::default();

        while let Some(x) = stream.next() {
            match x {
                "connect-timeout" => {
                    out.connect_timeout =
                        seconds(stream, ExpectedConnectTimeout, InvalidConnectTimeout)?;
                }

                "idle-timeout" => {
                    out.idle_timeout = seconds(stream, ExpectedIdleTimeout, InvalidIdleTimeout)?;
                }

                "buffer" => {
                    out.buffer_size = value(stream, ExpectedBuffer, InvalidBuffer)?;
                }

                _ => {
                    warn!("ignoring unknown property '{x}'");
                }
            }
        }

        if out.connect_timeout.is_zero() || out.idle_timeout.is_zero() {
            return Err(ZeroTimeout);
        }

        if !BUFFER_SIZES.contains(&out.buffer_size) {
            return Err(BufferOutOfRange);
        }

        Ok(out)
    }
}

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

mod parse;
use self::parse::{Parse, parse_stream};

pub mod control;
pub mod forward;
pub mod listener;
pub mod session;

use self::control::{Control, Proxy};
use self::listener::Listener;
use crate::forward::session::SessionOpts;
use crate::mapping::Mapping;

#[derive(Debug, Default)]
pub struct Config {
    pub store: Option<PathBuf>,
    pub forward: Vec<Mapping>,
    pub listener: Listener,
    pub session: SessionOpts,
    pub control: Control,
    pub proxy: Proxy,
}

impl Config {
    pub async fn read<P>(path: P) -> eyre::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path).await?;
        let x = data.parse()?;
        Ok(x)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    ExpectedStorePath,
    MixedSources,
    Forward(forward::ParseForwardError),
    Listener(listener::ParseListenerError),
    Session(session::ParseSessionError),
    Control(control::ParseControlError),
    Proxy(control::ParseProxyError),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpectedStorePath => f.write_str("expected a path for 'store'"),
            Self::MixedSources => {
                f.write_str("'store' and 'forward' directives cannot be used together")
            }
            Self::Forward(x) => x.fmt(f),
            Self::Listener(x) => x.fmt(f),
            Self::Session(x) => x.fmt(f),
            Self::Control(x) => x.fmt(f),
            Self::Proxy(x) => x.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    line: usize,
    kind: ParseErrorKind,
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut config = Self::default();

        let lines = s
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, line)| !line.is_empty())
            .filter(|(_, line)| !line.starts_with('#'));

        for (i, line) in lines {
            let parse_error =
                |kind: ParseErrorKind| -> ParseError { ParseError { line: i + 1, kind } };

            let mut stream = parse_stream(line);

            let Some(directive) = stream.next() else {
                continue;
            };

            match directive {
                "store" => {
                    if !config.forward.is_empty() {
                        return Err(parse_error(ParseErrorKind::MixedSources));
                    }

                    let path = stream
                        .next()
                        .ok_or(ParseErrorKind::ExpectedStorePath)
                        .map_err(parse_error)?;

                    if config.store.replace(PathBuf::from(path)).is_some() {
                        warn!("line {}: overriding previous 'store'", i + 1);
                    }
                }

                "forward" => {
                    if config.store.is_some() {
                        return Err(parse_error(ParseErrorKind::MixedSources));
                    }

                    let x = Mapping::parse(&mut stream)
                        .map_err(ParseErrorKind::Forward)
                        .map_err(parse_error)?;

                    config.forward.push(x);
                }

                "listener" => {
                    config.listener = Listener::parse(&mut stream)
                        .map_err(ParseErrorKind::Listener)
                        .map_err(parse_error)?;
                }

                "session" => {
                    config.session = SessionOpts::parse(&mut stream)
                        .map_err(ParseErrorKind::Session)
                        .map_err(parse_error)?;
                }

                "control" => {
                    config.control = Control::parse(&mut stream)
                        .map_err(ParseErrorKind::Control)
                        .map_err(parse_error)?;
                }

                "proxy" => {
                    config.proxy = Proxy::parse(&mut stream)
                        .map_err(ParseErrorKind::Proxy)
                        .map_err(parse_error)?;
                }

                x => {
                    warn!("skipping unknown directive '{x}'")
                }
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use super::*;

    #[test]
    fn full_config() {
        let config: Config = r#"
            # listeners
            listener bind 127.0.0.1 backlog 64
            session connect-timeout 5 idle-timeout 120 buffer 16384

            control 0.0.0.0:9090 probe 3
            proxy timeout 10

            forward 9000 to 127.0.0.1:9100 desc echo
            forward 9001 to db.internal:5432 inactive
        "#
        .parse()
        .unwrap();

        assert_eq!(config.store, None);
        assert_eq!(config.forward.len(), 2);
        assert!(!config.forward[1].active);

        assert_eq!(config.listener.bind, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.listener.backlog, 64);

        assert_eq!(config.session.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.session.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.session.buffer_size, 16384);

        assert_eq!(config.control.addr.port(), 9090);
        assert_eq!(config.control.probe, 3);
        assert_eq!(config.proxy.timeout, Duration::from_secs(10));
    }

    #[test]
    fn defaults() {
        let config: Config = "store /mnt/data/port_mappings.json".parse().unwrap();

        assert_eq!(
            config.store.as_deref(),
            Some(Path::new("/mnt/data/port_mappings.json"))
        );
        assert_eq!(config.listener, Listener::default());
        assert_eq!(config.control, Control::default());
        assert_eq!(config.session.buffer_size, 8192);
    }

    #[test]
    fn errors_carry_line() {
        let e = "\n\nsession buffer 12".parse::<Config>().unwrap_err();
        assert_eq!(e.line, 3);
        assert_eq!(
            e.kind,
            ParseErrorKind::Session(session::ParseSessionError::BufferOutOfRange)
        );

        let e = "listener backlog 2".parse::<Config>().unwrap_err();
        assert_eq!(
            e.kind,
            ParseErrorKind::Listener(listener::ParseListenerError::BacklogTooSmall)
        );

        let e = "control 0.0.0.0:8080 probe 0".parse::<Config>().unwrap_err();
        assert_eq!(
            e.kind,
            ParseErrorKind::Control(control::ParseControlError::ZeroProbe)
        );
    }

    #[test]
    fn store_and_forward_are_exclusive() {
        let e = "store a.json\nforward 1 to a:1"
            .parse::<Config>()
            .unwrap_err();

        assert_eq!(e.line, 2);
        assert_eq!(e.kind, ParseErrorKind::MixedSources);
    }
}

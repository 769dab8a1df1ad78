use std::iter::Peekable;
use std::str::FromStr;
use std::time::Duration;

use miniarg::split_args::SplitArgs;

pub type ParseStream<'a> = Peekable<SplitArgs<'a>>;

pub fn parse_stream(s: &str) -> ParseStream<'_> {
    SplitArgs::new(s).peekable()
}

pub trait Parse {
    type Output;
    type Error;

    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error>;
}

/// Take the value of a `<property> <value>` pair.
pub fn value<T, E>(
    stream: &mut ParseStream<'_>,
    expected: E,
    invalid: impl FnOnce(T::Err) -> E,
) -> Result<T, E>
where
    T: FromStr,
{
    stream.next().ok_or(expected)?.parse().map_err(invalid)
}

/// Like [`value`] but for a whole number of seconds.
pub fn seconds<E>(
    stream: &mut ParseStream<'_>,
    expected: E,
    invalid: impl FnOnce(<u64 as FromStr>::Err) -> E,
) -> Result<Duration, E> {
    value(stream, expected, invalid).map(Duration::from_secs)
}

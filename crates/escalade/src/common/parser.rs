use std::fmt::{Debug, Display, Formatter};

use nom::IResult;
use nom::character::complete::digit1;
use nom::combinator::{all_consuming, map_res};
use nom::error::{ErrorKind, FromExternalError, ParseError};

pub enum ParserError<I> {
    Custom(anyhow::Error),
    Nom(I, ErrorKind),
}

impl<I: Debug> Debug for ParserError<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Custom(error) => f.write_fmt(format_args!("Semantic error at {error}")),
            Self::Nom(input, error) => f.write_fmt(format_args!(
                "Parser error at '{input:?}': expecting {error:?}"
            )),
        }
    }
}

impl<I> ParseError<I> for ParserError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        ParserError::Nom(input, kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<I: Display, E: Into<anyhow::Error>> FromExternalError<I, E> for ParserError<I> {
    fn from_external_error(input: I, _: ErrorKind, error: E) -> Self {
        ParserError::Custom(anyhow::anyhow!("'{}': {}", input, error.into()))
    }
}

pub fn format_parse_error<I: Debug>(error: nom::Err<ParserError<I>>) -> anyhow::Error {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => anyhow::anyhow!("{:?}", e),
        _ => anyhow::anyhow!(error.to_string()),
    }
}

pub type NomResult<'a, Ret> = IResult<&'a str, Ret, ParserError<&'a str>>;

pub fn p_u32(input: &str) -> NomResult<u32> {
    map_res(digit1, |digit_str: &str| digit_str.parse::<u32>())(input)
}

/// Runs `parser` over `input` and fails if the whole input was not consumed.
pub fn consume_all<'a, Ret>(
    parser: impl FnMut(&'a str) -> NomResult<'a, Ret>,
    input: &'a str,
) -> anyhow::Result<Ret> {
    all_consuming(parser)(input)
        .map(|r| r.1)
        .map_err(format_parse_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nom::combinator::all_consuming;

    #[test]
    fn parse_uint() {
        assert_eq!(all_consuming(p_u32)("1019").unwrap().1, 1019);
        assert_eq!(all_consuming(p_u32)("0").unwrap().1, 0);
        assert!(all_consuming(p_u32)("").is_err());
        assert!(all_consuming(p_u32)("x").is_err());
    }
}

use std::time::Duration;

use anyhow::anyhow;
use nom::character::complete::char;
use nom::combinator::{map_res, opt};
use nom::sequence::{preceded, tuple};

use crate::common::parser::{NomResult, consume_all, p_u32};

/// Parses time strings in the format [[hh:]mm:]ss.
/// Individual time values may be zero padded.
pub fn parse_hms_time(input: &str) -> anyhow::Result<Duration> {
    let parser = map_res(
        tuple((
            p_u32,
            opt(preceded(char(':'), p_u32)),
            opt(preceded(char(':'), p_u32)),
        )),
        |parsed| match parsed {
            (seconds, None, None) => Ok(Duration::from_secs(seconds as u64)),
            (minutes, Some(seconds), None) => {
                Ok(Duration::from_secs(minutes as u64 * 60 + seconds as u64))
            }
            (hours, Some(minutes), Some(seconds)) => Ok(Duration::from_secs(
                hours as u64 * 3600 + minutes as u64 * 60 + seconds as u64,
            )),
            _ => Err(anyhow!("Invalid time specification")),
        },
    );
    consume_all(parser, input)
}

/// Accepts either the scheduler's `HH:MM:SS` form or a humantime value (`2h`).
pub fn parse_hms_or_human_time(text: &str) -> anyhow::Result<Duration> {
    parse_hms_time(text)
        .or_else(|_| humantime::parse_duration(text).map_err(anyhow::Error::from))
        .map_err(|e| {
            anyhow!("Could not parse walltime. Use either `HH:MM:SS` or humantime format (2hours): {e:?}")
        })
}

/// Formats a duration as a scheduler time string, e.g. 01:05:02.
pub fn format_hms(duration: &Duration) -> String {
    let total = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hms_seconds() {
        assert_eq!(parse_hms_time("01").unwrap().as_secs(), 1);
        assert_eq!(parse_hms_time("90").unwrap().as_secs(), 90);
    }

    #[test]
    fn parse_hms_minutes() {
        assert_eq!(parse_hms_time("1:1").unwrap().as_secs(), 61);
        assert_eq!(parse_hms_time("80:02").unwrap().as_secs(), 80 * 60 + 2);
    }

    #[test]
    fn parse_hms_hours() {
        assert_eq!(parse_hms_time("1:1:1").unwrap().as_secs(), 3661);
        assert_eq!(
            parse_hms_time("02:03:04").unwrap().as_secs(),
            2 * 3600 + 3 * 60 + 4
        );
    }

    #[test]
    fn format_hms_output() {
        assert_eq!(format_hms(&Duration::from_secs(3902)), "01:05:02");
        assert_eq!(format_hms(&Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_hms(&Duration::from_secs(25 * 3600)), "25:00:00");
    }
}

use anyhow::anyhow;
use nom::bytes::complete::tag;
use nom::combinator::{map_res, opt};
use nom::multi::separated_list1;
use nom::sequence::{preceded, tuple};

use crate::Set;
use crate::common::arraydef::{IntArray, IntRange};
use crate::common::parser::{NomResult, consume_all, p_u32};

/// Parses a single segment in the format `n[-end][:step]`.
fn p_segment(input: &str) -> NomResult<IntRange> {
    map_res(
        tuple((
            p_u32,
            opt(preceded(tag("-"), p_u32)),
            opt(preceded(tag(":"), p_u32)),
        )),
        |r| match r {
            (v, None, None) => Ok(IntRange::new(v, 1, 1)),
            (v, Some(w), None) if w >= v => Ok(IntRange::new(v, w - v + 1, 1)),
            (v, Some(w), Some(s)) if w >= v && s > 0 && s <= w - v => {
                Ok(IntRange::new(v, w - v + 1, s))
            }
            _ => Err(anyhow!("Invalid range")),
        },
    )(input)
}

fn p_segments(input: &str) -> NomResult<IntArray> {
    map_res(separated_list1(tag(","), p_segment), |ranges| {
        if is_overlapping(&ranges) {
            Err(anyhow!("Segments overlap"))
        } else {
            Ok(IntArray::new(ranges))
        }
    })(input)
}

fn is_overlapping(ranges: &[IntRange]) -> bool {
    let mut ids = Set::new();
    for range in ranges {
        if range.iter().any(|x| !ids.insert(x)) {
            return true;
        }
    }
    false
}

/// Parses comma-separated range-stride segments.
/// Makes sure that the segments do not overlap.
pub fn parse_array(input: &str) -> anyhow::Result<IntArray> {
    consume_all(p_segments, input)
}

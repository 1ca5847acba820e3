use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::common::arrayparser::parse_array;

/// A run of task indices covering the span `start..start + count`,
/// visiting every `step`-th value.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRange {
    pub start: u32,
    pub count: u32,
    pub step: u32,
}

impl IntRange {
    pub fn new(start: u32, count: u32, step: u32) -> IntRange {
        debug_assert!(count > 0 && step > 0);
        IntRange { start, count, step }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        (self.start..self.start + self.count).step_by(self.step as usize)
    }

    pub fn contains(&self, value: u32) -> bool {
        let end = self.start + self.count;
        self.start <= value && value < end && ((value - self.start) % self.step == 0)
    }

    pub fn id_count(&self) -> u32 {
        (self.count + self.step - 1) / self.step
    }

    fn last(&self) -> u32 {
        self.start + ((self.count - 1) / self.step) * self.step
    }
}

/// A set of task indices in the scheduler's range-stride notation:
/// comma-separated singletons `n`, dense runs `a-b` and strided runs `a-b:s`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IntArray {
    ranges: Vec<IntRange>,
}

impl IntArray {
    pub fn new_empty() -> IntArray {
        Self::new(Vec::new())
    }

    pub fn new(ranges: Vec<IntRange>) -> IntArray {
        IntArray { ranges }
    }

    pub fn from_id(id: u32) -> IntArray {
        IntArray::new(vec![IntRange::new(id, 1, 1)])
    }

    /// Builds the canonical compressed form of an arbitrary index set.
    ///
    /// The input is sorted and deduplicated first. Sets that are a union of
    /// up to five interleaved arithmetic progressions with a common stride
    /// are emitted as one strided run per progression; anything else goes
    /// through greedy run extension with singleton fallback.
    pub fn from_ids(ids: &[u32]) -> IntArray {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        compress(&ids)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[inline]
    pub fn id_count(&self) -> u32 {
        self.ranges.iter().map(|x| x.id_count()).sum()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|x| x.iter())
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.ranges.iter().any(|range| range.contains(id))
    }

    /// Enumerated canonical form: every index, ascending.
    pub fn sorted_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.iter().collect();
        ids.sort_unstable();
        ids
    }

    /// Character count of the textual spec; the gating metric for batching.
    pub fn spec_len(&self) -> usize {
        self.to_string().len()
    }
}

impl FromStr for IntArray {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_array(s)
    }
}

impl fmt::Display for IntArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, x) in self.ranges.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            if x.id_count() == 1 {
                write!(f, "{}", x.start)?;
            } else if x.step == 1 {
                write!(f, "{}-{}", x.start, x.last())?;
            } else {
                write!(f, "{}-{}:{}", x.start, x.last(), x.step)?;
            }
        }
        Ok(())
    }
}

fn compress(ids: &[u32]) -> IntArray {
    match ids.len() {
        0 => return IntArray::new_empty(),
        1 => return IntArray::from_id(ids[0]),
        _ => {}
    }

    let gaps: Vec<u32> = ids.windows(2).map(|w| w[1] - w[0]).collect();
    if !gaps.windows(2).all(|w| w[0] == w[1]) {
        if let Some(period) = detect_gap_period(&gaps) {
            return compress_interleaved(ids, &gaps, period);
        }
    }
    compress_greedy(ids)
}

/// Finds the smallest period `p` in 2..=5 for which the gap sequence is
/// `p`-periodic over its whole length, with enough repetitions to make the
/// strided output worthwhile.
fn detect_gap_period(gaps: &[u32]) -> Option<usize> {
    (2..=5).find(|&period| {
        gaps.len() >= period * 2 + 1 && (period..gaps.len()).all(|i| gaps[i] == gaps[i % period])
    })
}

/// Emits one strided run per interleaved progression. All progressions share
/// the stride `sum(gaps[0..period])`.
fn compress_interleaved(ids: &[u32], gaps: &[u32], period: usize) -> IntArray {
    let stride: u32 = gaps[..period].iter().sum();
    let mut ranges = Vec::with_capacity(period);
    for offset in 0..period {
        let seq: Vec<u32> = ids.iter().copied().skip(offset).step_by(period).collect();
        let (first, last) = (seq[0], seq[seq.len() - 1]);
        match seq.len() {
            1 => ranges.push(IntRange::new(first, 1, 1)),
            2 if last == first + 1 => ranges.push(IntRange::new(first, 2, 1)),
            2 => {
                ranges.push(IntRange::new(first, 1, 1));
                ranges.push(IntRange::new(last, 1, 1));
            }
            _ => ranges.push(IntRange::new(first, last - first + 1, stride)),
        }
    }
    IntArray::new(ranges)
}

/// Starting at the leftmost unconsumed index, extends a run with the stride
/// given by the first observed gap. Runs of at least three elements (or two
/// consecutive ones) become segments; shorter tails fall back to singletons.
fn compress_greedy(ids: &[u32]) -> IntArray {
    let mut ranges = Vec::new();
    let mut i = 0;
    while i < ids.len() {
        let start = ids[i];
        if i + 1 == ids.len() {
            ranges.push(IntRange::new(start, 1, 1));
            break;
        }
        let stride = ids[i + 1] - start;
        let mut last = ids[i + 1];
        let mut j = i + 2;
        while j < ids.len() && ids[j] == last + stride {
            last = ids[j];
            j += 1;
        }
        let run_len = j - i;
        if run_len >= 3 {
            ranges.push(IntRange::new(start, last - start + 1, stride));
            i = j;
        } else if stride == 1 {
            ranges.push(IntRange::new(start, 2, 1));
            i = j;
        } else {
            ranges.push(IntRange::new(start, 1, 1));
            i += 1;
        }
    }
    IntArray::new(ranges)
}

/// Splits `ids` into consecutive batches whose compressed specs all fit
/// within `budget` characters. Starts from 500 indices per batch and halves
/// until every batch fits.
pub fn batch_ids(ids: &[u32], budget: usize) -> anyhow::Result<Vec<IntArray>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut size = 500usize.min(ids.len());
    while size > 0 {
        let batches: Vec<IntArray> = ids.chunks(size).map(IntArray::from_ids).collect();
        if batches.iter().all(|b| b.spec_len() <= budget) {
            return Ok(batches);
        }
        size /= 2;
    }
    anyhow::bail!(
        "Cannot fit a single task index within the array spec budget of {} characters",
        budget
    )
}

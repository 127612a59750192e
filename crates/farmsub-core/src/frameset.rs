//! Frame-set algebra: ordered, deduplicated integer frame collections stored
//! compactly as run-length ranges with an optional step.
//!
//! Two sets holding the same frames always normalize to identical runs, so
//! equality is set equality and formatting is canonical. Parse errors are
//! surfaced as values; resolution treats an unparsable override as absent and
//! warns, it never aborts.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One inclusive run of frames: `start`, `start + step`, ... up to `end`.
///
/// Normal form keeps `step >= 1` and `end` landing exactly on the last frame
/// of the run (`(end - start) % step == 0`). A single frame is `start == end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRun {
    /// First frame of the run.
    pub start: i64,
    /// Last frame of the run (inclusive, on-step).
    pub end: i64,
    /// Distance between consecutive frames, `>= 1`.
    pub step: i64,
}

impl FrameRun {
    fn single(frame: i64) -> Self {
        Self { start: frame, end: frame, step: 1 }
    }

    fn holds(&self, frame: i64) -> bool {
        frame >= self.start && frame <= self.end && (frame - self.start) % self.step == 0
    }

    fn frame_count(&self) -> u64 {
        ((self.end - self.start) / self.step) as u64 + 1
    }
}

impl fmt::Display for FrameRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else if self.step == 1 {
            write!(f, "{}-{}", self.start, self.end)
        } else {
            write!(f, "{}-{}x{}", self.start, self.end, self.step)
        }
    }
}

/// An ordered set of distinct frame numbers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSet {
    runs: Vec<FrameRun>,
}

impl FrameSet {
    /// The empty set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a set from any frame iterator; duplicates and ordering are
    /// normalized away.
    pub fn from_frames(frames: impl IntoIterator<Item = i64>) -> Self {
        let mut frames: Vec<i64> = frames.into_iter().collect();
        frames.sort_unstable();
        frames.dedup();
        Self { runs: compress(&frames) }
    }

    /// Parses the textual form `group("," group)*` where a group is `N`,
    /// `A-B` or `A-BxS` (whitespace tolerated, negative frames allowed).
    /// Blank input and blank groups parse as the empty set.
    pub fn parse(text: &str) -> Result<Self, FrameParseError> {
        let mut frames = Vec::new();
        for group in text.split(',') {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }
            let run = parse_group(group)?;
            frames.extend((run.start..=run.end).step_by(run.step as usize));
        }
        Ok(Self::from_frames(frames))
    }

    /// True when the set holds no frames.
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Number of frames in the set.
    pub fn count(&self) -> u64 {
        self.runs.iter().map(FrameRun::frame_count).sum()
    }

    /// Lowest frame, if any.
    pub fn first(&self) -> Option<i64> {
        self.runs.first().map(|r| r.start)
    }

    /// Highest frame, if any.
    pub fn last(&self) -> Option<i64> {
        self.runs.last().map(|r| r.end)
    }

    /// Lowest and highest frame together.
    pub fn bounds(&self) -> Option<(i64, i64)> {
        Some((self.first()?, self.last()?))
    }

    /// Membership test.
    pub fn contains(&self, frame: i64) -> bool {
        // Runs are disjoint and sorted, so only the run starting at or before
        // the frame can hold it.
        match self.runs.binary_search_by(|r| r.start.cmp(&frame)) {
            Ok(_) => true,
            Err(0) => false,
            Err(i) => self.runs[i - 1].holds(frame),
        }
    }

    /// Iterates frames in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.runs
            .iter()
            .flat_map(|r| (r.start..=r.end).step_by(r.step as usize))
    }

    /// The normalized runs backing this set.
    pub fn runs(&self) -> &[FrameRun] {
        &self.runs
    }

    /// Frames in `self` or `other`.
    pub fn union(&self, other: &FrameSet) -> FrameSet {
        FrameSet::from_frames(self.iter().chain(other.iter()))
    }

    /// Frames in `self` but not in `other`.
    pub fn difference(&self, other: &FrameSet) -> FrameSet {
        FrameSet::from_frames(self.iter().filter(|f| !other.contains(*f)))
    }

    /// Frames in both `self` and `other`.
    pub fn intersection(&self, other: &FrameSet) -> FrameSet {
        FrameSet::from_frames(self.iter().filter(|f| other.contains(*f)))
    }

    /// True when every frame of `self` is in `other`.
    pub fn is_subset_of(&self, other: &FrameSet) -> bool {
        self.iter().all(|f| other.contains(f))
    }
}

impl FromIterator<i64> for FrameSet {
    fn from_iter<T: IntoIterator<Item = i64>>(iter: T) -> Self {
        Self::from_frames(iter)
    }
}

impl fmt::Display for FrameSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, run) in self.runs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            run.fmt(f)?;
        }
        Ok(())
    }
}

/// Why a frame-range string failed to parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameParseError {
    /// A group held no readable integer where one was required.
    #[error("unreadable frame number in '{0}'")]
    Number(String),
    /// Range end was below its start.
    #[error("reversed range {start}-{end}")]
    Reversed {
        /// Range start as written.
        start: i64,
        /// Range end as written.
        end: i64,
    },
    /// Step was zero or negative.
    #[error("step must be positive, got {0}")]
    Step(i64),
    /// Text left over after a well-formed group.
    #[error("trailing text '{rest}' in group '{group}'")]
    Trailing {
        /// The whole offending group.
        group: String,
        /// The unconsumed tail.
        rest: String,
    },
}

/// Greedy run compression over sorted, deduplicated frames. A step above 1 is
/// only worth a run when it covers at least three frames; a two-frame gap
/// stays as two singles so formatting round-trips unambiguously.
fn compress(frames: &[i64]) -> Vec<FrameRun> {
    let mut runs = Vec::new();
    let mut i = 0;
    while i < frames.len() {
        if i + 1 == frames.len() {
            runs.push(FrameRun::single(frames[i]));
            break;
        }
        let step = frames[i + 1] - frames[i];
        let mut j = i + 1;
        while j + 1 < frames.len() && frames[j + 1] - frames[j] == step {
            j += 1;
        }
        let span = j - i + 1;
        if step == 1 || span >= 3 {
            runs.push(FrameRun { start: frames[i], end: frames[j], step });
            i = j + 1;
        } else {
            runs.push(FrameRun::single(frames[i]));
            i += 1;
        }
    }
    runs
}

/// Reads one leading (possibly negative) integer, returning it and the rest.
fn parse_int(text: &str) -> Option<(i64, &str)> {
    let (neg, rest) = match text.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, text),
    };
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let (digits, rest) = rest.split_at(digits_end);
    let value: i64 = digits.parse().ok()?;
    Some((if neg { -value } else { value }, rest))
}

fn parse_group(group: &str) -> Result<FrameRun, FrameParseError> {
    let (start, rest) =
        parse_int(group).ok_or_else(|| FrameParseError::Number(group.to_string()))?;
    if rest.is_empty() {
        return Ok(FrameRun::single(start));
    }
    let rest = rest
        .strip_prefix('-')
        .ok_or_else(|| FrameParseError::Trailing {
            group: group.to_string(),
            rest: rest.to_string(),
        })?;
    let (end, rest) =
        parse_int(rest).ok_or_else(|| FrameParseError::Number(group.to_string()))?;
    let (step, rest) = match rest.strip_prefix('x') {
        Some(tail) => {
            let (step, tail) =
                parse_int(tail).ok_or_else(|| FrameParseError::Number(group.to_string()))?;
            (step, tail)
        }
        None => (1, rest),
    };
    if !rest.is_empty() {
        return Err(FrameParseError::Trailing {
            group: group.to_string(),
            rest: rest.to_string(),
        });
    }
    if step < 1 {
        return Err(FrameParseError::Step(step));
    }
    if end < start {
        return Err(FrameParseError::Reversed { start, end });
    }
    // Land the end on the last on-step frame.
    let end = end - ((end - start) % step);
    Ok(FrameRun { start, end, step })
}

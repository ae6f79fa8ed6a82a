use crate::testcase::TestcaseId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open testcase id window `[start, end)` covering one continuous fuzzer run.
///
/// `end == None` marks the final segment, which extends past the last recorded restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentBounds {
    pub start: TestcaseId,
    pub end: Option<TestcaseId>,
}

impl SegmentBounds {
    pub fn contains(&self, id: TestcaseId) -> bool {
        id >= self.start && self.end.is_none_or(|end| id < end)
    }

    pub fn is_open_ended(&self) -> bool {
        self.end.is_none()
    }
}

impl fmt::Display for SegmentBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}, ∞)", self.start),
        }
    }
}

/// Builds segment windows from restart ids: `[(0, r1), (r1, r2), …, (rn, ∞)]`.
///
/// Restart events are logged right after the fuzzer came back up, so the id of a
/// restart is the first id of the next run. Ids are sorted and deduplicated
/// first; the result always has `restarts + 1` entries.
pub fn restart_segments(restart_ids: &[TestcaseId]) -> Vec<SegmentBounds> {
    let mut ids = restart_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let mut segments = Vec::with_capacity(ids.len() + 1);
    let mut start = 0;
    for id in ids {
        segments.push(SegmentBounds {
            start,
            end: Some(id),
        });
        start = id;
    }
    segments.push(SegmentBounds { start, end: None });
    segments
}

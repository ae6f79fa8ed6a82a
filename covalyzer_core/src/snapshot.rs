use crate::testcase::{QueuedTestcase, Testcase};
use std::collections::BTreeMap;
use std::num::NonZeroU32;

/// Default width of a snapshot window: 15 minutes.
pub const DEFAULT_SNAPSHOT_WINDOW_SECS: u32 = 900;

/// Sparse mapping from bucket index to the testcases queued inside that window.
///
/// Buckets with no queue events are absent; iteration is in ascending bucket order.
pub type SnapshotBuckets = BTreeMap<i64, Vec<Testcase>>;

pub fn default_snapshot_window() -> NonZeroU32 {
    const WINDOW: NonZeroU32 = match NonZeroU32::new(DEFAULT_SNAPSHOT_WINDOW_SECS) {
        Some(window) => window,
        None => panic!("snapshot window must be non-zero"),
    };
    WINDOW
}

/// Index of the window a timestamp falls into, `floor(timestamp / window)`.
pub fn bucket_index(timestamp: i64, window: NonZeroU32) -> i64 {
    timestamp.div_euclid(i64::from(window.get()))
}

/// Groups queue events into fixed-width time windows.
///
/// Events are expected in ascending timestamp order (as the store returns them);
/// the order inside each bucket follows the input order.
pub fn bucket_queue_events<T>(events: T, window: NonZeroU32) -> SnapshotBuckets
where
    T: IntoIterator<Item = QueuedTestcase>,
{
    let mut buckets = SnapshotBuckets::new();
    for queued in events {
        buckets
            .entry(bucket_index(queued.timestamp, window))
            .or_default()
            .push(queued.testcase);
    }
    buckets
}

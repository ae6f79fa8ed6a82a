use crate::segment::SegmentBounds;
use crate::snapshot::{SnapshotBuckets, bucket_queue_events};
use crate::testcase::{QueueEvent, QueuedTestcase, RestartEvent, Testcase, TestcaseId};
use rusqlite::{Connection, OpenFlags, Row, params};
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors surfaced by a corpus store.
///
/// The store is assumed to be local and reliable, so none of these are retried:
/// a failing query means a corrupt or misconfigured database.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database file does not exist at the configured location.
    #[error("Testcase database not found at {0:?}")]
    NotFound(PathBuf),

    /// An SQLite query or connection failure.
    #[error("Testcase database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A page request whose bounds cannot be expressed to the backend.
    #[error("Invalid page request (offset {offset}, limit {limit})")]
    InvalidPage { offset: u64, limit: u64 },
}

/// Read-only query surface over a persisted testcase corpus.
///
/// All orderings are stable across calls so that callers can resume paging by
/// offset and rebuild the same partitions on every run.
pub trait CorpusStore {
    /// Returns at most `limit` testcases starting at `offset`, in ascending id order.
    ///
    /// With `queue_only` set, only testcases that also appear in the queue are
    /// considered. End of corpus is signalled by a short or empty page.
    fn fetch_testcases(
        &self,
        offset: u64,
        limit: u64,
        queue_only: bool,
    ) -> Result<Vec<Testcase>, StoreError>;

    /// Returns all testcases whose id falls inside `bounds`, in ascending id order.
    fn fetch_testcase_range(
        &self,
        bounds: &SegmentBounds,
        queue_only: bool,
    ) -> Result<Vec<Testcase>, StoreError>;

    /// Returns every queue event joined with its testcase, ordered by timestamp
    /// (ties broken by id).
    fn fetch_queue_events(&self) -> Result<Vec<QueuedTestcase>, StoreError>;

    /// Returns the ids of recorded restart events in ascending order.
    fn fetch_restart_boundaries(&self) -> Result<Vec<TestcaseId>, StoreError>;

    /// Reads the whole queue once and groups it into snapshot windows.
    fn fetch_queue_snapshots(&self, window: NonZeroU32) -> Result<SnapshotBuckets, StoreError> {
        Ok(bucket_queue_events(self.fetch_queue_events()?, window))
    }
}

impl<S: CorpusStore + ?Sized> CorpusStore for &S {
    fn fetch_testcases(
        &self,
        offset: u64,
        limit: u64,
        queue_only: bool,
    ) -> Result<Vec<Testcase>, StoreError> {
        (**self).fetch_testcases(offset, limit, queue_only)
    }

    fn fetch_testcase_range(
        &self,
        bounds: &SegmentBounds,
        queue_only: bool,
    ) -> Result<Vec<Testcase>, StoreError> {
        (**self).fetch_testcase_range(bounds, queue_only)
    }

    fn fetch_queue_events(&self) -> Result<Vec<QueuedTestcase>, StoreError> {
        (**self).fetch_queue_events()
    }

    fn fetch_restart_boundaries(&self) -> Result<Vec<TestcaseId>, StoreError> {
        (**self).fetch_restart_boundaries()
    }
}

/// Corpus store backed by the fuzzer's SQLite testcase database.
///
/// Expected schema:
/// `testcases(id INTEGER PRIMARY KEY, value BLOB)`,
/// `queue(id INTEGER, timestamp INTEGER)`,
/// `restarts(id INTEGER, eventtype TEXT)`.
pub struct SqliteCorpusStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteCorpusStore {
    /// Opens an existing database read-only.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.is_file() {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn row_to_testcase(row: &Row<'_>) -> rusqlite::Result<Testcase> {
        Ok(Testcase {
            id: row.get(0)?,
            bytes: row.get(1)?,
        })
    }

    fn page_bound(offset: u64, limit: u64) -> Result<(i64, i64), StoreError> {
        match (i64::try_from(offset), i64::try_from(limit)) {
            (Ok(o), Ok(l)) => Ok((o, l)),
            _ => Err(StoreError::InvalidPage { offset, limit }),
        }
    }
}

impl CorpusStore for SqliteCorpusStore {
    fn fetch_testcases(
        &self,
        offset: u64,
        limit: u64,
        queue_only: bool,
    ) -> Result<Vec<Testcase>, StoreError> {
        let (offset, limit) = Self::page_bound(offset, limit)?;
        let sql = if queue_only {
            "SELECT t.id, t.value FROM testcases t
             WHERE EXISTS (SELECT 1 FROM queue q WHERE q.id = t.id)
             ORDER BY t.id LIMIT ?1 OFFSET ?2"
        } else {
            "SELECT id, value FROM testcases ORDER BY id LIMIT ?1 OFFSET ?2"
        };
        let mut stmt = self.conn.prepare_cached(sql)?;
        let page = stmt
            .query_map(params![limit, offset], Self::row_to_testcase)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(page)
    }

    fn fetch_testcase_range(
        &self,
        bounds: &SegmentBounds,
        queue_only: bool,
    ) -> Result<Vec<Testcase>, StoreError> {
        let sql = if queue_only {
            "SELECT t.id, t.value FROM testcases t
             WHERE t.id >= ?1 AND (?2 IS NULL OR t.id < ?2)
               AND EXISTS (SELECT 1 FROM queue q WHERE q.id = t.id)
             ORDER BY t.id"
        } else {
            "SELECT id, value FROM testcases
             WHERE id >= ?1 AND (?2 IS NULL OR id < ?2)
             ORDER BY id"
        };
        let mut stmt = self.conn.prepare_cached(sql)?;
        let segment = stmt
            .query_map(params![bounds.start, bounds.end], Self::row_to_testcase)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(segment)
    }

    fn fetch_queue_events(&self) -> Result<Vec<QueuedTestcase>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT q.id, t.value, q.timestamp FROM queue q
             JOIN testcases t ON q.id = t.id
             ORDER BY q.timestamp ASC, q.id ASC",
        )?;
        let events = stmt
            .query_map([], |row| {
                Ok(QueuedTestcase {
                    testcase: Self::row_to_testcase(row)?,
                    timestamp: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn fetch_restart_boundaries(&self) -> Result<Vec<TestcaseId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM restarts ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

impl std::fmt::Debug for SqliteCorpusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCorpusStore")
            .field("path", &self.path)
            .finish()
    }
}

/// A corpus held entirely in memory.
///
/// Mirrors the SQLite store's ordering rules; useful for embedding callers that
/// already hold a corpus and for exercising the replay engine without a database.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCorpusStore {
    testcases: Vec<Testcase>,
    queue: Vec<QueueEvent>,
    restarts: Vec<RestartEvent>,
}

impl InMemoryCorpusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a testcase, keeping the corpus sorted by id.
    pub fn add_testcase(&mut self, testcase: Testcase) {
        let pos = self.testcases.partition_point(|tc| tc.id < testcase.id);
        self.testcases.insert(pos, testcase);
    }

    pub fn add_queue_event(&mut self, event: QueueEvent) {
        self.queue.push(event);
    }

    pub fn add_restart(&mut self, event: RestartEvent) {
        self.restarts.push(event);
    }

    pub fn len(&self) -> usize {
        self.testcases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.testcases.is_empty()
    }

    fn queued_ids(&self) -> HashSet<TestcaseId> {
        self.queue.iter().map(|ev| ev.testcase_id).collect()
    }

    fn scoped(&self, queue_only: bool) -> Box<dyn Iterator<Item = &Testcase> + '_> {
        if queue_only {
            let queued = self.queued_ids();
            Box::new(
                self.testcases
                    .iter()
                    .filter(move |tc| queued.contains(&tc.id)),
            )
        } else {
            Box::new(self.testcases.iter())
        }
    }
}

impl CorpusStore for InMemoryCorpusStore {
    fn fetch_testcases(
        &self,
        offset: u64,
        limit: u64,
        queue_only: bool,
    ) -> Result<Vec<Testcase>, StoreError> {
        let (Ok(skip), Ok(take)) = (usize::try_from(offset), usize::try_from(limit)) else {
            return Err(StoreError::InvalidPage { offset, limit });
        };
        Ok(self.scoped(queue_only).skip(skip).take(take).cloned().collect())
    }

    fn fetch_testcase_range(
        &self,
        bounds: &SegmentBounds,
        queue_only: bool,
    ) -> Result<Vec<Testcase>, StoreError> {
        Ok(self
            .scoped(queue_only)
            .filter(|tc| bounds.contains(tc.id))
            .cloned()
            .collect())
    }

    fn fetch_queue_events(&self) -> Result<Vec<QueuedTestcase>, StoreError> {
        let mut events: Vec<QueuedTestcase> = self
            .queue
            .iter()
            .filter_map(|ev| {
                self.testcases
                    .binary_search_by_key(&ev.testcase_id, |tc| tc.id)
                    .ok()
                    .map(|idx| QueuedTestcase {
                        testcase: self.testcases[idx].clone(),
                        timestamp: ev.timestamp,
                    })
            })
            .collect();
        events.sort_by_key(|q| (q.timestamp, q.testcase.id));
        Ok(events)
    }

    fn fetch_restart_boundaries(&self) -> Result<Vec<TestcaseId>, StoreError> {
        let mut ids: Vec<TestcaseId> = self.restarts.iter().map(|ev| ev.id).collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Creates the fuzzer's schema in a fresh SQLite file and fills it.
    pub fn create_sqlite_corpus(
        path: &Path,
        testcases: &[Testcase],
        queue: &[QueueEvent],
        restarts: &[RestartEvent],
    ) -> rusqlite::Result<()> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE testcases (id INTEGER PRIMARY KEY, value BLOB NOT NULL);
             CREATE TABLE queue (id INTEGER NOT NULL, timestamp INTEGER NOT NULL);
             CREATE TABLE restarts (id INTEGER NOT NULL, eventtype TEXT);",
        )?;
        for tc in testcases {
            conn.execute(
                "INSERT INTO testcases (id, value) VALUES (?1, ?2)",
                params![tc.id, tc.bytes],
            )?;
        }
        for ev in queue {
            conn.execute(
                "INSERT INTO queue (id, timestamp) VALUES (?1, ?2)",
                params![ev.testcase_id, ev.timestamp],
            )?;
        }
        for ev in restarts {
            conn.execute(
                "INSERT INTO restarts (id, eventtype) VALUES (?1, ?2)",
                params![ev.id, ev.event_type],
            )?;
        }
        Ok(())
    }

    pub fn numbered_testcases(ids: std::ops::RangeInclusive<i64>) -> Vec<Testcase> {
        ids.map(|id| Testcase::new(id, id.to_le_bytes().to_vec()))
            .collect()
    }
}

use serde::{Deserialize, Serialize};

/// Identifier assigned to a testcase by the store. Monotonic in insertion order.
pub type TestcaseId = i64;

/// A single fuzzer-generated input as persisted in the testcase store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Testcase {
    pub id: TestcaseId,
    pub bytes: Vec<u8>,
}

impl Testcase {
    pub fn new(id: TestcaseId, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File name used when the testcase is materialized into an input directory.
    pub fn file_name(&self) -> String {
        format!("id_{}", self.id)
    }
}

/// Record of a testcase entering the fuzzer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub testcase_id: TestcaseId,
    /// Insertion time in seconds.
    pub timestamp: i64,
}

/// A queued testcase together with its insertion timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTestcase {
    pub testcase: Testcase,
    pub timestamp: i64,
}

impl QueuedTestcase {
    pub fn event(&self) -> QueueEvent {
        QueueEvent {
            testcase_id: self.testcase.id,
            timestamp: self.timestamp,
        }
    }
}

/// Marker logged right after the fuzzer process restarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartEvent {
    pub id: TestcaseId,
    pub event_type: String,
}

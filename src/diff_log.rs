//! Append-only diff log.
//!
//! Every diff that reaches the base arrangements (ingested or view-derived) is
//! appended here first-come, first-offset. Cursors are lazy and restartable: a
//! consumer that remembers its offset can resume from exactly that point.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::diff::Diff;
use crate::sync;
use crate::types::{Epoch, RelationName};

/// One appended batch.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub offset: u64,
    pub epoch: Epoch,
    pub source: String,
    pub diffs: Vec<Diff>,
}

/// Append-only stream of diff batches, addressed by offset.
#[derive(Debug, Default)]
pub struct DiffLog {
    entries: RwLock<Vec<Arc<LogEntry>>>,
}

impl DiffLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch, returning its offset.
    pub fn append(&self, epoch: Epoch, source: impl Into<String>, diffs: Vec<Diff>) -> u64 {
        let mut guard = sync::write(&self.entries);
        let offset = guard.len() as u64;
        guard.push(Arc::new(LogEntry {
            offset,
            epoch,
            source: source.into(),
            diffs,
        }));
        offset
    }

    /// Offset the next append will receive.
    #[must_use]
    pub fn high_watermark(&self) -> u64 {
        sync::read(&self.entries).len() as u64
    }

    /// Number of batches appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        sync::read(&self.entries).len()
    }

    /// Returns true if nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch one batch by offset.
    #[must_use]
    pub fn get(&self, offset: u64) -> Option<Arc<LogEntry>> {
        let idx = usize::try_from(offset).ok()?;
        sync::read(&self.entries).get(idx).cloned()
    }

    /// Cursor over all batches starting at `from`.
    #[must_use]
    pub fn cursor(self: &Arc<Self>, from: u64) -> DiffCursor {
        DiffCursor {
            log: Arc::clone(self),
            next: from,
            relation: None,
        }
    }

    /// Cursor over the diffs of one relation starting at `from`.
    #[must_use]
    pub fn cursor_for(self: &Arc<Self>, relation: RelationName, from: u64) -> DiffCursor {
        DiffCursor {
            log: Arc::clone(self),
            next: from,
            relation: Some(relation),
        }
    }
}

/// Lazy, restartable sequence over the diff log.
///
/// Reaching the end is not terminal: once more batches are appended, `next` yields
/// them.
#[derive(Debug, Clone)]
pub struct DiffCursor {
    log: Arc<DiffLog>,
    next: u64,
    relation: Option<RelationName>,
}

impl DiffCursor {
    /// Offset of the next batch this cursor will inspect.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.next
    }

    /// Restart from an arbitrary offset.
    pub fn seek(&mut self, offset: u64) {
        self.next = offset;
    }
}

impl Iterator for DiffCursor {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        loop {
            let entry = self.log.get(self.next)?;
            self.next += 1;
            match &self.relation {
                None => return Some(entry.as_ref().clone()),
                Some(rel) => {
                    let diffs: Vec<Diff> = entry
                        .diffs
                        .iter()
                        .filter(|d| &d.relation == rel)
                        .cloned()
                        .collect();
                    if diffs.is_empty() {
                        continue;
                    }
                    return Some(LogEntry {
                        offset: entry.offset,
                        epoch: entry.epoch,
                        source: entry.source.clone(),
                        diffs,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_resumes_after_new_appends() {
        let log = Arc::new(DiffLog::new());
        log.append(0, "s", vec![Diff::count("orders", "X", 1)]);

        let mut cursor = log.cursor(0);
        assert_eq!(cursor.next().map(|e| e.offset), Some(0));
        assert!(cursor.next().is_none());

        log.append(1, "s", vec![Diff::count("orders", "Y", 2)]);
        let entry = cursor.next().unwrap();
        assert_eq!(entry.offset, 1);
        assert_eq!(entry.epoch, 1);
    }

    #[test]
    fn relation_cursor_filters_and_restarts() {
        let log = Arc::new(DiffLog::new());
        log.append(0, "s", vec![Diff::count("orders", "X", 1), Diff::count("stock", "X", -1)]);
        log.append(0, "s", vec![Diff::count("stock", "Y", 5)]);
        log.append(1, "s", vec![Diff::count("orders", "Z", 1)]);

        let mut cursor = log.cursor_for(RelationName::from("orders"), 0);
        let first: Vec<u64> = cursor.by_ref().map(|e| e.offset).collect();
        assert_eq!(first, vec![0, 2]);

        cursor.seek(1);
        let again: Vec<_> = cursor.collect();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].diffs, vec![Diff::count("orders", "Z", 1)]);
    }

    #[test]
    fn high_watermark_tracks_appends() {
        let log = DiffLog::new();
        assert!(log.is_empty());
        assert_eq!(log.append(0, "a", Vec::new()), 0);
        assert_eq!(log.append(0, "b", Vec::new()), 1);
        assert_eq!(log.high_watermark(), 2);
    }
}

//! Indexed entry log with snapshot-prefix compaction.
//!
//! Indices are global and never reused. The live window `[base, next)` holds
//! the entries that have not been folded into a snapshot yet; the discarded
//! prefix is described only by its tip `(snapshot_last_index,
//! snapshot_last_term)`. A fresh log has `base = next = 1` and tip `(0, 0)`, so
//! index 0 resolves to a sentinel of term 0.

use raft::eraftpb::{Entry, EntryType};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What kind of raft entry a log slot holds. Only `Normal` entries carry
/// client commands; the others come from raft-rs itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Normal,
    ConfChange,
    ConfChangeV2,
}

impl From<EntryType> for EntryKind {
    fn from(t: EntryType) -> Self {
        match t {
            EntryType::EntryNormal => EntryKind::Normal,
            EntryType::EntryConfChange => EntryKind::ConfChange,
            EntryType::EntryConfChangeV2 => EntryKind::ConfChangeV2,
        }
    }
}

impl From<EntryKind> for EntryType {
    fn from(k: EntryKind) -> Self {
        match k {
            EntryKind::Normal => EntryType::EntryNormal,
            EntryKind::ConfChange => EntryType::EntryConfChange,
            EntryKind::ConfChangeV2 => EntryType::EntryConfChangeV2,
        }
    }
}

/// A single entry: an opaque payload plus the term it was appended in.
/// The index is implied by its position in the [`Log`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, data: Vec<u8>) -> Self {
        LogEntry {
            term,
            kind: EntryKind::Normal,
            data,
        }
    }

    pub fn from_raft(entry: &Entry) -> Self {
        LogEntry {
            term: entry.term,
            kind: entry.get_entry_type().into(),
            data: entry.data.to_vec(),
        }
    }

    pub fn to_raft(&self, index: u64) -> Entry {
        let mut entry = Entry::default();
        entry.set_entry_type(self.kind.into());
        entry.term = self.term;
        entry.index = index;
        entry.data = self.data.clone().into();
        entry
    }
}

/// Result of looking up a single index.
#[derive(Debug, PartialEq, Eq)]
pub enum LogLookup<'a> {
    /// Folded into the snapshot; only the snapshot knows about it now.
    Compacted,
    /// Inside the live window.
    Live(&'a LogEntry),
    /// Exactly the last index covered by the snapshot. Replicating the entry
    /// right after a snapshot needs this term as its `prev_log_term`.
    SnapshotTip { term: u64 },
    /// Past the end of the log.
    Absent,
}

impl LogLookup<'_> {
    pub fn term(&self) -> Option<u64> {
        match self {
            LogLookup::Live(entry) => Some(entry.term),
            LogLookup::SnapshotTip { term } => Some(*term),
            LogLookup::Compacted | LogLookup::Absent => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    base: u64,
    entries: Vec<LogEntry>,
    snapshot_last_index: u64,
    snapshot_last_term: u64,
}

impl Default for Log {
    fn default() -> Self {
        Log::new()
    }
}

impl Log {
    pub fn new() -> Self {
        Log {
            base: 1,
            entries: Vec::new(),
            snapshot_last_index: 0,
            snapshot_last_term: 0,
        }
    }

    /// First live index.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// One past the last live index.
    pub fn next_index(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    pub fn snapshot_last_index(&self) -> u64 {
        self.snapshot_last_index
    }

    pub fn snapshot_last_term(&self) -> u64 {
        self.snapshot_last_term
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index and term of the last entry, falling back to the snapshot tip when
    /// the live window is empty.
    pub fn last_index_and_term(&self) -> (u64, u64) {
        match self.entries.last() {
            Some(last) => (self.next_index() - 1, last.term),
            None => (self.snapshot_last_index, self.snapshot_last_term),
        }
    }

    pub fn entry_at(&self, index: u64) -> LogLookup<'_> {
        if index >= self.base && index < self.next_index() {
            LogLookup::Live(&self.entries[(index - self.base) as usize])
        } else if index == self.snapshot_last_index {
            LogLookup::SnapshotTip {
                term: self.snapshot_last_term,
            }
        } else if index < self.snapshot_last_index {
            LogLookup::Compacted
        } else {
            LogLookup::Absent
        }
    }

    /// Live entries in `[from, to)`. Fails unless the whole range is live.
    pub fn range(&self, from: u64, to: u64) -> Result<&[LogEntry]> {
        if from > to || from < self.base || to > self.next_index() {
            return Err(self.range_error(from, to));
        }
        let start = (from - self.base) as usize;
        let end = (to - self.base) as usize;
        Ok(&self.entries[start..end])
    }

    /// Appends after the last live entry and returns the index of the first
    /// appended one.
    pub fn append<I>(&mut self, entries: I) -> u64
    where
        I: IntoIterator<Item = LogEntry>,
    {
        let start = self.next_index();
        self.entries.extend(entries);
        start
    }

    /// Drops every entry with an index greater than `prev`.
    pub fn truncate_after(&mut self, prev: u64) -> Result<()> {
        if prev + 1 < self.base {
            return Err(self.range_error(prev + 1, self.next_index()));
        }
        if prev < self.next_index() {
            self.entries.truncate((prev + 1 - self.base) as usize);
        }
        Ok(())
    }

    /// True iff the entries at `(prev, prev + entries.len()]` carry the same
    /// terms as `entries`. Running past the end is a mismatch. Compacted slots
    /// are committed and therefore count as matching.
    pub fn matches(&self, prev: u64, entries: &[LogEntry]) -> bool {
        let next = self.next_index();
        entries.iter().enumerate().all(|(offset, entry)| {
            let index = prev + 1 + offset as u64;
            if index >= next {
                return false;
            }
            match self.entry_at(index) {
                LogLookup::Compacted => true,
                lookup => lookup.term() == Some(entry.term),
            }
        })
    }

    /// Removes the prefix `[base, up_to]`. The caller must move the snapshot
    /// tip with [`Log::set_snapshot_tip`] to match.
    pub fn compact(&mut self, up_to: u64) {
        if up_to < self.base {
            return;
        }
        let next = self.next_index();
        if up_to + 1 >= next {
            self.entries.clear();
        } else {
            self.entries.drain(..(up_to + 1 - self.base) as usize);
        }
        self.base = up_to + 1;
    }

    pub fn set_snapshot_tip(&mut self, index: u64, term: u64) {
        self.snapshot_last_index = index;
        self.snapshot_last_term = term;
    }

    /// Discards the whole live window and restarts the log right after a
    /// snapshot that supersedes it.
    pub fn restore(&mut self, index: u64, term: u64) {
        self.entries.clear();
        self.base = index + 1;
        self.set_snapshot_tip(index, term);
    }

    fn range_error(&self, from: u64, to: u64) -> Error {
        Error::LogRange {
            from,
            to,
            base: self.base,
            next: self.next_index(),
        }
    }
}

use std::cmp;
use std::sync::Arc;

use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::util::limit_size;
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::raft::log::{Log, LogEntry, LogLookup};
use crate::raft::persister::Persister;

/// Layout of the raft state blob handed to the persister.
#[derive(Serialize)]
struct PersistedStateRef<'a> {
    term: u64,
    vote: u64,
    commit: u64,
    voters: &'a [u64],
    learners: &'a [u64],
    log: &'a Log,
}

#[derive(Deserialize)]
struct PersistedState {
    term: u64,
    vote: u64,
    commit: u64,
    voters: Vec<u64>,
    learners: Vec<u64>,
    log: Log,
}

/// raft-rs storage backed by [`Log`], persisted as one blob per ready cycle.
pub struct LogStorage {
    log: Log,
    hard_state: HardState,
    conf_state: ConfState,
    snapshot: Snapshot,
    persister: Arc<dyn Persister>,
    dirty: bool,
}

impl LogStorage {
    /// Restores from whatever the persister holds, or starts an empty log
    /// with `voters` as the initial configuration.
    pub fn new(persister: Arc<dyn Persister>, voters: &[u64]) -> Result<Self> {
        let raw = persister.raft_state();
        if raw.is_empty() {
            return Ok(LogStorage {
                log: Log::new(),
                hard_state: HardState::default(),
                conf_state: ConfState::from((voters.to_vec(), vec![])),
                snapshot: Snapshot::default(),
                persister,
                dirty: false,
            });
        }

        let state: PersistedState = bincode::deserialize(&raw)?;
        let mut hard_state = HardState::default();
        hard_state.term = state.term;
        hard_state.vote = state.vote;
        hard_state.commit = state.commit;
        let conf_state = ConfState::from((state.voters, state.learners));

        let mut snapshot = Snapshot::default();
        if state.log.snapshot_last_index() > 0 {
            let metadata = snapshot.mut_metadata();
            metadata.index = state.log.snapshot_last_index();
            metadata.term = state.log.snapshot_last_term();
            metadata.set_conf_state(conf_state.clone());
            snapshot.set_data(persister.snapshot().into());
        }

        Ok(LogStorage {
            log: state.log,
            hard_state,
            conf_state,
            snapshot,
            persister,
            dirty: false,
        })
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn commit(&self) -> u64 {
        self.hard_state.commit
    }

    pub fn snapshot_index(&self) -> u64 {
        self.log.snapshot_last_index()
    }

    /// The latest snapshot, empty when the log was never compacted.
    pub fn latest_snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        let snapshot_index = self.log.snapshot_last_index();
        let entries: Vec<&Entry> = entries
            .iter()
            .filter(|e| e.index > snapshot_index)
            .collect();
        let first = match entries.first() {
            Some(e) => e.index,
            None => return Ok(()),
        };
        if first > self.log.next_index() {
            return Err(Error::LogRange {
                from: first,
                to: first + entries.len() as u64,
                base: self.log.base(),
                next: self.log.next_index(),
            });
        }

        let entries: Vec<LogEntry> = entries.into_iter().map(LogEntry::from_raft).collect();
        if self.log.matches(first - 1, &entries) {
            return Ok(());
        }
        self.log.truncate_after(first - 1)?;
        self.log.append(entries);
        self.dirty = true;
        Ok(())
    }

    pub fn set_hardstate(&mut self, hs: HardState) {
        self.hard_state = hs;
        self.dirty = true;
    }

    pub fn set_commit(&mut self, commit: u64) {
        self.hard_state.set_commit(commit);
        self.dirty = true;
    }

    /// Installs a snapshot received from the leader. The live window is
    /// dropped entirely.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let metadata = snapshot.get_metadata();
        if metadata.index <= self.log.snapshot_last_index() {
            return Err(Error::Raft(raft::Error::Store(
                StorageError::SnapshotOutOfDate,
            )));
        }

        self.log.restore(metadata.index, metadata.term);
        self.hard_state.term = cmp::max(self.hard_state.term, metadata.term);
        self.hard_state.commit = cmp::max(self.hard_state.commit, metadata.index);
        self.conf_state = metadata.get_conf_state().clone();
        self.snapshot = snapshot.clone();

        self.persister
            .save_state_and_snapshot(self.encode_state()?, snapshot.get_data().to_vec())?;
        self.dirty = false;
        Ok(())
    }

    /// Folds `[base, index]` into a snapshot carrying `data` and persists
    /// both blobs together. Returns false when `index` is not newer than the
    /// current snapshot.
    pub fn compact_with_snapshot(&mut self, index: u64, data: Vec<u8>) -> Result<bool> {
        if index <= self.log.snapshot_last_index() {
            return Ok(false);
        }
        let term = match self.log.entry_at(index) {
            LogLookup::Live(entry) => entry.term,
            _ => {
                return Err(Error::LogRange {
                    from: index,
                    to: index + 1,
                    base: self.log.base(),
                    next: self.log.next_index(),
                })
            }
        };

        self.log.compact(index);
        self.log.set_snapshot_tip(index, term);

        let mut snapshot = Snapshot::default();
        let metadata = snapshot.mut_metadata();
        metadata.index = index;
        metadata.term = term;
        metadata.set_conf_state(self.conf_state.clone());
        snapshot.set_data(data.clone().into());
        self.snapshot = snapshot;

        self.persister
            .save_state_and_snapshot(self.encode_state()?, data)?;
        self.dirty = false;
        Ok(true)
    }

    /// Writes the raft state blob if anything changed since the last write.
    pub fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.persister.save_raft_state(self.encode_state()?)?;
        self.dirty = false;
        Ok(())
    }

    fn encode_state(&self) -> Result<Vec<u8>> {
        let state = PersistedStateRef {
            term: self.hard_state.term,
            vote: self.hard_state.vote,
            commit: self.hard_state.commit,
            voters: &self.conf_state.voters,
            learners: &self.conf_state.learners,
            log: &self.log,
        };
        Ok(bincode::serialize(&state)?)
    }
}

impl Storage for LogStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        Ok(RaftState::new(
            self.hard_state.clone(),
            self.conf_state.clone(),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        if low < self.log.base() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        let live = self
            .log
            .range(low, high)
            .map_err(|_| raft::Error::Store(StorageError::Unavailable))?;
        let mut entries: Vec<Entry> = live
            .iter()
            .enumerate()
            .map(|(offset, e)| e.to_raft(low + offset as u64))
            .collect();
        limit_size(&mut entries, max_size.into());
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        match self.log.entry_at(idx) {
            LogLookup::Live(entry) => Ok(entry.term),
            LogLookup::SnapshotTip { term } => Ok(term),
            LogLookup::Compacted => Err(raft::Error::Store(StorageError::Compacted)),
            LogLookup::Absent => Err(raft::Error::Store(StorageError::Unavailable)),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.log.base())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.log.last_index_and_term().0)
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let index = self.snapshot.get_metadata().index;
        if index == 0 || index < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(self.snapshot.clone())
    }
}

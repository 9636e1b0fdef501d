//! Paired blob store for raft state and the service snapshot.
//!
//! Both blobs are replaced together by `save_state_and_snapshot`, so a crash
//! can never leave a compacted log next to a stale snapshot.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;

const STATE_FILE: &str = "state";
const STATE_TMP_FILE: &str = "state.tmp";

pub trait Persister: Send + Sync + 'static {
    fn raft_state(&self) -> Vec<u8>;
    fn save_raft_state(&self, state: Vec<u8>) -> Result<()>;
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) -> Result<()>;
    fn snapshot(&self) -> Vec<u8>;
    fn raft_state_size(&self) -> usize;
}

impl<T: ?Sized + Persister> Persister for Box<T> {
    fn raft_state(&self) -> Vec<u8> {
        (**self).raft_state()
    }
    fn save_raft_state(&self, state: Vec<u8>) -> Result<()> {
        (**self).save_raft_state(state)
    }
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) -> Result<()> {
        (**self).save_state_and_snapshot(state, snapshot)
    }
    fn snapshot(&self) -> Vec<u8> {
        (**self).snapshot()
    }
    fn raft_state_size(&self) -> usize {
        (**self).raft_state_size()
    }
}

impl<T: ?Sized + Persister> Persister for Arc<T> {
    fn raft_state(&self) -> Vec<u8> {
        (**self).raft_state()
    }
    fn save_raft_state(&self, state: Vec<u8>) -> Result<()> {
        (**self).save_raft_state(state)
    }
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) -> Result<()> {
        (**self).save_state_and_snapshot(state, snapshot)
    }
    fn snapshot(&self) -> Vec<u8> {
        (**self).snapshot()
    }
    fn raft_state_size(&self) -> usize {
        (**self).raft_state_size()
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Blobs {
    raft_state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// In-memory persister. Surviving a "crash" means handing the same instance
/// to the restarted server.
#[derive(Debug, Default)]
pub struct MemPersister {
    blobs: Mutex<Blobs>,
}

impl MemPersister {
    pub fn new() -> MemPersister {
        MemPersister::default()
    }
}

impl Persister for MemPersister {
    fn raft_state(&self) -> Vec<u8> {
        self.blobs.lock().unwrap().raft_state.clone()
    }

    fn save_raft_state(&self, state: Vec<u8>) -> Result<()> {
        self.blobs.lock().unwrap().raft_state = state;
        Ok(())
    }

    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.raft_state = state;
        blobs.snapshot = snapshot;
        Ok(())
    }

    fn snapshot(&self) -> Vec<u8> {
        self.blobs.lock().unwrap().snapshot.clone()
    }

    fn raft_state_size(&self) -> usize {
        self.blobs.lock().unwrap().raft_state.len()
    }
}

/// Keeps both blobs in a single file that is replaced by write-then-rename.
/// Reads are served from memory.
#[derive(Debug)]
pub struct FilePersister {
    base_path: PathBuf,
    blobs: Mutex<Blobs>,
}

impl FilePersister {
    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let state_path = base_path.join(STATE_FILE);
        let blobs = if state_path.exists() {
            let data = fs::read(&state_path)?;
            bincode::deserialize(&data)?
        } else {
            Blobs::default()
        };
        log::info!(
            "opened persister at {:?}, raft state {} bytes, snapshot {} bytes",
            base_path,
            blobs.raft_state.len(),
            blobs.snapshot.len()
        );

        Ok(FilePersister {
            base_path,
            blobs: Mutex::new(blobs),
        })
    }

    /// The temp file is synced before the rename; the state file always holds
    /// a complete pair.
    fn write(&self, blobs: &Blobs) -> Result<()> {
        let temp_path = self.base_path.join(STATE_TMP_FILE);
        let state_path = self.base_path.join(STATE_FILE);
        let mut file = File::create(&temp_path)?;
        file.write_all(&bincode::serialize(blobs)?)?;
        file.sync_all()?;
        fs::rename(&temp_path, &state_path)?;
        Ok(())
    }
}

impl Persister for FilePersister {
    fn raft_state(&self) -> Vec<u8> {
        self.blobs.lock().unwrap().raft_state.clone()
    }

    fn save_raft_state(&self, state: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        let next = Blobs {
            raft_state: state,
            snapshot: blobs.snapshot.clone(),
        };
        self.write(&next)?;
        *blobs = next;
        Ok(())
    }

    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        let next = Blobs {
            raft_state: state,
            snapshot,
        };
        self.write(&next)?;
        *blobs = next;
        Ok(())
    }

    fn snapshot(&self) -> Vec<u8> {
        self.blobs.lock().unwrap().snapshot.clone()
    }

    fn raft_state_size(&self) -> usize {
        self.blobs.lock().unwrap().raft_state.len()
    }
}

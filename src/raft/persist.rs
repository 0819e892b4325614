use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use prost::Message;

use crate::error::{RaftError, Result};
use crate::proto::{LogEntry, PersistentState, STATE_VERSION};

/// Opaque atomic blob storage underneath the consensus state.
///
/// `save_state` must replace the previous blob atomically: after a crash a
/// reader observes either the old blob or the new one, never a mix.
pub trait Persister: Send + Sync + 'static {
    fn save_state(&self, data: &[u8]) -> io::Result<()>;

    /// Returns `None` if nothing has been saved yet.
    fn load_state(&self) -> io::Result<Option<Vec<u8>>>;
}

/// In-memory persister. Cloning an `Arc` of it and handing the clone to a
/// restarted node simulates a crash that preserved stable storage.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    state: Mutex<Option<Vec<u8>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size in bytes of the last saved blob.
    pub fn state_size(&self) -> usize {
        self.lock().as_ref().map(|s| s.len()).unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<u8>>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Persister for MemoryPersister {
    fn save_state(&self, data: &[u8]) -> io::Result<()> {
        *self.lock() = Some(data.to_vec());
        Ok(())
    }

    fn load_state(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.lock().clone())
    }
}

/// File-backed persister: writes a temp file, fsyncs it, then renames it over
/// the previous state file.
#[derive(Debug, Clone)]
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    pub const FILE_NAME: &'static str = "raft-state.bin";

    pub fn new(data_dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(Self::FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fsync a directory so a rename inside it survives power loss.
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

impl Persister for FilePersister {
    fn save_state(&self, data: &[u8]) -> io::Result<()> {
        let tmp = self.path.with_extension("bin.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        match self.path.parent() {
            Some(dir) => sync_dir(dir),
            None => Ok(()),
        }
    }

    fn load_state(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Encode term, vote and log into a versioned blob.
pub fn encode_state(current_term: u64, voted_for: Option<u64>, entries: &[LogEntry]) -> Vec<u8> {
    PersistentState {
        version: STATE_VERSION,
        current_term,
        voted_for,
        entries: entries.to_vec(),
    }
    .encode_to_vec()
}

/// Decode a blob written by [`encode_state`]. An empty blob is the initial state.
pub fn decode_state(data: &[u8]) -> Result<PersistentState> {
    if data.is_empty() {
        return Ok(PersistentState {
            version: STATE_VERSION,
            ..Default::default()
        });
    }
    let state = PersistentState::decode(data)?;
    if state.version != STATE_VERSION {
        return Err(RaftError::Persistence(format!(
            "unsupported state version {} (expected {})",
            state.version, STATE_VERSION
        )));
    }
    for (i, entry) in state.entries.iter().enumerate() {
        if entry.index != i as u64 + 1 {
            return Err(RaftError::Persistence(format!(
                "log entry at position {} has index {}",
                i, entry.index
            )));
        }
    }
    Ok(state)
}

//! Persistence of [`SessionState`] records, keyed by peer identity card id.
//!
//! Persistence is synchronous and bounded: sessions call into the store from
//! inside their initialization without suspending. Each write for a peer
//! replaces the previous record atomically.

use {
    crate::{
        cards::CardId,
        error::{SessionError, SessionResult},
        state::SessionState,
    },
    rand::{rngs::OsRng, RngCore},
    std::{
        collections::HashMap,
        io::ErrorKind,
        path::{Path, PathBuf},
        sync::{Mutex, MutexGuard},
    },
};

pub trait SessionStore: Send + Sync {
    /// Store `state` for `peer`, superseding any previous record.
    fn save(&self, peer: &CardId, state: &SessionState) -> SessionResult<()>;

    fn load(&self, peer: &CardId) -> SessionResult<Option<SessionState>>;

    /// Deleting a peer without a record is not an error.
    fn delete(&self, peer: &CardId) -> SessionResult<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process store. Records are lost with the process.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    states: Mutex<HashMap<CardId, SessionState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.states).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, peer: &CardId, state: &SessionState) -> SessionResult<()> {
        lock(&self.states).insert(peer.clone(), state.clone());

        Ok(())
    }

    fn load(&self, peer: &CardId) -> SessionResult<Option<SessionState>> {
        Ok(lock(&self.states).get(peer).cloned())
    }

    fn delete(&self, peer: &CardId) -> SessionResult<()> {
        lock(&self.states).remove(peer);

        Ok(())
    }
}

/// One JSON file per peer inside a directory.
///
/// Records are written to a temporary sibling first and renamed over the
/// target, so readers never observe a partial record.
#[derive(Debug)]
pub struct FileSessionStore {
    dir: PathBuf,
    writer: Mutex<()>,
}

impl FileSessionStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> SessionResult<Self> {
        let dir = dir.into();

        std::fs::create_dir_all(&dir).map_err(|e| {
            SessionError::Store(format!("Failed to create store directory {dir:?}: {e}"))
        })?;

        Ok(Self {
            dir,
            writer: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, peer: &CardId) -> PathBuf {
        // Card ids are opaque, hex keeps arbitrary ids filesystem safe.
        self.dir
            .join(format!("{}.json", hex::encode(peer.as_str().as_bytes())))
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, peer: &CardId, state: &SessionState) -> SessionResult<()> {
        let path = self.path_for(peer);
        let json = state
            .to_json()
            .map_err(|e| SessionError::Store(format!("Failed to encode state for {peer}: {e}")))?;

        let _guard = lock(&self.writer);

        let tmp = path.with_extension(format!("json.tmp-{:016x}", OsRng.next_u64()));
        std::fs::write(&tmp, json)
            .map_err(|e| SessionError::Store(format!("Failed to write {tmp:?}: {e}")))?;

        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);

            return Err(SessionError::Store(format!(
                "Failed to replace {path:?}: {e}"
            )));
        }

        log::debug!("[store] Saved session state for peer {peer}");

        Ok(())
    }

    fn load(&self, peer: &CardId) -> SessionResult<Option<SessionState>> {
        let path = self.path_for(peer);

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SessionError::Store(format!("Failed to read {path:?}: {e}"))),
        };

        SessionState::from_json(&raw)
            .map(Some)
            .map_err(|e| SessionError::Store(format!("Corrupt session state in {path:?}: {e}")))
    }

    fn delete(&self, peer: &CardId) -> SessionResult<()> {
        let path = self.path_for(peer);
        let _guard = lock(&self.writer);

        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Store(format!("Failed to delete {path:?}: {e}"))),
        }
    }
}

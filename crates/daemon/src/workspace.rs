//! Per-user server state.
//!
//! Every account maps to one [`Workspace`]: its catalog, its storage
//! directory `<store>/<id>/`, and the set of sessions currently attached.
//! The [`WorkspaceTable`] creates a workspace when the first session of a
//! user attaches and drops it when the last one detaches, so idle users
//! cost nothing in memory.
//!
//! Lock order is table before workspace, and the workspace lock is held
//! across every catalog mutation including the rewrite of the on-disk blob,
//! which is what makes "the blob reflects every acknowledged mutation"
//! true under concurrent sessions.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use catalog::Catalog;
use protocol::ProtocolError;
use transport::NetMsg;

/// One user's in-memory state while at least one session is attached.
pub struct Workspace {
    id: u64,
    catalog_path: PathBuf,
    files_root: PathBuf,
    catalog: Mutex<Catalog>,
    sessions: Mutex<HashMap<u64, Arc<NetMsg>>>,
}

impl Workspace {
    fn load(store: &Path, id: u64) -> Result<Self, io::Error> {
        let catalog_path = store.join(format!("{id}.mtd"));
        let catalog = match fs::read(&catalog_path) {
            Ok(bytes) => Catalog::from_bytes(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Catalog::new(),
            Err(e) => return Err(e),
        };
        let files_root = store.join(id.to_string());
        fs::create_dir_all(&files_root)?;
        Ok(Self {
            id,
            catalog_path,
            files_root,
            catalog: Mutex::new(catalog),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// The owning account id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Runs a read-only closure against the catalog.
    pub fn read<R>(&self, f: impl FnOnce(&Catalog) -> R) -> R {
        f(&self.catalog.lock().expect("workspace catalog poisoned"))
    }

    /// Mutates the catalog and rewrites the on-disk blob before returning,
    /// all under the workspace lock.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Catalog) -> R) -> Result<R, io::Error> {
        let mut cat = self.catalog.lock().expect("workspace catalog poisoned");
        let out = f(&mut cat);
        fs::write(&self.catalog_path, cat.to_bytes())?;
        Ok(out)
    }

    /// Maps a catalog path into the workspace's storage directory,
    /// rejecting anything that would escape it.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, ProtocolError> {
        let trimmed = rel.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(ProtocolError::BadPath);
        }
        for part in trimmed.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(ProtocolError::BadPath);
            }
        }
        Ok(self.files_root.join(trimmed))
    }

    fn attach(&self, session: u64, link: Arc<NetMsg>) {
        self.sessions
            .lock()
            .expect("workspace sessions poisoned")
            .insert(session, link);
    }

    /// Removes a session; true when it was the last one.
    fn detach(&self, session: u64) -> bool {
        let mut sessions = self.sessions.lock().expect("workspace sessions poisoned");
        sessions.remove(&session);
        sessions.is_empty()
    }

    /// Multiplexer handles of every attached session except `exclude`.
    pub fn peers(&self, exclude: u64) -> Vec<Arc<NetMsg>> {
        self.sessions
            .lock()
            .expect("workspace sessions poisoned")
            .iter()
            .filter(|(id, _)| **id != exclude)
            .map(|(_, link)| Arc::clone(link))
            .collect()
    }
}

/// The global id → workspace map.
pub struct WorkspaceTable {
    store: PathBuf,
    table: Mutex<HashMap<u64, Arc<Workspace>>>,
}

impl WorkspaceTable {
    /// Creates the table over a store directory.
    pub fn new(store: PathBuf) -> Self {
        Self {
            store,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches a session to the user's workspace, loading it from disk on
    /// first attach.
    pub fn attach(
        &self,
        user_id: u64,
        session: u64,
        link: Arc<NetMsg>,
    ) -> Result<Arc<Workspace>, io::Error> {
        let mut table = self.table.lock().expect("workspace table poisoned");
        let workspace = match table.get(&user_id) {
            Some(ws) => Arc::clone(ws),
            None => {
                debug!(user_id, "loading workspace");
                let ws = Arc::new(Workspace::load(&self.store, user_id)?);
                table.insert(user_id, Arc::clone(&ws));
                ws
            }
        };
        workspace.attach(session, link);
        Ok(workspace)
    }

    /// Detaches a session, dropping the workspace when it was the last.
    pub fn detach(&self, user_id: u64, session: u64) {
        let mut table = self.table.lock().expect("workspace table poisoned");
        if let Some(ws) = table.get(&user_id)
            && ws.detach(session)
        {
            debug!(user_id, "dropping idle workspace");
            table.remove(&user_id);
        }
    }

    /// Number of resident workspaces.
    pub fn resident(&self) -> usize {
        self.table.lock().expect("workspace table poisoned").len()
    }
}

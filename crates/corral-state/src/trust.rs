//! Trust store: the local record of peer identities.
//!
//! Each member keeps its own trust store (it is not replicated). Incoming
//! peer requests are authenticated against it, so it must hold every
//! known member, self included. Entries are persisted to a dedicated
//! redb file keyed by member name and cached in memory; the cache is
//! loaded when the store is opened.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, ReadableTable};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::store::map_err;
use crate::tables::REMOTES;
use crate::types::Remote;

/// Hex SHA-256 of a PEM certificate; the identity peers present in requests.
pub fn fingerprint(certificate: &str) -> String {
    hex::encode(Sha256::digest(certificate.as_bytes()))
}

/// Durable, name-keyed set of trusted remotes.
pub struct TrustStore {
    db: Arc<Database>,
    remotes: RwLock<BTreeMap<String, Remote>>,
}

impl TrustStore {
    /// Open (or create) a trust store at the given path and load its entries.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_db(db)?;
        info!(?path, remotes = store.count(), "trust store loaded");
        Ok(store)
    }

    /// Create an ephemeral in-memory trust store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        Self::with_db(db)
    }

    fn with_db(db: Database) -> StateResult<Self> {
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(REMOTES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;

        let store = Self {
            db: Arc::new(db),
            remotes: RwLock::new(BTreeMap::new()),
        };
        *store.remotes.write() = store.load()?;
        Ok(store)
    }

    fn load(&self) -> StateResult<BTreeMap<String, Remote>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REMOTES).map_err(map_err!(Table))?;
        let mut remotes = BTreeMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let remote: Remote =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            remotes.insert(remote.name.clone(), remote);
        }
        Ok(remotes)
    }

    /// Add a remote, overwriting any entry with the same name.
    ///
    /// Fails with `Conflict` if a differently-named remote already uses the address.
    pub fn add(&self, remote: Remote) -> StateResult<()> {
        let mut cache = self.remotes.write();
        if let Some(other) = cache
            .values()
            .find(|r| r.address == remote.address && r.name != remote.name)
        {
            return Err(StateError::Conflict(format!(
                "remote {:?} already uses address {:?}",
                other.name, remote.address
            )));
        }

        let value = serde_json::to_vec(&remote).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REMOTES).map_err(map_err!(Table))?;
            table
                .insert(remote.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(name = %remote.name, address = %remote.address, "remote trusted");
        cache.insert(remote.name.clone(), remote);
        Ok(())
    }

    /// Atomically replace the whole set of remotes.
    pub fn replace(&self, remotes: Vec<Remote>) -> StateResult<()> {
        let next: BTreeMap<String, Remote> = remotes
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();

        let mut cache = self.remotes.write();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REMOTES).map_err(map_err!(Table))?;
            for name in cache.keys() {
                table.remove(name.as_str()).map_err(map_err!(Write))?;
            }
            for remote in next.values() {
                let value = serde_json::to_vec(remote).map_err(map_err!(Serialize))?;
                table
                    .insert(remote.name.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(remotes = next.len(), "trust store replaced");
        *cache = next;
        Ok(())
    }

    /// Remove a remote by name. Returns true if it existed.
    pub fn remove(&self, name: &str) -> StateResult<bool> {
        let mut cache = self.remotes.write();
        if !cache.contains_key(name) {
            return Ok(false);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REMOTES).map_err(map_err!(Table))?;
            table.remove(name).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        cache.remove(name);
        debug!(%name, "remote untrusted");
        Ok(true)
    }

    pub fn by_name(&self, name: &str) -> Option<Remote> {
        self.remotes.read().get(name).cloned()
    }

    pub fn by_address(&self, address: &str) -> Option<Remote> {
        self.remotes
            .read()
            .values()
            .find(|r| r.address == address)
            .cloned()
    }

    /// All remotes, keyed and ordered by name.
    pub fn remotes_by_name(&self) -> BTreeMap<String, Remote> {
        self.remotes.read().clone()
    }

    pub fn count(&self) -> usize {
        self.remotes.read().len()
    }
}

//! StateStore: redb-backed metadata persistence for corral.
//!
//! Holds the replicated tables (cluster members, join tokens) plus a
//! small bookkeeping table for the consensus state machine. Reads are
//! served directly; writes only ever arrive as [`Mutation`] batches via
//! [`StateStore::apply`], which commits each batch in a single redb
//! write transaction.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

/// Thread-safe metadata store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "metadata store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory metadata store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(CLUSTER_MEMBERS).map_err(map_err!(Table))?;
        txn.open_table(TOKEN_RECORDS).map_err(map_err!(Table))?;
        txn.open_table(CONSENSUS_META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub(crate) fn begin_read(&self) -> StateResult<ReadTransaction> {
        self.db.begin_read().map_err(map_err!(Transaction))
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// List all cluster members, ordered by address.
    pub fn list_members(&self) -> StateResult<Vec<ClusterMember>> {
        read_members(&self.begin_read()?)
    }

    /// Get a cluster member by address.
    pub fn get_member(&self, address: &str) -> StateResult<Option<ClusterMember>> {
        let txn = self.begin_read()?;
        let table = txn.open_table(CLUSTER_MEMBERS).map_err(map_err!(Table))?;
        match table.get(address).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// List all outstanding join tokens.
    pub fn list_tokens(&self) -> StateResult<Vec<TokenRecord>> {
        read_tokens(&self.begin_read()?)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Apply a batch of mutations atomically.
    pub fn apply(&self, batch: &[Mutation]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut members = txn.open_table(CLUSTER_MEMBERS).map_err(map_err!(Table))?;
            let mut tokens = txn.open_table(TOKEN_RECORDS).map_err(map_err!(Table))?;
            for mutation in batch {
                match mutation {
                    Mutation::PutMember { member } => {
                        let value = serde_json::to_vec(member).map_err(map_err!(Serialize))?;
                        members
                            .insert(member.table_key(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Mutation::DeleteMember { address } => {
                        members.remove(address.as_str()).map_err(map_err!(Write))?;
                    }
                    Mutation::PutToken { token } => {
                        let value = serde_json::to_vec(token).map_err(map_err!(Serialize))?;
                        tokens
                            .insert(token.table_key(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Mutation::DeleteToken { name } => {
                        tokens.remove(name.as_str()).map_err(map_err!(Write))?;
                    }
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(mutations = batch.len(), "metadata batch applied");
        Ok(())
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Capture the full contents of the metadata tables.
    pub fn snapshot(&self) -> StateResult<MetadataSnapshot> {
        let txn = self.begin_read()?;
        Ok(MetadataSnapshot {
            members: read_members(&txn)?,
            tokens: read_tokens(&txn)?,
        })
    }

    /// Replace the metadata tables with the given snapshot.
    pub fn restore(&self, snapshot: &MetadataSnapshot) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut members = txn.open_table(CLUSTER_MEMBERS).map_err(map_err!(Table))?;
            clear(&mut members)?;
            for member in &snapshot.members {
                let value = serde_json::to_vec(member).map_err(map_err!(Serialize))?;
                members
                    .insert(member.table_key(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let mut tokens = txn.open_table(TOKEN_RECORDS).map_err(map_err!(Table))?;
            clear(&mut tokens)?;
            for token in &snapshot.tokens {
                let value = serde_json::to_vec(token).map_err(map_err!(Serialize))?;
                tokens
                    .insert(token.table_key(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            members = snapshot.members.len(),
            tokens = snapshot.tokens.len(),
            "metadata restored from snapshot"
        );
        Ok(())
    }

    // ── Consensus bookkeeping ──────────────────────────────────────

    /// Store an opaque bookkeeping value for the consensus layer.
    pub fn put_meta(&self, key: &str, value: &[u8]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONSENSUS_META).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read an opaque bookkeeping value for the consensus layer.
    pub fn get_meta(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.begin_read()?;
        let table = txn.open_table(CONSENSUS_META).map_err(map_err!(Table))?;
        Ok(table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }
}

pub(crate) fn read_members(txn: &ReadTransaction) -> StateResult<Vec<ClusterMember>> {
    let table = txn.open_table(CLUSTER_MEMBERS).map_err(map_err!(Table))?;
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let member: ClusterMember =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(member);
    }
    Ok(results)
}

pub(crate) fn read_tokens(txn: &ReadTransaction) -> StateResult<Vec<TokenRecord>> {
    let table = txn.open_table(TOKEN_RECORDS).map_err(map_err!(Table))?;
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let token: TokenRecord =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(token);
    }
    Ok(results)
}

fn clear(table: &mut redb::Table<'_, &'static str, &'static [u8]>) -> StateResult<()> {
    let keys: Vec<String> = table
        .iter()
        .map_err(map_err!(Read))?
        .map(|entry| entry.map(|(k, _)| k.value().to_string()))
        .collect::<Result<_, _>>()
        .map_err(map_err!(Read))?;
    for key in &keys {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(())
}

//! Raft state machine over the metadata store.
//!
//! Committed batches are applied with [`StateStore::apply`], which is the
//! only write path into the replicated tables. The last applied log id
//! and the last membership are kept in the store's consensus bookkeeping
//! table. Snapshots are the JSON form of [`MetadataSnapshot`].

use std::io::Cursor;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, Snapshot, SnapshotMeta, StorageError, StoredMembership,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use corral_state::{MetadataSnapshot, StateStore};

use crate::log_store::{read_err, write_err};
use crate::typ::{Response, TypeConfig};

const APPLIED_KEY: &str = "last_applied";
const MEMBERSHIP_KEY: &str = "membership";

/// Raft state machine writing into a [`StateStore`].
pub struct StateMachine {
    store: StateStore,
}

/// Snapshot builder reading the current metadata tables.
pub struct SnapshotBuilder {
    store: StateStore,
}

impl StateMachine {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

fn put<T: Serialize>(store: &StateStore, key: &str, value: &T) -> Result<(), StorageError<u64>> {
    let data = serde_json::to_vec(value).map_err(write_err)?;
    store.put_meta(key, &data).map_err(write_err)
}

fn get<T: DeserializeOwned>(store: &StateStore, key: &str) -> Result<Option<T>, StorageError<u64>> {
    match store.get_meta(key).map_err(read_err)? {
        Some(data) => Ok(Some(serde_json::from_slice(&data).map_err(read_err)?)),
        None => Ok(None),
    }
}

fn applied_state(
    store: &StateStore,
) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
    let applied = get(store, APPLIED_KEY)?;
    let membership = get(store, MEMBERSHIP_KEY)?.unwrap_or_default();
    Ok((applied, membership))
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        applied_state(&self.store)
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;
            let applied = match entry.payload {
                EntryPayload::Blank => 0,
                EntryPayload::Normal(req) => {
                    self.store.apply(&req.mutations).map_err(write_err)?;
                    req.mutations.len()
                }
                EntryPayload::Membership(membership) => {
                    put(
                        &self.store,
                        MEMBERSHIP_KEY,
                        &StoredMembership::new(Some(log_id), membership),
                    )?;
                    0
                }
            };
            put(&self.store, APPLIED_KEY, &log_id)?;
            responses.push(Response { applied });
        }

        debug!(entries = responses.len(), "applied raft entries");
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SnapshotBuilder {
            store: self.store.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let metadata: MetadataSnapshot =
            serde_json::from_slice(&snapshot.into_inner()).map_err(read_err)?;
        self.store.restore(&metadata).map_err(write_err)?;

        put(&self.store, APPLIED_KEY, &meta.last_log_id)?;
        put(&self.store, MEMBERSHIP_KEY, &meta.last_membership)?;

        info!(
            snapshot_id = %meta.snapshot_id,
            members = metadata.members.len(),
            "installed metadata snapshot"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        if get::<LogId<u64>>(&self.store, APPLIED_KEY)?.is_none() {
            return Ok(None);
        }
        let mut builder = self.get_snapshot_builder().await;
        Ok(Some(builder.build_snapshot().await?))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let (last_applied, membership) = applied_state(&self.store)?;
        let metadata = self.store.snapshot().map_err(read_err)?;
        let data = serde_json::to_vec(&metadata).map_err(read_err)?;

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id: format!("metadata-{}", last_applied.map_or(0, |l| l.index)),
        };

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

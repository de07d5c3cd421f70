//! Transactional access to the metadata tables.
//!
//! [`Database::transaction`] runs a closure against a [`Tx`] that reads a
//! consistent snapshot of the committed tables and buffers its writes.
//! When the closure succeeds, the buffered batch is handed to the
//! configured [`Proposer`], which commits it atomically (directly, or
//! after replicating it through consensus). When the closure fails,
//! nothing is proposed.
//!
//! Transactions on one `Database` are serialized, so a read followed by
//! a dependent write (e.g. consuming a join token) cannot interleave
//! with another transaction on the same node.

use std::sync::Arc;

use async_trait::async_trait;
use redb::ReadTransaction;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, read_members, read_tokens};
use crate::types::*;

/// Commits a batch of mutations to the metadata store.
#[async_trait]
pub trait Proposer: Send + Sync {
    /// Commit `batch` atomically. Returns once the batch is visible in
    /// the local [`StateStore`].
    async fn propose(&self, batch: Vec<Mutation>) -> StateResult<()>;
}

/// Applies batches straight to a local store, with no replication.
pub struct LocalProposer {
    store: StateStore,
}

impl LocalProposer {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Proposer for LocalProposer {
    async fn propose(&self, batch: Vec<Mutation>) -> StateResult<()> {
        self.store.apply(&batch)
    }
}

/// Transactional front for the metadata store.
pub struct Database {
    store: StateStore,
    proposer: Arc<dyn Proposer>,
    write_lock: Mutex<()>,
}

impl Database {
    pub fn new(store: StateStore, proposer: Arc<dyn Proposer>) -> Self {
        Self {
            store,
            proposer,
            write_lock: Mutex::new(()),
        }
    }

    /// A database whose writes are applied locally (single node, tests).
    pub fn local(store: StateStore) -> Self {
        let proposer = Arc::new(LocalProposer::new(store.clone()));
        Self::new(store, proposer)
    }

    /// The underlying store, for snapshot reads outside a transaction.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run `f` as one atomic transaction.
    pub async fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Tx) -> Result<T, E>,
        E: From<StateError>,
    {
        let _guard = self.write_lock.lock().await;

        let mut tx = Tx::begin(&self.store)?;
        let output = f(&mut tx)?;
        let batch = tx.into_mutations();

        if !batch.is_empty() {
            debug!(mutations = batch.len(), "committing transaction");
            self.proposer.propose(batch).await?;
        }
        Ok(output)
    }
}

/// An open transaction: snapshot reads plus buffered writes.
///
/// Reads observe the transaction's own pending writes.
pub struct Tx {
    read: ReadTransaction,
    pending: Vec<Mutation>,
}

impl Tx {
    fn begin(store: &StateStore) -> StateResult<Self> {
        Ok(Self {
            read: store.begin_read()?,
            pending: Vec::new(),
        })
    }

    fn into_mutations(self) -> Vec<Mutation> {
        self.pending
    }

    // ── Cluster members ────────────────────────────────────────────

    /// All cluster members, ordered by address.
    pub fn cluster_members(&self) -> StateResult<Vec<ClusterMember>> {
        let mut members = read_members(&self.read)?;
        for mutation in &self.pending {
            match mutation {
                Mutation::PutMember { member } => {
                    members.retain(|m| m.address != member.address);
                    members.push(member.clone());
                }
                Mutation::DeleteMember { address } => {
                    members.retain(|m| &m.address != address);
                }
                _ => {}
            }
        }
        members.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(members)
    }

    pub fn cluster_member_by_address(&self, address: &str) -> StateResult<Option<ClusterMember>> {
        Ok(self
            .cluster_members()?
            .into_iter()
            .find(|m| m.address == address))
    }

    /// Create a new member. Fails with `Conflict` if the address or name is taken.
    pub fn create_cluster_member(&mut self, member: ClusterMember) -> StateResult<()> {
        let existing = self.cluster_members()?;
        if existing.iter().any(|m| m.address == member.address) {
            return Err(StateError::Conflict(format!(
                "cluster member with address {:?} already exists",
                member.address
            )));
        }
        if existing.iter().any(|m| m.name == member.name) {
            return Err(StateError::Conflict(format!(
                "cluster member with name {:?} already exists",
                member.name
            )));
        }
        self.pending.push(Mutation::PutMember { member });
        Ok(())
    }

    /// Overwrite an existing member (matched by address).
    pub fn update_cluster_member(&mut self, member: ClusterMember) -> StateResult<()> {
        if self.cluster_member_by_address(&member.address)?.is_none() {
            return Err(StateError::NotFound(format!(
                "no cluster member with address {:?}",
                member.address
            )));
        }
        self.pending.push(Mutation::PutMember { member });
        Ok(())
    }

    /// Delete the member at `address`. Fails with `NotFound` if absent.
    pub fn delete_cluster_member(&mut self, address: &str) -> StateResult<()> {
        if self.cluster_member_by_address(address)?.is_none() {
            return Err(StateError::NotFound(format!(
                "no cluster member with address {address:?}"
            )));
        }
        self.pending.push(Mutation::DeleteMember {
            address: address.to_string(),
        });
        Ok(())
    }

    // ── Tokens ─────────────────────────────────────────────────────

    fn token_records(&self) -> StateResult<Vec<TokenRecord>> {
        let mut tokens = read_tokens(&self.read)?;
        for mutation in &self.pending {
            match mutation {
                Mutation::PutToken { token } => {
                    tokens.retain(|t| t.name != token.name);
                    tokens.push(token.clone());
                }
                Mutation::DeleteToken { name } => {
                    tokens.retain(|t| &t.name != name);
                }
                _ => {}
            }
        }
        Ok(tokens)
    }

    /// Look up a token by its secret. Fails with `NotFound` if absent.
    pub fn token_record_by_secret(&self, secret: &str) -> StateResult<TokenRecord> {
        self.token_records()?
            .into_iter()
            .find(|t| t.secret == secret)
            .ok_or_else(|| StateError::NotFound("no token record matches the given secret".into()))
    }

    pub fn create_token_record(&mut self, token: TokenRecord) -> StateResult<()> {
        if self.token_records()?.iter().any(|t| t.name == token.name) {
            return Err(StateError::Conflict(format!(
                "token record for {:?} already exists",
                token.name
            )));
        }
        self.pending.push(Mutation::PutToken { token });
        Ok(())
    }

    pub fn delete_token_record(&mut self, name: &str) -> StateResult<()> {
        if !self.token_records()?.iter().any(|t| t.name == name) {
            return Err(StateError::NotFound(format!("no token record named {name:?}")));
        }
        self.pending.push(Mutation::DeleteToken {
            name: name.to_string(),
        });
        Ok(())
    }
}

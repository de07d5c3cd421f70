//! redb table definitions for the corral stores.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Cluster members keyed by `{address}`. Addresses are unique across members.
pub const CLUSTER_MEMBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_members");

/// Join tokens keyed by `{name}`.
pub const TOKEN_RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("token_records");

/// Opaque bookkeeping for the consensus state machine (applied log id, membership).
pub const CONSENSUS_META: TableDefinition<&str, &[u8]> = TableDefinition::new("consensus_meta");

/// Trusted remotes keyed by `{name}`. Lives in its own database file.
pub const REMOTES: TableDefinition<&str, &[u8]> = TableDefinition::new("remotes");

//! corral-state: embedded state for corral.
//!
//! Backed by [redb](https://docs.rs/redb), this crate holds the two
//! systems of record a member keeps on disk:
//!
//! - the **metadata store** ([`StateStore`]): cluster members and join
//!   tokens, written only through [`Database::transaction`] so every
//!   write is an atomic batch of [`Mutation`]s that can be replicated
//!   through consensus before it is applied;
//! - the **trust store** ([`TrustStore`]): the local set of peer
//!   identities used to authenticate incoming connections.
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.

pub mod database;
pub mod error;
pub mod store;
pub mod tables;
pub mod trust;
pub mod types;

pub use database::{Database, LocalProposer, Proposer, Tx};
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use trust::{TrustStore, fingerprint};
pub use types::*;

// openraft's StorageError is large; results carry it everywhere.
#![allow(clippy::result_large_err)]

//! corral-raft: openraft consensus for corral's cluster metadata.
//!
//! Every metadata write is a batch of [`corral_state::Mutation`]s. On a
//! clustered member the batch is proposed through raft and applied to the
//! local [`corral_state::StateStore`] by the state machine once committed,
//! so every member's metadata tables converge on the same contents.
//!
//! # Architecture
//!
//! - **`typ`**: Type configuration (`TypeConfig`, `Request`, `Response`)
//! - **`log_store`**: Raft log storage backed by redb
//! - **`state_machine`**: Applies committed batches to the metadata store
//! - **`network`**: HTTP transport for inter-member raft RPCs
//! - **`server`**: axum routes answering those RPCs
//! - **`consensus`**: The control plane's consensus facade and proposer

pub mod consensus;
pub mod log_store;
pub mod network;
pub mod server;
pub mod state_machine;
pub mod typ;

pub use consensus::{RaftConsensus, RaftProposer, start_raft, wait_for_leader};
pub use log_store::LogStore;
pub use network::{NetworkConnection, NetworkFactory};
pub use server::raft_router;
pub use state_machine::StateMachine;
pub use typ::{CorralRaft, Request, Response, TypeConfig};

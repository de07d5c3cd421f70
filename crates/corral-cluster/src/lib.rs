//! corral-cluster: the cluster membership control plane.
//!
//! Nodes join, are listed, and leave a consensus-backed cluster through
//! the components in this crate:
//!
//! - [`JoinCoordinator`] admits members on the leader and forwards joins
//!   received by followers.
//! - [`MembershipReporter`] lists members with a liveness overlay.
//! - [`RemovalOrchestrator`] removes members without breaking quorum.
//! - [`Supervisor`] wipes local state and restarts a removed member once
//!   its last response has been delivered.
//! - [`Reconciler`] converges the trust store, metadata, and consensus
//!   membership after partial failures.
//!
//! The consensus layer and peer transport are consumed through the
//! [`Consensus`] and [`PeerClient`] traits.

pub mod auth;
pub mod consensus;
pub mod context;
pub mod error;
pub mod join;
pub mod members;
pub mod peer;
pub mod reconcile;
pub mod remove;
pub mod restart;
pub mod tls;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use consensus::{Consensus, ConsensusNode, ConsensusRole, node_id_for};
pub use context::{ClusterContext, JOIN_TIMEOUT, REMOVE_TIMEOUT};
pub use error::{ClusterError, ClusterResult, ErrorKind};
pub use join::JoinCoordinator;
pub use members::MembershipReporter;
pub use peer::{HttpPeerClient, HttpTransport, PeerClient, PeerIdentity};
pub use reconcile::{ReconcileReport, Reconciler};
pub use remove::{RemovalOrchestrator, RemovalOutcome};
pub use restart::{
    Delivery, ExecReplacer, ProcessReplacer, ResetTicket, RestartGate, SelfRemovalHold, Supervisor,
};
pub use tls::CertKeyPair;
pub use types::*;

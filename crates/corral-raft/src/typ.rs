//! Raft type configuration for corral.

use std::io::Cursor;

use openraft::TokioRuntime;

use corral_state::Mutation;

/// Client write request: one metadata transaction's buffered writes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Request {
    pub mutations: Vec<Mutation>,
}

/// Response returned after a batch is applied to the state machine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Response {
    pub applied: usize,
}

openraft::declare_raft_types!(
    /// corral raft type configuration.
    pub TypeConfig:
        D = Request,
        R = Response,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

/// Convenience alias for the Raft instance.
pub type CorralRaft = openraft::Raft<TypeConfig>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_keeps_mutation_order() {
        let req = Request {
            mutations: vec![
                Mutation::DeleteToken { name: "n2".into() },
                Mutation::DeleteMember {
                    address: "10.0.0.2:7443".into(),
                },
            ],
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.mutations[0], Mutation::DeleteToken { .. }));
        assert!(matches!(back.mutations[1], Mutation::DeleteMember { .. }));
    }
}

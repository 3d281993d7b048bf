use crate::vars::ScopeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Siblings created by one parallel/inclusive split share a fork group;
/// the matching join waits for the whole group.
pub type ForkGroupId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    Active,
    /// Parked at a service task, timer catch event or join barrier.
    Waiting,
    Consumed,
}

/// A cursor representing one thread of control moving through the
/// process graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub state: TokenState,
    pub scope_id: ScopeId,
    /// Set when this token was produced by a parallel/inclusive split.
    pub parent_token_id: Option<Uuid>,
    pub fork_group: Option<ForkGroupId>,
    /// Creation order within the instance; the drive loop uses it so
    /// token scheduling is deterministic.
    pub seq: u64,
    pub created_at_ms: i64,
}

impl Token {
    pub fn is_live(&self) -> bool {
        self.state != TokenState::Consumed
    }
}

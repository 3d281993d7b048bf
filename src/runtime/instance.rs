use crate::runtime::now_ms;
use crate::runtime::scheduler::SchedulerEvent;
use crate::runtime::token::{ForkGroupId, Token, TokenState};
use crate::vars::{ScopeArena, ScopeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Suspended,
    Completed,
    Error,
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Error | InstanceStatus::Terminated
        )
    }
}

/// Where and why an instance stopped. Kept for inspection; errored
/// instances retain their full token/variable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub node_id: String,
    pub token_id: Option<Uuid>,
    pub message: String,
}

/// Join bookkeeping for one parallel/inclusive split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkGroup {
    pub id: ForkGroupId,
    /// Number of sibling tokens the matching join must collect.
    pub size: usize,
    /// Scope the joined branches merge back into.
    pub parent_scope: ScopeId,
    /// Fork group of the token that split, restored on the successor.
    pub origin_group: Option<ForkGroupId>,
    pub origin_token: Uuid,
}

/// A pending boundary timer armed while its host task's token waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryArm {
    pub node_id: String,
    pub job_id: Uuid,
}

/// Full mutable state of one process instance. Owned exclusively by the
/// engine's per-instance single-writer region and serialized wholesale
/// for snapshot persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_id: Uuid,
    pub definition_id: String,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub root_scope: ScopeId,
    pub scopes: ScopeArena,
    pub tokens: BTreeMap<Uuid, Token>,
    pub fork_groups: HashMap<ForkGroupId, ForkGroup>,
    /// Join node id -> fork group -> arrived token ids in arrival order.
    pub join_arrivals: BTreeMap<String, BTreeMap<ForkGroupId, Vec<Uuid>>>,
    /// Waiting token -> the scheduler job it waits on.
    pub waiting_jobs: BTreeMap<Uuid, Uuid>,
    /// Host token -> boundary timers armed while it waits.
    pub boundary_jobs: BTreeMap<Uuid, Vec<BoundaryArm>>,
    /// Scheduler events received while suspended, applied on resume in
    /// arrival order.
    pub pending_events: VecDeque<SchedulerEvent>,
    pub error: Option<ErrorRecord>,
    next_seq: u64,
    /// Re-entrancy guard for the single-writer region.
    #[serde(skip)]
    pub(crate) in_step: bool,
}

impl InstanceState {
    pub fn new(instance_id: Uuid, definition_id: String, definition_version: u32) -> Self {
        let mut scopes = ScopeArena::new();
        let root_scope = scopes.new_root();
        Self {
            instance_id,
            definition_id,
            definition_version,
            status: InstanceStatus::Running,
            started_at_ms: now_ms(),
            ended_at_ms: None,
            root_scope,
            scopes,
            tokens: BTreeMap::new(),
            fork_groups: HashMap::new(),
            join_arrivals: BTreeMap::new(),
            waiting_jobs: BTreeMap::new(),
            boundary_jobs: BTreeMap::new(),
            pending_events: VecDeque::new(),
            error: None,
            next_seq: 0,
            in_step: false,
        }
    }

    /// Create a token at a node. Tokens are only ever created at start
    /// events, splits, join successors and fired boundary events.
    pub fn spawn_token(
        &mut self,
        node_id: &str,
        scope_id: ScopeId,
        parent_token_id: Option<Uuid>,
        fork_group: Option<ForkGroupId>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tokens.insert(
            id,
            Token {
                id,
                instance_id: self.instance_id,
                node_id: node_id.to_string(),
                state: TokenState::Active,
                scope_id,
                parent_token_id,
                fork_group,
                seq,
                created_at_ms: now_ms(),
            },
        );
        id
    }

    pub fn live_token_count(&self) -> usize {
        self.tokens.values().filter(|t| t.is_live()).count()
    }

    /// Active tokens in creation order — the deterministic drive order.
    pub fn active_tokens_in_order(&self) -> Vec<Uuid> {
        let mut active: Vec<&Token> = self
            .tokens
            .values()
            .filter(|t| t.state == TokenState::Active)
            .collect();
        active.sort_by_key(|t| t.seq);
        active.iter().map(|t| t.id).collect()
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let mut tokens: Vec<&Token> = self.tokens.values().collect();
        tokens.sort_by_key(|t| t.seq);
        InstanceSnapshot {
            instance_id: self.instance_id,
            definition_id: self.definition_id.clone(),
            definition_version: self.definition_version,
            status: self.status,
            started_at_ms: self.started_at_ms,
            ended_at_ms: self.ended_at_ms,
            tokens: tokens
                .into_iter()
                .map(|t| TokenView {
                    token_id: t.id,
                    node_id: t.node_id.clone(),
                    state: t.state,
                    scope_id: t.scope_id,
                })
                .collect(),
            variables: self.scopes.visible(self.root_scope),
            error: self.error.clone(),
        }
    }
}

/// Read-only projection consumed by the polling/visualization layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: Uuid,
    pub definition_id: String,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub tokens: Vec<TokenView>,
    pub variables: HashMap<String, Value>,
    pub error: Option<ErrorRecord>,
}

impl InstanceSnapshot {
    pub fn active_token_count(&self) -> usize {
        self.tokens
            .iter()
            .filter(|t| t.state == TokenState::Active)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenView {
    pub token_id: Uuid,
    pub node_id: String,
    pub state: TokenState,
    pub scope_id: ScopeId,
}

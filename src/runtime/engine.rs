use crate::definition::{MalformedGraph, NodeKind, ProcessDefinition, ProcessModel};
use crate::expr;
use crate::runtime::error::EngineError;
use crate::runtime::instance::{
    BoundaryArm, ErrorRecord, ForkGroup, InstanceSnapshot, InstanceState, InstanceStatus,
};
use crate::runtime::now_ms;
use crate::runtime::scheduler::{Scheduler, SchedulerEvent};
use crate::runtime::storage::SnapshotStore;
use crate::runtime::token::{Token, TokenState};
use crate::tasks::TaskInput;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The workflow engine: definition registry, per-instance supervisors,
/// and the token state machine.
///
/// Every instance is advanced under single-writer discipline: all
/// mutation happens while holding that instance's mutex, and scheduler
/// events re-enter through one event pump, so token-graph mutations
/// within an instance are serialized. Different instances advance fully
/// in parallel.
pub struct Engine {
    /// definition id -> version -> shared immutable graph.
    definitions: DashMap<String, BTreeMap<u32, Arc<ProcessDefinition>>>,
    instances: DashMap<Uuid, Arc<Mutex<InstanceState>>>,
    scheduler: Arc<Scheduler>,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl Engine {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            definitions: DashMap::new(),
            instances: DashMap::new(),
            scheduler,
            store: None,
        }
    }

    /// Attach a snapshot store; the engine persists each instance at
    /// every quiescence point (after start, event application, suspend,
    /// resume, terminate).
    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    // ─── Definitions ──────────────────────────────────────────

    /// Validate and register a raw model. The importer must hand over a
    /// graph satisfying the structural invariants or is rejected here.
    pub fn register_model(
        &self,
        model: ProcessModel,
    ) -> Result<Arc<ProcessDefinition>, EngineError> {
        let def = Arc::new(ProcessDefinition::parse(model)?);
        self.definitions
            .entry(def.id.clone())
            .or_default()
            .insert(def.version, def.clone());
        info!(definition_id = %def.id, version = def.version, "definition registered");
        Ok(def)
    }

    /// Look up a definition; `None` selects the latest version.
    pub fn definition(
        &self,
        id: &str,
        version: Option<u32>,
    ) -> Result<Arc<ProcessDefinition>, EngineError> {
        let versions = self
            .definitions
            .get(id)
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))?;
        let found = match version {
            Some(v) => versions.get(&v).cloned(),
            None => versions.values().next_back().cloned(),
        };
        found.ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))
    }

    // ─── Instance lifecycle ───────────────────────────────────

    /// Create an instance of the latest definition version, seed the
    /// root scope, place the root token on the start event and drive
    /// until every token is waiting or consumed.
    pub async fn start_instance(
        &self,
        definition_id: &str,
        initial_variables: HashMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let def = self.definition(definition_id, None)?;
        let instance_id = Uuid::new_v4();
        let mut state = InstanceState::new(instance_id, def.id.clone(), def.version);

        // Definition defaults first, then caller-supplied values on top.
        // Sorted so the write journal is deterministic.
        let mut seed: Vec<(&String, &Value)> = def.initial_variables.iter().collect();
        seed.sort_by_key(|(k, _)| k.clone());
        for (k, v) in seed {
            state.scopes.write(state.root_scope, k, v.clone());
        }
        let mut seed: Vec<(&String, &Value)> = initial_variables.iter().collect();
        seed.sort_by_key(|(k, _)| k.clone());
        for (k, v) in seed {
            state.scopes.write(state.root_scope, k, v.clone());
        }

        let root_scope = state.root_scope;
        state.spawn_token(&def.start_node().id, root_scope, None, None);

        let shared = Arc::new(Mutex::new(state));
        self.instances.insert(instance_id, shared.clone());

        let mut guard = shared.lock().await;
        info!(%instance_id, definition_id = %def.id, version = def.version, "instance started");
        self.drive(&def, &mut guard)?;
        self.persist(&guard).await;
        Ok(instance_id)
    }

    pub async fn suspend_instance(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let shared = self.instance(instance_id)?;
        let mut st = shared.lock().await;
        if st.status != InstanceStatus::Running {
            return Err(EngineError::InvalidStatus {
                instance: instance_id,
                status: st.status,
            });
        }
        st.status = InstanceStatus::Suspended;
        info!(%instance_id, "instance suspended");
        self.persist(&st).await;
        Ok(())
    }

    /// Resume a suspended instance and apply the scheduler events that
    /// queued up while it was suspended, in arrival order.
    pub async fn resume_instance(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let shared = self.instance(instance_id)?;
        let mut st = shared.lock().await;
        if st.status != InstanceStatus::Suspended {
            return Err(EngineError::InvalidStatus {
                instance: instance_id,
                status: st.status,
            });
        }
        st.status = InstanceStatus::Running;
        info!(%instance_id, queued = st.pending_events.len(), "instance resumed");

        let def = self.definition(&st.definition_id, Some(st.definition_version))?;
        while st.status == InstanceStatus::Running {
            let Some(event) = st.pending_events.pop_front() else {
                break;
            };
            self.apply_event_locked(&def, &mut st, event)?;
        }
        self.persist(&st).await;
        Ok(())
    }

    /// Operator action: kill an instance in any non-terminal state and
    /// cancel its scheduled work. State is archived, not deleted.
    pub async fn terminate_instance(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let shared = self.instance(instance_id)?;
        let mut st = shared.lock().await;
        if st.status.is_terminal() {
            return Err(EngineError::InvalidStatus {
                instance: instance_id,
                status: st.status,
            });
        }
        st.status = InstanceStatus::Terminated;
        st.ended_at_ms = Some(now_ms());
        self.scheduler.cancel_instance(instance_id);
        info!(%instance_id, "instance terminated");
        self.persist(&st).await;
        Ok(())
    }

    /// Read-only projection for the polling/visualization layer.
    pub async fn snapshot(&self, instance_id: Uuid) -> Result<InstanceSnapshot, EngineError> {
        let shared = self.instance(instance_id)?;
        let st = shared.lock().await;
        Ok(st.snapshot())
    }

    /// Live (non-consumed) tokens in creation order — the diagram
    /// overlay feed. Finite and restartable, no cursor.
    pub async fn list_active_tokens(&self, instance_id: Uuid) -> Result<Vec<Token>, EngineError> {
        let shared = self.instance(instance_id)?;
        let st = shared.lock().await;
        let mut live: Vec<Token> = st.tokens.values().filter(|t| t.is_live()).cloned().collect();
        live.sort_by_key(|t| t.seq);
        Ok(live)
    }

    /// Re-adopt a persisted instance (recovery path). Timers are
    /// re-armed from their node specs and parked service tasks are
    /// re-dispatched with a fresh attempt budget.
    pub async fn restore_instance(&self, mut state: InstanceState) -> Result<Uuid, EngineError> {
        let instance_id = state.instance_id;
        let def = self.definition(&state.definition_id, Some(state.definition_version))?;

        let waiting: Vec<Uuid> = state.waiting_jobs.keys().copied().collect();
        state.waiting_jobs.clear();
        state.boundary_jobs.clear();
        for token_id in waiting {
            let Some(token) = state.tokens.get(&token_id).cloned() else {
                continue;
            };
            let Some(node) = def.node(&token.node_id) else {
                continue;
            };
            match &node.kind {
                NodeKind::TimerCatchEvent { timer } => {
                    let job =
                        self.scheduler
                            .schedule_timer(instance_id, token_id, timer.due_at(now_ms()));
                    state.waiting_jobs.insert(token_id, job);
                }
                NodeKind::ServiceTask {
                    task,
                    properties,
                    extensions,
                } => {
                    let visible = state.scopes.visible(token.scope_id);
                    let input = TaskInput {
                        instance_id,
                        token_id,
                        properties: resolve_placeholders(properties, &visible),
                        extensions: extensions.clone(),
                        variables: visible,
                    };
                    let job = self.scheduler.dispatch_task(task.clone(), input);
                    state.waiting_jobs.insert(token_id, job);
                    self.arm_boundaries(&def, &mut state, token_id, &token.node_id);
                }
                _ => {}
            }
        }

        self.instances.insert(instance_id, Arc::new(Mutex::new(state)));
        info!(%instance_id, "instance restored");
        Ok(instance_id)
    }

    // ─── Scheduler event application ──────────────────────────

    /// Consume the scheduler's event channel. This is the only
    /// asynchronous re-entry into an instance's single-writer region;
    /// it is a single consumer, so per-instance application follows
    /// emission order.
    pub async fn run_events(&self, mut events: mpsc::Receiver<SchedulerEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.apply_event(event).await {
                error!(error = %e, "failed to apply scheduler event");
            }
        }
    }

    pub async fn apply_event(&self, event: SchedulerEvent) -> Result<(), EngineError> {
        let instance_id = event.instance_id();
        let shared = self.instance(instance_id)?;
        let mut st = shared.lock().await;

        match st.status {
            InstanceStatus::Running => {
                let def = self.definition(&st.definition_id, Some(st.definition_version))?;
                self.apply_event_locked(&def, &mut st, event)?;
                self.persist(&st).await;
                Ok(())
            }
            InstanceStatus::Suspended => {
                // Applied in order after resume; in-flight work is never
                // aborted by suspension.
                st.pending_events.push_back(event);
                self.persist(&st).await;
                Ok(())
            }
            _ => {
                debug!(%instance_id, status = ?st.status, "dropping event for settled instance");
                Ok(())
            }
        }
    }

    fn apply_event_locked(
        &self,
        def: &ProcessDefinition,
        st: &mut InstanceState,
        event: SchedulerEvent,
    ) -> Result<(), EngineError> {
        match event {
            SchedulerEvent::TimerFired {
                token_id, job_id, ..
            } => {
                let boundary = st
                    .boundary_jobs
                    .get(&token_id)
                    .and_then(|arms| arms.iter().find(|a| a.job_id == job_id))
                    .map(|a| a.node_id.clone());

                if let Some(boundary_node) = boundary {
                    self.fire_boundary(st, token_id, &boundary_node, job_id);
                    self.drive(def, st)?;
                } else if st.waiting_jobs.get(&token_id) == Some(&job_id) {
                    st.waiting_jobs.remove(&token_id);
                    let node_id = match st.tokens.get_mut(&token_id) {
                        Some(token) if token.state == TokenState::Waiting => {
                            token.state = TokenState::Active;
                            token.node_id.clone()
                        }
                        _ => return Ok(()),
                    };
                    debug!(instance_id = %st.instance_id, %token_id, node = %node_id, "timer resumed token");
                    if let Err(e) = self.move_on(def, st, token_id, &node_id) {
                        self.fail_instance(st, Some(token_id), e);
                        return Ok(());
                    }
                    self.drive(def, st)?;
                } else {
                    debug!(%token_id, %job_id, "stale timer event ignored");
                }
            }

            SchedulerEvent::TaskCompleted {
                token_id,
                job_id,
                result,
                ..
            } => {
                if st.waiting_jobs.get(&token_id) != Some(&job_id) {
                    // Late completion for an interrupted or stale token.
                    debug!(%token_id, %job_id, "ignoring late task completion");
                    return Ok(());
                }
                st.waiting_jobs.remove(&token_id);
                self.cancel_boundaries(st, token_id, None);

                let (node_id, scope_id) = match st.tokens.get_mut(&token_id) {
                    Some(token) if token.state == TokenState::Waiting => {
                        token.state = TokenState::Active;
                        (token.node_id.clone(), token.scope_id)
                    }
                    _ => return Ok(()),
                };

                let mut writes: Vec<(&String, &Value)> = result.iter().collect();
                writes.sort_by_key(|(k, _)| k.clone());
                for (name, value) in writes {
                    st.scopes.write(scope_id, name, value.clone());
                }

                debug!(instance_id = %st.instance_id, %token_id, node = %node_id, "task completed");
                if let Err(e) = self.move_on(def, st, token_id, &node_id) {
                    self.fail_instance(st, Some(token_id), e);
                    return Ok(());
                }
                self.drive(def, st)?;
            }

            SchedulerEvent::TaskFailed {
                token_id,
                job_id,
                message,
                ..
            } => {
                if st.waiting_jobs.get(&token_id) != Some(&job_id) {
                    debug!(%token_id, %job_id, "ignoring late task failure");
                    return Ok(());
                }
                st.waiting_jobs.remove(&token_id);
                self.cancel_boundaries(st, token_id, None);
                let node_id = st
                    .tokens
                    .get(&token_id)
                    .map(|t| t.node_id.clone())
                    .unwrap_or_default();
                self.fail_instance(
                    st,
                    Some(token_id),
                    EngineError::TaskFailed {
                        node: node_id,
                        message,
                    },
                );
            }
        }
        Ok(())
    }

    // ─── The state machine ────────────────────────────────────

    /// Advance every active token until the instance is quiescent (all
    /// tokens waiting or consumed) or leaves the Running state. Guarded
    /// against re-entry: a second writer is a caller bug.
    fn drive(&self, def: &ProcessDefinition, st: &mut InstanceState) -> Result<(), EngineError> {
        if st.in_step {
            return Err(EngineError::ConcurrencyViolation(st.instance_id));
        }
        st.in_step = true;
        let result = self.drive_inner(def, st);
        st.in_step = false;
        result
    }

    fn drive_inner(&self, def: &ProcessDefinition, st: &mut InstanceState) -> Result<(), EngineError> {
        let mut queue: VecDeque<Uuid> = st.active_tokens_in_order().into();
        while let Some(token_id) = queue.pop_front() {
            if st.status != InstanceStatus::Running {
                break;
            }
            match st.tokens.get(&token_id) {
                Some(token) if token.state == TokenState::Active => {}
                _ => continue,
            }
            match self.step(def, st, token_id) {
                Ok(spawned) => queue.extend(spawned),
                Err(e) => {
                    self.fail_instance(st, Some(token_id), e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Execute one node for one token. Returns the tokens that are
    /// active afterwards and still need stepping.
    fn step(
        &self,
        def: &ProcessDefinition,
        st: &mut InstanceState,
        token_id: Uuid,
    ) -> Result<Vec<Uuid>, EngineError> {
        let token = st
            .tokens
            .get(&token_id)
            .cloned()
            .ok_or(EngineError::TokenNotFound(token_id))?;
        let node = def
            .node(&token.node_id)
            .ok_or_else(|| EngineError::UnknownNode {
                token: token_id,
                node: token.node_id.clone(),
            })?
            .clone();
        debug!(instance_id = %st.instance_id, %token_id, node = %node.id, "step");

        match &node.kind {
            NodeKind::StartEvent | NodeKind::Task => {
                self.move_on(def, st, token_id, &node.id)?;
                Ok(vec![token_id])
            }

            // Boundary nodes are only entered by a fired boundary event;
            // from there they behave like a plain pass-through.
            NodeKind::BoundaryTimer { .. } => {
                self.move_on(def, st, token_id, &node.id)?;
                Ok(vec![token_id])
            }

            NodeKind::EndEvent => {
                if let Some(t) = st.tokens.get_mut(&token_id) {
                    t.state = TokenState::Consumed;
                }
                if st.live_token_count() == 0 {
                    st.status = InstanceStatus::Completed;
                    st.ended_at_ms = Some(now_ms());
                    info!(instance_id = %st.instance_id, "instance completed");
                }
                Ok(vec![])
            }

            NodeKind::ScriptTask { script } => {
                let visible = st.scopes.visible(token.scope_id);
                let writes = expr::run_script(script, &visible).map_err(|e| EngineError::Eval {
                    node: node.id.clone(),
                    source: e,
                })?;
                for (name, value) in writes {
                    st.scopes.write(token.scope_id, &name, value);
                }
                self.move_on(def, st, token_id, &node.id)?;
                Ok(vec![token_id])
            }

            NodeKind::ServiceTask {
                task,
                properties,
                extensions,
            } => {
                let visible = st.scopes.visible(token.scope_id);
                let input = TaskInput {
                    instance_id: st.instance_id,
                    token_id,
                    properties: resolve_placeholders(properties, &visible),
                    extensions: extensions.clone(),
                    variables: visible,
                };
                if let Some(t) = st.tokens.get_mut(&token_id) {
                    t.state = TokenState::Waiting;
                }
                let job = self.scheduler.dispatch_task(task.clone(), input);
                st.waiting_jobs.insert(token_id, job);
                self.arm_boundaries(def, st, token_id, &node.id);
                Ok(vec![])
            }

            NodeKind::TimerCatchEvent { timer } => {
                if let Some(t) = st.tokens.get_mut(&token_id) {
                    t.state = TokenState::Waiting;
                }
                let job =
                    self.scheduler
                        .schedule_timer(st.instance_id, token_id, timer.due_at(now_ms()));
                st.waiting_jobs.insert(token_id, job);
                Ok(vec![])
            }

            NodeKind::ExclusiveGateway => {
                let visible = st.scopes.visible(token.scope_id);
                let flows = def.outgoing_flows(&node.id);

                // First truthy condition in declared order wins.
                for flow in &flows {
                    let Some(condition) = &flow.condition else {
                        continue;
                    };
                    match expr::evaluate_bool(condition, &visible) {
                        Ok(true) => {
                            let target = flow.target.clone();
                            self.move_to(st, token_id, &target);
                            return Ok(vec![token_id]);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            // Branch-local: this branch is not taken.
                            warn!(
                                instance_id = %st.instance_id, node = %node.id,
                                condition = %condition, error = %e,
                                "condition evaluation failed, branch skipped"
                            );
                        }
                    }
                }
                if let Some(default) = flows.iter().find(|f| f.condition.is_none()) {
                    let target = default.target.clone();
                    self.move_to(st, token_id, &target);
                    return Ok(vec![token_id]);
                }
                Err(EngineError::NoApplicableFlow {
                    node: node.id.clone(),
                })
            }

            NodeKind::ParallelGateway => {
                let n_in = def.incoming_flows(&node.id).len();
                let n_out = def.outgoing_flows(&node.id).len();
                if n_in > 1 {
                    self.join_arrival(def, st, token_id, &node.id)
                } else if n_out > 1 {
                    let targets: Vec<String> = def
                        .outgoing_flows(&node.id)
                        .iter()
                        .map(|f| f.target.clone())
                        .collect();
                    Ok(self.split(st, token_id, targets))
                } else {
                    self.move_on(def, st, token_id, &node.id)?;
                    Ok(vec![token_id])
                }
            }

            NodeKind::InclusiveGateway => {
                let n_in = def.incoming_flows(&node.id).len();
                if n_in > 1 {
                    self.join_arrival(def, st, token_id, &node.id)
                } else {
                    let targets = self.inclusive_targets(def, st, &node.id, token.scope_id)?;
                    Ok(self.split(st, token_id, targets))
                }
            }
        }
    }

    /// Truthy-condition targets of an inclusive split, declared order;
    /// the default flow only when no condition held.
    fn inclusive_targets(
        &self,
        def: &ProcessDefinition,
        st: &InstanceState,
        node_id: &str,
        scope_id: crate::vars::ScopeId,
    ) -> Result<Vec<String>, EngineError> {
        let visible = st.scopes.visible(scope_id);
        let flows = def.outgoing_flows(node_id);
        let mut targets = Vec::new();
        for flow in &flows {
            let Some(condition) = &flow.condition else {
                continue;
            };
            match expr::evaluate_bool(condition, &visible) {
                Ok(true) => targets.push(flow.target.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        instance_id = %st.instance_id, node = %node_id,
                        condition = %condition, error = %e,
                        "condition evaluation failed, branch skipped"
                    );
                }
            }
        }
        if targets.is_empty() {
            if let Some(default) = flows.iter().find(|f| f.condition.is_none()) {
                targets.push(default.target.clone());
            }
        }
        if targets.is_empty() {
            return Err(EngineError::NoApplicableFlow {
                node: node_id.to_string(),
            });
        }
        Ok(targets)
    }

    /// Fork one scope and token per target; the splitting token is
    /// consumed. Siblings share a fresh fork group for join bookkeeping.
    fn split(&self, st: &mut InstanceState, token_id: Uuid, targets: Vec<String>) -> Vec<Uuid> {
        let Some(token) = st.tokens.get(&token_id).cloned() else {
            return vec![];
        };
        let group_id = Uuid::new_v4();
        st.fork_groups.insert(
            group_id,
            ForkGroup {
                id: group_id,
                size: targets.len(),
                parent_scope: token.scope_id,
                origin_group: token.fork_group,
                origin_token: token_id,
            },
        );

        let mut children = Vec::with_capacity(targets.len());
        for target in &targets {
            let child_scope = st.scopes.fork(token.scope_id);
            let child = st.spawn_token(target, child_scope, Some(token_id), Some(group_id));
            children.push(child);
        }
        if let Some(t) = st.tokens.get_mut(&token_id) {
            t.state = TokenState::Consumed;
        }
        debug!(
            instance_id = %st.instance_id, node = %token.node_id,
            branches = children.len(), "token split"
        );
        children
    }

    /// A token reached a join gateway. Held (not re-queued) until every
    /// sibling of its fork group has arrived, then the branches merge in
    /// arrival order and one successor continues past the join.
    fn join_arrival(
        &self,
        def: &ProcessDefinition,
        st: &mut InstanceState,
        token_id: Uuid,
        node_id: &str,
    ) -> Result<Vec<Uuid>, EngineError> {
        let token = st
            .tokens
            .get(&token_id)
            .cloned()
            .ok_or(EngineError::TokenNotFound(token_id))?;
        let group_id = token.fork_group.ok_or_else(|| EngineError::UnbalancedJoin {
            node: node_id.to_string(),
        })?;
        let group = st
            .fork_groups
            .get(&group_id)
            .cloned()
            .ok_or_else(|| EngineError::UnbalancedJoin {
                node: node_id.to_string(),
            })?;

        if let Some(t) = st.tokens.get_mut(&token_id) {
            t.state = TokenState::Waiting;
        }
        let arrived = {
            let arrivals = st
                .join_arrivals
                .entry(node_id.to_string())
                .or_default()
                .entry(group_id)
                .or_default();
            arrivals.push(token_id);
            arrivals.clone()
        };
        if arrived.len() < group.size {
            debug!(
                instance_id = %st.instance_id, node = %node_id,
                arrived = arrived.len(), expected = group.size, "join waiting"
            );
            return Ok(vec![]);
        }

        // All siblings arrived: consume them and merge scopes in
        // arrival order (conflicts resolve last-writer-wins).
        for sibling in &arrived {
            if let Some(t) = st.tokens.get_mut(sibling) {
                t.state = TokenState::Consumed;
            }
        }
        for sibling in &arrived {
            if let Some(scope) = st.tokens.get(sibling).map(|t| t.scope_id) {
                st.scopes.merge(scope, group.parent_scope);
            }
        }
        if let Some(groups) = st.join_arrivals.get_mut(node_id) {
            groups.remove(&group_id);
        }
        st.fork_groups.remove(&group_id);

        let successor = st.spawn_token(
            node_id,
            group.parent_scope,
            Some(group.origin_token),
            group.origin_group,
        );
        debug!(instance_id = %st.instance_id, node = %node_id, "join completed");

        // Continue past the join; a gateway that also fans out splits
        // the successor immediately.
        let node = def.node(node_id).ok_or_else(|| EngineError::UnknownNode {
            token: successor,
            node: node_id.to_string(),
        })?;
        let n_out = def.outgoing_flows(node_id).len();
        if n_out > 1 {
            let targets = match node.kind {
                NodeKind::InclusiveGateway => {
                    self.inclusive_targets(def, st, node_id, group.parent_scope)?
                }
                _ => def
                    .outgoing_flows(node_id)
                    .iter()
                    .map(|f| f.target.clone())
                    .collect(),
            };
            Ok(self.split(st, successor, targets))
        } else {
            self.move_on(def, st, successor, node_id)?;
            Ok(vec![successor])
        }
    }

    /// Move a token along its node's single outgoing flow.
    fn move_on(
        &self,
        def: &ProcessDefinition,
        st: &mut InstanceState,
        token_id: Uuid,
        node_id: &str,
    ) -> Result<(), EngineError> {
        let flows = def.outgoing_flows(node_id);
        let flow = flows
            .first()
            .ok_or_else(|| EngineError::Malformed(MalformedGraph::NoOutgoing(node_id.to_string())))?;
        let target = flow.target.clone();
        self.move_to(st, token_id, &target);
        Ok(())
    }

    fn move_to(&self, st: &mut InstanceState, token_id: Uuid, target: &str) {
        if let Some(token) = st.tokens.get_mut(&token_id) {
            token.node_id = target.to_string();
            token.state = TokenState::Active;
        }
    }

    /// Arm every boundary timer attached to a task whose token parked.
    fn arm_boundaries(
        &self,
        def: &ProcessDefinition,
        st: &mut InstanceState,
        token_id: Uuid,
        host_node_id: &str,
    ) {
        for boundary_id in def.boundaries(host_node_id) {
            let Some(node) = def.node(boundary_id) else {
                continue;
            };
            if let NodeKind::BoundaryTimer { timer, .. } = &node.kind {
                let job =
                    self.scheduler
                        .schedule_timer(st.instance_id, token_id, timer.due_at(now_ms()));
                st.boundary_jobs
                    .entry(token_id)
                    .or_default()
                    .push(BoundaryArm {
                        node_id: boundary_id.clone(),
                        job_id: job,
                    });
            }
        }
    }

    /// Cancel a parked token's boundary timers, except the one that
    /// already fired.
    fn cancel_boundaries(&self, st: &mut InstanceState, token_id: Uuid, fired: Option<Uuid>) {
        if let Some(arms) = st.boundary_jobs.remove(&token_id) {
            for arm in arms {
                if Some(arm.job_id) != fired {
                    self.scheduler.cancel_job(arm.job_id);
                }
            }
        }
    }

    /// A boundary timer fired first: the host task's token is forcibly
    /// consumed, its in-flight job is cancelled (a late completion is
    /// ignored), and a new token starts at the boundary event.
    fn fire_boundary(
        &self,
        st: &mut InstanceState,
        host_token_id: Uuid,
        boundary_node_id: &str,
        fired_job: Uuid,
    ) {
        if let Some(job) = st.waiting_jobs.remove(&host_token_id) {
            self.scheduler.cancel_job(job);
        }
        self.cancel_boundaries(st, host_token_id, Some(fired_job));

        let Some(host) = st.tokens.get_mut(&host_token_id) else {
            return;
        };
        host.state = TokenState::Consumed;
        let scope_id = host.scope_id;
        let parent = host.parent_token_id;
        let group = host.fork_group;
        let host_node = host.node_id.clone();

        let interrupt = st.spawn_token(boundary_node_id, scope_id, parent, group);
        info!(
            instance_id = %st.instance_id, host_node = %host_node,
            boundary = %boundary_node_id, %interrupt, "boundary timer interrupted task"
        );
    }

    /// Record a node-local failure on the instance and stop advancing
    /// it. Sibling instances are unaffected; state is preserved for
    /// inspection.
    fn fail_instance(&self, st: &mut InstanceState, token_id: Option<Uuid>, err: EngineError) {
        let node_id = token_id
            .and_then(|t| st.tokens.get(&t))
            .map(|t| t.node_id.clone())
            .unwrap_or_default();
        error!(
            instance_id = %st.instance_id, node = %node_id, error = %err,
            "instance moved to error state"
        );
        st.status = InstanceStatus::Error;
        st.error = Some(ErrorRecord {
            node_id,
            token_id,
            message: err.to_string(),
        });
    }

    fn instance(&self, instance_id: Uuid) -> Result<Arc<Mutex<InstanceState>>, EngineError> {
        self.instances
            .get(&instance_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    async fn persist(&self, st: &InstanceState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(st).await {
                error!(instance_id = %st.instance_id, error = %e, "snapshot persistence failed");
            }
        }
    }
}

/// Resolve `${var}` placeholders in string-valued properties against the
/// token's visible variables before dispatch.
fn resolve_placeholders(
    properties: &serde_json::Map<String, Value>,
    vars: &HashMap<String, Value>,
) -> serde_json::Map<String, Value> {
    let mut out = properties.clone();
    for (_, v) in out.iter_mut() {
        if let Some(s) = v.as_str() {
            if let Some(name) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
                if let Some(value) = vars.get(name) {
                    *v = value.clone();
                }
            }
        }
    }
    out
}

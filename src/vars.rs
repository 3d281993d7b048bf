use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Index into the scope arena. Scopes are never removed while the
/// instance is live; completed instances are archived wholesale.
pub type ScopeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Array,
    Object,
}

impl VarKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => VarKind::Null,
            Value::Bool(_) => VarKind::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => VarKind::Int,
            Value::Number(_) => VarKind::Float,
            Value::String(_) => VarKind::String,
            Value::Array(_) => VarKind::Array,
            Value::Object(_) => VarKind::Object,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    pub kind: VarKind,
    pub value: Value,
    pub version: u32,
}

/// One append-only journal entry per write, for history replay/audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub scope_id: ScopeId,
    pub name: String,
    pub version: u32,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Scope {
    parent: Option<ScopeId>,
    // BTreeMap keeps iteration deterministic, which keeps merge and
    // journal order deterministic across runs.
    vars: BTreeMap<String, VariableValue>,
}

/// Arena-style scope tree: a flat scope table with parent indices.
/// Reads walk the chain outward (child shadows parent). Writes land in
/// the token's current scope so that parallel-branch writes stay local
/// until the branch is merged at its join.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeArena {
    scopes: Vec<Scope>,
    journal: Vec<WriteRecord>,
}

impl ScopeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a root scope (one per instance).
    pub fn new_root(&mut self) -> ScopeId {
        self.scopes.push(Scope {
            parent: None,
            vars: BTreeMap::new(),
        });
        self.scopes.len() - 1
    }

    /// Fork a child scope for a parallel branch. The child starts empty
    /// and delegates reads to the parent until a write shadows.
    pub fn fork(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.push(Scope {
            parent: Some(parent),
            vars: BTreeMap::new(),
        });
        self.scopes.len() - 1
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes[scope].parent
    }

    /// Read a variable, walking the scope chain outward.
    pub fn read(&self, scope: ScopeId, name: &str) -> Option<&VariableValue> {
        let mut current = Some(scope);
        while let Some(id) = current {
            if let Some(v) = self.scopes[id].vars.get(name) {
                return Some(v);
            }
            current = self.scopes[id].parent;
        }
        None
    }

    /// Write a variable into the given scope, appending a version record.
    /// A write never mutates an outer scope: shadowing an inherited name
    /// starts a fresh local version chain, so sibling branches cannot see
    /// each other's writes before their join merges them.
    pub fn write(&mut self, scope: ScopeId, name: &str, value: Value) -> u32 {
        let version = self.scopes[scope]
            .vars
            .get(name)
            .map(|v| v.version + 1)
            .unwrap_or(1);
        self.scopes[scope].vars.insert(
            name.to_string(),
            VariableValue {
                kind: VarKind::of(&value),
                value: value.clone(),
                version,
            },
        );
        self.journal.push(WriteRecord {
            scope_id: scope,
            name: name.to_string(),
            version,
            value,
        });
        version
    }

    /// Merge a joined branch scope into its parent: every child-local
    /// name is written into the parent as a new version. Callers merge
    /// siblings in join arrival order, so conflicting names resolve
    /// last-writer-wins by arrival.
    pub fn merge(&mut self, child: ScopeId, parent: ScopeId) {
        let locals: Vec<(String, Value)> = self.scopes[child]
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect();
        for (name, value) in locals {
            self.write(parent, &name, value);
        }
    }

    /// Flattened view of everything visible from a scope, child shadowing
    /// parent. This is the evaluator's input and the snapshot projection.
    pub fn visible(&self, scope: ScopeId) -> HashMap<String, Value> {
        let mut chain = Vec::new();
        let mut current = Some(scope);
        while let Some(id) = current {
            chain.push(id);
            current = self.scopes[id].parent;
        }
        let mut out = HashMap::new();
        // Outermost first so inner scopes overwrite.
        for id in chain.into_iter().rev() {
            for (k, v) in &self.scopes[id].vars {
                out.insert(k.clone(), v.value.clone());
            }
        }
        out
    }

    /// Names owned locally by a scope (not inherited).
    pub fn locals(&self, scope: ScopeId) -> Vec<(&str, &VariableValue)> {
        self.scopes[scope]
            .vars
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect()
    }

    pub fn journal(&self) -> &[WriteRecord] {
        &self.journal
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }
}

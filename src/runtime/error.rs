use crate::definition::MalformedGraph;
use crate::expr::EvalError;
use crate::runtime::instance::InstanceStatus;
use thiserror::Error;
use uuid::Uuid;

/// Engine-level failure taxonomy. Node-local errors raised while driving
/// an instance are captured onto that instance's error record and never
/// cross instance boundaries.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed graph: {0}")]
    Malformed(#[from] MalformedGraph),

    #[error("evaluation failed at node {node}: {source}")]
    Eval {
        node: String,
        #[source]
        source: EvalError,
    },

    #[error("no applicable flow out of gateway {node}")]
    NoApplicableFlow { node: String },

    #[error("task failed at node {node}: {message}")]
    TaskFailed { node: String, message: String },

    #[error("timer missed for token {token}")]
    TimerMissed { token: Uuid },

    /// Defensive: a second writer entered an instance's single-writer
    /// region. Indicates a caller bug, not an engine state problem.
    #[error("concurrent mutation of instance {0}")]
    ConcurrencyViolation(Uuid),

    #[error("a token arrived at join {node} without a matching fork")]
    UnbalancedJoin { node: String },

    #[error("token {token} references unknown node {node}")]
    UnknownNode { token: Uuid, node: String },

    #[error("definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("token not found: {0}")]
    TokenNotFound(Uuid),

    #[error("instance {instance} is {status:?}")]
    InvalidStatus {
        instance: Uuid,
        status: InstanceStatus,
    },
}

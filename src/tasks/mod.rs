use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use uuid::Uuid;

pub mod builtin;
pub mod http;

use anyhow::Result;

/// Everything a service-task implementation gets to see: resolved
/// properties from the definition, the opaque vendor-extension
/// side-channel, and the token's visible variables.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub instance_id: Uuid,
    pub token_id: Uuid,
    pub properties: serde_json::Map<String, Value>,
    /// Extension attributes the engine never interprets.
    pub extensions: serde_json::Map<String, Value>,
    pub variables: HashMap<String, Value>,
}

/// Pluggable service-task capability. Implementations are registered on
/// the scheduler by name; the definition's `ServiceTask { task }` field
/// selects one. Returned variables are written into the token's scope
/// when the completion event is applied.
#[async_trait]
pub trait TaskHandler: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn validate(&self, properties: &Value) -> Result<()>;
    async fn execute(&self, input: TaskInput) -> Result<HashMap<String, Value>>;
}

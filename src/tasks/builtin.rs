use crate::tasks::{TaskHandler, TaskInput};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

/// Logs the `msg` property (or the whole property map) and produces no
/// variables.
#[derive(Debug)]
pub struct LogTask;

#[async_trait]
impl TaskHandler for LogTask {
    fn name(&self) -> &str {
        "log"
    }

    fn validate(&self, _properties: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, input: TaskInput) -> Result<HashMap<String, Value>> {
        if let Some(msg) = input.properties.get("msg").and_then(|v| v.as_str()) {
            info!(instance_id = %input.instance_id, "[LOG] {}", msg);
        } else {
            info!(instance_id = %input.instance_id, "[LOG] {:?}", input.properties);
        }
        Ok(HashMap::new())
    }
}

/// Writes the `value` property into the variable named by `name`.
/// Placeholder values (`${var}`) are resolved by the engine before
/// dispatch, so `value` may reference instance variables.
#[derive(Debug)]
pub struct SetTask;

#[async_trait]
impl TaskHandler for SetTask {
    fn name(&self) -> &str {
        "set"
    }

    fn validate(&self, properties: &Value) -> Result<()> {
        if properties.get("name").and_then(|v| v.as_str()).is_none() {
            return Err(anyhow!("Missing required property: name"));
        }
        Ok(())
    }

    async fn execute(&self, input: TaskInput) -> Result<HashMap<String, Value>> {
        let name = input
            .properties
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Missing required property: name"))?;
        let value = input
            .properties
            .get("value")
            .cloned()
            .unwrap_or(Value::Null);
        let mut out = HashMap::new();
        out.insert(name.to_string(), value);
        Ok(out)
    }
}

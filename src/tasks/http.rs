use crate::tasks::{TaskHandler, TaskInput};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;

/// Calls an HTTP endpoint described by the task properties
/// (`url`, `method`, `body`, `headers`) and returns a
/// `{ status, body }` object under the variable named by the `output`
/// property (default `response`).
#[derive(Debug)]
pub struct HttpTask {
    client: Client,
}

impl HttpTask {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for HttpTask {
    fn name(&self) -> &str {
        "http"
    }

    fn validate(&self, properties: &Value) -> Result<()> {
        if properties.get("url").is_none() {
            return Err(anyhow!("Missing required property: url"));
        }
        Ok(())
    }

    async fn execute(&self, input: TaskInput) -> Result<HashMap<String, Value>> {
        let url = input
            .properties
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Invalid url"))?;

        let method_str = input
            .properties
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET");
        let method = method_str
            .parse::<reqwest::Method>()
            .map_err(|_| anyhow!("Invalid HTTP method: {}", method_str))?;

        let mut builder = self.client.request(method, url);

        if let Some(body) = input.properties.get("body") {
            builder = builder.json(body);
        }

        if let Some(headers) = input.properties.get("headers").and_then(|v| v.as_object()) {
            for (k, v) in headers {
                if let Some(v_str) = v.as_str() {
                    builder = builder.header(k, v_str);
                }
            }
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(_) => Value::Null,
        };

        let output = input
            .properties
            .get("output")
            .and_then(|v| v.as_str())
            .unwrap_or("response");

        let mut out = HashMap::new();
        out.insert(output.to_string(), json!({ "status": status, "body": body }));
        Ok(out)
    }
}

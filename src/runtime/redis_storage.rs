use crate::runtime::instance::InstanceState;
use crate::runtime::storage::SnapshotStore;
use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use uuid::Uuid;

/// Snapshot store backed by Redis, for deployments that must survive a
/// process restart. One key per instance, JSON payload.
#[derive(Debug)]
pub struct RedisSnapshotStore {
    client: redis::Client,
    prefix: String,
}

impl RedisSnapshotStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            prefix: "flowcore:inst".to_string(),
        }
    }

    pub fn with_prefix(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn key(&self, instance_id: Uuid) -> String {
        format!("{}:{}", self.prefix, instance_id)
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn save(&self, state: &InstanceState) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json = serde_json::to_string(state)?;
        let _: () = conn.set(self.key(state.instance_id), json).await?;
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<InstanceState>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json: Option<String> = conn.get(self.key(instance_id)).await?;
        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Uuid>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let keys: Vec<String> = conn.keys(format!("{}:*", self.prefix)).await?;
        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = key.rsplit(':').next() {
                if let Ok(id) = raw.parse::<Uuid>() {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

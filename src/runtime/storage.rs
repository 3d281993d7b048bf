use crate::runtime::instance::InstanceState;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// Persistence seam for instance snapshots. The engine saves at every
/// quiescence point and a supervisor restores on recovery; the engine
/// itself never blocks on storage-layer failures.
#[async_trait]
pub trait SnapshotStore: Send + Sync + std::fmt::Debug {
    async fn save(&self, state: &InstanceState) -> Result<()>;
    async fn load(&self, instance_id: Uuid) -> Result<Option<InstanceState>>;
    async fn list(&self) -> Result<Vec<Uuid>>;
}

/// Keeps serialized snapshots in process memory. The default for tests
/// and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: DashMap<Uuid, String>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, state: &InstanceState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.snapshots.insert(state.instance_id, json);
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<InstanceState>> {
        match self.snapshots.get(&instance_id) {
            Some(entry) => Ok(Some(serde_json::from_str(entry.value())?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.snapshots.iter().map(|e| *e.key()).collect();
        ids.sort();
        Ok(ids)
    }
}

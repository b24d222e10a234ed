use crate::modules::enrichment::domain::EnrichableEntity;
use crate::modules::enrichment::ports::EntityRepository;
use crate::shared::errors::AppResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Process-local entity store
#[derive(Debug, Clone, Default)]
pub struct InMemoryEntityRepository {
    entities: Arc<RwLock<HashMap<Uuid, EnrichableEntity>>>,
}

impl InMemoryEntityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }
}

#[async_trait]
impl EntityRepository for InMemoryEntityRepository {
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<EnrichableEntity>> {
        Ok(self.entities.read().await.get(&id).cloned())
    }

    async fn find_by_key(&self, key: &str) -> AppResult<Option<EnrichableEntity>> {
        let key = key.trim();
        let entities = self.entities.read().await;
        // Oldest wins when several entities share a key
        Ok(entities
            .values()
            .filter(|entity| entity.key == key)
            .min_by_key(|entity| entity.updated_at)
            .cloned())
    }

    async fn find_many(&self, ids: &[Uuid]) -> AppResult<HashMap<Uuid, EnrichableEntity>> {
        let entities = self.entities.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| entities.get(id).map(|entity| (*id, entity.clone())))
            .collect())
    }

    async fn save(&self, entity: &EnrichableEntity) -> AppResult<()> {
        self.entities
            .write()
            .await
            .insert(entity.id, entity.clone());
        Ok(())
    }
}

use crate::modules::enrichment::domain::EnrichableEntity;
use crate::shared::errors::AppResult;
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

/// Document store for enrichable entities
#[async_trait]
pub trait EntityRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<EnrichableEntity>>;

    async fn find_by_key(&self, key: &str) -> AppResult<Option<EnrichableEntity>>;

    /// One round trip for a whole batch; unknown ids are simply absent
    async fn find_many(&self, ids: &[Uuid]) -> AppResult<HashMap<Uuid, EnrichableEntity>>;

    /// Insert or replace by id
    async fn save(&self, entity: &EnrichableEntity) -> AppResult<()>;
}

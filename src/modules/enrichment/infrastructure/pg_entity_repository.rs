use crate::modules::enrichment::domain::EnrichableEntity;
use crate::modules::enrichment::ports::EntityRepository;
use crate::schema::enrichable_entities;
use crate::shared::errors::AppResult;
use crate::shared::infrastructure::database::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use uuid::Uuid;

/// Entity row; every stage field lives in the JSONB `document`
#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = enrichable_entities)]
struct EntityRow {
    id: Uuid,
    entity_key: String,
    document: JsonValue,
    cached: bool,
    updated_at: DateTime<Utc>,
}

impl EntityRow {
    fn from_entity(entity: &EnrichableEntity) -> AppResult<Self> {
        Ok(Self {
            id: entity.id,
            entity_key: entity.key.clone(),
            document: serde_json::to_value(entity)?,
            cached: entity.cached,
            updated_at: entity.updated_at,
        })
    }

    /// Columns win over whatever the document says
    fn into_entity(self) -> AppResult<EnrichableEntity> {
        let mut entity: EnrichableEntity = serde_json::from_value(self.document)?;
        entity.id = self.id;
        entity.key = self.entity_key;
        entity.cached = self.cached;
        entity.updated_at = self.updated_at;
        Ok(entity)
    }
}

pub struct PgEntityRepository {
    db: Database,
}

impl PgEntityRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EntityRepository for PgEntityRepository {
    async fn find_by_id(&self, entity_id: Uuid) -> AppResult<Option<EnrichableEntity>> {
        let row = self
            .db
            .run(move |conn| {
                enrichable_entities::table
                    .find(entity_id)
                    .select(EntityRow::as_select())
                    .first(conn)
                    .optional()
                    .map_err(Into::into)
            })
            .await?;
        row.map(EntityRow::into_entity).transpose()
    }

    async fn find_by_key(&self, key: &str) -> AppResult<Option<EnrichableEntity>> {
        let key = key.trim().to_string();
        let row = self
            .db
            .run(move |conn| {
                enrichable_entities::table
                    .filter(enrichable_entities::entity_key.eq(key))
                    .order(enrichable_entities::updated_at.asc())
                    .select(EntityRow::as_select())
                    .first(conn)
                    .optional()
                    .map_err(Into::into)
            })
            .await?;
        row.map(EntityRow::into_entity).transpose()
    }

    async fn find_many(&self, ids: &[Uuid]) -> AppResult<HashMap<Uuid, EnrichableEntity>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = ids.to_vec();
        let rows: Vec<EntityRow> = self
            .db
            .run(move |conn| {
                enrichable_entities::table
                    .filter(enrichable_entities::id.eq_any(ids))
                    .select(EntityRow::as_select())
                    .load(conn)
                    .map_err(Into::into)
            })
            .await?;

        rows.into_iter()
            .map(|row| row.into_entity().map(|entity| (entity.id, entity)))
            .collect()
    }

    async fn save(&self, entity: &EnrichableEntity) -> AppResult<()> {
        let row = EntityRow::from_entity(entity)?;
        self.db
            .run(move |conn| {
                diesel::insert_into(enrichable_entities::table)
                    .values(&row)
                    .on_conflict(enrichable_entities::id)
                    .do_update()
                    .set(&row)
                    .execute(conn)
                    .map(|_| ())
                    .map_err(Into::into)
            })
            .await
    }
}

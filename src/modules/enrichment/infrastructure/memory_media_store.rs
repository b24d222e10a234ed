use crate::modules::enrichment::domain::{MediaKind, MediaRef};
use crate::modules::enrichment::ports::{ExistingMedia, GeneratedMedia, MediaStore};
use crate::shared::errors::AppResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredAsset {
    reference: MediaRef,
    bytes: Vec<u8>,
}

/// Keeps generated assets in memory under `memory://<kind>/<key>`
#[derive(Debug, Clone, Default)]
pub struct InMemoryMediaStore {
    assets: Arc<RwLock<HashMap<(MediaKind, String), StoredAsset>>>,
}

impl InMemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bytes(&self, key: &str, kind: MediaKind) -> Option<Vec<u8>> {
        self.assets
            .read()
            .await
            .get(&(kind, key.to_string()))
            .map(|asset| asset.bytes.clone())
    }

    pub async fn asset_count(&self) -> usize {
        self.assets.read().await.len()
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn find_existing(&self, key: &str) -> AppResult<ExistingMedia> {
        let assets = self.assets.read().await;
        let lookup = |kind| {
            assets
                .get(&(kind, key.to_string()))
                .map(|asset| asset.reference.clone())
        };
        Ok(ExistingMedia {
            image: lookup(MediaKind::Image),
            audio: lookup(MediaKind::Audio),
        })
    }

    async fn store(
        &self,
        key: &str,
        kind: MediaKind,
        media: GeneratedMedia,
    ) -> AppResult<MediaRef> {
        let mut assets = self.assets.write().await;
        let asset = assets
            .entry((kind, key.to_string()))
            .or_insert_with(|| StoredAsset {
                reference: MediaRef {
                    kind,
                    key: key.to_string(),
                    uri: format!("memory://{}/{}", kind, key),
                    content_type: media.content_type.clone(),
                },
                bytes: media.bytes,
            });
        Ok(asset.reference.clone())
    }
}

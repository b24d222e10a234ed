use super::collaborators::GeneratedMedia;
use crate::modules::enrichment::domain::{MediaKind, MediaRef};
use crate::shared::errors::AppResult;
use async_trait::async_trait;

/// Assets already stored for one key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingMedia {
    pub image: Option<MediaRef>,
    pub audio: Option<MediaRef>,
}

impl ExistingMedia {
    pub fn get(&self, kind: MediaKind) -> Option<&MediaRef> {
        match kind {
            MediaKind::Image => self.image.as_ref(),
            MediaKind::Audio => self.audio.as_ref(),
        }
    }
}

/// Content-addressed asset storage keyed by entity key
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn find_existing(&self, key: &str) -> AppResult<ExistingMedia>;

    /// Put-if-absent: when an asset of this kind already exists for `key`
    /// the stored one is returned and `media` is dropped.
    async fn store(&self, key: &str, kind: MediaKind, media: GeneratedMedia)
        -> AppResult<MediaRef>;
}

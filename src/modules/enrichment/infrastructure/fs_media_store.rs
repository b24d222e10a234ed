use crate::log_debug;
use crate::modules::enrichment::domain::{MediaKind, MediaRef};
use crate::modules::enrichment::ports::{ExistingMedia, GeneratedMedia, MediaStore};
use crate::shared::errors::{AppError, AppResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Content-addressed assets on a local or mounted filesystem.
///
/// Layout: `<root>/<kind>/<urlencoded key>-<write id>.<ext>` plus a
/// `<urlencoded key>.json` sidecar holding the `MediaRef`. The sidecar is
/// published with a hard link, which fails if it already exists, so `store`
/// stays put-if-absent across processes sharing the directory.
#[derive(Debug, Clone)]
pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: MediaKind) -> PathBuf {
        self.root.join(kind.to_string())
    }

    fn sidecar_path(&self, key: &str, kind: MediaKind) -> PathBuf {
        self.kind_dir(kind)
            .join(format!("{}.json", urlencoding::encode(key)))
    }

    fn asset_path(&self, key: &str, kind: MediaKind, write_id: &str, content_type: &str) -> PathBuf {
        self.kind_dir(kind).join(format!(
            "{}-{}.{}",
            urlencoding::encode(key),
            write_id,
            extension_for(content_type)
        ))
    }

    async fn read_sidecar(&self, key: &str, kind: MediaKind) -> AppResult<Option<MediaRef>> {
        match fs::read(self.sidecar_path(key, kind)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn find_existing(&self, key: &str) -> AppResult<ExistingMedia> {
        Ok(ExistingMedia {
            image: self.read_sidecar(key, MediaKind::Image).await?,
            audio: self.read_sidecar(key, MediaKind::Audio).await?,
        })
    }

    async fn store(
        &self,
        key: &str,
        kind: MediaKind,
        media: GeneratedMedia,
    ) -> AppResult<MediaRef> {
        if let Some(existing) = self.read_sidecar(key, kind).await? {
            return Ok(existing);
        }

        fs::create_dir_all(self.kind_dir(kind)).await?;

        let write_id = Uuid::new_v4().simple().to_string();
        let asset_path = self.asset_path(key, kind, &write_id, &media.content_type);
        fs::write(&asset_path, &media.bytes).await?;

        let reference = MediaRef {
            kind,
            key: key.to_string(),
            uri: asset_path.to_string_lossy().into_owned(),
            content_type: media.content_type.clone(),
        };

        let sidecar_path = self.sidecar_path(key, kind);
        let staging = sidecar_path.with_extension(format!("{}.tmp", write_id));
        fs::write(&staging, serde_json::to_vec(&reference)?).await?;

        let published = fs::hard_link(&staging, &sidecar_path).await;
        fs::remove_file(&staging).await.ok();

        match published {
            Ok(()) => {
                log_debug!("Stored {} for '{}' at {}", kind, key, reference.uri);
                Ok(reference)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Another writer got there first; keep theirs
                fs::remove_file(&asset_path).await.ok();
                self.read_sidecar(key, kind).await?.ok_or_else(|| {
                    AppError::InternalError(format!(
                        "{} sidecar for '{}' vanished after a concurrent write",
                        kind, key
                    ))
                })
            }
            Err(e) => {
                fs::remove_file(&asset_path).await.ok();
                Err(e.into())
            }
        }
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().unwrap_or("").trim() {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "audio/mpeg" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/ogg" => "ogg",
        _ => "bin",
    }
}

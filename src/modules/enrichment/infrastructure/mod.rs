pub mod fs_media_store;
pub mod http_client;
pub mod memory_media_store;
pub mod memory_repository;
#[cfg(feature = "postgres")]
pub mod pg_entity_repository;

pub use fs_media_store::FsMediaStore;
pub use http_client::{CollaboratorEndpoints, HttpCollaboratorGateway, RetryPolicy};
pub use memory_media_store::InMemoryMediaStore;
pub use memory_repository::InMemoryEntityRepository;
#[cfg(feature = "postgres")]
pub use pg_entity_repository::PgEntityRepository;

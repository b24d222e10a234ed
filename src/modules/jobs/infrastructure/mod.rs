pub mod memory;
#[cfg(feature = "postgres")]
pub mod models;
#[cfg(feature = "postgres")]
pub mod repository;

pub use memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use repository::PgJobStore;

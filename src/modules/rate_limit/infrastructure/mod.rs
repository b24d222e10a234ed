pub mod memory_store;
#[cfg(feature = "postgres")]
pub mod postgres_store;

pub use memory_store::InMemoryTokenStore;
#[cfg(feature = "postgres")]
pub use postgres_store::PgTokenStore;

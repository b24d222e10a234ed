/// Shared infrastructure concerns
///
/// Infrastructure shared across modules. The Postgres pool only exists when the
/// crate is built with the `postgres` feature.
#[cfg(feature = "postgres")]
pub mod database;

#[cfg(feature = "postgres")]
pub use database::Database;

#[cfg(feature = "cli")]
pub mod cli;
pub mod connection;
pub mod migration;

pub use connection::{
    ConnectionConfig, CsvSettings, FirestoreSettings, JsonlSettings, MongoSettings,
    PostgresSettings, SupabaseSettings, SUPPORTED_TYPES,
};
pub use migration::{MigrationConfig, MigrationSettings, MAX_BATCH_SIZE, MAX_RETRIES};

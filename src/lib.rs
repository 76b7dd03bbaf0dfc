pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use crate::adapters::{connector_from_value, create_connector};
pub use crate::config::{ConnectionConfig, MigrationConfig, MigrationSettings};
pub use crate::core::{
    run_migration_job, start_migration, Job, JobStatus, JobTracker, MigrationPipeline,
    MigrationRun, StartedMigration,
};
pub use crate::domain::model::{
    FieldMapping, FieldType, MappingOptions, PipelineState, PipelineStatus, Record, SchemaMapping,
    StatusSnapshot,
};
pub use crate::domain::ports::{Connector, ReadOptions, WriteOptions, WriteResult};
pub use crate::utils::error::{EtlError, Result};

pub mod job_tracker;
pub mod pipeline;
pub mod runner;
pub mod schema;
pub mod transformer;

pub use crate::domain::model::{PipelineStatus, Record, StatusSnapshot};
pub use crate::domain::ports::Connector;
pub use crate::utils::error::Result;
pub use job_tracker::{Job, JobStatus, JobTracker, JobUpdate};
pub use pipeline::{MigrationPipeline, MigrationRun};
pub use runner::{run_migration_job, start_migration, StartedMigration};

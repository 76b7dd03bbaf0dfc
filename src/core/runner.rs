use crate::adapters::create_connector;
use crate::config::MigrationConfig;
use crate::core::job_tracker::{JobStatus, JobTracker, JobUpdate};
use crate::core::pipeline::MigrationPipeline;
use crate::domain::model::{LogLevel, PipelineStatus, Record};
use crate::domain::ports::{Connector, ReadOptions};
use crate::utils::error::{EtlError, Result};
use crate::utils::validation::Validate;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static JOB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 背景執行中的遷移工作
pub struct StartedMigration {
    pub job_id: String,
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<PipelineStatus>>,
}

pub fn new_job_id() -> String {
    let seq = JOB_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("job_{}_{}", chrono::Utc::now().timestamp_millis(), seq)
}

/// 工作上只保留摘要，連線配置中的帳密不會外洩給觀察者
fn config_summary(config: &MigrationConfig) -> serde_json::Value {
    serde_json::json!({
        "source": config.source.db_type(),
        "destination": config.destination.db_type(),
        "mappings": config
            .mappings
            .iter()
            .map(MigrationConfig::mapping_label)
            .collect::<Vec<_>>(),
        "settings": config.settings,
    })
}

fn fail_job(tracker: &JobTracker, job_id: &str, error: &EtlError) {
    tracker.add_error(job_id, error.to_string(), error.source_chain());
    tracker.add_log(
        job_id,
        LogLevel::Error,
        format!("Migration failed: {}", error),
        Default::default(),
    );
    tracker.update_job(job_id, JobUpdate::status(JobStatus::Failed));
}

async fn close_quietly(connector: &dyn Connector) {
    if let Err(e) = connector.close().await {
        tracing::warn!("⚠️ Failed to close {} connector: {}", connector.name(), e);
    }
}

/// 建立連線器、執行 pipeline，並把每個快照轉送到工作登錄表
pub async fn run_migration_job(
    tracker: Arc<JobTracker>,
    job_id: String,
    config: MigrationConfig,
    cancel: CancellationToken,
) -> Result<PipelineStatus> {
    if let Err(e) = config.validate() {
        fail_job(&tracker, &job_id, &e);
        return Err(e);
    }

    let source = match create_connector(&config.source) {
        Ok(connector) => connector,
        Err(e) => {
            fail_job(&tracker, &job_id, &e);
            return Err(e);
        }
    };
    let destination = match create_connector(&config.destination) {
        Ok(connector) => connector,
        Err(e) => {
            close_quietly(source.as_ref()).await;
            fail_job(&tracker, &job_id, &e);
            return Err(e);
        }
    };

    tracker.update_job(&job_id, JobUpdate::status(JobStatus::Running));
    tracing::info!("🚀 Job {} started", job_id);

    let pipeline = MigrationPipeline::new(source, destination, config)?.with_cancellation(cancel);
    let mut run = pipeline.start();
    let mut saw_terminal = false;

    while let Some(snapshot) = run.next().await {
        saw_terminal |= snapshot.state.is_terminal();
        tracker.apply_snapshot(&job_id, &snapshot);
    }

    match run.finish().await {
        Ok(status) => {
            tracker.update_job(&job_id, JobUpdate::status(JobStatus::Completed));
            tracing::info!(
                "✅ Job {} completed: {} records, {} error(s)",
                job_id,
                status.processed_records,
                status.errors.len()
            );
            Ok(status)
        }
        Err(e) => {
            if saw_terminal {
                tracker.update_job(&job_id, JobUpdate::status(JobStatus::Failed));
            } else {
                fail_job(&tracker, &job_id, &e);
            }
            tracing::error!("❌ Job {} failed: {}", job_id, e);
            Err(e)
        }
    }
}

/// 建立 pending 工作並在背景執行
pub fn start_migration(tracker: Arc<JobTracker>, config: MigrationConfig) -> StartedMigration {
    let job_id = new_job_id();
    tracker.create_job(
        job_id.clone(),
        JobUpdate {
            total_records: Some(None),
            config: Some(config_summary(&config)),
            ..JobUpdate::status(JobStatus::Pending)
        },
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_migration_job(
        tracker,
        job_id.clone(),
        config,
        cancel.clone(),
    ));

    StartedMigration {
        job_id,
        cancel,
        task,
    }
}

/// 從集合讀取最多 `limit` 筆記錄
pub async fn preview_records(
    connector: &dyn Connector,
    name: &str,
    limit: usize,
) -> Result<Vec<Record>> {
    let limit = limit.max(1);
    let mut reader = connector.read_batch(name, ReadOptions::new(limit).with_limit(Some(limit)));
    let mut records = Vec::new();

    while let Some(batch) = reader.next_batch().await? {
        if batch.is_empty() {
            break;
        }
        records.extend(batch);
        if records.len() >= limit {
            break;
        }
    }

    records.truncate(limit);
    Ok(records)
}

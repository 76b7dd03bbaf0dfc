use crate::domain::model::{LogLevel, PipelineState, StatusSnapshot};
use crate::utils::error::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl From<PipelineState> for JobStatus {
    fn from(state: PipelineState) -> Self {
        match state {
            PipelineState::Idle => JobStatus::Pending,
            PipelineState::Running => JobStatus::Running,
            PipelineState::Completed => JobStatus::Completed,
            PipelineState::Failed => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_index: Option<usize>,
}

/// 對外可觀察的遷移工作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub processed_records: u64,
    pub total_records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_mapping: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    pub logs: Vec<JobLogEntry>,
    pub errors: Vec<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 部分欄位更新；`None` 表示不變
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub processed_records: Option<u64>,
    pub total_records: Option<Option<u64>>,
    pub current_mapping: Option<Option<String>>,
    pub config: Option<serde_json::Value>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

impl Job {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            progress: 0.0,
            processed_records: 0,
            total_records: None,
            current_mapping: None,
            config: None,
            logs: Vec::new(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// progress 限制在 [0, 100]，processedRecords 只增不減
    fn merge(&mut self, update: JobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(progress) = update.progress {
            self.progress = if progress.is_nan() {
                0.0
            } else {
                progress.clamp(0.0, 100.0)
            };
        }
        if let Some(processed) = update.processed_records {
            self.processed_records = self.processed_records.max(processed);
        }
        if let Some(total) = update.total_records {
            self.total_records = total;
        }
        if let Some(mapping) = update.current_mapping {
            self.current_mapping = mapping;
        }
        if let Some(config) = update.config {
            self.config = Some(config);
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 行程內的工作登錄表
///
/// 登錄表本身一把讀寫鎖，每個工作各自一把互斥鎖；同一工作的所有變更都會序列化。
#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: RwLock<HashMap<String, Arc<Mutex<Job>>>>,
}

fn lock(job: &Mutex<Job>) -> MutexGuard<'_, Job> {
    job.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> Option<Arc<Mutex<Job>>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// 建立新工作；相同 id 會直接覆蓋舊的
    pub fn create_job(&self, id: impl Into<String>, initial: JobUpdate) -> Job {
        let id = id.into();
        let mut job = Job::new(id.clone());
        job.merge(initial);
        job.created_at = job.updated_at;

        let snapshot = job.clone();
        let previous = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(Mutex::new(job)));
        if previous.is_some() {
            tracing::warn!("⚠️ Job {} already existed and was replaced", id);
        }
        tracing::debug!("📝 Created job {}", id);
        snapshot
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.slot(id).map(|job| lock(&job).clone())
    }

    /// 工作不存在時不做任何事並回傳 `false`
    pub fn update_job(&self, id: &str, update: JobUpdate) -> bool {
        match self.slot(id) {
            Some(job) => {
                lock(&job).merge(update);
                true
            }
            None => false,
        }
    }

    pub fn add_log(
        &self,
        id: &str,
        level: LogLevel,
        message: impl Into<String>,
        meta: serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        let Some(job) = self.slot(id) else {
            return false;
        };
        let mut job = lock(&job);
        job.logs.push(JobLogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            meta,
        });
        job.touch();
        true
    }

    pub fn add_error(&self, id: &str, message: impl Into<String>, stack: Option<String>) -> bool {
        let Some(job) = self.slot(id) else {
            return false;
        };
        let mut job = lock(&job);
        job.errors.push(JobError {
            timestamp: Utc::now(),
            message: message.into(),
            stack,
            category: None,
            mapping: None,
            record_index: None,
        });
        job.touch();
        true
    }

    /// 在同一把鎖內套用快照的狀態、日誌與錯誤
    pub fn apply_snapshot(&self, id: &str, snapshot: &StatusSnapshot) -> bool {
        let Some(job) = self.slot(id) else {
            return false;
        };
        let mut job = lock(&job);

        job.merge(JobUpdate {
            status: Some(snapshot.state.into()),
            progress: Some(snapshot.progress),
            processed_records: Some(snapshot.processed_records),
            total_records: Some(snapshot.total_records),
            current_mapping: Some(snapshot.current_mapping.clone()),
            config: None,
        });

        job.logs.extend(snapshot.logs.iter().map(|entry| JobLogEntry {
            timestamp: entry.timestamp,
            level: entry.level,
            message: entry.message.clone(),
            meta: entry.meta.clone(),
        }));
        job.errors.extend(snapshot.errors.iter().map(|error| JobError {
            timestamp: error.timestamp,
            message: error.message.clone(),
            stack: error.detail.clone(),
            category: Some(error.category),
            mapping: error.mapping.clone(),
            record_index: error.record_index,
        }));
        true
    }

    /// 依建立時間排序
    pub fn get_all_jobs(&self) -> Vec<Job> {
        let slots: Vec<Arc<Mutex<Job>>> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut jobs: Vec<Job> = slots.iter().map(|job| lock(job).clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn delete_job(&self, id: &str) -> bool {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }
}

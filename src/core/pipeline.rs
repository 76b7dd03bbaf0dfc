use crate::config::MigrationConfig;
use crate::core::schema::schema_for_mapping;
use crate::core::transformer::transform_batch;
use crate::domain::model::{
    LogLevel, PipelineState, PipelineStatus, Record, SchemaMapping, StatusError, StatusSnapshot,
};
use crate::domain::ports::{Connector, ReadOptions, WriteFailure, WriteOptions};
use crate::utils::error::{ErrorCategory, EtlError, Result};
use crate::utils::validation::Validate;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::borrow::Cow;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 重試退避的上限
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// 一次遷移：依序處理每個 mapping，逐批 讀取 → 轉換 → 寫入
///
/// 只能執行一次；`start` 會取得所有權。
pub struct MigrationPipeline {
    source: Box<dyn Connector>,
    destination: Box<dyn Connector>,
    config: MigrationConfig,
    cancel: CancellationToken,
}

/// 執行中的遷移；快照透過容量 1 的 channel 傳出，消費端不讀就不會往下跑
pub struct MigrationRun {
    rx: mpsc::Receiver<StatusSnapshot>,
    handle: JoinHandle<Result<PipelineStatus>>,
}

impl MigrationRun {
    /// 下一個快照；`None` 表示已不會再有快照
    pub async fn next(&mut self) -> Option<StatusSnapshot> {
        self.rx.recv().await
    }

    /// 等待執行結束；致命錯誤以 `Err` 回傳，與最後一個快照無關
    pub async fn finish(self) -> Result<PipelineStatus> {
        drop(self.rx);
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(EtlError::ProcessingError {
                message: format!("Migration task aborted: {}", e),
            }),
        }
    }
}

impl MigrationPipeline {
    /// 配置不合法時不會建立 pipeline，也不會有任何 I/O
    pub fn new(
        source: Box<dyn Connector>,
        destination: Box<dyn Connector>,
        config: MigrationConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            destination,
            config,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn start(self) -> MigrationRun {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(self.run(tx));
        MigrationRun { rx, handle }
    }

    async fn run(self, tx: mpsc::Sender<StatusSnapshot>) -> Result<PipelineStatus> {
        let mut status = PipelineStatus::new();
        // 連線器 panic 也要走到下面的失敗快照與 close
        let outcome = match AssertUnwindSafe(self.execute(&mut status, &tx))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Err(EtlError::ProcessingError {
                message: format!("Migration task panicked: {}", panic_message(panic.as_ref())),
            }),
        };

        match &outcome {
            Ok(()) => {
                status.state = PipelineState::Completed;
                status.progress = 100.0;
                status.log(
                    LogLevel::Info,
                    format!(
                        "Migration completed: {} records processed, {} error(s)",
                        status.processed_records,
                        status.errors.len()
                    ),
                );
            }
            Err(e) => {
                status.state = PipelineState::Failed;
                status.push_error(StatusError {
                    timestamp: Utc::now(),
                    category: e.category(),
                    message: e.to_string(),
                    mapping: status.current_mapping.clone(),
                    record_index: None,
                    detail: e.source_chain(),
                });
                let message = match e {
                    EtlError::Cancelled => "Migration cancelled".to_string(),
                    other => format!("Migration failed: {}", other),
                };
                status.log(LogLevel::Error, message);
            }
        }

        emit(&tx, status.snapshot()).await;
        self.close_connectors().await;

        outcome.map(|_| status)
    }

    async fn execute(
        &self,
        status: &mut PipelineStatus,
        tx: &mpsc::Sender<StatusSnapshot>,
    ) -> Result<()> {
        status.state = PipelineState::Running;
        status.log(
            LogLevel::Info,
            format!(
                "Starting migration of {} mapping(s): {} -> {}",
                self.config.mappings.len(),
                self.source.name(),
                self.destination.name()
            ),
        );
        if self.config.settings.dry_run {
            status.log(LogLevel::Info, "Dry run: destination writes are disabled");
        }

        status.total_records = self.estimate_total(status).await;
        status.recompute_progress();
        emit(tx, status.snapshot()).await;

        for mapping in &self.config.mappings {
            self.migrate_mapping(mapping, status, tx).await?;
        }

        Ok(())
    }

    /// 所有 mapping 的筆數都已知時才有總數
    async fn estimate_total(&self, status: &mut PipelineStatus) -> Option<u64> {
        let limit = self.config.settings.limit.map(|l| l as u64);
        let mut total: u64 = 0;

        for mapping in &self.config.mappings {
            match self.source.count(&mapping.source_collection).await {
                Ok(Some(count)) => {
                    total = total.saturating_add(limit.map_or(count, |l| count.min(l)));
                }
                Ok(None) => return None,
                Err(e) => {
                    status.log(
                        LogLevel::Warn,
                        format!(
                            "Could not count records in {}: {}",
                            mapping.source_collection, e
                        ),
                    );
                    return None;
                }
            }
        }

        Some(total)
    }

    async fn migrate_mapping(
        &self,
        mapping: &SchemaMapping,
        status: &mut PipelineStatus,
        tx: &mpsc::Sender<StatusSnapshot>,
    ) -> Result<()> {
        let settings = &self.config.settings;
        let label = MigrationConfig::mapping_label(mapping);

        status.current_mapping = Some(label.clone());
        status.log(LogLevel::Info, format!("Starting migration: {}", label));

        if settings.create_table {
            self.create_target_table(mapping, status).await?;
        }

        let read_options = ReadOptions::new(settings.batch_size).with_limit(settings.limit);
        let write_options = WriteOptions {
            upsert: settings.upsert,
            conflict_columns: mapping.options.conflict_columns.clone(),
        };

        let mut reader = self
            .source
            .read_batch(&mapping.source_collection, read_options);
        let mut read_so_far: usize = 0;
        let mut migrated: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EtlError::Cancelled),
                batch = reader.next_batch() => batch?,
            };

            let records = match next {
                Some(records) if !records.is_empty() => records,
                _ => break,
            };

            let (transformed, warnings) = transform_batch(&records, mapping);
            for (warning, count) in warnings {
                let mut meta = serde_json::Map::new();
                meta.insert("mapping".to_string(), label.clone().into());
                meta.insert("records".to_string(), count.into());
                status.log_with_meta(LogLevel::Warn, warning, meta);
            }

            let written = if settings.dry_run {
                transformed.len() as u64
            } else {
                self.write_with_retry(mapping, &label, &transformed, read_so_far, &write_options, status)
                    .await? as u64
            };

            read_so_far += records.len();
            migrated += written;
            status.add_processed(written);
            emit(tx, status.snapshot()).await;
        }

        status.log(
            LogLevel::Info,
            format!("Completed migration: {} ({} records)", label, migrated),
        );
        emit(tx, status.snapshot()).await;

        Ok(())
    }

    async fn create_target_table(
        &self,
        mapping: &SchemaMapping,
        status: &mut PipelineStatus,
    ) -> Result<()> {
        if self.config.settings.dry_run {
            status.log(
                LogLevel::Info,
                format!("Dry run: skipping table creation for {}", mapping.target_table),
            );
            return Ok(());
        }

        if !self.destination.supports_create_table() {
            status.log(
                LogLevel::Warn,
                format!(
                    "Destination {} does not support table creation; skipping {}",
                    self.destination.name(),
                    mapping.target_table
                ),
            );
            return Ok(());
        }

        let schema = schema_for_mapping(mapping);
        let result = self
            .destination
            .create_table(&mapping.target_table, &schema)
            .await?;

        if !result.success {
            return Err(EtlError::WriteError {
                table: mapping.target_table.clone(),
                message: result.message,
            });
        }

        status.log(LogLevel::Info, result.message);
        Ok(())
    }

    /// 寫入一批，失敗的子集合以指數退避重試；只有最後一次的失敗會記入狀態
    ///
    /// 回傳成功寫入的筆數。`batch_start` 是本批第一筆在 mapping 中的位置。
    async fn write_with_retry(
        &self,
        mapping: &SchemaMapping,
        label: &str,
        records: &[Record],
        batch_start: usize,
        options: &WriteOptions,
        status: &mut PipelineStatus,
    ) -> Result<usize> {
        let settings = &self.config.settings;
        let mut pending: Vec<usize> = (0..records.len()).collect();
        let mut written: usize = 0;
        let mut attempt: u32 = 0;

        loop {
            let batch: Cow<'_, [Record]> = if pending.len() == records.len() {
                Cow::Borrowed(records)
            } else {
                Cow::Owned(pending.iter().map(|&i| records[i].clone()).collect())
            };

            let result = self
                .destination
                .write_batch(&mapping.target_table, &batch, options)
                .await;
            written += result.count.min(batch.len());

            if result.errors.is_empty() {
                if result.count < batch.len() {
                    status.push_error(StatusError {
                        timestamp: Utc::now(),
                        category: ErrorCategory::Write,
                        message: format!(
                            "{} record(s) were not written to {} and no reason was reported",
                            batch.len() - result.count,
                            mapping.target_table
                        ),
                        mapping: Some(label.to_string()),
                        record_index: None,
                        detail: None,
                    });
                }
                return Ok(written);
            }

            let retry = retry_subset(&pending, &result.errors, result.count);

            if attempt < settings.retries && !retry.is_empty() {
                attempt += 1;
                let delay = retry_delay(settings.retry_delay_ms, attempt);
                status.log(
                    LogLevel::Warn,
                    format!(
                        "Write attempt {} to {} failed for {} record(s); retrying in {}ms",
                        attempt,
                        mapping.target_table,
                        retry.len(),
                        delay.as_millis()
                    ),
                );

                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(EtlError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }

                pending = retry;
                continue;
            }

            for failure in &result.errors {
                status.push_error(StatusError {
                    timestamp: Utc::now(),
                    category: ErrorCategory::Write,
                    message: failure.message.clone(),
                    mapping: Some(label.to_string()),
                    record_index: failure
                        .index
                        .and_then(|i| pending.get(i))
                        .map(|&original| batch_start + original),
                    detail: (attempt > 0).then(|| format!("failed after {} retries", attempt)),
                });
            }
            return Ok(written);
        }
    }

    async fn close_connectors(&self) {
        for (side, connector) in [("source", &self.source), ("destination", &self.destination)] {
            if let Err(e) = connector.close().await {
                tracing::warn!("⚠️ Failed to close {} connector ({}): {}", side, connector.name(), e);
            }
        }
    }
}

/// 找出要重試的記錄（以原批次索引表示）
///
/// 沒有索引的失敗且 `count == 0` 代表整批原子失敗，整批重試；
/// 沒有索引但部分成功時無法判斷哪些失敗，不重試。
fn retry_subset(pending: &[usize], errors: &[WriteFailure], count: usize) -> Vec<usize> {
    if errors.iter().any(|f| f.index.is_none()) {
        return if count == 0 { pending.to_vec() } else { Vec::new() };
    }

    let mut retry: Vec<usize> = errors
        .iter()
        .filter_map(|f| f.index)
        .filter_map(|i| pending.get(i).copied())
        .collect();
    retry.sort_unstable();
    retry.dedup();
    retry
}

fn retry_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// 觀察端已離開時直接丟棄快照
async fn emit(tx: &mpsc::Sender<StatusSnapshot>, snapshot: StatusSnapshot) {
    let _ = tx.send(snapshot).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryConnector;
    use crate::config::{ConnectionConfig, JsonlSettings, MigrationSettings};
    use crate::domain::model::{CollectionInfo, TableSchema};
    use crate::domain::ports::{
        BatchReader, BatchStream, ConnectionTestResult, CreateTableResult, WriteResult,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Script = fn(&[Record]) -> WriteResult;

    /// 依腳本回應寫入的目的地；腳本用完後全部成功
    #[derive(Clone, Default)]
    struct ScriptedDestination {
        script: Arc<Mutex<VecDeque<Script>>>,
        calls: Arc<Mutex<Vec<Vec<Record>>>>,
        panic_on_write: bool,
        create_table_failure: Option<&'static str>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedDestination {
        fn with_script(script: Vec<Script>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                ..Default::default()
            }
        }

        fn forbidding_writes() -> Self {
            Self {
                panic_on_write: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedDestination {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn test_connection(&self) -> ConnectionTestResult {
            ConnectionTestResult::ok("ok")
        }

        async fn discover(&self) -> Result<Vec<CollectionInfo>> {
            Ok(vec![])
        }

        async fn get_schema(&self, _name: &str) -> Result<TableSchema> {
            Ok(TableSchema::default())
        }

        fn read_batch<'a>(&'a self, _name: &str, _options: ReadOptions) -> BatchStream<'a> {
            Box::new(EmptyReader)
        }

        async fn write_batch(
            &self,
            _name: &str,
            records: &[Record],
            _options: &WriteOptions,
        ) -> WriteResult {
            if self.panic_on_write {
                panic!("write_batch must not be called");
            }
            self.calls.lock().await.push(records.to_vec());
            match self.script.lock().await.pop_front() {
                Some(step) => step(records),
                None => WriteResult::from_parts(records.len(), vec![]),
            }
        }

        fn supports_create_table(&self) -> bool {
            self.create_table_failure.is_some()
        }

        async fn create_table(&self, _name: &str, _schema: &TableSchema) -> Result<CreateTableResult> {
            Ok(CreateTableResult {
                success: false,
                message: self.create_table_failure.unwrap_or_default().to_string(),
            })
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct EmptyReader;

    #[async_trait]
    impl BatchReader for EmptyReader {
        async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
            Ok(None)
        }
    }

    /// 第一批正常，第二批讀取失敗；或永遠不回應
    #[derive(Clone, Default)]
    struct TroubledSource {
        hang: bool,
        closed: Arc<AtomicBool>,
    }

    struct TroubledReader {
        hang: bool,
        calls: usize,
    }

    #[async_trait]
    impl BatchReader for TroubledReader {
        async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.calls += 1;
            if self.calls == 1 {
                Ok(Some(vec![Record::from_value(json!({"_id": "a", "name": "Ann"})).unwrap()]))
            } else {
                Err(EtlError::ReadError {
                    collection: "users".to_string(),
                    message: "connection reset".to_string(),
                })
            }
        }
    }

    #[async_trait]
    impl Connector for TroubledSource {
        fn name(&self) -> &str {
            "troubled"
        }

        async fn test_connection(&self) -> ConnectionTestResult {
            ConnectionTestResult::ok("ok")
        }

        async fn discover(&self) -> Result<Vec<CollectionInfo>> {
            Ok(vec![])
        }

        async fn get_schema(&self, _name: &str) -> Result<TableSchema> {
            Ok(TableSchema::default())
        }

        fn read_batch<'a>(&'a self, _name: &str, _options: ReadOptions) -> BatchStream<'a> {
            Box::new(TroubledReader {
                hang: self.hang,
                calls: 0,
            })
        }

        async fn write_batch(
            &self,
            _name: &str,
            records: &[Record],
            _options: &WriteOptions,
        ) -> WriteResult {
            WriteResult::from_parts(records.len(), vec![])
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(settings: MigrationSettings) -> MigrationConfig {
        let dir = ConnectionConfig::Jsonl(JsonlSettings {
            directory: "./unused".into(),
            id_field: "_id".to_string(),
        });
        MigrationConfig {
            source: dir.clone(),
            destination: dir,
            mappings: vec![serde_json::from_value(json!({
                "sourceCollection": "users",
                "targetTable": "people",
                "fieldMappings": [
                    {"sourceField": "_id", "targetField": "id", "sourceType": "string", "targetType": "string"},
                    {"sourceField": "name", "targetField": "full_name", "sourceType": "string", "targetType": "string"}
                ]
            }))
            .unwrap()],
            settings,
        }
    }

    fn users(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::from_value(json!({"_id": format!("u{}", i), "name": format!("User {}", i)})).unwrap())
            .collect()
    }

    async fn drain(mut run: MigrationRun) -> (Vec<StatusSnapshot>, Result<PipelineStatus>) {
        let mut snapshots = Vec::new();
        while let Some(snapshot) = run.next().await {
            snapshots.push(snapshot);
        }
        (snapshots, run.finish().await)
    }

    #[tokio::test]
    async fn test_full_run_moves_every_record() {
        let source = MemoryConnector::new().with_collection("users", users(5));
        let destination = MemoryConnector::new();
        let settings = MigrationSettings {
            batch_size: 2,
            ..Default::default()
        };

        let pipeline = MigrationPipeline::new(
            Box::new(source.clone()),
            Box::new(destination.clone()),
            config(settings),
        )
        .unwrap();
        let (snapshots, result) = drain(pipeline.start()).await;

        let status = result.unwrap();
        assert_eq!(status.state, PipelineState::Completed);
        assert_eq!(status.processed_records, 5);
        assert_eq!(status.total_records, Some(5));
        assert!(status.errors.is_empty());

        let people = destination.collection("people");
        assert_eq!(people.len(), 5);
        assert_eq!(people[0].get("full_name"), Some(&json!("User 0")));
        assert!(people[0].get("name").is_none());

        let last = snapshots.last().unwrap();
        assert_eq!(last.state, PipelineState::Completed);
        assert_eq!(last.progress, 100.0);

        let mut previous = 0;
        let mut previous_version = 0;
        for snapshot in &snapshots {
            assert!(snapshot.processed_records >= previous);
            assert!(snapshot.version > previous_version);
            assert!((0.0..=100.0).contains(&snapshot.progress));
            previous = snapshot.processed_records;
            previous_version = snapshot.version;
        }

        let total_logs: usize = snapshots.iter().map(|s| s.logs.len()).sum();
        assert_eq!(total_logs, status.logs.len());

        assert!(source.is_closed());
        assert!(destination.is_closed());
    }

    #[tokio::test]
    async fn test_dry_run_never_writes_and_counts_the_same() {
        let settings = MigrationSettings {
            batch_size: 3,
            dry_run: true,
            create_table: true,
            ..Default::default()
        };
        let source = MemoryConnector::new().with_collection("users", users(7));
        let pipeline = MigrationPipeline::new(
            Box::new(source),
            Box::new(ScriptedDestination::forbidding_writes()),
            config(settings),
        )
        .unwrap();
        let (_, dry) = drain(pipeline.start()).await;

        let source = MemoryConnector::new().with_collection("users", users(7));
        let pipeline = MigrationPipeline::new(
            Box::new(source),
            Box::new(MemoryConnector::new()),
            config(MigrationSettings {
                batch_size: 3,
                ..Default::default()
            }),
        )
        .unwrap();
        let (_, wet) = drain(pipeline.start()).await;

        assert_eq!(dry.unwrap().processed_records, 7);
        assert_eq!(wet.unwrap().processed_records, 7);
    }

    #[tokio::test]
    async fn test_failed_writes_are_collected_without_aborting() {
        let destination = ScriptedDestination::with_script(vec![|records| {
            WriteResult::from_parts(
                0,
                (0..records.len())
                    .map(|i| WriteFailure::record(i, format!("duplicate key {}", i)))
                    .collect(),
            )
        }]);
        let settings = MigrationSettings {
            retries: 0,
            ..Default::default()
        };
        let source = MemoryConnector::new().with_collection("users", users(2));

        let pipeline =
            MigrationPipeline::new(Box::new(source), Box::new(destination), config(settings)).unwrap();
        let status = drain(pipeline.start()).await.1.unwrap();

        assert_eq!(status.state, PipelineState::Completed);
        assert_eq!(status.errors.len(), 2);
        assert_eq!(status.processed_records, 0);
        assert_eq!(status.errors[1].record_index, Some(1));
        assert_eq!(status.errors[1].category, ErrorCategory::Write);
    }

    #[tokio::test]
    async fn test_only_failed_subset_is_retried() {
        let destination = ScriptedDestination::with_script(vec![|records| {
            assert_eq!(records.len(), 3);
            WriteResult::from_parts(2, vec![WriteFailure::record(1, "deadlock detected")])
        }]);
        let settings = MigrationSettings {
            retries: 2,
            retry_delay_ms: 1,
            ..Default::default()
        };
        let source = MemoryConnector::new().with_collection("users", users(3));

        let pipeline = MigrationPipeline::new(
            Box::new(source),
            Box::new(destination.clone()),
            config(settings),
        )
        .unwrap();
        let status = drain(pipeline.start()).await.1.unwrap();

        assert_eq!(status.processed_records, 3);
        assert!(status.errors.is_empty());
        assert!(status.logs.iter().any(|l| l.level == LogLevel::Warn && l.message.contains("retrying")));

        let calls = destination.calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].len(), 1);
        assert_eq!(calls[1][0].get("id"), Some(&json!("u1")));
    }

    #[tokio::test]
    async fn test_atomic_batch_failure_retries_whole_batch_then_gives_up() {
        let fail: Script = |_| WriteResult::batch_failed("transaction aborted");
        let destination = ScriptedDestination::with_script(vec![fail, fail]);
        let settings = MigrationSettings {
            retries: 1,
            retry_delay_ms: 1,
            ..Default::default()
        };
        let source = MemoryConnector::new().with_collection("users", users(2));

        let pipeline = MigrationPipeline::new(
            Box::new(source),
            Box::new(destination.clone()),
            config(settings),
        )
        .unwrap();
        let status = drain(pipeline.start()).await.1.unwrap();

        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].record_index, None);
        assert_eq!(destination.calls.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_source_completes_with_zero_records() {
        let source = MemoryConnector::new().with_collection("users", vec![]);
        let pipeline = MigrationPipeline::new(
            Box::new(source),
            Box::new(MemoryConnector::new()),
            config(MigrationSettings::default()),
        )
        .unwrap();

        let status = drain(pipeline.start()).await.1.unwrap();
        assert_eq!(status.state, PipelineState::Completed);
        assert_eq!(status.processed_records, 0);
        assert!(status.errors.is_empty());
        assert!(status
            .logs
            .iter()
            .any(|l| l.message == "Completed migration: users -> people (0 records)"));
    }

    #[tokio::test]
    async fn test_read_failure_is_fatal_and_closes_connectors() {
        let source = TroubledSource::default();
        let destination = ScriptedDestination::default();
        let pipeline = MigrationPipeline::new(
            Box::new(source.clone()),
            Box::new(destination.clone()),
            config(MigrationSettings::default()),
        )
        .unwrap();

        let (snapshots, result) = drain(pipeline.start()).await;
        assert!(matches!(result, Err(EtlError::ReadError { .. })));

        let last = snapshots.last().unwrap();
        assert_eq!(last.state, PipelineState::Failed);
        assert_eq!(last.processed_records, 1);
        assert!(last.errors.iter().any(|e| e.message.contains("connection reset")));
        assert!(last.logs.iter().any(|l| l.message.starts_with("Migration failed:")));

        assert!(source.closed.load(Ordering::SeqCst));
        assert!(destination.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_pending_read() {
        let source = TroubledSource {
            hang: true,
            ..Default::default()
        };
        let token = CancellationToken::new();
        let pipeline = MigrationPipeline::new(
            Box::new(source.clone()),
            Box::new(ScriptedDestination::default()),
            config(MigrationSettings::default()),
        )
        .unwrap()
        .with_cancellation(token.clone());

        let run = pipeline.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let (snapshots, result) = drain(run).await;
        assert!(matches!(result, Err(EtlError::Cancelled)));
        assert_eq!(snapshots.last().unwrap().state, PipelineState::Failed);
        assert!(source.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_create_table_unsupported_warns_and_continues() {
        let destination = ScriptedDestination::default();
        let settings = MigrationSettings {
            create_table: true,
            ..Default::default()
        };
        let source = MemoryConnector::new().with_collection("users", users(2));

        let pipeline = MigrationPipeline::new(
            Box::new(source),
            Box::new(destination.clone()),
            config(settings),
        )
        .unwrap();
        let status = drain(pipeline.start()).await.1.unwrap();

        assert_eq!(status.state, PipelineState::Completed);
        assert_eq!(status.processed_records, 2);
        assert!(status.logs.iter().any(|l| l.level == LogLevel::Warn
            && l.message == "Destination scripted does not support table creation; skipping people"));
        assert_eq!(destination.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_create_table_is_fatal() {
        let destination = ScriptedDestination {
            create_table_failure: Some("permission denied for schema public"),
            ..Default::default()
        };
        let settings = MigrationSettings {
            create_table: true,
            ..Default::default()
        };
        let source = MemoryConnector::new().with_collection("users", users(2));

        let pipeline = MigrationPipeline::new(
            Box::new(source.clone()),
            Box::new(destination.clone()),
            config(settings),
        )
        .unwrap();
        let (snapshots, result) = drain(pipeline.start()).await;

        match result {
            Err(EtlError::WriteError { table, message }) => {
                assert_eq!(table, "people");
                assert_eq!(message, "permission denied for schema public");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(snapshots.last().unwrap().state, PipelineState::Failed);
        assert!(destination.calls.lock().await.is_empty());
        assert!(source.is_closed());
        assert!(destination.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_connector_panic_still_closes_connectors() {
        let source = MemoryConnector::new().with_collection("users", users(2));
        let destination = ScriptedDestination::forbidding_writes();

        let pipeline = MigrationPipeline::new(
            Box::new(source.clone()),
            Box::new(destination.clone()),
            config(MigrationSettings::default()),
        )
        .unwrap();
        let (snapshots, result) = drain(pipeline.start()).await;

        match result {
            Err(EtlError::ProcessingError { message }) => {
                assert!(message.contains("panicked"));
                assert!(message.contains("write_batch must not be called"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        let last = snapshots.last().unwrap();
        assert_eq!(last.state, PipelineState::Failed);
        assert!(last.logs.iter().any(|l| l.message.starts_with("Migration failed:")));
        assert!(source.is_closed());
        assert!(destination.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_io() {
        let mut bad = config(MigrationSettings::default());
        bad.mappings.clear();
        let result = MigrationPipeline::new(
            Box::new(ScriptedDestination::forbidding_writes()),
            Box::new(ScriptedDestination::forbidding_writes()),
            bad,
        );
        assert!(matches!(result, Err(EtlError::InvalidConfiguration { .. })));
    }

    #[tokio::test]
    async fn test_progress_stays_zero_when_total_unknown() {
        let source = TroubledSource::default();
        let pipeline = MigrationPipeline::new(
            Box::new(source),
            Box::new(ScriptedDestination::default()),
            config(MigrationSettings::default()),
        )
        .unwrap();

        let (snapshots, _) = drain(pipeline.start()).await;
        let running: Vec<&StatusSnapshot> = snapshots
            .iter()
            .filter(|s| s.state == PipelineState::Running)
            .collect();
        assert!(!running.is_empty());
        assert!(running.iter().all(|s| s.progress == 0.0 && s.total_records.is_none()));
    }

    #[test]
    fn test_retry_subset() {
        let pending = vec![0, 2, 5];
        let errors = vec![WriteFailure::record(2, "x"), WriteFailure::record(0, "y")];
        assert_eq!(retry_subset(&pending, &errors, 1), vec![0, 5]);
        assert_eq!(retry_subset(&pending, &[WriteFailure::batch("down")], 0), pending);
        assert!(retry_subset(&pending, &[WriteFailure::batch("down")], 2).is_empty());
    }

    #[test]
    fn test_retry_delay_backs_off() {
        assert_eq!(retry_delay(100, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(100, 3), Duration::from_millis(400));
        assert_eq!(retry_delay(u64::MAX, 5), MAX_RETRY_DELAY);
    }
}

use anyhow::Result;
use db_migrate::adapters::csv_table::CsvConnector;
use db_migrate::adapters::memory::MemoryConnector;
use db_migrate::config::CsvSettings;
use db_migrate::{
    connector_from_value, start_migration, Connector, EtlError, JobStatus, JobTracker,
    MigrationConfig, MigrationPipeline, PipelineState, ReadOptions, Record,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const USERS: &str = r#"{"_id":"u1","name":"  Ann ","profile":{"age":"30","city":"Taipei"},"active":"yes"}
{"_id":"u2","name":"Bob","profile":{"age":"41"},"active":"no"}
{"_id":"u3","name":"Cy","profile":{"age":"n/a","city":"Tainan"},"active":"on"}
"#;

fn normalized(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn jsonl_to_csv_config(source: &Path, destination: &Path, dry_run: bool) -> String {
    format!(
        r#"
[source]
type = "jsonl"
directory = "{}"

[destination]
type = "csv"
directory = "{}"

[settings]
batchSize = 2
createTable = true
dryRun = {}

[[mappings]]
sourceCollection = "users"
targetTable = "people"

[mappings.options]
flatten = true

[[mappings.fieldMappings]]
sourceField = "_id"
targetField = "id"
sourceType = "string"
targetType = "string"

[[mappings.fieldMappings]]
sourceField = "name"
targetField = "name"
sourceType = "string"
targetType = "string"
transform = "trim"

[[mappings.fieldMappings]]
sourceField = "profile.age"
targetField = "profile.age"
sourceType = "string"
targetType = "integer"

[[mappings.fieldMappings]]
sourceField = "profile.city"
targetField = "profile.city"
sourceType = "string"
targetType = "string"
defaultValue = "unknown"

[[mappings.fieldMappings]]
sourceField = "active"
targetField = "active"
sourceType = "string"
targetType = "boolean"
"#,
        normalized(source),
        normalized(destination),
        dry_run
    )
}

async fn read_csv_table(directory: &Path, table: &str) -> Result<Vec<Value>> {
    let connector = CsvConnector::new(&CsvSettings {
        directory: directory.to_path_buf(),
        delimiter: ",".to_string(),
    })?;
    let mut reader = connector.read_batch(table, ReadOptions::new(100));
    let mut rows = Vec::new();
    while let Some(batch) = reader.next_batch().await? {
        rows.extend(batch.into_iter().map(Record::into_value));
    }
    Ok(rows)
}

/// 測試 JSONL → CSV 完整流程：建表、巢狀欄位攤平、型別轉換與預設值
#[tokio::test]
async fn test_jsonl_to_csv_end_to_end() -> Result<()> {
    let source = TempDir::new()?;
    let destination = TempDir::new()?;
    tokio::fs::write(source.path().join("users.jsonl"), USERS).await?;

    let config_path = source.path().join("migration.toml");
    tokio::fs::write(
        &config_path,
        jsonl_to_csv_config(source.path(), destination.path(), false),
    )
    .await?;
    let config = MigrationConfig::from_file(&config_path)?;

    let tracker = Arc::new(JobTracker::new());
    let started = start_migration(tracker.clone(), config);
    let status = started.task.await??;

    println!("📊 Processed {} records", status.processed_records);
    assert_eq!(status.processed_records, 3);
    assert!(status.errors.is_empty());

    let job = tracker.get_job(&started.job_id).expect("job registered");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100.0);
    assert_eq!(job.processed_records, 3);
    assert!(job
        .logs
        .iter()
        .any(|l| l.message.contains("Type conversion failed for 'profile.age'")));
    assert!(job
        .logs
        .iter()
        .any(|l| l.message.contains("Migration completed: 3 records processed")));

    let header = tokio::fs::read_to_string(destination.path().join("people.csv")).await?;
    assert!(header.starts_with("id,name,profile_age,profile_city,active"));

    let rows = read_csv_table(destination.path(), "people").await?;
    assert_eq!(
        rows,
        vec![
            json!({"id": "u1", "name": "Ann", "profile_age": 30, "profile_city": "Taipei", "active": true}),
            json!({"id": "u2", "name": "Bob", "profile_age": 41, "profile_city": "unknown", "active": false}),
            json!({"id": "u3", "name": "Cy", "profile_age": "n/a", "profile_city": "Tainan", "active": true}),
        ]
    );

    println!("✅ JSONL → CSV migration verified");
    Ok(())
}

/// 測試 dry run：只計數不寫入，也不建表
#[tokio::test]
async fn test_dry_run_writes_nothing() -> Result<()> {
    let source = TempDir::new()?;
    let destination = TempDir::new()?;
    tokio::fs::write(source.path().join("users.jsonl"), USERS).await?;

    let config = MigrationConfig::from_toml_str(&jsonl_to_csv_config(
        source.path(),
        destination.path(),
        true,
    ))?;

    let tracker = Arc::new(JobTracker::new());
    let started = start_migration(tracker.clone(), config);
    let status = started.task.await??;

    assert_eq!(status.processed_records, 3);
    assert!(!destination.path().join("people.csv").exists());

    let job = tracker.get_job(&started.job_id).expect("job registered");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.logs.iter().any(|l| l.message.contains("Dry run")));
    Ok(())
}

/// 測試未知的資料庫類型在任何 I/O 之前就失敗
#[tokio::test]
async fn test_unknown_database_type_is_rejected() -> Result<()> {
    let toml = r#"
[source]
type = "jsonl"
directory = "/data/in"

[destination]
type = "oracle"
host = "db"

[[mappings]]
sourceCollection = "users"
targetTable = "users"

[[mappings.fieldMappings]]
sourceField = "_id"
targetField = "id"
sourceType = "string"
targetType = "string"
"#;

    match MigrationConfig::from_toml_str(toml) {
        Err(EtlError::UnsupportedDatabase { db_type }) => assert_eq!(db_type, "oracle"),
        other => panic!("expected UnsupportedDatabase, got {:?}", other),
    }

    let err = connector_from_value(&json!({"type": "oracle"})).err();
    assert_eq!(
        err.map(|e| e.to_string()),
        Some("Unsupported database type: oracle".to_string())
    );
    Ok(())
}

/// 測試 JSONL 目的地的重複 id：一般寫入逐筆報錯，upsert 則合併
#[tokio::test]
async fn test_jsonl_rerun_reports_duplicates_unless_upsert() -> Result<()> {
    let source = TempDir::new()?;
    let destination = TempDir::new()?;
    tokio::fs::write(source.path().join("users.jsonl"), USERS).await?;

    let config_for = |upsert: bool| -> Result<MigrationConfig> {
        Ok(MigrationConfig::from_value(json!({
            "source": {"type": "jsonl", "directory": source.path()},
            "destination": {"type": "jsonl", "directory": destination.path()},
            "settings": {"batchSize": 10, "upsert": upsert, "retries": 1, "retryDelayMs": 1},
            "mappings": [{
                "sourceCollection": "users",
                "targetTable": "members",
                "fieldMappings": [
                    {"sourceField": "_id", "targetField": "_id", "sourceType": "string", "targetType": "string"},
                    {"sourceField": "name", "targetField": "displayName", "sourceType": "string", "targetType": "string", "transform": "toUpperCase"}
                ]
            }]
        }))?)
    };

    let tracker = Arc::new(JobTracker::new());

    let first = start_migration(tracker.clone(), config_for(false)?);
    let status = first.task.await??;
    assert_eq!(status.processed_records, 3);

    let second = start_migration(tracker.clone(), config_for(false)?);
    let status = second.task.await??;
    assert_eq!(status.processed_records, 0);
    assert_eq!(status.errors.len(), 3);
    assert!(status.errors[0].message.contains("already exists"));
    assert_eq!(status.errors[1].record_index, Some(1));

    let job = tracker.get_job(&second.job_id).expect("job registered");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.errors.len(), 3);

    let third = start_migration(tracker.clone(), config_for(true)?);
    let status = third.task.await??;
    assert_eq!(status.processed_records, 3);
    assert!(status.errors.is_empty());

    let content = tokio::fs::read_to_string(destination.path().join("members.jsonl")).await?;
    let documents: Vec<Value> = content
        .lines()
        .map(serde_json::from_str)
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(documents.len(), 3);
    assert_eq!(documents[0], json!({"_id": "u1", "displayName": "  ANN "}));

    assert_eq!(tracker.get_all_jobs().len(), 3);
    Ok(())
}

/// 測試快照中的進度與處理筆數只增不減，結束後兩端連線器都已關閉
#[tokio::test]
async fn test_progress_is_monotonic() -> Result<()> {
    let records: Vec<Record> = (0..23)
        .map(|i| Record::from_value(json!({"n": i, "label": format!("item-{}", i)})).expect("object"))
        .collect();
    let source = MemoryConnector::new().with_collection("items", records);
    let destination = MemoryConnector::new();

    let config = MigrationConfig::from_value(json!({
        "source": {"type": "jsonl", "directory": "/unused"},
        "destination": {"type": "jsonl", "directory": "/unused"},
        "settings": {"batchSize": 5},
        "mappings": [{
            "sourceCollection": "items",
            "targetTable": "copies",
            "fieldMappings": [
                {"sourceField": "n", "targetField": "number", "sourceType": "integer", "targetType": "string"}
            ]
        }]
    }))?;

    let pipeline = MigrationPipeline::new(
        Box::new(source.clone()),
        Box::new(destination.clone()),
        config,
    )?;
    let mut run = pipeline.start();

    let mut snapshots = Vec::new();
    while let Some(snapshot) = run.next().await {
        snapshots.push(snapshot);
    }
    let status = run.finish().await?;

    for pair in snapshots.windows(2) {
        assert!(pair[1].version > pair[0].version);
        assert!(pair[1].processed_records >= pair[0].processed_records);
        assert!(pair[1].progress >= pair[0].progress);
    }
    let last = snapshots.last().expect("terminal snapshot");
    assert_eq!(last.state, PipelineState::Completed);
    assert_eq!(last.progress, 100.0);
    assert_eq!(status.processed_records, 23);

    let copies = destination.collection("copies");
    assert_eq!(copies.len(), 23);
    assert_eq!(copies[22].get("number"), Some(&json!("22")));
    assert!(source.is_closed());
    assert!(destination.is_closed());
    Ok(())
}

/// 測試未事先建表的 CSV 目的地：後面批次出現的新欄位會擴充表頭
#[tokio::test]
async fn test_csv_destination_accepts_columns_from_later_batches() -> Result<()> {
    let destination_dir = TempDir::new()?;
    let records: Vec<Record> = [
        json!({"_id": "a", "name": "Ann"}),
        json!({"_id": "b", "name": "Bob"}),
        json!({"_id": "c", "name": "Cy", "city": "Tainan"}),
    ]
    .into_iter()
    .map(|v| Record::from_value(v).expect("object"))
    .collect();
    let source = MemoryConnector::new().with_collection("users", records);
    let destination = CsvConnector::new(&CsvSettings {
        directory: destination_dir.path().to_path_buf(),
        delimiter: ",".to_string(),
    })?;

    let config = MigrationConfig::from_value(json!({
        "source": {"type": "jsonl", "directory": "/unused"},
        "destination": {"type": "csv", "directory": destination_dir.path()},
        "settings": {"batchSize": 2},
        "mappings": [{
            "sourceCollection": "users",
            "targetTable": "people",
            "fieldMappings": [
                {"sourceField": "_id", "targetField": "id", "sourceType": "string", "targetType": "string"},
                {"sourceField": "name", "targetField": "name", "sourceType": "string", "targetType": "string"},
                {"sourceField": "city", "targetField": "city", "sourceType": "string", "targetType": "string"}
            ]
        }]
    }))?;

    let pipeline = MigrationPipeline::new(Box::new(source), Box::new(destination), config)?;
    let status = pipeline.start().finish().await?;

    println!("📊 Processed {} records", status.processed_records);
    assert_eq!(status.processed_records, 3);
    assert!(status.errors.is_empty());

    let rows = read_csv_table(destination_dir.path(), "people").await?;
    assert_eq!(
        rows,
        vec![
            json!({"id": "a", "name": "Ann", "city": null}),
            json!({"id": "b", "name": "Bob", "city": null}),
            json!({"id": "c", "name": "Cy", "city": "Tainan"}),
        ]
    );
    Ok(())
}

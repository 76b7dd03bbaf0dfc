use crate::adapters::collection_file;
use crate::config::JsonlSettings;
use crate::core::schema::{infer_document_schema, SCHEMA_SAMPLE_SIZE};
use crate::domain::model::{CollectionInfo, Record, TableSchema};
use crate::domain::ports::{
    BatchBudget, BatchReader, BatchStream, ConnectionTestResult, Connector, ReadOptions,
    WriteFailure, WriteOptions, WriteResult,
};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;

const EXTENSION: &str = "jsonl";

/// 文件型儲存：目錄中每個 `<collection>.jsonl` 是一個集合，每行一份 JSON 物件
pub struct JsonlConnector {
    directory: PathBuf,
    id_field: String,
    /// 寫入鎖；內容為各集合已載入的 id 索引
    indexes: Mutex<HashMap<String, IdIndex>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// 集合檔案的 id → 行位置（不含空行），第一次寫入時載入一次
#[derive(Debug, Default)]
struct IdIndex {
    positions: HashMap<String, usize>,
    len: usize,
}

impl JsonlConnector {
    pub fn new(settings: &JsonlSettings) -> Self {
        Self {
            directory: settings.directory.clone(),
            id_field: settings.id_field.clone(),
            indexes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EtlError::ConnectorClosed {
                connector: EXTENSION.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn path_for(&self, name: &str) -> std::result::Result<PathBuf, String> {
        collection_file(&self.directory, name, EXTENSION)
    }

    fn generate_id(&self) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("{:x}{:04x}", nanos, seq & 0xffff)
    }

    /// 整個檔案讀入；檔案不存在視為空集合
    async fn load_documents(path: &Path) -> Result<Vec<Map<String, Value>>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| parse_document(line, i + 1))
            .collect()
    }

    /// 讀取前 `n` 份文件
    async fn sample(path: &Path, n: usize) -> Result<Vec<Record>> {
        let mut lines = match open_lines(path).await? {
            Some(lines) => lines,
            None => return Ok(Vec::new()),
        };

        let mut records = Vec::new();
        let mut line_no = 0;
        while records.len() < n {
            let Some(line) = lines.next_line().await? else {
                break;
            };
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            records.push(Record {
                data: parse_document(&line, line_no)?.into_iter().collect(),
            });
        }
        Ok(records)
    }

    async fn count_documents(path: &Path) -> Result<u64> {
        let mut lines = match open_lines(path).await? {
            Some(lines) => lines,
            None => return Ok(0),
        };
        let mut count = 0;
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn load_index(&self, path: &Path) -> Result<IdIndex> {
        let mut index = IdIndex::default();
        let Some(mut lines) = open_lines(path).await? else {
            return Ok(index);
        };

        let mut line_no = 0;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let document = parse_document(&line, line_no)?;
            if let Some(id) = self.document_id(&document) {
                index.positions.insert(id, index.len);
            }
            index.len += 1;
        }
        Ok(index)
    }

    /// 只有 upsert 改到既有文件時才整檔重寫
    async fn rewrite_with_updates(
        &self,
        path: &Path,
        mut updates: HashMap<usize, Map<String, Value>>,
        appended: Vec<Map<String, Value>>,
    ) -> Result<()> {
        let mut documents = Self::load_documents(path).await?;
        for (position, document) in documents.iter_mut().enumerate() {
            if let Some(patch) = updates.remove(&position) {
                document.extend(patch);
            }
        }
        if !updates.is_empty() {
            return Err(EtlError::ProcessingError {
                message: format!("{} changed on disk during the write", path.display()),
            });
        }
        documents.extend(appended);
        self.write_documents(path, &documents, false).await?;
        Ok(())
    }

    /// 依索引判斷重複並寫入；寫入失敗時回傳 `None`，讓下一次重新載入索引
    async fn write_indexed(
        &self,
        path: &Path,
        name: &str,
        records: &[Record],
        options: &WriteOptions,
        mut index: IdIndex,
    ) -> (WriteResult, Option<IdIndex>) {
        let existing_len = index.len;
        let mut appended: Vec<Map<String, Value>> = Vec::new();
        let mut updates: HashMap<usize, Map<String, Value>> = HashMap::new();
        let mut written = 0;
        let mut errors = Vec::new();

        for (i, record) in records.iter().enumerate() {
            let mut document: Map<String, Value> =
                record.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

            let id = match document.get(&self.id_field) {
                None | Some(Value::Null) => {
                    let id = self.generate_id();
                    document.insert(self.id_field.clone(), Value::String(id.clone()));
                    id
                }
                Some(_) => match self.document_id(&document) {
                    Some(id) => id,
                    None => {
                        errors.push(WriteFailure::record(
                            i,
                            format!("{} must be a string or a number", self.id_field),
                        ));
                        continue;
                    }
                },
            };

            match index.positions.get(&id).copied() {
                Some(position) if options.upsert => {
                    if position >= existing_len {
                        appended[position - existing_len].extend(document);
                    } else {
                        updates.entry(position).or_default().extend(document);
                    }
                    written += 1;
                }
                Some(_) => errors.push(WriteFailure::record(
                    i,
                    format!("Document with {} '{}' already exists", self.id_field, id),
                )),
                None => {
                    index.positions.insert(id, existing_len + appended.len());
                    appended.push(document);
                    written += 1;
                }
            }
        }

        let appended_len = appended.len();
        let outcome = if updates.is_empty() {
            self.write_documents(path, &appended, true)
                .await
                .map_err(EtlError::from)
        } else {
            self.rewrite_with_updates(path, updates, appended).await
        };

        match outcome {
            Ok(()) => {
                index.len = existing_len + appended_len;
                (WriteResult::from_parts(written, errors), Some(index))
            }
            Err(e) => (
                WriteResult::batch_failed(format!("Failed to write {}: {}", name, e)),
                None,
            ),
        }
    }

    fn document_id(&self, document: &Map<String, Value>) -> Option<String> {
        match document.get(&self.id_field) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    async fn write_documents(
        &self,
        path: &Path,
        documents: &[Map<String, Value>],
        append: bool,
    ) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut buffer = String::new();
        for document in documents {
            buffer.push_str(&Value::Object(document.clone()).to_string());
            buffer.push('\n');
        }

        if append {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(buffer.as_bytes()).await?;
            file.flush().await
        } else {
            // 先寫暫存檔再改名，避免寫到一半留下殘缺的集合
            let tmp = path.with_extension("jsonl.tmp");
            tokio::fs::write(&tmp, buffer.as_bytes()).await?;
            tokio::fs::rename(&tmp, path).await
        }
    }
}

fn parse_document(line: &str, line_no: usize) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(EtlError::ProcessingError {
            message: format!("line {} is not a JSON object", line_no),
        }),
        Err(e) => Err(EtlError::ProcessingError {
            message: format!("line {} is not valid JSON: {}", line_no, e),
        }),
    }
}

async fn open_lines(path: &Path) -> Result<Option<Lines<BufReader<File>>>> {
    match File::open(path).await {
        Ok(file) => Ok(Some(BufReader::new(file).lines())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

struct JsonlReader<'a> {
    connector: &'a JsonlConnector,
    collection: String,
    budget: BatchBudget,
    skip: usize,
    lines: Option<Lines<BufReader<File>>>,
    opened: bool,
    line_no: usize,
}

impl JsonlReader<'_> {
    fn read_error(&self, message: impl Into<String>) -> EtlError {
        EtlError::ReadError {
            collection: self.collection.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl BatchReader for JsonlReader<'_> {
    async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
        let Some(requested) = self.budget.next_request() else {
            return Ok(None);
        };
        self.connector.ensure_open()?;

        if !self.opened {
            self.opened = true;
            let path = self
                .connector
                .path_for(&self.collection)
                .map_err(|reason| self.read_error(reason))?;
            self.lines = open_lines(&path)
                .await
                .map_err(|e| self.read_error(e.to_string()))?;
        }

        let Some(lines) = self.lines.as_mut() else {
            self.budget.finish();
            return Ok(Some(Vec::new()));
        };

        let mut batch = Vec::with_capacity(requested);
        while batch.len() < requested {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    return Err(EtlError::ReadError {
                        collection: self.collection.clone(),
                        message: e.to_string(),
                    })
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            let document = parse_document(&line, self.line_no).map_err(|e| EtlError::ReadError {
                collection: self.collection.clone(),
                message: e.to_string(),
            })?;
            batch.push(Record {
                data: document.into_iter().collect(),
            });
        }

        self.budget.record(requested, batch.len());
        Ok(Some(batch))
    }
}

#[async_trait]
impl Connector for JsonlConnector {
    fn name(&self) -> &str {
        EXTENSION
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        if let Err(e) = self.ensure_open() {
            return ConnectionTestResult::failed(&e);
        }
        match tokio::fs::metadata(&self.directory).await {
            Ok(meta) if meta.is_dir() => ConnectionTestResult::ok(format!(
                "Successfully opened JSONL directory {}",
                self.directory.display()
            )),
            Ok(_) => ConnectionTestResult::failed(&EtlError::ConnectionError {
                message: format!("{} is not a directory", self.directory.display()),
            }),
            Err(e) => ConnectionTestResult::failed(&EtlError::ConnectionError {
                message: format!("{}: {}", self.directory.display(), e),
            }),
        }
    }

    async fn discover(&self) -> Result<Vec<CollectionInfo>> {
        self.ensure_open()?;
        let discovery_error = |e: &dyn std::fmt::Display| EtlError::DiscoveryError {
            target: "Failed to discover collections".to_string(),
            message: e.to_string(),
        };

        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(|e| discovery_error(&e))?;
        let mut collections = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(|e| discovery_error(&e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let sample = Self::sample(&path, SCHEMA_SAMPLE_SIZE)
                .await
                .map_err(|e| discovery_error(&format!("{}: {}", name, e)))?;
            let count = Self::count_documents(&path).await.ok();

            collections.push(CollectionInfo {
                name,
                kind: "collection".to_string(),
                schema: Some(infer_document_schema(&sample)),
                approx_count: count,
            });
        }

        collections.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!("🔍 Discovered {} JSONL collections", collections.len());
        Ok(collections)
    }

    async fn get_schema(&self, name: &str) -> Result<TableSchema> {
        self.ensure_open()?;
        let schema_error = |message: String| EtlError::DiscoveryError {
            target: format!("Failed to get schema for collection {}", name),
            message,
        };

        let path = self.path_for(name).map_err(schema_error)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(schema_error("collection does not exist".to_string()));
        }
        let sample = Self::sample(&path, SCHEMA_SAMPLE_SIZE)
            .await
            .map_err(|e| schema_error(e.to_string()))?;
        Ok(infer_document_schema(&sample))
    }

    async fn count(&self, name: &str) -> Result<Option<u64>> {
        self.ensure_open()?;
        let path = self.path_for(name).map_err(|message| EtlError::ReadError {
            collection: name.to_string(),
            message,
        })?;
        Ok(Some(Self::count_documents(&path).await?))
    }

    fn read_batch<'a>(&'a self, name: &str, options: ReadOptions) -> BatchStream<'a> {
        Box::new(JsonlReader {
            connector: self,
            collection: name.to_string(),
            budget: BatchBudget::new(&options),
            skip: options.offset,
            lines: None,
            opened: false,
            line_no: 0,
        })
    }

    /// 重複的 id 視為單筆錯誤；upsert 時改為逐欄合併到既有文件
    async fn write_batch(&self, name: &str, records: &[Record], options: &WriteOptions) -> WriteResult {
        let mut indexes = self.indexes.lock().await;
        if let Err(e) = self.ensure_open() {
            return WriteResult::batch_failed(e.to_string());
        }
        let path = match self.path_for(name) {
            Ok(path) => path,
            Err(reason) => return WriteResult::batch_failed(reason),
        };

        let index = match indexes.remove(name) {
            Some(index) => index,
            None => match self.load_index(&path).await {
                Ok(index) => index,
                Err(e) => return WriteResult::batch_failed(format!("Failed to load {}: {}", name, e)),
            },
        };

        let (result, index) = self.write_indexed(&path, name, records, options, index).await;
        if let Some(index) = index {
            indexes.insert(name.to_string(), index);
        }
        result
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ColumnType, FieldType};
    use serde_json::json;
    use tempfile::TempDir;

    fn connector(dir: &TempDir) -> JsonlConnector {
        JsonlConnector::new(&JsonlSettings {
            directory: dir.path().to_path_buf(),
            id_field: "_id".to_string(),
        })
    }

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn write_lines(dir: &TempDir, name: &str, lines: &[Value]) {
        let content: String = lines.iter().map(|l| format!("{}\n", l)).collect();
        std::fs::write(dir.path().join(format!("{}.jsonl", name)), content).unwrap();
    }

    async fn read_all(connector: &JsonlConnector, name: &str, options: ReadOptions) -> Vec<Vec<Record>> {
        let mut reader = connector.read_batch(name, options);
        let mut batches = Vec::new();
        while let Some(batch) = reader.next_batch().await.unwrap() {
            batches.push(batch);
        }
        batches
    }

    #[tokio::test]
    async fn test_read_in_batches_with_offset() {
        let dir = TempDir::new().unwrap();
        let docs: Vec<Value> = (0..7).map(|i| json!({"_id": format!("d{}", i), "n": i})).collect();
        write_lines(&dir, "items", &docs);
        let connector = connector(&dir);

        let batches = read_all(&connector, "items", ReadOptions::new(3)).await;
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        let batches = read_all(&connector, "items", ReadOptions::new(3).with_offset(5)).await;
        let flat: Vec<Record> = batches.into_iter().flatten().collect();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].get("n"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_missing_collection_reads_empty() {
        let dir = TempDir::new().unwrap();
        let connector = connector(&dir);

        let batches = read_all(&connector, "ghost", ReadOptions::new(10)).await;
        assert_eq!(batches, vec![Vec::<Record>::new()]);
        assert_eq!(connector.count("ghost").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_invalid_line_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.jsonl"), "{\"_id\":\"a\"}\n[1,2]\n").unwrap();
        let connector = connector(&dir);

        let mut reader = connector.read_batch("bad", ReadOptions::new(10));
        let err = reader.next_batch().await.unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_per_record_errors() {
        let dir = TempDir::new().unwrap();
        let connector = connector(&dir);
        let options = WriteOptions::default();

        let first = connector
            .write_batch("users", &[record(json!({"_id": "a", "name": "Ann"}))], &options)
            .await;
        assert!(first.success);

        let second = connector
            .write_batch(
                "users",
                &[
                    record(json!({"_id": "a", "name": "Again"})),
                    record(json!({"_id": "b", "name": "Bob"})),
                    record(json!({"name": "No id"})),
                ],
                &options,
            )
            .await;
        assert!(!second.success);
        assert_eq!(second.count, 2);
        assert_eq!(second.errors, vec![WriteFailure::record(0, "Document with _id 'a' already exists")]);

        assert_eq!(connector.count("users").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_upsert_merges_existing_documents() {
        let dir = TempDir::new().unwrap();
        write_lines(&dir, "users", &[json!({"_id": "a", "name": "Ann", "age": 30})]);
        let connector = connector(&dir);

        let options = WriteOptions {
            upsert: true,
            conflict_columns: vec![],
        };
        let result = connector
            .write_batch("users", &[record(json!({"_id": "a", "name": "Anna"}))], &options)
            .await;
        assert!(result.success);

        let batches = read_all(&connector, "users", ReadOptions::new(10)).await;
        let docs: Vec<Value> = batches.into_iter().flatten().map(Record::into_value).collect();
        assert_eq!(docs, vec![json!({"_id": "a", "name": "Anna", "age": 30})]);
        assert!(!dir.path().join("users.jsonl.tmp").exists());
    }

    #[tokio::test]
    async fn test_id_index_is_loaded_once_per_collection() {
        let dir = TempDir::new().unwrap();
        let connector = connector(&dir);
        let options = WriteOptions::default();

        let first = connector
            .write_batch("users", &[record(json!({"_id": "a", "name": "Ann"}))], &options)
            .await;
        assert!(first.success);

        // 索引已在記憶體中，之後的寫入不再逐行解析既有檔案
        let path = dir.path().join("users.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("not json\n");
        std::fs::write(&path, content).unwrap();

        let second = connector
            .write_batch(
                "users",
                &[record(json!({"_id": "a", "name": "Again"})), record(json!({"_id": "b", "name": "Bob"}))],
                &options,
            )
            .await;
        assert_eq!(second.count, 1);
        assert_eq!(second.errors, vec![WriteFailure::record(0, "Document with _id 'a' already exists")]);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with("{\"_id\":\"b\",\"name\":\"Bob\"}\n"));
    }

    #[tokio::test]
    async fn test_upsert_after_appends_keeps_positions() {
        let dir = TempDir::new().unwrap();
        let connector = connector(&dir);
        let upsert = WriteOptions {
            upsert: true,
            conflict_columns: vec![],
        };

        connector
            .write_batch(
                "users",
                &[record(json!({"_id": "a", "name": "Ann"})), record(json!({"_id": "b", "name": "Bob"}))],
                &WriteOptions::default(),
            )
            .await;
        let merged = connector
            .write_batch(
                "users",
                &[
                    record(json!({"_id": "b", "age": 41})),
                    record(json!({"_id": "c", "name": "Cy"})),
                    record(json!({"_id": "c", "age": 7})),
                ],
                &upsert,
            )
            .await;
        assert!(merged.success);
        assert_eq!(merged.count, 3);

        let duplicate = connector
            .write_batch("users", &[record(json!({"_id": "c"}))], &WriteOptions::default())
            .await;
        assert_eq!(duplicate.count, 0);

        let batches = read_all(&connector, "users", ReadOptions::new(10)).await;
        let docs: Vec<Value> = batches.into_iter().flatten().map(Record::into_value).collect();
        assert_eq!(
            docs,
            vec![
                json!({"_id": "a", "name": "Ann"}),
                json!({"_id": "b", "name": "Bob", "age": 41}),
                json!({"_id": "c", "name": "Cy", "age": 7}),
            ]
        );
    }

    #[tokio::test]
    async fn test_discover_and_schema_union() {
        let dir = TempDir::new().unwrap();
        write_lines(
            &dir,
            "events",
            &[json!({"_id": "1", "value": 1}), json!({"_id": "2", "value": "high"})],
        );
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let connector = connector(&dir);

        let collections = connector.discover().await.unwrap();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].name, "events");
        assert_eq!(collections[0].approx_count, Some(2));

        let schema = connector.get_schema("events").await.unwrap();
        assert_eq!(
            schema.column("value").unwrap().column_type,
            ColumnType::Union(vec![FieldType::String, FieldType::Integer])
        );
        assert!(connector.get_schema("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_collection_names_cannot_escape_directory() {
        let dir = TempDir::new().unwrap();
        let connector = connector(&dir);
        let result = connector
            .write_batch("../escape", &[record(json!({"_id": "a"}))], &WriteOptions::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.count, 0);
    }

    #[tokio::test]
    async fn test_connection_and_close() {
        let dir = TempDir::new().unwrap();
        let connector = connector(&dir);
        assert!(connector.test_connection().await.success);

        connector.close().await.unwrap();
        connector.close().await.unwrap();
        assert!(!connector.test_connection().await.success);
        assert!(matches!(
            connector.count("users").await,
            Err(EtlError::ConnectorClosed { .. })
        ));
    }
}

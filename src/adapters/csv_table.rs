use crate::adapters::collection_file;
use crate::config::CsvSettings;
use crate::domain::model::{
    CollectionInfo, ColumnInfo, ColumnType, FieldType, Record, TableSchema,
};
use crate::domain::ports::{
    BatchBudget, BatchReader, BatchStream, ConnectionTestResult, Connector, CreateTableResult,
    ReadOptions, WriteFailure, WriteOptions, WriteResult,
};
use crate::core::schema::infer_field_type;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

const EXTENSION: &str = "csv";
/// 推斷欄位型別時掃描的列數
const TYPE_SAMPLE_ROWS: usize = 100;

/// 表格型儲存：目錄中每個 `<table>.csv` 是一張表，第一列是欄位名稱
pub struct CsvConnector {
    directory: PathBuf,
    delimiter: u8,
    /// 寫入鎖；內容為本連線器依記錄欄位自行建立的表，這些表的表頭可隨新欄位擴充
    implicit_tables: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

/// 空字串為 null，其餘依序嘗試整數、數字、布林、內嵌 JSON，最後才是字串
pub fn parse_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = cell.parse::<f64>() {
        if f.is_finite() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    match cell {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if cell.starts_with('{') || cell.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<Value>(cell) {
            return value;
        }
    }
    Value::String(cell.to_string())
}

pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 整數與數字合併為數字，其他混合型別一律退回字串
fn widen(current: Option<FieldType>, next: FieldType) -> Option<FieldType> {
    if next == FieldType::Null {
        return current;
    }
    Some(match current {
        None => next,
        Some(current) if current == next => current,
        Some(current) if current.is_numeric() && next.is_numeric() => FieldType::Number,
        Some(_) => FieldType::String,
    })
}

fn row_to_record(headers: &[String], row: &csv::StringRecord) -> Record {
    let mut record = Record::new();
    for (header, cell) in headers.iter().zip(row.iter()) {
        record.insert(header.clone(), parse_cell(cell));
    }
    record
}

impl CsvConnector {
    pub fn new(settings: &CsvSettings) -> Result<Self> {
        let delimiter = match settings.delimiter.as_bytes() {
            [byte] if byte.is_ascii() => *byte,
            _ => {
                return Err(EtlError::InvalidConfigValueError {
                    field: "delimiter".to_string(),
                    value: settings.delimiter.clone(),
                    reason: "Delimiter must be a single ASCII character".to_string(),
                })
            }
        };

        Ok(Self {
            directory: settings.directory.clone(),
            delimiter,
            implicit_tables: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        })
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

    fn path_for(&self, table: &str) -> std::result::Result<PathBuf, String> {
        collection_file(&self.directory, table, EXTENSION)
    }

    fn open_reader(&self, path: &Path) -> Result<csv::Reader<File>> {
        Ok(csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_path(path)?)
    }

    fn read_headers(&self, path: &Path) -> Result<Vec<String>> {
        let mut reader = self.open_reader(path)?;
        Ok(reader.headers()?.iter().map(str::to_string).collect())
    }

    fn read_rows(&self, path: &Path) -> Result<(Vec<String>, Vec<csv::StringRecord>)> {
        let mut reader = self.open_reader(path)?;
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        let rows = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((headers, rows))
    }

    fn table_schema(&self, path: &Path) -> Result<TableSchema> {
        let mut reader = self.open_reader(path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut types: Vec<Option<FieldType>> = vec![None; headers.len()];
        let mut nullable = vec![false; headers.len()];

        for row in reader.records().take(TYPE_SAMPLE_ROWS) {
            let row = row?;
            for (i, slot) in types.iter_mut().enumerate() {
                let value = row.get(i).map(parse_cell).unwrap_or(Value::Null);
                if value.is_null() {
                    nullable[i] = true;
                }
                *slot = widen(slot.take(), infer_field_type(&value));
            }
        }

        let columns = headers
            .into_iter()
            .zip(types.into_iter().zip(nullable))
            .map(|(name, (field_type, nullable))| ColumnInfo {
                name,
                column_type: ColumnType::Single(field_type.unwrap_or(FieldType::String)),
                nullable,
                default: None,
                max_length: None,
            })
            .collect();

        Ok(TableSchema {
            columns,
            primary_keys: Vec::new(),
            foreign_keys: Vec::new(),
        })
    }

    fn count_rows(&self, path: &Path) -> Result<u64> {
        let mut reader = self.open_reader(path)?;
        let mut row = csv::StringRecord::new();
        let mut count = 0;
        while reader.read_record(&mut row)? {
            count += 1;
        }
        Ok(count)
    }

    fn write_all(&self, path: &Path, headers: &[String], rows: &[Vec<String>]) -> Result<()> {
        let tmp = path.with_extension("csv.tmp");
        {
            let mut writer = csv::WriterBuilder::new()
                .delimiter(self.delimiter)
                .from_path(&tmp)?;
            writer.write_record(headers)?;
            for row in rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn append(&self, path: &Path, rows: &[Vec<String>]) -> Result<()> {
        let file = OpenOptions::new().append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .from_writer(file);
        for row in rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// 同步寫入；呼叫端持有寫入鎖
    fn write_records(
        &self,
        table: &str,
        records: &[Record],
        options: &WriteOptions,
        implicit_tables: &mut HashSet<String>,
    ) -> Result<WriteResult> {
        let path = self.path_for(table).map_err(|message| EtlError::WriteError {
            table: table.to_string(),
            message,
        })?;
        fs::create_dir_all(&self.directory)?;

        let exists = path.exists();
        let (mut headers, mut rows): (Vec<String>, Vec<Vec<String>>) = if exists {
            let (headers, existing) = self.read_rows(&path)?;
            let rows = existing
                .iter()
                .map(|r| r.iter().map(str::to_string).collect())
                .collect();
            (headers, rows)
        } else {
            implicit_tables.insert(table.to_string());
            (Vec::new(), Vec::new())
        };

        // 自行建立的表：新出現的欄位（排序後）接在表頭最後，既有列補空值後整檔重寫
        let mut rewrite = !exists;
        if implicit_tables.contains(table) {
            let mut added: Vec<String> = records
                .iter()
                .flat_map(|r| r.data.keys())
                .filter(|k| !headers.contains(*k))
                .cloned()
                .collect();
            added.sort();
            added.dedup();
            if !added.is_empty() {
                if exists {
                    tracing::debug!(
                        "📝 Widening CSV table {} with column(s): {}",
                        table,
                        added.join(", ")
                    );
                    rewrite = true;
                }
                headers.extend(added);
                for row in &mut rows {
                    row.resize(headers.len(), String::new());
                }
            }
        }

        let positions: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.as_str(), i))
            .collect();
        let keyed = options.upsert && !options.conflict_columns.is_empty();
        let existing_len = rows.len();
        let mut replaced = false;
        let mut written = 0;
        let mut errors = Vec::new();

        for (i, record) in records.iter().enumerate() {
            let mut unknown: Vec<&str> = record
                .data
                .keys()
                .map(String::as_str)
                .filter(|k| !positions.contains_key(k))
                .collect();
            if !unknown.is_empty() {
                unknown.sort_unstable();
                errors.push(WriteFailure::record(
                    i,
                    format!("Unknown column(s) for table {}: {}", table, unknown.join(", ")),
                ));
                continue;
            }

            let existing = if keyed {
                let key: Option<Vec<(usize, String)>> = options
                    .conflict_columns
                    .iter()
                    .map(|c| Some((*positions.get(c.as_str())?, cell_text(record.get(c)?))))
                    .collect();
                let Some(key) = key else {
                    errors.push(WriteFailure::record(
                        i,
                        format!(
                            "Record is missing conflict column(s): {}",
                            options.conflict_columns.join(", ")
                        ),
                    ));
                    continue;
                };
                rows.iter()
                    .position(|row| key.iter().all(|(p, v)| row.get(*p) == Some(v)))
            } else {
                None
            };

            match existing {
                Some(row_index) => {
                    let row = &mut rows[row_index];
                    row.resize(headers.len(), String::new());
                    for (column, value) in &record.data {
                        row[positions[column.as_str()]] = cell_text(value);
                    }
                    replaced |= row_index < existing_len;
                }
                None => {
                    let mut row = vec![String::new(); headers.len()];
                    for (column, value) in &record.data {
                        row[positions[column.as_str()]] = cell_text(value);
                    }
                    rows.push(row);
                }
            }
            written += 1;
        }

        if rewrite || replaced {
            self.write_all(&path, &headers, &rows)?;
        } else {
            self.append(&path, &rows[existing_len..])?;
        }

        Ok(WriteResult::from_parts(written, errors))
    }
}

struct CsvReader<'a> {
    connector: &'a CsvConnector,
    table: String,
    budget: BatchBudget,
    skip: usize,
    state: Option<(csv::Reader<File>, Vec<String>)>,
}

impl CsvReader<'_> {
    fn read_error(&self, message: impl Into<String>) -> EtlError {
        EtlError::ReadError {
            collection: self.table.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl BatchReader for CsvReader<'_> {
    async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
        let Some(requested) = self.budget.next_request() else {
            return Ok(None);
        };
        self.connector.ensure_open()?;

        if self.state.is_none() {
            let path = self
                .connector
                .path_for(&self.table)
                .map_err(|reason| self.read_error(reason))?;
            if !path.exists() {
                return Err(self.read_error(format!("Table {} does not exist", self.table)));
            }
            let mut reader = self
                .connector
                .open_reader(&path)
                .map_err(|e| self.read_error(e.to_string()))?;
            let headers = reader
                .headers()
                .map_err(|e| self.read_error(e.to_string()))?
                .iter()
                .map(str::to_string)
                .collect();
            self.state = Some((reader, headers));
        }

        let Some((reader, headers)) = self.state.as_mut() else {
            return Ok(None);
        };

        let mut row = csv::StringRecord::new();
        let mut batch = Vec::with_capacity(requested);
        while batch.len() < requested {
            match reader.read_record(&mut row) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    return Err(EtlError::ReadError {
                        collection: self.table.clone(),
                        message: e.to_string(),
                    })
                }
            }
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            batch.push(row_to_record(headers, &row));
        }

        self.budget.record(requested, batch.len());
        Ok(Some(batch))
    }
}

#[async_trait]
impl Connector for CsvConnector {
    fn name(&self) -> &str {
        EXTENSION
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        if let Err(e) = self.ensure_open() {
            return ConnectionTestResult::failed(&e);
        }
        if self.directory.is_dir() {
            ConnectionTestResult::ok(format!(
                "Successfully opened CSV directory {}",
                self.directory.display()
            ))
        } else {
            ConnectionTestResult::failed(&EtlError::ConnectionError {
                message: format!("{} is not a directory", self.directory.display()),
            })
        }
    }

    async fn discover(&self) -> Result<Vec<CollectionInfo>> {
        self.ensure_open()?;
        let discovery_error = |message: String| EtlError::DiscoveryError {
            target: "Failed to discover tables".to_string(),
            message,
        };

        let entries = fs::read_dir(&self.directory).map_err(|e| discovery_error(e.to_string()))?;
        let mut tables = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| discovery_error(e.to_string()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let schema = self
                .table_schema(&path)
                .map_err(|e| discovery_error(format!("{}: {}", name, e)))?;
            tables.push(CollectionInfo {
                name,
                kind: "table".to_string(),
                schema: Some(schema),
                approx_count: self.count_rows(&path).ok(),
            });
        }

        tables.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!("🔍 Discovered {} CSV tables", tables.len());
        Ok(tables)
    }

    async fn get_schema(&self, name: &str) -> Result<TableSchema> {
        self.ensure_open()?;
        let schema_error = |message: String| EtlError::DiscoveryError {
            target: format!("Failed to get schema for table {}", name),
            message,
        };
        let path = self.path_for(name).map_err(schema_error)?;
        if !path.exists() {
            return Err(schema_error("table does not exist".to_string()));
        }
        self.table_schema(&path).map_err(|e| schema_error(e.to_string()))
    }

    async fn count(&self, name: &str) -> Result<Option<u64>> {
        self.ensure_open()?;
        let path = self.path_for(name).map_err(|message| EtlError::ReadError {
            collection: name.to_string(),
            message,
        })?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.count_rows(&path)?))
    }

    fn read_batch<'a>(&'a self, name: &str, options: ReadOptions) -> BatchStream<'a> {
        Box::new(CsvReader {
            connector: self,
            table: name.to_string(),
            budget: BatchBudget::new(&options),
            skip: options.offset,
            state: None,
        })
    }

    /// 未知欄位視為單筆錯誤；upsert 依 `conflictColumns` 比對既有列
    async fn write_batch(&self, name: &str, records: &[Record], options: &WriteOptions) -> WriteResult {
        let mut implicit_tables = self.implicit_tables.lock().await;
        if let Err(e) = self.ensure_open() {
            return WriteResult::batch_failed(e.to_string());
        }
        match self.write_records(name, records, options, &mut implicit_tables) {
            Ok(result) => result,
            Err(e) => WriteResult::batch_failed(e.to_string()),
        }
    }

    fn supports_create_table(&self) -> bool {
        true
    }

    async fn create_table(&self, name: &str, schema: &TableSchema) -> Result<CreateTableResult> {
        let mut implicit_tables = self.implicit_tables.lock().await;
        self.ensure_open()?;
        let path = self.path_for(name).map_err(|message| EtlError::WriteError {
            table: name.to_string(),
            message,
        })?;

        if path.exists() {
            let headers = self.read_headers(&path)?;
            let missing: Vec<&str> = schema
                .columns
                .iter()
                .map(|c| c.name.as_str())
                .filter(|c| !headers.iter().any(|h| h == c))
                .collect();
            if !missing.is_empty() {
                tracing::warn!(
                    "⚠️ Table {} already exists without column(s): {}",
                    name,
                    missing.join(", ")
                );
            }
            return Ok(CreateTableResult {
                success: true,
                message: format!("Table {} already exists", name),
            });
        }

        fs::create_dir_all(&self.directory)?;
        let headers: Vec<String> = schema.columns.iter().map(|c| c.name.clone()).collect();
        self.write_all(&path, &headers, &[])?;
        implicit_tables.remove(name);
        tracing::info!("📝 Created CSV table {}", path.display());

        Ok(CreateTableResult {
            success: true,
            message: format!("Table {} created successfully", name),
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

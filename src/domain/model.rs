use crate::utils::error::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 一筆沒有固定 schema 的記錄：欄位名稱對應到純量或巢狀值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    pub data: HashMap<String, serde_json::Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只有 JSON 物件可以成為記錄
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(map) => Some(Self {
                data: map.into_iter().collect(),
            }),
            _ => None,
        }
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::Value::Object(self.data.into_iter().collect())
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }
}

impl From<HashMap<String, serde_json::Value>> for Record {
    fn from(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }
}

/// 欄位型別名稱；未知名稱原樣保留，只在完全相同時視為同型別
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    String,
    Text,
    Uuid,
    Number,
    Integer,
    Float,
    Boolean,
    Date,
    Timestamp,
    Json,
    Array,
    Object,
    Binary,
    Null,
    Other(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::String => "string",
            FieldType::Text => "text",
            FieldType::Uuid => "uuid",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Timestamp => "timestamp",
            FieldType::Json => "json",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Binary => "binary",
            FieldType::Null => "null",
            FieldType::Other(name) => name,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Number | FieldType::Integer | FieldType::Float
        )
    }
}

impl From<String> for FieldType {
    fn from(name: String) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "string" => FieldType::String,
            "text" => FieldType::Text,
            "uuid" => FieldType::Uuid,
            "number" => FieldType::Number,
            "integer" => FieldType::Integer,
            "float" => FieldType::Float,
            "boolean" => FieldType::Boolean,
            "date" => FieldType::Date,
            "timestamp" => FieldType::Timestamp,
            "json" => FieldType::Json,
            "array" => FieldType::Array,
            "object" => FieldType::Object,
            "binary" => FieldType::Binary,
            "null" => FieldType::Null,
            _ => FieldType::Other(name),
        }
    }
}

impl From<&str> for FieldType {
    fn from(name: &str) -> Self {
        FieldType::from(name.to_string())
    }
}

impl From<FieldType> for String {
    fn from(field_type: FieldType) -> Self {
        field_type.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 單一欄位的映射規則
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
    pub source_type: FieldType,
    pub target_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingOptions {
    #[serde(default)]
    pub flatten: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default)]
    pub skip_fields: Vec<String>,
    /// upsert 時用來判斷衝突的欄位
    #[serde(default)]
    pub conflict_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaMapping {
    pub source_collection: String,
    pub target_table: String,
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub options: MappingOptions,
}

impl SchemaMapping {
    /// 實際寫入目的地的欄位名稱（攤平後以底線連接）
    pub fn target_columns(&self) -> Vec<(String, &FieldMapping)> {
        self.active_field_mappings()
            .map(|fm| {
                let column = if self.options.flatten {
                    let joined = fm.target_field.replace('.', "_");
                    match self.options.prefix.as_deref() {
                        Some(prefix) if !prefix.is_empty() => format!("{}_{}", prefix, joined),
                        _ => joined,
                    }
                } else {
                    fm.target_field.clone()
                };
                (column, fm)
            })
            .collect()
    }

    /// 排除 skipFields 指定的來源欄位
    pub fn active_field_mappings(&self) -> impl Iterator<Item = &FieldMapping> {
        self.field_mappings
            .iter()
            .filter(|fm| !self.options.skip_fields.contains(&fm.source_field))
    }
}

/// 欄位型別：關聯式來源為單一型別，文件型來源可能是多種型別的集合
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnType {
    Single(FieldType),
    Union(Vec<FieldType>),
}

impl ColumnType {
    /// 集合只有一個元素時收斂成單一型別
    pub fn from_set(types: std::collections::BTreeSet<FieldType>) -> Self {
        let mut types: Vec<FieldType> = types.into_iter().collect();
        if types.len() == 1 {
            ColumnType::Single(types.remove(0))
        } else {
            ColumnType::Union(types)
        }
    }

    pub fn primary(&self) -> FieldType {
        match self {
            ColumnType::Single(t) => t.clone(),
            ColumnType::Union(types) => types
                .iter()
                .find(|t| **t != FieldType::Null)
                .cloned()
                .unwrap_or(FieldType::String),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub column: String,
    pub foreign_table: String,
    pub foreign_column: String,
}

/// 欄位依照來源順序排列（建立資料表時需要）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionInfo {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<TableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approx_count: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusError {
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Pipeline 執行期間的狀態，由 pipeline 獨佔並就地更新
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub progress: f64,
    pub total_records: Option<u64>,
    pub processed_records: u64,
    pub current_mapping: Option<String>,
    pub errors: Vec<StatusError>,
    pub logs: Vec<LogEntry>,
    #[serde(skip)]
    version: u64,
    #[serde(skip)]
    logs_emitted: usize,
    #[serde(skip)]
    errors_emitted: usize,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStatus {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            progress: 0.0,
            total_records: None,
            processed_records: 0,
            current_mapping: None,
            errors: Vec::new(),
            logs: Vec::new(),
            version: 0,
            logs_emitted: 0,
            errors_emitted: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// 新增日誌並同步輸出到 tracing
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.log_with_meta(level, message, serde_json::Map::new());
    }

    pub fn log_with_meta(
        &mut self,
        level: LogLevel,
        message: impl Into<String>,
        meta: serde_json::Map<String, serde_json::Value>,
    ) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
            meta,
        });
    }

    pub fn push_error(&mut self, error: StatusError) {
        self.errors.push(error);
    }

    /// 處理筆數只增不減
    pub fn add_processed(&mut self, count: u64) {
        self.processed_records = self.processed_records.saturating_add(count);
        self.recompute_progress();
    }

    pub fn recompute_progress(&mut self) {
        self.progress = match self.total_records {
            Some(total) if total > 0 => {
                (self.processed_records as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
    }

    /// 產生不可變快照，只帶上一個快照之後新增的日誌與錯誤
    pub fn snapshot(&mut self) -> StatusSnapshot {
        self.version += 1;
        let new_logs = self.logs[self.logs_emitted..].to_vec();
        let new_errors = self.errors[self.errors_emitted..].to_vec();
        self.logs_emitted = self.logs.len();
        self.errors_emitted = self.errors.len();

        StatusSnapshot {
            version: self.version,
            state: self.state,
            progress: self.progress,
            total_records: self.total_records,
            processed_records: self.processed_records,
            current_mapping: self.current_mapping.clone(),
            error_count: self.errors.len(),
            logs: new_logs,
            errors: new_errors,
        }
    }
}

/// 交給觀察者的狀態快照
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub version: u64,
    pub state: PipelineState,
    pub progress: f64,
    pub total_records: Option<u64>,
    pub processed_records: u64,
    pub current_mapping: Option<String>,
    pub error_count: usize,
    pub logs: Vec<LogEntry>,
    pub errors: Vec<StatusError>,
}

use crate::domain::model::{CollectionInfo, Record, TableSchema};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 逐批拉取的讀取介面：`Ok(None)` 表示資料已讀完
///
/// 只能向前讀、不能重來；重新呼叫 `Connector::read_batch` 會從頭（或指定 offset）開始。
#[async_trait]
pub trait BatchReader: Send {
    async fn next_batch(&mut self) -> Result<Option<Vec<Record>>>;
}

pub type BatchStream<'a> = Box<dyn BatchReader + 'a>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOptions {
    pub batch_size: usize,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ReadOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            limit: None,
            offset: 0,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// 共用的批次終止規則：空批次、短批次或達到 limit 即停止
#[derive(Debug, Clone)]
pub struct BatchBudget {
    batch_size: usize,
    remaining: Option<usize>,
    exhausted: bool,
}

impl BatchBudget {
    pub fn new(options: &ReadOptions) -> Self {
        Self {
            batch_size: options.batch_size.max(1),
            remaining: options.limit,
            exhausted: false,
        }
    }

    /// 下一批應請求的筆數；`None` 表示不該再讀
    pub fn next_request(&self) -> Option<usize> {
        if self.exhausted {
            return None;
        }
        match self.remaining {
            Some(0) => None,
            Some(remaining) => Some(remaining.min(self.batch_size)),
            None => Some(self.batch_size),
        }
    }

    pub fn record(&mut self, requested: usize, received: usize) {
        if received == 0 || received < requested {
            self.exhausted = true;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(received);
        }
    }

    pub fn finish(&mut self) {
        self.exhausted = true;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub upsert: bool,
    pub conflict_columns: Vec<String>,
}

/// 單筆寫入失敗；`index` 為該筆在本次批次中的位置，整批失敗時為 `None`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub index: Option<usize>,
    pub message: String,
}

impl WriteFailure {
    pub fn record(index: usize, message: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            message: message.into(),
        }
    }

    pub fn batch(message: impl Into<String>) -> Self {
        Self {
            index: None,
            message: message.into(),
        }
    }
}

/// 寫入結果永遠以值回傳：單筆失敗合併進 `errors`，`count` 只算成功筆數
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub success: bool,
    pub count: usize,
    pub errors: Vec<WriteFailure>,
}

impl WriteResult {
    pub fn from_parts(count: usize, errors: Vec<WriteFailure>) -> Self {
        Self {
            success: errors.is_empty(),
            count,
            errors,
        }
    }

    /// 整批原子失敗（例如交易或檔案層級錯誤）
    pub fn batch_failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            count: 0,
            errors: vec![WriteFailure::batch(message)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionTestResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(error: &EtlError) -> Self {
        Self {
            success: false,
            message: format!("Connection failed: {}", error),
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTableResult {
    pub success: bool,
    pub message: String,
}

/// 所有資料來源／目的地都要實作的能力集合
#[async_trait]
pub trait Connector: Send + Sync {
    /// 連線器類型名稱（例如 `postgresql`、`jsonl`）
    fn name(&self) -> &str;

    /// 永不回傳錯誤：所有連線失敗都以 `success = false` 回報
    async fn test_connection(&self) -> ConnectionTestResult;

    async fn discover(&self) -> Result<Vec<CollectionInfo>>;

    async fn get_schema(&self, name: &str) -> Result<TableSchema>;

    /// 記錄筆數；無法便宜取得時回傳 `None`
    async fn count(&self, _name: &str) -> Result<Option<u64>> {
        Ok(None)
    }

    fn read_batch<'a>(&'a self, name: &str, options: ReadOptions) -> BatchStream<'a>;

    async fn write_batch(
        &self,
        name: &str,
        records: &[Record],
        options: &WriteOptions,
    ) -> WriteResult;

    fn supports_create_table(&self) -> bool {
        false
    }

    async fn create_table(&self, name: &str, _schema: &TableSchema) -> Result<CreateTableResult> {
        Err(EtlError::UnsupportedOperation {
            connector: self.name().to_string(),
            operation: format!("createTable({})", name),
        })
    }

    /// 可重複呼叫
    async fn close(&self) -> Result<()>;
}

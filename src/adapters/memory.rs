use crate::core::schema::{infer_document_schema, SCHEMA_SAMPLE_SIZE};
use crate::domain::model::{CollectionInfo, Record, TableSchema};
use crate::domain::ports::{
    BatchBudget, BatchReader, BatchStream, ConnectionTestResult, Connector, CreateTableResult,
    ReadOptions, WriteOptions, WriteResult,
};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

type Collections = BTreeMap<String, Vec<Record>>;

/// 行程內的記憶體資料庫，適合嵌入使用與測試
///
/// clone 出來的實例共用同一份資料。
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    collections: Arc<RwLock<Collections>>,
    closed: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(self, name: impl Into<String>, records: Vec<Record>) -> Self {
        self.insert_collection(name, records);
        self
    }

    pub fn insert_collection(&self, name: impl Into<String>, records: Vec<Record>) {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), records);
    }

    /// 目前的內容（複本）；集合不存在時為空
    pub fn collection(&self, name: &str) -> Vec<Record> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(EtlError::ConnectorClosed {
                connector: "memory".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

struct MemoryReader<'a> {
    connector: &'a MemoryConnector,
    collection: String,
    budget: BatchBudget,
    position: usize,
}

#[async_trait]
impl BatchReader for MemoryReader<'_> {
    async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
        let Some(requested) = self.budget.next_request() else {
            return Ok(None);
        };
        self.connector.ensure_open()?;

        let batch: Vec<Record> = {
            let collections = self
                .connector
                .collections
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let records = collections
                .get(&self.collection)
                .ok_or_else(|| EtlError::ReadError {
                    collection: self.collection.clone(),
                    message: "Collection not found".to_string(),
                })?;
            records
                .iter()
                .skip(self.position)
                .take(requested)
                .cloned()
                .collect()
        };

        self.position += batch.len();
        self.budget.record(requested, batch.len());
        Ok(Some(batch))
    }
}

/// 依衝突欄位比對兩筆記錄；任一欄位缺少都不算相同
fn same_key(a: &Record, b: &Record, columns: &[String]) -> bool {
    columns
        .iter()
        .all(|c| matches!((a.get(c), b.get(c)), (Some(x), Some(y)) if x == y))
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        "memory"
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        match self.ensure_open() {
            Ok(()) => ConnectionTestResult::ok("Memory store ready"),
            Err(e) => ConnectionTestResult::failed(&e),
        }
    }

    async fn discover(&self) -> Result<Vec<CollectionInfo>> {
        self.ensure_open()?;
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        Ok(collections
            .iter()
            .map(|(name, records)| {
                let sample: Vec<Record> = records.iter().take(SCHEMA_SAMPLE_SIZE).cloned().collect();
                CollectionInfo {
                    name: name.clone(),
                    kind: "collection".to_string(),
                    schema: Some(infer_document_schema(&sample)),
                    approx_count: Some(records.len() as u64),
                }
            })
            .collect())
    }

    async fn get_schema(&self, name: &str) -> Result<TableSchema> {
        self.ensure_open()?;
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let records = collections.get(name).ok_or_else(|| EtlError::DiscoveryError {
            target: format!("Failed to get schema for collection {}", name),
            message: "Collection not found".to_string(),
        })?;
        Ok(infer_document_schema(records))
    }

    async fn count(&self, name: &str) -> Result<Option<u64>> {
        self.ensure_open()?;
        Ok(self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|records| records.len() as u64))
    }

    fn read_batch<'a>(&'a self, name: &str, options: ReadOptions) -> BatchStream<'a> {
        Box::new(MemoryReader {
            connector: self,
            collection: name.to_string(),
            budget: BatchBudget::new(&options),
            position: options.offset,
        })
    }

    /// upsert 且指定衝突欄位時，相同鍵的記錄會逐欄合併
    async fn write_batch(&self, name: &str, records: &[Record], options: &WriteOptions) -> WriteResult {
        if let Err(e) = self.ensure_open() {
            return WriteResult::batch_failed(e.to_string());
        }

        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let target = collections.entry(name.to_string()).or_default();

        for record in records {
            let existing = if options.upsert && !options.conflict_columns.is_empty() {
                target
                    .iter_mut()
                    .find(|r| same_key(r, record, &options.conflict_columns))
            } else {
                None
            };

            match existing {
                Some(existing) => existing
                    .data
                    .extend(record.data.iter().map(|(k, v)| (k.clone(), v.clone()))),
                None => target.push(record.clone()),
            }
        }

        WriteResult::from_parts(records.len(), Vec::new())
    }

    fn supports_create_table(&self) -> bool {
        true
    }

    async fn create_table(&self, name: &str, _schema: &TableSchema) -> Result<CreateTableResult> {
        self.ensure_open()?;
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let created = !collections.contains_key(name);
        collections.entry(name.to_string()).or_default();

        Ok(CreateTableResult {
            success: true,
            message: if created {
                format!("Collection {} created", name)
            } else {
                format!("Collection {} already exists", name)
            },
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

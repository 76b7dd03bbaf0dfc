// PostgreSQL 與 Supabase 連線器（feature `postgres`）

mod client;
pub mod sql;
mod supabase;

pub use client::PostgresCore;
pub use supabase::{resolve_settings, SupabaseConnector};

use crate::config::PostgresSettings;
use crate::domain::model::{CollectionInfo, Record, TableSchema};
use crate::domain::ports::{
    BatchStream, ConnectionTestResult, Connector, CreateTableResult, ReadOptions, WriteOptions,
    WriteResult,
};
use crate::utils::error::Result;
use async_trait::async_trait;

pub struct PostgresConnector {
    core: PostgresCore,
}

impl PostgresConnector {
    pub fn new(settings: &PostgresSettings) -> Result<Self> {
        Ok(Self {
            core: PostgresCore::new("postgresql", settings)?,
        })
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn name(&self) -> &str {
        self.core.label()
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        self.core.test_connection("PostgreSQL").await
    }

    async fn discover(&self) -> Result<Vec<CollectionInfo>> {
        self.core.discover().await
    }

    async fn get_schema(&self, name: &str) -> Result<TableSchema> {
        self.core.get_schema(name).await
    }

    async fn count(&self, name: &str) -> Result<Option<u64>> {
        self.core.count(name).await
    }

    fn read_batch<'a>(&'a self, name: &str, options: ReadOptions) -> BatchStream<'a> {
        Box::new(self.core.reader(name, options))
    }

    async fn write_batch(&self, name: &str, records: &[Record], options: &WriteOptions) -> WriteResult {
        self.core.write_batch(name, records, options).await
    }

    fn supports_create_table(&self) -> bool {
        true
    }

    async fn create_table(&self, name: &str, schema: &TableSchema) -> Result<CreateTableResult> {
        self.core.create_table(name, schema).await
    }

    async fn close(&self) -> Result<()> {
        self.core.close();
        Ok(())
    }
}

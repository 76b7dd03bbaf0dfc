use super::sql;
use crate::config::PostgresSettings;
use crate::domain::model::{CollectionInfo, ColumnInfo, ColumnType, ForeignKey, Record, TableSchema};
use crate::domain::ports::{
    BatchBudget, BatchReader, ConnectionTestResult, CreateTableResult, ReadOptions, WriteFailure,
    WriteOptions, WriteResult,
};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};

const MAX_POOL_SIZE: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// PostgreSQL 系連線器共用的連線池與 SQL 操作
///
/// 建立時只組好連線池，第一次查詢才真正連線。
pub struct PostgresCore {
    label: &'static str,
    pool: Pool,
    schema: String,
    closed: AtomicBool,
}

impl PostgresCore {
    pub fn new(label: &'static str, settings: &PostgresSettings) -> Result<Self> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&settings.host)
            .port(settings.port)
            .dbname(&settings.database)
            .user(&settings.user)
            .connect_timeout(CONNECT_TIMEOUT);
        if !settings.password.is_empty() {
            config.password(&settings.password);
        }
        if settings.ssl {
            tracing::warn!(
                "⚠️ {} requested SSL but no TLS backend is bundled; connecting with sslmode=prefer",
                label
            );
            config.ssl_mode(SslMode::Prefer);
        }

        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(MAX_POOL_SIZE)
            .build()
            .map_err(|e| EtlError::ConnectionError {
                message: format!("pool creation failed: {}", e),
            })?;

        Ok(Self {
            label,
            pool,
            schema: settings.schema.clone(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    fn table(&self, name: &str) -> String {
        sql::qualified(&self.schema, name)
    }

    async fn client(&self) -> Result<Object> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EtlError::ConnectorClosed {
                connector: self.label.to_string(),
            });
        }
        Ok(self.pool.get().await?)
    }

    pub async fn test_connection(&self, product: &str) -> ConnectionTestResult {
        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => return ConnectionTestResult::failed(&e),
        };
        match client.query_one("SELECT version()", &[]).await {
            Ok(row) => {
                let version: String = row.get(0);
                ConnectionTestResult::ok(format!("Successfully connected to {}: {}", product, version))
            }
            Err(e) => ConnectionTestResult::failed(&e.into()),
        }
    }

    pub async fn discover(&self) -> Result<Vec<CollectionInfo>> {
        let discovery_error = |e: EtlError| EtlError::DiscoveryError {
            target: "Failed to discover tables".to_string(),
            message: e.to_string(),
        };

        let client = self.client().await.map_err(discovery_error)?;
        let rows = client
            .query(sql::LIST_TABLES, &[&self.schema])
            .await
            .map_err(|e| discovery_error(e.into()))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get(0);
            let schema = self.schema_with(&client, &name).await?;
            let approx_count = client
                .query_opt(sql::APPROX_COUNT, &[&self.schema, &name])
                .await
                .ok()
                .flatten()
                .map(|r| r.get::<_, i64>(0))
                .and_then(|n| u64::try_from(n).ok());
            tables.push(CollectionInfo {
                name,
                kind: "table".to_string(),
                schema: Some(schema),
                approx_count,
            });
        }

        tracing::debug!("🔍 Discovered {} tables in schema {}", tables.len(), self.schema);
        Ok(tables)
    }

    pub async fn get_schema(&self, name: &str) -> Result<TableSchema> {
        let client = self.client().await.map_err(|e| EtlError::DiscoveryError {
            target: format!("Failed to get schema for table {}", name),
            message: e.to_string(),
        })?;
        self.schema_with(&client, name).await
    }

    async fn schema_with(&self, client: &Client, name: &str) -> Result<TableSchema> {
        let schema_error = |message: String| EtlError::DiscoveryError {
            target: format!("Failed to get schema for table {}", name),
            message,
        };

        let rows = client
            .query(sql::LIST_COLUMNS, &[&self.schema, &name])
            .await
            .map_err(|e| schema_error(e.to_string()))?;
        if rows.is_empty() {
            return Err(schema_error("table does not exist".to_string()));
        }

        let columns = rows
            .iter()
            .map(|row| {
                let data_type: String = row.get(1);
                let nullable: String = row.get(2);
                let default: Option<String> = row.get(3);
                let max_length: Option<i64> = row.get(4);
                ColumnInfo {
                    name: row.get(0),
                    column_type: ColumnType::Single(sql::pg_type_to_field(&data_type)),
                    nullable: nullable == "YES",
                    default: default.map(Value::String),
                    max_length: max_length.and_then(|n| u64::try_from(n).ok()),
                }
            })
            .collect();

        // 鍵資訊查不到時以空集合回報
        let primary_keys = client
            .query(sql::PRIMARY_KEYS, &[&self.table(name)])
            .await
            .map(|rows| rows.iter().map(|r| r.get::<_, String>(0)).collect())
            .unwrap_or_default();
        let foreign_keys = client
            .query(sql::FOREIGN_KEYS, &[&name, &self.schema])
            .await
            .map(|rows| {
                rows.iter()
                    .map(|r| ForeignKey {
                        column: r.get(0),
                        foreign_table: r.get(1),
                        foreign_column: r.get(2),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(TableSchema {
            columns,
            primary_keys,
            foreign_keys,
        })
    }

    pub async fn count(&self, name: &str) -> Result<Option<u64>> {
        let client = self.client().await?;
        let row = client
            .query_one(&sql::count_sql(&self.table(name)), &[])
            .await
            .map_err(|e| EtlError::ReadError {
                collection: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(u64::try_from(row.get::<_, i64>(0)).ok())
    }

    pub fn reader<'a>(&'a self, name: &str, options: ReadOptions) -> PostgresReader<'a> {
        PostgresReader {
            core: self,
            table: name.to_string(),
            budget: BatchBudget::new(&options),
            offset: options.offset,
        }
    }

    /// 單一交易內逐筆寫入，每筆包在 SAVEPOINT 中
    pub async fn write_batch(&self, name: &str, records: &[Record], options: &WriteOptions) -> WriteResult {
        if records.is_empty() {
            return WriteResult::from_parts(0, Vec::new());
        }
        match self.write_records(name, records, options).await {
            Ok(result) => result,
            Err(e) => WriteResult::batch_failed(e.to_string()),
        }
    }

    async fn write_records(&self, name: &str, records: &[Record], options: &WriteOptions) -> Result<WriteResult> {
        let client = self.client().await?;
        let target = self.table(name);
        client.batch_execute("BEGIN").await?;

        let mut written = 0;
        let mut errors = Vec::new();
        for (i, record) in records.iter().enumerate() {
            let mut columns: Vec<&str> = record.data.keys().map(String::as_str).collect();
            if columns.is_empty() {
                errors.push(WriteFailure::record(i, "Record has no columns"));
                continue;
            }
            columns.sort_unstable();

            let statement = sql::insert_sql(&target, &columns, options.upsert, &options.conflict_columns);
            let row = Value::Object(record.data.clone().into_iter().collect());
            match write_one(&client, &statement, &row).await {
                Ok(Ok(())) => written += 1,
                Ok(Err(e)) => errors.push(WriteFailure::record(i, e.to_string())),
                Err(e) => {
                    let _ = client.batch_execute("ROLLBACK").await;
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = client.batch_execute("COMMIT").await {
            let _ = client.batch_execute("ROLLBACK").await;
            return Err(e.into());
        }
        Ok(WriteResult::from_parts(written, errors))
    }

    pub async fn create_table(&self, name: &str, schema: &TableSchema) -> Result<CreateTableResult> {
        let client = self.client().await?;
        let statement = sql::create_table_sql(&self.table(name), schema);
        tracing::debug!("📝 {}", statement);

        Ok(match client.batch_execute(&statement).await {
            Ok(()) => CreateTableResult {
                success: true,
                message: format!("Table {} created successfully", name),
            },
            Err(e) => CreateTableResult {
                success: false,
                message: format!("Failed to create table: {}", e),
            },
        })
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close();
            tracing::debug!("🔌 Closed {} connection pool", self.label);
        }
    }
}

/// 外層錯誤代表交易已不可用；內層錯誤只影響這一筆
async fn write_one(
    client: &Client,
    statement: &str,
    row: &Value,
) -> std::result::Result<std::result::Result<(), tokio_postgres::Error>, tokio_postgres::Error> {
    client.batch_execute("SAVEPOINT record_write").await?;
    let params: [&(dyn ToSql + Sync); 1] = [row];
    match client.execute(statement, &params).await {
        Ok(_) => {
            client.batch_execute("RELEASE SAVEPOINT record_write").await?;
            Ok(Ok(()))
        }
        Err(e) => {
            client.batch_execute("ROLLBACK TO SAVEPOINT record_write").await?;
            Ok(Err(e))
        }
    }
}

pub struct PostgresReader<'a> {
    core: &'a PostgresCore,
    table: String,
    budget: BatchBudget,
    offset: usize,
}

impl PostgresReader<'_> {
    fn read_error(&self, message: impl ToString) -> EtlError {
        EtlError::ReadError {
            collection: self.table.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl BatchReader for PostgresReader<'_> {
    async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
        let Some(requested) = self.budget.next_request() else {
            return Ok(None);
        };

        let client = self.core.client().await.map_err(|e| self.read_error(e))?;
        let limit = i64::try_from(requested).map_err(|e| self.read_error(e))?;
        let offset = i64::try_from(self.offset).map_err(|e| self.read_error(e))?;
        let rows = client
            .query(&sql::select_page_sql(&self.core.table(&self.table)), &[&limit, &offset])
            .await
            .map_err(|e| self.read_error(e))?;

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            let value: Value = row.try_get(0).map_err(|e| self.read_error(e))?;
            let record = Record::from_value(value)
                .ok_or_else(|| self.read_error("row is not a JSON object"))?;
            batch.push(record);
        }

        self.offset += batch.len();
        self.budget.record(requested, batch.len());
        Ok(Some(batch))
    }
}

// 轉接層：實作 `Connector` 的具體連線器

pub mod csv_table;
pub mod jsonl;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::config::ConnectionConfig;
use crate::domain::ports::Connector;
use crate::utils::error::{EtlError, Result};
use std::path::{Path, PathBuf};

/// 依連線配置建立連線器；建立時不做任何 I/O
pub fn create_connector(config: &ConnectionConfig) -> Result<Box<dyn Connector>> {
    let connector: Box<dyn Connector> = match config {
        ConnectionConfig::Jsonl(settings) => Box::new(jsonl::JsonlConnector::new(settings)),
        ConnectionConfig::Csv(settings) => Box::new(csv_table::CsvConnector::new(settings)?),
        #[cfg(feature = "postgres")]
        ConnectionConfig::Postgresql(settings) => {
            Box::new(postgres::PostgresConnector::new(settings)?)
        }
        #[cfg(feature = "postgres")]
        ConnectionConfig::Supabase(settings) => {
            Box::new(postgres::SupabaseConnector::new(settings)?)
        }
        #[cfg(not(feature = "postgres"))]
        ConnectionConfig::Postgresql(_) | ConnectionConfig::Supabase(_) => {
            return Err(unavailable(config, "built without the `postgres` feature"))
        }
        ConnectionConfig::FirebaseFirestore(_) | ConnectionConfig::Mongodb(_) => {
            return Err(unavailable(config, "no driver is bundled for this database"))
        }
    };

    tracing::debug!("🔌 Created {} connector", connector.name());
    Ok(connector)
}

fn unavailable(config: &ConnectionConfig, reason: &str) -> EtlError {
    EtlError::ConnectorUnavailable {
        db_type: config.db_type().to_string(),
        reason: reason.to_string(),
    }
}

/// 由未定型的 JSON 建立連線器；未知的 `type` 會在任何 I/O 之前失敗
pub fn connector_from_value(value: &serde_json::Value) -> Result<Box<dyn Connector>> {
    let config = ConnectionConfig::from_value(value)?;
    create_connector(&config)
}

/// 集合名稱對應到目錄中的單一檔案，不允許跳出目錄
pub(crate) fn collection_file(
    directory: &Path,
    name: &str,
    extension: &str,
) -> std::result::Result<PathBuf, String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("Collection name cannot be empty".to_string());
    }
    if trimmed.contains(['/', '\\', '\0']) || trimmed.starts_with('.') {
        return Err(format!("Invalid collection name '{}'", name));
    }
    Ok(directory.join(format!("{}.{}", trimmed, extension)))
}

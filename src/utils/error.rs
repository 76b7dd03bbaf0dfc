use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 單一配置欄位的違規描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigViolation {
    pub field: String,
    pub reason: String,
}

impl ConfigViolation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    PostgresError(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL pool error: {0}")]
    PoolError(#[from] deadpool_postgres::PoolError),

    #[error("Configuration error in '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration field: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid migration configuration ({} violation(s)): {}", violations.len(), join_violations(violations))]
    InvalidConfiguration { violations: Vec<ConfigViolation> },

    #[error("Unsupported database type: {db_type}")]
    UnsupportedDatabase { db_type: String },

    #[error("Connector for '{db_type}' is not available: {reason}")]
    ConnectorUnavailable { db_type: String, reason: String },

    #[error("{operation} is not supported by the {connector} connector")]
    UnsupportedOperation { connector: String, operation: String },

    #[error("Connection failed: {message}")]
    ConnectionError { message: String },

    #[error("{target}: {message}")]
    DiscoveryError { target: String, message: String },

    #[error("Failed to read batch from {collection}: {message}")]
    ReadError { collection: String, message: String },

    #[error("Failed to write to {table}: {message}")]
    WriteError { table: String, message: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Migration cancelled")]
    Cancelled,

    #[error("The {connector} connector has been closed")]
    ConnectorClosed { connector: String },
}

fn join_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// 錯誤分類，對應遷移流程中的錯誤類型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Connectivity,
    Discovery,
    Transformation,
    Write,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EtlError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EtlError::ConfigValidationError { .. }
            | EtlError::InvalidConfigValueError { .. }
            | EtlError::MissingConfigError { .. }
            | EtlError::InvalidConfiguration { .. }
            | EtlError::UnsupportedDatabase { .. }
            | EtlError::ConnectorUnavailable { .. } => ErrorCategory::Configuration,
            EtlError::ConnectionError { .. } => ErrorCategory::Connectivity,
            #[cfg(feature = "postgres")]
            EtlError::PoolError(_) => ErrorCategory::Connectivity,
            EtlError::DiscoveryError { .. } => ErrorCategory::Discovery,
            EtlError::ProcessingError { .. } => ErrorCategory::Transformation,
            EtlError::WriteError { .. } => ErrorCategory::Write,
            _ => ErrorCategory::Fatal,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Transformation => ErrorSeverity::Low,
            ErrorCategory::Connectivity | ErrorCategory::Write => ErrorSeverity::Medium,
            ErrorCategory::Configuration | ErrorCategory::Discovery => ErrorSeverity::High,
            ErrorCategory::Fatal => match self {
                EtlError::Cancelled => ErrorSeverity::Medium,
                _ => ErrorSeverity::Critical,
            },
        }
    }

    /// 配置錯誤永不重試；連線與寫入錯誤可以重試
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connectivity | ErrorCategory::Write
        )
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            EtlError::InvalidConfiguration { .. }
            | EtlError::ConfigValidationError { .. }
            | EtlError::InvalidConfigValueError { .. }
            | EtlError::MissingConfigError { .. } => {
                "Fix the listed configuration fields and run `db-migrate validate` again"
            }
            EtlError::UnsupportedDatabase { .. } => {
                "Use one of: postgresql, supabase, firebase-firestore, mongodb, jsonl, csv"
            }
            EtlError::ConnectorUnavailable { .. } => {
                "Pick a connector compiled into this build, or rebuild with the matching feature"
            }
            EtlError::UnsupportedOperation { .. } => {
                "Disable createTable or pick a destination that supports table creation"
            }
            EtlError::ConnectionError { .. } => {
                "Check host, credentials and network access, then run `db-migrate test`"
            }
            EtlError::DiscoveryError { .. } => {
                "Make sure the collection/table exists and the account can read its metadata"
            }
            EtlError::ReadError { .. } => "Check that the source collection is readable and well-formed",
            EtlError::WriteError { .. } => "Inspect the destination table and the job's error list",
            EtlError::Cancelled => "Re-run the migration; upsert mode avoids duplicate rows",
            EtlError::ConnectorClosed { .. } => "Create a new connector for each migration run",
            _ => "Re-run with --verbose and inspect the logs",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::Connectivity => format!("Could not reach the database: {}", self),
            ErrorCategory::Discovery => format!("Could not inspect the database: {}", self),
            ErrorCategory::Transformation => format!("Record transformation problem: {}", self),
            ErrorCategory::Write => format!("Writing to the destination failed: {}", self),
            ErrorCategory::Fatal => format!("Migration stopped: {}", self),
        }
    }

    /// 將來源錯誤鏈展開成多行文字（作為 job 錯誤的 stack 欄位）
    pub fn source_chain(&self) -> Option<String> {
        let mut lines = Vec::new();
        let mut current = std::error::Error::source(self);
        while let Some(err) = current {
            lines.push(format!("caused by: {}", err));
            current = err.source();
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;

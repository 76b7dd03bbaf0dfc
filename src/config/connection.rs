use crate::utils::error::{EtlError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_path, validate_range, validate_url, ValidationReport,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// 支援的資料庫類型字串（`type` 欄位）
pub const SUPPORTED_TYPES: &[&str] = &[
    "postgresql",
    "supabase",
    "firebase-firestore",
    "mongodb",
    "jsonl",
    "csv",
];

/// 以 `type` 區分的連線配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConnectionConfig {
    #[serde(rename = "postgresql")]
    Postgresql(PostgresSettings),
    #[serde(rename = "supabase")]
    Supabase(SupabaseSettings),
    #[serde(rename = "firebase-firestore")]
    FirebaseFirestore(FirestoreSettings),
    #[serde(rename = "mongodb")]
    Mongodb(MongoSettings),
    #[serde(rename = "jsonl")]
    Jsonl(JsonlSettings),
    #[serde(rename = "csv")]
    Csv(CsvSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresSettings {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_pg_schema")]
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupabaseSettings {
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub ssl: bool,
    #[serde(default = "default_pg_schema")]
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirestoreSettings {
    pub project_id: String,
    #[serde(default)]
    pub service_account: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, rename = "databaseURL")]
    pub database_url: Option<String>,
    #[serde(default)]
    pub storage_bucket: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongoSettings {
    pub connection_string: String,
    pub database: String,
    #[serde(default)]
    pub options: Option<HashMap<String, serde_json::Value>>,
}

/// 目錄中每個 `<collection>.jsonl` 檔案是一個文件集合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonlSettings {
    pub directory: PathBuf,
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

/// 目錄中每個 `<table>.csv` 檔案是一個資料表（第一列為欄位名稱）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvSettings {
    pub directory: PathBuf,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_schema() -> String {
    "public".to_string()
}

fn default_true() -> bool {
    true
}

fn default_id_field() -> String {
    "_id".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

impl ConnectionConfig {
    pub fn db_type(&self) -> &'static str {
        match self {
            ConnectionConfig::Postgresql(_) => "postgresql",
            ConnectionConfig::Supabase(_) => "supabase",
            ConnectionConfig::FirebaseFirestore(_) => "firebase-firestore",
            ConnectionConfig::Mongodb(_) => "mongodb",
            ConnectionConfig::Jsonl(_) => "jsonl",
            ConnectionConfig::Csv(_) => "csv",
        }
    }

    /// 先檢查 `type` 判別字串，再一次回報所有缺少的必填欄位，最後才解析
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Self::check_type("type", value)?;
        let mut report = ValidationReport::new();
        Self::require_fields("connection", value, &mut report);
        report.into_result()?;
        serde_json::from_value(value.clone()).map_err(|e| EtlError::ConfigValidationError {
            field: "connection".to_string(),
            message: e.to_string(),
        })
    }

    /// 各類型解析前必須存在的鍵
    fn required_keys(db_type: &str) -> &'static [&'static str] {
        match db_type {
            "postgresql" => &["host", "database", "user"],
            "firebase-firestore" => &["projectId"],
            "mongodb" => &["connectionString", "database"],
            "jsonl" | "csv" => &["directory"],
            _ => &[],
        }
    }

    /// 呼叫前須已通過 `check_type`
    pub(crate) fn require_fields(prefix: &str, value: &serde_json::Value, report: &mut ValidationReport) {
        let db_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        report.require(prefix, value, Self::required_keys(db_type));
    }

    pub(crate) fn check_type(field: &str, value: &serde_json::Value) -> Result<()> {
        let db_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| EtlError::MissingConfigError {
                field: field.to_string(),
            })?;

        if SUPPORTED_TYPES.contains(&db_type) {
            Ok(())
        } else {
            Err(EtlError::UnsupportedDatabase {
                db_type: db_type.to_string(),
            })
        }
    }

    /// 將違規項目加入報告，欄位名稱以 `prefix` 開頭
    pub fn validate_into(&self, prefix: &str, report: &mut ValidationReport) {
        let field = |name: &str| format!("{}.{}", prefix, name);

        match self {
            ConnectionConfig::Postgresql(pg) => {
                for (name, value) in [
                    ("host", &pg.host),
                    ("database", &pg.database),
                    ("user", &pg.user),
                    ("schema", &pg.schema),
                ] {
                    let f = field(name);
                    report.check(&f, validate_non_empty_string(&f, value));
                }
                let f = field("port");
                report.check(&f, validate_range(&f, pg.port, 1, u16::MAX));
            }
            ConnectionConfig::Supabase(sb) => {
                if let Some(conn) = &sb.connection_string {
                    let f = field("connectionString");
                    report.check(&f, validate_url(&f, conn, &["postgres", "postgresql"]));
                } else {
                    let missing: Vec<&str> = [
                        ("host", &sb.host),
                        ("database", &sb.database),
                        ("user", &sb.user),
                    ]
                    .into_iter()
                    .filter(|(_, v)| v.as_deref().map(str::trim).unwrap_or("").is_empty())
                    .map(|(name, _)| name)
                    .collect();
                    for name in missing {
                        report.push(
                            field(name),
                            "Required when connectionString is not provided",
                        );
                    }
                }
                let f = field("schema");
                report.check(&f, validate_non_empty_string(&f, &sb.schema));
            }
            ConnectionConfig::FirebaseFirestore(fs) => {
                let f = field("projectId");
                report.check(&f, validate_non_empty_string(&f, &fs.project_id));
                if let Some(url) = &fs.database_url {
                    let f = field("databaseURL");
                    report.check(&f, validate_url(&f, url, &["https"]));
                }
            }
            ConnectionConfig::Mongodb(mongo) => {
                let f = field("connectionString");
                report.check(
                    &f,
                    validate_url(&f, &mongo.connection_string, &["mongodb", "mongodb+srv"]),
                );
                let f = field("database");
                report.check(&f, validate_non_empty_string(&f, &mongo.database));
            }
            ConnectionConfig::Jsonl(jsonl) => {
                let f = field("directory");
                report.check(&f, validate_path(&f, &jsonl.directory.to_string_lossy()));
                let f = field("idField");
                report.check(&f, validate_non_empty_string(&f, &jsonl.id_field));
            }
            ConnectionConfig::Csv(csv) => {
                let f = field("directory");
                report.check(&f, validate_path(&f, &csv.directory.to_string_lossy()));
                if csv.delimiter.len() != 1 || !csv.delimiter.is_ascii() {
                    report.push(field("delimiter"), "Delimiter must be a single ASCII character");
                }
            }
        }
    }
}

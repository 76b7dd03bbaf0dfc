use crate::config::connection::ConnectionConfig;
use crate::domain::model::SchemaMapping;
use crate::utils::error::{EtlError, Result};
use crate::utils::validation::{
    validate_field_path, validate_non_empty_string, validate_range, Validate, ValidationReport,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// 批次大小上限
pub const MAX_BATCH_SIZE: usize = 10_000;
/// 寫入重試次數上限
pub const MAX_RETRIES: u32 = 10;

/// 一次遷移的完整配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfig {
    pub source: ConnectionConfig,
    pub destination: ConnectionConfig,
    pub mappings: Vec<SchemaMapping>,
    #[serde(default)]
    pub settings: MigrationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub upsert: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub create_table: bool,
    /// 寫入重試的退避基準（毫秒），每次重試加倍
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 每個 mapping 最多讀取的筆數
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

fn default_batch_size() -> usize {
    100
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            upsert: false,
            dry_run: false,
            retries: default_retries(),
            create_table: false,
            retry_delay_ms: default_retry_delay_ms(),
            limit: None,
        }
    }
}

impl MigrationConfig {
    /// 依副檔名載入：`.json` 走 JSON，其餘視為 TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(EtlError::IoError)?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed = substitute_env_vars(content)?;
        let value: serde_json::Value =
            toml::from_str(&processed).map_err(|e| EtlError::ConfigValidationError {
                field: "toml_parsing".to_string(),
                message: format!("TOML parsing error: {}", e),
            })?;
        Self::from_value(value)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let processed = substitute_env_vars(content)?;
        let value: serde_json::Value =
            serde_json::from_str(&processed).map_err(|e| EtlError::ConfigValidationError {
                field: "json_parsing".to_string(),
                message: format!("JSON parsing error: {}", e),
            })?;
        Self::from_value(value)
    }

    /// 未知的資料庫類型要在解析其餘欄位之前就以名稱回報；
    /// 缺少的必填欄位則全部收集後一起回報
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        for side in ["source", "destination"] {
            let connection = value.get(side).ok_or_else(|| EtlError::MissingConfigError {
                field: side.to_string(),
            })?;
            ConnectionConfig::check_type(&format!("{}.type", side), connection)?;
        }

        let mut report = ValidationReport::new();
        for side in ["source", "destination"] {
            ConnectionConfig::require_fields(side, &value[side], &mut report);
        }
        match value.get("mappings") {
            None | Some(serde_json::Value::Null) => report.push("mappings", "Field is required"),
            Some(serde_json::Value::Array(mappings)) => {
                for (i, mapping) in mappings.iter().enumerate() {
                    require_mapping_fields(i, mapping, &mut report);
                }
            }
            Some(_) => report.push("mappings", "Expected an array of mappings"),
        }
        report.into_result()?;

        serde_json::from_value(value).map_err(|e| EtlError::ConfigValidationError {
            field: "config".to_string(),
            message: e.to_string(),
        })
    }

    pub fn mapping_label(mapping: &SchemaMapping) -> String {
        format!("{} -> {}", mapping.source_collection, mapping.target_table)
    }
}

/// 替換環境變數 (例如 ${DB_PASSWORD})；未設定的變數原樣保留
fn substitute_env_vars(content: &str) -> Result<String> {
    use regex::Regex;
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| EtlError::ConfigValidationError {
        field: "env_substitution".to_string(),
        message: e.to_string(),
    })?;

    let result = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
    });

    Ok(result.to_string())
}

impl Validate for MigrationSettings {
    fn validate(&self) -> Result<()> {
        let mut report = ValidationReport::new();
        self.validate_into(&mut report);
        report.into_result()
    }
}

impl MigrationSettings {
    fn validate_into(&self, report: &mut ValidationReport) {
        report.check(
            "settings.batchSize",
            validate_range("settings.batchSize", self.batch_size, 1, MAX_BATCH_SIZE),
        );
        report.check(
            "settings.retries",
            validate_range("settings.retries", self.retries, 0, MAX_RETRIES),
        );
        if self.limit == Some(0) {
            report.push("settings.limit", "Value must be at least 1");
        }
    }
}

fn require_mapping_fields(index: usize, mapping: &serde_json::Value, report: &mut ValidationReport) {
    let prefix = format!("mappings[{}]", index);
    report.require(&prefix, mapping, &["sourceCollection", "targetTable", "fieldMappings"]);

    if let Some(field_mappings) = mapping.get("fieldMappings").and_then(|f| f.as_array()) {
        for (i, fm) in field_mappings.iter().enumerate() {
            report.require(
                &format!("{}.fieldMappings[{}]", prefix, i),
                fm,
                &["sourceField", "targetField", "sourceType", "targetType"],
            );
        }
    }
}

fn validate_mapping(index: usize, mapping: &SchemaMapping, report: &mut ValidationReport) {
    let prefix = format!("mappings[{}]", index);

    let f = format!("{}.sourceCollection", prefix);
    report.check(&f, validate_non_empty_string(&f, &mapping.source_collection));
    let f = format!("{}.targetTable", prefix);
    report.check(&f, validate_non_empty_string(&f, &mapping.target_table));

    if mapping.field_mappings.is_empty() {
        report.push(
            format!("{}.fieldMappings", prefix),
            "At least one field mapping is required",
        );
    }

    for (i, fm) in mapping.field_mappings.iter().enumerate() {
        let f = format!("{}.fieldMappings[{}].sourceField", prefix, i);
        report.check(&f, validate_field_path(&f, &fm.source_field));
        let f = format!("{}.fieldMappings[{}].targetField", prefix, i);
        report.check(&f, validate_field_path(&f, &fm.target_field));
    }

    // 同一個 mapping 內的目標路徑不可重複，也不可互為前綴（a 與 a.b）
    let targets: Vec<&str> = mapping
        .active_field_mappings()
        .map(|fm| fm.target_field.as_str())
        .collect();
    let mut seen = HashSet::new();
    for (i, target) in targets.iter().enumerate() {
        if !seen.insert(*target) {
            report.push(
                format!("{}.fieldMappings", prefix),
                format!("Duplicate target field '{}'", target),
            );
            continue;
        }
        for other in &targets[i + 1..] {
            if is_path_prefix(target, other) || is_path_prefix(other, target) {
                report.push(
                    format!("{}.fieldMappings", prefix),
                    format!("Target fields '{}' and '{}' conflict", target, other),
                );
            }
        }
    }

    let columns: HashSet<String> = mapping
        .target_columns()
        .into_iter()
        .map(|(column, _)| column)
        .collect();
    for column in &mapping.options.conflict_columns {
        if !columns.contains(column) {
            report.push(
                format!("{}.options.conflictColumns", prefix),
                format!("'{}' is not a target column of this mapping", column),
            );
        }
    }
}

fn is_path_prefix(shorter: &str, longer: &str) -> bool {
    longer.len() > shorter.len()
        && longer.starts_with(shorter)
        && longer.as_bytes()[shorter.len()] == b'.'
}

impl Validate for MigrationConfig {
    /// 一次回報所有違規項目
    fn validate(&self) -> Result<()> {
        let mut report = ValidationReport::new();

        self.source.validate_into("source", &mut report);
        self.destination.validate_into("destination", &mut report);
        self.settings.validate_into(&mut report);

        if self.mappings.is_empty() {
            report.push("mappings", "At least one mapping is required");
        }
        for (i, mapping) in self.mappings.iter().enumerate() {
            validate_mapping(i, mapping, &mut report);
        }

        report.into_result()
    }
}

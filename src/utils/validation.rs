use crate::utils::error::{ConfigViolation, EtlError, Result};
use url::Url;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// 收集所有違規項目，而不是在第一個錯誤就停止
#[derive(Debug, Default)]
pub struct ValidationReport {
    violations: Vec<ConfigViolation>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 記錄單一檢查結果；非配置類錯誤以欄位名稱包裝
    pub fn check(&mut self, field: &str, result: Result<()>) {
        if let Err(e) = result {
            let violation = match e {
                EtlError::InvalidConfigValueError { field, reason, .. } => {
                    ConfigViolation::new(field, reason)
                }
                EtlError::MissingConfigError { field } => {
                    ConfigViolation::new(field, "Field is required")
                }
                EtlError::ConfigValidationError { field, message } => {
                    ConfigViolation::new(field, message)
                }
                EtlError::InvalidConfiguration { violations } => {
                    self.violations.extend(violations);
                    return;
                }
                other => ConfigViolation::new(field, other.to_string()),
            };
            self.violations.push(violation);
        }
    }

    pub fn push(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.violations.push(ConfigViolation::new(field, reason));
    }

    /// 檢查原始配置物件中的必填鍵；缺少或為 null 都算缺少
    pub fn require(&mut self, prefix: &str, value: &serde_json::Value, keys: &[&str]) {
        let Some(object) = value.as_object() else {
            self.push(prefix, "Expected an object");
            return;
        };
        for key in keys {
            if object.get(*key).map_or(true, serde_json::Value::is_null) {
                self.push(format!("{}.{}", prefix, key), "Field is required");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[ConfigViolation] {
        &self.violations
    }

    pub fn into_result(self) -> Result<()> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(EtlError::InvalidConfiguration {
                violations: self.violations,
            })
        }
    }
}

pub fn validate_url(field_name: &str, url_str: &str, allowed_schemes: &[&str]) -> Result<()> {
    if url_str.is_empty() {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: url_str.to_string(),
            reason: "URL cannot be empty".to_string(),
        });
    }

    match Url::parse(url_str) {
        Ok(url) => {
            if allowed_schemes.contains(&url.scheme()) {
                Ok(())
            } else {
                Err(EtlError::InvalidConfigValueError {
                    field: field_name.to_string(),
                    value: redact_url(url_str),
                    reason: format!(
                        "Unsupported URL scheme: {}. Allowed schemes: {}",
                        url.scheme(),
                        allowed_schemes.join(", ")
                    ),
                })
            }
        }
        Err(e) => Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: redact_url(url_str),
            reason: format!("Invalid URL format: {}", e),
        }),
    }
}

/// 連線字串常含密碼，錯誤訊息中只保留 scheme 與主機
fn redact_url(url_str: &str) -> String {
    match Url::parse(url_str) {
        Ok(url) => format!("{}://{}", url.scheme(), url.host_str().unwrap_or("")),
        Err(_) => "<unparseable>".to_string(),
    }
}

pub fn validate_path(field_name: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: path.to_string(),
            reason: "Path cannot be empty".to_string(),
        });
    }

    if path.contains('\0') {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: path.to_string(),
            reason: "Path contains null bytes".to_string(),
        });
    }

    Ok(())
}

/// 檢查點分隔的欄位路徑（例如 `user.profile.name`）
pub fn validate_field_path(field_name: &str, path: &str) -> Result<()> {
    validate_non_empty_string(field_name, path)?;

    if path.split('.').any(|segment| segment.trim().is_empty()) {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: path.to_string(),
            reason: "Field path contains an empty segment".to_string(),
        });
    }

    Ok(())
}

pub fn validate_positive_number(field_name: &str, value: usize, min_value: usize) -> Result<()> {
    if value < min_value {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be at least {}", min_value),
        });
    }
    Ok(())
}

pub fn validate_required_field<'a, T>(field_name: &str, value: &'a Option<T>) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| EtlError::MissingConfigError {
        field: field_name.to_string(),
    })
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: "Value cannot be empty or whitespace-only".to_string(),
        });
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be between {} and {}", min, max),
        });
    }
    Ok(())
}

use crate::domain::model::{FieldMapping, FieldType, Record, SchemaMapping};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// 單一欄位型別轉換失敗的原因
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct CoercionError(String);

impl CoercionError {
    fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// 轉換結果：失敗的型別轉換不會中斷，只留下警告
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutcome {
    pub record: Record,
    pub warnings: Vec<String>,
}

/// 將一筆來源記錄依 mapping 轉成目標記錄
///
/// 純函式：不修改輸入、不做 I/O，相同輸入永遠得到相同輸出。
/// 來源路徑不存在且沒有 `defaultValue` 時，目標欄位不會出現在輸出中。
pub fn transform_record(record: &Record, mapping: &SchemaMapping) -> TransformOutcome {
    let mut output = Map::new();
    let mut warnings = Vec::new();

    for fm in mapping.active_field_mappings() {
        let value = match get_nested_value(record, &fm.source_field)
            .cloned()
            .or_else(|| fm.default_value.clone())
        {
            Some(value) => value,
            None => continue,
        };

        let value = match coerce_value(&value, &fm.source_type, &fm.target_type) {
            Ok(converted) => converted,
            Err(e) => {
                warnings.push(coercion_warning(fm, &e));
                value
            }
        };

        let value = match fm.transform.as_deref() {
            Some(name) => apply_transform(value, name),
            None => value,
        };

        set_nested_value(&mut output, &fm.target_field, value);
    }

    if mapping.options.flatten {
        output = flatten_object(output, mapping.options.prefix.as_deref());
    }

    TransformOutcome {
        record: Record {
            data: output.into_iter().collect(),
        },
        warnings,
    }
}

fn coercion_warning(fm: &FieldMapping, error: &CoercionError) -> String {
    format!(
        "Type conversion failed for '{}': {} -> {} ({})",
        fm.source_field, fm.source_type, fm.target_type, error
    )
}

/// 批次轉換；相同的警告合併成一筆並附上次數
pub fn transform_batch(
    records: &[Record],
    mapping: &SchemaMapping,
) -> (Vec<Record>, BTreeMap<String, usize>) {
    let mut transformed = Vec::with_capacity(records.len());
    let mut warnings: BTreeMap<String, usize> = BTreeMap::new();

    for record in records {
        let outcome = transform_record(record, mapping);
        for warning in outcome.warnings {
            *warnings.entry(warning).or_insert(0) += 1;
        }
        transformed.push(outcome.record);
    }

    (transformed, warnings)
}

/// 以點分隔路徑讀取巢狀值；數字片段可索引陣列
pub fn get_nested_value<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = record.get(first)?;

    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// 以點分隔路徑寫入；中間層不是物件時會被替換成物件
pub fn set_nested_value(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut keys: Vec<&str> = path.split('.').collect();
    let Some(last) = keys.pop() else {
        return;
    };

    let mut current = target;
    for key in keys {
        let slot = current
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }

    current.insert(last.to_string(), value);
}

/// 遞迴攤平：巢狀鍵以底線連接，陣列與日期字串視為葉節點
pub fn flatten_object(map: Map<String, Value>, prefix: Option<&str>) -> Map<String, Value> {
    let mut flattened = Map::new();
    flatten_into(&mut flattened, map, prefix.filter(|p| !p.is_empty()));
    flattened
}

fn flatten_into(out: &mut Map<String, Value>, map: Map<String, Value>, prefix: Option<&str>) {
    for (key, value) in map {
        let new_key = match prefix {
            Some(prefix) => format!("{}_{}", prefix, key),
            None => key,
        };
        match value {
            Value::Object(inner) => flatten_into(out, inner, Some(&new_key)),
            leaf => {
                out.insert(new_key, leaf);
            }
        }
    }
}

/// 型別轉換；來源與目標型別相同或值為 null 時原樣回傳
pub fn coerce_value(
    value: &Value,
    source_type: &FieldType,
    target_type: &FieldType,
) -> Result<Value, CoercionError> {
    if value.is_null() || source_type == target_type {
        return Ok(value.clone());
    }

    match target_type {
        FieldType::String | FieldType::Text | FieldType::Uuid => {
            Ok(Value::String(canonical_text(value)))
        }
        FieldType::Number => to_number(value),
        FieldType::Float => to_float(value),
        FieldType::Integer => to_integer(value),
        FieldType::Boolean => to_boolean(value),
        FieldType::Timestamp => {
            to_datetime(value).map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
        }
        FieldType::Date => to_datetime(value).map(|dt| Value::String(dt.format("%Y-%m-%d").to_string())),
        FieldType::Json => match value {
            Value::String(s) => serde_json::from_str(s)
                .map_err(|e| CoercionError::new(format!("invalid JSON text: {}", e))),
            other => Ok(other.clone()),
        },
        _ => Ok(value.clone()),
    }
}

/// 字串原樣、其他值使用 JSON 文字表示
pub fn canonical_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_numeric_str(s: &str) -> Result<f64, CoercionError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(CoercionError::new("empty string is not a number"));
    }
    match trimmed.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n),
        _ => Err(CoercionError::new("not a numeric string")),
    }
}

fn float_value(n: f64) -> Result<Value, CoercionError> {
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| CoercionError::new("number is not finite"))
}

fn to_number(value: &Value) -> Result<Value, CoercionError> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(i) => Ok(Value::from(i)),
            Err(_) => float_value(parse_numeric_str(s)?),
        },
        _ => Err(CoercionError::new("value has no numeric form")),
    }
}

fn to_float(value: &Value) -> Result<Value, CoercionError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| CoercionError::new("number out of range"))
            .and_then(float_value),
        Value::Bool(b) => float_value(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => float_value(parse_numeric_str(s)?),
        _ => Err(CoercionError::new("value has no numeric form")),
    }
}

fn integral(n: f64) -> Result<Value, CoercionError> {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Ok(Value::from(n as i64))
    } else {
        Err(CoercionError::new("number is not an integer"))
    }
}

fn to_integer(value: &Value) -> Result<Value, CoercionError> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        Value::Number(n) => integral(n.as_f64().unwrap_or(f64::NAN)),
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(i) => Ok(Value::from(i)),
            Err(_) => integral(parse_numeric_str(s)?),
        },
        _ => Err(CoercionError::new("value has no numeric form")),
    }
}

fn to_boolean(value: &Value) -> Result<Value, CoercionError> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false))),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "n" | "off" | "" => Ok(Value::Bool(false)),
            _ => Err(CoercionError::new("not a boolean string")),
        },
        _ => Err(CoercionError::new("value has no boolean form")),
    }
}

/// 接受 RFC 3339、`YYYY-MM-DD HH:MM:SS`、`YYYY-MM-DD` 字串，或毫秒 epoch 數字
fn to_datetime(value: &Value) -> Result<DateTime<Utc>, CoercionError> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Ok(naive.and_utc());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
                .ok_or_else(|| CoercionError::new("unrecognized date format"))
        }
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| CoercionError::new("epoch milliseconds out of range")),
        _ => Err(CoercionError::new("value has no date form")),
    }
}

/// 內建轉換；未知名稱不做任何事，null 保持 null
pub fn apply_transform(value: Value, name: &str) -> Value {
    if value.is_null() {
        return value;
    }
    match name {
        "toLowerCase" => Value::String(canonical_text(&value).to_lowercase()),
        "toUpperCase" => Value::String(canonical_text(&value).to_uppercase()),
        "trim" => Value::String(canonical_text(&value).trim().to_string()),
        _ => value,
    }
}

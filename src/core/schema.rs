use crate::domain::model::{ColumnInfo, ColumnType, FieldType, Record, SchemaMapping, TableSchema};
use chrono::DateTime;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// 文件型來源推斷 schema 時抽樣的筆數；結果僅供參考
pub const SCHEMA_SAMPLE_SIZE: usize = 10;

pub fn infer_field_type(value: &Value) -> FieldType {
    match value {
        Value::Null => FieldType::Null,
        Value::Bool(_) => FieldType::Boolean,
        Value::Number(n) if n.is_i64() || n.is_u64() => FieldType::Integer,
        Value::Number(_) => FieldType::Number,
        Value::String(s) if DateTime::parse_from_rfc3339(s).is_ok() => FieldType::Timestamp,
        Value::String(_) => FieldType::String,
        Value::Array(_) => FieldType::Array,
        Value::Object(_) => FieldType::Object,
    }
}

/// 對樣本取每個欄位型別的聯集
///
/// 欄位在任一樣本中缺少或為 null 時視為 nullable；欄位依名稱排序。
pub fn infer_document_schema(samples: &[Record]) -> TableSchema {
    let mut types: BTreeMap<&str, BTreeSet<FieldType>> = BTreeMap::new();
    let mut seen_in: BTreeMap<&str, usize> = BTreeMap::new();

    for record in samples.iter().take(SCHEMA_SAMPLE_SIZE) {
        for (key, value) in &record.data {
            types
                .entry(key.as_str())
                .or_default()
                .insert(infer_field_type(value));
            *seen_in.entry(key.as_str()).or_insert(0) += 1;
        }
    }

    let sampled = samples.len().min(SCHEMA_SAMPLE_SIZE);
    let columns = types
        .into_iter()
        .map(|(name, set)| {
            let missing_somewhere = seen_in.get(name).copied().unwrap_or(0) < sampled;
            let nullable = missing_somewhere || set.contains(&FieldType::Null);
            ColumnInfo {
                name: name.to_string(),
                column_type: ColumnType::from_set(set),
                nullable,
                default: None,
                max_length: None,
            }
        })
        .collect();

    TableSchema {
        columns,
        primary_keys: Vec::new(),
        foreign_keys: Vec::new(),
    }
}

/// 由 mapping 的目標欄位建立最小 schema（建立資料表用）
///
/// 所有欄位都允許 null；`conflictColumns` 成為主鍵。
pub fn schema_for_mapping(mapping: &SchemaMapping) -> TableSchema {
    let columns = mapping
        .target_columns()
        .into_iter()
        .map(|(name, fm)| ColumnInfo {
            name,
            column_type: ColumnType::Single(fm.target_type.clone()),
            nullable: true,
            default: fm.default_value.clone().filter(|v| !v.is_null()),
            max_length: None,
        })
        .collect();

    TableSchema {
        columns,
        primary_keys: mapping.options.conflict_columns.clone(),
        foreign_keys: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn test_union_of_types_across_samples() {
        let samples = vec![
            record(json!({"id": 1, "age": 30, "name": "Ann"})),
            record(json!({"id": 2, "age": "unknown"})),
        ];

        let schema = infer_document_schema(&samples);
        let age = schema.column("age").unwrap();
        assert_eq!(
            age.column_type,
            ColumnType::Union(vec![FieldType::String, FieldType::Integer])
        );
        assert!(!age.nullable);

        let name = schema.column("name").unwrap();
        assert_eq!(name.column_type, ColumnType::Single(FieldType::String));
        assert!(name.nullable);

        let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["age", "id", "name"]);
    }

    #[test]
    fn test_only_first_samples_are_inspected() {
        let mut samples: Vec<Record> = (0..SCHEMA_SAMPLE_SIZE)
            .map(|i| record(json!({"n": i})))
            .collect();
        samples.push(record(json!({"n": "late", "extra": true})));

        let schema = infer_document_schema(&samples);
        assert_eq!(schema.columns.len(), 1);
        assert_eq!(
            schema.column("n").unwrap().column_type,
            ColumnType::Single(FieldType::Integer)
        );
    }

    #[test]
    fn test_infer_field_type() {
        assert_eq!(infer_field_type(&json!(1.5)), FieldType::Number);
        assert_eq!(infer_field_type(&json!(null)), FieldType::Null);
        assert_eq!(
            infer_field_type(&json!("2024-05-01T10:00:00Z")),
            FieldType::Timestamp
        );
        assert_eq!(infer_field_type(&json!("2024-05-01")), FieldType::String);
        assert_eq!(infer_field_type(&json!({"a": 1})), FieldType::Object);
    }

    #[test]
    fn test_schema_for_mapping_uses_target_columns() {
        let mapping: SchemaMapping = serde_json::from_value(json!({
            "sourceCollection": "users",
            "targetTable": "people",
            "fieldMappings": [
                {"sourceField": "_id", "targetField": "id", "sourceType": "string", "targetType": "uuid"},
                {"sourceField": "profile.age", "targetField": "profile.age", "sourceType": "string", "targetType": "integer", "defaultValue": 0}
            ],
            "options": {"flatten": true, "conflictColumns": ["id"]}
        }))
        .unwrap();

        let schema = schema_for_mapping(&mapping);
        let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "profile_age"]);
        assert_eq!(schema.columns[1].default, Some(json!(0)));
        assert_eq!(schema.primary_keys, vec!["id".to_string()]);
    }
}

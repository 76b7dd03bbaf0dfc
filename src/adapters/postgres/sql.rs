// SQL 文字組裝；識別字一律加雙引號，值一律走參數綁定

use crate::domain::model::{FieldType, TableSchema};
use serde_json::Value;

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// information_schema 的 `data_type` 對應到通用型別；未知型別視為字串
pub fn pg_type_to_field(data_type: &str) -> FieldType {
    match data_type.to_ascii_lowercase().as_str() {
        "character varying" | "varchar" | "text" | "char" | "character" => FieldType::String,
        "integer" | "bigint" | "smallint" | "serial" | "bigserial" => FieldType::Integer,
        "real" | "double precision" => FieldType::Float,
        "numeric" | "decimal" => FieldType::Number,
        "boolean" => FieldType::Boolean,
        "date" => FieldType::Date,
        "timestamp" | "timestamp with time zone" | "timestamp without time zone" => {
            FieldType::Timestamp
        }
        "time" | "time without time zone" | "time with time zone" => {
            FieldType::Other("time".to_string())
        }
        "json" | "jsonb" => FieldType::Json,
        "uuid" => FieldType::Uuid,
        "bytea" => FieldType::Binary,
        "array" => FieldType::Array,
        _ => FieldType::String,
    }
}

pub fn field_type_to_pg(field_type: &FieldType) -> &'static str {
    match field_type {
        FieldType::Integer => "INTEGER",
        FieldType::Number => "NUMERIC",
        FieldType::Float => "REAL",
        FieldType::Boolean => "BOOLEAN",
        FieldType::Date => "DATE",
        FieldType::Timestamp => "TIMESTAMP",
        FieldType::Json | FieldType::Object | FieldType::Array => "JSONB",
        FieldType::Uuid => "UUID",
        FieldType::Binary => "BYTEA",
        _ => "TEXT",
    }
}

/// DEFAULT 子句用的常值
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string().to_uppercase(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'::jsonb", other.to_string().replace('\'', "''")),
    }
}

/// 單筆寫入：整筆記錄以一個 jsonb 參數傳入，由 `jsonb_populate_record` 轉成欄位型別
pub fn insert_sql(
    table: &str,
    columns: &[&str],
    upsert: bool,
    conflict_columns: &[String],
) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "INSERT INTO {table} ({column_list}) SELECT {column_list} FROM jsonb_populate_record(NULL::{table}, $1::jsonb)"
    );

    if upsert && !conflict_columns.is_empty() {
        let conflict = conflict_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = columns
            .iter()
            .filter(|c| !conflict_columns.iter().any(|k| k == *c))
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
            .collect::<Vec<_>>();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({conflict}) DO NOTHING"));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({conflict}) DO UPDATE SET {}",
                updates.join(", ")
            ));
        }
    }

    sql
}

pub fn create_table_sql(table: &str, schema: &TableSchema) -> String {
    let mut definitions: Vec<String> = schema
        .columns
        .iter()
        .map(|column| {
            let mut definition = format!(
                "{} {}",
                quote_ident(&column.name),
                field_type_to_pg(&column.column_type.primary())
            );
            if !column.nullable {
                definition.push_str(" NOT NULL");
            }
            if let Some(default) = &column.default {
                definition.push_str(&format!(" DEFAULT {}", sql_literal(default)));
            }
            definition
        })
        .collect();

    if !schema.primary_keys.is_empty() {
        let keys = schema
            .primary_keys
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>()
            .join(", ");
        definitions.push(format!("PRIMARY KEY ({keys})"));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {table} ({})",
        definitions.join(", ")
    )
}

/// 依第一個欄位排序分頁，每列轉成 jsonb 物件
pub fn select_page_sql(table: &str) -> String {
    format!(
        "SELECT to_jsonb(page) FROM (SELECT * FROM {table} ORDER BY 1 LIMIT $1 OFFSET $2) AS page"
    )
}

pub fn count_sql(table: &str) -> String {
    format!("SELECT COUNT(*) FROM {table}")
}

pub const LIST_TABLES: &str = "SELECT table_name::text FROM information_schema.tables \
     WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name";

pub const LIST_COLUMNS: &str = "SELECT column_name::text, data_type::text, is_nullable::text, \
     column_default::text, character_maximum_length::bigint \
     FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position";

pub const PRIMARY_KEYS: &str = "SELECT a.attname::text FROM pg_index i \
     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
     WHERE i.indrelid = ($1::text)::regclass AND i.indisprimary";

pub const FOREIGN_KEYS: &str = "SELECT kcu.column_name::text, ccu.table_name::text, ccu.column_name::text \
     FROM information_schema.table_constraints AS tc \
     JOIN information_schema.key_column_usage AS kcu \
       ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
     JOIN information_schema.constraint_column_usage AS ccu \
       ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema \
     WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_name = $1 AND tc.table_schema = $2";

pub const APPROX_COUNT: &str = "SELECT c.reltuples::bigint FROM pg_class c \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = $1 AND c.relname = $2";

//! SQL statement helpers for query execution
//!
//! Classification (does the statement return rows, does it already carry a
//! LIMIT) uses sqlparser with the PostgreSQL dialect, with a plain-text
//! fallback for statements the parser rejects. Row and parameter conversion
//! bridges dynamic JSON values and typed PostgreSQL columns.

use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::Row;

/// What execution needs to know about a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementInfo {
    /// SELECT / WITH (anything producing a result set)
    pub row_returning: bool,
    /// Whether the query already carries a LIMIT or FETCH clause
    pub has_limit: bool,
}

/// Classify a statement
pub fn analyze(sql: &str) -> StatementInfo {
    match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => match statements.first() {
            Some(Statement::Query(query)) => StatementInfo {
                row_returning: true,
                has_limit: query.limit.is_some() || query.fetch.is_some(),
            },
            _ => StatementInfo {
                row_returning: false,
                has_limit: false,
            },
        },
        Err(_) => {
            // Parser rejected it; fall back to a prefix check so oddball but
            // valid server syntax still executes.
            let upper = sql.trim_start().to_uppercase();
            StatementInfo {
                row_returning: upper.starts_with("SELECT") || upper.starts_with("WITH"),
                has_limit: upper.contains(" LIMIT "),
            }
        }
    }
}

/// Append a LIMIT to a row-returning statement that lacks one
pub fn apply_row_limit(sql: &str, limit: u32) -> String {
    let trimmed = sql.trim_end().trim_end_matches(';').trim_end();
    format!("{} LIMIT {}", trimmed, limit)
}

/// Description of one result-set column
#[derive(Debug, Clone, Serialize)]
pub struct FieldDescription {
    pub name: String,
    pub type_name: String,
}

/// Convert JSON parameters into SQL parameter values
pub fn json_params(params: &[JsonValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params.iter().map(json_to_sql).collect()
}

fn json_to_sql(value: &JsonValue) -> Box<dyn ToSql + Sync + Send> {
    match value {
        JsonValue::Null => Box::new(Option::<String>::None),
        JsonValue::Bool(b) => Box::new(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Box::new(i)
            } else {
                Box::new(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => Box::new(s.clone()),
        // Arrays and objects bind as json/jsonb
        other => Box::new(other.clone()),
    }
}

/// Convert a result row into a JSON object keyed by column name
pub fn row_to_json(row: &Row) -> JsonValue {
    let mut object = serde_json::Map::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), cell_to_json(row, idx, column.type_()));
    }
    JsonValue::Object(object)
}

fn cell_to_json(row: &Row, idx: usize, ty: &Type) -> JsonValue {
    match *ty {
        Type::BOOL => opt(row.try_get::<_, Option<bool>>(idx)).map_or(JsonValue::Null, JsonValue::Bool),
        Type::INT2 => int(opt(row.try_get::<_, Option<i16>>(idx)).map(i64::from)),
        Type::INT4 => int(opt(row.try_get::<_, Option<i32>>(idx)).map(i64::from)),
        Type::INT8 => int(opt(row.try_get::<_, Option<i64>>(idx))),
        Type::OID => int(opt(row.try_get::<_, Option<u32>>(idx)).map(i64::from)),
        Type::FLOAT4 => float(opt(row.try_get::<_, Option<f32>>(idx)).map(f64::from)),
        Type::FLOAT8 => float(opt(row.try_get::<_, Option<f64>>(idx))),
        Type::NUMERIC => opt(row.try_get::<_, Option<rust_decimal::Decimal>>(idx))
            .map_or(JsonValue::Null, |d| JsonValue::String(d.to_string())),
        Type::TIMESTAMP => opt(row.try_get::<_, Option<chrono::NaiveDateTime>>(idx))
            .map_or(JsonValue::Null, |t| JsonValue::String(t.to_string())),
        Type::TIMESTAMPTZ => opt(row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx))
            .map_or(JsonValue::Null, |t| JsonValue::String(t.to_rfc3339())),
        Type::DATE => opt(row.try_get::<_, Option<chrono::NaiveDate>>(idx))
            .map_or(JsonValue::Null, |d| JsonValue::String(d.to_string())),
        Type::UUID => opt(row.try_get::<_, Option<uuid::Uuid>>(idx))
            .map_or(JsonValue::Null, |u| JsonValue::String(u.to_string())),
        Type::JSON | Type::JSONB => {
            opt(row.try_get::<_, Option<JsonValue>>(idx)).unwrap_or(JsonValue::Null)
        }
        Type::BYTEA => opt(row.try_get::<_, Option<Vec<u8>>>(idx)).map_or(JsonValue::Null, |b| {
            let mut hex = String::with_capacity(2 + b.len() * 2);
            hex.push_str("\\x");
            for byte in b {
                hex.push_str(&format!("{:02x}", byte));
            }
            JsonValue::String(hex)
        }),
        // TEXT, VARCHAR, NAME, LSN casts and everything else textual
        _ => opt(row.try_get::<_, Option<String>>(idx)).map_or(JsonValue::Null, JsonValue::String),
    }
}

fn opt<T>(value: Result<Option<T>, tokio_postgres::Error>) -> Option<T> {
    value.ok().flatten()
}

fn int(value: Option<i64>) -> JsonValue {
    value.map_or(JsonValue::Null, |i| JsonValue::Number(i.into()))
}

fn float(value: Option<f64>) -> JsonValue {
    value
        .and_then(serde_json::Number::from_f64)
        .map_or(JsonValue::Null, JsonValue::Number)
}

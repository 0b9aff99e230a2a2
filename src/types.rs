//! MySQL 컬럼 타입 -> 정규 타입 매핑과 값 변환
//!
//! 같은 컬럼이라도 값이 binlog(`CellValue`)로 오는지, 쿼리 결과(`mysql_async::Value`)로
//! 오는지에 따라 표현이 다르므로 두 경로 모두 정규 타입 기준으로 JSON 값을 만듭니다.

use crate::catalog::ColumnSchema;
use crate::events::CellValue;
use chrono::{NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use mysql_async::consts::{ColumnFlags, ColumnType as WireType};
use mysql_async::{Column, Row, Value as SqlValue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};

/// binary 문자셋 번호
const BINARY_CHARSET: u16 = 63;

/// 정규 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Binary,
    Json,
    /// 매핑할 수 없는 타입 (레코드와 스키마에서 제외)
    Unsupported,
}

impl CanonicalType {
    pub fn is_supported(&self) -> bool {
        *self != CanonicalType::Unsupported
    }

    /// JSON Schema 조각
    pub fn json_schema(&self, nullable: bool) -> Value {
        let (type_name, format) = match self {
            CanonicalType::String | CanonicalType::Binary => ("string", None),
            CanonicalType::Integer => ("integer", None),
            CanonicalType::Float => ("number", None),
            CanonicalType::Boolean => ("boolean", None),
            CanonicalType::Timestamp => ("string", Some("date-time")),
            CanonicalType::Json | CanonicalType::Unsupported => return json!({}),
        };

        let mut schema = if nullable {
            json!({ "type": ["null", type_name] })
        } else {
            json!({ "type": type_name })
        };
        if let Some(format) = format {
            schema["format"] = json!(format);
        }
        schema
    }
}

/// INFORMATION_SCHEMA의 DATA_TYPE / COLUMN_TYPE으로 정규 타입 결정
pub fn canonical_type(data_type: &str, column_type: &str) -> CanonicalType {
    let data_type = data_type.to_ascii_lowercase();
    let column_type = column_type.to_ascii_lowercase();

    match data_type.as_str() {
        "tinyint" if column_type.starts_with("tinyint(1)") => CanonicalType::Boolean,
        "bool" | "boolean" => CanonicalType::Boolean,
        "bit" if column_type == "bit(1)" => CanonicalType::Boolean,
        "bit" => CanonicalType::Binary,
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => {
            CanonicalType::Integer
        }
        "float" | "double" | "double precision" | "real" | "decimal" | "numeric" => {
            CanonicalType::Float
        }
        "date" | "datetime" | "timestamp" => CanonicalType::Timestamp,
        "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" | "time"
        | "enum" | "set" => CanonicalType::String,
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" | "geometry"
        | "point" | "linestring" | "polygon" | "multipoint" | "multilinestring"
        | "multipolygon" | "geometrycollection" | "geomcollection" => CanonicalType::Binary,
        "json" => CanonicalType::Json,
        _ => CanonicalType::Unsupported,
    }
}

/// 결과셋 컬럼 메타데이터로 정규 타입 추론 (커스텀 쿼리용)
pub fn canonical_from_column(column: &Column) -> CanonicalType {
    let binary = column.character_set() == BINARY_CHARSET;
    match column.column_type() {
        WireType::MYSQL_TYPE_TINY if column.column_length() == 1 => CanonicalType::Boolean,
        WireType::MYSQL_TYPE_TINY
        | WireType::MYSQL_TYPE_SHORT
        | WireType::MYSQL_TYPE_INT24
        | WireType::MYSQL_TYPE_LONG
        | WireType::MYSQL_TYPE_LONGLONG
        | WireType::MYSQL_TYPE_YEAR => CanonicalType::Integer,
        WireType::MYSQL_TYPE_FLOAT
        | WireType::MYSQL_TYPE_DOUBLE
        | WireType::MYSQL_TYPE_DECIMAL
        | WireType::MYSQL_TYPE_NEWDECIMAL => CanonicalType::Float,
        WireType::MYSQL_TYPE_DATE
        | WireType::MYSQL_TYPE_NEWDATE
        | WireType::MYSQL_TYPE_DATETIME
        | WireType::MYSQL_TYPE_DATETIME2
        | WireType::MYSQL_TYPE_TIMESTAMP
        | WireType::MYSQL_TYPE_TIMESTAMP2 => CanonicalType::Timestamp,
        WireType::MYSQL_TYPE_TIME | WireType::MYSQL_TYPE_TIME2 => CanonicalType::String,
        WireType::MYSQL_TYPE_BIT if column.column_length() == 1 => CanonicalType::Boolean,
        WireType::MYSQL_TYPE_BIT | WireType::MYSQL_TYPE_GEOMETRY => CanonicalType::Binary,
        WireType::MYSQL_TYPE_JSON => CanonicalType::Json,
        WireType::MYSQL_TYPE_ENUM | WireType::MYSQL_TYPE_SET => CanonicalType::String,
        WireType::MYSQL_TYPE_VARCHAR
        | WireType::MYSQL_TYPE_VAR_STRING
        | WireType::MYSQL_TYPE_STRING
        | WireType::MYSQL_TYPE_TINY_BLOB
        | WireType::MYSQL_TYPE_BLOB
        | WireType::MYSQL_TYPE_MEDIUM_BLOB
        | WireType::MYSQL_TYPE_LONG_BLOB => {
            if binary && column.flags().contains(ColumnFlags::BINARY_FLAG) {
                CanonicalType::Binary
            } else {
                CanonicalType::String
            }
        }
        _ => CanonicalType::String,
    }
}

/// `enum('a','b')` / `set('x','y')` 정의에서 값 목록 추출
pub fn parse_enum_values(column_type: &str) -> Vec<String> {
    let body = match (column_type.find('('), column_type.rfind(')')) {
        (Some(start), Some(end)) if end > start => &column_type[start + 1..end],
        _ => return Vec::new(),
    };

    let mut values = Vec::new();
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        let mut value = String::new();
        while let Some(c) = chars.next() {
            if c == '\'' {
                // '' 는 작은따옴표 하나
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    value.push('\'');
                    continue;
                }
                break;
            }
            value.push(c);
        }
        values.push(value);
    }
    values
}

fn is_unsigned(column: &ColumnSchema) -> bool {
    column.column_type.contains("unsigned")
}

fn float_json(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn format_datetime(naive: NaiveDateTime) -> String {
    Utc.from_utc_datetime(&naive)
        .to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn datetime_json(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
) -> Value {
    // 0000-00-00 같은 zero date는 null
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|d| d.and_hms_micro_opt(hour as u32, minute as u32, second as u32, micros))
        .map(|dt| Value::String(format_datetime(dt)))
        .unwrap_or(Value::Null)
}

fn time_string(negative: bool, hours: u32, minutes: u8, seconds: u8, micros: u32) -> String {
    let sign = if negative { "-" } else { "" };
    if micros > 0 {
        format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, minutes, seconds, micros)
    } else {
        format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds)
    }
}

/// 텍스트 날짜/시각을 RFC3339로 (text protocol 또는 문자열 결과)
fn parse_text_datetime(text: &str) -> Value {
    let text = text.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Value::String(format_datetime(dt));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Value::String(format_datetime(dt));
        }
    }
    Value::Null
}

/// binlog 셀 값 -> JSON
pub fn cell_to_json(cell: &CellValue, column: &ColumnSchema) -> Value {
    let canonical = column.canonical;
    match cell {
        CellValue::Null => Value::Null,
        CellValue::SignedInt(v) => {
            if canonical == CanonicalType::Boolean {
                return Value::Bool(*v != 0);
            }
            if is_unsigned(column) {
                let unsigned = match column.data_type.as_str() {
                    "tinyint" => *v as u8 as u64,
                    "smallint" => *v as u16 as u64,
                    "mediumint" => (*v as u32 & 0x00FF_FFFF) as u64,
                    "int" | "integer" => *v as u32 as u64,
                    _ => *v as u64,
                };
                return json!(unsigned);
            }
            json!(*v)
        }
        CellValue::Float(v) => float_json(*v as f64),
        CellValue::Double(v) => float_json(*v),
        CellValue::Decimal(s) => match s.parse::<f64>() {
            Ok(v) if canonical == CanonicalType::Float => float_json(v),
            _ => Value::String(s.clone()),
        },
        CellValue::String(s) => match canonical {
            CanonicalType::Binary => Value::String(hex::encode(s.as_bytes())),
            _ => Value::String(s.clone()),
        },
        CellValue::Bytes(bytes) => match canonical {
            CanonicalType::Binary => Value::String(hex::encode(bytes)),
            CanonicalType::Json => serde_json::from_slice(bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
            _ => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        },
        CellValue::Date { year, month, day } => datetime_json(*year, *month, *day, 0, 0, 0, 0),
        CellValue::DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            micros,
        } => datetime_json(*year, *month, *day, *hour, *minute, *second, *micros),
        CellValue::Timestamp { seconds, micros } => {
            if *seconds == 0 && *micros == 0 {
                return Value::Null;
            }
            Utc.timestamp_opt(*seconds as i64, micros * 1000)
                .single()
                .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
                .unwrap_or(Value::Null)
        }
        CellValue::Time {
            negative,
            hours,
            minutes,
            seconds,
            micros,
        } => Value::String(time_string(*negative, *hours, *minutes, *seconds, *micros)),
        CellValue::Year(y) => json!(*y),
        CellValue::Json(v) => v.clone(),
        CellValue::Enum(index) => {
            if *index == 0 {
                return Value::String(String::new());
            }
            let values = parse_enum_values(&column.column_type);
            values
                .get(*index as usize - 1)
                .map(|v| Value::String(v.clone()))
                .unwrap_or_else(|| json!(*index))
        }
        CellValue::Set(mask) => {
            let values = parse_enum_values(&column.column_type);
            let members: Vec<&str> = values
                .iter()
                .enumerate()
                .filter(|(i, _)| *i < 64 && mask & (1u64 << i) != 0)
                .map(|(_, v)| v.as_str())
                .collect();
            Value::String(members.join(","))
        }
        CellValue::Bit(bytes) => {
            if canonical == CanonicalType::Boolean {
                Value::Bool(bytes.iter().any(|b| *b != 0))
            } else {
                Value::String(hex::encode(bytes))
            }
        }
    }
}

/// 쿼리 결과 값 -> JSON
pub fn sql_value_to_json(value: &SqlValue, canonical: CanonicalType) -> Value {
    match value {
        SqlValue::NULL => Value::Null,
        SqlValue::Int(v) => match canonical {
            CanonicalType::Boolean => Value::Bool(*v != 0),
            _ => json!(*v),
        },
        SqlValue::UInt(v) => match canonical {
            CanonicalType::Boolean => Value::Bool(*v != 0),
            _ => json!(*v),
        },
        SqlValue::Float(v) => float_json(*v as f64),
        SqlValue::Double(v) => float_json(*v),
        SqlValue::Bytes(bytes) => bytes_to_json(bytes, canonical),
        SqlValue::Date(year, month, day, hour, minute, second, micros) => {
            datetime_json(*year, *month, *day, *hour, *minute, *second, *micros)
        }
        SqlValue::Time(negative, days, hours, minutes, seconds, micros) => Value::String(
            time_string(*negative, days * 24 + *hours as u32, *minutes, *seconds, *micros),
        ),
    }
}

fn bytes_to_json(bytes: &[u8], canonical: CanonicalType) -> Value {
    let text = || String::from_utf8_lossy(bytes).into_owned();
    match canonical {
        CanonicalType::Binary => Value::String(hex::encode(bytes)),
        CanonicalType::Integer => {
            let s = text();
            s.parse::<i64>()
                .map(|v| json!(v))
                .or_else(|_| s.parse::<u64>().map(|v| json!(v)))
                .unwrap_or(Value::String(s))
        }
        CanonicalType::Float => {
            let s = text();
            s.parse::<f64>().map(float_json).unwrap_or(Value::String(s))
        }
        CanonicalType::Boolean => match bytes {
            b"0" => Value::Bool(false),
            b"1" => Value::Bool(true),
            other => Value::Bool(other.iter().any(|b| *b != 0)),
        },
        CanonicalType::Timestamp => parse_text_datetime(&text()),
        CanonicalType::Json => serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(text())),
        CanonicalType::String | CanonicalType::Unsupported => Value::String(text()),
    }
}

/// 쿼리 결과 행 -> 레코드. `columns`는 SELECT 목록 순서와 같아야 함
pub fn row_to_record(row: &Row, columns: &[&ColumnSchema]) -> Map<String, Value> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let value = row
                .as_ref(idx)
                .map(|v| sql_value_to_json(v, column.canonical))
                .unwrap_or(Value::Null);
            (column.name.clone(), value)
        })
        .collect()
}

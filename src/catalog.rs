//! 카탈로그 생성 (discovery)
//!
//! INFORMATION_SCHEMA를 조회해 테이블/뷰마다 스트림 하나를 만듭니다.
//! 한 테이블의 컬럼 조회가 실패해도 전체 discovery는 계속되고, 그 스트림만
//! `discoverable = false`로 표시됩니다.

use crate::config::TapConfig;
use crate::connection::{ColumnInfo, ConnectionPool, TableInfo};
use crate::error::{CdcError, Result};
use crate::planner::ReplicationMethod;
use crate::types::{canonical_type, CanonicalType};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use tracing::{info, warn};

/// 로그 기반 스트림의 삭제 표시 컬럼
pub const DELETED_AT_COLUMN: &str = "_sdc_deleted_at";

/// 컬럼 정의
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub column_type: String,
    pub nullable: bool,
    pub canonical: CanonicalType,
}

impl ColumnSchema {
    pub fn from_info(info: &ColumnInfo) -> Self {
        ColumnSchema {
            name: info.name.clone(),
            data_type: info.data_type.clone(),
            column_type: info.column_type.clone(),
            nullable: info.nullable,
            canonical: canonical_type(&info.data_type, &info.column_type),
        }
    }
}

/// 사용자 선택 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    #[serde(default)]
    pub selected: bool,
    pub replication_method: ReplicationMethod,
    #[serde(default)]
    pub replication_key: Option<String>,
    /// 내보낼 컬럼 (None이면 지원되는 모든 컬럼)
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

/// 카탈로그의 스트림 하나
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub tap_stream_id: String,
    pub database: String,
    pub table_name: String,
    #[serde(default)]
    pub is_view: bool,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub key_properties: Vec<String>,
    #[serde(default)]
    pub unique_keys: Vec<String>,
    pub selection: Selection,
    #[serde(default = "default_true")]
    pub discoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undiscoverable_reason: Option<String>,
}

/// 스트림 ID (schema-table)
pub fn stream_id(database: &str, table: &str) -> String {
    format!("{}-{}", database, table)
}

impl CatalogEntry {
    /// 컬럼 조회 결과로 컬럼 목록과 키 후보를 다시 계산 (선택 정보는 유지)
    pub fn apply_columns(&mut self, infos: &[ColumnInfo]) {
        self.columns = infos.iter().map(ColumnSchema::from_info).collect();
        self.key_properties = infos
            .iter()
            .filter(|c| c.column_key == "PRI")
            .map(|c| c.name.clone())
            .collect();
        self.unique_keys = infos
            .iter()
            .filter(|c| c.column_key == "UNI")
            .map(|c| c.name.clone())
            .collect();

        for column in self.columns.iter().filter(|c| !c.canonical.is_supported()) {
            warn!(
                stream = %self.tap_stream_id,
                "Column {} has unsupported type {}, excluded",
                column.name,
                column.column_type
            );
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// 레코드에 포함되는 컬럼인지. 키 컬럼은 항상 포함.
    pub fn is_column_selected(&self, name: &str) -> bool {
        let supported = self
            .column(name)
            .map(|c| c.canonical.is_supported())
            .unwrap_or(false);
        if !supported {
            return false;
        }
        if self.key_properties.iter().any(|k| k == name)
            || self.selection.replication_key.as_deref() == Some(name)
        {
            return true;
        }
        match &self.selection.columns {
            Some(allowed) => allowed.iter().any(|c| c == name),
            None => true,
        }
    }

    pub fn selected_columns(&self) -> Vec<&ColumnSchema> {
        self.columns
            .iter()
            .filter(|c| self.is_column_selected(&c.name))
            .collect()
    }

    /// 스트림의 JSON Schema
    pub fn json_schema(&self, with_deleted_at: bool) -> Value {
        let identity = crate::planner::row_identity(self).unwrap_or_default();
        let mut properties = Map::new();
        for column in self.selected_columns() {
            let nullable = column.nullable && !identity.contains(&column.name);
            properties.insert(column.name.clone(), column.canonical.json_schema(nullable));
        }
        if with_deleted_at {
            properties.insert(
                DELETED_AT_COLUMN.to_string(),
                CanonicalType::Timestamp.json_schema(true),
            );
        }
        json!({ "type": "object", "properties": properties })
    }

    /// 북마크에 기록되는 속성
    pub fn bookmark_properties(&self) -> Vec<String> {
        match (&self.selection.replication_method, &self.selection.replication_key) {
            (ReplicationMethod::Incremental, Some(key)) => vec![key.clone()],
            _ => Vec::new(),
        }
    }
}

/// 새 스트림의 기본 선택값
#[derive(Debug, Clone, Copy)]
pub struct CatalogDefaults {
    pub replication_method: ReplicationMethod,
    pub select_all: bool,
}

impl CatalogDefaults {
    pub fn from_config(config: &TapConfig) -> Self {
        CatalogDefaults {
            replication_method: config.default_method(),
            select_all: config.select_all,
        }
    }
}

/// 테이블 하나의 조회 결과로 카탈로그 항목 생성
pub fn build_entry(
    table: &TableInfo,
    columns: Result<Vec<ColumnInfo>>,
    defaults: CatalogDefaults,
) -> CatalogEntry {
    let mut entry = CatalogEntry {
        tap_stream_id: stream_id(&table.database, &table.table),
        database: table.database.clone(),
        table_name: table.table.clone(),
        is_view: table.is_view,
        columns: Vec::new(),
        key_properties: Vec::new(),
        unique_keys: Vec::new(),
        selection: Selection {
            selected: defaults.select_all,
            replication_method: defaults.replication_method,
            replication_key: None,
            columns: None,
        },
        discoverable: true,
        undiscoverable_reason: None,
    };

    match columns {
        Ok(infos) if infos.is_empty() => {
            entry.discoverable = false;
            entry.undiscoverable_reason = Some("no visible columns".to_string());
            warn!(stream = %entry.tap_stream_id, "No visible columns, marked undiscoverable");
        }
        Ok(infos) => entry.apply_columns(&infos),
        Err(e) => {
            let err = CdcError::SchemaIntrospectionError {
                stream: entry.tap_stream_id.clone(),
                message: e.to_string(),
            };
            warn!(stream = %entry.tap_stream_id, "{}", err);
            entry.discoverable = false;
            entry.undiscoverable_reason = Some(e.to_string());
        }
    }
    entry
}

/// 카탈로그 문서
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CdcError::ConfigError(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| CdcError::ConfigError(format!("invalid catalog: {}", e)))
    }

    pub fn get(&self, stream: &str) -> Option<&CatalogEntry> {
        self.streams.iter().find(|s| s.tap_stream_id == stream)
    }

    /// discovery 출력 문서 (각 스트림에 JSON Schema 포함)
    pub fn to_document(&self) -> Result<Value> {
        let mut streams = Vec::with_capacity(self.streams.len());
        for entry in &self.streams {
            let mut value = serde_json::to_value(entry)?;
            let with_deleted_at = entry.selection.replication_method == ReplicationMethod::LogBased;
            value["schema"] = entry.json_schema(with_deleted_at);
            streams.push(value);
        }
        Ok(json!({ "streams": streams }))
    }
}

/// 서버를 조회해 카탈로그 생성
pub async fn discover(pool: &ConnectionPool, config: &TapConfig) -> Result<Catalog> {
    let tables = pool.list_tables(config.filter_dbs.as_deref()).await?;
    let defaults = CatalogDefaults::from_config(config);
    info!("Discovering {} tables", tables.len());

    let streams: Vec<CatalogEntry> = stream::iter(tables)
        .map(|table| async move {
            let columns = pool.get_table_schema(&table.database, &table.table).await;
            build_entry(&table, columns, defaults)
        })
        .buffered(config.pool_size)
        .collect()
        .await;

    let broken = streams.iter().filter(|s| !s.discoverable).count();
    if broken > 0 {
        warn!("{} streams could not be discovered", broken);
    }
    Ok(Catalog { streams })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn column_info(name: &str, data_type: &str, column_type: &str, key: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            column_type: column_type.to_string(),
            nullable: key.is_empty(),
            column_key: key.to_string(),
        }
    }

    /// id(PK), status, amount, updated_at 컬럼을 가진 테이블
    pub(crate) fn sample_entry(database: &str, table: &str) -> CatalogEntry {
        let info = TableInfo {
            database: database.to_string(),
            table: table.to_string(),
            is_view: false,
        };
        let columns = vec![
            column_info("id", "int", "int", "PRI"),
            column_info("status", "varchar", "varchar(32)", ""),
            column_info("amount", "decimal", "decimal(10,2)", ""),
            column_info("updated_at", "datetime", "datetime", ""),
        ];
        build_entry(
            &info,
            Ok(columns),
            CatalogDefaults {
                replication_method: ReplicationMethod::FullTable,
                select_all: false,
            },
        )
    }

    #[test]
    fn test_build_entry_keys_and_types() {
        let entry = sample_entry("shop", "orders");
        assert_eq!(entry.tap_stream_id, "shop-orders");
        assert_eq!(entry.key_properties, vec!["id".to_string()]);
        assert!(entry.discoverable);
        assert!(!entry.selection.selected);
        assert_eq!(entry.column("amount").unwrap().canonical, CanonicalType::Float);
    }

    #[test]
    fn test_failed_introspection_marks_undiscoverable() {
        let info = TableInfo {
            database: "shop".to_string(),
            table: "secret".to_string(),
            is_view: false,
        };
        let entry = build_entry(
            &info,
            Err(CdcError::QueryError("denied".to_string())),
            CatalogDefaults {
                replication_method: ReplicationMethod::LogBased,
                select_all: true,
            },
        );
        assert!(!entry.discoverable);
        assert!(entry.undiscoverable_reason.unwrap().contains("denied"));
        assert_eq!(entry.selection.replication_method, ReplicationMethod::LogBased);

        let empty = build_entry(
            &info,
            Ok(Vec::new()),
            CatalogDefaults {
                replication_method: ReplicationMethod::FullTable,
                select_all: false,
            },
        );
        assert!(!empty.discoverable);
    }

    #[test]
    fn test_unique_key_candidates_and_unsupported_columns() {
        let info = TableInfo {
            database: "shop".to_string(),
            table: "items".to_string(),
            is_view: false,
        };
        let entry = build_entry(
            &info,
            Ok(vec![
                column_info("sku", "varchar", "varchar(16)", "UNI"),
                column_info("embedding", "vector", "vector(3)", ""),
            ]),
            CatalogDefaults {
                replication_method: ReplicationMethod::FullTable,
                select_all: false,
            },
        );
        assert!(entry.key_properties.is_empty());
        assert_eq!(entry.unique_keys, vec!["sku".to_string()]);
        assert!(!entry.is_column_selected("embedding"));
        assert_eq!(entry.selected_columns().len(), 1);
        assert_eq!(
            crate::planner::row_identity(&entry),
            Some(vec!["sku".to_string()])
        );
        assert_eq!(entry.json_schema(false)["properties"]["sku"], json!({"type": "string"}));
    }

    #[test]
    fn test_nullable_unique_key_stays_nullable() {
        let info = TableInfo {
            database: "shop".to_string(),
            table: "items".to_string(),
            is_view: false,
        };
        let mut sku = column_info("sku", "varchar", "varchar(16)", "UNI");
        sku.nullable = true;
        let entry = build_entry(
            &info,
            Ok(vec![sku]),
            CatalogDefaults {
                replication_method: ReplicationMethod::LogBased,
                select_all: true,
            },
        );
        assert_eq!(entry.unique_keys, vec!["sku".to_string()]);
        assert!(crate::planner::row_identity(&entry).is_none());
        assert_eq!(
            entry.json_schema(false)["properties"]["sku"],
            json!({"type": ["null", "string"]})
        );
    }

    #[test]
    fn test_column_allow_list_keeps_keys() {
        let mut entry = sample_entry("shop", "orders");
        entry.selection.columns = Some(vec!["status".to_string()]);
        let names: Vec<&str> = entry
            .selected_columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["id", "status"]);
    }

    #[test]
    fn test_json_schema() {
        let entry = sample_entry("shop", "orders");
        let schema = entry.json_schema(true);
        assert_eq!(schema["properties"]["id"], json!({"type": "integer"}));
        assert_eq!(
            schema["properties"]["updated_at"]["format"],
            json!("date-time")
        );
        assert_eq!(
            schema["properties"][DELETED_AT_COLUMN]["type"],
            json!(["null", "string"])
        );
        assert!(entry.json_schema(false)["properties"]
            .get(DELETED_AT_COLUMN)
            .is_none());
    }

    #[test]
    fn test_catalog_document_round_trip() {
        let catalog = Catalog {
            streams: vec![sample_entry("shop", "orders")],
        };
        let document = catalog.to_document().unwrap();
        assert_eq!(document["streams"][0]["tap_stream_id"], json!("shop-orders"));
        assert!(document["streams"][0]["schema"]["properties"].is_object());

        let parsed = Catalog::from_json(&document.to_string()).unwrap();
        assert_eq!(parsed, catalog);
    }
}

//! 스트림별 복제 방식 결정
//!
//! 선택된 스트림마다 복제 방식의 전제 조건을 확인하고, 충족하지 못하면
//! `FULL_TABLE`로 낮추면서 경고를 남깁니다. `LOG_BASED` 스트림은 모두 하나의
//! 로그 커서를 공유하는 `LogGroup`으로 묶입니다.

use crate::catalog::{Catalog, CatalogEntry};
use crate::connection::BinaryLogFile;
use crate::offset::StateDocument;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// 복제 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMethod {
    FullTable,
    Incremental,
    LogBased,
}

impl fmt::Display for ReplicationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicationMethod::FullTable => "FULL_TABLE",
            ReplicationMethod::Incremental => "INCREMENTAL",
            ReplicationMethod::LogBased => "LOG_BASED",
        };
        f.write_str(name)
    }
}

/// 서버의 binlog 설정
#[derive(Debug, Clone, Default)]
pub struct LogCapabilities {
    pub log_bin: bool,
    pub binlog_format: String,
    pub binlog_row_image: String,
    pub retained_logs: Vec<BinaryLogFile>,
}

/// 스트림에 귀속되는 경고
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanWarning {
    pub stream: String,
    pub message: String,
}

/// 실행할 스트림 하나
#[derive(Debug, Clone)]
pub struct PlannedStream {
    pub entry: CatalogEntry,
    pub method: ReplicationMethod,
    /// 행 식별 키 (LOG_BASED) 또는 primary key
    pub key_columns: Vec<String>,
}

impl PlannedStream {
    pub fn stream_id(&self) -> &str {
        &self.entry.tap_stream_id
    }
}

/// 공유 로그 커서를 쓰는 스트림 묶음
#[derive(Debug, Clone, Default)]
pub struct LogGroup {
    pub streams: Vec<PlannedStream>,
}

impl LogGroup {
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    /// FULL_TABLE / INCREMENTAL 스트림 (카탈로그 순서)
    pub table_passes: Vec<PlannedStream>,
    pub log_group: LogGroup,
    /// 복제 방식이나 키가 바뀌어 북마크를 비워야 하는 스트림
    pub bookmark_resets: Vec<String>,
    pub warnings: Vec<PlanWarning>,
}

/// 행을 식별할 키: primary key, 없으면 NOT NULL인 단일 unique key 후보
///
/// NULL을 허용하는 unique 컬럼은 NULL 행이 여럿일 수 있어 키가 될 수 없음
pub fn row_identity(entry: &CatalogEntry) -> Option<Vec<String>> {
    if !entry.key_properties.is_empty() {
        return Some(entry.key_properties.clone());
    }
    match entry.unique_keys.as_slice() {
        [single] if entry.column(single).map_or(false, |c| !c.nullable) => {
            Some(vec![single.clone()])
        }
        _ => None,
    }
}

/// LOG_BASED 전제 조건. 통과하면 경고 목록, 실패하면 사유를 돌려줌
pub fn check_log_based(
    entry: &CatalogEntry,
    caps: Option<&LogCapabilities>,
) -> std::result::Result<Vec<String>, String> {
    let caps = caps.ok_or_else(|| "binary log settings could not be read".to_string())?;

    if !caps.log_bin {
        return Err("log_bin is OFF on the server".to_string());
    }
    if !caps.binlog_format.eq_ignore_ascii_case("ROW") {
        return Err(format!(
            "binlog_format is {}, ROW is required",
            caps.binlog_format
        ));
    }
    if caps.retained_logs.is_empty() {
        return Err("the server retains no binary log files".to_string());
    }
    if entry.is_view {
        return Err("views are not written to the binary log".to_string());
    }
    if row_identity(entry).is_none() {
        return Err(match entry.unique_keys.as_slice() {
            [single] => format!("unique key {} allows NULL and cannot identify rows", single),
            _ => "no primary key or single unique key to identify rows".to_string(),
        });
    }

    let mut notes = Vec::new();
    if !caps.binlog_row_image.eq_ignore_ascii_case("FULL") {
        notes.push(format!(
            "binlog_row_image is {}; before-images may be partial",
            caps.binlog_row_image
        ));
    }
    Ok(notes)
}

/// INCREMENTAL 전제 조건
pub fn check_incremental(entry: &CatalogEntry) -> std::result::Result<(), String> {
    let key = entry
        .selection
        .replication_key
        .as_deref()
        .ok_or_else(|| "no replication_key selected".to_string())?;

    let known = entry
        .columns
        .iter()
        .any(|c| c.name == key && c.canonical.is_supported());
    if !known {
        return Err(format!("replication_key {} is not a supported column", key));
    }
    Ok(())
}

/// 카탈로그 + 이전 상태 + 서버 설정으로 실행 계획 작성
pub fn plan(
    catalog: &Catalog,
    state: &StateDocument,
    caps: Option<&LogCapabilities>,
) -> ExecutionPlan {
    let mut result = ExecutionPlan::default();

    for entry in &catalog.streams {
        if !entry.selection.selected {
            continue;
        }
        let stream = entry.tap_stream_id.clone();

        if !entry.discoverable {
            let reason = entry
                .undiscoverable_reason
                .clone()
                .unwrap_or_else(|| "schema could not be introspected".to_string());
            push_warning(&mut result, &stream, format!("skipped: {}", reason));
            continue;
        }

        let requested = entry.selection.replication_method;
        let method = match requested {
            ReplicationMethod::LogBased => match check_log_based(entry, caps) {
                Ok(notes) => {
                    for note in notes {
                        push_warning(&mut result, &stream, note);
                    }
                    ReplicationMethod::LogBased
                }
                Err(reason) => {
                    push_warning(
                        &mut result,
                        &stream,
                        format!("LOG_BASED unavailable, using FULL_TABLE: {}", reason),
                    );
                    ReplicationMethod::FullTable
                }
            },
            ReplicationMethod::Incremental => match check_incremental(entry) {
                Ok(()) => ReplicationMethod::Incremental,
                Err(reason) => {
                    push_warning(
                        &mut result,
                        &stream,
                        format!("INCREMENTAL unavailable, using FULL_TABLE: {}", reason),
                    );
                    ReplicationMethod::FullTable
                }
            },
            ReplicationMethod::FullTable => ReplicationMethod::FullTable,
        };

        if let Some(bookmark) = state.bookmarks.get(&stream) {
            let stale = match method {
                ReplicationMethod::LogBased => bookmark.replication_key.is_some(),
                ReplicationMethod::Incremental => {
                    bookmark.log_file.is_some()
                        || bookmark.replication_key != entry.selection.replication_key
                }
                ReplicationMethod::FullTable => {
                    bookmark.log_file.is_some() || bookmark.replication_key.is_some()
                }
            };
            if stale {
                result.bookmark_resets.push(stream.clone());
            }
        }

        let planned = PlannedStream {
            key_columns: row_identity(entry).unwrap_or_default(),
            entry: entry.clone(),
            method,
        };
        match method {
            ReplicationMethod::LogBased => result.log_group.streams.push(planned),
            _ => result.table_passes.push(planned),
        }
    }

    result
}

fn push_warning(plan: &mut ExecutionPlan, stream: &str, message: String) {
    warn!(stream = %stream, "{}", message);
    plan.warnings.push(PlanWarning {
        stream: stream.to_string(),
        message,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_entry;
    use crate::catalog::ColumnSchema;
    use crate::offset::Bookmark;
    use crate::types::CanonicalType;

    fn good_caps() -> LogCapabilities {
        LogCapabilities {
            log_bin: true,
            binlog_format: "ROW".to_string(),
            binlog_row_image: "FULL".to_string(),
            retained_logs: vec![BinaryLogFile {
                name: "mysql-bin.000001".to_string(),
                size: 1024,
            }],
        }
    }

    fn selected(method: ReplicationMethod) -> CatalogEntry {
        let mut entry = sample_entry("shop", "orders");
        entry.selection.selected = true;
        entry.selection.replication_method = method;
        entry
    }

    #[test]
    fn test_method_names() {
        assert_eq!(
            serde_json::to_string(&ReplicationMethod::LogBased).unwrap(),
            "\"LOG_BASED\""
        );
        let parsed: ReplicationMethod = serde_json::from_str("\"FULL_TABLE\"").unwrap();
        assert_eq!(parsed, ReplicationMethod::FullTable);
        assert_eq!(ReplicationMethod::Incremental.to_string(), "INCREMENTAL");
    }

    #[test]
    fn test_log_based_goes_to_shared_group() {
        let mut other = selected(ReplicationMethod::LogBased);
        other.tap_stream_id = "shop-customers".to_string();
        let catalog = Catalog {
            streams: vec![selected(ReplicationMethod::LogBased), other],
        };

        let plan = plan(&catalog, &StateDocument::default(), Some(&good_caps()));
        assert!(plan.table_passes.is_empty());
        assert_eq!(plan.log_group.streams.len(), 2);
        assert_eq!(plan.log_group.streams[0].key_columns, vec!["id".to_string()]);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_log_based_downgrades_with_warning() {
        let catalog = Catalog {
            streams: vec![selected(ReplicationMethod::LogBased)],
        };
        let mut caps = good_caps();
        caps.binlog_format = "STATEMENT".to_string();

        let plan = plan(&catalog, &StateDocument::default(), Some(&caps));
        assert!(plan.log_group.is_empty());
        assert_eq!(plan.table_passes[0].method, ReplicationMethod::FullTable);
        assert_eq!(plan.warnings.len(), 1);
        assert_eq!(plan.warnings[0].stream, "shop-orders");
        assert!(plan.warnings[0].message.contains("binlog_format"));

        let plan = super::plan(&catalog, &StateDocument::default(), None);
        assert_eq!(plan.table_passes[0].method, ReplicationMethod::FullTable);
    }

    #[test]
    fn test_log_based_requires_row_identity() {
        let mut entry = selected(ReplicationMethod::LogBased);
        entry.key_properties.clear();
        assert!(check_log_based(&entry, Some(&good_caps())).is_err());

        entry.columns.push(ColumnSchema {
            name: "sku".to_string(),
            data_type: "varchar".to_string(),
            column_type: "varchar(16)".to_string(),
            nullable: false,
            canonical: CanonicalType::String,
        });
        entry.unique_keys = vec!["sku".to_string()];
        assert!(check_log_based(&entry, Some(&good_caps())).is_ok());
        assert_eq!(row_identity(&entry), Some(vec!["sku".to_string()]));

        entry.unique_keys.push("code".to_string());
        assert!(row_identity(&entry).is_none());
    }

    #[test]
    fn test_nullable_unique_key_is_not_row_identity() {
        let mut entry = selected(ReplicationMethod::LogBased);
        entry.key_properties.clear();
        entry.columns.push(ColumnSchema {
            name: "sku".to_string(),
            data_type: "varchar".to_string(),
            column_type: "varchar(16)".to_string(),
            nullable: true,
            canonical: CanonicalType::String,
        });
        entry.unique_keys = vec!["sku".to_string()];

        assert!(row_identity(&entry).is_none());
        let reason = check_log_based(&entry, Some(&good_caps())).unwrap_err();
        assert!(reason.contains("allows NULL"));

        let catalog = Catalog {
            streams: vec![entry],
        };
        let plan = plan(&catalog, &StateDocument::default(), Some(&good_caps()));
        assert!(plan.log_group.is_empty());
        assert_eq!(plan.table_passes[0].method, ReplicationMethod::FullTable);
        // 키가 없으니 스냅샷은 keyset 대신 LIMIT/OFFSET
        assert!(plan.table_passes[0].key_columns.is_empty());
        assert!(plan.warnings[0].message.contains("allows NULL"));
    }

    #[test]
    fn test_partial_row_image_is_warning_only() {
        let mut caps = good_caps();
        caps.binlog_row_image = "MINIMAL".to_string();
        let notes = check_log_based(&selected(ReplicationMethod::LogBased), Some(&caps)).unwrap();
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn test_incremental_requires_known_key() {
        let mut entry = selected(ReplicationMethod::Incremental);
        assert!(check_incremental(&entry).is_err());
        entry.selection.replication_key = Some("updated_at".to_string());
        assert!(check_incremental(&entry).is_ok());
        entry.selection.replication_key = Some("missing".to_string());
        assert!(check_incremental(&entry).is_err());
    }

    #[test]
    fn test_unselected_and_undiscoverable_streams() {
        let mut broken = selected(ReplicationMethod::FullTable);
        broken.tap_stream_id = "shop-broken".to_string();
        broken.discoverable = false;
        let catalog = Catalog {
            streams: vec![sample_entry("shop", "ignored"), broken],
        };

        let plan = plan(&catalog, &StateDocument::default(), None);
        assert!(plan.table_passes.is_empty());
        assert_eq!(plan.warnings.len(), 1);
        assert_eq!(plan.warnings[0].stream, "shop-broken");
    }

    #[test]
    fn test_changed_method_resets_bookmark() {
        let catalog = Catalog {
            streams: vec![selected(ReplicationMethod::FullTable)],
        };
        let mut state = StateDocument::default();
        state.bookmarks.insert(
            "shop-orders".to_string(),
            Bookmark {
                log_file: Some("mysql-bin.000001".to_string()),
                log_pos: Some(4),
                ..Bookmark::default()
            },
        );

        let plan = plan(&catalog, &state, None);
        assert_eq!(plan.bookmark_resets, vec!["shop-orders".to_string()]);
    }
}

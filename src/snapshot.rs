//! 초기 적재(bootstrap)와 재동기화
//!
//! 로그 기반 스트림은 저장된 위치가 없거나 더 이상 유효하지 않으면 스냅샷부터 시작합니다.
//! 스냅샷 행과 binlog 위치는 같은 consistent-snapshot 트랜잭션 안에서, 전역 읽기 잠금을
//! 잡은 상태로 얻습니다. 로그 스트리밍은 반드시 그 위치부터 이어갑니다.

use crate::catalog::{CatalogEntry, ColumnSchema};
use crate::connection::{qualified_table, quote_ident, read_binlog_status, BinaryLogFile, ConnectionPool};
use crate::error::{CdcError, Result};
use crate::offset::BinlogPosition;
use crate::types::row_to_record;
use mysql_async::prelude::*;
use mysql_async::{IsolationLevel, Params, Row, TxOpts, Value as SqlValue};
use serde_json::{Map, Value};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 스트림 하나의 bootstrap 진행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NeedsBootstrap,
    Snapshotting,
    SnapshotComplete,
    LogStreaming,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapState::NeedsBootstrap => "needs-bootstrap",
            BootstrapState::Snapshotting => "snapshotting",
            BootstrapState::SnapshotComplete => "snapshot-complete",
            BootstrapState::LogStreaming => "log-streaming",
        };
        f.write_str(name)
    }
}

impl BootstrapState {
    /// 허용된 전이만 수행
    pub fn transition(self, next: BootstrapState) -> Result<BootstrapState> {
        use BootstrapState::*;
        let allowed = matches!(
            (self, next),
            (NeedsBootstrap, Snapshotting)
                | (Snapshotting, SnapshotComplete)
                | (Snapshotting, NeedsBootstrap)
                | (SnapshotComplete, LogStreaming)
                | (LogStreaming, NeedsBootstrap)
        );
        if allowed {
            Ok(next)
        } else {
            Err(CdcError::ConfigError(format!(
                "invalid bootstrap transition {} -> {}",
                self, next
            )))
        }
    }
}

/// 저장된 위치가 서버에 남아 있는 로그를 가리키는지
pub fn validate_position(
    position: &BinlogPosition,
    retained: &[BinaryLogFile],
) -> std::result::Result<(), String> {
    let file = retained
        .iter()
        .find(|f| f.name == position.filename)
        .ok_or_else(|| format!("{} is no longer retained by the server", position.filename))?;
    if position.position > file.size {
        return Err(format!(
            "offset {} is past the end of {} ({} bytes)",
            position.position, file.name, file.size
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapDecision {
    /// 저장된 위치에서 바로 로그 스트리밍
    Resume(BinlogPosition),
    Bootstrap,
}

impl BootstrapDecision {
    pub fn initial_state(&self) -> BootstrapState {
        match self {
            BootstrapDecision::Resume(_) => BootstrapState::LogStreaming,
            BootstrapDecision::Bootstrap => BootstrapState::NeedsBootstrap,
        }
    }
}

/// 저장된 위치로 bootstrap 여부 결정. 유효하지 않은 위치는 경고 후 bootstrap
pub fn decide_bootstrap(
    stream: &str,
    stored: Option<BinlogPosition>,
    retained: &[BinaryLogFile],
) -> BootstrapDecision {
    let stored = match stored {
        Some(stored) => stored,
        None => return BootstrapDecision::Bootstrap,
    };
    match validate_position(&stored, retained) {
        Ok(()) => BootstrapDecision::Resume(stored),
        Err(reason) => {
            let err = CdcError::PositionInvalid {
                stream: stream.to_string(),
                position: format!("{} ({})", stored, reason),
            };
            warn!(stream = %stream, "{}, resyncing from a new snapshot", err);
            BootstrapDecision::Bootstrap
        }
    }
}

/// 스냅샷 결과
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotResult {
    /// 스냅샷 트랜잭션과 같은 시점의 binlog 위치
    pub position: BinlogPosition,
    pub rows: u64,
}

/// 스냅샷 SELECT 목록: 선택 컬럼 + (빠졌다면) 키 컬럼
pub fn snapshot_columns<'a>(entry: &'a CatalogEntry, keys: &[String]) -> Vec<&'a ColumnSchema> {
    let mut columns = entry.selected_columns();
    for key in keys {
        if !columns.iter().any(|c| &c.name == key) {
            if let Some(column) = entry.column(key) {
                columns.push(column);
            }
        }
    }
    columns
}

/// 배치 하나를 읽는 SQL. 키가 있으면 keyset, 없으면 LIMIT/OFFSET
pub fn batch_sql(
    entry: &CatalogEntry,
    columns: &[&ColumnSchema],
    keys: &[String],
    after_cursor: bool,
    batch_size: usize,
    offset: u64,
) -> String {
    let select = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let table = qualified_table(&entry.database, &entry.table_name);

    if keys.is_empty() {
        return format!(
            "SELECT {} FROM {} LIMIT {} OFFSET {}",
            select, table, batch_size, offset
        );
    }

    let key_list = keys.iter().map(|k| quote_ident(k)).collect::<Vec<_>>().join(", ");
    let predicate = if after_cursor {
        let marks = vec!["?"; keys.len()].join(", ");
        format!(" WHERE ({}) > ({})", key_list, marks)
    } else {
        String::new()
    };
    format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT {}",
        select, table, predicate, key_list, batch_size
    )
}

fn interrupted(stream: &str, err: impl fmt::Display) -> CdcError {
    CdcError::SnapshotInterrupted {
        stream: stream.to_string(),
        message: err.to_string(),
    }
}

/// 테이블 하나를 스냅샷. 배치마다 `on_batch`로 레코드를 넘김
///
/// 중간에 실패하면 `SnapshotInterrupted`를 반환하고 아무 위치도 남기지 않습니다.
pub async fn snapshot_table<F>(
    pool: &ConnectionPool,
    entry: &CatalogEntry,
    keys: &[String],
    batch_size: usize,
    cancel: &CancellationToken,
    mut on_batch: F,
) -> Result<SnapshotResult>
where
    F: FnMut(Vec<Map<String, Value>>) -> Result<()> + Send,
{
    let stream = entry.tap_stream_id.as_str();
    let mut conn = pool.get_conn().await.map_err(|e| interrupted(stream, e))?;

    let locked = match conn.query_drop("FLUSH TABLES WITH READ LOCK").await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                stream = %stream,
                "Global read lock not permitted ({}), capturing position without it",
                e
            );
            false
        }
    };

    let mut opts = TxOpts::default();
    opts.with_consistent_snapshot(true)
        .with_isolation_level(IsolationLevel::RepeatableRead)
        .with_readonly(Some(true));
    let mut tx = conn
        .start_transaction(opts)
        .await
        .map_err(|e| interrupted(stream, e))?;

    let status = read_binlog_status(&mut tx).await;
    if locked {
        tx.query_drop("UNLOCK TABLES")
            .await
            .map_err(|e| interrupted(stream, e))?;
    }
    let status = status.map_err(|e| interrupted(stream, e))?;
    let position = BinlogPosition::new(status.file, status.position);
    info!(stream = %stream, "Snapshot started at {}", position);

    let columns = snapshot_columns(entry, keys);
    let key_indexes: Vec<usize> = keys
        .iter()
        .filter_map(|k| columns.iter().position(|c| &c.name == k))
        .collect();

    let mut cursor: Option<Vec<SqlValue>> = None;
    let mut rows_read: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(interrupted(stream, "cancelled"));
        }

        let sql = batch_sql(entry, &columns, keys, cursor.is_some(), batch_size, rows_read);
        let params = match &cursor {
            Some(values) => Params::Positional(values.clone()),
            None => Params::Empty,
        };
        let rows: Vec<Row> = tx
            .exec(sql.as_str(), params)
            .await
            .map_err(|e| interrupted(stream, e))?;
        let fetched = rows.len();

        if let Some(last) = rows.last() {
            if !key_indexes.is_empty() {
                cursor = Some(
                    key_indexes
                        .iter()
                        .map(|i| last.as_ref(*i).cloned().unwrap_or(SqlValue::NULL))
                        .collect(),
                );
            }
        }

        let records: Vec<Map<String, Value>> =
            rows.iter().map(|row| row_to_record(row, &columns)).collect();
        rows_read += fetched as u64;
        if !records.is_empty() {
            on_batch(records)?;
        }
        debug!(stream = %stream, "Snapshot batch of {} rows ({} total)", fetched, rows_read);

        if fetched < batch_size {
            break;
        }
    }

    tx.commit().await.map_err(|e| interrupted(stream, e))?;
    info!(stream = %stream, "Snapshot finished: {} rows at {}", rows_read, position);

    Ok(SnapshotResult {
        position,
        rows: rows_read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_entry;
    use crate::demux::tests::{insert, order_image, subscription, update, EventBuilder, MemorySource, RecordingSink};
    use crate::demux::Demultiplexer;
    use crate::emitter::RecordEmitter;
    use crate::events::{BinlogEvent, ChangeKind, RowImage};
    use crate::offset::PositionTracker;
    use std::collections::BTreeMap;

    fn retained() -> Vec<BinaryLogFile> {
        vec![
            BinaryLogFile {
                name: "mysql-bin.000007".to_string(),
                size: 5000,
            },
            BinaryLogFile {
                name: "mysql-bin.000008".to_string(),
                size: 120,
            },
        ]
    }

    #[test]
    fn test_transitions() {
        let state = BootstrapState::NeedsBootstrap;
        let state = state.transition(BootstrapState::Snapshotting).unwrap();
        let state = state.transition(BootstrapState::SnapshotComplete).unwrap();
        let state = state.transition(BootstrapState::LogStreaming).unwrap();
        assert_eq!(state, BootstrapState::LogStreaming);

        assert!(BootstrapState::NeedsBootstrap
            .transition(BootstrapState::LogStreaming)
            .is_err());
        assert!(BootstrapState::SnapshotComplete
            .transition(BootstrapState::Snapshotting)
            .is_err());
    }

    #[test]
    fn test_validate_position() {
        assert!(validate_position(&BinlogPosition::new("mysql-bin.000007", 4000), &retained()).is_ok());
        assert!(validate_position(&BinlogPosition::new("mysql-bin.000008", 121), &retained()).is_err());
        assert!(validate_position(&BinlogPosition::new("mysql-bin.000003", 4), &retained()).is_err());
    }

    #[test]
    fn test_invalid_position_bootstraps_exactly_once() {
        let mut tracker = PositionTracker::new(Default::default());
        let mut emitter = RecordEmitter::new(Vec::new());
        tracker
            .commit(&mut emitter, "shop-orders", &BinlogPosition::new("mysql-bin.000003", 900))
            .unwrap();

        let mut bootstraps = 0;
        for _ in 0..3 {
            match decide_bootstrap("shop-orders", tracker.load("shop-orders"), &retained()) {
                BootstrapDecision::Bootstrap => {
                    bootstraps += 1;
                    let state = BootstrapState::NeedsBootstrap
                        .transition(BootstrapState::Snapshotting)
                        .unwrap();
                    tracker.reset("shop-orders");
                    // 스냅샷 시점 위치 기록
                    tracker
                        .commit(&mut emitter, "shop-orders", &BinlogPosition::new("mysql-bin.000008", 120))
                        .unwrap();
                    state
                        .transition(BootstrapState::SnapshotComplete)
                        .unwrap()
                        .transition(BootstrapState::LogStreaming)
                        .unwrap();
                }
                BootstrapDecision::Resume(position) => {
                    assert_eq!(position, BinlogPosition::new("mysql-bin.000008", 120));
                }
            }
        }
        assert_eq!(bootstraps, 1);
        assert_eq!(decide_bootstrap("shop-orders", None, &retained()), BootstrapDecision::Bootstrap);
        assert_eq!(
            BootstrapDecision::Bootstrap.initial_state(),
            BootstrapState::NeedsBootstrap
        );
    }

    #[test]
    fn test_batch_sql() {
        let entry = sample_entry("shop", "orders");
        let keys = vec!["id".to_string()];
        let columns = snapshot_columns(&entry, &keys);
        assert_eq!(
            batch_sql(&entry, &columns, &keys, false, 500, 0),
            "SELECT `id`, `status`, `amount`, `updated_at` FROM `shop`.`orders` ORDER BY `id` LIMIT 500"
        );
        assert_eq!(
            batch_sql(&entry, &columns, &keys, true, 500, 500),
            "SELECT `id`, `status`, `amount`, `updated_at` FROM `shop`.`orders` WHERE (`id`) > (?) ORDER BY `id` LIMIT 500"
        );
        assert_eq!(
            batch_sql(&entry, &columns, &[], true, 10, 20),
            "SELECT `id`, `status`, `amount`, `updated_at` FROM `shop`.`orders` LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn test_snapshot_columns_keep_key() {
        let mut entry = sample_entry("shop", "orders");
        entry.selection.columns = Some(vec!["status".to_string()]);
        entry.key_properties.clear();
        let columns = snapshot_columns(&entry, &["id".to_string()]);
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["status", "id"]);
    }

    fn delete(id: i64, status: &str) -> RowImage {
        RowImage {
            before: Some(order_image(id, status)),
            after: None,
        }
    }

    /// 트랜잭션을 id -> 레코드 상태에 반영
    fn apply(sink: &RecordingSink, table: &mut BTreeMap<i64, Map<String, Value>>) {
        for txn in &sink.transactions {
            for event in &txn.events {
                match event.kind {
                    ChangeKind::Insert | ChangeKind::Update => {
                        let after = event.after.clone().unwrap();
                        table.insert(after["id"].as_i64().unwrap(), after);
                    }
                    ChangeKind::Delete => {
                        let before = event.before.as_ref().unwrap();
                        table.remove(&before["id"].as_i64().unwrap());
                    }
                    _ => {}
                }
            }
        }
    }

    async fn replay(events: Vec<BinlogEvent>, from: BinlogPosition) -> BTreeMap<i64, Map<String, Value>> {
        let mut demux = Demultiplexer::new(vec![subscription("shop", "orders", from)]).unwrap();
        let mut sink = RecordingSink::default();
        demux
            .run(&mut MemorySource::new(events), &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        let mut table = BTreeMap::new();
        apply(&sink, &mut table);
        table
    }

    #[tokio::test]
    async fn test_snapshot_then_log_matches_full_history() {
        let mut b = EventBuilder::new("mysql-bin.000001", 4);
        let origin = b.position();
        let mut before_snapshot = Vec::new();
        before_snapshot.extend(b.transaction(ChangeKind::Insert, "shop", "orders", vec![insert(1, "new"), insert(2, "new")]));
        before_snapshot.extend(b.transaction(ChangeKind::Update, "shop", "orders", vec![update(2, "new", "paid")]));
        let snapshot_at = b.position();

        let mut after_snapshot = Vec::new();
        after_snapshot.extend(b.transaction(ChangeKind::Insert, "shop", "orders", vec![insert(3, "new")]));
        after_snapshot.extend(b.transaction(ChangeKind::Delete, "shop", "orders", vec![delete(1, "new")]));
        after_snapshot.extend(b.transaction(ChangeKind::Update, "shop", "orders", vec![update(3, "new", "shipped")]));

        let all: Vec<BinlogEvent> = before_snapshot.iter().chain(after_snapshot.iter()).cloned().collect();
        let expected = replay(all.clone(), origin.clone()).await;

        // 스냅샷 = T 시점의 테이블 상태, 이후 T부터 같은 로그를 처음부터 다시 읽음
        let mut reconstructed = replay(before_snapshot, origin).await;
        let mut demux = Demultiplexer::new(vec![subscription("shop", "orders", snapshot_at)]).unwrap();
        let mut sink = RecordingSink::default();
        demux
            .run(&mut MemorySource::new(all), &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        apply(&sink, &mut reconstructed);

        assert_eq!(reconstructed, expected);
        assert_eq!(expected.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(expected[&3]["status"], serde_json::json!("shipped"));
    }
}

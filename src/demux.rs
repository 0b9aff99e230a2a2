//! 로그 이벤트 분배기
//!
//! 하나의 binlog 커서를 소유하고, 구독한 테이블의 변경을 트랜잭션 단위로 묶어
//! 스트림별 `LogEvent`로 싱크에 전달합니다.
//!
//! - 스트림 시작 위치 이하에서 커밋된 트랜잭션은 그 스트림에 대해 건너뜀
//! - 구독 테이블의 DDL이나 컬럼 수가 달라진 table map을 만나면 해당 스트림의
//!   다음 row보다 먼저 `on_schema_change`를 호출
//! - 구독 내용이 없는 트랜잭션, rotate, heartbeat도 위치를 전진시킴

use crate::binlog::TableRef;
use crate::catalog::ColumnSchema;
use crate::error::{CdcError, Result};
use crate::events::*;
use crate::offset::BinlogPosition;
use crate::types::cell_to_json;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 로그 이벤트 공급원 (binlog 소켓 또는 테스트용 메모리 소스)
#[async_trait]
pub trait LogSource: Send {
    /// 다음 이벤트. None이면 로그 끝
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>>;

    /// 행 이미지를 디코딩할 테이블
    fn set_table_filter(&mut self, tables: HashSet<TableRef>);
}

/// 분배 결과를 받는 쪽
#[async_trait]
pub trait LogEventSink: Send {
    /// 커밋된 트랜잭션 (구독 스트림의 이벤트만, 원래 순서대로)
    async fn on_transaction(&mut self, transaction: Transaction) -> Result<()>;

    /// 스키마 변경. 새 컬럼 목록을 돌려주면 이후 row는 그 목록으로 해석
    async fn on_schema_change(&mut self, event: &LogEvent) -> Result<Option<Vec<ColumnSchema>>>;

    /// 변경 없이 위치만 전진. `idle`은 서버 heartbeat로 로그가 멈춰 있다는 뜻
    async fn on_heartbeat(&mut self, event: &LogEvent, idle: bool) -> Result<()>;
}

/// 스트림 하나의 구독 정보
#[derive(Debug, Clone)]
pub struct Subscription {
    pub stream: String,
    pub database: String,
    pub table: String,
    /// 이 위치 이하에서 커밋된 트랜잭션은 이미 반영됨
    pub start: BinlogPosition,
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    /// 커밋 위치 (XID/COMMIT 이벤트 다음)
    pub position: BinlogPosition,
    pub gtid: Option<String>,
    pub events: Vec<LogEvent>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemuxStats {
    pub transactions: u64,
    pub skipped_transactions: u64,
    pub schema_changes: u64,
    pub heartbeats: u64,
    /// 마지막으로 처리한 위치
    pub position: Option<BinlogPosition>,
}

/// 진행 중인 트랜잭션
#[derive(Debug, Default)]
struct OpenTransaction {
    gtid: Option<String>,
    /// BEGIN을 만났는지 (GTID만 있으면 단일 문장 그룹일 수 있음)
    begun: bool,
    events: Vec<LogEvent>,
}

/// Query 이벤트의 트랜잭션상 의미
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Begin,
    Commit,
    /// 트랜잭션 전체 취소
    Rollback,
    /// SAVEPOINT, ROLLBACK TO, RELEASE SAVEPOINT (트랜잭션 유지)
    Savepoint,
    /// DDL 등 암묵적 커밋을 일으키는 문장
    ImplicitCommit,
    Other,
}

pub struct Demultiplexer {
    subscriptions: HashMap<TableRef, Subscription>,
    starts: HashMap<String, BinlogPosition>,
    stop_at: Option<BinlogPosition>,
    ddl: Regex,
    table_name: Regex,
    verb: Regex,
}

impl Demultiplexer {
    pub fn new(subscriptions: Vec<Subscription>) -> Result<Self> {
        let ddl = Regex::new(
            r"(?is)^\s*(?:/\*.*?\*/\s*)*(ALTER|CREATE|DROP|RENAME|TRUNCATE)\s+(?:TEMPORARY\s+)?TABLE\s+(?:IF\s+(?:NOT\s+)?EXISTS\s+)?(.+)$",
        )
        .map_err(|e| CdcError::ConfigError(e.to_string()))?;
        let table_name = Regex::new(r"(?:`([^`]+)`|(\w+))(?:\s*\.\s*(?:`([^`]+)`|(\w+)))?")
            .map_err(|e| CdcError::ConfigError(e.to_string()))?;
        let verb = Regex::new(r"(?is)^\s*(?:/\*.*?\*/\s*)*(\w+)(?:\s+(\w+))?")
            .map_err(|e| CdcError::ConfigError(e.to_string()))?;

        let starts = subscriptions
            .iter()
            .map(|s| (s.stream.clone(), s.start.clone()))
            .collect();
        Ok(Demultiplexer {
            subscriptions: subscriptions
                .into_iter()
                .map(|s| ((s.database.clone(), s.table.clone()), s))
                .collect(),
            starts,
            stop_at: None,
            ddl,
            table_name,
            verb,
        })
    }

    /// 이 위치에 도달하면 멈춤
    pub fn with_stop_position(mut self, position: BinlogPosition) -> Self {
        self.stop_at = Some(position);
        self
    }

    /// 커서 시작 위치 (구독 중 가장 이른 위치)
    pub fn start_position(&self) -> Option<BinlogPosition> {
        self.subscriptions.values().map(|s| s.start.clone()).min()
    }

    pub fn subscription(&self, database: &str, table: &str) -> Option<&Subscription> {
        self.subscriptions
            .get(&(database.to_string(), table.to_string()))
    }

    /// 문장 앞머리 키워드로 트랜잭션 경계 여부 판단
    pub fn classify_query(&self, statement: &str) -> QueryKind {
        let captures = match self.verb.captures(statement) {
            Some(c) => c,
            None => return QueryKind::Other,
        };
        let first = captures[1].to_ascii_uppercase();
        let second = captures.get(2).map(|m| m.as_str().to_ascii_uppercase());
        match first.as_str() {
            "BEGIN" => QueryKind::Begin,
            "COMMIT" => QueryKind::Commit,
            "ROLLBACK" if second.as_deref() == Some("TO") => QueryKind::Savepoint,
            "ROLLBACK" => QueryKind::Rollback,
            "SAVEPOINT" => QueryKind::Savepoint,
            "RELEASE" if second.as_deref() == Some("SAVEPOINT") => QueryKind::Savepoint,
            "ALTER" | "CREATE" | "DROP" | "RENAME" | "TRUNCATE" | "GRANT" | "REVOKE"
            | "ANALYZE" | "OPTIMIZE" | "REPAIR" => QueryKind::ImplicitCommit,
            _ => QueryKind::Other,
        }
    }

    /// DDL 문이 가리키는 테이블들 (스키마 생략 시 `default_db`)
    pub fn ddl_targets(&self, default_db: &str, query: &str) -> Vec<TableRef> {
        let captures = match self.ddl.captures(query) {
            Some(c) => c,
            None => return Vec::new(),
        };
        let verb = captures[1].to_ascii_uppercase();
        let rest = &captures[2];

        let mut targets = Vec::new();
        for found in self.table_name.captures_iter(rest) {
            let first = found.get(1).or_else(|| found.get(2)).map(|m| m.as_str());
            let second = found.get(3).or_else(|| found.get(4)).map(|m| m.as_str());
            let target = match (first, second) {
                (Some(db), Some(table)) => (db.to_string(), table.to_string()),
                (Some(table), None) => (default_db.to_string(), table.to_string()),
                _ => continue,
            };
            targets.push(target);
            // DROP a, b / RENAME a TO b, c TO d 만 여러 테이블을 가짐
            if verb != "DROP" && verb != "RENAME" {
                break;
            }
        }
        if verb == "RENAME" {
            targets.retain(|(_, t)| !t.eq_ignore_ascii_case("TO"));
        }
        targets
    }

    /// 로그 끝(또는 정지 위치, 취소)까지 이벤트를 분배
    pub async fn run<S, K>(
        &mut self,
        source: &mut S,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<DemuxStats>
    where
        S: LogSource + ?Sized,
        K: LogEventSink + ?Sized,
    {
        let start = match self.start_position() {
            Some(start) => start,
            None => return Ok(DemuxStats::default()),
        };
        source.set_table_filter(self.subscriptions.keys().cloned().collect());
        info!(
            "Demultiplexing binlog for {} streams from {}",
            self.subscriptions.len(),
            start
        );

        let mut stats = DemuxStats::default();
        let mut position = start;
        let mut table_ids: HashMap<u64, TableRef> = HashMap::new();
        let mut open: Option<OpenTransaction> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(CdcError::Cancelled);
            }
            let event = match source.next_event().await? {
                Some(event) => event,
                None => break,
            };

            let timestamp = event_time(&event.header);
            match event.data {
                BinlogEventData::Rotate(rotate) => {
                    position = BinlogPosition::new(rotate.next_binlog_name, rotate.position);
                    debug!("Rotated to {}", position);
                    self.heartbeat(sink, &position, timestamp, false, &mut stats).await?;
                    continue;
                }
                BinlogEventData::Heartbeat { .. } => {
                    if event.header.next_pos > 0 {
                        position.position = event.header.next_pos as u64;
                    }
                    self.heartbeat(sink, &position, timestamp, true, &mut stats).await?;
                    continue;
                }
                _ => {}
            }

            // 인위적인 이벤트(FDE 등)는 next_pos가 0
            if event.header.next_pos > 0 {
                position.position = event.header.next_pos as u64;
            }

            match event.data {
                BinlogEventData::Gtid(gtid) => {
                    open = Some(OpenTransaction {
                        gtid: Some(gtid.gtid),
                        ..Default::default()
                    });
                }
                BinlogEventData::Query(query) => {
                    let statement = query.query.trim();
                    match self.classify_query(statement) {
                        QueryKind::Begin => {
                            open.get_or_insert_with(OpenTransaction::default).begun = true;
                        }
                        QueryKind::Commit => {
                            let txn = open.take().unwrap_or_default();
                            self.commit(sink, txn, &position, &mut stats).await?;
                        }
                        QueryKind::Rollback => {
                            if let Some(txn) = open.take() {
                                debug!("Rolled back transaction with {} row events", txn.events.len());
                            }
                            self.heartbeat(sink, &position, timestamp, false, &mut stats).await?;
                        }
                        QueryKind::Savepoint => {}
                        QueryKind::ImplicitCommit => {
                            // 열린 트랜잭션은 DDL 앞에서 커밋됨
                            let gtid = match open.take() {
                                Some(txn) if !txn.events.is_empty() => {
                                    let gtid = txn.gtid.clone();
                                    self.commit(sink, txn, &position, &mut stats).await?;
                                    gtid
                                }
                                Some(txn) => txn.gtid,
                                None => None,
                            };
                            for target in self.ddl_targets(&query.database, statement) {
                                self.schema_change(sink, &target, &position, gtid.clone(), timestamp, &mut stats)
                                    .await?;
                            }
                            self.heartbeat(sink, &position, timestamp, false, &mut stats).await?;
                        }
                        QueryKind::Other => {
                            // 트랜잭션 밖의 단일 문장
                            if !open.as_ref().map_or(false, |t| t.begun || !t.events.is_empty()) {
                                open = None;
                                self.heartbeat(sink, &position, timestamp, false, &mut stats).await?;
                            }
                        }
                    }
                }
                BinlogEventData::TableMap(map) => {
                    let target = (map.database.clone(), map.table.clone());
                    let known = self.subscriptions.get(&target).map(|s| s.columns.len());
                    if let Some(known) = known {
                        if known != map.column_types.len() {
                            debug!(
                                "Table map of {}.{} has {} columns, expected {}",
                                map.database,
                                map.table,
                                map.column_types.len(),
                                known
                            );
                            let gtid = open.as_ref().and_then(|t| t.gtid.clone());
                            self.schema_change(sink, &target, &position, gtid, timestamp, &mut stats)
                                .await?;
                        }
                    }
                    table_ids.insert(map.table_id, target);
                }
                BinlogEventData::WriteRows(rows) => {
                    self.collect_rows(&table_ids, ChangeKind::Insert, rows, &position, timestamp, &mut open);
                }
                BinlogEventData::UpdateRows(rows) => {
                    self.collect_rows(&table_ids, ChangeKind::Update, rows, &position, timestamp, &mut open);
                }
                BinlogEventData::DeleteRows(rows) => {
                    self.collect_rows(&table_ids, ChangeKind::Delete, rows, &position, timestamp, &mut open);
                }
                BinlogEventData::Xid { .. } => {
                    let txn = open.take().unwrap_or_default();
                    self.commit(sink, txn, &position, &mut stats).await?;
                }
                _ => {}
            }

            if open.is_none() {
                if let Some(stop_at) = &self.stop_at {
                    if position >= *stop_at {
                        info!("Reached stop position {}", stop_at);
                        break;
                    }
                }
            }
        }

        if open.is_some() {
            debug!("Log ended inside an open transaction, discarded");
        }
        stats.position = Some(position);
        Ok(stats)
    }

    fn collect_rows(
        &self,
        table_ids: &HashMap<u64, TableRef>,
        kind: ChangeKind,
        rows: RowsData,
        position: &BinlogPosition,
        timestamp: DateTime<Utc>,
        open: &mut Option<OpenTransaction>,
    ) {
        let subscription = match table_ids
            .get(&rows.table_id)
            .and_then(|t| self.subscriptions.get(t))
        {
            Some(s) => s,
            None => return,
        };

        let txn = open.get_or_insert_with(OpenTransaction::default);
        for row in rows.rows {
            let seq = txn.events.len() as u32;
            txn.events.push(LogEvent {
                stream: subscription.stream.clone(),
                kind,
                // 커밋 시 커밋 위치로 바뀜
                position: position.clone(),
                transaction: txn.gtid.clone(),
                seq,
                timestamp,
                before: row.before.map(|image| image_to_map(&image, &subscription.columns)),
                after: row.after.map(|image| image_to_map(&image, &subscription.columns)),
            });
        }
    }

    async fn commit<K: LogEventSink + ?Sized>(
        &self,
        sink: &mut K,
        txn: OpenTransaction,
        position: &BinlogPosition,
        stats: &mut DemuxStats,
    ) -> Result<()> {
        let mut touched = HashSet::new();
        let mut events = Vec::with_capacity(txn.events.len());
        for mut event in txn.events {
            let start = self.starts.get(&event.stream);
            if start.map_or(false, |start| position <= start) {
                continue;
            }
            event.position = position.clone();
            touched.insert(event.stream.clone());
            events.push(event);
        }

        if events.is_empty() {
            stats.skipped_transactions += 1;
        } else {
            stats.transactions += 1;
            let timestamp = events.last().map(|e| e.timestamp).unwrap_or_default();
            sink.on_transaction(Transaction {
                position: position.clone(),
                gtid: txn.gtid,
                events,
            })
            .await?;
            // 이 트랜잭션에 없는 스트림도 위치를 전진
            for subscription in self.subscriptions.values() {
                if touched.contains(&subscription.stream) || *position <= subscription.start {
                    continue;
                }
                let event = marker(subscription, ChangeKind::Heartbeat, position, None, timestamp);
                sink.on_heartbeat(&event, false).await?;
            }
            return Ok(());
        }

        self.heartbeat(sink, position, Utc::now(), false, stats).await
    }

    async fn heartbeat<K: LogEventSink + ?Sized>(
        &self,
        sink: &mut K,
        position: &BinlogPosition,
        timestamp: DateTime<Utc>,
        idle: bool,
        stats: &mut DemuxStats,
    ) -> Result<()> {
        stats.heartbeats += 1;
        for subscription in self.subscriptions.values() {
            if *position <= subscription.start {
                continue;
            }
            let event = marker(subscription, ChangeKind::Heartbeat, position, None, timestamp);
            sink.on_heartbeat(&event, idle).await?;
        }
        Ok(())
    }

    async fn schema_change<K: LogEventSink + ?Sized>(
        &mut self,
        sink: &mut K,
        target: &TableRef,
        position: &BinlogPosition,
        gtid: Option<String>,
        timestamp: DateTime<Utc>,
        stats: &mut DemuxStats,
    ) -> Result<()> {
        let subscription = match self.subscriptions.get(target) {
            Some(s) if *position > s.start => s,
            _ => return Ok(()),
        };
        info!(stream = %subscription.stream, "Schema change at {}", position);

        let event = marker(subscription, ChangeKind::SchemaChange, position, gtid, timestamp);
        stats.schema_changes += 1;
        if let Some(columns) = sink.on_schema_change(&event).await? {
            if let Some(subscription) = self.subscriptions.get_mut(target) {
                subscription.columns = columns;
            }
        } else {
            warn!(stream = %event.stream, "Schema change without refreshed columns");
        }
        Ok(())
    }
}

fn event_time(header: &EventHeader) -> DateTime<Utc> {
    DateTime::from_timestamp(header.timestamp as i64, 0).unwrap_or_default()
}

fn marker(
    subscription: &Subscription,
    kind: ChangeKind,
    position: &BinlogPosition,
    transaction: Option<String>,
    timestamp: DateTime<Utc>,
) -> LogEvent {
    LogEvent {
        stream: subscription.stream.clone(),
        kind,
        position: position.clone(),
        transaction,
        seq: 0,
        timestamp,
        before: None,
        after: None,
    }
}

/// 행 이미지 -> 컬럼명 맵. 이미지에 없는 컬럼과 지원하지 않는 컬럼은 제외
fn image_to_map(image: &[Option<CellValue>], columns: &[ColumnSchema]) -> Map<String, Value> {
    image
        .iter()
        .zip(columns)
        .filter(|(_, column)| column.canonical.is_supported())
        .filter_map(|(cell, column)| {
            cell.as_ref()
                .map(|cell| (column.name.clone(), cell_to_json(cell, column)))
        })
        .collect()
}

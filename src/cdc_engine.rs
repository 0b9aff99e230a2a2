//! MySQL tap 실행 조율 (discover / sync)
//!
//! sync는 다음 순서로 진행됩니다:
//! 1. 카탈로그 + 이전 상태 + 서버 binlog 설정으로 실행 계획 작성
//! 2. FULL_TABLE / INCREMENTAL 스트림을 테이블 단위로 동기화
//! 3. LOG_BASED 스트림: 필요하면 스냅샷으로 bootstrap 후 하나의 binlog 커서로 분배
//! 4. 커스텀 쿼리 스트림 전체 재실행
//!
//! 출력(emitter)과 위치 추적기(tracker)는 `Output` 하나로 묶여 mutex 뒤에 있고,
//! 어떤 `.await`도 그 잠금을 잡은 채로 진행하지 않습니다.

use crate::binlog_client::{BinlogClient, BinlogClientOptions};
use crate::catalog::{self, Catalog, CatalogEntry, ColumnSchema, DELETED_AT_COLUMN};
use crate::config::TapConfig;
use crate::connection::{qualified_table, quote_ident, BinaryLogFile, ColumnInfo, ConnectionPool};
use crate::custom::{self, CustomResultSet, CustomRunSummary, PoolRunner};
use crate::demux::{DemuxStats, Demultiplexer, LogEventSink, LogSource, Subscription, Transaction};
use crate::emitter::RecordEmitter;
use crate::error::{CdcError, Result};
use crate::events::{ChangeKind, LogEvent};
use crate::offset::{BinlogPosition, PositionTracker, StateDocument};
use crate::planner::{self, LogGroup, PlannedStream, ReplicationMethod};
use crate::snapshot::{self, snapshot_columns, BootstrapDecision, BootstrapState};
use crate::types::{row_to_record, CanonicalType};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use mysql_async::prelude::*;
use mysql_async::{Params, Value as SqlValue};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 레코드 출력과 위치 기록을 함께 보관
pub struct Output<W: Write> {
    pub emitter: RecordEmitter<W>,
    pub tracker: PositionTracker,
}

pub type SharedOutput<W> = Arc<Mutex<Output<W>>>;

impl<W: Write> Output<W> {
    pub fn new(out: W, state: StateDocument) -> Self {
        Output {
            emitter: RecordEmitter::new(out),
            tracker: PositionTracker::new(state),
        }
    }

    /// 스트림 SCHEMA (LOG_BASED면 `_sdc_deleted_at` 포함)
    pub fn announce(
        &mut self,
        entry: &CatalogEntry,
        keys: &[String],
        method: ReplicationMethod,
    ) -> Result<bool> {
        let schema = entry.json_schema(method == ReplicationMethod::LogBased);
        self.emitter.announce_schema(
            &entry.tap_stream_id,
            &schema,
            keys,
            &entry.bookmark_properties(),
        )
    }

    pub fn emit_records(
        &mut self,
        stream: &str,
        records: &[Map<String, Value>],
        version: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now();
        for record in records {
            self.emitter.emit_record(stream, record, version, now)?;
        }
        Ok(())
    }

    pub fn emit_custom(&mut self, result: &CustomResultSet) -> Result<()> {
        self.emitter.announce_schema(
            &result.stream,
            &result.json_schema(),
            &result.key_properties,
            &[],
        )?;
        self.emit_records(&result.stream, &result.rows, None)?;
        self.emitter.flush()
    }

    pub fn commit(&mut self, stream: &str, position: &BinlogPosition) -> Result<()> {
        self.tracker.commit(&mut self.emitter, stream, position)
    }

    pub fn commit_many(&mut self, positions: &[(String, BinlogPosition)]) -> Result<()> {
        self.tracker.commit_many(&mut self.emitter, positions)
    }

    pub fn commit_watermark(&mut self, stream: &str, key: &str, value: Value) -> Result<()> {
        self.tracker.commit_watermark(&mut self.emitter, stream, key, value)
    }

    pub fn write_state(&mut self) -> Result<()> {
        self.tracker.write_state(&mut self.emitter)
    }

    /// 로그 위치를 잃은 스트림을 초기화해 다음 실행에서 bootstrap하도록 기록
    pub fn reset_streams(&mut self, streams: &[String]) -> Result<()> {
        for stream in streams {
            self.tracker.reset(stream);
        }
        self.write_state()
    }

    pub fn into_inner(self) -> W {
        self.emitter.into_inner()
    }
}

/// 로그 이벤트 -> 레코드. 선택되지 않은 컬럼은 제외하고, 삭제는 이전 이미지에
/// `_sdc_deleted_at`을 붙임
pub fn log_record(entry: &CatalogEntry, event: &LogEvent) -> Option<Map<String, Value>> {
    let (image, deleted) = match event.kind {
        ChangeKind::Insert | ChangeKind::Update => (event.after.as_ref()?, false),
        ChangeKind::Delete => (event.before.as_ref()?, true),
        ChangeKind::SchemaChange | ChangeKind::Heartbeat => return None,
    };

    let mut record: Map<String, Value> = image
        .iter()
        .filter(|(name, _)| entry.is_column_selected(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    if deleted {
        record.insert(
            DELETED_AT_COLUMN.to_string(),
            json!(event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
    }
    Some(record)
}

/// 분배기 결과를 출력으로 옮기는 싱크
///
/// 트랜잭션의 레코드는 바로 쓰고, 위치는 스트림별로 모아 두었다가
/// `commit_interval` 트랜잭션마다, idle heartbeat, 종료 시에 한 번에 기록합니다.
pub struct LogSink<'a, W: Write> {
    output: &'a Mutex<Output<W>>,
    pool: Option<&'a ConnectionPool>,
    streams: HashMap<String, PlannedStream>,
    pending: BTreeMap<String, BinlogPosition>,
    since_commit: usize,
    commit_interval: usize,
}

impl<'a, W: Write> LogSink<'a, W> {
    pub fn new(
        output: &'a Mutex<Output<W>>,
        pool: Option<&'a ConnectionPool>,
        streams: Vec<PlannedStream>,
        commit_interval: usize,
    ) -> Self {
        LogSink {
            output,
            pool,
            streams: streams
                .into_iter()
                .map(|s| (s.stream_id().to_string(), s))
                .collect(),
            pending: BTreeMap::new(),
            since_commit: 0,
            commit_interval: commit_interval.max(1),
        }
    }

    /// 모아 둔 위치 기록
    pub fn commit_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let positions: Vec<(String, BinlogPosition)> = std::mem::take(&mut self.pending)
            .into_iter()
            .collect();
        self.since_commit = 0;
        self.output.lock().commit_many(&positions)
    }

    fn apply_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        {
            let mut out = self.output.lock();
            for event in &transaction.events {
                let planned = match self.streams.get(&event.stream) {
                    Some(planned) => planned,
                    None => continue,
                };
                if let Some(record) = log_record(&planned.entry, event) {
                    out.emitter
                        .emit_record(&event.stream, &record, None, Utc::now())?;
                }
                self.pending
                    .insert(event.stream.clone(), transaction.position.clone());
            }
        }

        self.since_commit += 1;
        if self.since_commit >= self.commit_interval {
            self.commit_pending()?;
        }
        Ok(())
    }

    /// 컬럼 목록을 새로 받았으면 반영하고 SCHEMA를 다시 알림
    fn announce(
        &mut self,
        stream: &str,
        columns: Option<Vec<ColumnInfo>>,
    ) -> Result<Option<Vec<ColumnSchema>>> {
        let planned = match self.streams.get_mut(stream) {
            Some(planned) => planned,
            None => return Ok(None),
        };
        let refreshed = columns.map(|infos| {
            planned.entry.apply_columns(&infos);
            planned.entry.columns.clone()
        });
        self.output.lock().announce(
            &planned.entry,
            &planned.key_columns,
            ReplicationMethod::LogBased,
        )?;
        Ok(refreshed)
    }
}

#[async_trait]
impl<'a, W: Write + Send> LogEventSink for LogSink<'a, W> {
    async fn on_transaction(&mut self, transaction: Transaction) -> Result<()> {
        self.apply_transaction(&transaction)
    }

    async fn on_schema_change(&mut self, event: &LogEvent) -> Result<Option<Vec<ColumnSchema>>> {
        let (database, table) = match self.streams.get(&event.stream) {
            Some(planned) => (planned.entry.database.clone(), planned.entry.table_name.clone()),
            None => return Ok(None),
        };

        let columns = match self.pool {
            Some(pool) => match pool.get_table_schema(&database, &table).await {
                Ok(infos) => Some(infos),
                Err(e) => {
                    let err = CdcError::SchemaIntrospectionError {
                        stream: event.stream.clone(),
                        message: e.to_string(),
                    };
                    warn!(stream = %event.stream, "{}", err);
                    None
                }
            },
            None => None,
        };
        self.announce(&event.stream, columns)
    }

    async fn on_heartbeat(&mut self, event: &LogEvent, idle: bool) -> Result<()> {
        self.pending
            .insert(event.stream.clone(), event.position.clone());
        if idle {
            self.commit_pending()?;
        }
        Ok(())
    }
}

/// 분배기를 로그 끝(또는 취소)까지 실행. 실패하거나 취소되어도 이미 출력한
/// 트랜잭션까지의 위치는 기록합니다.
pub async fn stream_log<W, S>(
    output: &Mutex<Output<W>>,
    pool: Option<&ConnectionPool>,
    streams: Vec<PlannedStream>,
    demux: &mut Demultiplexer,
    source: &mut S,
    commit_interval: usize,
    cancel: &CancellationToken,
) -> Result<DemuxStats>
where
    W: Write + Send,
    S: LogSource + ?Sized,
{
    let mut sink = LogSink::new(output, pool, streams, commit_interval);
    let result = demux.run(source, &mut sink, cancel).await;
    let committed = sink.commit_pending();

    let stats = result?;
    committed?;
    info!(
        "Binlog streaming finished: {} transactions, {} skipped, {} schema changes",
        stats.transactions, stats.skipped_transactions, stats.schema_changes
    );
    Ok(stats)
}

/// INCREMENTAL 조회 SQL
pub fn incremental_sql(
    entry: &CatalogEntry,
    columns: &[&ColumnSchema],
    replication_key: &str,
    has_watermark: bool,
) -> String {
    let select = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let key = quote_ident(replication_key);
    let predicate = if has_watermark {
        format!(" WHERE {} >= ?", key)
    } else {
        String::new()
    };
    format!(
        "SELECT {} FROM {}{} ORDER BY {} ASC",
        select,
        qualified_table(&entry.database, &entry.table_name),
        predicate,
        key
    )
}

/// FULL_TABLE 조회 SQL (키가 있으면 키 순서)
pub fn full_table_sql(entry: &CatalogEntry, columns: &[&ColumnSchema], keys: &[String]) -> String {
    let select = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let table = qualified_table(&entry.database, &entry.table_name);
    if keys.is_empty() {
        return format!("SELECT {} FROM {}", select, table);
    }
    let order = keys.iter().map(|k| quote_ident(k)).collect::<Vec<_>>().join(", ");
    format!("SELECT {} FROM {} ORDER BY {}", select, table, order)
}

/// 상태에 저장된 워터마크 -> 쿼리 파라미터
pub fn watermark_param(value: &Value, canonical: CanonicalType) -> SqlValue {
    match value {
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => SqlValue::Int(i),
            (None, Some(u), _) => SqlValue::UInt(u),
            (None, None, Some(f)) => SqlValue::Double(f),
            _ => SqlValue::NULL,
        },
        Value::String(s) if canonical == CanonicalType::Timestamp => {
            match DateTime::parse_from_rfc3339(s) {
                Ok(ts) => SqlValue::Bytes(
                    ts.with_timezone(&Utc)
                        .format("%Y-%m-%d %H:%M:%S%.6f")
                        .to_string()
                        .into_bytes(),
                ),
                Err(_) => SqlValue::Bytes(s.clone().into_bytes()),
            }
        }
        Value::String(s) => SqlValue::Bytes(s.clone().into_bytes()),
        Value::Bool(b) => SqlValue::Int(i64::from(*b)),
        _ => SqlValue::NULL,
    }
}

/// sync 결과 요약
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub streams_synced: usize,
    pub streams_failed: Vec<String>,
    pub log: Option<DemuxStats>,
    pub custom: CustomRunSummary,
    pub records: u64,
}

/// 카탈로그 문서 생성 (`--discover`)
pub async fn discover(config: &TapConfig) -> Result<Value> {
    let pool = ConnectionPool::connect(config.connection_config()).await?;
    let catalog = catalog::discover(&pool, config).await?;
    info!("Discovered {} streams", catalog.streams.len());
    let document = catalog.to_document()?;
    pool.disconnect().await?;
    Ok(document)
}

/// MySQL tap 엔진
pub struct CdcEngine<W: Write + Send> {
    config: TapConfig,
    pool: ConnectionPool,
    output: SharedOutput<W>,
    cancel: CancellationToken,
}

impl<W: Write + Send> CdcEngine<W> {
    /// 풀 연결 후 엔진 생성
    pub async fn connect(
        config: TapConfig,
        out: W,
        state: StateDocument,
        cancel: CancellationToken,
    ) -> Result<Self> {
        info!("Starting MySQL tap");
        let pool = ConnectionPool::connect(config.connection_config()).await?;
        let server_id = pool.get_server_id().await?;
        info!("Connected to MySQL server: {}", server_id);

        Ok(CdcEngine {
            config,
            pool,
            output: Arc::new(Mutex::new(Output::new(out, state))),
            cancel,
        })
    }

    pub fn output(&self) -> &SharedOutput<W> {
        &self.output
    }

    /// 선택된 모든 스트림 동기화
    pub async fn sync(&self, catalog: &Catalog) -> Result<SyncSummary> {
        let caps = match self.pool.log_capabilities().await {
            Ok(caps) => Some(caps),
            Err(e) => {
                warn!("Binary log settings unavailable: {}", e);
                None
            }
        };
        let retained: Vec<BinaryLogFile> = caps
            .as_ref()
            .map(|c| c.retained_logs.clone())
            .unwrap_or_default();

        let plan = {
            let mut out = self.output.lock();
            let plan = planner::plan(catalog, out.tracker.state(), caps.as_ref());
            for stream in &plan.bookmark_resets {
                info!(stream = %stream, "Replication settings changed, bookmark reset");
                out.tracker.reset(stream);
            }
            plan
        };
        info!(
            "Planned {} table passes, {} log-based streams, {} custom streams",
            plan.table_passes.len(),
            plan.log_group.streams.len(),
            self.config.custom_streams.len()
        );

        let mut summary = SyncSummary::default();

        let passes: Vec<(String, Result<u64>)> = stream::iter(&plan.table_passes)
            .map(|planned| async move {
                (planned.stream_id().to_string(), self.sync_table(planned).await)
            })
            .buffer_unordered(self.config.pool_size.max(1))
            .collect()
            .await;
        for (stream, result) in passes {
            match result {
                Ok(rows) => {
                    info!(stream = %stream, "Synced {} rows", rows);
                    summary.streams_synced += 1;
                }
                Err(e) if !e.is_fatal() => {
                    warn!(stream = %stream, "Stream failed: {}", e);
                    summary.streams_failed.push(stream);
                }
                Err(e) => return Err(e),
            }
        }

        summary.log = self.sync_log_group(&plan.log_group, &retained).await?;
        if summary.log.is_some() {
            summary.streams_synced += plan.log_group.streams.len();
        }

        if !self.config.custom_streams.is_empty() {
            let runner = PoolRunner::new(&self.pool);
            summary.custom = custom::run_custom_streams(
                &runner,
                custom::substitutions(&self.config.custom_streams),
                self.config.pool_size,
                |result| self.output.lock().emit_custom(&result),
            )
            .await?;
        }

        let mut out = self.output.lock();
        out.tracker.set_currently_syncing(None);
        out.write_state()?;
        summary.records = out.emitter.records_written();
        Ok(summary)
    }

    async fn sync_table(&self, planned: &PlannedStream) -> Result<u64> {
        if self.cancel.is_cancelled() {
            return Err(CdcError::Cancelled);
        }
        match planned.method {
            ReplicationMethod::Incremental => self.incremental(planned).await,
            _ => self.full_table(planned).await,
        }
    }

    /// 전체 테이블 재적재. 레코드에 version을 붙이고 끝나면 ACTIVATE_VERSION
    async fn full_table(&self, planned: &PlannedStream) -> Result<u64> {
        let stream = planned.stream_id();
        let entry = &planned.entry;
        let version = Utc::now().timestamp_millis();

        {
            let mut out = self.output.lock();
            let first_sync = out
                .tracker
                .bookmark(stream)
                .and_then(|b| b.version)
                .is_none();
            out.tracker.set_currently_syncing(Some(stream.to_string()));
            out.tracker.set_version(stream, version);
            out.announce(entry, &planned.key_columns, ReplicationMethod::FullTable)?;
            if first_sync {
                out.emitter.emit_activate_version(stream, version)?;
            }
            out.write_state()?;
        }

        let columns = snapshot_columns(entry, &planned.key_columns);
        let sql = full_table_sql(entry, &columns, &planned.key_columns);
        let rows = self
            .read_rows(stream, &columns, &sql, Params::Empty, |records| {
                self.output
                    .lock()
                    .emit_records(stream, &records, Some(version))
            })
            .await?;

        let mut out = self.output.lock();
        out.emitter.emit_activate_version(stream, version)?;
        out.write_state()?;
        Ok(rows)
    }

    /// 워터마크 이상인 행만 키 순서로 읽고, 배치마다 워터마크 기록
    async fn incremental(&self, planned: &PlannedStream) -> Result<u64> {
        let stream = planned.stream_id();
        let entry = &planned.entry;
        let key = entry.selection.replication_key.clone().ok_or_else(|| {
            CdcError::ConfigError(format!("{} has no replication_key", stream))
        })?;
        let canonical = entry
            .column(&key)
            .map(|c| c.canonical)
            .unwrap_or(CanonicalType::String);

        let watermark = {
            let mut out = self.output.lock();
            out.tracker.set_currently_syncing(Some(stream.to_string()));
            out.announce(entry, &planned.key_columns, ReplicationMethod::Incremental)?;
            out.tracker
                .bookmark(stream)
                .filter(|b| b.replication_key.as_deref() == Some(key.as_str()))
                .and_then(|b| b.replication_key_value.clone())
        };
        if let Some(value) = &watermark {
            info!(stream = %stream, "Resuming from {} >= {}", key, value);
        }

        let columns = snapshot_columns(entry, &planned.key_columns);
        let mut selected = columns.clone();
        if !selected.iter().any(|c| c.name == key) {
            if let Some(column) = entry.column(&key) {
                selected.push(column);
            }
        }
        let sql = incremental_sql(entry, &selected, &key, watermark.is_some());
        let params = match &watermark {
            Some(value) => Params::Positional(vec![watermark_param(value, canonical)]),
            None => Params::Empty,
        };

        self.read_rows(stream, &selected, &sql, params, |records| {
            let last = records
                .iter()
                .rev()
                .filter_map(|r| r.get(&key))
                .find(|v| !v.is_null())
                .cloned();
            let mut out = self.output.lock();
            out.emit_records(stream, &records, None)?;
            match last {
                Some(value) => out.commit_watermark(stream, &key, value),
                None => Ok(()),
            }
        })
        .await
    }

    /// 쿼리 결과를 배치 단위로 `on_batch`에 넘김
    async fn read_rows<F>(
        &self,
        stream: &str,
        columns: &[&ColumnSchema],
        sql: &str,
        params: Params,
        mut on_batch: F,
    ) -> Result<u64>
    where
        F: FnMut(Vec<Map<String, Value>>) -> Result<()>,
    {
        debug!(stream = %stream, "Querying: {}", sql);
        let batch_size = self.config.snapshot_batch_size.max(1);
        let mut conn = self.pool.get_conn().await?;
        let mut result = conn.exec_iter(sql, params).await?;

        let mut batch = Vec::with_capacity(batch_size);
        let mut failure: Option<CdcError> = None;
        let mut rows: u64 = 0;
        result
            .for_each(|row| {
                if failure.is_some() {
                    return;
                }
                if self.cancel.is_cancelled() {
                    failure = Some(CdcError::Cancelled);
                    return;
                }
                batch.push(row_to_record(&row, columns));
                rows += 1;
                if batch.len() >= batch_size {
                    if let Err(e) = on_batch(std::mem::take(&mut batch)) {
                        failure = Some(e);
                    }
                }
            })
            .await?;

        if let Some(e) = failure {
            return Err(e);
        }
        if !batch.is_empty() {
            on_batch(batch)?;
        }
        Ok(rows)
    }

    /// 스냅샷 후 스냅샷 위치를 기록. 반환값은 로그 스트리밍 시작 위치
    async fn bootstrap(&self, planned: &PlannedStream) -> Result<BinlogPosition> {
        let stream = planned.stream_id();
        let mut state = BootstrapState::NeedsBootstrap.transition(BootstrapState::Snapshotting)?;
        {
            let mut out = self.output.lock();
            out.tracker.reset(stream);
            out.tracker.set_currently_syncing(Some(stream.to_string()));
        }

        let result = snapshot::snapshot_table(
            &self.pool,
            &planned.entry,
            &planned.key_columns,
            self.config.snapshot_batch_size,
            &self.cancel,
            |records| self.output.lock().emit_records(stream, &records, None),
        )
        .await;
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                state = state.transition(BootstrapState::NeedsBootstrap)?;
                debug!(stream = %stream, "Bootstrap state {}", state);
                return Err(e);
            }
        };

        state = state.transition(BootstrapState::SnapshotComplete)?;
        self.output.lock().commit(stream, &result.position)?;
        state = state.transition(BootstrapState::LogStreaming)?;
        info!(stream = %stream, "Bootstrapped {} rows, {} from {}", result.rows, state, result.position);
        Ok(result.position)
    }

    async fn sync_log_group(
        &self,
        group: &LogGroup,
        retained: &[BinaryLogFile],
    ) -> Result<Option<DemuxStats>> {
        if group.is_empty() {
            return Ok(None);
        }

        let mut starts: Vec<(&PlannedStream, BinlogPosition)> = Vec::new();
        let mut needs_bootstrap: Vec<&PlannedStream> = Vec::new();
        {
            let mut out = self.output.lock();
            for planned in &group.streams {
                out.announce(&planned.entry, &planned.key_columns, ReplicationMethod::LogBased)?;
                let stored = out.tracker.load(planned.stream_id());
                let decision = snapshot::decide_bootstrap(planned.stream_id(), stored, retained);
                debug!(stream = %planned.stream_id(), "Initial state {}", decision.initial_state());
                match decision {
                    BootstrapDecision::Resume(position) => starts.push((planned, position)),
                    BootstrapDecision::Bootstrap => needs_bootstrap.push(planned),
                }
            }
        }

        let snapshots: Vec<(&PlannedStream, Result<BinlogPosition>)> = stream::iter(needs_bootstrap)
            .map(|planned| async move { (planned, self.bootstrap(planned).await) })
            .buffer_unordered(self.config.pool_size.max(1))
            .collect()
            .await;
        for (planned, result) in snapshots {
            match result {
                Ok(position) => starts.push((planned, position)),
                Err(e) if !e.is_fatal() => {
                    warn!(stream = %planned.stream_id(), "Bootstrap failed, retried next run: {}", e)
                }
                Err(e) => return Err(e),
            }
        }
        if starts.is_empty() {
            return Ok(None);
        }

        let subscriptions: Vec<Subscription> = starts
            .iter()
            .map(|(planned, start)| Subscription {
                stream: planned.stream_id().to_string(),
                database: planned.entry.database.clone(),
                table: planned.entry.table_name.clone(),
                start: start.clone(),
                columns: planned.entry.columns.clone(),
            })
            .collect();
        let streams: Vec<PlannedStream> = starts.iter().map(|(p, _)| (*p).clone()).collect();
        let names: Vec<String> = streams.iter().map(|p| p.stream_id().to_string()).collect();

        match self.stream_subscriptions(subscriptions, streams).await {
            Ok(stats) => Ok(Some(stats)),
            Err(CdcError::ReplicationLogUnavailable(message)) => {
                for stream in &names {
                    warn!(stream = %stream, "Binary log unavailable ({}), resync on next run", message);
                }
                self.output.lock().reset_streams(&names)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn stream_subscriptions(
        &self,
        subscriptions: Vec<Subscription>,
        streams: Vec<PlannedStream>,
    ) -> Result<DemuxStats> {
        let checksum = self
            .pool
            .get_variable("binlog_checksum")
            .await?
            .map(|v| !v.eq_ignore_ascii_case("NONE"))
            .unwrap_or(false);

        let mut demux = Demultiplexer::new(subscriptions)?;
        if !self.config.continuous {
            let status = self.pool.get_binlog_status().await?;
            demux = demux.with_stop_position(BinlogPosition::new(status.file, status.position));
        }
        let start = match demux.start_position() {
            Some(start) => start,
            None => return Ok(DemuxStats::default()),
        };

        let client = BinlogClient::new(
            self.pool.config().clone(),
            BinlogClientOptions {
                continuous: self.config.continuous,
                heartbeat_period: Duration::from_secs(self.config.heartbeat_period_secs),
                checksum,
            },
        );
        let mut source = client.start(&start, self.cancel.clone()).await?;

        let stats = stream_log(
            &*self.output,
            Some(&self.pool),
            streams,
            &mut demux,
            &mut source,
            self.config.state_commit_interval,
            &self.cancel,
        )
        .await?;
        debug!("Read {} binlog events", source.events_read());
        Ok(stats)
    }

    /// 출력을 비우고 풀 연결 종료
    pub async fn shutdown(self) -> Result<()> {
        self.output.lock().emitter.flush()?;
        self.pool.disconnect().await?;
        info!("MySQL tap stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_entry;
    use crate::custom::tests::{example_config, FakeRunner};
    use crate::demux::tests::{insert, order_image, subscription, update, EventBuilder, MemorySource};
    use crate::emitter::tests::parse_lines;
    use crate::events::RowImage;
    use chrono::TimeZone;

    fn orders_stream() -> PlannedStream {
        let mut entry = sample_entry("shop", "orders");
        entry.selection.selected = true;
        entry.selection.replication_method = ReplicationMethod::LogBased;
        PlannedStream {
            entry,
            method: ReplicationMethod::LogBased,
            key_columns: vec!["id".to_string()],
        }
    }

    fn snapshot_row(id: i64) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("id".to_string(), json!(id));
        row.insert("status".to_string(), json!("new"));
        row.insert("amount".to_string(), json!(10.5));
        row.insert("updated_at".to_string(), Value::Null);
        row
    }

    fn message_types(messages: &[Value]) -> Vec<&str> {
        messages
            .iter()
            .map(|m| m["type"].as_str().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_orders_bootstrap_then_update() {
        let planned = orders_stream();
        let output = Mutex::new(Output::new(Vec::new(), StateDocument::default()));

        let mut b = EventBuilder::new("mysql-bin.000003", 4);
        // 스냅샷 이전에 커밋된 변경 (스냅샷에 이미 포함)
        let mut events = b.transaction(ChangeKind::Insert, "shop", "orders", vec![insert(3, "new")]);
        let t0 = b.position();
        events.extend(b.transaction(ChangeKind::Update, "shop", "orders", vec![update(2, "new", "paid")]));

        {
            let mut out = output.lock();
            out.announce(&planned.entry, &planned.key_columns, ReplicationMethod::LogBased)
                .unwrap();
            let rows: Vec<_> = (1..=3).map(snapshot_row).collect();
            out.emit_records("shop-orders", &rows, None).unwrap();
            out.commit("shop-orders", &t0).unwrap();
        }

        let mut demux = Demultiplexer::new(vec![subscription("shop", "orders", t0.clone())]).unwrap();
        let stats = stream_log(
            &output,
            None,
            vec![planned],
            &mut demux,
            &mut MemorySource::new(events),
            1,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(stats.transactions, 1);

        let messages = parse_lines(&output.into_inner().into_inner());
        assert_eq!(
            message_types(&messages),
            vec!["SCHEMA", "RECORD", "RECORD", "RECORD", "STATE", "RECORD", "STATE"]
        );
        assert!(messages[0]["schema"]["properties"][DELETED_AT_COLUMN].is_object());

        let bookmark = &messages[4]["value"]["bookmarks"]["shop-orders"];
        assert_eq!(bookmark["log_file"], json!("mysql-bin.000003"));
        assert_eq!(bookmark["log_pos"], json!(t0.position));

        assert_eq!(messages[5]["record"]["id"], json!(2));
        assert_eq!(messages[5]["record"]["status"], json!("paid"));

        let advanced = messages[6]["value"]["bookmarks"]["shop-orders"]["log_pos"]
            .as_u64()
            .unwrap();
        assert!(advanced > t0.position);
    }

    #[tokio::test]
    async fn test_delete_and_commit_interval() {
        let planned = orders_stream();
        let output = Mutex::new(Output::new(Vec::new(), StateDocument::default()));
        output
            .lock()
            .announce(&planned.entry, &planned.key_columns, ReplicationMethod::LogBased)
            .unwrap();

        let mut b = EventBuilder::new("mysql-bin.000001", 4);
        let start = b.position();
        let mut events = b.transaction(ChangeKind::Insert, "shop", "orders", vec![insert(10, "new")]);
        events.extend(b.transaction(ChangeKind::Insert, "shop", "orders", vec![insert(11, "new")]));
        events.extend(b.transaction(
            ChangeKind::Delete,
            "shop",
            "orders",
            vec![RowImage {
                before: Some(order_image(10, "new")),
                after: None,
            }],
        ));
        let end = b.position();

        let mut demux = Demultiplexer::new(vec![subscription("shop", "orders", start)]).unwrap();
        stream_log(
            &output,
            None,
            vec![planned],
            &mut demux,
            &mut MemorySource::new(events),
            2,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let messages = parse_lines(&output.into_inner().into_inner());
        assert_eq!(
            message_types(&messages),
            vec!["SCHEMA", "RECORD", "RECORD", "STATE", "RECORD", "STATE"]
        );
        let deleted = &messages[4]["record"];
        assert_eq!(deleted["id"], json!(10));
        assert!(deleted[DELETED_AT_COLUMN].as_str().unwrap().ends_with('Z'));
        assert_eq!(
            messages[5]["value"]["bookmarks"]["shop-orders"]["log_pos"],
            json!(end.position)
        );
    }

    #[tokio::test]
    async fn test_cancel_keeps_committed_positions() {
        let planned = orders_stream();
        let output = Mutex::new(Output::new(Vec::new(), StateDocument::default()));
        let mut demux = Demultiplexer::new(vec![subscription(
            "shop",
            "orders",
            BinlogPosition::new("mysql-bin.000001", 4),
        )])
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = stream_log(
            &output,
            None,
            vec![planned],
            &mut demux,
            &mut MemorySource::new(Vec::new()),
            1,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CdcError::Cancelled));
        assert!(output.into_inner().into_inner().is_empty());
    }

    #[test]
    fn test_log_record_respects_selection() {
        let mut entry = sample_entry("shop", "orders");
        entry.selection.columns = Some(vec!["status".to_string()]);

        let mut after = Map::new();
        after.insert("id".to_string(), json!(1));
        after.insert("status".to_string(), json!("new"));
        after.insert("amount".to_string(), json!(3.5));
        let event = LogEvent {
            stream: "shop-orders".to_string(),
            kind: ChangeKind::Insert,
            position: BinlogPosition::new("mysql-bin.000001", 100),
            transaction: None,
            seq: 0,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            before: None,
            after: Some(after),
        };

        let record = log_record(&entry, &event).unwrap();
        assert_eq!(record.len(), 2);
        assert!(record.contains_key("id"));
        assert!(!record.contains_key("amount"));

        let heartbeat = LogEvent {
            kind: ChangeKind::Heartbeat,
            after: None,
            ..event
        };
        assert!(log_record(&entry, &heartbeat).is_none());
    }

    #[tokio::test]
    async fn test_custom_results_are_emitted_per_schema() {
        let output = Mutex::new(Output::new(Vec::new(), StateDocument::default()));
        let summary = custom::run_custom_streams(
            &FakeRunner,
            custom::substitutions(&[example_config()]),
            2,
            |result| output.lock().emit_custom(&result),
        )
        .await
        .unwrap();
        assert_eq!(summary.failed, vec!["examplequery-a".to_string()]);

        let messages = parse_lines(&output.into_inner().into_inner());
        assert_eq!(message_types(&messages), vec!["SCHEMA", "RECORD"]);
        assert!(messages.iter().all(|m| m["stream"] == json!("examplequery-b")));
    }

    #[test]
    fn test_reset_streams_clears_positions() {
        let state = StateDocument::from_json(
            r#"{"bookmarks": {"shop-orders": {"log_file": "mysql-bin.000002", "log_pos": 154}}}"#,
        )
        .unwrap();
        let mut output = Output::new(Vec::new(), state);
        output.reset_streams(&["shop-orders".to_string()]).unwrap();
        assert_eq!(output.tracker.load("shop-orders"), None);

        // 초기화 후에는 더 이른 위치도 기록 가능
        output
            .commit("shop-orders", &BinlogPosition::new("mysql-bin.000001", 4))
            .unwrap();
        let messages = parse_lines(&output.into_inner());
        assert_eq!(message_types(&messages), vec!["STATE", "STATE"]);
        assert!(messages[0]["value"]["bookmarks"]["shop-orders"]
            .get("log_file")
            .is_none());
    }

    #[test]
    fn test_table_sql() {
        let mut entry = sample_entry("shop", "orders");
        entry.selection.replication_key = Some("updated_at".to_string());
        let keys = vec!["id".to_string()];
        let columns = snapshot_columns(&entry, &keys);

        assert_eq!(
            full_table_sql(&entry, &columns, &keys),
            "SELECT `id`, `status`, `amount`, `updated_at` FROM `shop`.`orders` ORDER BY `id`"
        );
        assert_eq!(
            incremental_sql(&entry, &columns, "updated_at", true),
            "SELECT `id`, `status`, `amount`, `updated_at` FROM `shop`.`orders` WHERE `updated_at` >= ? ORDER BY `updated_at` ASC"
        );
        assert!(!incremental_sql(&entry, &columns, "updated_at", false).contains("WHERE"));
    }

    #[test]
    fn test_watermark_param() {
        assert_eq!(
            watermark_param(&json!(42), CanonicalType::Integer),
            SqlValue::Int(42)
        );
        assert_eq!(
            watermark_param(&json!("2024-01-02T03:04:05.000000Z"), CanonicalType::Timestamp),
            SqlValue::Bytes(b"2024-01-02 03:04:05.000000".to_vec())
        );
        assert_eq!(
            watermark_param(&json!("abc"), CanonicalType::String),
            SqlValue::Bytes(b"abc".to_vec())
        );
        assert_eq!(watermark_param(&Value::Null, CanonicalType::String), SqlValue::NULL);
    }
}

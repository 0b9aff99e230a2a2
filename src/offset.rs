//! Binlog 처리 위치 추적 (Position Tracker)
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치
//!
//! 위치는 항상 `RecordEmitter::flush` 이후에만 기록되므로, 상태에 남은 위치까지의
//! 레코드는 모두 출력으로 넘어간 상태입니다.

use crate::emitter::RecordEmitter;
use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// 모든 binlog 파일은 4바이트 매직 헤더 뒤에서 시작
pub const BINLOG_START_POSITION: u64 = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_file = match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.filename.cmp(&other.filename),
        };
        by_file.then(self.position.cmp(&other.position))
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// 스트림별 북마크
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_pos: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_key_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl Bookmark {
    pub fn position(&self) -> Option<BinlogPosition> {
        match (&self.log_file, self.log_pos) {
            (Some(file), Some(pos)) => Some(BinlogPosition::new(file.clone(), pos)),
            _ => None,
        }
    }
}

/// 상태 문서 (STATE 메시지의 value)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub bookmarks: BTreeMap<String, Bookmark>,
    #[serde(default)]
    pub currently_syncing: Option<String>,
}

impl StateDocument {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CdcError::ConfigError(format!("cannot read state {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// 빈 문서나 `{"value": {...}}`로 감싼 STATE 메시지도 허용
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(StateDocument::default());
        }
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| CdcError::ConfigError(format!("invalid state: {}", e)))?;
        let value = match value.get("value") {
            Some(inner) if value.get("bookmarks").is_none() => inner.clone(),
            _ => value,
        };
        let state: StateDocument = serde_json::from_value(value)
            .map_err(|e| CdcError::ConfigError(format!("invalid state: {}", e)))?;

        for (stream, bookmark) in &state.bookmarks {
            if bookmark.log_file.is_some() != bookmark.log_pos.is_some() {
                return Err(CdcError::ConfigError(format!(
                    "bookmark for {} has log_file and log_pos out of pair",
                    stream
                )));
            }
        }
        Ok(state)
    }
}

/// 스트림별 위치와 워터마크를 관리
///
/// 출력(emitter)과 함께 하나의 mutex 뒤에 두고 사용합니다.
#[derive(Debug, Default)]
pub struct PositionTracker {
    state: StateDocument,
    /// 명시적으로 초기화되어 위치 역행이 허용되는 스트림
    reset_streams: HashSet<String>,
}

impl PositionTracker {
    pub fn new(state: StateDocument) -> Self {
        PositionTracker {
            state,
            reset_streams: HashSet::new(),
        }
    }

    pub fn state(&self) -> &StateDocument {
        &self.state
    }

    /// 마지막으로 기록된 위치. None이면 bootstrap이 필요
    pub fn load(&self, stream: &str) -> Option<BinlogPosition> {
        self.state.bookmarks.get(stream).and_then(Bookmark::position)
    }

    pub fn bookmark(&self, stream: &str) -> Option<&Bookmark> {
        self.state.bookmarks.get(stream)
    }

    /// 스트림 하나의 위치 기록
    pub fn commit<W: Write>(
        &mut self,
        emitter: &mut RecordEmitter<W>,
        stream: &str,
        position: &BinlogPosition,
    ) -> Result<()> {
        self.commit_many(emitter, &[(stream.to_string(), position.clone())])
    }

    /// 여러 스트림의 위치를 한 번에 기록하고 STATE 하나를 내보냄
    ///
    /// 위치가 바뀐 스트림이 없으면 아무것도 쓰지 않습니다.
    pub fn commit_many<W: Write>(
        &mut self,
        emitter: &mut RecordEmitter<W>,
        positions: &[(String, BinlogPosition)],
    ) -> Result<()> {
        let mut changed = Vec::new();
        for (stream, position) in positions {
            match self.load(stream) {
                Some(committed) if *position < committed => {
                    if !self.reset_streams.contains(stream) {
                        return Err(CdcError::PositionRegression {
                            stream: stream.clone(),
                            committed: committed.to_string(),
                            requested: position.to_string(),
                        });
                    }
                    changed.push((stream, position));
                }
                Some(committed) if *position == committed => {}
                _ => changed.push((stream, position)),
            }
        }
        if changed.is_empty() {
            return Ok(());
        }

        emitter.flush()?;
        for (stream, position) in changed {
            let bookmark = self.state.bookmarks.entry(stream.clone()).or_default();
            bookmark.log_file = Some(position.filename.clone());
            bookmark.log_pos = Some(position.position);
            self.reset_streams.remove(stream);
            debug!(stream = %stream, "Committed position {}", position);
        }
        emitter.emit_state(&self.state)
    }

    /// INCREMENTAL 스트림의 워터마크 기록
    pub fn commit_watermark<W: Write>(
        &mut self,
        emitter: &mut RecordEmitter<W>,
        stream: &str,
        key: &str,
        value: Value,
    ) -> Result<()> {
        emitter.flush()?;
        let bookmark = self.state.bookmarks.entry(stream.to_string()).or_default();
        bookmark.replication_key = Some(key.to_string());
        bookmark.replication_key_value = Some(value);
        emitter.emit_state(&self.state)
    }

    /// 북마크를 비우고 다음 위치 기록에서 역행을 허용 (전체 재동기화)
    pub fn reset(&mut self, stream: &str) {
        if let Some(bookmark) = self.state.bookmarks.get_mut(stream) {
            bookmark.log_file = None;
            bookmark.log_pos = None;
            bookmark.replication_key = None;
            bookmark.replication_key_value = None;
        }
        self.reset_streams.insert(stream.to_string());
    }

    pub fn set_version(&mut self, stream: &str, version: i64) {
        self.state
            .bookmarks
            .entry(stream.to_string())
            .or_default()
            .version = Some(version);
    }

    pub fn set_currently_syncing(&mut self, stream: Option<String>) {
        self.state.currently_syncing = stream;
    }

    /// 현재 상태를 STATE 메시지로 내보냄
    pub fn write_state<W: Write>(&self, emitter: &mut RecordEmitter<W>) -> Result<()> {
        emitter.flush()?;
        emitter.emit_state(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::tests::parse_lines;
    use serde_json::json;

    #[test]
    fn test_binlog_position_parse() {
        let pos = BinlogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
        assert_eq!(pos.to_string(), "mysql-bin.000123:4096");
    }

    #[test]
    fn test_position_ordering_across_files() {
        let a = BinlogPosition::new("mysql-bin.000009", 90_000);
        let b = BinlogPosition::new("mysql-bin.000010", 4);
        let c = BinlogPosition::new("mysql-bin.000010", 120);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(
            vec![c.clone(), a.clone(), b.clone()].into_iter().min(),
            Some(a)
        );
    }

    #[test]
    fn test_state_loading() {
        let state = StateDocument::from_json(
            r#"{"bookmarks": {"shop-orders": {"log_file": "mysql-bin.000002", "log_pos": 154}}}"#,
        )
        .unwrap();
        let tracker = PositionTracker::new(state);
        assert_eq!(
            tracker.load("shop-orders"),
            Some(BinlogPosition::new("mysql-bin.000002", 154))
        );
        assert_eq!(tracker.load("shop-customers"), None);

        let wrapped = StateDocument::from_json(
            r#"{"type": "STATE", "value": {"bookmarks": {"a-b": {"version": 3}}}}"#,
        )
        .unwrap();
        assert_eq!(wrapped.bookmarks["a-b"].version, Some(3));

        assert_eq!(StateDocument::from_json("  ").unwrap(), StateDocument::default());

        let err = StateDocument::from_json(r#"{"bookmarks": {"a-b": {"log_file": "x.000001"}}}"#)
            .unwrap_err();
        assert!(matches!(err, CdcError::ConfigError(_)));
    }

    #[test]
    fn test_commit_writes_state_and_rejects_regression() {
        let mut emitter = RecordEmitter::new(Vec::new());
        let mut tracker = PositionTracker::default();

        let t1 = BinlogPosition::new("mysql-bin.000001", 500);
        tracker.commit(&mut emitter, "shop-orders", &t1).unwrap();
        // 같은 위치는 STATE를 다시 쓰지 않음
        tracker.commit(&mut emitter, "shop-orders", &t1).unwrap();

        let earlier = BinlogPosition::new("mysql-bin.000001", 100);
        let err = tracker
            .commit(&mut emitter, "shop-orders", &earlier)
            .unwrap_err();
        assert!(matches!(err, CdcError::PositionRegression { .. }));

        tracker.reset("shop-orders");
        assert_eq!(tracker.load("shop-orders"), None);
        tracker.commit(&mut emitter, "shop-orders", &earlier).unwrap();
        assert_eq!(tracker.load("shop-orders"), Some(earlier.clone()));

        // 초기화는 한 번의 기록에만 적용
        tracker.reset_streams.insert("other".to_string());
        let older = BinlogPosition::new("mysql-bin.000001", 50);
        assert!(tracker.commit(&mut emitter, "shop-orders", &older).is_err());

        let messages = parse_lines(&emitter.into_inner());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["type"], json!("STATE"));
        assert_eq!(
            messages[1]["value"]["bookmarks"]["shop-orders"]["log_pos"],
            json!(100)
        );
    }

    #[test]
    fn test_commit_watermark() {
        let mut emitter = RecordEmitter::new(Vec::new());
        let mut tracker = PositionTracker::default();
        tracker.set_version("shop-orders", 7);
        tracker
            .commit_watermark(&mut emitter, "shop-orders", "updated_at", json!("2024-01-01T00:00:00Z"))
            .unwrap();

        let bookmark = tracker.bookmark("shop-orders").unwrap();
        assert_eq!(bookmark.replication_key.as_deref(), Some("updated_at"));
        assert_eq!(bookmark.version, Some(7));
        assert_eq!(parse_lines(&emitter.into_inner()).len(), 1);
    }
}

//! 레코드 출력 (Singer JSON lines)
//!
//! 스트림마다 SCHEMA 메시지가 먼저 나가야 RECORD를 쓸 수 있습니다. 스키마가 바뀌면
//! 새 SCHEMA가 다시 나간 뒤에만 그 스키마를 따르는 레코드가 나갑니다.

use crate::error::{CdcError, Result};
use crate::offset::StateDocument;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Write;
use tracing::debug;

/// 출력 메시지
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message<'a> {
    Schema {
        stream: &'a str,
        schema: &'a Value,
        key_properties: &'a [String],
        bookmark_properties: &'a [String],
    },
    Record {
        stream: &'a str,
        record: &'a Map<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<i64>,
        time_extracted: String,
    },
    State {
        value: &'a StateDocument,
    },
    ActivateVersion {
        stream: &'a str,
        version: i64,
    },
}

/// 스트림별 마지막 SCHEMA
#[derive(Debug, Clone, PartialEq)]
struct Announced {
    schema: Value,
    key_properties: Vec<String>,
}

pub struct RecordEmitter<W: Write> {
    out: W,
    announced: HashMap<String, Announced>,
    records_written: u64,
}

impl<W: Write> RecordEmitter<W> {
    pub fn new(out: W) -> Self {
        RecordEmitter {
            out,
            announced: HashMap::new(),
            records_written: 0,
        }
    }

    fn write(&mut self, message: &Message<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, message)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    /// 스키마가 이전과 다를 때만 SCHEMA를 씀. 썼으면 true
    pub fn announce_schema(
        &mut self,
        stream: &str,
        schema: &Value,
        key_properties: &[String],
        bookmark_properties: &[String],
    ) -> Result<bool> {
        let next = Announced {
            schema: schema.clone(),
            key_properties: key_properties.to_vec(),
        };
        if self.announced.get(stream) == Some(&next) {
            return Ok(false);
        }

        self.write(&Message::Schema {
            stream,
            schema,
            key_properties,
            bookmark_properties,
        })?;
        self.announced.insert(stream.to_string(), next);
        debug!(stream = %stream, "Schema announced");
        Ok(true)
    }

    pub fn is_announced(&self, stream: &str) -> bool {
        self.announced.contains_key(stream)
    }

    pub fn emit_record(
        &mut self,
        stream: &str,
        record: &Map<String, Value>,
        version: Option<i64>,
        time_extracted: DateTime<Utc>,
    ) -> Result<()> {
        if !self.is_announced(stream) {
            return Err(CdcError::SchemaNotAnnounced(stream.to_string()));
        }
        self.write(&Message::Record {
            stream,
            record,
            version,
            time_extracted: time_extracted.to_rfc3339_opts(SecondsFormat::Micros, true),
        })?;
        self.records_written += 1;
        Ok(())
    }

    pub fn emit_state(&mut self, state: &StateDocument) -> Result<()> {
        self.write(&Message::State { value: state })?;
        self.flush()
    }

    /// 전체 테이블 재적재가 끝났음을 알림
    pub fn emit_activate_version(&mut self, stream: &str, version: i64) -> Result<()> {
        if !self.is_announced(stream) {
            return Err(CdcError::SchemaNotAnnounced(stream.to_string()));
        }
        self.write(&Message::ActivateVersion { stream, version })
    }

    /// 지금까지 쓴 메시지를 출력으로 넘김
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn parse_lines(bytes: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(bytes)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn record(id: i64) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".to_string(), json!(id));
        map
    }

    #[test]
    fn test_record_requires_schema() {
        let mut emitter = RecordEmitter::new(Vec::new());
        let err = emitter
            .emit_record("shop-orders", &record(1), None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, CdcError::SchemaNotAnnounced(_)));
        assert!(emitter.into_inner().is_empty());
    }

    #[test]
    fn test_schema_written_once_until_changed() {
        let mut emitter = RecordEmitter::new(Vec::new());
        let keys = vec!["id".to_string()];
        let v1 = json!({"type": "object", "properties": {"id": {"type": "integer"}}});
        let v2 = json!({"type": "object", "properties": {"id": {"type": "integer"}, "note": {}}});

        assert!(emitter.announce_schema("shop-orders", &v1, &keys, &[]).unwrap());
        assert!(!emitter.announce_schema("shop-orders", &v1, &keys, &[]).unwrap());
        emitter
            .emit_record("shop-orders", &record(1), Some(5), Utc::now())
            .unwrap();
        assert!(emitter.announce_schema("shop-orders", &v2, &keys, &[]).unwrap());
        emitter.emit_activate_version("shop-orders", 5).unwrap();
        assert_eq!(emitter.records_written(), 1);

        let messages = parse_lines(&emitter.into_inner());
        let types: Vec<&str> = messages
            .iter()
            .map(|m| m["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["SCHEMA", "RECORD", "SCHEMA", "ACTIVATE_VERSION"]);
        assert_eq!(messages[0]["key_properties"], json!(["id"]));
        assert_eq!(messages[1]["version"], json!(5));
        assert!(messages[1]["time_extracted"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_state_message() {
        let mut emitter = RecordEmitter::new(Vec::new());
        emitter.emit_state(&StateDocument::default()).unwrap();
        let messages = parse_lines(&emitter.into_inner());
        assert_eq!(
            messages[0],
            json!({"type": "STATE", "value": {"bookmarks": {}, "currently_syncing": null}})
        );
    }
}

//! 탭 설정 파일 (JSON) 로딩 및 검증
//!
//! 알 수 없는 키는 거부하고, 로딩 시점에 값 범위를 검증합니다.

use crate::connection::{ConnectionConfig, SslConfig};
use crate::error::{CdcError, Result};
use crate::planner::ReplicationMethod;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

/// 커스텀 쿼리 SQL 안의 스키마 자리표시자
pub const SCHEMA_PLACEHOLDER: &str = "{db_schema}";

/// 탭 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TapConfig {
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "port_from_any")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub ssl: Option<SslConfig>,
    /// 복제 클라이언트로 등록할 때 사용할 server_id
    #[serde(default = "default_server_id")]
    pub server_id: u32,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub snapshot_batch_size: usize,
    /// 로그 트랜잭션 몇 개마다 STATE를 내보낼지
    #[serde(default = "default_commit_interval")]
    pub state_commit_interval: usize,
    #[serde(default)]
    pub filter_dbs: Option<Vec<String>>,
    #[serde(default)]
    pub default_replication_method: Option<ReplicationMethod>,
    #[serde(default)]
    pub select_all: bool,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_period_secs: u64,
    /// true면 로그 끝에서 멈추지 않고 계속 대기
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub custom_streams: Vec<CustomStreamConfig>,
}

/// 커스텀 쿼리 스트림 정의
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomStreamConfig {
    pub name: String,
    pub db_schemas: Vec<String>,
    pub sql: String,
    #[serde(default)]
    pub primary_keys: Vec<String>,
}

fn default_port() -> u16 {
    3306
}

fn default_server_id() -> u32 {
    6401
}

fn default_pool_size() -> usize {
    4
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_batch_size() -> usize {
    10_000
}

fn default_commit_interval() -> usize {
    100
}

fn default_heartbeat() -> u64 {
    30
}

/// 원래 탭은 port를 문자열로 받았으므로 둘 다 허용
fn port_from_any<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => Ok(n),
        PortValue::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {}", s))),
    }
}

impl TapConfig {
    /// 파일에서 설정 읽기
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CdcError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: TapConfig = serde_json::from_str(raw)
            .map_err(|e| CdcError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(CdcError::ConfigError("host must not be empty".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(CdcError::ConfigError("user must not be empty".to_string()));
        }
        if self.pool_size == 0 {
            return Err(CdcError::ConfigError("pool_size must be at least 1".to_string()));
        }
        if self.snapshot_batch_size == 0 {
            return Err(CdcError::ConfigError(
                "snapshot_batch_size must be at least 1".to_string(),
            ));
        }
        if self.state_commit_interval == 0 {
            return Err(CdcError::ConfigError(
                "state_commit_interval must be at least 1".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for custom in &self.custom_streams {
            if custom.name.trim().is_empty() {
                return Err(CdcError::ConfigError(
                    "custom stream name must not be empty".to_string(),
                ));
            }
            if custom.db_schemas.is_empty() {
                return Err(CdcError::ConfigError(format!(
                    "custom stream {} has no db_schemas",
                    custom.name
                )));
            }
            if !custom.sql.contains(SCHEMA_PLACEHOLDER) {
                return Err(CdcError::ConfigError(format!(
                    "custom stream {} sql has no {} placeholder",
                    custom.name, SCHEMA_PLACEHOLDER
                )));
            }
            for schema in &custom.db_schemas {
                if !seen.insert(custom.stream_name(schema)) {
                    return Err(CdcError::ConfigError(format!(
                        "duplicate custom stream {}",
                        custom.stream_name(schema)
                    )));
                }
            }
        }
        Ok(())
    }

    /// 연결 관리자용 설정으로 변환
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            hostname: self.host.clone(),
            port: self.port,
            username: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            server_id: self.server_id,
            timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            pool_size: self.pool_size,
            ssl: self.ssl.clone(),
        }
    }

    pub fn default_method(&self) -> ReplicationMethod {
        self.default_replication_method
            .unwrap_or(ReplicationMethod::FullTable)
    }
}

impl CustomStreamConfig {
    /// 스키마별 스트림 이름 (name-schema)
    pub fn stream_name(&self, schema: &str) -> String {
        format!("{}-{}", self.name, schema)
    }

    /// 자리표시자를 스키마 이름으로 치환한 SQL
    pub fn render_sql(&self, schema: &str) -> String {
        self.sql.replace(SCHEMA_PLACEHOLDER, schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_as_string_or_number() {
        let config = TapConfig::from_json(
            r#"{"host": "db", "port": "3307", "user": "tap", "password": "x"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 3307);
        assert_eq!(config.pool_size, 4);

        let config =
            TapConfig::from_json(r#"{"host": "db", "port": 3308, "user": "tap"}"#).unwrap();
        assert_eq!(config.port, 3308);
        assert_eq!(config.default_method(), ReplicationMethod::FullTable);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = TapConfig::from_json(r#"{"host": "db", "user": "tap", "bogus": 1}"#)
            .unwrap_err();
        assert!(matches!(err, CdcError::ConfigError(_)));
    }

    #[test]
    fn test_custom_stream_validation() {
        let err = TapConfig::from_json(
            r#"{"host": "db", "user": "tap", "custom_streams": [
                {"name": "q", "db_schemas": ["a"], "sql": "SELECT 1"}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("placeholder"));

        let config = TapConfig::from_json(
            r#"{"host": "db", "user": "tap", "default_replication_method": "LOG_BASED",
                "custom_streams": [
                {"name": "examplequery", "db_schemas": ["a", "b"],
                 "sql": "SELECT * FROM {db_schema}.orders"}
            ]}"#,
        )
        .unwrap();
        let custom = &config.custom_streams[0];
        assert_eq!(custom.stream_name("b"), "examplequery-b");
        assert_eq!(custom.render_sql("a"), "SELECT * FROM a.orders");
        assert_eq!(config.default_method(), ReplicationMethod::LogBased);
    }

    #[test]
    fn test_zero_pool_rejected() {
        let err = TapConfig::from_json(r#"{"host": "db", "user": "tap", "pool_size": 0}"#)
            .unwrap_err();
        assert!(err.to_string().contains("pool_size"));
    }
}

//! MySQL 데이터베이스 연결 관리
//!
//! 쿼리용 연결은 `mysql_async::Pool`에서 빌려 씁니다. 동시 연결 수는 `pool_size`로
//! 제한됩니다. 복제 로그 소켓은 풀과 별개로 `binlog_client`가 직접 엽니다.

use crate::error::{CdcError, Result};
use crate::planner::LogCapabilities;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, SslOpts};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 카탈로그에서 항상 제외하는 시스템 스키마
pub const SYSTEM_SCHEMAS: [&str; 4] = ["information_schema", "performance_schema", "mysql", "sys"];

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    pub server_id: u32,
    pub timeout: Duration,
    pub read_timeout: Duration,
    pub pool_size: usize,
    pub ssl: Option<SslConfig>,
}

/// TLS 설정
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslConfig {
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub skip_domain_validation: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 6401,
            timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            pool_size: 4,
            ssl: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    fn build_opts(&self) -> Opts {
        let constraints = PoolConstraints::new(0, self.pool_size.max(1)).unwrap_or_default();

        let ssl_opts = self.ssl.as_ref().map(|ssl| {
            SslOpts::default()
                .with_root_cert_path(ssl.ca_path.clone())
                .with_danger_accept_invalid_certs(ssl.accept_invalid_certs)
                .with_danger_skip_domain_validation(ssl.skip_domain_validation)
        });

        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .pool_opts(PoolOpts::default().with_constraints(constraints))
            .ssl_opts(ssl_opts)
            .into()
    }
}

/// 풀링된 MySQL 연결 관리자
#[derive(Clone)]
pub struct ConnectionPool {
    pool: Pool,
    config: ConnectionConfig,
}

impl ConnectionPool {
    /// 풀을 만들고 연결 하나로 접속 가능 여부를 확인
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let pool = Pool::new(config.build_opts());
        let manager = ConnectionPool { pool, config };

        let mut conn = manager.get_conn().await?;
        let version: Option<String> = conn
            .query_first("SELECT VERSION()")
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to query version: {}", e)))?;
        info!(
            "Connected to MySQL {} at {}:{}",
            version.unwrap_or_default(),
            manager.config.hostname,
            manager.config.port
        );

        Ok(manager)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// 풀에서 연결 하나 가져오기 (timeout 적용)
    pub async fn get_conn(&self) -> Result<Conn> {
        match tokio::time::timeout(self.config.timeout, self.pool.get_conn()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(CdcError::ConnectionError(format!(
                "Failed to connect to MySQL: {}",
                e
            ))),
            Err(_) => Err(CdcError::ConnectionError(format!(
                "Timed out after {:?} waiting for a pooled connection",
                self.config.timeout
            ))),
        }
    }

    /// 현재 Binlog 상태 조회
    pub async fn get_binlog_status(&self) -> Result<BinlogStatus> {
        let mut conn = self.get_conn().await?;
        read_binlog_status(&mut conn).await
    }

    /// 서버에 남아 있는 binlog 파일 목록
    pub async fn list_binary_logs(&self) -> Result<Vec<BinaryLogFile>> {
        let mut conn = self.get_conn().await?;
        let rows: Vec<Row> = conn.query("SHOW BINARY LOGS").await.map_err(|e| {
            CdcError::ReplicationLogUnavailable(format!("SHOW BINARY LOGS failed: {}", e))
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let name: Option<String> = row.get(0);
                let size: Option<u64> = row.get(1);
                name.map(|name| BinaryLogFile {
                    name,
                    size: size.unwrap_or(0),
                })
            })
            .collect())
    }

    /// 로그 기반 복제 전제 조건 조회
    pub async fn log_capabilities(&self) -> Result<LogCapabilities> {
        let log_bin = self
            .get_variable("log_bin")
            .await?
            .map(|v| v.eq_ignore_ascii_case("ON") || v == "1")
            .unwrap_or(false);
        let binlog_format = self.get_variable("binlog_format").await?.unwrap_or_default();
        let binlog_row_image = self
            .get_variable("binlog_row_image")
            .await?
            .unwrap_or_else(|| "FULL".to_string());

        let retained_logs = if log_bin {
            match self.list_binary_logs().await {
                Ok(files) => files,
                Err(e) => {
                    warn!("Binary logs are not listable: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        debug!(
            "log_bin={}, binlog_format={}, binlog_row_image={}, retained files={}",
            log_bin,
            binlog_format,
            binlog_row_image,
            retained_logs.len()
        );

        Ok(LogCapabilities {
            log_bin,
            binlog_format,
            binlog_row_image,
            retained_logs,
        })
    }

    /// MySQL 서버 ID 조회
    pub async fn get_server_id(&self) -> Result<u32> {
        let mut conn = self.get_conn().await?;
        let result: Option<u32> = conn
            .query_first("SELECT @@server_id")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query server_id: {}", e)))?;

        Ok(result.unwrap_or(self.config.server_id))
    }

    /// 전역 변수 조회 (이름은 내부 상수만 사용)
    pub async fn get_variable(&self, name: &str) -> Result<Option<String>> {
        let mut conn = self.get_conn().await?;
        let query = format!("SHOW GLOBAL VARIABLES LIKE '{}'", name);
        let result: Vec<(String, String)> = conn
            .query(&query)
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query {}: {}", name, e)))?;

        Ok(result.into_iter().next().map(|(_, v)| v))
    }

    /// 테이블/뷰 목록 (시스템 스키마 제외)
    pub async fn list_tables(&self, filter_dbs: Option<&[String]>) -> Result<Vec<TableInfo>> {
        let mut conn = self.get_conn().await?;
        let rows: Vec<(String, String, String)> = conn
            .query(
                "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE \
                 FROM INFORMATION_SCHEMA.TABLES \
                 ORDER BY TABLE_SCHEMA, TABLE_NAME",
            )
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to list tables: {}", e)))?;

        Ok(rows
            .into_iter()
            .filter(|(schema, _, _)| !SYSTEM_SCHEMAS.contains(&schema.as_str()))
            .filter(|(schema, _, _)| filter_dbs.map_or(true, |dbs| dbs.contains(schema)))
            .map(|(database, table, table_type)| TableInfo {
                database,
                table,
                is_view: table_type == "VIEW",
            })
            .collect())
    }

    /// 테이블 스키마 조회
    pub async fn get_table_schema(&self, database: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut conn = self.get_conn().await?;
        let result: Vec<(String, String, String, String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, DATA_TYPE, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

        Ok(result
            .into_iter()
            .map(|(name, data_type, column_type, is_nullable, column_key)| ColumnInfo {
                name,
                data_type: data_type.to_lowercase(),
                column_type: column_type.to_lowercase(),
                nullable: is_nullable == "YES",
                column_key,
            })
            .collect())
    }

    pub async fn disconnect(self) -> Result<()> {
        self.pool
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to disconnect pool: {}", e)))
    }
}

/// 현재 binlog 파일/위치 조회. 트랜잭션 안에서도 호출할 수 있도록 Queryable을 받음.
///
/// MySQL 8.2부터 `SHOW MASTER STATUS`는 `SHOW BINARY LOG STATUS`로 바뀌었으므로 둘 다 시도합니다.
pub async fn read_binlog_status<Q: Queryable + Send>(q: &mut Q) -> Result<BinlogStatus> {
    let rows: Vec<Row> = match q.query("SHOW BINARY LOG STATUS").await {
        Ok(rows) => rows,
        Err(_) => q.query("SHOW MASTER STATUS").await.map_err(|e| {
            CdcError::ReplicationLogUnavailable(format!("Failed to query binlog status: {}", e))
        })?,
    };

    let row = rows.into_iter().next().ok_or_else(|| {
        CdcError::ReplicationLogUnavailable("No binlog status available (log_bin off?)".to_string())
    })?;

    let file: String = row
        .get(0)
        .ok_or_else(|| CdcError::QueryError("binlog status without file".to_string()))?;
    let position: u64 = row
        .get(1)
        .ok_or_else(|| CdcError::QueryError("binlog status without position".to_string()))?;

    Ok(BinlogStatus { file, position })
}

/// Binlog 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogStatus {
    pub file: String,
    pub position: u64,
}

/// 서버가 보관 중인 binlog 파일
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryLogFile {
    pub name: String,
    pub size: u64,
}

/// 테이블 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub database: String,
    pub table: String,
    pub is_view: bool,
}

/// 테이블 컬럼 정보 (INFORMATION_SCHEMA.COLUMNS 한 행)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub column_type: String,
    pub nullable: bool,
    pub column_key: String,
}

/// 식별자를 backtick으로 감쌈
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// `db`.`table`
pub fn qualified_table(database: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(database), quote_ident(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.pool_size, 4);
    }

    #[test]
    fn test_connection_config_new() {
        let config = ConnectionConfig::new("127.0.0.1", "root");
        assert_eq!(config.hostname, "127.0.0.1");
        assert_eq!(config.username, "root");
    }

    #[test]
    fn test_build_opts_carries_credentials() {
        let mut config = ConnectionConfig::new("db.internal", "tap");
        config.password = "p@ss:word/".to_string();
        config.port = 3307;
        let opts = config.build_opts();
        assert_eq!(opts.ip_or_hostname(), "db.internal");
        assert_eq!(opts.tcp_port(), 3307);
        assert_eq!(opts.user(), Some("tap"));
        assert_eq!(opts.pass(), Some("p@ss:word/"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "`orders`");
        assert_eq!(qualified_table("shop", "we`ird"), "`shop`.`we``ird`");
    }
}

//! 탭 에러 타입
//!
//! 스트림 단위 에러(스키마 조회 실패, 커스텀 쿼리 실패 등)는 실행을 중단하지 않고
//! 경고로 보고됩니다. 공유 인프라(연결, 로그 커서) 에러만 실행 전체에 치명적입니다.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("스키마 조회 에러 ({stream}): {message}")]
    SchemaIntrospectionError { stream: String, message: String },

    #[error("복제 로그를 사용할 수 없음: {0}")]
    ReplicationLogUnavailable(String),

    #[error("저장된 로그 위치가 더 이상 유효하지 않음 ({stream}): {position}")]
    PositionInvalid { stream: String, position: String },

    #[error("로그 위치 역행 ({stream}): {committed} -> {requested}")]
    PositionRegression {
        stream: String,
        committed: String,
        requested: String,
    },

    #[error("스냅샷 중단 ({stream}): {message}")]
    SnapshotInterrupted { stream: String, message: String },

    #[error("커스텀 쿼리 에러 ({stream}): {message}")]
    CustomQueryError { stream: String, message: String },

    #[error("스키마가 먼저 전송되지 않은 스트림: {0}")]
    SchemaNotAnnounced(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Timeout 에러")]
    Timeout,

    #[error("실행이 취소되었습니다")]
    Cancelled,
}

impl CdcError {
    /// 실행 전체를 중단해야 하는 에러인지 여부
    pub fn is_fatal(&self) -> bool {
        match self {
            CdcError::SchemaIntrospectionError { .. }
            | CdcError::ReplicationLogUnavailable(_)
            | CdcError::PositionInvalid { .. }
            | CdcError::SnapshotInterrupted { .. }
            | CdcError::CustomQueryError { .. } => false,
            _ => true,
        }
    }

    /// 해당 스트림 이름 (스트림 단위 에러인 경우)
    pub fn stream(&self) -> Option<&str> {
        match self {
            CdcError::SchemaIntrospectionError { stream, .. }
            | CdcError::PositionInvalid { stream, .. }
            | CdcError::PositionRegression { stream, .. }
            | CdcError::SnapshotInterrupted { stream, .. }
            | CdcError::CustomQueryError { stream, .. } => Some(stream),
            CdcError::SchemaNotAnnounced(stream) => Some(stream),
            _ => None,
        }
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Io(e) => CdcError::ConnectionError(e.to_string()),
            mysql_async::Error::Driver(e) => CdcError::ConnectionError(e.to_string()),
            other => CdcError::QueryError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_local_errors_are_not_fatal() {
        let err = CdcError::CustomQueryError {
            stream: "examplequery-a".to_string(),
            message: "boom".to_string(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.stream(), Some("examplequery-a"));

        assert!(CdcError::ConnectionError("refused".to_string()).is_fatal());
        assert!(CdcError::Cancelled.is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: CdcError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, CdcError::IoError(_)));
    }
}

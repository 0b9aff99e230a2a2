//! MySQL tap: 카탈로그 탐색, 테이블 동기화, binlog 기반 변경 데이터 캡처
//!
//! 이 라이브러리는 MySQL 테이블을 Singer 메시지(SCHEMA / RECORD / STATE)로 내보냅니다.
//! 주요 기능:
//! - 카탈로그 탐색과 스트림별 복제 방식 결정
//! - FULL_TABLE / INCREMENTAL 테이블 동기화
//! - Binlog 프로토콜 파싱과 LOG_BASED 변경 추적 (스냅샷 bootstrap 포함)
//! - 커스텀 쿼리 스트림

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod catalog;
pub mod cdc_engine;
pub mod config;
pub mod connection;
pub mod custom;
pub mod demux;
pub mod emitter;
pub mod error;
pub mod events;
pub mod offset;
pub mod planner;
pub mod protocol;
pub mod snapshot;
pub mod types;

pub use binlog_client::BinlogClient;
pub use catalog::{Catalog, CatalogEntry};
pub use cdc_engine::CdcEngine;
pub use config::TapConfig;
pub use connection::ConnectionPool;
pub use error::{CdcError, Result};
pub use events::{BinlogEvent, ChangeKind, EventType, LogEvent};
pub use offset::{BinlogPosition, PositionTracker, StateDocument};

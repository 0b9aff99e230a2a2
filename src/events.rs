//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의

use crate::offset::BinlogPosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN)
    QueryEvent = 2,
    StopEvent = 3,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 포맷 설명 이벤트 (체크섬 알고리즘 포함)
    FormatDescriptionEvent = 15,
    /// 트랜잭션 커밋
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    HeartbeatEvent = 27,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 29,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    PreviousGtidsEvent = 35,
    /// 압축된 트랜잭션 페이로드
    TransactionPayloadEvent = 40,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            29 => EventType::RowsQueryEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            40 => EventType::TransactionPayloadEvent,
            _ => EventType::Unknown,
        }
    }

    pub fn is_row_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV1
                | EventType::UpdateRowsEventV1
                | EventType::DeleteRowsEventV1
                | EventType::WriteRowsEvent
                | EventType::UpdateRowsEvent
                | EventType::DeleteRowsEvent
        )
    }

    /// v2 row 이벤트는 헤더에 extra-data 블록이 있음
    pub fn is_v2_row_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEvent | EventType::UpdateRowsEvent | EventType::DeleteRowsEvent
        )
    }
}

/// binlog 안의 컬럼 타입 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => return None,
        })
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타입스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

/// 테이블 맵 정보 (컬럼 메타데이터)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입들
    pub column_types: Vec<ColumnType>,
    /// 컬럼별 메타데이터 (길이, 정밀도 등)
    pub column_meta: Vec<u16>,
    /// nullable 비트맵
    pub nullable_bitmap: Vec<u8>,
}

/// 한 행의 변경 전/후 이미지. 이미지에 없는 컬럼은 None.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowImage {
    pub before: Option<Vec<Option<CellValue>>>,
    pub after: Option<Vec<Option<CellValue>>>,
}

/// WRITE/UPDATE/DELETE_ROWS 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsData {
    /// 테이블 ID
    pub table_id: u64,
    /// 플래그
    pub flags: u16,
    /// 컬럼 개수
    pub column_count: usize,
    /// 행 데이터들
    pub rows: Vec<RowImage>,
}

/// 셀 값 (binlog에서 디코딩한 원시 값)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    SignedInt(i64),
    Float(f32),
    Double(f64),
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    Time {
        negative: bool,
        hours: u32,
        minutes: u8,
        seconds: u8,
        micros: u32,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micros: u32,
    },
    /// epoch 초 + 마이크로초 (TIMESTAMP 컬럼)
    Timestamp {
        seconds: u32,
        micros: u32,
    },
    Year(u16),
    Json(Value),
    /// ENUM 인덱스 (1부터 시작, 0은 빈 값)
    Enum(u16),
    /// SET 비트마스크
    Set(u64),
    Bit(Vec<u8>),
}

/// GTID 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtidEventData {
    /// GTID 문자열 (format: uuid:sequence-number)
    pub gtid: String,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    /// 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    pub error_code: u16,
    /// 데이터베이스명 (USE 컨텍스트)
    pub database: String,
    /// 쿼리 문자열
    pub query: String,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// 포맷 설명 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
    /// 0 = NONE, 1 = CRC32
    pub checksum_alg: u8,
}

/// 모든 Binlog 이벤트를 포함하는 열거형
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BinlogEventData {
    FormatDescription(FormatDescriptionData),
    TableMap(TableMapData),
    WriteRows(RowsData),
    UpdateRows(RowsData),
    DeleteRows(RowsData),
    /// 구독하지 않은 테이블의 row 이벤트 (행 이미지를 디코딩하지 않음)
    SkippedRows { table_id: u64 },
    Query(QueryEventData),
    Rotate(RotateEventData),
    Gtid(GtidEventData),
    Xid { xid: u64 },
    Heartbeat { log_name: String },
    RowsQuery(String),
    Unknown(EventType),
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogEvent {
    /// 이벤트 헤더
    pub header: EventHeader,
    /// 이벤트 데이터
    pub data: BinlogEventData,
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    SchemaChange,
    /// 구독 스트림에 해당하는 변경 없이 위치만 전진
    Heartbeat,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
            ChangeKind::SchemaChange => "SCHEMA_CHANGE",
            ChangeKind::Heartbeat => "HEARTBEAT",
        }
    }
}

/// 스트림에 태깅된 로그 변경 이벤트 (application-level view)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// 대상 스트림 (tap_stream_id)
    pub stream: String,
    pub kind: ChangeKind,
    /// 이 이벤트를 포함한 트랜잭션의 커밋 위치
    pub position: BinlogPosition,
    /// GTID (있는 경우)
    pub transaction: Option<String>,
    /// 트랜잭션 안에서의 순번
    pub seq: u32,
    pub timestamp: DateTime<Utc>,
    /// 변경 전 데이터 (UPDATE/DELETE)
    pub before: Option<Map<String, Value>>,
    /// 변경 후 데이터 (INSERT/UPDATE)
    pub after: Option<Map<String, Value>>,
}

//! MySQL Binlog 이벤트 디코더
//!
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - CRC32 (4 bytes, binlog_checksum=CRC32일 때)
//!
//! 구독하지 않은 테이블의 row 이벤트는 행 이미지를 디코딩하지 않고 건너뜁니다.

use crate::error::{CdcError, Result};
use crate::events::*;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor, Read};
use tracing::{debug, trace};

pub const EVENT_HEADER_SIZE: usize = 19;
const CHECKSUM_SIZE: usize = 4;

/// (database, table)
pub type TableRef = (String, String);

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Binlog 이벤트 디코더 (table map 캐시 보유)
#[derive(Debug, Default)]
pub struct BinlogDecoder {
    table_cache: HashMap<u64, TableMapData>,
    table_filter: Option<HashSet<TableRef>>,
    checksum: bool,
}

impl BinlogDecoder {
    pub fn new(checksum: bool) -> Self {
        BinlogDecoder {
            table_cache: HashMap::new(),
            table_filter: None,
            checksum,
        }
    }

    /// 행 이미지를 디코딩할 테이블 목록. 설정하지 않으면 모든 테이블을 디코딩
    pub fn set_table_filter(&mut self, tables: HashSet<TableRef>) {
        self.table_filter = Some(tables);
    }

    pub fn table(&self, table_id: u64) -> Option<&TableMapData> {
        self.table_cache.get(&table_id)
    }

    fn is_subscribed(&self, table: &TableMapData) -> bool {
        match &self.table_filter {
            Some(filter) => filter.contains(&(table.database.clone(), table.table.clone())),
            None => true,
        }
    }

    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(CdcError::BinlogParseError(format!(
                "Invalid event header: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let event_type = cursor.read_u8()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let event_length = cursor.read_u32::<LittleEndian>()?;
        let next_pos = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        Ok(EventHeader {
            timestamp,
            event_type: EventType::from_u8(event_type),
            server_id,
            event_length,
            next_pos,
            flags,
        })
    }

    /// 이벤트 하나 디코딩 (헤더 포함 전체 바이트)
    pub fn decode(&mut self, data: &[u8]) -> Result<BinlogEvent> {
        let header = Self::parse_header(data)?;

        let end = if self.checksum && data.len() >= EVENT_HEADER_SIZE + CHECKSUM_SIZE {
            data.len() - CHECKSUM_SIZE
        } else {
            data.len()
        };
        let payload = &data[EVENT_HEADER_SIZE..end];

        trace!(
            "Decoding {:?}, {} payload bytes, next_pos={}",
            header.event_type,
            payload.len(),
            header.next_pos
        );

        let data = self.decode_payload(&header, payload).map_err(|e| {
            CdcError::BinlogParseError(format!(
                "{:?} ending at {}: {}",
                header.event_type, header.next_pos, e
            ))
        })?;

        Ok(BinlogEvent { header, data })
    }

    fn decode_payload(&mut self, header: &EventHeader, payload: &[u8]) -> io::Result<BinlogEventData> {
        let event_type = header.event_type;
        Ok(match event_type {
            EventType::FormatDescriptionEvent => {
                let fde = parse_format_description(payload, self.checksum)?;
                debug!(
                    "Format description: server {}, checksum_alg={}",
                    fde.server_version, fde.checksum_alg
                );
                BinlogEventData::FormatDescription(fde)
            }
            EventType::TableMapEvent => {
                let table_map = parse_table_map_event(payload)?;
                self.table_cache.insert(table_map.table_id, table_map.clone());
                BinlogEventData::TableMap(table_map)
            }
            t if t.is_row_event() => self.decode_rows(event_type, payload)?,
            EventType::QueryEvent => BinlogEventData::Query(parse_query_event(payload)?),
            EventType::RotateEvent => BinlogEventData::Rotate(parse_rotate_event(payload)?),
            EventType::XidEvent => {
                let mut cursor = Cursor::new(payload);
                BinlogEventData::Xid {
                    xid: cursor.read_u64::<LittleEndian>()?,
                }
            }
            EventType::GtidEvent | EventType::AnonymousGtidEvent => {
                BinlogEventData::Gtid(parse_gtid_event(payload)?)
            }
            EventType::HeartbeatEvent => BinlogEventData::Heartbeat {
                log_name: String::from_utf8_lossy(payload)
                    .trim_end_matches('\0')
                    .to_string(),
            },
            EventType::RowsQueryEvent => {
                let text = payload.get(1..).unwrap_or_default();
                BinlogEventData::RowsQuery(String::from_utf8_lossy(text).into_owned())
            }
            EventType::TransactionPayloadEvent => {
                return Err(invalid(
                    "compressed transaction payloads are not supported (binlog_transaction_compression=ON)",
                ))
            }
            other => BinlogEventData::Unknown(other),
        })
    }

    fn decode_rows(&self, event_type: EventType, payload: &[u8]) -> io::Result<BinlogEventData> {
        let mut cursor = Cursor::new(payload);
        let table_id = cursor.read_u48::<LittleEndian>()?;

        let table_map = match self.table_cache.get(&table_id) {
            Some(table_map) if self.is_subscribed(table_map) => table_map,
            _ => return Ok(BinlogEventData::SkippedRows { table_id }),
        };

        let flags = cursor.read_u16::<LittleEndian>()?;
        if event_type.is_v2_row_event() {
            let extra_len = cursor.read_u16::<LittleEndian>()? as u64;
            if extra_len > 2 {
                cursor.set_position(cursor.position() + extra_len - 2);
            }
        }

        let column_count = read_lcb(&mut cursor)? as usize;
        if column_count != table_map.column_types.len() {
            return Err(invalid(format!(
                "row has {} columns but table map of {}.{} has {}",
                column_count,
                table_map.database,
                table_map.table,
                table_map.column_types.len()
            )));
        }

        let bitmap_len = (column_count + 7) / 8;
        let mut present = vec![0u8; bitmap_len];
        cursor.read_exact(&mut present)?;

        let is_update = matches!(
            event_type,
            EventType::UpdateRowsEvent | EventType::UpdateRowsEventV1
        );
        let present_after = if is_update {
            let mut bitmap = vec![0u8; bitmap_len];
            cursor.read_exact(&mut bitmap)?;
            bitmap
        } else {
            present.clone()
        };

        let mut rows = Vec::new();
        while (cursor.position() as usize) < payload.len() {
            let image = read_row_image(&mut cursor, table_map, &present)?;
            let row = match event_type {
                EventType::WriteRowsEvent | EventType::WriteRowsEventV1 => RowImage {
                    before: None,
                    after: Some(image),
                },
                EventType::DeleteRowsEvent | EventType::DeleteRowsEventV1 => RowImage {
                    before: Some(image),
                    after: None,
                },
                _ => RowImage {
                    before: Some(image),
                    after: Some(read_row_image(&mut cursor, table_map, &present_after)?),
                },
            };
            rows.push(row);
        }

        let data = RowsData {
            table_id,
            flags,
            column_count,
            rows,
        };
        Ok(match event_type {
            EventType::WriteRowsEvent | EventType::WriteRowsEventV1 => BinlogEventData::WriteRows(data),
            EventType::DeleteRowsEvent | EventType::DeleteRowsEventV1 => {
                BinlogEventData::DeleteRows(data)
            }
            _ => BinlogEventData::UpdateRows(data),
        })
    }
}

/// Length-encoded integer 읽기
pub fn read_lcb<R: Read>(reader: &mut R) -> io::Result<u64> {
    let first = reader.read_u8()?;
    match first {
        0..=250 => Ok(first as u64),
        252 => Ok(reader.read_u16::<LittleEndian>()? as u64),
        253 => Ok(reader.read_u24::<LittleEndian>()? as u64),
        254 => reader.read_u64::<LittleEndian>(),
        _ => Err(invalid(format!("invalid length-encoded integer prefix {}", first))),
    }
}

fn read_bytes<R: Read>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map_or(false, |byte| byte & (1 << (idx % 8)) != 0)
}

fn count_bits(bitmap: &[u8], limit: usize) -> usize {
    (0..limit).filter(|i| is_bit_set(bitmap, *i)).count()
}

fn parse_format_description(payload: &[u8], checksum: bool) -> io::Result<FormatDescriptionData> {
    let mut cursor = Cursor::new(payload);
    let binlog_version = cursor.read_u16::<LittleEndian>()?;
    let version_bytes = read_bytes(&mut cursor, 50)?;
    let server_version = String::from_utf8_lossy(&version_bytes)
        .trim_end_matches('\0')
        .to_string();

    // 체크섬 알고리즘은 (CRC32를 떼어낸) payload의 마지막 바이트
    let checksum_alg = match payload.last() {
        Some(alg) if *alg <= 1 => *alg,
        _ => u8::from(checksum),
    };

    Ok(FormatDescriptionData {
        binlog_version,
        server_version,
        checksum_alg,
    })
}

/// 테이블 맵 이벤트 파싱 (19)
fn parse_table_map_event(payload: &[u8]) -> io::Result<TableMapData> {
    let mut cursor = Cursor::new(payload);

    let table_id = cursor.read_u48::<LittleEndian>()?;
    let _flags = cursor.read_u16::<LittleEndian>()?;

    let db_len = cursor.read_u8()? as usize;
    let database = String::from_utf8_lossy(&read_bytes(&mut cursor, db_len)?).into_owned();
    cursor.read_u8()?;

    let table_len = cursor.read_u8()? as usize;
    let table = String::from_utf8_lossy(&read_bytes(&mut cursor, table_len)?).into_owned();
    cursor.read_u8()?;

    let column_count = read_lcb(&mut cursor)? as usize;
    let mut column_types = Vec::with_capacity(column_count);
    for code in read_bytes(&mut cursor, column_count)? {
        let column_type = ColumnType::from_u8(code)
            .ok_or_else(|| invalid(format!("unknown column type {} in {}.{}", code, database, table)))?;
        column_types.push(column_type);
    }

    let metadata_len = read_lcb(&mut cursor)? as usize;
    let metadata = read_bytes(&mut cursor, metadata_len)?;
    let column_meta = parse_column_meta(&column_types, &metadata)?;

    let nullable_bitmap = read_bytes(&mut cursor, (column_count + 7) / 8)?;

    Ok(TableMapData {
        table_id,
        database,
        table,
        column_types,
        column_meta,
        nullable_bitmap,
    })
}

fn parse_column_meta(column_types: &[ColumnType], metadata: &[u8]) -> io::Result<Vec<u16>> {
    let mut cursor = Cursor::new(metadata);
    let mut meta = Vec::with_capacity(column_types.len());

    for column_type in column_types {
        let value = match column_type {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::Time2
            | ColumnType::DateTime2
            | ColumnType::Timestamp2 => cursor.read_u8()? as u16,
            ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit => {
                cursor.read_u16::<LittleEndian>()?
            }
            // (real_type << 8) | length, precision << 8 | scale
            ColumnType::String | ColumnType::Enum | ColumnType::Set | ColumnType::NewDecimal => {
                cursor.read_u16::<BigEndian>()?
            }
            _ => 0,
        };
        meta.push(value);
    }
    Ok(meta)
}

/// 행 이미지 하나. 이미지에 없는 컬럼은 None
fn read_row_image(
    cursor: &mut Cursor<&[u8]>,
    table_map: &TableMapData,
    present: &[u8],
) -> io::Result<Vec<Option<CellValue>>> {
    let column_count = table_map.column_types.len();
    let null_bitmap = read_bytes(cursor, (count_bits(present, column_count) + 7) / 8)?;

    let mut values = Vec::with_capacity(column_count);
    let mut null_idx = 0;
    for idx in 0..column_count {
        if !is_bit_set(present, idx) {
            values.push(None);
            continue;
        }
        let is_null = is_bit_set(&null_bitmap, null_idx);
        null_idx += 1;
        if is_null {
            values.push(Some(CellValue::Null));
            continue;
        }
        let value = read_cell(cursor, table_map.column_types[idx], table_map.column_meta[idx])?;
        values.push(Some(value));
    }
    Ok(values)
}

fn read_sized_len<R: Read>(reader: &mut R, size: u16) -> io::Result<usize> {
    Ok(match size {
        1 => reader.read_u8()? as usize,
        2 => reader.read_u16::<LittleEndian>()? as usize,
        3 => reader.read_u24::<LittleEndian>()? as usize,
        4 => reader.read_u32::<LittleEndian>()? as usize,
        other => return Err(invalid(format!("invalid length size {}", other))),
    })
}

/// 소수 초 (fsp 자릿수에 따라 0~3 바이트, big-endian) -> 마이크로초
fn read_fraction<R: Read>(reader: &mut R, fsp: u16) -> io::Result<u32> {
    Ok(match fsp {
        1 | 2 => reader.read_u8()? as u32 * 10_000,
        3 | 4 => reader.read_u16::<BigEndian>()? as u32 * 100,
        5 | 6 => reader.read_u24::<BigEndian>()?,
        _ => 0,
    })
}

fn read_cell(cursor: &mut Cursor<&[u8]>, column_type: ColumnType, meta: u16) -> io::Result<CellValue> {
    Ok(match column_type {
        ColumnType::Tiny => CellValue::SignedInt(cursor.read_i8()? as i64),
        ColumnType::Short => CellValue::SignedInt(cursor.read_i16::<LittleEndian>()? as i64),
        ColumnType::Int24 => CellValue::SignedInt(cursor.read_i24::<LittleEndian>()? as i64),
        ColumnType::Long => CellValue::SignedInt(cursor.read_i32::<LittleEndian>()? as i64),
        ColumnType::LongLong => CellValue::SignedInt(cursor.read_i64::<LittleEndian>()?),
        ColumnType::Float => CellValue::Float(cursor.read_f32::<LittleEndian>()?),
        ColumnType::Double => CellValue::Double(cursor.read_f64::<LittleEndian>()?),
        ColumnType::Year => {
            let year = cursor.read_u8()? as u16;
            CellValue::Year(if year == 0 { 0 } else { year + 1900 })
        }
        ColumnType::Date | ColumnType::NewDate => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            CellValue::Date {
                year: (packed >> 9) as u16,
                month: ((packed >> 5) & 0x0F) as u8,
                day: (packed & 0x1F) as u8,
            }
        }
        ColumnType::Time => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            CellValue::Time {
                negative: false,
                hours: packed / 10_000,
                minutes: ((packed / 100) % 100) as u8,
                seconds: (packed % 100) as u8,
                micros: 0,
            }
        }
        ColumnType::DateTime => {
            let packed = cursor.read_u64::<LittleEndian>()?;
            CellValue::DateTime {
                year: (packed / 10_000_000_000) as u16,
                month: ((packed / 100_000_000) % 100) as u8,
                day: ((packed / 1_000_000) % 100) as u8,
                hour: ((packed / 10_000) % 100) as u8,
                minute: ((packed / 100) % 100) as u8,
                second: (packed % 100) as u8,
                micros: 0,
            }
        }
        ColumnType::Timestamp => CellValue::Timestamp {
            seconds: cursor.read_u32::<LittleEndian>()?,
            micros: 0,
        },
        ColumnType::Timestamp2 => {
            let seconds = cursor.read_u32::<BigEndian>()?;
            let micros = read_fraction(cursor, meta)?;
            CellValue::Timestamp { seconds, micros }
        }
        ColumnType::DateTime2 => {
            let packed = cursor.read_uint::<BigEndian>(5)? as i64 - 0x80_0000_0000;
            let micros = read_fraction(cursor, meta)?;
            let ymd = packed >> 17;
            let year_month = ymd >> 5;
            let hms = packed & 0x1FFFF;
            CellValue::DateTime {
                year: (year_month / 13) as u16,
                month: (year_month % 13) as u8,
                day: (ymd & 0x1F) as u8,
                hour: (hms >> 12) as u8,
                minute: ((hms >> 6) & 0x3F) as u8,
                second: (hms & 0x3F) as u8,
                micros,
            }
        }
        ColumnType::Time2 => read_time2(cursor, meta)?,
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if meta < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            CellValue::Bytes(read_bytes(cursor, len)?)
        }
        ColumnType::String => {
            let mut real_type = (meta >> 8) as u8;
            let mut max_len = meta & 0xFF;
            // CHAR 길이가 255를 넘으면 real_type 상위 비트에 길이가 들어감
            if real_type & 0x30 != 0x30 {
                max_len |= (((real_type & 0x30) ^ 0x30) as u16) << 4;
                real_type |= 0x30;
            }
            match ColumnType::from_u8(real_type) {
                Some(ColumnType::Enum) => read_enum(cursor, max_len)?,
                Some(ColumnType::Set) => read_set(cursor, max_len)?,
                _ => {
                    let len = if max_len < 256 {
                        cursor.read_u8()? as usize
                    } else {
                        cursor.read_u16::<LittleEndian>()? as usize
                    };
                    CellValue::Bytes(read_bytes(cursor, len)?)
                }
            }
        }
        ColumnType::Enum => read_enum(cursor, meta & 0xFF)?,
        ColumnType::Set => read_set(cursor, meta & 0xFF)?,
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Geometry => {
            let len = read_sized_len(cursor, meta)?;
            CellValue::Bytes(read_bytes(cursor, len)?)
        }
        ColumnType::Json => {
            let len = read_sized_len(cursor, meta)?;
            let bytes = read_bytes(cursor, len)?;
            CellValue::Json(decode_json_binary(&bytes))
        }
        ColumnType::NewDecimal | ColumnType::Decimal => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xFF) as usize;
            CellValue::Decimal(read_decimal(cursor, precision, scale)?)
        }
        ColumnType::Bit => {
            let bits = (meta >> 8) as usize * 8 + (meta & 0xFF) as usize;
            CellValue::Bit(read_bytes(cursor, (bits + 7) / 8)?)
        }
        ColumnType::Null => CellValue::Null,
    })
}

fn read_enum(cursor: &mut Cursor<&[u8]>, size: u16) -> io::Result<CellValue> {
    Ok(CellValue::Enum(match size {
        1 => cursor.read_u8()? as u16,
        _ => cursor.read_u16::<LittleEndian>()?,
    }))
}

fn read_set(cursor: &mut Cursor<&[u8]>, size: u16) -> io::Result<CellValue> {
    let size = size.clamp(1, 8) as usize;
    Ok(CellValue::Set(cursor.read_uint::<LittleEndian>(size)?))
}

/// TIME2: 3바이트 정수부 + 소수부, 음수는 borrow 처리
fn read_time2(cursor: &mut Cursor<&[u8]>, fsp: u16) -> io::Result<CellValue> {
    const INT_OFFSET: i64 = 0x80_0000;
    let packed: i64 = match fsp {
        1 | 2 => {
            let mut int_part = cursor.read_u24::<BigEndian>()? as i64 - INT_OFFSET;
            let mut frac = cursor.read_u8()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = cursor.read_u24::<BigEndian>()? as i64 - INT_OFFSET;
            let mut frac = cursor.read_u16::<BigEndian>()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        5 | 6 => cursor.read_uint::<BigEndian>(6)? as i64 - 0x8000_0000_0000,
        _ => (cursor.read_u24::<BigEndian>()? as i64 - INT_OFFSET) << 24,
    };

    let negative = packed < 0;
    let packed = packed.abs();
    let hms = packed >> 24;
    Ok(CellValue::Time {
        negative,
        hours: ((hms >> 12) & 0x3FF) as u32,
        minutes: ((hms >> 6) & 0x3F) as u8,
        seconds: (hms & 0x3F) as u8,
        micros: (packed & 0xFF_FFFF) as u32,
    })
}

/// DECIMAL: 9자리씩 4바이트로 묶인 big-endian, 부호 비트 반전
fn read_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> io::Result<String> {
    const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];
    if scale > precision {
        return Err(invalid(format!("decimal scale {} > precision {}", scale, precision)));
    }

    let int_digits = precision - scale;
    let int_words = int_digits / 9;
    let int_leftover = int_digits % 9;
    let frac_words = scale / 9;
    let frac_leftover = scale % 9;
    let size = DIG_TO_BYTES[int_leftover] + int_words * 4 + frac_words * 4 + DIG_TO_BYTES[frac_leftover];

    let mut bytes = read_bytes(cursor, size)?;
    if bytes.is_empty() {
        return Ok("0".to_string());
    }
    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        for b in bytes.iter_mut() {
            *b = !*b;
        }
    }

    let mut reader = Cursor::new(bytes.as_slice());
    let mut int_part = String::new();
    if DIG_TO_BYTES[int_leftover] > 0 {
        let v = reader.read_uint::<BigEndian>(DIG_TO_BYTES[int_leftover])?;
        if v > 0 {
            int_part.push_str(&v.to_string());
        }
    }
    for _ in 0..int_words {
        let v = reader.read_u32::<BigEndian>()?;
        if int_part.is_empty() {
            if v > 0 {
                int_part.push_str(&v.to_string());
            }
        } else {
            int_part.push_str(&format!("{:09}", v));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut result = String::new();
    if negative {
        result.push('-');
    }
    result.push_str(&int_part);

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            result.push_str(&format!("{:09}", reader.read_u32::<BigEndian>()?));
        }
        if DIG_TO_BYTES[frac_leftover] > 0 {
            let v = reader.read_uint::<BigEndian>(DIG_TO_BYTES[frac_leftover])?;
            result.push_str(&format!("{:0width$}", v, width = frac_leftover));
        }
    }
    Ok(result)
}

fn parse_query_event(payload: &[u8]) -> io::Result<QueryEventData> {
    let mut cursor = Cursor::new(payload);
    let thread_id = cursor.read_u32::<LittleEndian>()?;
    let exec_time = cursor.read_u32::<LittleEndian>()?;
    let db_len = cursor.read_u8()? as usize;
    let error_code = cursor.read_u16::<LittleEndian>()?;
    let status_len = cursor.read_u16::<LittleEndian>()? as u64;
    cursor.set_position(cursor.position() + status_len);

    let database = String::from_utf8_lossy(&read_bytes(&mut cursor, db_len)?).into_owned();
    cursor.read_u8()?;

    let start = cursor.position() as usize;
    let query = String::from_utf8_lossy(payload.get(start..).unwrap_or_default()).into_owned();

    Ok(QueryEventData {
        thread_id,
        exec_time,
        error_code,
        database,
        query,
    })
}

fn parse_rotate_event(payload: &[u8]) -> io::Result<RotateEventData> {
    let mut cursor = Cursor::new(payload);
    let position = cursor.read_u64::<LittleEndian>()?;
    let name = payload.get(8..).unwrap_or_default();
    Ok(RotateEventData {
        next_binlog_name: String::from_utf8_lossy(name)
            .trim_end_matches('\0')
            .to_string(),
        position,
    })
}

fn parse_gtid_event(payload: &[u8]) -> io::Result<GtidEventData> {
    let mut cursor = Cursor::new(payload);
    let _flags = cursor.read_u8()?;
    let mut sid = [0u8; 16];
    cursor.read_exact(&mut sid)?;
    let gno = cursor.read_u64::<LittleEndian>()?;
    Ok(GtidEventData {
        gtid: format!("{}:{}", uuid::Uuid::from_bytes(sid), gno),
    })
}

/// MySQL 바이너리 JSON -> serde_json. 파싱 실패 시 텍스트 JSON, 그래도 안 되면 문자열
pub fn decode_json_binary(data: &[u8]) -> Value {
    if data.is_empty() {
        return Value::Null;
    }
    match parse_json_value(data[0], &data[1..]) {
        Ok(value) => value,
        Err(_) => serde_json::from_slice(data)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(data).into_owned())),
    }
}

fn json_len(data: &[u8], large: bool, at: usize) -> io::Result<usize> {
    let mut cursor = Cursor::new(data.get(at..).ok_or_else(|| invalid("json offset out of range"))?);
    Ok(if large {
        cursor.read_u32::<LittleEndian>()? as usize
    } else {
        cursor.read_u16::<LittleEndian>()? as usize
    })
}

fn json_var_len(data: &[u8]) -> io::Result<(usize, usize)> {
    let mut length = 0usize;
    for (i, byte) in data.iter().take(5).enumerate() {
        length |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((length, i + 1));
        }
    }
    Err(invalid("truncated json length"))
}

fn parse_json_value(type_byte: u8, data: &[u8]) -> io::Result<Value> {
    let mut cursor = Cursor::new(data);
    Ok(match type_byte {
        0x00 => parse_json_container(data, false, true)?,
        0x01 => parse_json_container(data, true, true)?,
        0x02 => parse_json_container(data, false, false)?,
        0x03 => parse_json_container(data, true, false)?,
        0x04 => match data.first() {
            Some(0x01) => Value::Bool(true),
            Some(0x02) => Value::Bool(false),
            _ => Value::Null,
        },
        0x05 => json!(cursor.read_i16::<LittleEndian>()?),
        0x06 => json!(cursor.read_u16::<LittleEndian>()?),
        0x07 => json!(cursor.read_i32::<LittleEndian>()?),
        0x08 => json!(cursor.read_u32::<LittleEndian>()?),
        0x09 => json!(cursor.read_i64::<LittleEndian>()?),
        0x0a => json!(cursor.read_u64::<LittleEndian>()?),
        0x0b => json!(cursor.read_f64::<LittleEndian>()?),
        0x0c => {
            let (len, prefix) = json_var_len(data)?;
            let bytes = data
                .get(prefix..prefix + len)
                .ok_or_else(|| invalid("truncated json string"))?;
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        0x0f => {
            let rest = data.get(1..).ok_or_else(|| invalid("truncated json opaque"))?;
            let (len, prefix) = json_var_len(rest)?;
            let bytes = rest
                .get(prefix..prefix + len)
                .ok_or_else(|| invalid("truncated json opaque"))?;
            match std::str::from_utf8(bytes) {
                Ok(text) => Value::String(text.to_string()),
                Err(_) => Value::String(hex::encode(bytes)),
            }
        }
        other => return Err(invalid(format!("unknown json type 0x{:02x}", other))),
    })
}

fn parse_json_container(data: &[u8], large: bool, object: bool) -> io::Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    let count = json_len(data, large, 0)?;
    let header = offset_size * 2;
    let key_entry = offset_size + 2;
    let value_entry = offset_size + 1;
    let values_start = header + if object { count * key_entry } else { 0 };

    let mut keys = Vec::with_capacity(count);
    if object {
        for i in 0..count {
            let at = header + i * key_entry;
            let key_offset = json_len(data, large, at)?;
            let key_len = json_len(data, false, at + offset_size)?;
            let key = data
                .get(key_offset..key_offset + key_len)
                .ok_or_else(|| invalid("truncated json key"))?;
            keys.push(String::from_utf8_lossy(key).into_owned());
        }
    }

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let at = values_start + i * value_entry;
        let value_type = *data.get(at).ok_or_else(|| invalid("truncated json entry"))?;
        let inline_at = at + 1;
        let inline = matches!(value_type, 0x04 | 0x05 | 0x06)
            || (large && matches!(value_type, 0x07 | 0x08));
        let value = if inline {
            let slice = data
                .get(inline_at..inline_at + offset_size)
                .ok_or_else(|| invalid("truncated json inline value"))?;
            parse_json_value(value_type, slice)?
        } else {
            let offset = json_len(data, large, inline_at)?;
            let slice = data.get(offset..).ok_or_else(|| invalid("json offset out of range"))?;
            parse_json_value(value_type, slice)?
        };
        values.push(value);
    }

    if object {
        let map: Map<String, Value> = keys.into_iter().zip(values).collect();
        Ok(Value::Object(map))
    } else {
        Ok(Value::Array(values))
    }
}

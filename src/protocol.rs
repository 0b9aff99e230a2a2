//! MySQL 프로토콜 패킷 처리
//!
//! 패킷: 3 bytes length + 1 byte sequence + payload.
//! 길이가 0xFFFFFF인 패킷은 다음 패킷에 이어짐.

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use std::io::{Cursor, Read};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const MAX_PACKET_LEN: usize = 0xFF_FFFF;

/// 저장된 위치의 binlog를 서버가 읽을 수 없음 (ER_MASTER_FATAL_ERROR_READING_BINLOG)
pub const ER_MASTER_FATAL_ERROR_READING_BINLOG: u16 = 1236;

/// MySQL 패킷 채널
pub struct PacketChannel<S = TcpStream> {
    stream: S,
    sequence: u8,
}

impl PacketChannel<TcpStream> {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(hostname: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| CdcError::ConnectionError(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketChannel<S> {
    pub fn new(stream: S) -> Self {
        PacketChannel { stream, sequence: 0 }
    }

    /// 새 명령을 보내기 전에 sequence를 0으로
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// 패킷 읽기 (분할 패킷은 합쳐서 반환)
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        // 모듈 수준의 byteorder/std Read와 메서드 이름이 겹침
        use tokio::io::AsyncReadExt;

        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 4];
            self.stream
                .read_exact(&mut header)
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to read packet header: {}", e)))?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to read packet body: {}", e)))?;

            if length < MAX_PACKET_LEN {
                return Ok(payload);
            }
        }
    }

    /// 패킷 쓰기 (현재 sequence 사용)
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(data.len() + 4);
        let mut chunks = data.chunks(MAX_PACKET_LEN).peekable();
        if chunks.peek().is_none() {
            buf.put_uint_le(0, 3);
            buf.put_u8(self.sequence);
            self.sequence = self.sequence.wrapping_add(1);
        }
        for chunk in chunks {
            buf.put_uint_le(chunk.len() as u64, 3);
            buf.put_u8(self.sequence);
            buf.put_slice(chunk);
            self.sequence = self.sequence.wrapping_add(1);
        }
        if data.len() % MAX_PACKET_LEN == 0 && !data.is_empty() {
            buf.put_uint_le(0, 3);
            buf.put_u8(self.sequence);
            self.sequence = self.sequence.wrapping_add(1);
        }

        self.stream
            .write_all(&buf)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to write packet: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to flush: {}", e)))?;
        Ok(())
    }

    /// 명령 패킷 전송 (sequence 0부터)
    pub async fn write_command(&mut self, command: u8, body: &[u8]) -> Result<()> {
        self.reset_sequence();
        let mut packet = Vec::with_capacity(body.len() + 1);
        packet.push(command);
        packet.extend_from_slice(body);
        self.write_packet(&packet).await
    }

    /// OK가 아니면 에러
    pub async fn read_ok(&mut self) -> Result<()> {
        let packet = self.read_packet().await?;
        if is_error_packet(&packet) {
            return Err(ErrPacket::parse(&packet)?.into_error());
        }
        if !is_ok_packet(&packet) {
            return Err(CdcError::ProtocolError(format!(
                "unexpected response 0x{:02x}",
                packet.first().copied().unwrap_or_default()
            )));
        }
        Ok(())
    }
}

/// Greeting 패킷 파싱 (HandshakeV10)
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if is_error_packet(data) {
            return Err(ErrPacket::parse(data)?.into_error());
        }
        Self::parse_inner(data)
            .map_err(|e| CdcError::ProtocolError(format!("Malformed greeting packet: {}", e)))
    }

    fn parse_inner(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(data);

        let protocol_version = cursor.read_u8()?;
        let server_version = read_null_terminated_string(&mut cursor)?;
        let thread_id = cursor.read_u32::<LittleEndian>()?;

        // Auth plugin data part 1 (8 bytes) + filler
        let mut scramble = vec![0u8; 8];
        cursor.read_exact(&mut scramble)?;
        cursor.read_u8()?;

        let capabilities_lower = cursor.read_u16::<LittleEndian>()?;
        let server_collation = cursor.read_u8()?;
        let server_status = cursor.read_u16::<LittleEndian>()?;
        let capabilities_upper = cursor.read_u16::<LittleEndian>()?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = cursor.read_u8()?;
        let mut reserved = [0u8; 10];
        cursor.read_exact(&mut reserved)?;

        // Auth plugin data part 2 (최소 13 bytes, 마지막 null 제외)
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut part2 = vec![0u8; part2_len];
        cursor.read_exact(&mut part2)?;
        if part2.last() == Some(&0) {
            part2.pop();
        }
        scramble.extend_from_slice(&part2);

        let auth_plugin = if (cursor.position() as usize) < data.len() {
            read_null_terminated_string(&mut cursor)?
        } else {
            "mysql_native_password".to_string()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin,
        })
    }
}

/// ERR 패킷: 0xFF, code (2), '#', sql_state (5), message
#[derive(Debug, Clone, PartialEq)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 3 || data[0] != 0xFF {
            return Err(CdcError::ProtocolError("not an error packet".to_string()));
        }
        let code = u16::from_le_bytes([data[1], data[2]]);
        let (sql_state, message) = if data.get(3) == Some(&b'#') && data.len() >= 9 {
            (
                String::from_utf8_lossy(&data[4..9]).into_owned(),
                String::from_utf8_lossy(&data[9..]).into_owned(),
            )
        } else {
            (String::new(), String::from_utf8_lossy(&data[3..]).into_owned())
        };
        Ok(ErrPacket {
            code,
            sql_state,
            message,
        })
    }

    pub fn into_error(self) -> CdcError {
        match self.code {
            ER_MASTER_FATAL_ERROR_READING_BINLOG => CdcError::ReplicationLogUnavailable(format!(
                "server error {}: {}",
                self.code, self.message
            )),
            1045 => CdcError::ConnectionError(format!("access denied: {}", self.message)),
            _ => CdcError::ProtocolError(format!("server error {}: {}", self.code, self.message)),
        }
    }
}

/// null로 끝나는 문자열 읽기
fn read_null_terminated_string<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8()?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    data.first() == Some(&0xFF)
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    data.first() == Some(&0x00)
}

/// EOF 패킷 확인 (0xFE, 길이 < 9). 0xFE로 시작하는 긴 패킷은 auth switch 등
pub fn is_eof_packet(data: &[u8]) -> bool {
    data.first() == Some(&0xFE) && data.len() < 9
}

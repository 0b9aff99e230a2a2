//! MySQL Binlog 클라이언트
//!
//! 복제 클라이언트로 등록하고 COM_BINLOG_DUMP로 이벤트를 받아 디코딩합니다.
//! `continuous`가 아니면 non-block 플래그로 요청하여 로그 끝에서 EOF를 받습니다.

use crate::auth;
use crate::binlog::{BinlogDecoder, TableRef};
use crate::connection::ConnectionConfig;
use crate::demux::LogSource;
use crate::error::{CdcError, Result};
use crate::events::BinlogEvent;
use crate::offset::BinlogPosition;
use crate::protocol::{self, ErrPacket, GreetingPacket, PacketChannel};
use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashSet;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// COM_QUERY 명령어 코드
const COM_QUERY: u8 = 0x03;

/// COM_BINLOG_DUMP 명령어 코드
const COM_BINLOG_DUMP: u8 = 0x12;

/// 로그 끝에서 대기하지 않고 EOF 반환
const BINLOG_DUMP_NON_BLOCK: u16 = 0x01;

#[derive(Debug, Clone)]
pub struct BinlogClientOptions {
    /// true면 로그 끝에서 새 이벤트를 기다림
    pub continuous: bool,
    pub heartbeat_period: Duration,
    /// 서버 binlog_checksum이 CRC32인지
    pub checksum: bool,
}

/// Binlog 클라이언트
pub struct BinlogClient {
    config: ConnectionConfig,
    options: BinlogClientOptions,
}

impl BinlogClient {
    pub fn new(config: ConnectionConfig, options: BinlogClientOptions) -> Self {
        BinlogClient { config, options }
    }

    /// 연결, 인증, 덤프 요청까지 마친 이벤트 스트림
    pub async fn start(
        &self,
        from: &BinlogPosition,
        cancel: CancellationToken,
    ) -> Result<BinlogStream<TcpStream>> {
        info!(
            "Starting binlog streaming from {} (server_id={}, continuous={})",
            from, self.config.server_id, self.options.continuous
        );

        let mut channel =
            PacketChannel::connect(&self.config.hostname, self.config.port, self.config.timeout).await?;

        let greeting = GreetingPacket::parse(&channel.read_packet().await?)?;
        info!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );

        auth::authenticate(
            &mut channel,
            &greeting,
            &self.config.username,
            &self.config.password,
            None,
        )
        .await?;

        // 서버 체크섬 설정을 그대로 받아들임 (디코더가 CRC32를 떼어냄)
        self.query(&mut channel, "SET @master_binlog_checksum = @@global.binlog_checksum")
            .await?;
        if self.options.continuous {
            let nanos = self.options.heartbeat_period.as_nanos();
            self.query(&mut channel, &format!("SET @master_heartbeat_period = {}", nanos))
                .await?;
        }

        let dump = create_binlog_dump_command(
            self.config.server_id,
            &from.filename,
            from.position,
            self.options.continuous,
        )?;
        channel.write_packet(&dump).await?;
        debug!("Sent COM_BINLOG_DUMP: {}", from);

        // 대기 모드에서는 heartbeat 주기보다 길게 기다림
        let read_timeout = if self.options.continuous {
            self.config.read_timeout.max(self.options.heartbeat_period * 2)
        } else {
            self.config.read_timeout
        };

        Ok(BinlogStream::new(
            channel,
            BinlogDecoder::new(self.options.checksum),
            read_timeout,
            cancel,
        ))
    }

    async fn query(&self, channel: &mut PacketChannel<TcpStream>, sql: &str) -> Result<()> {
        channel.write_command(COM_QUERY, sql.as_bytes()).await?;
        channel.read_ok().await
    }
}

/// COM_BINLOG_DUMP 명령어 생성
pub fn create_binlog_dump_command(
    server_id: u32,
    binlog_filename: &str,
    binlog_position: u64,
    continuous: bool,
) -> Result<Vec<u8>> {
    let position = u32::try_from(binlog_position).map_err(|_| {
        CdcError::ProtocolError(format!(
            "binlog position {} does not fit COM_BINLOG_DUMP",
            binlog_position
        ))
    })?;

    let mut buffer = Vec::new();
    buffer.write_u8(COM_BINLOG_DUMP)?;
    buffer.write_u32::<LittleEndian>(position)?;
    buffer.write_u16::<LittleEndian>(if continuous { 0 } else { BINLOG_DUMP_NON_BLOCK })?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_all(binlog_filename.as_bytes())?;

    Ok(buffer)
}

/// 복제 소켓에서 읽은 이벤트 스트림
pub struct BinlogStream<S> {
    channel: PacketChannel<S>,
    decoder: BinlogDecoder,
    read_timeout: Duration,
    cancel: CancellationToken,
    finished: bool,
    events_read: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> BinlogStream<S> {
    pub fn new(
        channel: PacketChannel<S>,
        decoder: BinlogDecoder,
        read_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        BinlogStream {
            channel,
            decoder,
            read_timeout,
            cancel,
            finished: false,
            events_read: 0,
        }
    }

    pub fn events_read(&self) -> u64 {
        self.events_read
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CdcError::Cancelled),
            read = tokio::time::timeout(self.read_timeout, self.channel.read_packet()) => {
                read.map_err(|_| CdcError::Timeout)?
            }
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> LogSource for BinlogStream<S> {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        if self.finished {
            return Ok(None);
        }

        let packet = self.read_packet().await?;
        if protocol::is_error_packet(&packet) {
            self.finished = true;
            return Err(ErrPacket::parse(&packet)?.into_error());
        }
        if protocol::is_eof_packet(&packet) {
            info!("Reached end of binlog after {} events", self.events_read);
            self.finished = true;
            return Ok(None);
        }
        if !protocol::is_ok_packet(&packet) {
            return Err(CdcError::ProtocolError(format!(
                "unexpected binlog packet 0x{:02x}",
                packet.first().copied().unwrap_or_default()
            )));
        }

        // 첫 바이트 0x00은 OK 표시, 실제 이벤트 데이터는 그 다음부터
        let event = self.decoder.decode(&packet[1..])?;
        self.events_read += 1;
        Ok(Some(event))
    }

    fn set_table_filter(&mut self, tables: HashSet<TableRef>) {
        self.decoder.set_table_filter(tables);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::tests::header_bytes;
    use crate::events::{BinlogEventData, EventType};
    use byteorder::WriteBytesExt;
    use tokio_test::io::Builder;

    fn framed(sequence: u8, body: &[u8]) -> Vec<u8> {
        let len = body.len() as u32;
        let mut packet = vec![len as u8, (len >> 8) as u8, (len >> 16) as u8, sequence];
        packet.extend_from_slice(body);
        packet
    }

    fn xid_packet(xid: u64, next_pos: u32) -> Vec<u8> {
        let mut body = vec![0x00];
        body.extend(header_bytes(16, 8, next_pos));
        body.write_u64::<LittleEndian>(xid).unwrap();
        body
    }

    #[test]
    fn test_create_binlog_dump_command() {
        let cmd = create_binlog_dump_command(6401, "mysql-bin.000001", 4, false).unwrap();
        assert_eq!(cmd[0], COM_BINLOG_DUMP);
        assert_eq!(&cmd[1..5], &4u32.to_le_bytes());
        assert_eq!(&cmd[5..7], &BINLOG_DUMP_NON_BLOCK.to_le_bytes());
        assert_eq!(&cmd[7..11], &6401u32.to_le_bytes());
        assert_eq!(&cmd[11..], b"mysql-bin.000001");

        let blocking = create_binlog_dump_command(6401, "mysql-bin.000001", 4, true).unwrap();
        assert_eq!(&blocking[5..7], &[0, 0]);

        assert!(create_binlog_dump_command(1, "mysql-bin.000001", u64::MAX, false).is_err());
    }

    #[tokio::test]
    async fn test_stream_until_eof() {
        let mock = Builder::new()
            .read(&framed(1, &xid_packet(9, 1200)))
            .read(&framed(2, &[0xFE, 0x00, 0x00, 0x02, 0x00]))
            .build();
        let mut stream = BinlogStream::new(
            PacketChannel::new(mock),
            BinlogDecoder::new(false),
            Duration::from_secs(5),
            CancellationToken::new(),
        );

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.header.event_type, EventType::XidEvent);
        assert_eq!(event.header.next_pos, 1200);
        assert!(matches!(event.data, BinlogEventData::Xid { xid: 9 }));
        assert!(stream.next_event().await.unwrap().is_none());
        assert!(stream.next_event().await.unwrap().is_none());
        assert_eq!(stream.events_read(), 1);
    }

    #[tokio::test]
    async fn test_purged_log_error() {
        let mut body = vec![0xFF];
        body.extend_from_slice(&1236u16.to_le_bytes());
        body.extend_from_slice(b"#HY000Could not find first log file name in binary log index file");
        let mock = Builder::new().read(&framed(1, &body)).build();
        let mut stream = BinlogStream::new(
            PacketChannel::new(mock),
            BinlogDecoder::new(false),
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        let err = stream.next_event().await.unwrap_err();
        assert!(matches!(err, CdcError::ReplicationLogUnavailable(_)));
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let mock = Builder::new().wait(Duration::from_secs(60)).build();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = BinlogStream::new(
            PacketChannel::new(mock),
            BinlogDecoder::new(false),
            Duration::from_secs(5),
            cancel,
        );
        let err = stream.next_event().await.unwrap_err();
        assert!(matches!(err, CdcError::Cancelled));
    }
}

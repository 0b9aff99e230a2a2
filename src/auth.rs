//! MySQL 인증 처리
//!
//! mysql_native_password, caching_sha2_password (fast auth) 지원.
//! caching_sha2_password의 full authentication은 평문 소켓에서 RSA 교환이 필요하므로 지원하지 않음.

use crate::error::{CdcError, Result};
use crate::protocol::{is_error_packet, ErrPacket, GreetingPacket, PacketChannel};
use byteorder::{LittleEndian, WriteBytesExt};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::Write;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const PLUGIN_AUTH_LENENC_DATA: u32 = 1 << 21;
}

/// utf8mb4_general_ci
const DEFAULT_COLLATION: u8 = 45;

/// Native password 인증 응답
/// XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
pub fn native_password_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password 인증 응답
/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + scramble))
pub fn caching_sha2_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(scramble);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

pub fn auth_response(plugin: &str, password: &str, scramble: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD => Ok(native_password_response(password, scramble)),
        CACHING_SHA2_PASSWORD => Ok(caching_sha2_response(password, scramble)),
        other => Err(CdcError::ConnectionError(format!(
            "unsupported authentication plugin {}",
            other
        ))),
    }
}

/// HandshakeResponse41 패킷 생성
pub fn create_handshake_response(
    username: &str,
    password: &str,
    database: Option<&str>,
    greeting: &GreetingPacket,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    let mut flags = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;

    if database.is_some() {
        flags |= capabilities::CONNECT_WITH_DB;
    }

    buffer.write_u32::<LittleEndian>(flags)?;
    // Max packet size - 16MB
    buffer.write_u32::<LittleEndian>(0x0100_0000)?;
    buffer.write_u8(DEFAULT_COLLATION)?;
    buffer.write_all(&[0u8; 23])?;

    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    let plugin = match greeting.auth_plugin.as_str() {
        CACHING_SHA2_PASSWORD => CACHING_SHA2_PASSWORD,
        _ => NATIVE_PASSWORD,
    };
    let response = auth_response(plugin, password, &greeting.scramble)?;
    buffer.write_u8(response.len() as u8)?;
    buffer.write_all(&response)?;

    if let Some(db) = database {
        buffer.write_all(db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    buffer.write_all(plugin.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

/// 핸드셰이크 응답 전송 후 인증 완료까지 진행
pub async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    channel: &mut PacketChannel<S>,
    greeting: &GreetingPacket,
    username: &str,
    password: &str,
    database: Option<&str>,
) -> Result<()> {
    let response = create_handshake_response(username, password, database, greeting)?;
    channel.write_packet(&response).await?;

    let mut plugin = greeting.auth_plugin.clone();
    loop {
        let packet = channel.read_packet().await?;
        match packet.first() {
            Some(0x00) => {
                debug!(plugin = %plugin, "Authentication successful");
                return Ok(());
            }
            Some(0xFF) if is_error_packet(&packet) => {
                return Err(ErrPacket::parse(&packet)?.into_error());
            }
            // Auth switch request: plugin name + 새 scramble
            Some(0xFE) => {
                let body = &packet[1..];
                let name_end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
                plugin = String::from_utf8_lossy(&body[..name_end]).into_owned();
                let mut scramble = body.get(name_end + 1..).unwrap_or_default().to_vec();
                if scramble.last() == Some(&0) {
                    scramble.pop();
                }
                debug!(plugin = %plugin, "Auth switch requested");
                let response = auth_response(&plugin, password, &scramble)?;
                channel.write_packet(&response).await?;
            }
            // caching_sha2_password: 0x03 fast auth 성공, 0x04 full auth 필요
            Some(0x01) => match packet.get(1) {
                Some(0x03) => debug!("caching_sha2_password fast auth"),
                Some(0x04) => {
                    return Err(CdcError::ConnectionError(
                        "caching_sha2_password full authentication is not supported on the replication socket; \
                         authenticate once over TLS so the server caches the password, or use mysql_native_password"
                            .to_string(),
                    ))
                }
                other => {
                    return Err(CdcError::ProtocolError(format!(
                        "unexpected auth more-data {:?}",
                        other
                    )))
                }
            },
            other => {
                return Err(CdcError::ProtocolError(format!(
                    "unexpected authentication response {:?}",
                    other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn greeting(plugin: &str) -> GreetingPacket {
        GreetingPacket {
            protocol_version: 10,
            server_version: "8.0.36".to_string(),
            thread_id: 1,
            scramble: b"abcdefghijklmnopqrst".to_vec(),
            server_capabilities: 0xFFFF_FFFF,
            server_collation: 45,
            server_status: 2,
            auth_plugin: plugin.to_string(),
        }
    }

    fn framed(sequence: u8, body: &[u8]) -> Vec<u8> {
        let mut packet = vec![body.len() as u8, 0, 0, sequence];
        packet.extend_from_slice(body);
        packet
    }

    #[test]
    fn test_empty_password() {
        assert!(native_password_response("", &[1, 2, 3, 4]).is_empty());
        assert!(caching_sha2_response("", &[1, 2, 3, 4]).is_empty());
    }

    #[test]
    fn test_scramble_lengths() {
        let scramble = b"abcdefghijklmnopqrst";
        assert_eq!(native_password_response("password", scramble).len(), 20);
        assert_eq!(caching_sha2_response("password", scramble).len(), 32);
        assert_ne!(
            native_password_response("password", scramble),
            native_password_response("other", scramble)
        );
    }

    #[test]
    fn test_handshake_response_layout() {
        let packet =
            create_handshake_response("repl", "secret", Some("shop"), &greeting(NATIVE_PASSWORD)).unwrap();
        // flags(4) + max packet(4) + collation(1) + reserved(23) = 32
        assert_eq!(&packet[32..37], b"repl\0");
        assert_eq!(packet[37], 20);
        assert!(packet.ends_with(b"shop\0mysql_native_password\0"));
    }

    #[test]
    fn test_unknown_plugin_is_rejected() {
        assert!(auth_response("sha256_password", "x", b"abc").is_err());
    }

    #[tokio::test]
    async fn test_fast_auth_flow() {
        let greeting = greeting(CACHING_SHA2_PASSWORD);
        let response = create_handshake_response("repl", "secret", None, &greeting).unwrap();
        let mock = Builder::new()
            .write(&framed(0, &response))
            .read(&framed(1, &[0x01, 0x03]))
            .read(&framed(2, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]))
            .build();
        let mut channel = PacketChannel::new(mock);
        authenticate(&mut channel, &greeting, "repl", "secret", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_auth_is_reported() {
        let greeting = greeting(CACHING_SHA2_PASSWORD);
        let response = create_handshake_response("repl", "secret", None, &greeting).unwrap();
        let mock = Builder::new()
            .write(&framed(0, &response))
            .read(&framed(1, &[0x01, 0x04]))
            .build();
        let mut channel = PacketChannel::new(mock);
        let err = authenticate(&mut channel, &greeting, "repl", "secret", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::ConnectionError(_)));
    }
}

//! Java Edition packet framing and the handful of packets needed to answer
//! a server-list ping and reject a login attempt (§4.1).
//!
//! Framing is `length (VarInt) | packet_id (VarInt) | payload`. We never
//! speak anything past login, so there is no need for a general packet
//! enum — just enough structure to decode a handshake/login-start and
//! build a status-response/pong/disconnect.

use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::InterposerError;

use super::varint::{read_varint, read_varint_async, write_string, write_varint};

/// Packets larger than this are rejected outright (§4.1).
pub const MAX_PACKET_LEN: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
}

#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

/// A decoded packet: its id and the payload bytes following it.
pub struct RawPacket {
    pub id: i32,
    pub data: Vec<u8>,
}

/// Read one length-prefixed packet off the stream.
///
/// Closes (returns an error the caller should treat as "disconnect
/// silently") on malformed framing or an oversized declared length.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<RawPacket, InterposerError> {
    let len = read_varint_async(reader).await?;
    if len < 0 || len as usize > MAX_PACKET_LEN {
        return Err(InterposerError::ProtocolFramingError(format!(
            "declared packet length {len} out of bounds"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| InterposerError::ProtocolFramingError(e.to_string()))?;

    let (id, off) = read_varint(&buf)
        .ok_or_else(|| InterposerError::ProtocolFramingError("malformed packet id".to_string()))?;

    Ok(RawPacket {
        id,
        data: buf[off..].to_vec(),
    })
}

pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet_id: i32,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut body = Vec::with_capacity(payload.len() + 1);
    write_varint(packet_id, &mut body);
    body.extend_from_slice(payload);

    let mut framed = Vec::with_capacity(body.len() + 5);
    write_varint(body.len() as i32, &mut framed);
    framed.extend_from_slice(&body);

    writer.write_all(&framed).await
}

impl Handshake {
    /// Decode a Handshake (id `0x00`, handshaking state) from its payload.
    pub fn decode(packet: &RawPacket) -> Result<Handshake, InterposerError> {
        if packet.id != 0x00 {
            return Err(InterposerError::ProtocolFramingError(format!(
                "expected handshake packet id 0x00, got {}",
                packet.id
            )));
        }

        let data = &packet.data;
        let (protocol_version, mut offset) = read_varint(data)
            .ok_or_else(|| InterposerError::ProtocolFramingError("truncated handshake".into()))?;

        let (addr_len, len) = read_varint(&data[offset..])
            .ok_or_else(|| InterposerError::ProtocolFramingError("truncated address".into()))?;
        offset += len;
        if addr_len < 0 {
            return Err(InterposerError::ProtocolFramingError(
                "negative address length".into(),
            ));
        }
        let addr_end = offset + addr_len as usize;
        let server_address = data
            .get(offset..addr_end)
            .and_then(|b| std::str::from_utf8(b).ok())
            .ok_or_else(|| InterposerError::ProtocolFramingError("invalid address utf-8".into()))?
            .to_string();
        offset = addr_end;

        let port_bytes = data
            .get(offset..offset + 2)
            .ok_or_else(|| InterposerError::ProtocolFramingError("truncated port".into()))?;
        let server_port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
        offset += 2;

        let (next_state_raw, _) = read_varint(&data[offset..])
            .ok_or_else(|| InterposerError::ProtocolFramingError("truncated next state".into()))?;
        let next_state = match next_state_raw {
            1 => NextState::Status,
            2 => NextState::Login,
            other => {
                return Err(InterposerError::ProtocolFramingError(format!(
                    "unsupported next_state {other}"
                )))
            }
        };

        Ok(Handshake {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }
}

/// Decode a Login Start (id `0x00`, login state) username.
pub fn decode_login_start(packet: &RawPacket) -> Result<String, InterposerError> {
    if packet.id != 0x00 {
        return Err(InterposerError::ProtocolFramingError(format!(
            "expected login start packet id 0x00, got {}",
            packet.id
        )));
    }
    let (len, off) = read_varint(&packet.data)
        .ok_or_else(|| InterposerError::ProtocolFramingError("truncated username".into()))?;
    if len < 0 {
        return Err(InterposerError::ProtocolFramingError(
            "negative username length".into(),
        ));
    }
    let end = off + len as usize;
    packet
        .data
        .get(off..end)
        .and_then(|b| std::str::from_utf8(b).ok())
        .map(|s| s.to_string())
        .ok_or_else(|| InterposerError::ProtocolFramingError("invalid username utf-8".into()))
}

/// Public fields of the server-list-ping status payload (§4.1).
pub struct StatusPayload<'a> {
    pub version_name: &'a str,
    pub protocol_version: i32,
    pub max_players: u32,
    pub motd: &'a str,
    pub favicon: Option<&'a str>,
}

/// Build a Status Response packet body (JSON wrapped, no framing).
pub fn build_status_response_payload(payload: &StatusPayload) -> Vec<u8> {
    let mut body = json!({
        "version": {
            "name": payload.version_name,
            "protocol": payload.protocol_version,
        },
        "players": {
            "max": payload.max_players,
            "online": 0,
            "sample": [],
        },
        "description": { "text": payload.motd },
    });

    if let Some(favicon) = payload.favicon {
        body["favicon"] = json!(favicon);
    }

    let json_str = body.to_string();
    let mut data = Vec::with_capacity(json_str.len() + 5);
    write_string(&json_str, &mut data);
    data
}

/// Build a Disconnect (login state) packet body: a JSON chat component.
pub fn build_login_disconnect_payload(message: &str) -> Vec<u8> {
    let json_str = json!({ "text": message }).to_string();
    let mut data = Vec::with_capacity(json_str.len() + 5);
    write_string(&json_str, &mut data);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_handshake(protocol_version: i32, addr: &str, port: u16, next_state: i32) -> Vec<u8> {
        let mut data = Vec::new();
        write_varint(protocol_version, &mut data);
        write_string(addr, &mut data);
        data.extend_from_slice(&port.to_be_bytes());
        write_varint(next_state, &mut data);
        data
    }

    #[test]
    fn decodes_status_handshake() {
        let data = encode_handshake(765, "localhost", 25565, 1);
        let packet = RawPacket { id: 0, data };
        let handshake = Handshake::decode(&packet).unwrap();
        assert_eq!(handshake.protocol_version, 765);
        assert_eq!(handshake.server_address, "localhost");
        assert_eq!(handshake.server_port, 25565);
        assert_eq!(handshake.next_state, NextState::Status);
    }

    #[test]
    fn decodes_login_handshake() {
        let data = encode_handshake(765, "play.example.com", 25565, 2);
        let packet = RawPacket { id: 0, data };
        let handshake = Handshake::decode(&packet).unwrap();
        assert_eq!(handshake.next_state, NextState::Login);
    }

    #[test]
    fn rejects_unknown_next_state() {
        let data = encode_handshake(765, "localhost", 25565, 3);
        let packet = RawPacket { id: 0, data };
        assert!(Handshake::decode(&packet).is_err());
    }

    #[test]
    fn decodes_login_start_username() {
        let mut data = Vec::new();
        write_string("Alice", &mut data);
        let packet = RawPacket { id: 0, data };
        assert_eq!(decode_login_start(&packet).unwrap(), "Alice");
    }

    #[test]
    fn status_response_contains_configured_motd() {
        let payload = StatusPayload {
            version_name: "Craftynap",
            protocol_version: 765,
            max_players: 20,
            motd: "World is sleeping",
            favicon: None,
        };
        let body = build_status_response_payload(&payload);
        let (len, off) = read_varint(&body).unwrap();
        let json_str = std::str::from_utf8(&body[off..off + len as usize]).unwrap();
        let value: serde_json::Value = serde_json::from_str(json_str).unwrap();
        assert_eq!(value["players"]["online"], 0);
        assert_eq!(value["description"]["text"], "World is sleeping");
    }
}

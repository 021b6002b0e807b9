//! Bedrock Edition RakNet unconnected ping/pong (§4.1).
//!
//! We only ever need to answer `ID_UNCONNECTED_PING` with
//! `ID_UNCONNECTED_PONG` — no connected session is ever established.

/// RakNet's fixed "offline message data id" magic bytes.
pub const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

const ID_UNCONNECTED_PING: u8 = 0x01;
const ID_UNCONNECTED_PONG: u8 = 0x1c;

pub struct UnconnectedPing {
    pub time: i64,
    pub client_guid: i64,
}

/// Parse an incoming datagram as an Unconnected Ping.
///
/// Any other datagram (wrong id, wrong magic, truncated) is not ours to
/// answer and is silently ignored by the caller.
pub fn parse_unconnected_ping(buf: &[u8]) -> Option<UnconnectedPing> {
    if buf.len() < 1 + 8 + 16 + 8 || buf[0] != ID_UNCONNECTED_PING {
        return None;
    }

    let time = i64::from_be_bytes(buf[1..9].try_into().ok()?);
    let magic = &buf[9..25];
    if magic != OFFLINE_MAGIC {
        return None;
    }
    let client_guid = i64::from_be_bytes(buf[25..33].try_into().ok()?);

    Some(UnconnectedPing { time, client_guid })
}

/// Fields that make up the semicolon-separated MOTD tuple (§4.1).
pub struct MotdFields<'a> {
    pub motd_line1: &'a str,
    pub protocol_version: i32,
    pub version_name: &'a str,
    pub max_players: u32,
    pub server_guid: i64,
    pub motd_line2: &'a str,
    pub port_v4: u16,
    pub port_v6: u16,
}

fn build_id_string(fields: &MotdFields) -> String {
    format!(
        "MCPE;{};{};{};0;{};{};{};Survival;1;{};{};",
        fields.motd_line1,
        fields.protocol_version,
        fields.version_name,
        fields.max_players,
        fields.server_guid,
        fields.motd_line2,
        fields.port_v4,
        fields.port_v6,
    )
}

/// Build an Unconnected Pong datagram in reply to a ping.
pub fn build_unconnected_pong(ping_time: i64, server_guid: i64, fields: &MotdFields) -> Vec<u8> {
    let id_string = build_id_string(fields);
    let id_bytes = id_string.as_bytes();

    let mut out = Vec::with_capacity(1 + 8 + 8 + 16 + 2 + id_bytes.len());
    out.push(ID_UNCONNECTED_PONG);
    out.extend_from_slice(&ping_time.to_be_bytes());
    out.extend_from_slice(&server_guid.to_be_bytes());
    out.extend_from_slice(&OFFLINE_MAGIC);
    out.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(id_bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_ping(time: i64, guid: i64) -> Vec<u8> {
        let mut buf = vec![ID_UNCONNECTED_PING];
        buf.extend_from_slice(&time.to_be_bytes());
        buf.extend_from_slice(&OFFLINE_MAGIC);
        buf.extend_from_slice(&guid.to_be_bytes());
        buf
    }

    #[test]
    fn parses_valid_ping() {
        let buf = encode_ping(1234, 5678);
        let ping = parse_unconnected_ping(&buf).unwrap();
        assert_eq!(ping.time, 1234);
        assert_eq!(ping.client_guid, 5678);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut buf = encode_ping(1234, 5678);
        buf[9] ^= 0xff;
        assert!(parse_unconnected_ping(&buf).is_none());
    }

    #[test]
    fn rejects_wrong_packet_id() {
        let mut buf = encode_ping(1234, 5678);
        buf[0] = 0x02;
        assert!(parse_unconnected_ping(&buf).is_none());
    }

    #[test]
    fn rejects_truncated_datagram() {
        assert!(parse_unconnected_ping(&[0x01, 0x00]).is_none());
    }

    #[test]
    fn pong_id_string_carries_motd_and_ports() {
        let fields = MotdFields {
            motd_line1: "Napping",
            protocol_version: 685,
            version_name: "1.21.0",
            max_players: 20,
            server_guid: 42,
            motd_line2: "Craftynap",
            port_v4: 19132,
            port_v6: 19133,
        };
        let pong = build_unconnected_pong(1234, 42, &fields);
        assert_eq!(pong[0], ID_UNCONNECTED_PONG);
        assert_eq!(&pong[17..33], &OFFLINE_MAGIC);

        let len = u16::from_be_bytes([pong[33], pong[34]]) as usize;
        let id_string = std::str::from_utf8(&pong[35..35 + len]).unwrap();
        assert!(id_string.starts_with("MCPE;Napping;685;1.21.0;0;20;42;Craftynap;Survival;1;19132;19133;"));
    }
}

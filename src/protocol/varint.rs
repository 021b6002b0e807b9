//! Minecraft VarInt: 7-bit little-endian continuation encoding, max 5 bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::InterposerError;

/// Encode a VarInt onto the end of `buf`.
pub fn write_varint(mut value: i32, buf: &mut Vec<u8>) {
    loop {
        if value & !0x7F == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push(((value & 0x7F) | 0x80) as u8);
        value = ((value as u32) >> 7) as i32;
    }
}

/// Decode a VarInt from the start of `buf`.
///
/// Returns `(value, bytes_consumed)`, or `None` if the buffer doesn't hold a
/// complete, valid (at most 5-byte) VarInt.
pub fn read_varint(buf: &[u8]) -> Option<(i32, usize)> {
    let mut result: i32 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 5 {
            return None;
        }
        result |= ((byte & 0x7F) as i32) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
    }
    None
}

/// Read a VarInt directly off an async stream, one byte at a time.
pub async fn read_varint_async<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<i32, InterposerError> {
    let mut result: i32 = 0;
    for i in 0..5 {
        let byte = reader
            .read_u8()
            .await
            .map_err(|e| InterposerError::ProtocolFramingError(e.to_string()))?;
        result |= ((byte & 0x7F) as i32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(InterposerError::ProtocolFramingError(
        "VarInt longer than 5 bytes".to_string(),
    ))
}

pub async fn write_varint_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: i32,
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(5);
    write_varint(value, &mut buf);
    writer.write_all(&buf).await
}

pub fn write_string(s: &str, buf: &mut Vec<u8>) {
    write_varint(s.len() as i32, buf);
    buf.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_encodings() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(1), vec![0x01]);
        assert_eq!(encode(127), vec![0x7f]);
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(255), vec![0xff, 0x01]);
        assert_eq!(encode(25565), vec![0xdd, 0xc7, 0x01]);
        assert_eq!(encode(2097151), vec![0xff, 0xff, 0x7f]);
        assert_eq!(encode(-1), vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    fn encode(v: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(v, &mut buf);
        buf
    }

    #[test]
    fn rejects_overlong_varint() {
        let buf = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert_eq!(read_varint(&buf), None);
    }

    #[test]
    fn rejects_truncated_varint() {
        let buf = [0x80];
        assert_eq!(read_varint(&buf), None);
    }

    proptest::proptest! {
        #[test]
        fn roundtrip_u31(v in 0i32..=i32::MAX) {
            let mut buf = Vec::new();
            write_varint(v, &mut buf);
            let (decoded, len) = read_varint(&buf).unwrap();
            proptest::prop_assert_eq!(decoded, v);
            proptest::prop_assert_eq!(len, buf.len());
        }
    }
}

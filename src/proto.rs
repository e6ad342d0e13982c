//! Carrier frame codec.
//!
//! ```text
//! TOTAL_LEN | CHANN_ID | MAGIC   | CMD    | PAYLOAD
//! 3 bytes   | 4 bytes  | 4 bytes | 1 byte | n bytes
//! ```
//!
//! All integers are unsigned big-endian. `TOTAL_LEN` counts the whole frame
//! including the header and stays in the clear on the wire; everything after
//! it is ciphered (see `crypto`). Every command carries at least one payload
//! byte.

use crate::CHANN_BUF_SIZE;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::net::Ipv4Addr;

pub const HEADER_LEN: usize = 12;

/// Largest frame either side will emit or assemble: one transfer buffer of
/// payload behind a header.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + CHANN_BUF_SIZE;

/// Largest DATA payload per frame.
pub const MAX_DATA_LEN: usize = CHANN_BUF_SIZE;

/// Width of the username/password fields in an AUTH request.
pub const AUTH_FIELD_LEN: usize = 16;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Cmd {
    Echo = 1,
    Auth = 2,
    Connect = 3,
    Close = 4,
    Data = 5,
}

impl Cmd {
    #[inline]
    pub fn from_u8(value: u8) -> Option<Cmd> {
        match value {
            1 => Some(Cmd::Echo),
            2 => Some(Cmd::Auth),
            3 => Some(Cmd::Connect),
            4 => Some(Cmd::Close),
            5 => Some(Cmd::Data),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddrType {
    Ip = 0,
    Domain = 1,
}

/// Frame rejection classes. Any of these on a carrier is a protocol
/// violation and drops the carrier.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameError {
    BadLength,
    BadCommand,
    EmptyPayload,
    Truncated,
    BadAddress,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub total_len: usize,
    pub chann_id: u32,
    pub magic: u32,
    pub cmd: Cmd,
}

/// Peek the advertised frame length off an assembly buffer. `Ok(None)`
/// means more bytes are needed before the length is known; an advertised
/// length outside `[HEADER_LEN, MAX_FRAME_LEN]` is rejected outright.
pub fn frame_len(data: &[u8]) -> Result<Option<usize>, FrameError> {
    if data.len() < 3 {
        return Ok(None);
    }

    let total = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | data[2] as usize;

    if total < HEADER_LEN || total > MAX_FRAME_LEN {
        return Err(FrameError::BadLength);
    }

    Ok(Some(total))
}

/// Write the five fixed-offset header fields into the front of `buf`.
pub fn encode_header(buf: &mut [u8], total_len: usize, chann_id: u32, magic: u32, cmd: Cmd) {
    let mut cursor = Cursor::new(buf);

    cursor.write_u24::<BigEndian>(total_len as u32).expect("Header buffer must hold 12 bytes");
    cursor.write_u32::<BigEndian>(chann_id).expect("Header buffer must hold 12 bytes");
    cursor.write_u32::<BigEndian>(magic).expect("Header buffer must hold 12 bytes");
    cursor.write_u8(cmd as u8).expect("Header buffer must hold 12 bytes");
}

/// Decode and validate a plaintext frame header. Rejects lengths below the
/// header size, unknown commands and the empty payload (every command
/// carries at least one payload byte).
pub fn decode_header(data: &[u8]) -> Result<FrameHeader, FrameError> {
    if data.len() < HEADER_LEN {
        return Err(FrameError::Truncated);
    }

    let mut cursor = Cursor::new(data);

    let total_len = cursor.read_u24::<BigEndian>().map_err(|_| FrameError::Truncated)? as usize;
    let chann_id = cursor.read_u32::<BigEndian>().map_err(|_| FrameError::Truncated)?;
    let magic = cursor.read_u32::<BigEndian>().map_err(|_| FrameError::Truncated)?;
    let cmd_byte = cursor.read_u8().map_err(|_| FrameError::Truncated)?;

    if total_len < HEADER_LEN || total_len > MAX_FRAME_LEN {
        return Err(FrameError::BadLength);
    }

    let cmd = Cmd::from_u8(cmd_byte).ok_or(FrameError::BadCommand)?;

    if total_len == HEADER_LEN {
        return Err(FrameError::EmptyPayload);
    }

    Ok(FrameHeader {
        total_len,
        chann_id,
        magic,
        cmd,
    })
}

/// Decrypt an assembled frame in place and decode its header. Header
/// validation doubles as the cipher check: when it fails, the keystream is
/// un-applied and the previous time bucket is tried once, which absorbs
/// clock skew and frames in flight across a bucket boundary.
pub fn decrypt_frame(frame: &mut [u8], key: u64, bucket: u64) -> Result<FrameHeader, FrameError> {
    crate::crypto::decrypt(&mut frame[3..], key, bucket);

    match decode_header(frame) {
        Ok(header) => Ok(header),
        Err(_) => {
            crate::crypto::encrypt(&mut frame[3..], key, bucket);
            crate::crypto::decrypt(&mut frame[3..], key, bucket.wrapping_sub(1));
            decode_header(frame)
        }
    }
}

#[inline]
fn frame_with_payload(chann_id: u32, magic: u32, cmd: Cmd, payload_len: usize) -> Vec<u8> {
    let total = HEADER_LEN + payload_len;
    let mut frame = vec![0u8; total];
    encode_header(&mut frame, total, chann_id, magic, cmd);
    frame
}

/// ECHO keepalive frame, connection scoped.
pub fn echo_frame() -> Vec<u8> {
    let mut frame = frame_with_payload(0, 0, Cmd::Echo, 1);
    frame[HEADER_LEN] = 1;
    frame
}

/// AUTH request: auth-type 1 plus NUL-padded 16-byte username and password.
pub fn auth_request(username: &str, password: &str) -> Vec<u8> {
    let mut frame = frame_with_payload(0, 0, Cmd::Auth, 1 + 2 * AUTH_FIELD_LEN);

    frame[HEADER_LEN] = 1;
    write_padded(&mut frame[HEADER_LEN + 1..], username);
    write_padded(&mut frame[HEADER_LEN + 1 + AUTH_FIELD_LEN..], password);
    frame
}

/// AUTH response: 1 = accepted, 0 = rejected.
pub fn auth_response(ok: bool) -> Vec<u8> {
    let mut frame = frame_with_payload(0, 0, Cmd::Auth, 1);
    frame[HEADER_LEN] = ok as u8;
    frame
}

/// CONNECT request: addr-type, big-endian port, NUL-terminated address
/// (dotted-quad ASCII or domain name).
pub fn connect_request(chann_id: u32, magic: u32, addr_type: AddrType, port: u16, addr: &str) -> Vec<u8> {
    let addr_bytes = addr.as_bytes();
    let mut frame = frame_with_payload(chann_id, magic, Cmd::Connect, 3 + addr_bytes.len() + 1);

    let base = HEADER_LEN;
    frame[base] = addr_type as u8;
    frame[base + 1] = (port >> 8) as u8;
    frame[base + 2] = port as u8;
    frame[base + 3..base + 3 + addr_bytes.len()].copy_from_slice(addr_bytes);
    // Trailing NUL is already zeroed
    frame
}

/// CONNECT response. On success carries the peer port and IPv4 address; on
/// failure the trailing fields are zero and only the result byte matters.
pub fn connect_response(chann_id: u32, magic: u32, result: Option<(u16, Ipv4Addr)>) -> Vec<u8> {
    let mut frame = frame_with_payload(chann_id, magic, Cmd::Connect, 7);

    let base = HEADER_LEN;
    if let Some((port, addr)) = result {
        frame[base] = 1;
        frame[base + 1] = (port >> 8) as u8;
        frame[base + 2] = port as u8;
        frame[base + 3..base + 7].copy_from_slice(&addr.octets());
    }
    frame
}

/// CLOSE frame: payload 1 for the request direction, 0 for the response.
pub fn close_frame(chann_id: u32, magic: u32, request: bool) -> Vec<u8> {
    let mut frame = frame_with_payload(chann_id, magic, Cmd::Close, 1);
    frame[HEADER_LEN] = request as u8;
    frame
}

/// DATA frame wrapping opaque payload bytes.
pub fn data_frame(chann_id: u32, magic: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = frame_with_payload(chann_id, magic, Cmd::Data, payload.len());
    frame[HEADER_LEN..].copy_from_slice(payload);
    frame
}

fn write_padded(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let count = bytes.len().min(AUTH_FIELD_LEN);
    field[..count].copy_from_slice(&bytes[..count]);
}

/// Parsed AUTH request payload.
#[derive(Debug)]
pub struct AuthRequest<'a> {
    pub auth_type: u8,
    pub username: &'a [u8],
    pub password: &'a [u8],
}

pub fn parse_auth_request(payload: &[u8]) -> Result<AuthRequest, FrameError> {
    if payload.len() < 1 + 2 * AUTH_FIELD_LEN {
        return Err(FrameError::Truncated);
    }

    Ok(AuthRequest {
        auth_type: payload[0],
        username: &payload[1..1 + AUTH_FIELD_LEN],
        password: &payload[1 + AUTH_FIELD_LEN..1 + 2 * AUTH_FIELD_LEN],
    })
}

/// Parsed CONNECT request payload.
#[derive(Debug, Eq, PartialEq)]
pub struct ConnectRequest<'a> {
    pub addr_type: AddrType,
    pub port: u16,
    pub addr: &'a str,
}

pub fn parse_connect_request(payload: &[u8]) -> Result<ConnectRequest, FrameError> {
    if payload.len() < 5 {
        return Err(FrameError::Truncated);
    }

    let addr_type = match payload[0] {
        0 => AddrType::Ip,
        1 => AddrType::Domain,
        _ => return Err(FrameError::BadAddress),
    };

    let port = (u16::from(payload[1]) << 8) | u16::from(payload[2]);

    let addr_bytes = &payload[3..];
    let nul = addr_bytes
        .iter()
        .position(|&byte| byte == 0)
        .ok_or(FrameError::BadAddress)?;

    let addr = std::str::from_utf8(&addr_bytes[..nul]).map_err(|_| FrameError::BadAddress)?;

    if addr.is_empty() {
        return Err(FrameError::BadAddress);
    }

    Ok(ConnectRequest {
        addr_type,
        port,
        addr,
    })
}

/// Parsed CONNECT response payload.
#[derive(Debug, Eq, PartialEq)]
pub struct ConnectResponse {
    pub ok: bool,
    pub port: u16,
    pub addr: Ipv4Addr,
}

pub fn parse_connect_response(payload: &[u8]) -> Result<ConnectResponse, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::Truncated);
    }

    if payload[0] != 1 {
        return Ok(ConnectResponse {
            ok: false,
            port: 0,
            addr: Ipv4Addr::UNSPECIFIED,
        });
    }

    if payload.len() < 7 {
        return Err(FrameError::Truncated);
    }

    Ok(ConnectResponse {
        ok: true,
        port: (u16::from(payload[1]) << 8) | u16::from(payload[2]),
        addr: Ipv4Addr::new(payload[3], payload[4], payload[5], payload[6]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut buf = [0u8; HEADER_LEN];

        encode_header(&mut buf, 100, 7, 42, Cmd::Data);
        let header = decode_header(&buf).unwrap();

        assert_eq!(header.total_len, 100);
        assert_eq!(header.chann_id, 7);
        assert_eq!(header.magic, 42);
        assert_eq!(header.cmd, Cmd::Data);
    }

    #[test]
    fn test_header_field_offsets() {
        let mut buf = [0u8; HEADER_LEN];

        encode_header(&mut buf, 0x010203, 0x04050607, 0x08090a0b, Cmd::Echo);

        assert_eq!(
            buf,
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x01]
        );
    }

    #[test]
    fn test_frame_len_needs_three_bytes() {
        assert_eq!(frame_len(&[]).unwrap(), None);
        assert_eq!(frame_len(&[0, 0]).unwrap(), None);
        assert_eq!(frame_len(&[0, 0, 13]).unwrap(), Some(13));
    }

    #[test]
    fn test_frame_len_rejects_bounds() {
        // Below the header size
        assert_eq!(frame_len(&[0, 0, 11]), Err(FrameError::BadLength));
        // Past the transfer buffer ceiling
        assert_eq!(frame_len(&[0xff, 0xff, 0xff]), Err(FrameError::BadLength));
    }

    #[test]
    fn test_decode_rejects_unknown_cmd() {
        let mut buf = [0u8; HEADER_LEN];

        encode_header(&mut buf, 13, 0, 0, Cmd::Echo);
        buf[11] = 0;
        assert_eq!(decode_header(&buf), Err(FrameError::BadCommand));

        buf[11] = 6;
        assert_eq!(decode_header(&buf), Err(FrameError::BadCommand));
    }

    #[test]
    fn test_decode_rejects_empty_payload() {
        let mut buf = [0u8; HEADER_LEN];

        encode_header(&mut buf, HEADER_LEN, 0, 0, Cmd::Echo);

        assert_eq!(decode_header(&buf), Err(FrameError::EmptyPayload));
    }

    #[test]
    fn test_echo_frame_bytes() {
        // 13-byte connection-scoped keepalive with payload value 1
        assert_eq!(
            echo_frame(),
            vec![0x00, 0x00, 0x0d, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0x01]
        );
    }

    #[test]
    fn test_auth_request_layout() {
        let frame = auth_request("u", "p");

        assert_eq!(frame.len(), HEADER_LEN + 33);
        // total_len covers header + payload
        assert_eq!(&frame[..3], &[0x00, 0x00, 0x2d]);
        // connection scoped: chann_id = magic = 0
        assert_eq!(&frame[3..11], &[0u8; 8]);
        assert_eq!(frame[11], Cmd::Auth as u8);
        // auth type
        assert_eq!(frame[12], 1);
        // "u" then 15 NULs, "p" then 15 NULs
        assert_eq!(frame[13], b'u');
        assert_eq!(&frame[14..29], &[0u8; 15]);
        assert_eq!(frame[29], b'p');
        assert_eq!(&frame[30..45], &[0u8; 15]);
    }

    #[test]
    fn test_auth_roundtrip() {
        let frame = auth_request("user", "password");
        let auth = parse_auth_request(&frame[HEADER_LEN..]).unwrap();

        assert_eq!(auth.auth_type, 1);
        assert_eq!(&auth.username[..4], b"user");
        assert_eq!(&auth.username[4..], &[0u8; 12]);
        assert_eq!(&auth.password[..8], b"password");
    }

    #[test]
    fn test_connect_request_ipv4_bytes() {
        // 93.184.216.34:80 as a dotted-quad request
        let frame = connect_request(3, 9, AddrType::Ip, 80, "93.184.216.34");
        let payload = &frame[HEADER_LEN..];

        assert_eq!(payload[0], 0);
        assert_eq!(&payload[1..3], &[0x00, 0x50]);
        assert_eq!(&payload[3..16], b"93.184.216.34");
        assert_eq!(payload[16], 0);

        let req = parse_connect_request(payload).unwrap();
        assert_eq!(
            req,
            ConnectRequest {
                addr_type: AddrType::Ip,
                port: 80,
                addr: "93.184.216.34",
            }
        );
    }

    #[test]
    fn test_connect_request_domain_roundtrip() {
        let frame = connect_request(1, 2, AddrType::Domain, 80, "example.com");
        let req = parse_connect_request(&frame[HEADER_LEN..]).unwrap();

        assert_eq!(req.addr_type, AddrType::Domain);
        assert_eq!(req.port, 80);
        assert_eq!(req.addr, "example.com");
    }

    #[test]
    fn test_connect_request_missing_nul() {
        assert_eq!(
            parse_connect_request(&[0, 0, 80, b'a', b'b']),
            Err(FrameError::BadAddress)
        );
    }

    #[test]
    fn test_connect_response_ok_bytes() {
        let frame = connect_response(3, 9, Some((80, Ipv4Addr::new(93, 184, 216, 34))));
        let payload = &frame[HEADER_LEN..];

        assert_eq!(payload, &[0x01, 0x00, 0x50, 0x5d, 0xb8, 0xd8, 0x22]);

        let resp = parse_connect_response(payload).unwrap();
        assert!(resp.ok);
        assert_eq!(resp.port, 80);
        assert_eq!(resp.addr, Ipv4Addr::new(93, 184, 216, 34));
    }

    #[test]
    fn test_connect_response_failure() {
        let frame = connect_response(3, 9, None);
        let resp = parse_connect_response(&frame[HEADER_LEN..]).unwrap();

        assert!(!resp.ok);
    }

    #[test]
    fn test_close_frame_directions() {
        let request = close_frame(5, 40, true);
        let response = close_frame(5, 40, false);

        assert_eq!(request[HEADER_LEN], 1);
        assert_eq!(response[HEADER_LEN], 0);

        let header = decode_header(&request).unwrap();
        assert_eq!(header.cmd, Cmd::Close);
        assert_eq!(header.chann_id, 5);
        assert_eq!(header.magic, 40);
    }

    #[test]
    fn test_decrypt_frame_current_bucket() {
        let key = crate::crypto::hash_key("secret");
        let mut frame = echo_frame();

        crate::crypto::encrypt(&mut frame[3..], key, 100);

        let header = decrypt_frame(&mut frame, key, 100).unwrap();
        assert_eq!(header.cmd, Cmd::Echo);
        assert_eq!(frame[HEADER_LEN], 1);
    }

    #[cfg(not(feature = "simple-crypto"))]
    #[test]
    fn test_decrypt_frame_previous_bucket() {
        let key = crate::crypto::hash_key("secret");

        // A sender sitting just before the bucket boundary. Skip bucket
        // pairs where the mismatched keystream happens to decode into a
        // well-formed header, since those never reach the retry path.
        for bucket in 100u64..130 {
            let mut frame = close_frame(7, 41, true);
            crate::crypto::encrypt(&mut frame[3..], key, bucket - 1);

            let mut probe = frame.clone();
            crate::crypto::decrypt(&mut probe[3..], key, bucket);
            if decode_header(&probe).is_ok() {
                continue;
            }

            let header = decrypt_frame(&mut frame, key, bucket).unwrap();
            assert_eq!(header.cmd, Cmd::Close);
            assert_eq!(header.chann_id, 7);
            assert_eq!(header.magic, 41);
            assert_eq!(frame[HEADER_LEN], 1);
            return;
        }

        panic!("No bucket pair exercised the retry path");
    }

    #[test]
    fn test_data_frame_wraps_payload() {
        let payload = b"GET / HTTP/1.0\r\n\r\n";
        let frame = data_frame(2, 11, payload);

        assert_eq!(frame.len(), HEADER_LEN + 18);
        assert_eq!(&frame[..3], &[0x00, 0x00, 0x1e]);
        assert_eq!(&frame[HEADER_LEN..], &payload[..]);
    }
}

//! WebSocket draft-00 (hixie-76)
//!
//! Text frames are `0x00 <utf-8> 0xFF`. A first byte with the high bit set starts a
//! length prefixed binary frame, the length written in base-128 groups. `0xFF 0x00`
//! closes the connection.

use bytes::{Buf, BufMut, BytesMut};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::websocket::handshake::{
    base_fields, build_request, read_http_response, HandshakeOutcome, HandshakeReader,
};
use crate::websocket::{WsEndpoint, WsFrame};

const MAX_FRAME_LENGTH: u64 = i32::MAX as u64;

/// One of the two `Sec-WebSocket-Key` values and the number it encodes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsKey {
    pub number: u32,
    pub key: String,
}

fn stuff_char<R: Rng + ?Sized>(rng: &mut R) -> char {
    // 0x21..=0x2F then 0x3A..=0x7E, no digits and no space
    let n = rng.gen_range(0..(15 + 69));
    let byte = if n < 15 { 0x21 + n } else { 0x3A + n - 15 };
    byte as u8 as char
}

impl WsKey {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> WsKey {
        let spaces: u32 = rng.gen_range(1..=12);
        let number: u32 = rng.gen_range(0..=u32::MAX / spaces);
        let product = number as u64 * spaces as u64;

        let mut chars: Vec<char> = product.to_string().chars().collect();

        let stuff: usize = rng.gen_range(1..=12);
        for _ in 0..stuff {
            let pos = rng.gen_range(0..=chars.len());
            chars.insert(pos, stuff_char(rng));
        }

        for _ in 0..spaces {
            let pos = rng.gen_range(1..chars.len());
            chars.insert(pos, ' ');
        }

        WsKey {
            number,
            key: chars.into_iter().collect(),
        }
    }

    /// Recover the number the way a server does, digits divided by spaces
    pub fn decode(key: &str) -> Option<u32> {
        let digits: String = key.chars().filter(|c| c.is_ascii_digit()).collect();
        let spaces = key.chars().filter(|c| *c == ' ').count() as u64;
        let value = digits.parse::<u64>().ok()?;
        if spaces == 0 || value % spaces != 0 {
            return None;
        }
        u32::try_from(value / spaces).ok()
    }
}

/// The 16 byte answer to the key challenge
pub fn challenge_response(key1: u32, key2: u32, key3: &[u8; 8]) -> [u8; 16] {
    let mut challenge = Vec::with_capacity(16);
    challenge.extend_from_slice(&key1.to_be_bytes());
    challenge.extend_from_slice(&key2.to_be_bytes());
    challenge.extend_from_slice(key3);
    md5::compute(&challenge).0
}

/// A ready to send request and the challenge response expected back
pub struct Hybi00Request {
    pub bytes: Vec<u8>,
    pub expected: [u8; 16],
}

pub fn build_handshake<R: Rng + ?Sized>(
    endpoint: &WsEndpoint,
    origin: &str,
    rng: &mut R,
) -> Result<Hybi00Request> {
    if origin.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(Error::InvalidState(format!(
            "origin must be lower case: {}",
            origin
        )));
    }

    let key1 = WsKey::generate(rng);
    let key2 = WsKey::generate(rng);
    let key3: [u8; 8] = rng.gen();

    let mut fields = base_fields();
    fields.push("Upgrade: WebSocket".to_string());
    fields.push(format!("Origin: {}", origin));
    fields.push(format!("Host: {}", endpoint.host_field()));
    fields.push(format!("Sec-WebSocket-Key1: {}", key1.key));
    fields.push(format!("Sec-WebSocket-Key2: {}", key2.key));
    fields.shuffle(rng);

    Ok(Hybi00Request {
        bytes: build_request(&endpoint.resource, &fields, &key3),
        expected: challenge_response(key1.number, key2.number, &key3),
    })
}

pub async fn perform_handshake<S, R>(
    reader: &mut HandshakeReader<S>,
    endpoint: &WsEndpoint,
    origin: &str,
    rng: &mut R,
) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Rng + ?Sized,
{
    let request = build_handshake(endpoint, origin, rng)?;
    reader.write_all(&request.bytes).await?;

    let response = read_http_response(reader).await?;
    if response.code != 101 {
        return Err(Error::Handshake(format!(
            "unexpected response {} {}",
            response.code, response.reason
        )));
    }

    if response.fields.len() != 4 {
        return Err(Error::Handshake(format!(
            "unexpected header fields {:?}",
            response.fields.keys().collect::<Vec<_>>()
        )));
    }

    let location = endpoint.location();
    let valid = |name: &str, value: &str| match name {
        "upgrade" => value == "WebSocket",
        "connection" => value.eq_ignore_ascii_case("upgrade"),
        "sec-websocket-origin" => value == origin,
        _ => value == location,
    };
    for name in [
        "upgrade",
        "connection",
        "sec-websocket-origin",
        "sec-websocket-location",
    ] {
        match response.field(name) {
            Some(value) if valid(name, value) => {}
            value => {
                return Err(Error::Handshake(format!(
                    "bad {} header: {:?}",
                    name, value
                )))
            }
        }
    }

    let answer = reader.read_exact(16).await?;
    if answer[..] != request.expected[..] {
        return Err(Error::Handshake("challenge response mismatch".to_string()));
    }

    Ok(HandshakeOutcome::Connected)
}

/// Frame codec for draft-00
#[derive(Clone, Debug, Default)]
pub struct Hybi00Codec {}

impl Hybi00Codec {
    pub fn new() -> Self {
        Hybi00Codec {}
    }
}

fn put_length(length: u64, dst: &mut BytesMut) {
    let mut groups = vec![(length & 0x7F) as u8];
    let mut rest = length >> 7;
    while rest > 0 {
        groups.push((rest & 0x7F) as u8 | 0x80);
        rest >>= 7;
    }
    groups.reverse();
    dst.put_slice(&groups);
}

impl Decoder for Hybi00Codec {
    type Item = WsFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WsFrame>> {
        if src.is_empty() {
            return Ok(None);
        }

        let frame_type = src[0];

        if frame_type & 0x80 == 0 {
            if frame_type != 0x00 {
                return Err(Error::MalformedMessage(format!(
                    "unsupported text frame type {:#x}",
                    frame_type
                )));
            }

            return match src[1..].iter().position(|b| *b == 0xFF) {
                None => Ok(None),
                Some(length) => {
                    src.advance(1);
                    let data = src.split_to(length);
                    src.advance(1);
                    String::from_utf8(data.to_vec())
                        .map(|s| Some(WsFrame::Text(s)))
                        .map_err(|_| Error::MalformedMessage("text is not valid UTF-8".to_string()))
                }
            };
        }

        let mut length: u64 = 0;
        let mut idx = 1;
        loop {
            if idx >= src.len() {
                return Ok(None);
            }
            let b = src[idx];
            idx += 1;
            length = length * 128 + (b & 0x7F) as u64;
            if length > MAX_FRAME_LENGTH {
                return Err(Error::MalformedMessage(format!(
                    "frame length exceeds {}",
                    MAX_FRAME_LENGTH
                )));
            }
            if b & 0x80 == 0 {
                break;
            }
        }

        if frame_type == 0xFF && length == 0 {
            src.advance(idx);
            return Ok(Some(WsFrame::Close(String::new())));
        }

        let length = length as usize;
        if src.len() < idx + length {
            src.reserve(idx + length - src.len());
            return Ok(None);
        }

        src.advance(idx);
        Ok(Some(WsFrame::Binary(src.split_to(length).to_vec())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<WsFrame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::UnexpectedEos),
        }
    }
}

impl Encoder<WsFrame> for Hybi00Codec {
    type Error = Error;

    fn encode(&mut self, frame: WsFrame, dst: &mut BytesMut) -> Result<()> {
        match frame {
            WsFrame::Text(text) => {
                dst.reserve(text.len() + 2);
                dst.put_u8(0x00);
                dst.put_slice(text.as_bytes());
                dst.put_u8(0xFF);
            }
            WsFrame::Binary(data) => {
                dst.put_u8(0x80);
                put_length(data.len() as u64, dst);
                dst.put_slice(&data);
            }
            WsFrame::Close(_) => {
                dst.put_slice(&[0xFF, 0x00]);
            }
            WsFrame::Ping(_) | WsFrame::Pong(_) => {
                return Err(Error::InvalidState(
                    "draft-00 has no ping or pong frames".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::{Decoder, Encoder};

    use crate::error::Error;
    use crate::websocket::handshake::{parse_header_line, HandshakeOutcome, HandshakeReader};
    use crate::websocket::{WsEndpoint, WsFrame};

    use super::{challenge_response, perform_handshake, Hybi00Codec, WsKey};

    #[test]
    fn check_keys_decode_to_their_number() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let key = WsKey::generate(&mut rng);
            assert!(!key.key.starts_with(' '));
            assert!(!key.key.ends_with(' '));
            assert_eq!(WsKey::decode(&key.key), Some(key.number));
        }
    }

    #[test]
    fn check_challenge_response_known_value() {
        // Example exchange from draft-ietf-hybi-thewebsocketprotocol-00
        let key1 = WsKey::decode("4 @1  46546xW%0l 1 5").unwrap();
        let key2 = WsKey::decode("12998 5 Y3 1  .P00").unwrap();
        assert_eq!(key1, 829309203);
        assert_eq!(key2, 259970620);
        assert_eq!(
            &challenge_response(key1, key2, b"^n:ds[4U"),
            b"8jKS'y:G*Co,Wxa-"
        );
    }

    #[test]
    fn check_text_and_close_decoding() {
        let mut codec = Hybi00Codec::new();
        let mut buf = BytesMut::from(&b"\x00{\"id\":1}\xff\x00hal"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WsFrame::Text("{\"id\":1}".to_string()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"f\xff\xff\x00");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WsFrame::Text("half".to_string()))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WsFrame::Close(String::new()))
        );
    }

    #[test]
    fn check_binary_length_base_128() {
        let mut codec = Hybi00Codec::new();
        let payload = vec![7u8; 200];
        let mut buf = BytesMut::new();
        codec
            .encode(WsFrame::Binary(payload.clone()), &mut buf)
            .unwrap();
        // 200 = 1 * 128 + 72
        assert_eq!(&buf[..3], &[0x80, 0x81, 72]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WsFrame::Binary(payload))
        );
    }

    #[test]
    fn check_oversized_length_rejected() {
        let mut codec = Hybi00Codec::new();
        let mut buf = BytesMut::from(&[0x80u8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F][..]);
        match codec.decode(&mut buf) {
            Err(Error::MalformedMessage(_)) => {}
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn check_eof_mid_frame() {
        let mut codec = Hybi00Codec::new();
        let mut buf = BytesMut::from(&b"\x00unfinished"[..]);
        match codec.decode_eof(&mut buf) {
            Err(Error::UnexpectedEos) => {}
            r => panic!("unexpected {:?}", r),
        }
    }

    async fn fake_server(mut server: tokio::io::DuplexStream, origin_override: Option<&str>) {
        let mut request = vec![];
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            request.push(byte[0]);
        }
        let mut key3 = [0u8; 8];
        server.read_exact(&mut key3).await.unwrap();

        let text = String::from_utf8(request).unwrap();
        let mut key1 = 0;
        let mut key2 = 0;
        let mut origin = String::new();
        for line in text.split("\r\n").skip(1).filter(|l| !l.is_empty()) {
            let (name, value) = parse_header_line(line).unwrap();
            match &name[..] {
                "sec-websocket-key1" => key1 = WsKey::decode(&value).unwrap(),
                "sec-websocket-key2" => key2 = WsKey::decode(&value).unwrap(),
                "origin" => origin = value,
                _ => {}
            }
        }

        let origin = origin_override.map(|o| o.to_string()).unwrap_or(origin);
        let response = format!(
            "HTTP/1.1 101 WebSocket Protocol Handshake\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\nSec-WebSocket-Origin: {}\r\nSec-WebSocket-Location: ws://localhost:9222/devtools/page/3\r\n\r\n",
            origin
        );
        server.write_all(response.as_bytes()).await.unwrap();
        server
            .write_all(&challenge_response(key1, key2, &key3))
            .await
            .unwrap();
        server.write_all(b"\x00hello\xff").await.unwrap();
    }

    #[tokio::test]
    async fn check_handshake_against_fake_server() {
        let (client, server) = tokio::io::duplex(4096);
        let server = tokio::spawn(fake_server(server, None));

        let endpoint = WsEndpoint::parse("ws://localhost:9222/devtools/page/3").unwrap();
        let mut reader = HandshakeReader::new(client);
        let mut rng = StdRng::seed_from_u64(1);
        let outcome = perform_handshake(&mut reader, &endpoint, "http://localhost", &mut rng)
            .await
            .unwrap();
        assert_eq!(outcome, HandshakeOutcome::Connected);
        server.await.unwrap();

        let (_, mut leftover) = reader.into_parts();
        let mut codec = Hybi00Codec::new();
        assert_eq!(
            codec.decode(&mut leftover).unwrap(),
            Some(WsFrame::Text("hello".to_string()))
        );
    }

    #[tokio::test]
    async fn check_handshake_origin_mismatch() {
        let (client, server) = tokio::io::duplex(4096);
        let server = tokio::spawn(fake_server(server, Some("http://elsewhere")));

        let endpoint = WsEndpoint::parse("ws://localhost:9222/devtools/page/3").unwrap();
        let mut reader = HandshakeReader::new(client);
        let mut rng = StdRng::seed_from_u64(2);
        match perform_handshake(&mut reader, &endpoint, "http://localhost", &mut rng).await {
            Err(Error::Handshake(msg)) => assert!(msg.contains("sec-websocket-origin")),
            r => panic!("unexpected {:?}", r),
        }
        server.await.unwrap();
    }

    #[test]
    fn check_upper_case_origin_rejected() {
        let endpoint = WsEndpoint::parse("ws://localhost:9222/x").unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        assert!(super::build_handshake(&endpoint, "http://LocalHost", &mut rng).is_err());
    }
}

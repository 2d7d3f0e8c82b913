//! WebSocket RFC 6455 (hybi-17)

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::websocket::handshake::{
    base_fields, build_request, read_error_page, read_http_response, HandshakeOutcome,
    HandshakeReader, HttpResponse,
};
use crate::websocket::{WsEndpoint, WsFrame};

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

const CLOSE_NORMAL: u16 = 1000;
const MAX_FRAME_LENGTH: u64 = i32::MAX as u64;

/// How outgoing frames are masked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskStrategy {
    /// No mask bit, the payload goes out as is
    NoMask,
    /// Mask bit set with an all zero key
    TransparentMask,
    /// Random key per frame
    NormalMask,
}

/// The `Sec-WebSocket-Accept` value a server must answer `key` with
pub fn accept_key(key: &str) -> String {
    tungstenite::handshake::derive_accept_key(key.as_bytes())
}

pub fn generate_key<R: Rng + ?Sized>(rng: &mut R) -> String {
    let nonce: [u8; 16] = rng.gen();
    STANDARD.encode(nonce)
}

/// Build the upgrade request, returns it with the key that was sent
pub fn build_handshake<R: Rng + ?Sized>(endpoint: &WsEndpoint, rng: &mut R) -> (Vec<u8>, String) {
    let key = generate_key(rng);

    let mut fields = base_fields();
    fields.push("Upgrade: websocket".to_string());
    fields.push(format!("Host: {}", endpoint.host_field()));
    fields.push(format!("Sec-WebSocket-Key: {}", key));
    fields.push("Sec-WebSocket-Version: 13".to_string());
    fields.shuffle(rng);

    (build_request(&endpoint.resource, &fields, &[]), key)
}

pub fn validate_response(response: &HttpResponse, key: &str) -> Result<()> {
    match response.field("upgrade") {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        v => return Err(Error::Handshake(format!("bad upgrade header: {:?}", v))),
    }

    match response.field("connection") {
        Some(v) if v.eq_ignore_ascii_case("upgrade") => {}
        v => return Err(Error::Handshake(format!("bad connection header: {:?}", v))),
    }

    for name in ["sec-websocket-extensions", "sec-websocket-protocol"] {
        if let Some(v) = response.field(name) {
            return Err(Error::Handshake(format!(
                "server negotiated unrequested {}: {}",
                name, v
            )));
        }
    }

    let expected = accept_key(key);
    match response.field("sec-websocket-accept") {
        Some(v) if v == expected => Ok(()),
        v => Err(Error::Handshake(format!(
            "bad sec-websocket-accept {:?}, expected {}",
            v, expected
        ))),
    }
}

pub async fn perform_handshake<S, R>(
    reader: &mut HandshakeReader<S>,
    endpoint: &WsEndpoint,
    rng: &mut R,
) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Rng + ?Sized,
{
    let (request, key) = build_handshake(endpoint, rng);
    reader.write_all(&request).await?;

    let response = read_http_response(reader).await?;
    if response.code != 101 {
        return read_error_page(reader, &response).await;
    }

    validate_response(&response, &key)?;
    Ok(HandshakeOutcome::Connected)
}

/// Frame codec for RFC 6455, client side
#[derive(Clone, Debug)]
pub struct Hybi17Codec {
    mask: MaskStrategy,
    rng: StdRng,
}

impl Hybi17Codec {
    pub fn new(mask: MaskStrategy) -> Self {
        Hybi17Codec {
            mask,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mask: MaskStrategy, seed: u64) -> Self {
        Hybi17Codec {
            mask,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Decoder for Hybi17Codec {
    type Item = WsFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WsFrame>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let (b0, b1) = (src[0], src[1]);
        let opcode = b0 & 0x0F;

        if b0 & 0x70 != 0 {
            return Err(Error::MalformedMessage("reserved bits set".to_string()));
        }
        if b0 & 0x80 == 0 {
            return Err(Error::MalformedMessage(
                "fragmented frames are not supported".to_string(),
            ));
        }
        if b1 & 0x80 != 0 {
            return Err(Error::MalformedMessage(
                "server sent a masked frame".to_string(),
            ));
        }

        let (length, header) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([src[2], src[3]]) as u64, 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(bytes), 10)
            }
            n => (n as u64, 2),
        };

        if length > MAX_FRAME_LENGTH {
            return Err(Error::MalformedMessage(format!(
                "frame length {} too large",
                length
            )));
        }

        let length = length as usize;
        if src.len() < header + length {
            src.reserve(header + length - src.len());
            return Ok(None);
        }

        src.advance(header);
        let payload = src.split_to(length).to_vec();

        match opcode {
            OPCODE_TEXT => String::from_utf8(payload)
                .map(|s| Some(WsFrame::Text(s)))
                .map_err(|_| Error::MalformedMessage("text is not valid UTF-8".to_string())),
            OPCODE_BINARY => Ok(Some(WsFrame::Binary(payload))),
            OPCODE_CLOSE => {
                let reason = if payload.len() > 2 {
                    String::from_utf8_lossy(&payload[2..]).into_owned()
                } else {
                    String::new()
                };
                Ok(Some(WsFrame::Close(reason)))
            }
            OPCODE_PING => Ok(Some(WsFrame::Ping(payload))),
            OPCODE_PONG => Ok(Some(WsFrame::Pong(payload))),
            OPCODE_CONTINUATION => Err(Error::MalformedMessage(
                "unexpected continuation frame".to_string(),
            )),
            n => Err(Error::MalformedMessage(format!("unknown opcode {:#x}", n))),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<WsFrame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::UnexpectedEos),
        }
    }
}

impl Encoder<WsFrame> for Hybi17Codec {
    type Error = Error;

    fn encode(&mut self, frame: WsFrame, dst: &mut BytesMut) -> Result<()> {
        let (opcode, mut payload) = match frame {
            WsFrame::Text(text) => (OPCODE_TEXT, text.into_bytes()),
            WsFrame::Binary(data) => (OPCODE_BINARY, data),
            WsFrame::Close(message) => {
                let mut payload = CLOSE_NORMAL.to_be_bytes().to_vec();
                payload.extend_from_slice(message.as_bytes());
                (OPCODE_CLOSE, payload)
            }
            WsFrame::Ping(data) => (OPCODE_PING, data),
            WsFrame::Pong(data) => (OPCODE_PONG, data),
        };

        let mask_bit = match self.mask {
            MaskStrategy::NoMask => 0x00,
            _ => 0x80,
        };

        dst.reserve(payload.len() + 14);
        dst.put_u8(0x80 | opcode);

        let length = payload.len();
        if length <= 125 {
            dst.put_u8(mask_bit | length as u8);
        } else if length <= u16::MAX as usize {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(length as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(length as u64);
        }

        match self.mask {
            MaskStrategy::NoMask => {}
            MaskStrategy::TransparentMask => dst.put_slice(&[0; 4]),
            MaskStrategy::NormalMask => {
                let key: [u8; 4] = self.rng.gen();
                dst.put_slice(&key);
                for (i, b) in payload.iter_mut().enumerate() {
                    *b ^= key[i % 4];
                }
            }
        }

        dst.put_slice(&payload);
        Ok(())
    }
}

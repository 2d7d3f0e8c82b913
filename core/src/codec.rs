//! V8 Codec
//!
//! Tokio codec for the header framed messages spoken by the V8 debugger agent.
//!
//! Each message is a block of `Name:value` header lines terminated by an empty line,
//! followed by exactly `Content-Length` bytes of UTF-8 content. Lines may end with
//! either `\r\n` or `\n`.

use bytes::{Buf, BufMut, BytesMut};
use indexmap::IndexMap;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

pub const CONTENT_LENGTH: &str = "Content-Length";
pub const TOOL: &str = "Tool";
pub const DESTINATION: &str = "Destination";

const MAX_CONTENT_LENGTH: usize = i32::MAX as usize;

/// A single framed message, headers in the order they were received or set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    headers: IndexMap<String, String>,
    content: String,
}

impl Message {
    pub fn new(headers: IndexMap<String, String>, content: String) -> Self {
        Message { headers, content }
    }

    /// A message carrying only content
    pub fn with_content(content: String) -> Self {
        Message {
            headers: IndexMap::new(),
            content,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| &s[..])
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    pub fn headers(&self) -> &IndexMap<String, String> {
        &self.headers
    }

    pub fn content(&self) -> &str {
        &self.content[..]
    }

    pub fn into_content(self) -> String {
        self.content
    }

    /// DevTools routing header naming the tool that should handle the message
    pub fn tool(&self) -> Option<&str> {
        self.header(TOOL)
    }

    pub fn destination(&self) -> Option<&str> {
        self.header(DESTINATION)
    }
}

/// Decodes and encodes V8 header framed messages
#[derive(Debug, Default)]
pub struct V8Codec {}

impl V8Codec {
    pub fn new() -> Self {
        V8Codec {}
    }
}

/// Find the end of the header block, returns the parsed header lines and the offset
/// of the first content byte.
fn split_headers(src: &[u8]) -> Option<(Vec<&[u8]>, usize)> {
    let mut lines = vec![];
    let mut start = 0;

    while let Some(pos) = src[start..].iter().position(|b| *b == b'\n') {
        let end = start + pos;
        let mut line = &src[start..end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        start = end + 1;

        if line.is_empty() {
            return Some((lines, start));
        }
        lines.push(line);
    }

    None
}

fn parse_headers(lines: &[&[u8]]) -> Result<IndexMap<String, String>> {
    let mut headers = IndexMap::new();

    for line in lines {
        let line = std::str::from_utf8(line)
            .map_err(|_| Error::MalformedMessage("header is not valid UTF-8".to_string()))?;
        let colon = line.find(':').ok_or_else(|| {
            Error::MalformedMessage(format!("header line without colon: {:?}", line))
        })?;
        let name = line[..colon].trim();
        let value = line[colon + 1..].trim();
        headers.insert(name.to_string(), value.to_string());
    }

    Ok(headers)
}

fn content_length(headers: &IndexMap<String, String>) -> Result<usize> {
    match headers.get(CONTENT_LENGTH) {
        Some(s) => match s.parse::<usize>() {
            Ok(length) if length <= MAX_CONTENT_LENGTH => Ok(length),
            Ok(length) => Err(Error::MalformedMessage(format!(
                "Content-Length {} too large",
                length
            ))),
            Err(_) => Err(Error::MalformedMessage(format!("bad Content-Length {:?}", s))),
        },
        None => Err(Error::MalformedMessage(
            "missing Content-Length header".to_string(),
        )),
    }
}

impl Decoder for V8Codec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        let (headers, body_start) = match split_headers(&src[..]) {
            Some((lines, body_start)) => (parse_headers(&lines)?, body_start),
            None => return Ok(None),
        };

        let length = content_length(&headers)?;
        let end = body_start
            .checked_add(length)
            .ok_or_else(|| Error::MalformedMessage("message length overflows".to_string()))?;

        if src.len() < end {
            src.reserve(end - src.len());
            return Ok(None);
        }

        src.advance(body_start);
        let body = src.split_to(length);
        let content = String::from_utf8(body.to_vec())
            .map_err(|_| Error::MalformedMessage("content is not valid UTF-8".to_string()))?;

        Ok(Some(Message { headers, content }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::MalformedMessage(format!(
                "stream ended inside a message, {} bytes left over",
                src.len()
            ))),
        }
    }
}

impl Encoder<Message> for V8Codec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let content = message.content.as_bytes();

        for (name, value) in message.headers.iter() {
            if name == CONTENT_LENGTH {
                continue;
            }
            dst.put_slice(format!("{}:{}\r\n", name, value).as_bytes());
        }

        dst.put_slice(format!("{}:{}\r\n\r\n", CONTENT_LENGTH, content.len()).as_bytes());
        dst.put_slice(content);

        Ok(())
    }
}

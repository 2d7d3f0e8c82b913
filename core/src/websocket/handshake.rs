//! HTTP upgrade plumbing shared by both WebSocket variants
//!
//! The handshake is read line by line straight off the stream. Anything read past the
//! end of the handshake is handed over to the frame reader through `into_parts`.

use bytes::{Buf, BytesMut};
use indexmap::IndexMap;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

lazy_static! {
    static ref STATUS_LINE: Regex = Regex::new(r"^HTTP/1\.[01] (\d{3})(?: (.*))?$").unwrap();
}

/// Result of a handshake that produced a well formed HTTP response
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Connected,
    /// The server answered with an HTML error page instead of upgrading
    ErrorPage {
        code: u16,
        reason: String,
        body: String,
    },
}

/// A parsed HTTP response head, field names lower cased
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub code: u16,
    pub reason: String,
    pub fields: IndexMap<String, String>,
}

impl HttpResponse {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|s| &s[..])
    }
}

/// Buffered reader over the raw stream used during the handshake
#[derive(Debug)]
pub struct HandshakeReader<S> {
    io: S,
    buf: BytesMut,
}

impl<S> HandshakeReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S) -> Self {
        HandshakeReader {
            io,
            buf: BytesMut::with_capacity(1024),
        }
    }

    async fn fill(&mut self) -> Result<usize> {
        Ok(self.io.read_buf(&mut self.buf).await?)
    }

    /// Read one line terminated by CRLF
    ///
    /// A bare LF, or a CR followed by anything but LF, is malformed. Running out of
    /// input before the end of the line is `UnexpectedEos`.
    pub async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\r' || *b == b'\n') {
                if self.buf[pos] == b'\n' {
                    return Err(Error::Handshake("line terminated by bare LF".to_string()));
                }
                if pos + 1 < self.buf.len() {
                    if self.buf[pos + 1] != b'\n' {
                        return Err(Error::Handshake("CR not followed by LF".to_string()));
                    }
                    let line = self.buf.split_to(pos);
                    self.buf.advance(2);
                    return String::from_utf8(line.to_vec())
                        .map_err(|_| Error::Handshake("line is not valid UTF-8".to_string()));
                }
            }

            if self.fill().await? == 0 {
                return Err(Error::UnexpectedEos);
            }
        }
    }

    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(Error::UnexpectedEos);
            }
        }
        Ok(self.buf.split_to(n).to_vec())
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        while self.fill().await? != 0 {}
        Ok(self.buf.split().to_vec())
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// The stream and any bytes already read beyond the handshake
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.io, self.buf)
    }
}

/// Header fields every upgrade request carries
pub fn base_fields() -> Vec<String> {
    vec!["Connection: Upgrade".to_string()]
}

/// Serialize a `GET` request with the given fields, followed by `trailer`
pub fn build_request(resource: &str, fields: &[String], trailer: &[u8]) -> Vec<u8> {
    let mut request = format!("GET {} HTTP/1.1\r\n", resource);
    for field in fields {
        request.push_str(field);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    let mut bytes = request.into_bytes();
    bytes.extend_from_slice(trailer);
    bytes
}

/// Split a `Name: value` line, the name lower cased and one optional space stripped
pub fn parse_header_line(line: &str) -> Result<(String, String)> {
    let colon = line
        .find(':')
        .ok_or_else(|| Error::Handshake(format!("header without colon: {:?}", line)))?;

    let name = line[..colon].to_ascii_lowercase();
    if name.is_empty() {
        return Err(Error::Handshake(format!("empty header name: {:?}", line)));
    }

    let value = &line[colon + 1..];
    let value = value.strip_prefix(' ').unwrap_or(value);

    Ok((name, value.to_string()))
}

pub async fn read_http_response<S>(reader: &mut HandshakeReader<S>) -> Result<HttpResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let status = reader.read_line().await?;
    let caps = STATUS_LINE
        .captures(&status)
        .ok_or_else(|| Error::Handshake(format!("bad status line: {:?}", status)))?;

    let code = caps[1]
        .parse::<u16>()
        .map_err(|_| Error::Handshake(format!("bad status code: {:?}", status)))?;
    let reason = caps.get(2).map_or("", |m| m.as_str()).to_string();

    let mut fields = IndexMap::new();
    loop {
        let line = reader.read_line().await?;
        if line.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(&line)?;
        if fields.contains_key(&name) {
            return Err(Error::Handshake(format!("duplicate header field {}", name)));
        }
        fields.insert(name, value);
    }

    Ok(HttpResponse {
        code,
        reason,
        fields,
    })
}

/// Turn a response that didn't upgrade into an error page, if it carries one
pub async fn read_error_page<S>(
    reader: &mut HandshakeReader<S>,
    response: &HttpResponse,
) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let is_html = response
        .field("content-type")
        .map_or(false, |t| t.to_ascii_lowercase().starts_with("text/html"));
    let length = response
        .field("content-length")
        .and_then(|l| l.trim().parse::<usize>().ok());

    match (is_html, length) {
        (true, Some(length)) => {
            let body = reader.read_exact(length).await?;
            Ok(HandshakeOutcome::ErrorPage {
                code: response.code,
                reason: response.reason.clone(),
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        }
        _ => Err(Error::Handshake(format!(
            "unexpected response {} {}",
            response.code, response.reason
        ))),
    }
}

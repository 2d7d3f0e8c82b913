//! Connection handshakes
//!
//! Chromium's DevTools agent greets with a fixed line that has to be echoed, a
//! standalone V8 agent sends a header only message describing itself. Both happen
//! before the header framed message exchange starts.

use std::time::Duration;

use futures::StreamExt;
use log::info;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

use chromedbg_core::codec::{Message, V8Codec};
use chromedbg_core::transport::MessageWriter;
use chromedbg_core::websocket::handshake::HandshakeReader;
use chromedbg_core::{Error, Result};

pub const CHROMIUM_HANDSHAKE: &str = "ChromeDevToolsHandshake";

const PROTOCOL_VERSION: &str = "Protocol-Version";
const V8_VERSION: &str = "V8-Version";
const EMBEDDING_HOST: &str = "Embedding-Host";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handshaker {
    Chromium,
    StandaloneV8,
    /// The agent starts exchanging messages straight away
    None,
}

/// What a standalone V8 agent says about itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteInfo {
    pub protocol_version: String,
    pub v8_version: String,
    pub embedding_host: Option<String>,
}

impl RemoteInfo {
    fn from_greeting(message: &Message) -> Result<RemoteInfo> {
        let required = |name: &str| {
            message
                .header(name)
                .map(String::from)
                .ok_or_else(|| Error::Handshake(format!("greeting has no {} header", name)))
        };

        Ok(RemoteInfo {
            protocol_version: required(PROTOCOL_VERSION)?,
            v8_version: required(V8_VERSION)?,
            embedding_host: message.header(EMBEDDING_HOST).map(String::from),
        })
    }
}

/// A connection past its handshake, ready for the reader task
pub struct V8Channel<S> {
    pub frames: FramedRead<ReadHalf<S>, V8Codec>,
    pub writer: MessageWriter<Message>,
    pub remote: Option<RemoteInfo>,
}

impl Handshaker {
    pub async fn perform<S>(&self, stream: S, handshake_timeout: Duration) -> Result<V8Channel<S>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        timeout(handshake_timeout, self.perform_inner(stream))
            .await
            .map_err(|_| Error::Timeout("waiting for debugger handshake".to_string()))?
    }

    async fn perform_inner<S>(&self, stream: S) -> Result<V8Channel<S>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (stream, leftover) = match self {
            Handshaker::Chromium => {
                let mut reader = HandshakeReader::new(stream);
                reader
                    .write_all(format!("{}\r\n", CHROMIUM_HANDSHAKE).as_bytes())
                    .await?;

                let reply = reader.read_line().await?;
                if reply != CHROMIUM_HANDSHAKE {
                    return Err(Error::Handshake(format!(
                        "unexpected handshake reply {:?}",
                        reply
                    )));
                }
                reader.into_parts()
            }
            Handshaker::StandaloneV8 | Handshaker::None => (stream, Default::default()),
        };

        let (rd, wr) = tokio::io::split(stream);
        let mut frames = FramedRead::new(rd, V8Codec::new());
        frames.read_buffer_mut().extend_from_slice(&leftover);
        let writer = MessageWriter::new(FramedWrite::new(wr, V8Codec::new()));

        let remote = match self {
            Handshaker::StandaloneV8 => {
                let greeting = frames.next().await.ok_or(Error::UnexpectedEos)??;
                let remote = RemoteInfo::from_greeting(&greeting)?;
                info!(
                    "Connected to V8 {} (protocol {}), embedded in {}",
                    remote.v8_version,
                    remote.protocol_version,
                    remote.embedding_host.as_deref().unwrap_or("unknown host")
                );
                Some(remote)
            }
            _ => None,
        };

        Ok(V8Channel {
            frames,
            writer,
            remote,
        })
    }
}

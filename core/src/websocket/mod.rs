//! WebSocket
//!
//! Client side of the two WebSocket revisions debuggable browsers have spoken:
//! draft-00 (`hybi00`) and RFC 6455 (`hybi17`). Both share the HTTP upgrade plumbing
//! in `handshake` and produce the same `WsFrame`s.

pub mod handshake;
pub mod hybi00;
pub mod hybi17;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::notifier::{ShutdownCause, ShutdownNotifier};
use crate::transport::{self, ConnectionLogger, Dispatcher, LoggingStream, MessageWriter};

use self::handshake::{HandshakeOutcome, HandshakeReader};
use self::hybi00::Hybi00Codec;
use self::hybi17::{Hybi17Codec, MaskStrategy};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(String),
}

/// Where a WebSocket lives, split out of a `ws://` URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsEndpoint {
    pub host: String,
    pub port: u16,
    pub resource: String,
}

impl WsEndpoint {
    pub fn new(host: &str, port: u16, resource: &str) -> Self {
        WsEndpoint {
            host: host.to_string(),
            port,
            resource: resource.to_string(),
        }
    }

    pub fn parse(url: &str) -> Result<WsEndpoint> {
        let url = Url::parse(url)
            .map_err(|e| Error::InvalidState(format!("bad websocket url {}: {}", url, e)))?;

        if url.scheme() != "ws" {
            return Err(Error::InvalidState(format!(
                "unsupported websocket scheme {}",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidState(format!("websocket url without host: {}", url)))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let mut resource = url.path().to_string();
        if let Some(query) = url.query() {
            resource.push('?');
            resource.push_str(query);
        }

        Ok(WsEndpoint::new(host, port, &resource))
    }

    /// Value for the `Host` field, port omitted when it is the default
    pub fn host_field(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The `ws://` URL a draft-00 server reports back in `Sec-WebSocket-Location`
    pub fn location(&self) -> String {
        format!("ws://{}{}", self.host_field(), self.resource)
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Protocol revision and its options
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsVersion {
    Hybi00 { origin: String },
    Hybi17 { mask: MaskStrategy },
}

/// Frame codec of either revision
#[derive(Clone, Debug)]
pub enum WsCodec {
    Hybi00(Hybi00Codec),
    Hybi17(Hybi17Codec),
}

impl WsCodec {
    pub fn for_version(version: &WsVersion) -> Self {
        match version {
            WsVersion::Hybi00 { .. } => WsCodec::Hybi00(Hybi00Codec::new()),
            WsVersion::Hybi17 { mask } => WsCodec::Hybi17(Hybi17Codec::new(*mask)),
        }
    }
}

impl Decoder for WsCodec {
    type Item = WsFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WsFrame>> {
        match self {
            WsCodec::Hybi00(codec) => codec.decode(src),
            WsCodec::Hybi17(codec) => codec.decode(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<WsFrame>> {
        match self {
            WsCodec::Hybi00(codec) => codec.decode_eof(src),
            WsCodec::Hybi17(codec) => codec.decode_eof(src),
        }
    }
}

impl Encoder<WsFrame> for WsCodec {
    type Error = Error;

    fn encode(&mut self, frame: WsFrame, dst: &mut BytesMut) -> Result<()> {
        match self {
            WsCodec::Hybi00(codec) => codec.encode(frame, dst),
            WsCodec::Hybi17(codec) => codec.encode(frame, dst),
        }
    }
}

/// An upgraded connection, ready to exchange frames
pub struct WsConnection<S> {
    writer: MessageWriter<WsFrame>,
    frames: FramedRead<ReadHalf<S>, WsCodec>,
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn writer(&self) -> MessageWriter<WsFrame> {
        self.writer.clone()
    }

    /// Start the reader task, text frames are handed to `on_text`
    ///
    /// Pings are answered, binary frames are logged and dropped and a close frame
    /// from the server is acknowledged before shutting down.
    pub fn spawn<F>(
        self,
        shutdown: Arc<ShutdownNotifier>,
        mut on_text: F,
    ) -> (JoinHandle<()>, Dispatcher)
    where
        F: FnMut(String) -> ControlFlow<ShutdownCause> + Send + 'static,
    {
        let writer = self.writer;

        transport::spawn_reader(self.frames, shutdown, move |frame| match frame {
            WsFrame::Text(text) => on_text(text),
            WsFrame::Ping(data) => {
                let writer = writer.clone();
                tokio::spawn(async move {
                    if let Err(e) = writer.send(WsFrame::Pong(data)).await {
                        warn!("Failed to answer ping: {}", e);
                    }
                });
                ControlFlow::Continue(())
            }
            WsFrame::Pong(_) => ControlFlow::Continue(()),
            WsFrame::Binary(data) => {
                warn!("Ignoring binary frame of {} bytes", data.len());
                ControlFlow::Continue(())
            }
            WsFrame::Close(reason) => {
                info!("Server closed websocket: {:?}", reason);
                let writer = writer.clone();
                tokio::spawn(async move {
                    let _ = writer.send(WsFrame::Close(String::new())).await;
                });
                ControlFlow::Break(ShutdownCause::RemoteClose)
            }
        })
    }
}

/// Perform the upgrade over an already open stream
pub async fn handshake<S>(
    stream: S,
    endpoint: &WsEndpoint,
    version: &WsVersion,
    handshake_timeout: Duration,
) -> Result<WsConnection<S>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = HandshakeReader::new(stream);
    let mut rng = StdRng::from_entropy();

    let outcome = timeout(handshake_timeout, async {
        match version {
            WsVersion::Hybi00 { origin } => {
                hybi00::perform_handshake(&mut reader, endpoint, origin, &mut rng).await
            }
            WsVersion::Hybi17 { .. } => {
                hybi17::perform_handshake(&mut reader, endpoint, &mut rng).await
            }
        }
    })
    .await
    .map_err(|_| Error::Timeout("waiting for websocket handshake".to_string()))??;

    if let HandshakeOutcome::ErrorPage { code, reason, body } = outcome {
        return Err(Error::ErrorPage { code, reason, body });
    }

    let (io, leftover) = reader.into_parts();
    let (rd, wr) = tokio::io::split(io);

    let mut frames = FramedRead::new(rd, WsCodec::for_version(version));
    frames.read_buffer_mut().extend_from_slice(&leftover);

    let writer = MessageWriter::new(FramedWrite::new(wr, WsCodec::for_version(version)));

    info!("WebSocket connected to {}", endpoint.location());

    Ok(WsConnection { writer, frames })
}

/// Open a TCP connection to `url` and upgrade it
pub async fn connect(
    url: &str,
    version: &WsVersion,
    config: &Config,
    logger: Option<Arc<dyn ConnectionLogger>>,
) -> Result<WsConnection<LoggingStream<TcpStream>>> {
    let endpoint = WsEndpoint::parse(url)?;
    let stream = transport::open(&endpoint.socket_addr(), config.connect_timeout()).await?;
    handshake(
        LoggingStream::new(stream, logger),
        &endpoint,
        version,
        config.handshake_timeout(),
    )
    .await
}

//! Transport
//!
//! Opens TCP connections to a VM, optionally mirrors every byte to a connection
//! logger and runs the single reader task each connection gets. Writes from any
//! number of tasks are serialized through a `MessageWriter`.

use std::fmt;
use std::io;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, info};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::notifier::{ShutdownCause, ShutdownNotifier};

/// Open a TCP connection to `addr` (`host:port`)
pub async fn open(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
    debug!("Connecting to {}", addr);

    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Err(_) => Err(Error::Timeout(format!("connecting to {}", addr))),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            Err(Error::ConnectionRefused(addr.to_string()))
        }
        Ok(Err(e)) => Err(Error::Io(e)),
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            info!("Connected to {}", addr);
            Ok(stream)
        }
    }
}

/// Receives a copy of the raw traffic of a connection
pub trait ConnectionLogger: Send + Sync {
    fn log_incoming(&self, bytes: &[u8]);

    fn log_outgoing(&self, bytes: &[u8]);

    /// Called between logical messages
    fn mark_separator(&self) {}

    /// Called once the incoming side reaches end of stream
    fn handle_eos(&self) {}
}

/// Stream wrapper that tees reads and writes to a `ConnectionLogger`
#[pin_project]
pub struct LoggingStream<S> {
    #[pin]
    inner: S,
    logger: Option<Arc<dyn ConnectionLogger>>,
}

impl<S> fmt::Debug for LoggingStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingStream")
            .field("logging", &self.logger.is_some())
            .finish()
    }
}

impl<S> LoggingStream<S> {
    pub fn new(inner: S, logger: Option<Arc<dyn ConnectionLogger>>) -> Self {
        LoggingStream { inner, logger }
    }

    pub fn logger(&self) -> Option<Arc<dyn ConnectionLogger>> {
        self.logger.clone()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead> AsyncRead for LoggingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let had_room = buf.remaining() > 0;

        let res = this.inner.poll_read(cx, buf);

        if let (Poll::Ready(Ok(())), Some(logger)) = (&res, this.logger.as_ref()) {
            let read = &buf.filled()[before..];
            if !read.is_empty() {
                logger.log_incoming(read);
            } else if had_room {
                logger.handle_eos();
            }
        }

        res
    }
}

impl<S: AsyncWrite> AsyncWrite for LoggingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let res = this.inner.poll_write(cx, buf);

        if let (Poll::Ready(Ok(n)), Some(logger)) = (&res, this.logger.as_ref()) {
            logger.log_outgoing(&buf[..*n]);
        }

        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

pub type BoxSink<M> = Pin<Box<dyn Sink<M, Error = Error> + Send>>;

/// Shared, serialized access to the outgoing side of a connection
pub struct MessageWriter<M> {
    sink: Arc<Mutex<BoxSink<M>>>,
}

impl<M> Clone for MessageWriter<M> {
    fn clone(&self) -> Self {
        MessageWriter {
            sink: self.sink.clone(),
        }
    }
}

impl<M> fmt::Debug for MessageWriter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageWriter").finish()
    }
}

impl<M: Send + 'static> MessageWriter<M> {
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<M, Error = Error> + Send + 'static,
    {
        MessageWriter {
            sink: Arc::new(Mutex::new(Box::pin(sink))),
        }
    }

    /// Take the writer lock, nothing else can write until the guard is dropped
    pub async fn lock(&self) -> MutexGuard<'_, BoxSink<M>> {
        self.sink.lock().await
    }

    pub async fn send(&self, message: M) -> Result<()> {
        self.sink.lock().await.send(message).await
    }

    pub async fn close(&self) -> Result<()> {
        self.sink.lock().await.close().await
    }
}

type Work = Box<dyn FnOnce() + Send>;

/// Queues work onto a connection's reader task
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Work>,
    shutdown: Arc<ShutdownNotifier>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish()
    }
}

impl Dispatcher {
    /// Run `work` on the dispatch context, in order with incoming messages
    pub fn run_in_dispatch<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutdown.is_signalled() {
            return Err(Error::ConnectionClosed);
        }
        self.tx
            .send(Box::new(work))
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Spawn the reader task of a connection
///
/// Every decoded item is handed to `on_item` in arrival order. The task ends when
/// `on_item` breaks, the stream fails or ends, or shutdown is signalled elsewhere.
/// Whatever ends it first decides the shutdown cause.
pub fn spawn_reader<St, T, F>(
    mut stream: St,
    shutdown: Arc<ShutdownNotifier>,
    mut on_item: F,
) -> (JoinHandle<()>, Dispatcher)
where
    St: Stream<Item = Result<T>> + Send + Unpin + 'static,
    T: Send + 'static,
    F: FnMut(T) -> ControlFlow<ShutdownCause> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Work>();
    let token = shutdown.token();
    let dispatcher = Dispatcher {
        tx,
        shutdown: shutdown.clone(),
    };

    let handle = tokio::spawn(async move {
        let cause = loop {
            tokio::select! {
                _ = token.cancelled() => break None,
                Some(work) = rx.recv() => work(),
                item = stream.next() => match item {
                    Some(Ok(item)) => {
                        if let ControlFlow::Break(cause) = on_item(item) {
                            break Some(cause);
                        }
                    }
                    Some(Err(e)) => {
                        error!("Reading from connection failed: {}", e);
                        break Some(ShutdownCause::Error(e.to_string()));
                    }
                    None => break Some(ShutdownCause::Eos),
                },
            }
        };

        if let Some(cause) = cause {
            shutdown.signal(cause);
        }

        debug!("Reader task finished");
    });

    (handle, dispatcher)
}

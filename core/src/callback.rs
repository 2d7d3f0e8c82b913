//! Callbacks
//!
//! Every command sent to the VM may carry a response callback and a done callback.
//! The response callback receives the outcome of the command. The done callback is
//! always called afterwards, even if the response callback panicked, and is told
//! about such a failure.
//!
//! `Completion` and `BlockingCompletion` turn the callback discipline into something
//! a caller can wait on, asynchronously or by blocking the current thread.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Error, Result};

pub type ResponseCallback<R> = Box<dyn FnOnce(Result<R>) + Send>;
pub type DoneCallback = Box<dyn FnOnce(Option<CallbackFault>) + Send>;

/// A response callback panicked while handling its result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackFault {
    message: String,
}

impl CallbackFault {
    pub fn from_panic(payload: Box<dyn Any + Send>) -> CallbackFault {
        let message = match payload.downcast::<String>() {
            Ok(s) => *s,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(s) => s.to_string(),
                Err(_) => "unknown panic".to_string(),
            },
        };
        CallbackFault { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CallbackFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback panicked: {}", self.message)
    }
}

/// The pair of optional callbacks attached to a command
pub struct Callbacks<R> {
    pub response: Option<ResponseCallback<R>>,
    pub done: Option<DoneCallback>,
}

impl<R> fmt::Debug for Callbacks<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("response", &self.response.is_some())
            .field("done", &self.done.is_some())
            .finish()
    }
}

impl<R> Default for Callbacks<R> {
    fn default() -> Self {
        Callbacks::none()
    }
}

impl<R> Callbacks<R> {
    /// No callbacks, the command is fire and forget
    pub fn none() -> Self {
        Callbacks {
            response: None,
            done: None,
        }
    }

    pub fn on_response<F>(callback: F) -> Self
    where
        F: FnOnce(Result<R>) + Send + 'static,
    {
        Callbacks {
            response: Some(Box::new(callback)),
            done: None,
        }
    }

    pub fn with_done<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Option<CallbackFault>) + Send + 'static,
    {
        self.done = Some(Box::new(callback));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.response.is_none() && self.done.is_none()
    }
}

/// Marker that a command was handed to the transport
///
/// Completion is reported through the callbacks that were sent with it.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayOk {
    seq: u64,
}

impl RelayOk {
    pub fn new(seq: u64) -> Self {
        RelayOk { seq }
    }

    /// The sequence number the command was sent with
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Future resolving once the response callback it was created with is called
///
/// If the callback is dropped without being called the completion resolves to
/// `ConnectionClosed`.
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a response callback and the `Completion` it resolves
///
/// `map` runs inside the callback, on the reader's dispatch context.
pub fn completion<R, T, F>(map: F) -> (Callbacks<R>, Completion<T>)
where
    R: Send + 'static,
    T: Send + 'static,
    F: FnOnce(Result<R>) -> Result<T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let callbacks = Callbacks::on_response(move |result| {
        // Receiver may have been dropped, nobody is waiting any more
        let _ = tx.send(map(result));
    });
    (callbacks, Completion { rx })
}

/// Blocking counterpart of `Completion` for callers outside the runtime
#[derive(Debug)]
pub struct BlockingCompletion<T> {
    rx: mpsc::Receiver<Result<T>>,
}

impl<T> BlockingCompletion<T> {
    /// Block until the callback fires or `timeout` elapses
    ///
    /// A callback firing after the timeout is a no-op.
    pub fn wait(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "waiting {}ms for response",
                timeout.as_millis()
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }
}

pub fn blocking_completion<R, T, F>(map: F) -> (Callbacks<R>, BlockingCompletion<T>)
where
    R: Send + 'static,
    T: Send + 'static,
    F: FnOnce(Result<R>) -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let callbacks = Callbacks::on_response(move |result| {
        let _ = tx.send(map(result));
    });
    (callbacks, BlockingCompletion { rx })
}

//! Notifier
//!
//! This module contains the tools for notifying every interested party that a
//! connection has shut down. Shutdown is signalled exactly once, whoever gets there
//! first (explicit detach, remote close, end of stream or a fatal error) wins and
//! every registered listener is called once with the cause.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Why a connection was shut down
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownCause {
    UserRequest,
    RemoteClose,
    Eos,
    Error(String),
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::UserRequest => write!(f, "user request"),
            ShutdownCause::RemoteClose => write!(f, "closed by remote"),
            ShutdownCause::Eos => write!(f, "end of stream"),
            ShutdownCause::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

type Listener = Box<dyn FnOnce(&ShutdownCause) + Send>;

/// The `ShutdownNotifier` is shared between the reader task, the writers and the
/// session that owns a connection.
pub struct ShutdownNotifier {
    signalled: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
    cause: Mutex<Option<ShutdownCause>>,
    token: CancellationToken,
}

impl fmt::Debug for ShutdownNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownNotifier")
            .field("signalled", &self.is_signalled())
            .field("cause", &*self.cause.lock())
            .finish()
    }
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        ShutdownNotifier::new()
    }
}

impl ShutdownNotifier {
    pub fn new() -> ShutdownNotifier {
        ShutdownNotifier {
            signalled: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            cause: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    /// Add a listener to be called on shutdown
    ///
    /// Fails with `ConnectionClosed` when shutdown has already been signalled, the
    /// listener is not called in that case.
    pub fn add_listener<F>(&self, listener: F) -> Result<()>
    where
        F: FnOnce(&ShutdownCause) + Send + 'static,
    {
        let mut listeners = self.listeners.lock();
        if self.is_signalled() {
            return Err(Error::ConnectionClosed);
        }
        listeners.push(Box::new(listener));
        Ok(())
    }

    /// Signal shutdown, returns true if this call was the one that did it
    pub fn signal(&self, cause: ShutdownCause) -> bool {
        if self
            .signalled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        info!("Connection shutting down: {}", cause);

        *self.cause.lock() = Some(cause.clone());
        self.token.cancel();

        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener(&cause);
        }

        true
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::SeqCst)
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        self.cause.lock().clone()
    }

    /// A token cancelled at shutdown, used to stop the reader task
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

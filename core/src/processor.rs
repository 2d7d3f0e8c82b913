//! Command processor
//!
//! Correlates outgoing commands with the responses the VM sends back. Each command is
//! given the next sequence number, its callbacks are registered under that number and
//! the command is written, all while holding the writer lock so that sequence order and
//! wire order agree.
//!
//! When the connection goes away every pending callback is failed with `Detached`, in
//! the order the commands were sent, and further registrations are refused.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::SinkExt;
use indexmap::IndexMap;
use log::{debug, error};
use parking_lot::Mutex;

use crate::callback::{CallbackFault, Callbacks, RelayOk};
use crate::error::{Error, Result};
use crate::transport::MessageWriter;

/// Monotonic source of command sequence numbers
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        SequenceCounter::new()
    }
}

impl SequenceCounter {
    pub fn new() -> Self {
        SequenceCounter::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        SequenceCounter {
            next: AtomicU64::new(first),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// What the VM is busy with, as seen from the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmStatus {
    /// Name of the oldest command still waiting for a response
    pub current_request: String,
    /// How many more commands are queued behind it
    pub enqueued: usize,
}

struct PendingCallback<R> {
    name: String,
    callbacks: Callbacks<R>,
    enqueued: Instant,
}

impl<R> PendingCallback<R> {
    /// Call the response callback then, whatever happened, the done callback
    fn deliver(self, result: Result<R>) {
        let Callbacks { response, done } = self.callbacks;

        let fault = response.and_then(|callback| {
            panic::catch_unwind(AssertUnwindSafe(move || callback(result)))
                .err()
                .map(CallbackFault::from_panic)
        });

        if let Some(fault) = &fault {
            error!("Response callback for {} failed: {}", self.name, fault);
        }

        if let Some(done) = done {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || done(fault))) {
                error!(
                    "Done callback for {} failed: {}",
                    self.name,
                    CallbackFault::from_panic(payload)
                );
            }
        }
    }
}

/// The table of commands awaiting a response, `None` once closed
struct PendingTable<R> {
    entries: Mutex<Option<IndexMap<u64, PendingCallback<R>>>>,
}

impl<R> PendingTable<R> {
    fn new() -> Self {
        PendingTable {
            entries: Mutex::new(Some(IndexMap::new())),
        }
    }

    fn register(&self, seq: u64, entry: PendingCallback<R>) -> Result<()> {
        match self.entries.lock().as_mut() {
            Some(entries) => {
                entries.insert(seq, entry);
                Ok(())
            }
            None => Err(Error::ConnectionClosed),
        }
    }

    fn take(&self, seq: u64) -> Option<PendingCallback<R>> {
        self.entries
            .lock()
            .as_mut()
            .and_then(|entries| entries.shift_remove(&seq))
    }

    fn close(&self) -> Vec<PendingCallback<R>> {
        self.entries
            .lock()
            .take()
            .map(|entries| entries.into_values().collect())
            .unwrap_or_default()
    }

    fn status(&self) -> Option<VmStatus> {
        self.entries.lock().as_ref().and_then(|entries| {
            entries.values().next().map(|oldest| VmStatus {
                current_request: oldest.name.clone(),
                enqueued: entries.len() - 1,
            })
        })
    }

    fn contains(&self, seq: u64) -> bool {
        self.entries
            .lock()
            .as_ref()
            .map_or(false, |entries| entries.contains_key(&seq))
    }

    fn is_closed(&self) -> bool {
        self.entries.lock().is_none()
    }
}

/// Sends commands of type `M` and routes responses of type `R` to their callbacks
pub struct CommandProcessor<M, R> {
    writer: MessageWriter<M>,
    pending: PendingTable<R>,
    seq: SequenceCounter,
}

impl<M, R> CommandProcessor<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    pub fn new(writer: MessageWriter<M>, seq: SequenceCounter) -> Self {
        CommandProcessor {
            writer,
            pending: PendingTable::new(),
            seq,
        }
    }

    pub fn writer(&self) -> &MessageWriter<M> {
        &self.writer
    }

    /// Send a command built by `build` from its sequence number
    ///
    /// Callbacks are only registered if there are any. After the connection has closed
    /// nothing is written and `ConnectionClosed` is returned. If writing fails the
    /// registration is undone and the write error returned.
    pub async fn send<F>(&self, name: &str, build: F, callbacks: Callbacks<R>) -> Result<RelayOk>
    where
        F: FnOnce(u64) -> Result<M>,
    {
        let mut writer = self.writer.lock().await;

        if self.pending.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let seq = self.seq.next();
        let message = build(seq)?;

        let registered = !callbacks.is_empty();
        if registered {
            self.pending.register(
                seq,
                PendingCallback {
                    name: name.to_string(),
                    callbacks,
                    enqueued: Instant::now(),
                },
            )?;
            self.report_status();
        }

        debug!("Sending {} with seq {}", name, seq);

        if let Err(e) = writer.send(message).await {
            if registered {
                self.pending.take(seq);
                self.report_status();
            }
            return Err(e);
        }

        Ok(RelayOk::new(seq))
    }

    /// Route a response to the callbacks registered for `seq`
    ///
    /// Returns false if nothing was waiting for it.
    pub fn process_response(&self, seq: u64, response: R) -> bool {
        self.complete(seq, Ok(response))
    }

    /// Fail the command registered for `seq`
    pub fn process_failure(&self, seq: u64, error: Error) -> bool {
        self.complete(seq, Err(error))
    }

    fn complete(&self, seq: u64, result: Result<R>) -> bool {
        match self.pending.take(seq) {
            None => {
                debug!("No callback waiting for response to seq {}", seq);
                false
            }
            Some(entry) => {
                debug!(
                    "Request-response roundtrip for {} ({}): {:?}",
                    entry.name,
                    seq,
                    entry.enqueued.elapsed()
                );
                self.report_status();
                entry.deliver(result);
                true
            }
        }
    }

    /// The connection is gone, fail everything pending and refuse anything new
    pub fn process_eos(&self, reason: &str) {
        let entries = self.pending.close();

        if !entries.is_empty() {
            debug!("Failing {} pending commands: {}", entries.len(), reason);
        }

        for entry in entries {
            entry.deliver(Err(Error::Detached(reason.to_string())));
        }
    }

    pub fn status(&self) -> Option<VmStatus> {
        self.pending.status()
    }

    pub fn is_pending(&self, seq: u64) -> bool {
        self.pending.contains(seq)
    }

    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    fn report_status(&self) {
        match self.status() {
            Some(status) => debug!(
                "VM busy with {}, {} more enqueued",
                status.current_request, status.enqueued
            ),
            None => debug!("VM idle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::channel::mpsc;
    use futures::{SinkExt, StreamExt};

    use crate::callback::{completion, Callbacks};
    use crate::error::Error;
    use crate::transport::MessageWriter;

    use super::{CommandProcessor, SequenceCounter};

    type Processor = CommandProcessor<String, i64>;

    fn processor(first_seq: u64) -> (Processor, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded();
        let writer = MessageWriter::new(tx.sink_map_err(|_| Error::ConnectionClosed));
        (
            CommandProcessor::new(writer, SequenceCounter::starting_at(first_seq)),
            rx,
        )
    }

    #[tokio::test]
    async fn check_response_routed_by_seq() {
        let (processor, mut rx) = processor(5);
        let (callbacks, done) = completion(|r: crate::Result<i64>| r);

        let relay = processor
            .send("evaluate", |seq| Ok(format!("evaluate {}", seq)), callbacks)
            .await
            .unwrap();
        assert_eq!(relay.seq(), 5);
        assert_eq!(rx.next().await.unwrap(), "evaluate 5");
        assert!(processor.is_pending(5));

        assert!(processor.process_response(5, 2));
        assert_eq!(done.await.unwrap(), 2);
        assert!(!processor.is_pending(5));

        // At most once
        assert!(!processor.process_response(5, 3));
    }

    #[tokio::test]
    async fn check_fire_and_forget_not_registered() {
        let (processor, mut rx) = processor(1);
        let relay = processor
            .send("continue", |seq| Ok(seq.to_string()), Callbacks::none())
            .await
            .unwrap();
        assert_eq!(rx.next().await.unwrap(), "1");
        assert!(!processor.is_pending(relay.seq()));
        assert_eq!(processor.status(), None);
    }

    #[tokio::test]
    async fn check_eos_fails_pending_in_order() {
        let (processor, _rx) = processor(1);
        let order = Arc::new(Mutex::new(vec![]));

        for name in ["backtrace", "lookup", "scripts"] {
            let order = order.clone();
            let callbacks = Callbacks::on_response(move |r: crate::Result<i64>| match r {
                Err(Error::Detached(_)) => order.lock().unwrap().push(name),
                r => panic!("unexpected {:?}", r),
            });
            let _ = processor
                .send(name, |seq| Ok(seq.to_string()), callbacks)
                .await
                .unwrap();
        }

        let status = processor.status().unwrap();
        assert_eq!(status.current_request, "backtrace");
        assert_eq!(status.enqueued, 2);

        processor.process_eos("end of stream");
        assert_eq!(*order.lock().unwrap(), vec!["backtrace", "lookup", "scripts"]);

        // Nothing is delivered twice
        assert!(!processor.process_response(1, 0));
    }

    #[tokio::test]
    async fn check_send_after_close_refused() {
        let (processor, mut rx) = processor(1);
        processor.process_eos("user request");

        let called = Arc::new(Mutex::new(false));
        let called_cb = called.clone();
        let result = processor
            .send(
                "version",
                |seq| Ok(seq.to_string()),
                Callbacks::on_response(move |_| *called_cb.lock().unwrap() = true),
            )
            .await;

        match result {
            Err(Error::ConnectionClosed) => {}
            r => panic!("unexpected {:?}", r),
        }
        assert!(!*called.lock().unwrap());

        drop(processor);
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn check_write_failure_rolls_back() {
        let (processor, rx) = processor(1);
        drop(rx);

        let result = processor
            .send(
                "suspend",
                |seq| Ok(seq.to_string()),
                Callbacks::on_response(|_| {}),
            )
            .await;
        assert!(result.is_err());
        assert!(!processor.is_pending(1));
        assert_eq!(processor.status(), None);
    }

    #[tokio::test]
    async fn check_done_called_after_panicking_callback() {
        let (processor, _rx) = processor(1);
        let fault = Arc::new(Mutex::new(None));
        let fault_cb = fault.clone();

        let callbacks = Callbacks::on_response(|_: crate::Result<i64>| panic!("broken handler"))
            .with_done(move |f| *fault_cb.lock().unwrap() = Some(f));
        let _ = processor
            .send("lookup", |seq| Ok(seq.to_string()), callbacks)
            .await
            .unwrap();

        assert!(processor.process_response(1, 0));
        let fault = fault.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(fault.message(), "broken handler");
    }

    #[tokio::test]
    async fn check_panicking_done_does_not_stop_drain() {
        let (processor, _rx) = processor(1);
        let delivered = Arc::new(Mutex::new(vec![]));

        let callbacks = Callbacks::on_response(|_: crate::Result<i64>| {})
            .with_done(|_| panic!("broken cleanup"));
        let _ = processor
            .send("backtrace", |seq| Ok(seq.to_string()), callbacks)
            .await
            .unwrap();

        let delivered_cb = delivered.clone();
        let callbacks = Callbacks::on_response(move |r: crate::Result<i64>| {
            if let Err(Error::Detached(_)) = r {
                delivered_cb.lock().unwrap().push("lookup");
            }
        });
        let _ = processor
            .send("lookup", |seq| Ok(seq.to_string()), callbacks)
            .await
            .unwrap();

        processor.process_eos("end of stream");
        assert_eq!(*delivered.lock().unwrap(), vec!["lookup"]);
        assert!(processor.is_closed());
    }

    #[tokio::test]
    async fn check_concurrent_sends_in_seq_order() {
        let (processor, rx) = processor(1);
        let processor = Arc::new(processor);

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let processor = processor.clone();
                tokio::spawn(async move {
                    let _ = processor
                        .send("evaluate", |seq| Ok(seq.to_string()), Callbacks::none())
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        drop(processor);

        let sent: Vec<u64> = rx.map(|s| s.parse::<u64>().unwrap()).collect().await;
        assert_eq!(sent, (1..=20).collect::<Vec<_>>());
    }
}

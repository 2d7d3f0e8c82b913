//! V8 connection
//!
//! Ties the command processor to the header framed message stream. Outgoing
//! commands get their sequence number and routing headers here, incoming messages
//! are parsed and responses routed to their callbacks. Events are handed back to
//! the session.

use std::sync::Arc;

use log::{debug, warn};

use chromedbg_core::callback::{completion, Callbacks, RelayOk};
use chromedbg_core::codec::Message;
use chromedbg_core::notifier::ShutdownNotifier;
use chromedbg_core::processor::{CommandProcessor, SequenceCounter, VmStatus};
use chromedbg_core::transport::MessageWriter;
use chromedbg_core::{Error, Result};

use crate::commands::{DebuggerCommand, Routing};
use crate::protocol::{CommandResponse, IncomingMessage, SuccessCommandResponse, V8Event};

/// Turn a failed response into `CommandFailed`
pub fn expect_success(result: Result<CommandResponse>) -> Result<SuccessCommandResponse> {
    match result? {
        CommandResponse::Success(response) => Ok(response),
        CommandResponse::Failure(failure) => Err(Error::CommandFailed {
            command: failure.command().unwrap_or("unknown").to_string(),
            message: failure.message().to_string(),
        }),
    }
}

pub struct V8Connection {
    processor: CommandProcessor<Message, CommandResponse>,
    routing: Routing,
    shutdown: Arc<ShutdownNotifier>,
}

impl V8Connection {
    pub fn new(
        writer: MessageWriter<Message>,
        routing: Routing,
        shutdown: Arc<ShutdownNotifier>,
    ) -> Self {
        V8Connection {
            processor: CommandProcessor::new(writer, SequenceCounter::new()),
            routing,
            shutdown,
        }
    }

    pub async fn send(
        &self,
        command: &DebuggerCommand,
        callbacks: Callbacks<CommandResponse>,
    ) -> Result<RelayOk> {
        let routing = &self.routing;
        self.processor
            .send(
                command.name(),
                |seq| command.to_message(seq, routing),
                callbacks,
            )
            .await
    }

    /// Send `command` and wait for it to succeed
    ///
    /// `map` runs on the reader task as soon as the response arrives.
    pub async fn call<T, F>(&self, command: &DebuggerCommand, map: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(SuccessCommandResponse) -> Result<T> + Send + 'static,
    {
        let (callbacks, done) = completion(move |result| expect_success(result).and_then(map));
        self.send(command, callbacks).await?;
        done.await
    }

    /// Route one incoming message, events are returned to the caller
    ///
    /// Messages that fail to parse are logged and dropped.
    pub fn handle_message(&self, message: &Message) -> Option<V8Event> {
        match IncomingMessage::parse_str(message.content()) {
            Ok(IncomingMessage::Response(response)) => {
                let seq = response.request_seq();
                self.processor.process_response(seq, response);
                None
            }
            Ok(IncomingMessage::Event(event)) => Some(event),
            Err(e) => {
                warn!("Dropping unparseable message: {}", e);
                debug!("Dropped message content: {}", message.content());
                None
            }
        }
    }

    pub fn process_eos(&self, reason: &str) {
        self.processor.process_eos(reason);
    }

    pub fn status(&self) -> Option<VmStatus> {
        self.processor.status()
    }

    pub fn is_pending(&self, seq: u64) -> bool {
        self.processor.is_pending(seq)
    }

    pub fn shutdown(&self) -> &Arc<ShutdownNotifier> {
        &self.shutdown
    }

    pub fn writer(&self) -> &MessageWriter<Message> {
        self.processor.writer()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::channel::mpsc;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};

    use chromedbg_core::codec::Message;
    use chromedbg_core::notifier::ShutdownNotifier;
    use chromedbg_core::transport::MessageWriter;
    use chromedbg_core::Error;

    use crate::commands::{DebuggerCommand, Routing};
    use crate::protocol::{V8Event, VersionBody};

    use super::V8Connection;

    fn connection() -> (Arc<V8Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded();
        let writer = MessageWriter::new(tx.sink_map_err(|_| Error::ConnectionClosed));
        let connection = V8Connection::new(writer, Routing::none(), Arc::new(ShutdownNotifier::new()));
        (Arc::new(connection), rx)
    }

    fn reply(value: Value) -> Message {
        Message::with_content(value.to_string())
    }

    #[tokio::test]
    async fn check_call_success() {
        let (connection, mut rx) = connection();

        let caller = connection.clone();
        let call = tokio::spawn(async move {
            caller
                .call(&DebuggerCommand::version(), |r| {
                    Ok(r.body_as::<VersionBody>()?.v8_version().to_string())
                })
                .await
        });

        let sent = rx.next().await.unwrap();
        let request: Value = serde_json::from_str(sent.content()).unwrap();
        assert_eq!(request["command"], json!("version"));
        let seq = request["seq"].as_u64().unwrap();
        assert!(connection.is_pending(seq));

        let event = connection.handle_message(&reply(json!({
            "seq": 100, "type": "response", "request_seq": seq, "command": "version",
            "success": true, "body": {"V8Version": "3.14"}
        })));
        assert!(event.is_none());
        assert!(!connection.is_pending(seq));
        assert_eq!(call.await.unwrap().unwrap(), "3.14");
    }

    #[tokio::test]
    async fn check_call_failure() {
        let (connection, mut rx) = connection();

        let caller = connection.clone();
        let call =
            tokio::spawn(async move { caller.call(&DebuggerCommand::suspend(), Ok).await });

        let sent = rx.next().await.unwrap();
        let request: Value = serde_json::from_str(sent.content()).unwrap();

        connection.handle_message(&reply(json!({
            "seq": 1, "type": "response", "request_seq": request["seq"], "command": "suspend",
            "success": false, "message": "nope"
        })));

        match call.await.unwrap() {
            Err(Error::CommandFailed { command, message }) => {
                assert_eq!(command, "suspend");
                assert_eq!(message, "nope");
            }
            r => panic!("unexpected {:?}", r.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn check_events_and_garbage() {
        let (connection, _rx) = connection();

        let event = connection.handle_message(&reply(json!({
            "seq": 4, "type": "event", "event": "scriptCollected", "body": {"script": {"id": 3}}
        })));
        match event {
            Some(V8Event::ScriptCollected(e)) => assert_eq!(e.script_id().unwrap(), 3),
            e => panic!("unexpected {:?}", e),
        }

        assert!(connection
            .handle_message(&Message::with_content("{not json".to_string()))
            .is_none());
        assert!(connection
            .handle_message(&reply(json!({"seq": 5, "type": "event"})))
            .is_none());
    }

    #[tokio::test]
    async fn check_pending_calls_detached_on_eos() {
        let (connection, mut rx) = connection();

        let caller = connection.clone();
        let call =
            tokio::spawn(async move { caller.call(&DebuggerCommand::version(), Ok).await });
        rx.next().await.unwrap();

        connection.process_eos("remote closed");
        match call.await.unwrap() {
            Err(Error::Detached(reason)) => assert_eq!(reason, "remote closed"),
            r => panic!("unexpected {:?}", r.map(|_| ())),
        }
    }
}

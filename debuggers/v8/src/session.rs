//! V8 debug session
//!
//! The API a front-end drives: evaluation, stepping, backtraces, scripts and
//! breakpoints on top of one V8 connection. Every operation is asynchronous. The
//! `*_blocking` variants are for callers on threads outside the runtime and wait for
//! at most the configured `SyncCallTimeout`.
//!
//! Events arrive on the connection's reader task. Suspending issues a fresh
//! `ContextToken`, operations that need the VM suspended are rejected with
//! `StaleContext` once it has resumed.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use chromedbg_core::callback::{blocking_completion, completion};
use chromedbg_core::codec::Message;
use chromedbg_core::config::Config;
use chromedbg_core::debugger::{
    ContextToken, ContextTracker, DebugEventListener, StepAction, SuspendContext, SuspendReason,
};
use chromedbg_core::notifier::{ShutdownCause, ShutdownNotifier};
use chromedbg_core::processor::VmStatus;
use chromedbg_core::script::{Script, ScriptManager};
use chromedbg_core::transport::{self, ConnectionLogger, Dispatcher, LoggingStream};
use chromedbg_core::{Error, Result};

use crate::breakpoint::{Breakpoint, BreakpointManager, BreakpointSpec};
use crate::commands::{DebuggerCommand, EvaluateArgs, Routing, ScriptsArgs};
use crate::connection::{expect_success, V8Connection};
use crate::handshake::{Handshaker, RemoteInfo};
use crate::loader::ValueLoader;
use crate::protocol::{
    BacktraceBody, BreakEvent, FrameVariable, ListBreakpointsBody, ScriptHandle, SetBreakpointBody,
    SuccessCommandResponse, V8Event, ValueHandle, VersionBody,
};
use crate::value::ValueMirror;

/// Where an expression is evaluated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvaluateTarget {
    Global,
    /// A frame of the suspended VM, by index from the top
    Frame { token: ContextToken, index: i64 },
}

/// A name and the handle of its value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub handle: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallFrame {
    pub index: i64,
    pub line: u64,
    pub column: u64,
    pub function_name: Option<String>,
    pub script_id: Option<String>,
    pub script_name: Option<String>,
    pub source_line: Option<String>,
    pub receiver: Option<i64>,
    pub arguments: Vec<Variable>,
    pub locals: Vec<Variable>,
}

#[derive(Debug, Default)]
struct SessionState {
    tracker: ContextTracker,
    suspended: Option<SuspendContext>,
}

struct SessionInner {
    connection: V8Connection,
    config: Config,
    runtime: Handle,
    remote: Option<RemoteInfo>,
    state: Mutex<SessionState>,
    scripts: ScriptManager,
    loader: ValueLoader,
    breakpoints: BreakpointManager,
    listener: Arc<dyn DebugEventListener>,
}

fn to_u64(n: i64) -> u64 {
    n.max(0) as u64
}

fn variables(list: &[FrameVariable]) -> Result<Vec<Variable>> {
    let mut variables = Vec::with_capacity(list.len());
    for variable in list {
        variables.push(Variable {
            name: variable.name().unwrap_or_default().to_string(),
            handle: variable.value()?.handle(),
        });
    }
    Ok(variables)
}

fn script_from_handle(handle: &ScriptHandle) -> Script {
    let mut script = Script::new(&handle.id().to_string(), handle.name())
        .with_offsets(to_u64(handle.line_offset()), to_u64(handle.column_offset()));
    script.line_count = handle.line_count().map(to_u64);
    if let Ok(Some(source)) = handle.source() {
        script = script.with_source(Some(source.to_string()));
    }
    script
}

impl SessionInner {
    fn handle_message(&self, message: &Message) {
        let event = match self.connection.handle_message(message) {
            Some(event) => event,
            None => return,
        };

        match event {
            V8Event::Break(event) => self.on_break(&event),
            V8Event::AfterCompile(event) => match event.script() {
                Ok(handle) => {
                    let script = script_from_handle(&handle);
                    debug!("Script compiled: {}", script.display_name());
                    if self.scripts.add(script.clone()) {
                        self.listener.script_loaded(&script);
                    }
                }
                Err(e) => warn!("Ignoring malformed afterCompile event: {}", e),
            },
            V8Event::ScriptCollected(event) => match event.script_id() {
                Ok(id) => {
                    let id = id.to_string();
                    if self.scripts.mark_collected(&id) {
                        self.listener.script_collected(&id);
                    }
                }
                Err(e) => warn!("Ignoring malformed scriptCollected event: {}", e),
            },
            V8Event::Other(event) => debug!("Ignoring {} event", event.event()),
        }
    }

    fn on_break(&self, event: &BreakEvent) {
        let body = match event.body() {
            Ok(body) => body,
            Err(e) => {
                warn!("Ignoring malformed break event: {}", e);
                return;
            }
        };

        let reason = if event.is_exception() {
            let description = match body.exception() {
                Some(exception) => match self.loader.add_handle(&exception) {
                    Ok(mirror) => mirror.display_string(),
                    Err(_) => exception.text().unwrap_or("exception").to_string(),
                },
                None => "exception".to_string(),
            };
            SuspendReason::Exception {
                description,
                uncaught: body.uncaught(),
            }
        } else {
            SuspendReason::Breakpoint(body.breakpoints().iter().map(i64::to_string).collect())
        };

        let script = body.script();

        let context = {
            let mut state = self.state.lock();
            let context = SuspendContext {
                token: state.tracker.suspend(),
                reason,
                script_id: script.as_ref().map(|s| s.id().to_string()),
                script_name: script.as_ref().and_then(|s| s.name()).map(String::from),
                line: to_u64(body.source_line()),
                column: to_u64(body.source_column()),
                source_line: body.source_line_text().map(String::from),
            };
            state.suspended = Some(context.clone());
            context
        };

        info!(
            "VM suspended at {}:{}",
            context.script_name.as_deref().unwrap_or("<unknown>"),
            context.line
        );
        self.listener.suspended(&context);
    }

    /// Handles are only valid for one suspension, mirrors go with them
    fn on_resumed(&self) {
        {
            let mut state = self.state.lock();
            state.tracker.resume();
            state.suspended = None;
        }
        self.loader.clear_caches();
        self.listener.resumed();
    }

    fn on_shutdown(&self, cause: &ShutdownCause) {
        self.connection.process_eos(&cause.to_string());
        {
            let mut state = self.state.lock();
            state.tracker.resume();
            state.suspended = None;
        }
        self.loader.clear_caches();
        self.listener.disconnected();
    }

    fn check_token(&self, token: ContextToken) -> Result<()> {
        if self.state.lock().tracker.is_valid(token) {
            Ok(())
        } else {
            Err(Error::StaleContext)
        }
    }

    fn evaluate_args(&self, expression: &str, target: EvaluateTarget) -> Result<EvaluateArgs> {
        let args =
            EvaluateArgs::new(expression).max_string_length(self.config.max_string_length());
        match target {
            EvaluateTarget::Global => Ok(args.global()),
            EvaluateTarget::Frame { token, index } => {
                self.check_token(token)?;
                Ok(args.in_frame(index))
            }
        }
    }

    fn evaluate_result(&self, response: &SuccessCommandResponse) -> Result<ValueMirror> {
        self.loader.add_refs(response);
        let handle = response.body_as::<ValueHandle>()?;
        self.loader.add_handle(&handle)
    }
}

pub struct DebugSession {
    inner: Arc<SessionInner>,
    dispatcher: Dispatcher,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl DebugSession {
    /// Connect to a V8 debugger agent listening on `addr`
    pub async fn attach(
        addr: &str,
        handshaker: Handshaker,
        config: Config,
        listener: Arc<dyn DebugEventListener>,
        logger: Option<Arc<dyn ConnectionLogger>>,
    ) -> Result<DebugSession> {
        let stream = transport::open(addr, config.connect_timeout()).await?;
        DebugSession::attach_stream(
            LoggingStream::new(stream, logger),
            handshaker,
            Routing::none(),
            config,
            listener,
        )
        .await
    }

    /// Start a session over an already open stream
    pub async fn attach_stream<S>(
        stream: S,
        handshaker: Handshaker,
        routing: Routing,
        config: Config,
        listener: Arc<dyn DebugEventListener>,
    ) -> Result<DebugSession>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let channel = handshaker.perform(stream, config.handshake_timeout()).await?;
        let shutdown = Arc::new(ShutdownNotifier::new());

        let inner = Arc::new(SessionInner {
            connection: V8Connection::new(channel.writer, routing, shutdown.clone()),
            loader: ValueLoader::new(config.max_string_length()),
            config,
            runtime: Handle::current(),
            remote: channel.remote,
            state: Mutex::new(SessionState::default()),
            scripts: ScriptManager::new(),
            breakpoints: BreakpointManager::new(),
            listener,
        });

        let weak: Weak<SessionInner> = Arc::downgrade(&inner);
        shutdown.add_listener(move |cause| {
            if let Some(inner) = weak.upgrade() {
                inner.on_shutdown(cause);
            }
        })?;

        let weak = Arc::downgrade(&inner);
        let (reader, dispatcher) =
            transport::spawn_reader(channel.frames, shutdown, move |message: Message| {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.handle_message(&message);
                        ControlFlow::Continue(())
                    }
                    None => ControlFlow::Break(ShutdownCause::UserRequest),
                }
            });

        info!("Debug session attached");

        Ok(DebugSession {
            inner,
            dispatcher,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn remote_info(&self) -> Option<&RemoteInfo> {
        self.inner.remote.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        !self.inner.connection.shutdown().is_signalled()
    }

    pub fn status(&self) -> Option<VmStatus> {
        self.inner.connection.status()
    }

    /// Where the VM is suspended, if it is
    pub fn suspend_context(&self) -> Option<SuspendContext> {
        self.inner.state.lock().suspended.clone()
    }

    /// Run `work` on the reader task, in order with incoming messages
    pub fn run_in_dispatch<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher.run_in_dispatch(work)
    }

    /// Send `command` from a thread outside the runtime and wait for its response
    pub fn call_blocking(&self, command: DebuggerCommand) -> Result<SuccessCommandResponse> {
        let (callbacks, done) = blocking_completion(expect_success);

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            if let Err(e) = inner.connection.send(&command, callbacks).await {
                warn!("Failed to send {}: {}", command.name(), e);
            }
        });

        done.wait(self.inner.config.sync_call_timeout())
    }

    pub async fn version(&self) -> Result<String> {
        self.inner
            .connection
            .call(&DebuggerCommand::version(), |response| {
                Ok(response.body_as::<VersionBody>()?.v8_version().to_string())
            })
            .await
    }

    pub async fn evaluate(&self, expression: &str, target: EvaluateTarget) -> Result<ValueMirror> {
        self.evaluate_with_context(expression, target, &[]).await
    }

    /// Evaluate with extra names bound to handles in scope
    pub async fn evaluate_with_context(
        &self,
        expression: &str,
        target: EvaluateTarget,
        context: &[Variable],
    ) -> Result<ValueMirror> {
        let args = context
            .iter()
            .fold(self.inner.evaluate_args(expression, target)?, |args, v| {
                args.with_context(&v.name, v.handle)
            });
        let command = DebuggerCommand::evaluate(&args)?;
        let response = self.inner.connection.call(&command, Ok).await?;
        self.inner.evaluate_result(&response)
    }

    pub fn evaluate_blocking(&self, expression: &str, target: EvaluateTarget) -> Result<ValueMirror> {
        let args = self.inner.evaluate_args(expression, target)?;
        let response = self.call_blocking(DebuggerCommand::evaluate(&args)?)?;
        self.inner.evaluate_result(&response)
    }

    /// Ask the VM to stop as soon as possible, a break event follows
    pub async fn suspend(&self) -> Result<()> {
        self.inner
            .connection
            .call(&DebuggerCommand::suspend(), |_| Ok(()))
            .await
    }

    /// Resume or step the suspended VM
    ///
    /// The session moves to running once the VM has accepted the command.
    pub async fn step(&self, token: ContextToken, action: StepAction) -> Result<()> {
        self.inner.check_token(token)?;

        let weak = Arc::downgrade(&self.inner);
        let (callbacks, done) = completion(move |result| {
            expect_success(result)?;
            if let Some(inner) = weak.upgrade() {
                inner.on_resumed();
            }
            Ok(())
        });

        let command = DebuggerCommand::continue_(action, 1)?;
        self.inner.connection.send(&command, callbacks).await?;
        done.await
    }

    pub async fn resume(&self, token: ContextToken) -> Result<()> {
        self.step(token, StepAction::Continue).await
    }

    pub async fn backtrace(&self, token: ContextToken) -> Result<Vec<CallFrame>> {
        self.inner.check_token(token)?;

        let command = DebuggerCommand::backtrace(0, self.inner.config.backtrace_frames(), true)?;
        let response = self.inner.connection.call(&command, Ok).await?;
        self.inner.loader.add_refs(&response);

        let refs: HashMap<i64, ValueHandle> = response
            .refs()?
            .into_iter()
            .map(|r| (r.handle(), r))
            .collect();

        let body = response.body_as::<BacktraceBody>()?;
        let mut frames = vec![];

        for frame in body.frames()? {
            let func = frame.func().and_then(|f| refs.get(&f.handle()));
            let script = frame.script().and_then(|s| refs.get(&s.handle()));

            frames.push(CallFrame {
                index: frame.index(),
                line: to_u64(frame.line()),
                column: to_u64(frame.column()),
                function_name: func.and_then(|f| f.function_name()).map(String::from),
                script_id: script.and_then(|s| s.id()).map(|id| id.to_string()),
                script_name: script.and_then(|s| s.name()).map(String::from),
                source_line: frame.source_line_text().map(String::from),
                receiver: frame.receiver().map(|r| r.handle()),
                arguments: variables(&frame.arguments()?)?,
                locals: variables(&frame.locals()?)?,
            });
        }

        Ok(frames)
    }

    pub async fn resolve(&self, handle: i64) -> Result<ValueMirror> {
        self.inner.loader.resolve(&self.inner.connection, handle).await
    }

    pub async fn properties(&self, mirror: &ValueMirror) -> Result<Vec<(String, ValueMirror)>> {
        self.inner.loader.properties(&self.inner.connection, mirror).await
    }

    pub async fn reload_heavy_value(&self, mirror: &ValueMirror) -> Result<bool> {
        self.inner
            .loader
            .reload_heavy_value(&self.inner.connection, mirror)
            .await
    }

    /// Load every user script the VM knows about
    pub async fn scripts(&self) -> Result<Vec<Script>> {
        let command = DebuggerCommand::scripts(&ScriptsArgs::all())?;
        let response = self.inner.connection.call(&command, Ok).await?;

        let mut scripts = vec![];
        for handle in response.body_list::<ScriptHandle>()? {
            let script = script_from_handle(&handle);
            if self.inner.scripts.add(script.clone()) {
                self.inner.listener.script_loaded(&script);
            }
            scripts.push(script);
        }
        Ok(scripts)
    }

    pub fn known_scripts(&self) -> Vec<Script> {
        self.inner.scripts.all()
    }

    /// Source of a script, fetched once and cached
    pub async fn script_source(&self, id: &str) -> Result<Arc<String>> {
        if let Some(source) = self.inner.scripts.cached_source(id) {
            return Ok(source);
        }

        let numeric: i64 = id
            .parse()
            .map_err(|_| Error::InvalidState(format!("bad script id {:?}", id)))?;
        let command = DebuggerCommand::scripts(&ScriptsArgs::source_of(numeric))?;
        let response = self.inner.connection.call(&command, Ok).await?;

        let source = response
            .body_list::<ScriptHandle>()?
            .iter()
            .find(|s| s.id() == numeric)
            .and_then(|s| s.source().ok().flatten().map(String::from))
            .ok_or_else(|| Error::InvalidState(format!("VM returned no source for script {}", id)))?;

        if self.inner.scripts.find(id).is_none() {
            self.inner.scripts.add(Script::new(id, None));
        }
        self.inner.scripts.set_source(id, source.clone());
        Ok(Arc::new(source))
    }

    pub async fn set_breakpoint(&self, spec: BreakpointSpec) -> Result<Breakpoint> {
        let command = DebuggerCommand::set_breakpoint(&spec.set_args())?;
        let id = self
            .inner
            .connection
            .call(&command, |response| {
                Ok(response.body_as::<SetBreakpointBody>()?.breakpoint())
            })
            .await?;

        let breakpoint = Breakpoint::new(id, spec);
        self.inner.breakpoints.add(breakpoint.clone());
        Ok(breakpoint)
    }

    /// Stage local changes, they reach the VM on `flush_breakpoint`
    pub fn update_breakpoint<F>(&self, id: i64, edit: F) -> Result<Breakpoint>
    where
        F: FnOnce(&mut Breakpoint),
    {
        self.inner.breakpoints.update(id, edit)
    }

    /// Send staged changes, returns false if there were none
    pub async fn flush_breakpoint(&self, id: i64) -> Result<bool> {
        let breakpoint = self
            .inner
            .breakpoints
            .get(id)
            .ok_or_else(|| Error::InvalidState(format!("no breakpoint {}", id)))?;
        if !breakpoint.is_dirty() {
            return Ok(false);
        }

        let command = DebuggerCommand::change_breakpoint(&breakpoint.change_args())?;
        self.inner.connection.call(&command, |_| Ok(())).await?;
        self.inner.breakpoints.mark_flushed(&breakpoint);
        Ok(true)
    }

    pub async fn clear_breakpoint(&self, id: i64) -> Result<()> {
        let command = DebuggerCommand::clear_breakpoint(id)?;
        self.inner.connection.call(&command, |_| Ok(())).await?;
        self.inner.breakpoints.remove(id);
        Ok(())
    }

    /// Replace the local breakpoints with the VM's list
    pub async fn list_breakpoints(&self) -> Result<Vec<Breakpoint>> {
        let breakpoints = self
            .inner
            .connection
            .call(&DebuggerCommand::list_breakpoints(), |response| {
                let body = response.body_as::<ListBreakpointsBody>()?;
                Ok(body
                    .breakpoints()
                    .iter()
                    .filter_map(Breakpoint::from_info)
                    .collect::<Vec<_>>())
            })
            .await?;

        self.inner.breakpoints.replace_all(breakpoints.clone());
        Ok(breakpoints)
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.inner.breakpoints.all()
    }

    /// Close the connection, everything pending fails with `Detached`
    pub async fn detach(&self) -> Result<()> {
        self.inner
            .connection
            .shutdown()
            .signal(ShutdownCause::UserRequest);

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }

        self.inner.connection.writer().close().await
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.inner
            .connection
            .shutdown()
            .signal(ShutdownCause::UserRequest);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::mpsc;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use chromedbg_core::callback::Callbacks;
    use chromedbg_core::codec::{Message, V8Codec};
    use chromedbg_core::config::Config;
    use chromedbg_core::debugger::{DebugEventListener, StepAction, SuspendContext, SuspendReason};
    use chromedbg_core::script::Script;
    use chromedbg_core::Error;

    use crate::breakpoint::BreakpointSpec;
    use crate::commands::{BreakpointTarget, DebuggerCommand, Routing};
    use crate::handshake::Handshaker;

    use super::{DebugSession, EvaluateTarget};

    struct FakeVm {
        frames: FramedRead<ReadHalf<DuplexStream>, V8Codec>,
        writer: FramedWrite<WriteHalf<DuplexStream>, V8Codec>,
    }

    impl FakeVm {
        async fn request(&mut self) -> Value {
            let message = self.frames.next().await.unwrap().unwrap();
            serde_json::from_str(message.content()).unwrap()
        }

        async fn send(&mut self, value: Value) {
            self.writer
                .send(Message::with_content(value.to_string()))
                .await
                .unwrap();
        }

        async fn respond(&mut self, request: &Value, body: Value) {
            self.send(json!({
                "seq": 0, "type": "response", "request_seq": request["seq"],
                "command": request["command"], "success": true, "running": false, "body": body
            }))
            .await;
        }

        async fn respond_with_refs(&mut self, request: &Value, body: Value, refs: Value) {
            self.send(json!({
                "seq": 0, "type": "response", "request_seq": request["seq"],
                "command": request["command"], "success": true, "running": false,
                "body": body, "refs": refs
            }))
            .await;
        }
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Suspended(SuspendContext),
        Resumed,
        Disconnected,
        ScriptLoaded(String),
        ScriptCollected(String),
    }

    struct ChannelListener {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl DebugEventListener for ChannelListener {
        fn suspended(&self, context: &SuspendContext) {
            let _ = self.tx.send(Event::Suspended(context.clone()));
        }

        fn resumed(&self) {
            let _ = self.tx.send(Event::Resumed);
        }

        fn disconnected(&self) {
            let _ = self.tx.send(Event::Disconnected);
        }

        fn script_loaded(&self, script: &Script) {
            let _ = self.tx.send(Event::ScriptLoaded(script.display_name()));
        }

        fn script_collected(&self, script_id: &str) {
            let _ = self.tx.send(Event::ScriptCollected(script_id.to_string()));
        }
    }

    async fn session() -> (DebugSession, FakeVm, mpsc::UnboundedReceiver<Event>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();

        let session = DebugSession::attach_stream(
            client,
            Handshaker::None,
            Routing::none(),
            Config::new(),
            Arc::new(ChannelListener { tx }),
        )
        .await
        .unwrap();

        let (rd, wr) = tokio::io::split(server);
        let vm = FakeVm {
            frames: FramedRead::new(rd, V8Codec::new()),
            writer: FramedWrite::new(wr, V8Codec::new()),
        };

        (session, vm, rx)
    }

    fn break_event(line: u64) -> Value {
        json!({
            "seq": 50, "type": "event", "event": "break",
            "body": {"invocationText": "f()", "sourceLine": line, "sourceColumn": 2,
                     "sourceLineText": "  x = 1;", "script": {"id": 30, "name": "app.js"},
                     "breakpoints": [1]}
        })
    }

    #[tokio::test]
    async fn check_evaluate_round_trip() {
        let (session, mut vm, _events) = session().await;

        let (result, _) = tokio::join!(session.evaluate("1+1", EvaluateTarget::Global), async {
            let request = vm.request().await;
            assert_eq!(request["command"], json!("evaluate"));
            assert_eq!(request["arguments"]["expression"], json!("1+1"));
            assert_eq!(request["arguments"]["global"], json!(true));
            vm.respond(&request, json!({"handle": 5, "type": "number", "value": 2, "text": "2"}))
                .await;
        });

        let mirror = result.unwrap();
        assert_eq!(mirror.value(), Some(&json!(2)));
        assert!(session.status().is_none());
    }

    #[tokio::test]
    async fn check_pending_requests_detached_in_order() {
        let (session, mut vm, mut events) = session().await;

        let order = Arc::new(parking_lot::Mutex::new(vec![]));
        for expression in ["a", "b"] {
            let order = order.clone();
            let command =
                DebuggerCommand::evaluate(&crate::commands::EvaluateArgs::new(expression))
                    .unwrap();
            session
                .inner
                .connection
                .send(
                    &command,
                    Callbacks::on_response(move |result| {
                        if let Err(Error::Detached(_)) = result {
                            order.lock().push(expression);
                        }
                    }),
                )
                .await
                .unwrap();
        }

        vm.request().await;
        vm.request().await;
        drop(vm);

        assert_eq!(events.recv().await, Some(Event::Disconnected));
        assert_eq!(*order.lock(), vec!["a", "b"]);
        assert!(!session.is_attached());

        match session.version().await {
            Err(Error::ConnectionClosed) => {}
            r => panic!("unexpected {:?}", r),
        }
        assert!(session.run_in_dispatch(|| {}).is_err());
    }

    #[tokio::test]
    async fn check_suspend_backtrace_and_step() {
        let (session, mut vm, mut events) = session().await;

        vm.send(break_event(11)).await;
        let context = match events.recv().await {
            Some(Event::Suspended(context)) => context,
            e => panic!("unexpected {:?}", e),
        };
        assert_eq!(context.line, 11);
        assert_eq!(context.script_name.as_deref(), Some("app.js"));
        assert_eq!(context.reason, SuspendReason::Breakpoint(vec!["1".to_string()]));
        assert_eq!(session.suspend_context(), Some(context.clone()));

        let (frames, _) = tokio::join!(session.backtrace(context.token), async {
            let request = vm.request().await;
            assert_eq!(request["command"], json!("backtrace"));
            assert_eq!(request["arguments"]["toFrame"], json!(100));
            vm.respond_with_refs(
                &request,
                json!({"fromFrame": 0, "toFrame": 1, "totalFrames": 1, "frames": [{
                    "index": 0, "line": 11, "column": 2, "receiver": {"ref": 1},
                    "func": {"ref": 2}, "script": {"ref": 3}, "sourceLineText": "  x = 1;",
                    "arguments": [{"name": "a", "value": {"ref": 4}}],
                    "locals": [{"name": "x", "value": {"ref": 5}}]
                }]}),
                json!([
                    {"handle": 2, "type": "function", "className": "Function", "name": "f"},
                    {"handle": 3, "type": "script", "name": "app.js", "id": 30}
                ]),
            )
            .await;
        });

        let frames = frames.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function_name.as_deref(), Some("f"));
        assert_eq!(frames[0].script_id.as_deref(), Some("30"));
        assert_eq!(frames[0].locals[0].name, "x");
        assert_eq!(frames[0].locals[0].handle, 5);
        assert_eq!(frames[0].arguments[0].handle, 4);

        let (stepped, _) = tokio::join!(session.step(context.token, StepAction::Over), async {
            let request = vm.request().await;
            assert_eq!(request["arguments"]["stepaction"], json!("next"));
            vm.respond(&request, Value::Null).await;
        });
        stepped.unwrap();
        assert_eq!(events.recv().await, Some(Event::Resumed));
        assert!(session.suspend_context().is_none());

        match session.step(context.token, StepAction::In).await {
            Err(Error::StaleContext) => {}
            r => panic!("unexpected {:?}", r),
        }
        match session
            .evaluate("x", EvaluateTarget::Frame { token: context.token, index: 0 })
            .await
        {
            Err(Error::StaleContext) => {}
            r => panic!("unexpected {:?}", r.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn check_exception_event() {
        let (_session, mut vm, mut events) = session().await;

        vm.send(json!({
            "seq": 9, "type": "event", "event": "exception",
            "body": {"uncaught": true, "sourceLine": 3, "sourceColumn": 0,
                     "exception": {"handle": 12, "type": "error", "className": "Error", "text": "Error: boom"}}
        }))
        .await;

        match events.recv().await {
            Some(Event::Suspended(context)) => assert_eq!(
                context.reason,
                SuspendReason::Exception {
                    description: "Error: boom".to_string(),
                    uncaught: true
                }
            ),
            e => panic!("unexpected {:?}", e),
        }
    }

    #[tokio::test]
    async fn check_script_tracking() {
        let (session, mut vm, mut events) = session().await;

        vm.send(json!({
            "seq": 1, "type": "event", "event": "afterCompile",
            "body": {"script": {"id": 40, "name": "lib.js", "lineOffset": 0, "columnOffset": 0, "lineCount": 3}}
        }))
        .await;
        assert_eq!(events.recv().await, Some(Event::ScriptLoaded("lib.js".to_string())));

        vm.send(json!({
            "seq": 2, "type": "event", "event": "scriptCollected", "body": {"script": {"id": 40}}
        }))
        .await;
        assert_eq!(events.recv().await, Some(Event::ScriptCollected("40".to_string())));
        assert!(session.known_scripts()[0].collected);

        let (source, _) = tokio::join!(session.script_source("40"), async {
            let request = vm.request().await;
            assert_eq!(request["arguments"]["ids"], json!([40]));
            assert_eq!(request["arguments"]["includeSource"], json!(true));
            vm.respond(&request, json!([{"id": 40, "name": "lib.js", "source": "var a;"}]))
                .await;
        });
        assert_eq!(*source.unwrap(), "var a;");

        // Second fetch comes from the cache
        assert_eq!(*session.script_source("40").await.unwrap(), "var a;");

        let (scripts, _) = tokio::join!(session.scripts(), async {
            let request = vm.request().await;
            assert_eq!(request["command"], json!("scripts"));
            vm.respond(
                &request,
                json!([{"id": 40, "name": "lib.js"}, {"id": 41, "name": "main.js"}]),
            )
            .await;
        });
        assert_eq!(scripts.unwrap().len(), 2);
        assert_eq!(events.recv().await, Some(Event::ScriptLoaded("main.js".to_string())));
        assert_eq!(
            session.known_scripts()[0].source.as_deref().map(String::as_str),
            Some("var a;")
        );
    }

    #[tokio::test]
    async fn check_breakpoint_lifecycle() {
        let (session, mut vm, _events) = session().await;

        let spec = BreakpointSpec::new(BreakpointTarget::ScriptName("app.js".to_string()), 5);
        let (breakpoint, _) = tokio::join!(session.set_breakpoint(spec), async {
            let request = vm.request().await;
            assert_eq!(request["command"], json!("setbreakpoint"));
            assert_eq!(request["arguments"]["target"], json!("app.js"));
            vm.respond(&request, json!({"type": "scriptName", "breakpoint": 7, "line": 5}))
                .await;
        });
        assert_eq!(breakpoint.unwrap().id(), 7);

        // Staged edits don't go out until flushed
        session.update_breakpoint(7, |b| b.set_enabled(false)).unwrap();
        assert!(session.breakpoints()[0].is_dirty());

        let (flushed, _) = tokio::join!(session.flush_breakpoint(7), async {
            let request = vm.request().await;
            assert_eq!(request["command"], json!("changebreakpoint"));
            assert_eq!(request["arguments"]["enabled"], json!(false));
            vm.respond(&request, Value::Null).await;
        });
        assert!(flushed.unwrap());
        assert!(!session.breakpoints()[0].is_dirty());
        assert!(!session.flush_breakpoint(7).await.unwrap());

        let (cleared, _) = tokio::join!(session.clear_breakpoint(7), async {
            let request = vm.request().await;
            assert_eq!(request["arguments"]["breakpoint"], json!(7));
            vm.respond(&request, json!({"breakpoint": 7})).await;
        });
        cleared.unwrap();
        assert!(session.breakpoints().is_empty());
    }

    #[tokio::test]
    async fn check_command_failure_is_a_result() {
        let (session, mut vm, _events) = session().await;

        let (result, _) = tokio::join!(session.evaluate("nope", EvaluateTarget::Global), async {
            let request = vm.request().await;
            vm.send(json!({
                "seq": 3, "type": "response", "request_seq": request["seq"], "command": "evaluate",
                "success": false, "message": "ReferenceError: nope is not defined"
            }))
            .await;
        });

        match result {
            Err(Error::CommandFailed { message, .. }) => {
                assert_eq!(message, "ReferenceError: nope is not defined")
            }
            r => panic!("unexpected {:?}", r.map(|_| ())),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn check_blocking_evaluate() {
        let (session, mut vm, _events) = session().await;
        let session = Arc::new(session);

        let blocking = session.clone();
        let call = tokio::task::spawn_blocking(move || {
            blocking.evaluate_blocking("'a' + 'b'", EvaluateTarget::Global)
        });

        let request = vm.request().await;
        vm.respond(&request, json!({"handle": 8, "type": "string", "value": "ab", "length": 2}))
            .await;

        let mirror = call.await.unwrap().unwrap();
        assert_eq!(mirror.display_string(), "ab");
    }

    #[tokio::test]
    async fn check_detach() {
        let (session, mut vm, mut events) = session().await;

        session.detach().await.unwrap();
        assert_eq!(events.recv().await, Some(Event::Disconnected));
        assert!(!session.is_attached());

        // The VM sees the connection close
        let next = tokio::time::timeout(Duration::from_secs(5), vm.frames.next()).await;
        assert!(matches!(next, Ok(None)));
    }
}

//! WIP debug session
//!
//! Debugs one browser tab over its WebSocket. Commands carry an `id` the browser
//! echoes back in its response, events are dispatched on the reader task.
//!
//! Unlike V8, a `Debugger.paused` event already contains the whole call stack so
//! backtraces are answered from the last pause without a round trip.
//!
//! `evaluate_blocking` is for callers on threads outside the runtime and waits for at
//! most the configured `SyncCallTimeout`.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use chromedbg_core::callback::{blocking_completion, completion, Callbacks};
use chromedbg_core::config::Config;
use chromedbg_core::debugger::{
    ContextToken, ContextTracker, DebugEventListener, StepAction, SuspendContext, SuspendReason,
};
use chromedbg_core::notifier::{ShutdownCause, ShutdownNotifier};
use chromedbg_core::parser::ProtocolType;
use chromedbg_core::processor::{CommandProcessor, SequenceCounter, VmStatus};
use chromedbg_core::script::{Script, ScriptManager};
use chromedbg_core::transport::{ConnectionLogger, Dispatcher};
use chromedbg_core::websocket::{self, WsConnection, WsFrame, WsVersion};
use chromedbg_core::{Error, Result};

use crate::breakpoint::{Breakpoint, BreakpointManager, BreakpointSpec};
use crate::protocol::{
    self, EvaluateResult, GetPropertiesResult, GetScriptSourceResult, Paused, RemoteObject,
    ScriptParsed, SetBreakpointByUrlResult, WipCommand, WipEvent, WipIncoming, WipResponse,
};
use crate::tabs::TabDescriptor;

/// Page global holding the values of `evaluate_with_context` calls in flight
const CONTEXT_HOLDER: &str = "globalThis.__chromedbg_context";

/// Where an expression is evaluated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvaluateTarget {
    Global,
    /// A frame of the paused tab, by index from the top
    Frame { token: ContextToken, index: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeRef {
    pub kind: String,
    pub object_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallFrame {
    pub call_frame_id: String,
    pub function_name: String,
    pub script_id: String,
    pub script_name: Option<String>,
    pub line: u64,
    pub column: u64,
    pub scopes: Vec<ScopeRef>,
}

#[derive(Debug, Default)]
struct WipState {
    tracker: ContextTracker,
    suspended: Option<SuspendContext>,
    frames: Vec<CallFrame>,
}

struct WipInner {
    processor: CommandProcessor<WsFrame, WipResponse>,
    shutdown: Arc<ShutdownNotifier>,
    config: Config,
    runtime: Handle,
    state: Mutex<WipState>,
    scripts: ScriptManager,
    breakpoints: BreakpointManager,
    context_ids: AtomicU64,
    listener: Arc<dyn DebugEventListener>,
}

fn to_u64(n: i64) -> u64 {
    n.max(0) as u64
}

fn expect_success(method: &str, result: Result<WipResponse>) -> Result<Value> {
    match result? {
        WipResponse::Success(value) => Ok(value),
        WipResponse::Failure(error) => Err(Error::CommandFailed {
            command: method.to_string(),
            message: error.message,
        }),
    }
}

/// Unwrap an evaluation result, a thrown exception becomes `CommandFailed`
fn evaluate_value(method: &str, value: Value) -> Result<RemoteObject> {
    let result = EvaluateResult::parse(value)?;
    if let Some(exception) = result.exception() {
        return Err(Error::CommandFailed {
            command: method.to_string(),
            message: exception,
        });
    }
    Ok(result.result()?)
}

/// Function storing `context` on the holder object under `key`
///
/// The first object in `context` is passed as `this`, everything else as arguments.
fn store_context_command(key: &str, context: &[(String, RemoteObject)]) -> Result<WipCommand> {
    let this_id = context
        .iter()
        .find_map(|(_, value)| value.object_id())
        .ok_or_else(|| {
            Error::InvalidState("evaluation context needs at least one object".to_string())
        })?;

    let mut parameters = vec![];
    let mut arguments = vec![];
    let mut assignments = vec![];
    let mut this_used = false;
    for (name, value) in context {
        let parameter = if !this_used && value.object_id() == Some(this_id) {
            this_used = true;
            "this".to_string()
        } else {
            let parameter = format!("p{}", arguments.len());
            parameters.push(parameter.clone());
            arguments.push(value.call_argument());
            parameter
        };
        assignments.push(format!("{}: {}", Value::String(name.clone()), parameter));
    }

    let declaration = format!(
        "function({}) {{ var h = {holder} || ({holder} = {{}}); h[{}] = {{ {} }}; }}",
        parameters.join(", "),
        Value::String(key.to_string()),
        assignments.join(", "),
        holder = CONTEXT_HOLDER
    );
    Ok(WipCommand::call_function_on(this_id, &declaration, arguments))
}

fn exception_description(paused: &Paused) -> String {
    paused
        .data()
        .and_then(|data| data.get("description").or_else(|| data.get("value")))
        .and_then(Value::as_str)
        .unwrap_or("exception")
        .to_string()
}

impl WipInner {
    async fn call(&self, command: &WipCommand) -> Result<Value> {
        let method = command.method();
        let (callbacks, done) = completion(move |result| expect_success(method, result));
        self.processor
            .send(method, |id| command.to_frame(id), callbacks)
            .await?;
        done.await
    }

    async fn call_as<T: ProtocolType>(&self, command: &WipCommand) -> Result<T> {
        Ok(T::parse(self.call(command).await?)?)
    }

    fn handle_text(self: &Arc<Self>, text: &str) -> ControlFlow<ShutdownCause> {
        let message = match WipIncoming::parse_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unparseable message: {}", e);
                return ControlFlow::Continue(());
            }
        };

        match message {
            WipIncoming::Response { id, response } => {
                self.processor.process_response(id, response);
            }
            WipIncoming::Event(WipEvent::Paused(paused)) => self.on_paused(&paused),
            WipIncoming::Event(WipEvent::Resumed) => self.on_resumed(None),
            WipIncoming::Event(WipEvent::ScriptParsed(parsed)) => self.on_script_parsed(&parsed),
            WipIncoming::Event(WipEvent::Detached(reason)) => {
                info!("Inspector detached: {}", reason.as_deref().unwrap_or("no reason"));
                return ControlFlow::Break(ShutdownCause::RemoteClose);
            }
            WipIncoming::Event(WipEvent::Other(method)) => debug!("Ignoring {} event", method),
        }

        ControlFlow::Continue(())
    }

    fn on_script_parsed(&self, parsed: &ScriptParsed) {
        let mut script = Script::new(parsed.script_id(), Some(parsed.url()))
            .with_offsets(to_u64(parsed.start_line()), to_u64(parsed.start_column()));
        script.line_count = parsed
            .end_line()
            .map(|end| to_u64(end - parsed.start_line() + 1));

        debug!("Script parsed: {}", script.display_name());
        if self.scripts.add(script.clone()) {
            self.listener.script_loaded(&script);
        }
    }

    fn call_frame(&self, frame: &protocol::CallFrame) -> Result<CallFrame> {
        let location = frame.location()?;
        let script_id = location.script_id().to_string();
        let script_name = self
            .scripts
            .find(&script_id)
            .and_then(|s| s.name)
            .or_else(|| frame.url().map(String::from));

        let mut scopes = vec![];
        for scope in frame.scope_chain()? {
            scopes.push(ScopeRef {
                kind: scope.scope_type().to_string(),
                object_id: scope.object()?.object_id().map(String::from),
            });
        }

        Ok(CallFrame {
            call_frame_id: frame.call_frame_id().to_string(),
            function_name: frame.function_name().to_string(),
            script_id,
            script_name,
            line: to_u64(location.line_number()),
            column: to_u64(location.column_number()),
            scopes,
        })
    }

    fn source_line(&self, script_id: &str, line: u64) -> Option<String> {
        let script = self.scripts.find(script_id)?;
        let source = script.source?;
        let index = line.checked_sub(script.line_offset)?;
        source.lines().nth(index as usize).map(String::from)
    }

    fn on_paused(self: &Arc<Self>, paused: &Paused) {
        if self.breakpoints.skip_hit(&paused.hit_breakpoints()) {
            debug!("Ignoring breakpoint hit, resuming");
            let inner = self.clone();
            self.runtime.spawn(async move {
                if let Err(e) = inner.call(&WipCommand::step(StepAction::Continue)).await {
                    warn!("Failed to resume past an ignored breakpoint: {}", e);
                }
            });
            return;
        }

        let frames = match paused.call_frames() {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Ignoring malformed pause event: {}", e);
                return;
            }
        };

        let mut call_frames = Vec::with_capacity(frames.len());
        for frame in &frames {
            match self.call_frame(frame) {
                Ok(frame) => call_frames.push(frame),
                Err(e) => warn!("Skipping malformed call frame: {}", e),
            }
        }

        let reason = match paused.reason() {
            "exception" | "promiseRejection" => SuspendReason::Exception {
                description: exception_description(paused),
                uncaught: paused
                    .data()
                    .and_then(|d| d.get("uncaught"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "other" | "debugCommand" | "breakpoint" | "step" => {
                SuspendReason::Breakpoint(paused.hit_breakpoints())
            }
            other => SuspendReason::Other(other.to_string()),
        };

        let top = call_frames.first().cloned();
        let source_line = top
            .as_ref()
            .and_then(|f| self.source_line(&f.script_id, f.line));

        let context = {
            let mut state = self.state.lock();
            let context = SuspendContext {
                token: state.tracker.suspend(),
                reason,
                script_id: top.as_ref().map(|f| f.script_id.clone()),
                script_name: top.as_ref().and_then(|f| f.script_name.clone()),
                line: top.as_ref().map_or(0, |f| f.line),
                column: top.as_ref().map_or(0, |f| f.column),
                source_line,
            };
            state.suspended = Some(context.clone());
            state.frames = call_frames;
            context
        };

        info!(
            "Tab paused at {}:{}",
            context.script_name.as_deref().unwrap_or("<unknown>"),
            context.line
        );
        self.listener.suspended(&context);
    }

    /// Leave the suspended state, if `token` is given only if it's still current
    fn on_resumed(&self, token: Option<ContextToken>) {
        {
            let mut state = self.state.lock();
            let current = match state.tracker.current() {
                Some(current) => current,
                None => return,
            };
            if token.map_or(false, |t| t != current) {
                return;
            }
            state.tracker.resume();
            state.suspended = None;
            state.frames.clear();
        }
        self.listener.resumed();
    }

    fn on_shutdown(&self, cause: &ShutdownCause) {
        self.processor.process_eos(&cause.to_string());
        {
            let mut state = self.state.lock();
            state.tracker.resume();
            state.suspended = None;
            state.frames.clear();
        }
        self.listener.disconnected();
    }

    fn check_token(&self, token: ContextToken) -> Result<()> {
        if self.state.lock().tracker.is_valid(token) {
            Ok(())
        } else {
            Err(Error::StaleContext)
        }
    }

    fn evaluate_command(&self, expression: &str, target: EvaluateTarget) -> Result<WipCommand> {
        match target {
            EvaluateTarget::Global => Ok(WipCommand::evaluate(expression)),
            EvaluateTarget::Frame { token, index } => {
                self.check_token(token)?;
                let state = self.state.lock();
                let frame = state.frames.get(index).ok_or_else(|| {
                    Error::InvalidState(format!("no frame {} in backtrace", index))
                })?;
                Ok(WipCommand::evaluate_on_call_frame(
                    &frame.call_frame_id,
                    expression,
                ))
            }
        }
    }
}

pub struct WipSession {
    inner: Arc<WipInner>,
    dispatcher: Dispatcher,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WipSession {
    /// Attach to a tab from the browser's tab list and enable its debugger
    pub async fn attach_tab(
        tab: &TabDescriptor,
        version: &WsVersion,
        config: Config,
        listener: Arc<dyn DebugEventListener>,
        logger: Option<Arc<dyn ConnectionLogger>>,
    ) -> Result<WipSession> {
        let url = tab.debugger_url()?;
        info!("Attaching to tab {:?} at {}", tab.title, url);
        WipSession::attach(url.as_str(), version, config, listener, logger).await
    }

    pub async fn attach(
        url: &str,
        version: &WsVersion,
        config: Config,
        listener: Arc<dyn DebugEventListener>,
        logger: Option<Arc<dyn ConnectionLogger>>,
    ) -> Result<WipSession> {
        let connection = websocket::connect(url, version, &config, logger).await?;
        let session = WipSession::connect_stream(connection, config, listener)?;
        session.enable().await?;
        Ok(session)
    }

    /// Start a session over an upgraded WebSocket
    pub fn connect_stream<S>(
        connection: WsConnection<S>,
        config: Config,
        listener: Arc<dyn DebugEventListener>,
    ) -> Result<WipSession>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let shutdown = Arc::new(ShutdownNotifier::new());

        let inner = Arc::new(WipInner {
            processor: CommandProcessor::new(connection.writer(), SequenceCounter::new()),
            shutdown: shutdown.clone(),
            config,
            runtime: Handle::current(),
            state: Mutex::new(WipState::default()),
            scripts: ScriptManager::new(),
            breakpoints: BreakpointManager::new(),
            context_ids: AtomicU64::new(0),
            listener,
        });

        let weak: Weak<WipInner> = Arc::downgrade(&inner);
        shutdown.add_listener(move |cause| {
            if let Some(inner) = weak.upgrade() {
                inner.on_shutdown(cause);
            }
        })?;

        let weak = Arc::downgrade(&inner);
        let (reader, dispatcher) = connection.spawn(shutdown, move |text| match weak.upgrade() {
            Some(inner) => inner.handle_text(&text),
            None => ControlFlow::Break(ShutdownCause::UserRequest),
        });

        Ok(WipSession {
            inner,
            dispatcher,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn is_attached(&self) -> bool {
        !self.inner.shutdown.is_signalled()
    }

    pub fn status(&self) -> Option<VmStatus> {
        self.inner.processor.status()
    }

    pub fn suspend_context(&self) -> Option<SuspendContext> {
        self.inner.state.lock().suspended.clone()
    }

    pub fn run_in_dispatch<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher.run_in_dispatch(work)
    }

    /// Send any command, returns its `result` object
    pub async fn call(&self, command: &WipCommand) -> Result<Value> {
        self.inner.call(command).await
    }

    /// Send `command` from a thread outside the runtime and wait for its `result`
    pub fn call_blocking(&self, command: WipCommand) -> Result<Value> {
        let method = command.method();
        let (callbacks, done) = blocking_completion(move |result| expect_success(method, result));

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            if let Err(e) = inner
                .processor
                .send(method, |id| command.to_frame(id), callbacks)
                .await
            {
                warn!("Failed to send {}: {}", method, e);
            }
        });

        done.wait(self.inner.config.sync_call_timeout())
    }

    /// Turn on the debugger domain, the tab reports its scripts in response
    pub async fn enable(&self) -> Result<()> {
        self.inner.call(&WipCommand::enable()).await.map(|_| ())
    }

    pub async fn evaluate(&self, expression: &str, target: EvaluateTarget) -> Result<RemoteObject> {
        let command = self.inner.evaluate_command(expression, target)?;
        let value = self.inner.call(&command).await?;
        evaluate_value(command.method(), value)
    }

    /// Evaluate with extra names bound to earlier results
    ///
    /// The values are parked on a page global for the duration of the call and the
    /// expression sees them through a `with` block. At least one must be an object.
    pub async fn evaluate_with_context(
        &self,
        expression: &str,
        target: EvaluateTarget,
        context: &[(String, RemoteObject)],
    ) -> Result<RemoteObject> {
        if context.is_empty() {
            return self.evaluate(expression, target).await;
        }

        let key = format!("d{}", self.inner.context_ids.fetch_add(1, Ordering::Relaxed));
        let holder = format!("{}[{}]", CONTEXT_HOLDER, Value::String(key.clone()));
        let wrapped = format!(
            "(function() {{ with ({}) {{ return ({}); }} }})()",
            holder, expression
        );
        let command = self.inner.evaluate_command(&wrapped, target)?;

        let store = store_context_command(&key, context)?;
        let stored = self.inner.call(&store).await?;
        evaluate_value(store.method(), stored)?;

        let result = self
            .inner
            .call(&command)
            .await
            .and_then(|value| evaluate_value(command.method(), value));

        let cleanup = WipCommand::evaluate(&format!("delete {}", holder));
        if let Err(e) = self
            .inner
            .processor
            .send(cleanup.method(), |id| cleanup.to_frame(id), Callbacks::none())
            .await
        {
            debug!("Leaving evaluation context {} behind: {}", key, e);
        }

        result
    }

    pub fn evaluate_blocking(&self, expression: &str, target: EvaluateTarget) -> Result<RemoteObject> {
        let command = self.inner.evaluate_command(expression, target)?;
        let method = command.method();
        let value = self.call_blocking(command)?;
        evaluate_value(method, value)
    }

    /// Own properties of an object with their values, accessors are left out
    pub async fn properties(&self, object: &RemoteObject) -> Result<Vec<(String, RemoteObject)>> {
        let object_id = match object.object_id() {
            Some(id) => id,
            None => return Ok(vec![]),
        };

        let result = self
            .inner
            .call_as::<GetPropertiesResult>(&WipCommand::get_properties(object_id, true))
            .await?;

        Ok(result
            .properties()?
            .iter()
            .filter_map(|p| p.value().map(|v| (p.name().to_string(), v)))
            .collect())
    }

    pub async fn suspend(&self) -> Result<()> {
        self.inner.call(&WipCommand::pause()).await.map(|_| ())
    }

    /// Resume or step the paused tab
    pub async fn step(&self, token: ContextToken, action: StepAction) -> Result<()> {
        self.inner.check_token(token)?;

        let command = WipCommand::step(action);
        let method = command.method();
        let weak = Arc::downgrade(&self.inner);
        let (callbacks, done) = completion(move |result| {
            expect_success(method, result)?;
            if let Some(inner) = weak.upgrade() {
                inner.on_resumed(Some(token));
            }
            Ok(())
        });

        self.inner
            .processor
            .send(method, |id| command.to_frame(id), callbacks)
            .await?;
        done.await
    }

    pub async fn resume(&self, token: ContextToken) -> Result<()> {
        self.step(token, StepAction::Continue).await
    }

    pub fn backtrace(&self, token: ContextToken) -> Result<Vec<CallFrame>> {
        self.inner.check_token(token)?;
        Ok(self.inner.state.lock().frames.clone())
    }

    /// Scripts reported by the tab so far
    pub fn scripts(&self) -> Vec<Script> {
        self.inner.scripts.all()
    }

    pub async fn script_source(&self, id: &str) -> Result<Arc<String>> {
        if let Some(source) = self.inner.scripts.cached_source(id) {
            return Ok(source);
        }

        let result = self
            .inner
            .call_as::<GetScriptSourceResult>(&WipCommand::get_script_source(id))
            .await?;
        let source = result.script_source().to_string();

        if self.inner.scripts.find(id).is_none() {
            self.inner.scripts.add(Script::new(id, None));
        }
        self.inner.scripts.set_source(id, source.clone());
        Ok(Arc::new(source))
    }

    /// Set a breakpoint by script URL, a disabled one is only recorded locally
    pub async fn set_breakpoint(&self, spec: BreakpointSpec) -> Result<Breakpoint> {
        let result = if spec.enabled {
            Some(
                self.inner
                    .call_as::<SetBreakpointByUrlResult>(&spec.set_command())
                    .await?,
            )
        } else {
            None
        };
        Ok(self.inner.breakpoints.add(spec, result.as_ref()))
    }

    /// Stage local changes, they reach the tab on `flush_breakpoint`
    pub fn update_breakpoint<F>(&self, id: u32, edit: F) -> Result<Breakpoint>
    where
        F: FnOnce(&mut Breakpoint),
    {
        self.inner.breakpoints.update(id, edit)
    }

    /// Send staged changes, returns false if there were none
    ///
    /// The breakpoint is removed from the tab and, unless disabled, set again.
    pub async fn flush_breakpoint(&self, id: u32) -> Result<bool> {
        let breakpoint = self
            .inner
            .breakpoints
            .get(id)
            .ok_or_else(|| Error::InvalidState(format!("no breakpoint {}", id)))?;
        if !breakpoint.is_dirty() {
            return Ok(false);
        }

        if let Some(remote_id) = breakpoint.remote_id() {
            self.inner
                .call(&WipCommand::remove_breakpoint(remote_id))
                .await?;
            self.inner.breakpoints.mark_removed(id);
        }

        let result = if breakpoint.is_enabled() {
            Some(
                self.inner
                    .call_as::<SetBreakpointByUrlResult>(&breakpoint.spec().set_command())
                    .await?,
            )
        } else {
            None
        };
        self.inner
            .breakpoints
            .mark_flushed(&breakpoint, result.as_ref());
        Ok(true)
    }

    pub async fn remove_breakpoint(&self, id: u32) -> Result<()> {
        let breakpoint = self
            .inner
            .breakpoints
            .get(id)
            .ok_or_else(|| Error::InvalidState(format!("no breakpoint {}", id)))?;
        if let Some(remote_id) = breakpoint.remote_id() {
            self.inner
                .call(&WipCommand::remove_breakpoint(remote_id))
                .await?;
        }
        self.inner.breakpoints.remove(id);
        Ok(())
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.inner.breakpoints.all()
    }

    /// Close the WebSocket, everything pending fails with `Detached`
    pub async fn detach(&self) -> Result<()> {
        self.inner.shutdown.signal(ShutdownCause::UserRequest);

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }

        let writer = self.inner.processor.writer();
        // Best effort, the tab may already be gone
        let _ = writer.send(WsFrame::Close(String::new())).await;
        writer.close().await
    }
}

impl Drop for WipSession {
    fn drop(&mut self) {
        self.inner.shutdown.signal(ShutdownCause::UserRequest);
    }
}

//! Outgoing V8 commands
//!
//! Each command is a `{"seq", "type": "request", "command", "arguments"}` JSON object.
//! The sequence number is only known once the command processor sends it, so commands
//! are built without one and rendered with `to_message`.

use serde::Serialize;
use serde_json::Value;

use chromedbg_core::codec::{Message, DESTINATION, TOOL};
use chromedbg_core::debugger::StepAction;
use chromedbg_core::Result;

/// V8 script type mask for user scripts
pub const SCRIPT_TYPE_NORMAL: i64 = 4;

/// DevTools routing headers added to every outgoing message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Routing {
    pub tool: Option<String>,
    pub destination: Option<String>,
}

impl Routing {
    pub fn none() -> Self {
        Routing::default()
    }

    pub fn new(tool: &str, destination: Option<&str>) -> Self {
        Routing {
            tool: Some(tool.to_string()),
            destination: destination.map(String::from),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    seq: u64,
    #[serde(rename = "type")]
    kind: &'static str,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DebuggerCommand {
    command: &'static str,
    arguments: Option<Value>,
}

impl DebuggerCommand {
    fn bare(command: &'static str) -> Self {
        DebuggerCommand {
            command,
            arguments: None,
        }
    }

    fn with_arguments<A: Serialize>(command: &'static str, arguments: &A) -> Result<Self> {
        Ok(DebuggerCommand {
            command,
            arguments: Some(serde_json::to_value(arguments)?),
        })
    }

    pub fn name(&self) -> &'static str {
        self.command
    }

    pub fn arguments(&self) -> Option<&Value> {
        self.arguments.as_ref()
    }

    pub fn to_json(&self, seq: u64) -> Result<String> {
        Ok(serde_json::to_string(&Envelope {
            seq,
            kind: "request",
            command: self.command,
            arguments: self.arguments.as_ref(),
        })?)
    }

    pub fn to_message(&self, seq: u64, routing: &Routing) -> Result<Message> {
        let mut message = Message::with_content(self.to_json(seq)?);
        if let Some(tool) = &routing.tool {
            message.set_header(TOOL, tool);
        }
        if let Some(destination) = &routing.destination {
            message.set_header(DESTINATION, destination);
        }
        Ok(message)
    }

    pub fn evaluate(args: &EvaluateArgs) -> Result<Self> {
        DebuggerCommand::with_arguments("evaluate", args)
    }

    /// `continue`, with a step action unless simply resuming
    pub fn continue_(action: StepAction, count: u32) -> Result<Self> {
        let step = match action {
            StepAction::Continue => return Ok(DebuggerCommand::bare("continue")),
            StepAction::In => "in",
            StepAction::Over => "next",
            StepAction::Out => "out",
        };

        #[derive(Serialize)]
        struct ContinueArgs {
            stepaction: &'static str,
            stepcount: u32,
        }

        DebuggerCommand::with_arguments(
            "continue",
            &ContinueArgs {
                stepaction: step,
                stepcount: count.max(1),
            },
        )
    }

    pub fn backtrace(from_frame: i64, to_frame: i64, inline_refs: bool) -> Result<Self> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct BacktraceArgs {
            from_frame: i64,
            to_frame: i64,
            inline_refs: bool,
        }

        DebuggerCommand::with_arguments(
            "backtrace",
            &BacktraceArgs {
                from_frame,
                to_frame,
                inline_refs,
            },
        )
    }

    pub fn set_breakpoint(args: &SetBreakpointArgs) -> Result<Self> {
        DebuggerCommand::with_arguments("setbreakpoint", args)
    }

    pub fn change_breakpoint(args: &ChangeBreakpointArgs) -> Result<Self> {
        DebuggerCommand::with_arguments("changebreakpoint", args)
    }

    pub fn clear_breakpoint(breakpoint: i64) -> Result<Self> {
        DebuggerCommand::with_arguments(
            "clearbreakpoint",
            &serde_json::json!({ "breakpoint": breakpoint }),
        )
    }

    pub fn list_breakpoints() -> Self {
        DebuggerCommand::bare("listbreakpoints")
    }

    pub fn scripts(args: &ScriptsArgs) -> Result<Self> {
        DebuggerCommand::with_arguments("scripts", args)
    }

    pub fn lookup(args: &LookupArgs) -> Result<Self> {
        DebuggerCommand::with_arguments("lookup", args)
    }

    pub fn suspend() -> Self {
        DebuggerCommand::bare("suspend")
    }

    pub fn version() -> Self {
        DebuggerCommand::bare("version")
    }
}

/// A name bound to a handle, added to the scope of an evaluation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContextEntry {
    pub name: String,
    pub handle: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvaluateArgs {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<bool>,
    pub disable_break: bool,
    #[serde(rename = "inlineRefs")]
    pub inline_refs: bool,
    #[serde(rename = "maxStringLength", skip_serializing_if = "Option::is_none")]
    pub max_string_length: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_context: Vec<ContextEntry>,
}

impl EvaluateArgs {
    pub fn new(expression: &str) -> Self {
        EvaluateArgs {
            expression: expression.to_string(),
            frame: None,
            global: None,
            disable_break: true,
            inline_refs: true,
            max_string_length: None,
            additional_context: vec![],
        }
    }

    pub fn in_frame(mut self, frame: i64) -> Self {
        self.frame = Some(frame);
        self.global = None;
        self
    }

    pub fn global(mut self) -> Self {
        self.global = Some(true);
        self.frame = None;
        self
    }

    pub fn with_context(mut self, name: &str, handle: i64) -> Self {
        self.additional_context.push(ContextEntry {
            name: name.to_string(),
            handle,
        });
        self
    }

    pub fn max_string_length(mut self, length: i64) -> Self {
        self.max_string_length = Some(length);
        self
    }
}

/// What a breakpoint is attached to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakpointTarget {
    ScriptName(String),
    ScriptId(i64),
    ScriptRegExp(String),
}

impl BreakpointTarget {
    pub fn wire_type(&self) -> &'static str {
        match self {
            BreakpointTarget::ScriptName(_) => "script",
            BreakpointTarget::ScriptId(_) => "scriptId",
            BreakpointTarget::ScriptRegExp(_) => "scriptRegExp",
        }
    }

    fn wire_target(&self) -> Value {
        match self {
            BreakpointTarget::ScriptName(name) => Value::from(name.as_str()),
            BreakpointTarget::ScriptId(id) => Value::from(*id),
            BreakpointTarget::ScriptRegExp(re) => Value::from(re.as_str()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SetBreakpointArgs {
    #[serde(rename = "type")]
    kind: &'static str,
    target: Value,
    pub line: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u64>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(rename = "ignoreCount", skip_serializing_if = "Option::is_none")]
    pub ignore_count: Option<u32>,
}

impl SetBreakpointArgs {
    pub fn new(target: &BreakpointTarget, line: u64) -> Self {
        SetBreakpointArgs {
            kind: target.wire_type(),
            target: target.wire_target(),
            line,
            column: None,
            enabled: true,
            condition: None,
            ignore_count: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChangeBreakpointArgs {
    pub breakpoint: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(rename = "ignoreCount", skip_serializing_if = "Option::is_none")]
    pub ignore_count: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptsArgs {
    pub types: i64,
    pub include_source: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<i64>>,
}

impl ScriptsArgs {
    /// Every user script, without sources
    pub fn all() -> Self {
        ScriptsArgs {
            types: SCRIPT_TYPE_NORMAL,
            include_source: false,
            ids: None,
        }
    }

    /// The source of a single script
    pub fn source_of(id: i64) -> Self {
        ScriptsArgs {
            types: SCRIPT_TYPE_NORMAL,
            include_source: true,
            ids: Some(vec![id]),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupArgs {
    pub handles: Vec<i64>,
    pub include_source: bool,
    pub max_string_length: i64,
    pub inline_refs: bool,
}

impl LookupArgs {
    pub fn new(handles: Vec<i64>, max_string_length: i64) -> Self {
        LookupArgs {
            handles,
            include_source: false,
            max_string_length,
            inline_refs: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use chromedbg_core::debugger::StepAction;

    use super::{
        BreakpointTarget, ChangeBreakpointArgs, DebuggerCommand, EvaluateArgs, LookupArgs,
        Routing, ScriptsArgs, SetBreakpointArgs,
    };

    fn rendered(command: &DebuggerCommand, seq: u64) -> Value {
        serde_json::from_str(&command.to_json(seq).unwrap()).unwrap()
    }

    #[test]
    fn check_evaluate_command() {
        let args = EvaluateArgs::new("a + b")
            .in_frame(2)
            .with_context("obj", 15)
            .max_string_length(100);
        let command = DebuggerCommand::evaluate(&args).unwrap();

        assert_eq!(
            rendered(&command, 7),
            json!({
                "seq": 7, "type": "request", "command": "evaluate",
                "arguments": {
                    "expression": "a + b", "frame": 2, "disable_break": true,
                    "inlineRefs": true, "maxStringLength": 100,
                    "additional_context": [{"name": "obj", "handle": 15}]
                }
            })
        );
    }

    #[test]
    fn check_global_evaluate_drops_frame() {
        let args = EvaluateArgs::new("1+1").in_frame(1).global();
        let command = DebuggerCommand::evaluate(&args).unwrap();
        let arguments = command.arguments().unwrap();
        assert_eq!(arguments["global"], json!(true));
        assert!(arguments.get("frame").is_none());
        assert!(arguments.get("additional_context").is_none());
    }

    #[test]
    fn check_continue_commands() {
        let resume = DebuggerCommand::continue_(StepAction::Continue, 1).unwrap();
        assert_eq!(
            rendered(&resume, 1),
            json!({"seq": 1, "type": "request", "command": "continue"})
        );

        let over = DebuggerCommand::continue_(StepAction::Over, 0).unwrap();
        assert_eq!(
            over.arguments(),
            Some(&json!({"stepaction": "next", "stepcount": 1}))
        );

        let out = DebuggerCommand::continue_(StepAction::Out, 3).unwrap();
        assert_eq!(out.arguments().unwrap()["stepaction"], json!("out"));
    }

    #[test]
    fn check_breakpoint_commands() {
        let mut args = SetBreakpointArgs::new(&BreakpointTarget::ScriptId(42), 10);
        args.condition = Some("x > 1".to_string());
        let set = DebuggerCommand::set_breakpoint(&args).unwrap();
        assert_eq!(
            set.arguments(),
            Some(&json!({"type": "scriptId", "target": 42, "line": 10, "enabled": true, "condition": "x > 1"}))
        );

        let change = DebuggerCommand::change_breakpoint(&ChangeBreakpointArgs {
            breakpoint: 3,
            enabled: Some(false),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            change.arguments(),
            Some(&json!({"breakpoint": 3, "enabled": false}))
        );

        let clear = DebuggerCommand::clear_breakpoint(3).unwrap();
        assert_eq!(clear.name(), "clearbreakpoint");
        assert!(DebuggerCommand::list_breakpoints().arguments().is_none());
    }

    #[test]
    fn check_scripts_and_lookup() {
        let all = DebuggerCommand::scripts(&ScriptsArgs::all()).unwrap();
        assert_eq!(
            all.arguments(),
            Some(&json!({"types": 4, "includeSource": false}))
        );

        let lookup = DebuggerCommand::lookup(&LookupArgs::new(vec![1, 2], 10000)).unwrap();
        assert_eq!(
            lookup.arguments(),
            Some(&json!({"handles": [1, 2], "includeSource": false, "maxStringLength": 10000, "inlineRefs": true}))
        );
    }

    #[test]
    fn check_routing_headers() {
        let message = DebuggerCommand::version()
            .to_message(4, &Routing::new("V8Debugger", Some("2")))
            .unwrap();
        assert_eq!(message.tool(), Some("V8Debugger"));
        assert_eq!(message.destination(), Some("2"));

        let plain = DebuggerCommand::suspend()
            .to_message(5, &Routing::none())
            .unwrap();
        assert!(plain.headers().is_empty());
        assert_eq!(
            plain.content(),
            r#"{"seq":5,"type":"request","command":"suspend"}"#
        );
    }
}

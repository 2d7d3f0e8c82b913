//! WebKit Inspector Protocol messages
//!
//! Every WebSocket text frame is one JSON object: a response carrying the `id` of
//! the command it answers and either a `result` or an `error`, or an event with a
//! `method` and `params`.

use serde_json::{json, Map, Value};

use chromedbg_core::debugger::StepAction;
use chromedbg_core::parser::{
    Condition, FieldDescriptor as Field, FieldShape as Shape, ParseError, ProtocolObject,
    ProtocolType, SubtypeDescriptor, TypeDescriptor, UnionDescriptor,
};
use chromedbg_core::protocol_type;
use chromedbg_core::websocket::WsFrame;
use chromedbg_core::Result;

pub const WIP_ERROR: TypeDescriptor = TypeDescriptor {
    name: "WipError",
    fields: &[
        Field::required("code", Shape::Integer),
        Field::required("message", Shape::String),
        Field::optional("data", Shape::Any),
    ],
};

pub const SUCCESS_RESPONSE: TypeDescriptor = TypeDescriptor {
    name: "WipSuccessResponse",
    fields: &[
        Field::required("id", Shape::Integer),
        Field::optional("result", Shape::Any).lazy(),
    ],
};

pub const ERROR_RESPONSE: TypeDescriptor = TypeDescriptor {
    name: "WipErrorResponse",
    fields: &[
        Field::required("id", Shape::Integer),
        Field::required("error", Shape::Object(&WIP_ERROR)),
    ],
};

pub const EVENT: TypeDescriptor = TypeDescriptor {
    name: "WipEvent",
    fields: &[
        Field::required("method", Shape::String),
        Field::optional("params", Shape::Any).lazy(),
    ],
};

pub const INCOMING: UnionDescriptor = UnionDescriptor {
    name: "WipIncoming",
    subtypes: &[
        SubtypeDescriptor {
            name: "WipSuccessResponse",
            conditions: &[Condition::Present("id"), Condition::Absent("error")],
            descriptor: &SUCCESS_RESPONSE,
        },
        SubtypeDescriptor {
            name: "WipErrorResponse",
            conditions: &[Condition::Present("id"), Condition::Present("error")],
            descriptor: &ERROR_RESPONSE,
        },
        SubtypeDescriptor {
            name: "WipEvent",
            conditions: &[Condition::Absent("id"), Condition::Present("method")],
            descriptor: &EVENT,
        },
    ],
};

pub const REMOTE_OBJECT: TypeDescriptor = TypeDescriptor {
    name: "RemoteObject",
    fields: &[
        Field::required("type", Shape::String),
        Field::optional("subtype", Shape::String),
        Field::optional("className", Shape::String),
        Field::optional("value", Shape::Any),
        Field::optional("unserializableValue", Shape::String),
        Field::optional("description", Shape::String),
        Field::optional("objectId", Shape::String),
    ],
};

pub const LOCATION: TypeDescriptor = TypeDescriptor {
    name: "Location",
    fields: &[
        Field::required("scriptId", Shape::String),
        Field::required("lineNumber", Shape::Integer),
        Field::optional("columnNumber", Shape::Integer),
    ],
};

pub const SCOPE: TypeDescriptor = TypeDescriptor {
    name: "Scope",
    fields: &[
        Field::required("type", Shape::String),
        Field::required("object", Shape::Object(&REMOTE_OBJECT)),
        Field::optional("name", Shape::String),
    ],
};

pub const CALL_FRAME: TypeDescriptor = TypeDescriptor {
    name: "CallFrame",
    fields: &[
        Field::required("callFrameId", Shape::String),
        Field::required("functionName", Shape::String),
        Field::required("location", Shape::Object(&LOCATION)),
        Field::optional("url", Shape::String),
        Field::optional("scopeChain", Shape::ArrayOf(&Shape::Object(&SCOPE))).lazy(),
        Field::optional("this", Shape::Object(&REMOTE_OBJECT)).lazy(),
    ],
};

pub const PAUSED: TypeDescriptor = TypeDescriptor {
    name: "Paused",
    fields: &[
        Field::required("callFrames", Shape::ArrayOf(&Shape::Object(&CALL_FRAME))).lazy(),
        Field::required("reason", Shape::String),
        Field::optional("data", Shape::Map),
        Field::optional("hitBreakpoints", Shape::ArrayOf(&Shape::String)),
    ],
};

pub const SCRIPT_PARSED: TypeDescriptor = TypeDescriptor {
    name: "ScriptParsed",
    fields: &[
        Field::required("scriptId", Shape::String),
        Field::required("url", Shape::String),
        Field::optional("startLine", Shape::Integer),
        Field::optional("startColumn", Shape::Integer),
        Field::optional("endLine", Shape::Integer),
        Field::optional("endColumn", Shape::Integer),
        Field::optional("sourceMapURL", Shape::String),
        Field::optional("hash", Shape::String),
    ],
};

pub const PROPERTY_DESCRIPTOR: TypeDescriptor = TypeDescriptor {
    name: "PropertyDescriptor",
    fields: &[
        Field::required("name", Shape::String),
        Field::optional("value", Shape::Object(&REMOTE_OBJECT)),
        Field::optional("writable", Shape::Boolean),
        Field::optional("get", Shape::Object(&REMOTE_OBJECT)).lazy(),
        Field::optional("set", Shape::Object(&REMOTE_OBJECT)).lazy(),
        Field::optional("configurable", Shape::Boolean),
        Field::optional("enumerable", Shape::Boolean),
        Field::optional("wasThrown", Shape::Boolean),
        Field::optional("isOwn", Shape::Boolean),
    ],
};

pub const EVALUATE_RESULT: TypeDescriptor = TypeDescriptor {
    name: "EvaluateResult",
    fields: &[
        Field::required("result", Shape::Object(&REMOTE_OBJECT)),
        Field::optional("wasThrown", Shape::Boolean),
        Field::optional("exceptionDetails", Shape::Map),
    ],
};

pub const GET_PROPERTIES_RESULT: TypeDescriptor = TypeDescriptor {
    name: "GetPropertiesResult",
    fields: &[Field::required(
        "result",
        Shape::ArrayOf(&Shape::Object(&PROPERTY_DESCRIPTOR)),
    )
    .lazy()],
};

pub const SET_BREAKPOINT_BY_URL_RESULT: TypeDescriptor = TypeDescriptor {
    name: "SetBreakpointByUrlResult",
    fields: &[
        Field::required("breakpointId", Shape::String),
        Field::optional("locations", Shape::ArrayOf(&Shape::Object(&LOCATION))),
    ],
};

pub const GET_SCRIPT_SOURCE_RESULT: TypeDescriptor = TypeDescriptor {
    name: "GetScriptSourceResult",
    fields: &[Field::required("scriptSource", Shape::String)],
};

protocol_type!(pub SuccessResponse => &SUCCESS_RESPONSE);
protocol_type!(pub ErrorResponse => &ERROR_RESPONSE);
protocol_type!(pub EventMessage => &EVENT);
protocol_type!(pub RemoteObject => &REMOTE_OBJECT);
protocol_type!(pub Location => &LOCATION);
protocol_type!(pub Scope => &SCOPE);
protocol_type!(pub CallFrame => &CALL_FRAME);
protocol_type!(pub Paused => &PAUSED);
protocol_type!(pub ScriptParsed => &SCRIPT_PARSED);
protocol_type!(pub PropertyDescriptor => &PROPERTY_DESCRIPTOR);
protocol_type!(pub EvaluateResult => &EVALUATE_RESULT);
protocol_type!(pub GetPropertiesResult => &GET_PROPERTIES_RESULT);
protocol_type!(pub SetBreakpointByUrlResult => &SET_BREAKPOINT_BY_URL_RESULT);
protocol_type!(pub GetScriptSourceResult => &GET_SCRIPT_SOURCE_RESULT);

impl RemoteObject {
    pub fn type_name(&self) -> &str {
        self.0.str_field("type").unwrap_or_default()
    }

    pub fn subtype(&self) -> Option<&str> {
        self.0.get_str("subtype").ok().flatten()
    }

    pub fn class_name(&self) -> Option<&str> {
        self.0.get_str("className").ok().flatten()
    }

    pub fn value(&self) -> Option<Value> {
        self.0.get_value("value").ok().flatten()
    }

    pub fn description(&self) -> Option<&str> {
        self.0.get_str("description").ok().flatten()
    }

    pub fn object_id(&self) -> Option<&str> {
        self.0.get_str("objectId").ok().flatten()
    }

    /// How `Runtime.callFunctionOn` is passed this value as an argument
    pub fn call_argument(&self) -> Value {
        if let Some(object_id) = self.object_id() {
            return json!({ "objectId": object_id });
        }
        if let Some(unserializable) = self.0.get_str("unserializableValue").ok().flatten() {
            return json!({ "unserializableValue": unserializable });
        }
        match self.value() {
            Some(value) => json!({ "value": value }),
            // An empty argument is `undefined`
            None => json!({}),
        }
    }

    /// What to show for the value
    pub fn display_string(&self) -> String {
        if let Some(unserializable) = self.0.get_str("unserializableValue").ok().flatten() {
            return unserializable.to_string();
        }
        match (self.value(), self.description()) {
            (Some(Value::String(s)), _) => s,
            (Some(v), _) => v.to_string(),
            (None, Some(description)) => description.to_string(),
            (None, None) => self.type_name().to_string(),
        }
    }
}

impl Location {
    pub fn script_id(&self) -> &str {
        self.0.str_field("scriptId").unwrap_or_default()
    }

    pub fn line_number(&self) -> i64 {
        self.0.i64_field("lineNumber").unwrap_or_default()
    }

    pub fn column_number(&self) -> i64 {
        self.0.get_i64("columnNumber").ok().flatten().unwrap_or(0)
    }
}

impl Scope {
    pub fn scope_type(&self) -> &str {
        self.0.str_field("type").unwrap_or_default()
    }

    pub fn object(&self) -> std::result::Result<RemoteObject, ParseError> {
        Ok(RemoteObject::wrap(self.0.object_field("object")?.clone()))
    }
}

impl CallFrame {
    pub fn call_frame_id(&self) -> &str {
        self.0.str_field("callFrameId").unwrap_or_default()
    }

    pub fn function_name(&self) -> &str {
        self.0.str_field("functionName").unwrap_or_default()
    }

    pub fn location(&self) -> std::result::Result<Location, ParseError> {
        Ok(Location::wrap(self.0.object_field("location")?.clone()))
    }

    pub fn url(&self) -> Option<&str> {
        self.0.get_str("url").ok().flatten()
    }

    pub fn scope_chain(&self) -> std::result::Result<Vec<Scope>, ParseError> {
        self.0.objects("scopeChain")
    }

    pub fn this(&self) -> std::result::Result<Option<RemoteObject>, ParseError> {
        Ok(self.0.get_object("this")?.cloned().map(RemoteObject::wrap))
    }
}

impl Paused {
    pub fn call_frames(&self) -> std::result::Result<Vec<CallFrame>, ParseError> {
        self.0.objects("callFrames")
    }

    pub fn reason(&self) -> &str {
        self.0.str_field("reason").unwrap_or_default()
    }

    pub fn data(&self) -> Option<&Map<String, Value>> {
        self.0.get_map("data").ok().flatten()
    }

    pub fn hit_breakpoints(&self) -> Vec<String> {
        self.0
            .get_array("hitBreakpoints")
            .ok()
            .flatten()
            .unwrap_or(&[])
            .iter()
            .filter_map(|b| b.as_str().map(String::from))
            .collect()
    }
}

impl ScriptParsed {
    pub fn script_id(&self) -> &str {
        self.0.str_field("scriptId").unwrap_or_default()
    }

    pub fn url(&self) -> &str {
        self.0.str_field("url").unwrap_or_default()
    }

    pub fn start_line(&self) -> i64 {
        self.0.get_i64("startLine").ok().flatten().unwrap_or(0)
    }

    pub fn start_column(&self) -> i64 {
        self.0.get_i64("startColumn").ok().flatten().unwrap_or(0)
    }

    pub fn end_line(&self) -> Option<i64> {
        self.0.get_i64("endLine").ok().flatten()
    }
}

impl PropertyDescriptor {
    pub fn name(&self) -> &str {
        self.0.str_field("name").unwrap_or_default()
    }

    pub fn value(&self) -> Option<RemoteObject> {
        self.0
            .get_object("value")
            .ok()
            .flatten()
            .cloned()
            .map(RemoteObject::wrap)
    }

    pub fn is_own(&self) -> bool {
        self.0.get_bool("isOwn").ok().flatten().unwrap_or(false)
    }

    pub fn getter(&self) -> std::result::Result<Option<RemoteObject>, ParseError> {
        Ok(self.0.get_object("get")?.cloned().map(RemoteObject::wrap))
    }
}

impl EvaluateResult {
    pub fn result(&self) -> std::result::Result<RemoteObject, ParseError> {
        Ok(RemoteObject::wrap(self.0.object_field("result")?.clone()))
    }

    /// Description of the exception the expression threw, if it did
    pub fn exception(&self) -> Option<String> {
        let thrown = self.0.get_bool("wasThrown").ok().flatten().unwrap_or(false);
        let details = self.0.get_map("exceptionDetails").ok().flatten();

        match details {
            Some(details) => Some(
                details
                    .get("exception")
                    .and_then(|e| e.get("description"))
                    .or_else(|| details.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or("exception")
                    .to_string(),
            ),
            None if thrown => Some(
                self.result()
                    .map(|r| r.display_string())
                    .unwrap_or_else(|_| "exception".to_string()),
            ),
            None => None,
        }
    }
}

impl GetPropertiesResult {
    pub fn properties(&self) -> std::result::Result<Vec<PropertyDescriptor>, ParseError> {
        self.0.objects("result")
    }
}

impl SetBreakpointByUrlResult {
    pub fn breakpoint_id(&self) -> &str {
        self.0.str_field("breakpointId").unwrap_or_default()
    }

    pub fn locations(&self) -> Vec<Location> {
        self.0.objects("locations").unwrap_or_default()
    }
}

impl GetScriptSourceResult {
    pub fn script_source(&self) -> &str {
        self.0.str_field("scriptSource").unwrap_or_default()
    }
}

/// An `error` object the browser answered a command with
#[derive(Clone, Debug, PartialEq)]
pub struct WipError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

/// Outcome of a command
#[derive(Clone, Debug)]
pub enum WipResponse {
    Success(Value),
    Failure(WipError),
}

#[derive(Clone, Debug)]
pub enum WipEvent {
    Paused(Paused),
    Resumed,
    ScriptParsed(ScriptParsed),
    Detached(Option<String>),
    Other(String),
}

#[derive(Clone, Debug)]
pub enum WipIncoming {
    Response { id: u64, response: WipResponse },
    Event(WipEvent),
}

fn parse_event(event: EventMessage) -> std::result::Result<WipEvent, ParseError> {
    let method = event.0.str_field("method")?.to_string();
    let params = event.0.get_value("params")?.unwrap_or(Value::Null);

    Ok(match &method[..] {
        "Debugger.paused" => WipEvent::Paused(Paused::parse(params)?),
        "Debugger.resumed" => WipEvent::Resumed,
        "Debugger.scriptParsed" => WipEvent::ScriptParsed(ScriptParsed::parse(params)?),
        "Inspector.detached" => WipEvent::Detached(
            params
                .get("reason")
                .and_then(Value::as_str)
                .map(String::from),
        ),
        _ => WipEvent::Other(method),
    })
}

impl WipIncoming {
    pub fn parse(value: Value) -> std::result::Result<WipIncoming, ParseError> {
        let (index, object) = INCOMING.parse(value)?;
        WipIncoming::route(index, object)
    }

    fn route(index: usize, object: ProtocolObject) -> std::result::Result<WipIncoming, ParseError> {
        match INCOMING.subtypes.get(index).map(|s| s.name) {
            Some("WipSuccessResponse") => {
                let response = SuccessResponse::wrap(object);
                Ok(WipIncoming::Response {
                    id: response.0.i64_field("id")? as u64,
                    response: WipResponse::Success(
                        response.0.get_value("result")?.unwrap_or(Value::Null),
                    ),
                })
            }
            Some("WipErrorResponse") => {
                let response = ErrorResponse::wrap(object);
                let error = response.0.object_field("error")?;
                Ok(WipIncoming::Response {
                    id: response.0.i64_field("id")? as u64,
                    response: WipResponse::Failure(WipError {
                        code: error.i64_field("code")?,
                        message: error.str_field("message")?.to_string(),
                        data: error.get_value("data")?,
                    }),
                })
            }
            Some("WipEvent") => parse_event(EventMessage::wrap(object)).map(WipIncoming::Event),
            Some(subtype) => Err(ParseError::UnroutedSubtype {
                type_name: INCOMING.name,
                subtype,
            }),
            None => Err(ParseError::NoSubtype {
                type_name: INCOMING.name,
            }),
        }
    }

    pub fn parse_str(text: &str) -> std::result::Result<WipIncoming, ParseError> {
        let value = serde_json::from_str(text).map_err(|e| ParseError::Syntax(e.to_string()))?;
        WipIncoming::parse(value)
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    params: &'a Value,
}

/// A command ready to be sent once it has an id
#[derive(Clone, Debug, PartialEq)]
pub struct WipCommand {
    method: &'static str,
    params: Value,
}

impl WipCommand {
    pub fn new(method: &'static str, params: Value) -> Self {
        WipCommand { method, params }
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn to_frame(&self, id: u64) -> Result<WsFrame> {
        let text = serde_json::to_string(&Envelope {
            id,
            method: self.method,
            params: &self.params,
        })?;
        Ok(WsFrame::Text(text))
    }

    pub fn enable() -> Self {
        WipCommand::new("Debugger.enable", Value::Null)
    }

    pub fn evaluate(expression: &str) -> Self {
        WipCommand::new(
            "Runtime.evaluate",
            json!({"expression": expression, "returnByValue": false}),
        )
    }

    pub fn evaluate_on_call_frame(call_frame_id: &str, expression: &str) -> Self {
        WipCommand::new(
            "Debugger.evaluateOnCallFrame",
            json!({"callFrameId": call_frame_id, "expression": expression, "returnByValue": false}),
        )
    }

    /// Call `declaration` with `object_id` as `this`
    pub fn call_function_on(object_id: &str, declaration: &str, arguments: Vec<Value>) -> Self {
        WipCommand::new(
            "Runtime.callFunctionOn",
            json!({
                "objectId": object_id,
                "functionDeclaration": declaration,
                "arguments": arguments,
                "returnByValue": true
            }),
        )
    }

    pub fn get_properties(object_id: &str, own_properties: bool) -> Self {
        WipCommand::new(
            "Runtime.getProperties",
            json!({"objectId": object_id, "ownProperties": own_properties}),
        )
    }

    pub fn set_breakpoint_by_url(
        url: &str,
        line: u64,
        column: Option<u64>,
        condition: Option<&str>,
    ) -> Self {
        let mut params = json!({"url": url, "lineNumber": line});
        if let Some(column) = column {
            params["columnNumber"] = json!(column);
        }
        if let Some(condition) = condition {
            params["condition"] = json!(condition);
        }
        WipCommand::new("Debugger.setBreakpointByUrl", params)
    }

    pub fn remove_breakpoint(breakpoint_id: &str) -> Self {
        WipCommand::new(
            "Debugger.removeBreakpoint",
            json!({ "breakpointId": breakpoint_id }),
        )
    }

    pub fn step(action: StepAction) -> Self {
        let method = match action {
            StepAction::In => "Debugger.stepInto",
            StepAction::Over => "Debugger.stepOver",
            StepAction::Out => "Debugger.stepOut",
            StepAction::Continue => "Debugger.resume",
        };
        WipCommand::new(method, Value::Null)
    }

    pub fn pause() -> Self {
        WipCommand::new("Debugger.pause", Value::Null)
    }

    pub fn get_script_source(script_id: &str) -> Self {
        WipCommand::new(
            "Debugger.getScriptSource",
            json!({ "scriptId": script_id }),
        )
    }
}

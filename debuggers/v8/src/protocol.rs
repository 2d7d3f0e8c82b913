//! V8 protocol messages
//!
//! Typed views of the JSON the V8 debugger agent sends. Required eager fields were
//! checked when the message was parsed, so their accessors return plain values.
//! Optional fields return `Option`. Lazy fields are decoded on first access and
//! return `Result`.

use serde_json::Value;

use chromedbg_core::parser::{
    Condition, FieldDescriptor as Field, FieldShape as Shape, FieldValue, ParseError,
    ProtocolObject, ProtocolType, SubtypeDescriptor, TypeDescriptor, UnionDescriptor,
};
use chromedbg_core::protocol_type;

pub const REF: TypeDescriptor = TypeDescriptor {
    name: "Ref",
    fields: &[
        Field::required("ref", Shape::Integer),
        Field::optional("type", Shape::String),
        Field::optional("className", Shape::String),
        Field::optional("value", Shape::Any),
    ],
};

pub const PROPERTY_OBJECT: TypeDescriptor = TypeDescriptor {
    name: "PropertyObject",
    fields: &[
        Field::required("name", Shape::Any),
        Field::required("ref", Shape::Integer),
        Field::optional("propertyType", Shape::Integer),
        Field::optional("attributes", Shape::Integer),
        Field::optional("type", Shape::String),
        Field::optional("className", Shape::String),
        Field::optional("value", Shape::Any),
    ],
};

pub const VALUE_HANDLE: TypeDescriptor = TypeDescriptor {
    name: "ValueHandle",
    fields: &[
        Field::required("handle", Shape::Integer),
        Field::required("type", Shape::String),
        Field::optional("className", Shape::String),
        Field::optional("value", Shape::Any),
        Field::optional("text", Shape::String),
        Field::optional("length", Shape::Integer),
        Field::optional("fromIndex", Shape::Integer),
        Field::optional("toIndex", Shape::Integer),
        Field::optional("properties", Shape::ArrayOf(&Shape::Object(&PROPERTY_OBJECT))).lazy(),
        Field::optional("constructorFunction", Shape::Object(&REF)).lazy(),
        Field::optional("protoObject", Shape::Object(&REF)).lazy(),
        Field::optional("prototypeObject", Shape::Object(&REF)).lazy(),
        Field::optional("name", Shape::String),
        Field::optional("inferredName", Shape::String),
        Field::optional("source", Shape::String).lazy(),
        Field::optional("scriptId", Shape::Integer),
        Field::optional("line", Shape::Integer),
        Field::optional("column", Shape::Integer),
        Field::optional("id", Shape::Integer),
    ],
};

pub const SCRIPT_HANDLE: TypeDescriptor = TypeDescriptor {
    name: "ScriptHandle",
    fields: &[
        Field::required("id", Shape::Integer),
        Field::optional("handle", Shape::Integer),
        Field::optional("name", Shape::String),
        Field::optional("lineOffset", Shape::Integer),
        Field::optional("columnOffset", Shape::Integer),
        Field::optional("lineCount", Shape::Integer),
        Field::optional("source", Shape::String).lazy(),
        Field::optional("sourceLength", Shape::Integer),
        Field::optional("scriptType", Shape::Integer),
        Field::optional("compilationType", Shape::Integer),
        Field::optional("text", Shape::String),
    ],
};

pub const FRAME_VARIABLE: TypeDescriptor = TypeDescriptor {
    name: "FrameVariable",
    fields: &[
        Field::optional("name", Shape::String),
        Field::required("value", Shape::Object(&REF)),
    ],
};

pub const FRAME: TypeDescriptor = TypeDescriptor {
    name: "Frame",
    fields: &[
        Field::required("index", Shape::Integer),
        Field::required("line", Shape::Integer),
        Field::required("column", Shape::Integer),
        Field::optional("receiver", Shape::Object(&REF)),
        Field::optional("func", Shape::Object(&REF)),
        Field::optional("script", Shape::Object(&REF)),
        Field::optional("constructCall", Shape::Boolean),
        Field::optional("debuggerFrame", Shape::Boolean),
        Field::optional("arguments", Shape::ArrayOf(&Shape::Object(&FRAME_VARIABLE))).lazy(),
        Field::optional("locals", Shape::ArrayOf(&Shape::Object(&FRAME_VARIABLE))).lazy(),
        Field::optional("position", Shape::Integer),
        Field::optional("sourceLineText", Shape::String),
        Field::optional("text", Shape::String),
    ],
};

pub const BACKTRACE_BODY: TypeDescriptor = TypeDescriptor {
    name: "BacktraceBody",
    fields: &[
        Field::optional("fromFrame", Shape::Integer),
        Field::optional("toFrame", Shape::Integer),
        Field::required("totalFrames", Shape::Integer),
        Field::optional("frames", Shape::ArrayOf(&Shape::Object(&FRAME))).lazy(),
    ],
};

pub const SCRIPT_INFO: TypeDescriptor = TypeDescriptor {
    name: "ScriptInfo",
    fields: &[
        Field::required("id", Shape::Integer),
        Field::optional("name", Shape::String),
        Field::optional("lineOffset", Shape::Integer),
        Field::optional("columnOffset", Shape::Integer),
        Field::optional("lineCount", Shape::Integer),
    ],
};

pub const BREAK_BODY: TypeDescriptor = TypeDescriptor {
    name: "BreakEventBody",
    fields: &[
        Field::optional("invocationText", Shape::String),
        Field::optional("sourceLine", Shape::Integer),
        Field::optional("sourceColumn", Shape::Integer),
        Field::optional("sourceLineText", Shape::String),
        Field::optional("script", Shape::Object(&SCRIPT_INFO)),
        Field::optional("breakpoints", Shape::ArrayOf(&Shape::Integer)),
        Field::optional("uncaught", Shape::Boolean),
        Field::optional("exception", Shape::Object(&VALUE_HANDLE)),
    ],
};

pub const AFTER_COMPILE_BODY: TypeDescriptor = TypeDescriptor {
    name: "AfterCompileBody",
    fields: &[Field::required("script", Shape::Object(&SCRIPT_HANDLE))],
};

pub const SCRIPT_COLLECTED_BODY: TypeDescriptor = TypeDescriptor {
    name: "ScriptCollectedBody",
    fields: &[Field::required("script", Shape::Object(&SCRIPT_INFO))],
};

pub const SET_BREAKPOINT_BODY: TypeDescriptor = TypeDescriptor {
    name: "SetBreakpointBody",
    fields: &[
        Field::required("breakpoint", Shape::Integer),
        Field::optional("type", Shape::String),
        Field::optional("script_id", Shape::Integer),
        Field::optional("script_name", Shape::String),
        Field::optional("line", Shape::Integer),
        Field::optional("column", Shape::Integer),
        Field::optional("actual_locations", Shape::Any),
    ],
};

pub const BREAKPOINT_INFO: TypeDescriptor = TypeDescriptor {
    name: "BreakpointInfo",
    fields: &[
        Field::required("number", Shape::Integer),
        Field::required("type", Shape::String),
        Field::optional("script_id", Shape::Integer),
        Field::optional("script_name", Shape::String),
        Field::optional("script_regexp", Shape::String),
        Field::optional("line", Shape::Integer),
        Field::optional("column", Shape::Integer),
        Field::optional("active", Shape::Boolean),
        Field::optional("condition", Shape::String),
        Field::optional("ignoreCount", Shape::Integer),
        Field::optional("hit_count", Shape::Integer),
    ],
};

pub const LIST_BREAKPOINTS_BODY: TypeDescriptor = TypeDescriptor {
    name: "ListBreakpointsBody",
    fields: &[
        Field::required("breakpoints", Shape::ArrayOf(&Shape::Object(&BREAKPOINT_INFO))),
        Field::optional("breakOnExceptions", Shape::Boolean),
        Field::optional("breakOnUncaughtExceptions", Shape::Boolean),
    ],
};

pub const VERSION_BODY: TypeDescriptor = TypeDescriptor {
    name: "VersionBody",
    fields: &[Field::required("V8Version", Shape::String)],
};

pub const SUCCESS_RESPONSE: TypeDescriptor = TypeDescriptor {
    name: "SuccessCommandResponse",
    fields: &[
        Field::required("seq", Shape::Integer),
        Field::required("request_seq", Shape::Integer),
        Field::optional("command", Shape::String),
        Field::optional("running", Shape::Boolean),
        Field::optional("body", Shape::Any).lazy(),
        Field::optional("refs", Shape::ArrayOf(&Shape::Object(&VALUE_HANDLE))).lazy(),
    ],
};

pub const FAILED_RESPONSE: TypeDescriptor = TypeDescriptor {
    name: "FailedCommandResponse",
    fields: &[
        Field::required("seq", Shape::Integer),
        Field::required("request_seq", Shape::Integer),
        Field::optional("command", Shape::String),
        Field::optional("running", Shape::Boolean),
        Field::required("message", Shape::String),
    ],
};

pub const BREAK_EVENT: TypeDescriptor = TypeDescriptor {
    name: "BreakEvent",
    fields: &[
        Field::required("seq", Shape::Integer),
        Field::required("event", Shape::String),
        Field::required("body", Shape::Object(&BREAK_BODY)).lazy(),
    ],
};

pub const AFTER_COMPILE_EVENT: TypeDescriptor = TypeDescriptor {
    name: "AfterCompileEvent",
    fields: &[
        Field::required("seq", Shape::Integer),
        Field::required("event", Shape::String),
        Field::required("body", Shape::Object(&AFTER_COMPILE_BODY)).lazy(),
    ],
};

pub const SCRIPT_COLLECTED_EVENT: TypeDescriptor = TypeDescriptor {
    name: "ScriptCollectedEvent",
    fields: &[
        Field::required("seq", Shape::Integer),
        Field::required("event", Shape::String),
        Field::required("body", Shape::Object(&SCRIPT_COLLECTED_BODY)).lazy(),
    ],
};

pub const OTHER_EVENT: TypeDescriptor = TypeDescriptor {
    name: "OtherEvent",
    fields: &[
        Field::required("seq", Shape::Integer),
        Field::required("event", Shape::String),
        Field::optional("body", Shape::Any).lazy(),
    ],
};

const KNOWN_EVENTS: &[&str] = &["break", "exception", "afterCompile", "scriptCollected"];

fn is_other_event(event: Option<&Value>) -> bool {
    event
        .and_then(Value::as_str)
        .map_or(false, |e| !KNOWN_EVENTS.contains(&e))
}

pub const INCOMING: UnionDescriptor = UnionDescriptor {
    name: "IncomingMessage",
    subtypes: &[
        SubtypeDescriptor {
            name: "SuccessCommandResponse",
            conditions: &[
                Condition::OneOf("type", &["response"]),
                Condition::BoolIs("success", true),
            ],
            descriptor: &SUCCESS_RESPONSE,
        },
        SubtypeDescriptor {
            name: "FailedCommandResponse",
            conditions: &[
                Condition::OneOf("type", &["response"]),
                Condition::BoolIs("success", false),
            ],
            descriptor: &FAILED_RESPONSE,
        },
        SubtypeDescriptor {
            name: "BreakEvent",
            conditions: &[
                Condition::OneOf("type", &["event"]),
                Condition::OneOf("event", &["break", "exception"]),
            ],
            descriptor: &BREAK_EVENT,
        },
        SubtypeDescriptor {
            name: "AfterCompileEvent",
            conditions: &[
                Condition::OneOf("type", &["event"]),
                Condition::OneOf("event", &["afterCompile"]),
            ],
            descriptor: &AFTER_COMPILE_EVENT,
        },
        SubtypeDescriptor {
            name: "ScriptCollectedEvent",
            conditions: &[
                Condition::OneOf("type", &["event"]),
                Condition::OneOf("event", &["scriptCollected"]),
            ],
            descriptor: &SCRIPT_COLLECTED_EVENT,
        },
        SubtypeDescriptor {
            name: "OtherEvent",
            conditions: &[
                Condition::OneOf("type", &["event"]),
                Condition::Custom("event", is_other_event),
            ],
            descriptor: &OTHER_EVENT,
        },
    ],
};

protocol_type!(pub Ref => &REF);
protocol_type!(pub PropertyObject => &PROPERTY_OBJECT);
protocol_type!(pub ValueHandle => &VALUE_HANDLE);
protocol_type!(pub ScriptHandle => &SCRIPT_HANDLE);
protocol_type!(pub FrameVariable => &FRAME_VARIABLE);
protocol_type!(pub FrameObject => &FRAME);
protocol_type!(pub BacktraceBody => &BACKTRACE_BODY);
protocol_type!(pub ScriptInfo => &SCRIPT_INFO);
protocol_type!(pub BreakEventBody => &BREAK_BODY);
protocol_type!(pub AfterCompileBody => &AFTER_COMPILE_BODY);
protocol_type!(pub ScriptCollectedBody => &SCRIPT_COLLECTED_BODY);
protocol_type!(pub SetBreakpointBody => &SET_BREAKPOINT_BODY);
protocol_type!(pub BreakpointInfo => &BREAKPOINT_INFO);
protocol_type!(pub ListBreakpointsBody => &LIST_BREAKPOINTS_BODY);
protocol_type!(pub VersionBody => &VERSION_BODY);
protocol_type!(pub SuccessCommandResponse => &SUCCESS_RESPONSE);
protocol_type!(pub FailedCommandResponse => &FAILED_RESPONSE);
protocol_type!(pub BreakEvent => &BREAK_EVENT);
protocol_type!(pub AfterCompileEvent => &AFTER_COMPILE_EVENT);
protocol_type!(pub ScriptCollectedEvent => &SCRIPT_COLLECTED_EVENT);
protocol_type!(pub OtherEvent => &OTHER_EVENT);

/// Inline display data some references carry with `inlineRefs`
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayData {
    pub type_name: String,
    pub class_name: Option<String>,
    pub value: Option<Value>,
}

impl Ref {
    pub fn handle(&self) -> i64 {
        self.0.i64_field("ref").unwrap_or_default()
    }

    pub fn display_data(&self) -> Option<DisplayData> {
        let type_name = self.0.get_str("type").ok().flatten()?;
        Some(DisplayData {
            type_name: type_name.to_string(),
            class_name: self.0.get_str("className").ok().flatten().map(String::from),
            value: self.0.get_value("value").ok().flatten(),
        })
    }
}

impl PropertyObject {
    /// Property names are strings or array indices
    pub fn name(&self) -> String {
        match self.0.get_value("name").ok().flatten() {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    pub fn handle(&self) -> i64 {
        self.0.i64_field("ref").unwrap_or_default()
    }

    pub fn display_data(&self) -> Option<DisplayData> {
        let type_name = self.0.get_str("type").ok().flatten()?;
        Some(DisplayData {
            type_name: type_name.to_string(),
            class_name: self.0.get_str("className").ok().flatten().map(String::from),
            value: self.0.get_value("value").ok().flatten(),
        })
    }
}

impl ValueHandle {
    pub fn handle(&self) -> i64 {
        self.0.i64_field("handle").unwrap_or_default()
    }

    pub fn type_name(&self) -> &str {
        self.0.str_field("type").unwrap_or_default()
    }

    pub fn class_name(&self) -> Option<&str> {
        self.0.get_str("className").ok().flatten()
    }

    pub fn value(&self) -> Option<Value> {
        self.0.get_value("value").ok().flatten()
    }

    pub fn text(&self) -> Option<&str> {
        self.0.get_str("text").ok().flatten()
    }

    pub fn length(&self) -> Option<i64> {
        self.0.get_i64("length").ok().flatten()
    }

    pub fn to_index(&self) -> Option<i64> {
        self.0.get_i64("toIndex").ok().flatten()
    }

    /// Whether the handle describes an object with a property list
    pub fn has_properties(&self) -> bool {
        self.0.raw().contains_key("properties")
    }

    pub fn properties(&self) -> Result<Vec<PropertyObject>, ParseError> {
        self.0.objects("properties")
    }

    pub fn constructor_function(&self) -> Result<Option<Ref>, ParseError> {
        Ok(self.0.get_object("constructorFunction")?.cloned().map(Ref::wrap))
    }

    pub fn proto_object(&self) -> Result<Option<Ref>, ParseError> {
        Ok(self.0.get_object("protoObject")?.cloned().map(Ref::wrap))
    }

    pub fn function_name(&self) -> Option<&str> {
        self.0
            .get_str("name")
            .ok()
            .flatten()
            .filter(|n| !n.is_empty())
            .or_else(|| self.0.get_str("inferredName").ok().flatten())
    }

    pub fn source(&self) -> Result<Option<&str>, ParseError> {
        self.0.get_str("source")
    }

    pub fn script_id(&self) -> Option<i64> {
        self.0.get_i64("scriptId").ok().flatten()
    }

    /// Id of the script a `script` typed handle stands for
    pub fn id(&self) -> Option<i64> {
        self.0.get_i64("id").ok().flatten()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get_str("name").ok().flatten()
    }
}

impl ScriptHandle {
    pub fn id(&self) -> i64 {
        self.0.i64_field("id").unwrap_or_default()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get_str("name").ok().flatten()
    }

    pub fn line_offset(&self) -> i64 {
        self.0.get_i64("lineOffset").ok().flatten().unwrap_or(0)
    }

    pub fn column_offset(&self) -> i64 {
        self.0.get_i64("columnOffset").ok().flatten().unwrap_or(0)
    }

    pub fn line_count(&self) -> Option<i64> {
        self.0.get_i64("lineCount").ok().flatten()
    }

    pub fn source(&self) -> Result<Option<&str>, ParseError> {
        self.0.get_str("source")
    }
}

impl FrameVariable {
    pub fn name(&self) -> Option<&str> {
        self.0.get_str("name").ok().flatten()
    }

    pub fn value(&self) -> Result<Ref, ParseError> {
        self.0.object_field("value").map(|o| Ref::wrap(o.clone()))
    }
}

impl FrameObject {
    pub fn index(&self) -> i64 {
        self.0.i64_field("index").unwrap_or_default()
    }

    pub fn line(&self) -> i64 {
        self.0.i64_field("line").unwrap_or_default()
    }

    pub fn column(&self) -> i64 {
        self.0.i64_field("column").unwrap_or_default()
    }

    pub fn receiver(&self) -> Option<Ref> {
        self.0.get_object("receiver").ok().flatten().cloned().map(Ref::wrap)
    }

    pub fn func(&self) -> Option<Ref> {
        self.0.get_object("func").ok().flatten().cloned().map(Ref::wrap)
    }

    pub fn script(&self) -> Option<Ref> {
        self.0.get_object("script").ok().flatten().cloned().map(Ref::wrap)
    }

    pub fn arguments(&self) -> Result<Vec<FrameVariable>, ParseError> {
        self.0.objects("arguments")
    }

    pub fn locals(&self) -> Result<Vec<FrameVariable>, ParseError> {
        self.0.objects("locals")
    }

    pub fn source_line_text(&self) -> Option<&str> {
        self.0.get_str("sourceLineText").ok().flatten()
    }

    pub fn text(&self) -> Option<&str> {
        self.0.get_str("text").ok().flatten()
    }
}

impl BacktraceBody {
    pub fn total_frames(&self) -> i64 {
        self.0.i64_field("totalFrames").unwrap_or_default()
    }

    pub fn frames(&self) -> Result<Vec<FrameObject>, ParseError> {
        self.0.objects("frames")
    }
}

impl ScriptInfo {
    pub fn id(&self) -> i64 {
        self.0.i64_field("id").unwrap_or_default()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get_str("name").ok().flatten()
    }
}

impl BreakEventBody {
    pub fn source_line(&self) -> i64 {
        self.0.get_i64("sourceLine").ok().flatten().unwrap_or(0)
    }

    pub fn source_column(&self) -> i64 {
        self.0.get_i64("sourceColumn").ok().flatten().unwrap_or(0)
    }

    pub fn source_line_text(&self) -> Option<&str> {
        self.0.get_str("sourceLineText").ok().flatten()
    }

    pub fn script(&self) -> Option<ScriptInfo> {
        self.0.get_object("script").ok().flatten().cloned().map(ScriptInfo::wrap)
    }

    pub fn breakpoints(&self) -> Vec<i64> {
        self.0
            .get_array("breakpoints")
            .ok()
            .flatten()
            .unwrap_or(&[])
            .iter()
            .filter_map(FieldValue::as_i64)
            .collect()
    }

    pub fn uncaught(&self) -> bool {
        self.0.get_bool("uncaught").ok().flatten().unwrap_or(false)
    }

    pub fn exception(&self) -> Option<ValueHandle> {
        self.0
            .get_object("exception")
            .ok()
            .flatten()
            .cloned()
            .map(ValueHandle::wrap)
    }
}

impl SetBreakpointBody {
    pub fn breakpoint(&self) -> i64 {
        self.0.i64_field("breakpoint").unwrap_or_default()
    }
}

impl BreakpointInfo {
    pub fn number(&self) -> i64 {
        self.0.i64_field("number").unwrap_or_default()
    }

    pub fn type_name(&self) -> &str {
        self.0.str_field("type").unwrap_or_default()
    }

    pub fn script_id(&self) -> Option<i64> {
        self.0.get_i64("script_id").ok().flatten()
    }

    pub fn script_name(&self) -> Option<&str> {
        self.0.get_str("script_name").ok().flatten()
    }

    pub fn script_regexp(&self) -> Option<&str> {
        self.0.get_str("script_regexp").ok().flatten()
    }

    pub fn line(&self) -> Option<i64> {
        self.0.get_i64("line").ok().flatten()
    }

    pub fn column(&self) -> Option<i64> {
        self.0.get_i64("column").ok().flatten()
    }

    pub fn active(&self) -> bool {
        self.0.get_bool("active").ok().flatten().unwrap_or(true)
    }

    pub fn condition(&self) -> Option<&str> {
        self.0.get_str("condition").ok().flatten()
    }

    pub fn ignore_count(&self) -> i64 {
        self.0.get_i64("ignoreCount").ok().flatten().unwrap_or(0)
    }
}

impl ListBreakpointsBody {
    pub fn breakpoints(&self) -> Vec<BreakpointInfo> {
        self.0.objects("breakpoints").unwrap_or_default()
    }
}

impl VersionBody {
    pub fn v8_version(&self) -> &str {
        self.0.str_field("V8Version").unwrap_or_default()
    }
}

impl SuccessCommandResponse {
    pub fn request_seq(&self) -> u64 {
        self.0.i64_field("request_seq").unwrap_or_default() as u64
    }

    pub fn command(&self) -> Option<&str> {
        self.0.get_str("command").ok().flatten()
    }

    pub fn running(&self) -> Option<bool> {
        self.0.get_bool("running").ok().flatten()
    }

    /// Body as a single protocol object of type `T`
    pub fn body_as<T: ProtocolType>(&self) -> Result<T, ParseError> {
        match self.0.get_value("body")? {
            Some(body) => T::parse(body),
            None => Err(ParseError::MissingField {
                type_name: SUCCESS_RESPONSE.name,
                field: "body".to_string(),
            }),
        }
    }

    /// Body as an array of `T`, empty when there is no body
    pub fn body_list<T: ProtocolType>(&self) -> Result<Vec<T>, ParseError> {
        match self.0.get_value("body")? {
            Some(Value::Array(items)) => items.into_iter().map(T::parse).collect(),
            None | Some(Value::Null) => Ok(vec![]),
            Some(_) => Err(ParseError::WrongType {
                type_name: SUCCESS_RESPONSE.name,
                field: "body".to_string(),
                expected: "an array",
            }),
        }
    }

    /// Body as an object keyed by handle, as `lookup` answers
    pub fn body_map<T: ProtocolType>(&self) -> Result<Vec<(String, T)>, ParseError> {
        match self.0.get_value("body")? {
            Some(Value::Object(entries)) => entries
                .into_iter()
                .map(|(key, value)| T::parse(value).map(|t| (key, t)))
                .collect(),
            _ => Err(ParseError::WrongType {
                type_name: SUCCESS_RESPONSE.name,
                field: "body".to_string(),
                expected: "an object",
            }),
        }
    }

    pub fn refs(&self) -> Result<Vec<ValueHandle>, ParseError> {
        self.0.objects("refs")
    }
}

impl FailedCommandResponse {
    pub fn request_seq(&self) -> u64 {
        self.0.i64_field("request_seq").unwrap_or_default() as u64
    }

    pub fn command(&self) -> Option<&str> {
        self.0.get_str("command").ok().flatten()
    }

    pub fn message(&self) -> &str {
        self.0.str_field("message").unwrap_or_default()
    }
}

impl BreakEvent {
    pub fn is_exception(&self) -> bool {
        self.0.str_field("event").map_or(false, |e| e == "exception")
    }

    pub fn body(&self) -> Result<BreakEventBody, ParseError> {
        self.0.object_field("body").map(|o| BreakEventBody::wrap(o.clone()))
    }
}

impl AfterCompileEvent {
    pub fn script(&self) -> Result<ScriptHandle, ParseError> {
        let body = self.0.object_field("body")?;
        body.object_field("script").map(|o| ScriptHandle::wrap(o.clone()))
    }
}

impl ScriptCollectedEvent {
    pub fn script_id(&self) -> Result<i64, ParseError> {
        let body = self.0.object_field("body")?;
        body.object_field("script")?.i64_field("id")
    }
}

impl OtherEvent {
    pub fn event(&self) -> &str {
        self.0.str_field("event").unwrap_or_default()
    }
}

/// Response to a command, successful or not
#[derive(Clone, Debug)]
pub enum CommandResponse {
    Success(SuccessCommandResponse),
    Failure(FailedCommandResponse),
}

impl CommandResponse {
    pub fn request_seq(&self) -> u64 {
        match self {
            CommandResponse::Success(r) => r.request_seq(),
            CommandResponse::Failure(r) => r.request_seq(),
        }
    }

    pub fn as_success(&self) -> Option<&SuccessCommandResponse> {
        match self {
            CommandResponse::Success(r) => Some(r),
            CommandResponse::Failure(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&FailedCommandResponse> {
        match self {
            CommandResponse::Failure(r) => Some(r),
            CommandResponse::Success(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum V8Event {
    Break(BreakEvent),
    AfterCompile(AfterCompileEvent),
    ScriptCollected(ScriptCollectedEvent),
    Other(OtherEvent),
}

/// Anything the VM sends
#[derive(Clone, Debug)]
pub enum IncomingMessage {
    Response(CommandResponse),
    Event(V8Event),
}

impl IncomingMessage {
    pub fn parse(value: Value) -> Result<IncomingMessage, ParseError> {
        let (index, object) = INCOMING.parse(value)?;
        IncomingMessage::route(index, object)
    }

    /// Map a selected `INCOMING` subtype onto its message variant
    fn route(index: usize, object: ProtocolObject) -> Result<IncomingMessage, ParseError> {
        let message = match INCOMING.subtypes.get(index).map(|s| s.name) {
            Some("SuccessCommandResponse") => IncomingMessage::Response(CommandResponse::Success(
                SuccessCommandResponse::wrap(object),
            )),
            Some("FailedCommandResponse") => IncomingMessage::Response(CommandResponse::Failure(
                FailedCommandResponse::wrap(object),
            )),
            Some("BreakEvent") => IncomingMessage::Event(V8Event::Break(BreakEvent::wrap(object))),
            Some("AfterCompileEvent") => {
                IncomingMessage::Event(V8Event::AfterCompile(AfterCompileEvent::wrap(object)))
            }
            Some("ScriptCollectedEvent") => IncomingMessage::Event(V8Event::ScriptCollected(
                ScriptCollectedEvent::wrap(object),
            )),
            Some("OtherEvent") => IncomingMessage::Event(V8Event::Other(OtherEvent::wrap(object))),
            Some(subtype) => {
                return Err(ParseError::UnroutedSubtype {
                    type_name: INCOMING.name,
                    subtype,
                })
            }
            None => {
                return Err(ParseError::NoSubtype {
                    type_name: INCOMING.name,
                })
            }
        };
        Ok(message)
    }

    pub fn parse_str(text: &str) -> Result<IncomingMessage, ParseError> {
        let value = serde_json::from_str(text).map_err(|e| ParseError::Syntax(e.to_string()))?;
        IncomingMessage::parse(value)
    }

    pub fn as_response(&self) -> Option<&CommandResponse> {
        match self {
            IncomingMessage::Response(r) => Some(r),
            IncomingMessage::Event(_) => None,
        }
    }

    pub fn as_event(&self) -> Option<&V8Event> {
        match self {
            IncomingMessage::Event(e) => Some(e),
            IncomingMessage::Response(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use chromedbg_core::parser::{ParseError, ProtocolType};

    use super::{
        BacktraceBody, CommandResponse, IncomingMessage, ScriptHandle, V8Event, ValueHandle,
        VersionBody, INCOMING,
    };

    #[test]
    fn check_success_response() {
        let message = IncomingMessage::parse(json!({
            "seq": 12, "type": "response", "request_seq": 5, "command": "version",
            "success": true, "body": {"V8Version": "3.14.5.9"}, "running": true
        }))
        .unwrap();

        let response = message.as_response().unwrap();
        assert_eq!(response.request_seq(), 5);
        let success = response.as_success().unwrap();
        assert!(response.as_failure().is_none());
        assert_eq!(success.running(), Some(true));
        assert_eq!(
            success.body_as::<VersionBody>().unwrap().v8_version(),
            "3.14.5.9"
        );
    }

    #[test]
    fn check_failed_response() {
        let message = IncomingMessage::parse_str(
            r#"{"seq":3,"type":"response","request_seq":2,"command":"evaluate","success":false,"message":"ReferenceError: x is not defined","running":false}"#,
        )
        .unwrap();

        match message {
            IncomingMessage::Response(CommandResponse::Failure(f)) => {
                assert_eq!(f.message(), "ReferenceError: x is not defined");
                assert_eq!(f.command(), Some("evaluate"));
            }
            m => panic!("unexpected {:?}", m),
        }
    }

    #[test]
    fn check_event_subtypes() {
        let brk = IncomingMessage::parse(json!({
            "seq": 1, "type": "event", "event": "break",
            "body": {"sourceLine": 4, "sourceColumn": 2, "sourceLineText": "  debugger;",
                     "script": {"id": 30, "name": "app.js"}, "breakpoints": [1, 3]}
        }))
        .unwrap();
        match brk.as_event().unwrap() {
            V8Event::Break(event) => {
                assert!(!event.is_exception());
                let body = event.body().unwrap();
                assert_eq!(body.source_line(), 4);
                assert_eq!(body.breakpoints(), vec![1, 3]);
                assert_eq!(body.script().unwrap().name(), Some("app.js"));
            }
            e => panic!("unexpected {:?}", e),
        }

        let compiled = IncomingMessage::parse(json!({
            "seq": 2, "type": "event", "event": "afterCompile",
            "body": {"script": {"id": 31, "name": "lib.js", "lineOffset": 0, "columnOffset": 0}}
        }))
        .unwrap();
        match compiled.as_event().unwrap() {
            V8Event::AfterCompile(event) => assert_eq!(event.script().unwrap().id(), 31),
            e => panic!("unexpected {:?}", e),
        }

        let other = IncomingMessage::parse(json!({"seq": 3, "type": "event", "event": "compileError"}))
            .unwrap();
        match other.as_event().unwrap() {
            V8Event::Other(event) => assert_eq!(event.event(), "compileError"),
            e => panic!("unexpected {:?}", e),
        }
    }

    #[test]
    fn check_unknown_message_type() {
        match IncomingMessage::parse(json!({"seq": 1, "type": "request", "command": "x"})) {
            Err(ParseError::NoSubtype { .. }) => {}
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn check_every_incoming_subtype_is_routed() {
        let samples = vec![
            json!({"seq": 1, "type": "response", "request_seq": 1, "success": true}),
            json!({"seq": 2, "type": "response", "request_seq": 1, "success": false, "message": "no"}),
            json!({"seq": 3, "type": "event", "event": "exception", "body": {"sourceLine": 0}}),
            json!({"seq": 4, "type": "event", "event": "afterCompile", "body": {"script": {"id": 1}}}),
            json!({"seq": 5, "type": "event", "event": "scriptCollected", "body": {"script": {"id": 1}}}),
            json!({"seq": 6, "type": "event", "event": "compileError"}),
        ];
        assert_eq!(samples.len(), INCOMING.subtypes.len());

        let mut seen = Vec::new();
        for sample in samples {
            let (index, object) = INCOMING.parse(sample).unwrap();
            seen.push(index);
            IncomingMessage::route(index, object).unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..INCOMING.subtypes.len()).collect::<Vec<_>>());

        let (_, object) = INCOMING
            .parse(json!({"seq": 7, "type": "event", "event": "compileError"}))
            .unwrap();
        match IncomingMessage::route(INCOMING.subtypes.len(), object) {
            Err(ParseError::NoSubtype { type_name }) => assert_eq!(type_name, "IncomingMessage"),
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn check_lazy_body_errors_on_access() {
        let message = IncomingMessage::parse(json!({
            "seq": 1, "type": "event", "event": "afterCompile", "body": {"script": {"name": "x"}}
        }))
        .unwrap();
        match message.as_event().unwrap() {
            V8Event::AfterCompile(event) => match event.script() {
                Err(ParseError::MissingField { field, .. }) => assert_eq!(field, "id"),
                r => panic!("unexpected {:?}", r),
            },
            e => panic!("unexpected {:?}", e),
        }
    }

    #[test]
    fn check_value_handle_properties() {
        let handle = ValueHandle::parse(json!({
            "handle": 9, "type": "object", "className": "Object", "text": "#<Object>",
            "properties": [{"name": "a", "ref": 10}, {"name": 0, "ref": 11, "type": "number", "value": 3}]
        }))
        .unwrap();
        assert!(handle.has_properties());
        let properties = handle.properties().unwrap();
        assert_eq!(properties[0].name(), "a");
        assert_eq!(properties[1].name(), "0");
        assert!(properties[0].display_data().is_none());
        assert_eq!(
            properties[1].display_data().unwrap().value,
            Some(json!(3))
        );
    }

    #[test]
    fn check_backtrace_and_scripts_bodies() {
        let body = BacktraceBody::parse(json!({
            "fromFrame": 0, "toFrame": 1, "totalFrames": 1,
            "frames": [{"index": 0, "line": 3, "column": 4, "func": {"ref": 2},
                        "locals": [{"name": "x", "value": {"ref": 5}}], "text": "#00 f() app.js line 4"}]
        }))
        .unwrap();
        let frames = body.frames().unwrap();
        assert_eq!(frames[0].func().unwrap().handle(), 2);
        assert_eq!(frames[0].locals().unwrap()[0].value().unwrap().handle(), 5);

        let script = ScriptHandle::parse(json!({"id": 4, "name": null, "source": "1+1"})).unwrap();
        assert_eq!(script.name(), None);
        assert_eq!(script.source().unwrap(), Some("1+1"));
    }
}

//! Debugger
//!
//! Types shared by the debug sessions of every protocol: the JavaScript value
//! classification, stepping, the context token that guards operations on a suspended
//! VM and the listener sessions report events to.

use std::fmt;

use crate::script::Script;

/// JavaScript type of a value as shown to the user
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum JsType {
    Object,
    Number,
    String,
    Function,
    Boolean,
    Error,
    RegExp,
    Date,
    Array,
    Undefined,
    Null,
}

impl JsType {
    /// Classify a value from its wire type and class name
    ///
    /// Arrays and dates arrive as plain objects and are told apart by class name.
    pub fn from_wire(type_name: &str, class_name: Option<&str>) -> Option<JsType> {
        let js_type = match type_name {
            "object" => match class_name {
                Some("Array") => JsType::Array,
                Some("Date") => JsType::Date,
                _ => JsType::Object,
            },
            "number" => JsType::Number,
            "string" => JsType::String,
            "function" => JsType::Function,
            "boolean" => JsType::Boolean,
            "error" => JsType::Error,
            "regexp" => JsType::RegExp,
            "undefined" => JsType::Undefined,
            "null" => JsType::Null,
            _ => return None,
        };
        Some(js_type)
    }

    /// Like `from_wire` but unknown wire types become `Object`
    pub fn from_wire_tolerant(type_name: &str, class_name: Option<&str>) -> JsType {
        JsType::from_wire(type_name, class_name).unwrap_or(JsType::Object)
    }

    /// Whether values of this type can have properties worth expanding
    pub fn is_compound(&self) -> bool {
        matches!(
            self,
            JsType::Object | JsType::Function | JsType::Error | JsType::Array | JsType::Date | JsType::RegExp
        )
    }
}

impl fmt::Display for JsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JsType::Object => "object",
            JsType::Number => "number",
            JsType::String => "string",
            JsType::Function => "function",
            JsType::Boolean => "boolean",
            JsType::Error => "error",
            JsType::RegExp => "regexp",
            JsType::Date => "date",
            JsType::Array => "array",
            JsType::Undefined => "undefined",
            JsType::Null => "null",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepAction {
    In,
    Over,
    Out,
    Continue,
}

/// Identifies one suspension of the VM
///
/// Issued when the VM suspends. Operations that need a suspended VM take the token and
/// fail with `StaleContext` once the VM has resumed or suspended again.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ContextToken(u64);

impl ContextToken {
    pub fn new(id: u64) -> Self {
        ContextToken(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Why the VM stopped
#[derive(Clone, Debug, PartialEq)]
pub enum SuspendReason {
    /// Breakpoints hit, empty when stopped by a step or a `debugger` statement
    Breakpoint(Vec<String>),
    Exception { description: String, uncaught: bool },
    Other(String),
}

/// Where and why the VM is suspended
#[derive(Clone, Debug, PartialEq)]
pub struct SuspendContext {
    pub token: ContextToken,
    pub reason: SuspendReason,
    pub script_id: Option<String>,
    pub script_name: Option<String>,
    pub line: u64,
    pub column: u64,
    pub source_line: Option<String>,
}

/// Receives the events of a debug session
///
/// Called from the connection's reader task, implementations must not block.
pub trait DebugEventListener: Send + Sync {
    fn suspended(&self, _context: &SuspendContext) {}

    fn resumed(&self) {}

    fn disconnected(&self) {}

    fn script_loaded(&self, _script: &Script) {}

    fn script_collected(&self, _script_id: &str) {}
}

/// Listener ignoring everything
#[derive(Debug, Default)]
pub struct NullListener {}

impl DebugEventListener for NullListener {}

/// The state machine guarding context tokens
#[derive(Debug, Default)]
pub struct ContextTracker {
    counter: u64,
    current: Option<ContextToken>,
}

impl ContextTracker {
    pub fn new() -> Self {
        ContextTracker::default()
    }

    /// The VM suspended, issue a new token
    pub fn suspend(&mut self) -> ContextToken {
        self.counter += 1;
        let token = ContextToken(self.counter);
        self.current = Some(token);
        token
    }

    /// The VM resumed, every issued token is now stale
    pub fn resume(&mut self) {
        self.counter += 1;
        self.current = None;
    }

    pub fn current(&self) -> Option<ContextToken> {
        self.current
    }

    pub fn is_valid(&self, token: ContextToken) -> bool {
        self.current == Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextTracker, JsType};

    #[test]
    fn check_classification() {
        assert_eq!(JsType::from_wire("object", Some("Array")), Some(JsType::Array));
        assert_eq!(JsType::from_wire("object", Some("Date")), Some(JsType::Date));
        assert_eq!(JsType::from_wire("object", Some("Foo")), Some(JsType::Object));
        assert_eq!(JsType::from_wire("object", None), Some(JsType::Object));
        assert_eq!(JsType::from_wire("regexp", None), Some(JsType::RegExp));
        assert_eq!(JsType::from_wire("frame", None), None);
        assert_eq!(JsType::from_wire_tolerant("frame", None), JsType::Object);
    }

    #[test]
    fn check_context_tokens() {
        let mut tracker = ContextTracker::new();
        assert_eq!(tracker.current(), None);

        let first = tracker.suspend();
        assert!(tracker.is_valid(first));

        tracker.resume();
        assert!(!tracker.is_valid(first));

        let second = tracker.suspend();
        assert_ne!(first, second);
        assert!(!tracker.is_valid(first));
        assert!(tracker.is_valid(second));
    }
}

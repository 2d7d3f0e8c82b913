//! Value mirrors
//!
//! Local snapshots of remote values, identified by the handle the VM assigned them.
//! A mirror may be partial: its string may be truncated and its properties may not
//! have been loaded yet.

use std::cmp;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use chromedbg_core::debugger::JsType;
use chromedbg_core::parser::ParseError;

use crate::protocol::{DisplayData, PropertyObject, ValueHandle};

/// Minimum number of characters requested when reloading a truncated string
pub const MIN_RELOAD_LENGTH: usize = 64 * 1024;

#[derive(Debug)]
struct StringState {
    value: String,
    total_length: usize,
}

/// A string value that may have been cut short by the VM
///
/// Clones share their state, so a reload is seen by every mirror holding the string.
#[derive(Clone)]
pub struct LoadableString {
    state: Arc<RwLock<StringState>>,
}

impl fmt::Debug for LoadableString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("LoadableString")
            .field("value", &state.value)
            .field("total_length", &state.total_length)
            .finish()
    }
}

impl LoadableString {
    pub fn complete(value: &str) -> Self {
        LoadableString::truncated(value, value.chars().count())
    }

    pub fn truncated(value: &str, total_length: usize) -> Self {
        LoadableString {
            state: Arc::new(RwLock::new(StringState {
                value: value.to_string(),
                total_length,
            })),
        }
    }

    pub fn value(&self) -> String {
        self.state.read().value.clone()
    }

    pub fn loaded_length(&self) -> usize {
        self.state.read().value.chars().count()
    }

    pub fn total_length(&self) -> usize {
        self.state.read().total_length
    }

    pub fn needs_reload(&self) -> bool {
        let state = self.state.read();
        state.value.chars().count() < state.total_length
    }

    /// How many characters to ask for on the next reload
    pub fn reload_size(&self) -> usize {
        cmp::max(self.loaded_length().saturating_mul(10), MIN_RELOAD_LENGTH)
    }

    /// Take a reloaded value, only if it is longer than what we have
    pub fn update(&self, value: &str, total_length: usize) -> bool {
        let mut state = self.state.write();
        if value.chars().count() <= state.value.chars().count() {
            return false;
        }
        state.value = value.to_string();
        state.total_length = cmp::max(total_length, state.total_length);
        true
    }
}

/// A named property pointing at another value
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyReference {
    pub name: String,
    pub handle: i64,
    pub display: Option<DisplayData>,
}

impl From<&PropertyObject> for PropertyReference {
    fn from(property: &PropertyObject) -> Self {
        PropertyReference {
            name: property.name(),
            handle: property.handle(),
            display: property.display_data(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ValueMirror {
    handle: i64,
    js_type: JsType,
    class_name: Option<String>,
    name: Option<String>,
    value: Option<Value>,
    string: LoadableString,
    properties: Option<Arc<Vec<PropertyReference>>>,
}

fn primitive_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ValueMirror {
    pub fn from_handle(handle: &ValueHandle) -> Result<ValueMirror, ParseError> {
        let type_name = handle.type_name();
        let class_name = handle.class_name();
        let value = handle.value();

        let string = match (type_name, &value) {
            ("string", Some(Value::String(s))) => {
                let loaded = s.chars().count();
                let total = handle.length().map_or(loaded, |l| l.max(0) as usize);
                match handle.to_index() {
                    Some(to) if (to.max(0) as usize) < total => LoadableString::truncated(s, total),
                    _ => LoadableString::truncated(s, cmp::max(total, loaded)),
                }
            }
            _ => match (handle.text(), &value) {
                (Some(text), _) => LoadableString::complete(text),
                (None, Some(v)) => LoadableString::complete(&primitive_text(v)),
                (None, None) => LoadableString::complete(type_name),
            },
        };

        let properties = if handle.has_properties() {
            let properties = handle.properties()?;
            Some(Arc::new(properties.iter().map(PropertyReference::from).collect()))
        } else {
            None
        };

        Ok(ValueMirror {
            handle: handle.handle(),
            js_type: JsType::from_wire_tolerant(type_name, class_name),
            class_name: class_name.map(String::from),
            name: handle.function_name().map(String::from),
            value,
            string,
            properties,
        })
    }

    /// A shallow mirror built from the inline data of a reference
    pub fn from_reference(handle: i64, display: &DisplayData) -> ValueMirror {
        let text = match &display.value {
            Some(v) => primitive_text(v),
            None => match &display.class_name {
                Some(class) => format!("#<{}>", class),
                None => display.type_name.clone(),
            },
        };

        ValueMirror {
            handle,
            js_type: JsType::from_wire_tolerant(&display.type_name, display.class_name.as_deref()),
            class_name: display.class_name.clone(),
            name: None,
            value: display.value.clone(),
            string: LoadableString::complete(&text),
            properties: None,
        }
    }

    pub fn handle(&self) -> i64 {
        self.handle
    }

    pub fn js_type(&self) -> JsType {
        self.js_type
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    /// Function or script name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The primitive value, if the VM sent one
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn string(&self) -> &LoadableString {
        &self.string
    }

    pub fn display_string(&self) -> String {
        self.string.value()
    }

    pub fn properties(&self) -> Option<&[PropertyReference]> {
        self.properties.as_ref().map(|p| &p[..])
    }

    pub fn has_properties(&self) -> bool {
        self.properties.is_some()
    }
}

/// Choose between a cached mirror and a newly received one for the same handle
///
/// The mirror with loaded properties wins. Otherwise the longer loaded string wins,
/// ties keep the cached mirror.
pub fn merge(cached: &ValueMirror, incoming: &ValueMirror) -> ValueMirror {
    match (cached.has_properties(), incoming.has_properties()) {
        (true, false) => cached.clone(),
        (false, true) => incoming.clone(),
        _ => {
            if incoming.string.loaded_length() > cached.string.loaded_length() {
                incoming.clone()
            } else {
                cached.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use chromedbg_core::debugger::JsType;
    use chromedbg_core::parser::ProtocolType;

    use crate::protocol::{DisplayData, ValueHandle};

    use super::{merge, LoadableString, ValueMirror, MIN_RELOAD_LENGTH};

    fn mirror(value: serde_json::Value) -> ValueMirror {
        ValueMirror::from_handle(&ValueHandle::parse(value).unwrap()).unwrap()
    }

    #[test]
    fn check_classification_from_class_name() {
        let array = mirror(json!({"handle": 1, "type": "object", "className": "Array", "text": "#<Array>"}));
        assert_eq!(array.js_type(), JsType::Array);

        let date = mirror(json!({"handle": 2, "type": "object", "className": "Date", "value": "2020"}));
        assert_eq!(date.js_type(), JsType::Date);

        let func = mirror(json!({"handle": 3, "type": "function", "className": "Function", "name": "", "inferredName": "foo"}));
        assert_eq!(func.js_type(), JsType::Function);
        assert_eq!(func.name(), Some("foo"));

        let number = mirror(json!({"handle": 4, "type": "number", "value": 2}));
        assert_eq!(number.display_string(), "2");
    }

    #[test]
    fn check_truncated_string() {
        let s = mirror(json!({"handle": 5, "type": "string", "value": "abc", "length": 10, "fromIndex": 0, "toIndex": 3}));
        assert!(s.string().needs_reload());
        assert_eq!(s.string().total_length(), 10);
        assert_eq!(s.string().reload_size(), MIN_RELOAD_LENGTH);

        let complete = mirror(json!({"handle": 6, "type": "string", "value": "abc", "length": 3}));
        assert!(!complete.string().needs_reload());
    }

    #[test]
    fn check_reload_only_replaces_longer() {
        let string = LoadableString::truncated(&"x".repeat(10_000), 200_000);
        assert_eq!(string.reload_size(), 100_000);

        let shared = string.clone();
        assert!(!string.update("short", 200_000));
        assert!(string.update(&"y".repeat(100_000), 200_000));
        assert_eq!(shared.loaded_length(), 100_000);
        assert!(shared.needs_reload());
    }

    #[test]
    fn check_merge_prefers_properties() {
        let with_properties = mirror(json!({
            "handle": 7, "type": "object", "className": "Object", "text": "#<O>",
            "properties": [{"name": "a", "ref": 8}]
        }));
        let long_string = mirror(json!({
            "handle": 7, "type": "object", "className": "Object", "text": "#<Object with a long text>"
        }));

        let merged = merge(&with_properties, &long_string);
        assert!(merged.has_properties());
        assert_eq!(merged.display_string(), "#<O>");

        let merged = merge(&long_string, &with_properties);
        assert!(merged.has_properties());

        let same = merge(&with_properties, &with_properties);
        assert_eq!(same.display_string(), with_properties.display_string());
        assert_eq!(same.properties(), with_properties.properties());
    }

    #[test]
    fn check_merge_prefers_longer_string() {
        let short = mirror(json!({"handle": 9, "type": "string", "value": "ab", "length": 5, "toIndex": 2}));
        let long = mirror(json!({"handle": 9, "type": "string", "value": "abcde", "length": 5}));
        assert_eq!(merge(&short, &long).display_string(), "abcde");
        assert_eq!(merge(&long, &short).display_string(), "abcde");
    }

    #[test]
    fn check_mirror_from_reference() {
        let display = DisplayData {
            type_name: "object".to_string(),
            class_name: Some("Array".to_string()),
            value: None,
        };
        let shallow = ValueMirror::from_reference(12, &display);
        assert_eq!(shallow.js_type(), JsType::Array);
        assert_eq!(shallow.display_string(), "#<Array>");
        assert!(!shallow.has_properties());
    }
}

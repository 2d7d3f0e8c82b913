//! Typed protocol parser
//!
//! Protocol messages arrive as generic JSON. Each protocol type is described once by a
//! static `TypeDescriptor` listing its fields: name, whether it is required, whether it
//! is decoded eagerly when the object is built or lazily on first access, and the shape
//! of its value. A `ProtocolObject` is the raw JSON map plus a per field cache of the
//! decoded values.
//!
//! Types with several subtypes are described by a `UnionDescriptor`. Choosing the
//! subtype only looks at the discriminant fields named by the subtype conditions, and
//! exactly one subtype must match.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{type_name}: expected a JSON object")]
    NotAnObject { type_name: &'static str },

    #[error("{type_name}: missing required field '{field}'")]
    MissingField {
        type_name: &'static str,
        field: String,
    },

    #[error("{type_name}: field '{field}' should be {expected}")]
    WrongType {
        type_name: &'static str,
        field: String,
        expected: &'static str,
    },

    #[error("{type_name}: no field named '{field}'")]
    UnknownField {
        type_name: &'static str,
        field: String,
    },

    #[error("{type_name}: no subtype matches")]
    NoSubtype { type_name: &'static str },

    #[error("{type_name}: ambiguous subtype, matches {candidates:?}")]
    AmbiguousSubtype {
        type_name: &'static str,
        candidates: Vec<&'static str>,
    },

    #[error("{type_name}: subtype {subtype} has no message variant")]
    UnroutedSubtype {
        type_name: &'static str,
        subtype: &'static str,
    },

    #[error("invalid JSON: {0}")]
    Syntax(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Loading {
    Eager,
    Lazy,
}

/// What a field's value must look like
#[derive(Clone, Copy, Debug)]
pub enum FieldShape {
    /// Anything, kept as raw JSON
    Any,
    Boolean,
    Integer,
    Number,
    String,
    /// A JSON object kept as a raw map
    Map,
    /// A nested protocol object
    Object(&'static TypeDescriptor),
    ArrayOf(&'static FieldShape),
}

impl FieldShape {
    fn expected(&self) -> &'static str {
        match self {
            FieldShape::Any => "any value",
            FieldShape::Boolean => "a boolean",
            FieldShape::Integer => "an integer",
            FieldShape::Number => "a number",
            FieldShape::String => "a string",
            FieldShape::Map | FieldShape::Object(_) => "an object",
            FieldShape::ArrayOf(_) => "an array",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub presence: Presence,
    pub loading: Loading,
    pub shape: FieldShape,
}

impl FieldDescriptor {
    pub const fn required(name: &'static str, shape: FieldShape) -> Self {
        FieldDescriptor {
            name,
            presence: Presence::Required,
            loading: Loading::Eager,
            shape,
        }
    }

    pub const fn optional(name: &'static str, shape: FieldShape) -> Self {
        FieldDescriptor {
            name,
            presence: Presence::Optional,
            loading: Loading::Eager,
            shape,
        }
    }

    /// Defer decoding until the field is first read
    pub const fn lazy(self) -> Self {
        FieldDescriptor {
            loading: Loading::Lazy,
            ..self
        }
    }
}

#[derive(Debug)]
pub struct TypeDescriptor {
    pub name: &'static str,
    pub fields: &'static [FieldDescriptor],
}

impl TypeDescriptor {
    fn index_of(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == field)
    }
}

/// A decoded field value
#[derive(Clone, Debug)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Map(Map<String, Value>),
    Object(ProtocolObject),
    Array(Vec<FieldValue>),
    Any(Value),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(&s[..]),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ProtocolObject> {
        match self {
            FieldValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Array(a) => Some(&a[..]),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map<String, Value>> {
        match self {
            FieldValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Any(v) => Some(v),
            _ => None,
        }
    }
}

fn decode_value(
    type_name: &'static str,
    field: &str,
    shape: &FieldShape,
    value: &Value,
) -> Result<FieldValue, ParseError> {
    let wrong_type = || ParseError::WrongType {
        type_name,
        field: field.to_string(),
        expected: shape.expected(),
    };

    match (shape, value) {
        (FieldShape::Any, v) => Ok(FieldValue::Any(v.clone())),
        (FieldShape::Boolean, Value::Bool(b)) => Ok(FieldValue::Boolean(*b)),
        (FieldShape::Integer, Value::Number(n)) => {
            n.as_i64().map(FieldValue::Integer).ok_or_else(wrong_type)
        }
        (FieldShape::Number, Value::Number(n)) => {
            n.as_f64().map(FieldValue::Number).ok_or_else(wrong_type)
        }
        (FieldShape::String, Value::String(s)) => Ok(FieldValue::String(s.clone())),
        (FieldShape::Map, Value::Object(m)) => Ok(FieldValue::Map(m.clone())),
        (FieldShape::Object(descriptor), Value::Object(m)) => {
            ProtocolObject::from_map(descriptor, m.clone()).map(FieldValue::Object)
        }
        (FieldShape::ArrayOf(inner), Value::Array(items)) => items
            .iter()
            .map(|item| decode_value(type_name, field, inner, item))
            .collect::<Result<Vec<_>, _>>()
            .map(FieldValue::Array),
        _ => Err(wrong_type()),
    }
}

fn decode_field(
    type_name: &'static str,
    field: &FieldDescriptor,
    value: Option<&Value>,
) -> Result<Option<FieldValue>, ParseError> {
    let missing = || ParseError::MissingField {
        type_name,
        field: field.name.to_string(),
    };

    match value {
        None => match field.presence {
            Presence::Required => Err(missing()),
            Presence::Optional => Ok(None),
        },
        Some(Value::Null) => match (field.shape, field.presence) {
            (FieldShape::Any, _) => Ok(Some(FieldValue::Null)),
            (_, Presence::Required) => Err(missing()),
            (_, Presence::Optional) => Ok(None),
        },
        Some(v) => decode_value(type_name, field.name, &field.shape, v).map(Some),
    }
}

/// A JSON object checked against a `TypeDescriptor`
///
/// Cloning is cheap, clones share the field cache.
#[derive(Clone)]
pub struct ProtocolObject {
    descriptor: &'static TypeDescriptor,
    raw: Arc<Map<String, Value>>,
    cache: Arc<Vec<OnceCell<Option<FieldValue>>>>,
}

impl fmt::Debug for ProtocolObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.descriptor.name)
            .field("raw", &self.raw)
            .finish()
    }
}

impl ProtocolObject {
    pub fn parse(descriptor: &'static TypeDescriptor, value: Value) -> Result<Self, ParseError> {
        match value {
            Value::Object(map) => ProtocolObject::from_map(descriptor, map),
            _ => Err(ParseError::NotAnObject {
                type_name: descriptor.name,
            }),
        }
    }

    /// Check the eager fields and the presence of required lazy fields
    pub fn from_map(
        descriptor: &'static TypeDescriptor,
        map: Map<String, Value>,
    ) -> Result<Self, ParseError> {
        let cache: Vec<OnceCell<Option<FieldValue>>> =
            descriptor.fields.iter().map(|_| OnceCell::new()).collect();

        for (field, cell) in descriptor.fields.iter().zip(cache.iter()) {
            match field.loading {
                Loading::Eager => {
                    let decoded = decode_field(descriptor.name, field, map.get(field.name))?;
                    let _ = cell.set(decoded);
                }
                Loading::Lazy => {
                    let absent = map.get(field.name).map_or(true, Value::is_null);
                    if field.presence == Presence::Required && absent {
                        return Err(ParseError::MissingField {
                            type_name: descriptor.name,
                            field: field.name.to_string(),
                        });
                    }
                }
            }
        }

        Ok(ProtocolObject {
            descriptor,
            raw: Arc::new(map),
            cache: Arc::new(cache),
        })
    }

    pub fn descriptor(&self) -> &'static TypeDescriptor {
        self.descriptor
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    pub fn to_value(&self) -> Value {
        Value::Object((*self.raw).clone())
    }

    /// Read a field, decoding it now if it is lazy and not read before
    pub fn field(&self, name: &str) -> Result<Option<&FieldValue>, ParseError> {
        let index = self
            .descriptor
            .index_of(name)
            .ok_or_else(|| ParseError::UnknownField {
                type_name: self.descriptor.name,
                field: name.to_string(),
            })?;

        let field = &self.descriptor.fields[index];
        let value = self.cache[index].get_or_try_init(|| {
            decode_field(self.descriptor.name, field, self.raw.get(field.name))
        })?;

        Ok(value.as_ref())
    }

    /// Whether a lazy field has been decoded yet
    pub fn is_loaded(&self, name: &str) -> bool {
        self.descriptor
            .index_of(name)
            .map_or(false, |i| self.cache[i].get().is_some())
    }

    fn required<T>(&self, name: &str, value: Option<T>) -> Result<T, ParseError> {
        value.ok_or_else(|| ParseError::MissingField {
            type_name: self.descriptor.name,
            field: name.to_string(),
        })
    }

    pub fn get_str(&self, name: &str) -> Result<Option<&str>, ParseError> {
        Ok(self.field(name)?.and_then(FieldValue::as_str))
    }

    pub fn get_i64(&self, name: &str) -> Result<Option<i64>, ParseError> {
        Ok(self.field(name)?.and_then(FieldValue::as_i64))
    }

    pub fn get_f64(&self, name: &str) -> Result<Option<f64>, ParseError> {
        Ok(self.field(name)?.and_then(FieldValue::as_f64))
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>, ParseError> {
        Ok(self.field(name)?.and_then(FieldValue::as_bool))
    }

    pub fn get_object(&self, name: &str) -> Result<Option<&ProtocolObject>, ParseError> {
        Ok(self.field(name)?.and_then(FieldValue::as_object))
    }

    pub fn get_array(&self, name: &str) -> Result<Option<&[FieldValue]>, ParseError> {
        Ok(self.field(name)?.and_then(FieldValue::as_array))
    }

    pub fn get_map(&self, name: &str) -> Result<Option<&Map<String, Value>>, ParseError> {
        Ok(self.field(name)?.and_then(FieldValue::as_map))
    }

    /// Raw JSON of an `Any` field, `Value::Null` for an explicit null
    pub fn get_value(&self, name: &str) -> Result<Option<Value>, ParseError> {
        Ok(match self.field(name)? {
            Some(FieldValue::Null) => Some(Value::Null),
            Some(v) => v.as_value().cloned(),
            None => None,
        })
    }

    pub fn str_field(&self, name: &str) -> Result<&str, ParseError> {
        let value = self.get_str(name)?;
        self.required(name, value)
    }

    pub fn i64_field(&self, name: &str) -> Result<i64, ParseError> {
        let value = self.get_i64(name)?;
        self.required(name, value)
    }

    pub fn bool_field(&self, name: &str) -> Result<bool, ParseError> {
        let value = self.get_bool(name)?;
        self.required(name, value)
    }

    pub fn object_field(&self, name: &str) -> Result<&ProtocolObject, ParseError> {
        let value = self.get_object(name)?;
        self.required(name, value)
    }

    /// Elements of an array-of-objects field wrapped as `T`, empty when absent
    pub fn objects<T: ProtocolType>(&self, name: &str) -> Result<Vec<T>, ParseError> {
        Ok(self
            .get_array(name)?
            .unwrap_or(&[])
            .iter()
            .filter_map(FieldValue::as_object)
            .map(|o| T::wrap(o.clone()))
            .collect())
    }

    /// Reinterpret the same JSON as another protocol type
    pub fn cast<T: ProtocolType>(&self) -> Result<T, ParseError> {
        ProtocolObject::from_map(T::DESCRIPTOR, (*self.raw).clone()).map(T::wrap)
    }
}

/// A Rust type backed by a `ProtocolObject`
pub trait ProtocolType: Sized {
    const DESCRIPTOR: &'static TypeDescriptor;

    fn wrap(object: ProtocolObject) -> Self;

    fn object(&self) -> &ProtocolObject;

    fn parse(value: Value) -> Result<Self, ParseError> {
        ProtocolObject::parse(Self::DESCRIPTOR, value).map(Self::wrap)
    }

    fn parse_str(text: &str) -> Result<Self, ParseError> {
        let value = serde_json::from_str(text).map_err(|e| ParseError::Syntax(e.to_string()))?;
        Self::parse(value)
    }
}

/// Declare a newtype over `ProtocolObject` implementing `ProtocolType`
#[macro_export]
macro_rules! protocol_type {
    ($(#[$meta:meta])* $vis:vis $name:ident => $descriptor:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        $vis struct $name($crate::parser::ProtocolObject);

        impl $crate::parser::ProtocolType for $name {
            const DESCRIPTOR: &'static $crate::parser::TypeDescriptor = $descriptor;

            fn wrap(object: $crate::parser::ProtocolObject) -> Self {
                $name(object)
            }

            fn object(&self) -> &$crate::parser::ProtocolObject {
                &self.0
            }
        }
    };
}

/// Test deciding whether an object belongs to a subtype
#[derive(Clone, Copy)]
pub enum Condition {
    /// The field is not there at all
    Absent(&'static str),
    /// The field is there and not null
    Present(&'static str),
    /// The field is there and null
    Null(&'static str),
    /// The field is a string among the given ones
    OneOf(&'static str, &'static [&'static str]),
    BoolIs(&'static str, bool),
    Custom(&'static str, fn(Option<&Value>) -> bool),
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Absent(n) => write!(f, "Absent({})", n),
            Condition::Present(n) => write!(f, "Present({})", n),
            Condition::Null(n) => write!(f, "Null({})", n),
            Condition::OneOf(n, values) => write!(f, "OneOf({}, {:?})", n, values),
            Condition::BoolIs(n, b) => write!(f, "BoolIs({}, {})", n, b),
            Condition::Custom(n, _) => write!(f, "Custom({})", n),
        }
    }
}

impl Condition {
    pub fn matches(&self, map: &Map<String, Value>) -> bool {
        match self {
            Condition::Absent(name) => !map.contains_key(*name),
            Condition::Present(name) => map.get(*name).map_or(false, |v| !v.is_null()),
            Condition::Null(name) => map.get(*name).map_or(false, Value::is_null),
            Condition::OneOf(name, values) => map
                .get(*name)
                .and_then(Value::as_str)
                .map_or(false, |s| values.contains(&s)),
            Condition::BoolIs(name, expected) => {
                map.get(*name).and_then(Value::as_bool) == Some(*expected)
            }
            Condition::Custom(name, check) => check(map.get(*name)),
        }
    }
}

#[derive(Debug)]
pub struct SubtypeDescriptor {
    pub name: &'static str,
    pub conditions: &'static [Condition],
    pub descriptor: &'static TypeDescriptor,
}

#[derive(Debug)]
pub struct UnionDescriptor {
    pub name: &'static str,
    pub subtypes: &'static [SubtypeDescriptor],
}

impl UnionDescriptor {
    /// Pick the single subtype whose conditions all hold
    pub fn select(&self, map: &Map<String, Value>) -> Result<usize, ParseError> {
        let matched: Vec<usize> = self
            .subtypes
            .iter()
            .enumerate()
            .filter(|(_, subtype)| subtype.conditions.iter().all(|c| c.matches(map)))
            .map(|(i, _)| i)
            .collect();

        match matched[..] {
            [index] => Ok(index),
            [] => Err(ParseError::NoSubtype {
                type_name: self.name,
            }),
            _ => Err(ParseError::AmbiguousSubtype {
                type_name: self.name,
                candidates: matched.iter().map(|i| self.subtypes[*i].name).collect(),
            }),
        }
    }

    /// Select the subtype and build the object with its descriptor
    pub fn parse(&self, value: Value) -> Result<(usize, ProtocolObject), ParseError> {
        let map = match value {
            Value::Object(map) => map,
            _ => {
                return Err(ParseError::NotAnObject {
                    type_name: self.name,
                })
            }
        };

        let index = self.select(&map)?;
        let object = ProtocolObject::from_map(self.subtypes[index].descriptor, map)?;
        Ok((index, object))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        Condition, FieldDescriptor, FieldShape, ParseError, ProtocolObject, ProtocolType,
        SubtypeDescriptor, TypeDescriptor, UnionDescriptor,
    };

    const POINT: TypeDescriptor = TypeDescriptor {
        name: "Point",
        fields: &[
            FieldDescriptor::required("x", FieldShape::Integer),
            FieldDescriptor::optional("y", FieldShape::Integer),
        ],
    };

    const SHAPE: TypeDescriptor = TypeDescriptor {
        name: "Shape",
        fields: &[
            FieldDescriptor::required("kind", FieldShape::String),
            FieldDescriptor::optional("origin", FieldShape::Object(&POINT)),
            FieldDescriptor::optional("points", FieldShape::ArrayOf(&FieldShape::Object(&POINT)))
                .lazy(),
            FieldDescriptor::optional("extra", FieldShape::Any),
        ],
    };

    crate::protocol_type!(Shape => &SHAPE);
    crate::protocol_type!(Point => &POINT);

    const CIRCLE: TypeDescriptor = TypeDescriptor {
        name: "Circle",
        fields: &[FieldDescriptor::required("radius", FieldShape::Number)],
    };

    fn is_large(value: Option<&serde_json::Value>) -> bool {
        value.and_then(|v| v.as_f64()).map_or(false, |r| r > 10.0)
    }

    fn is_small(value: Option<&serde_json::Value>) -> bool {
        !is_large(value)
    }

    const FIGURE: UnionDescriptor = UnionDescriptor {
        name: "Figure",
        subtypes: &[
            SubtypeDescriptor {
                name: "Shape",
                conditions: &[Condition::Present("kind"), Condition::Absent("radius")],
                descriptor: &SHAPE,
            },
            SubtypeDescriptor {
                name: "SmallCircle",
                conditions: &[
                    Condition::Absent("kind"),
                    Condition::Present("radius"),
                    Condition::Custom("radius", is_small),
                ],
                descriptor: &CIRCLE,
            },
            SubtypeDescriptor {
                name: "LargeCircle",
                conditions: &[
                    Condition::Absent("kind"),
                    Condition::Present("radius"),
                    Condition::Custom("radius", is_large),
                ],
                descriptor: &CIRCLE,
            },
            SubtypeDescriptor {
                name: "Labelled",
                conditions: &[Condition::OneOf("kind", &["label", "note"])],
                descriptor: &SHAPE,
            },
        ],
    };

    #[test]
    fn check_eager_fields() {
        let shape = Shape::parse(json!({"kind": "line", "origin": {"x": 1, "y": 2}})).unwrap();
        assert_eq!(shape.object().str_field("kind").unwrap(), "line");
        let origin = shape.object().object_field("origin").unwrap();
        assert_eq!(origin.i64_field("x").unwrap(), 1);
        assert_eq!(origin.get_i64("y").unwrap(), Some(2));
        assert_eq!(shape.object().get_value("extra").unwrap(), None);
    }

    #[test]
    fn check_missing_required_field_named() {
        match Shape::parse(json!({"origin": {"x": 1}})) {
            Err(ParseError::MissingField { type_name, field }) => {
                assert_eq!(type_name, "Shape");
                assert_eq!(field, "kind");
            }
            r => panic!("unexpected {:?}", r),
        }

        match Shape::parse(json!({"kind": "line", "origin": {"y": 1}})) {
            Err(ParseError::MissingField { type_name, field }) => {
                assert_eq!(type_name, "Point");
                assert_eq!(field, "x");
            }
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn check_wrong_type_named() {
        match Shape::parse(json!({"kind": 3})) {
            Err(ParseError::WrongType { field, .. }) => assert_eq!(field, "kind"),
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn check_lazy_field_decoded_on_access() {
        let shape = Shape::parse(json!({"kind": "poly", "points": [{"x": 1}, {"y": 2}]})).unwrap();
        assert!(!shape.object().is_loaded("points"));

        match shape.object().objects::<Point>("points") {
            Err(ParseError::MissingField { field, .. }) => assert_eq!(field, "x"),
            r => panic!("unexpected {:?}", r),
        }

        let shape = Shape::parse(json!({"kind": "poly", "points": [{"x": 1}, {"x": 5}]})).unwrap();
        let points = shape.object().objects::<Point>("points").unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].object().i64_field("x").unwrap(), 5);
        assert!(shape.object().is_loaded("points"));

        // Clones share the cache
        let copy = shape.clone();
        assert!(copy.object().is_loaded("points"));
    }

    #[test]
    fn check_null_optional_is_absent() {
        let shape = Shape::parse(json!({"kind": "dot", "origin": null, "extra": null})).unwrap();
        assert!(shape.object().get_object("origin").unwrap().is_none());
        assert_eq!(
            shape.object().get_value("extra").unwrap(),
            Some(serde_json::Value::Null)
        );
    }

    #[test]
    fn check_unknown_field_access() {
        let shape = Shape::parse(json!({"kind": "dot"})).unwrap();
        assert!(shape.object().field("colour").is_err());
    }

    #[test]
    fn check_subtype_exactly_one() {
        let (index, object) = FIGURE.parse(json!({"radius": 3.5})).unwrap();
        assert_eq!(FIGURE.subtypes[index].name, "SmallCircle");
        assert_eq!(object.get_f64("radius").unwrap(), Some(3.5));

        let (index, _) = FIGURE.parse(json!({"radius": 30})).unwrap();
        assert_eq!(FIGURE.subtypes[index].name, "LargeCircle");

        match FIGURE.parse(json!({"colour": "red"})) {
            Err(ParseError::NoSubtype { type_name }) => assert_eq!(type_name, "Figure"),
            r => panic!("unexpected {:?}", r),
        }

        match FIGURE.parse(json!({"kind": "label"})) {
            Err(ParseError::AmbiguousSubtype { candidates, .. }) => {
                assert_eq!(candidates, vec!["Shape", "Labelled"])
            }
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn check_cast() {
        let object = ProtocolObject::parse(&SHAPE, json!({"kind": "dot", "x": 4})).unwrap();
        let point: Point = object.cast().unwrap();
        assert_eq!(point.object().i64_field("x").unwrap(), 4);
    }

    #[test]
    fn check_not_an_object() {
        assert!(Shape::parse(json!([1, 2])).is_err());
        assert!(Shape::parse_str("{not json").is_err());
    }
}

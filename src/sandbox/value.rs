//! The value model shared by the registry and interpreter capabilities.
//!
//! [`Value`] is what lives in a context namespace. Lists and dicts are shared
//! mutable cells, so a `Value` graph may alias and even contain itself.
//! [`Transfer`] is the host-owned, acyclic tree that crosses the boundary.

use std::any::Any;
use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Shared list cell.
pub type List = Rc<Container<Vec<Value>>>;

/// Shared dict cell. Keys are always text.
pub type Dict = Rc<Container<IndexMap<String, Value>>>;

/// Walks over nested values (repr, equality, ordering) stop at this depth.
pub(crate) const MAX_WALK_DEPTH: usize = 256;

/// Storage whose nested values can be handed over for teardown.
pub trait Children {
    /// Move every directly held value into `out`.
    fn drain_into(&mut self, out: &mut Vec<Value>);
}

impl Children for Vec<Value> {
    fn drain_into(&mut self, out: &mut Vec<Value>) {
        out.append(self);
    }
}

impl Children for IndexMap<String, Value> {
    fn drain_into(&mut self, out: &mut Vec<Value>) {
        out.extend(self.drain(..).map(|(_, value)| value));
    }
}

/// The mutable cell behind a list or dict.
///
/// Dropping the last handle tears nested containers down with an explicit
/// work list, so arbitrarily deep values never recurse on the native stack.
pub struct Container<T: Children>(RefCell<T>);

impl<T: Children> Container<T> {
    pub fn new(items: T) -> Self {
        Self(RefCell::new(items))
    }
}

impl<T: Children> Deref for Container<T> {
    type Target = RefCell<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Children> Drop for Container<T> {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.0.get_mut().drain_into(&mut pending);
        while let Some(value) = pending.pop() {
            match value {
                Value::List(mut list) => {
                    if let Some(cell) = Rc::get_mut(&mut list) {
                        cell.0.get_mut().drain_into(&mut pending);
                    }
                }
                Value::Dict(mut dict) => {
                    if let Some(cell) = Rc::get_mut(&mut dict) {
                        cell.0.get_mut().drain_into(&mut pending);
                    }
                }
                _ => {}
            }
        }
    }
}

/// A live value inside a context.
#[derive(Clone)]
pub enum Value {
    /// `None`.
    None,
    /// `True` / `False`.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Double precision float.
    Float(f64),
    /// Immutable text.
    Str(Rc<str>),
    /// Mutable, shared sequence.
    List(List),
    /// Mutable, shared mapping with text keys.
    Dict(Dict),
    /// A named gateway into the host, such as the bridge dispatcher.
    Host(Rc<str>),
    /// An interpreter-private object.
    Opaque(Opaque),
}

/// An object only the interpreter that created it understands.
///
/// Functions, exception instances and handles to guest-heap objects are
/// opaque to the core: they can be bound, looked up and passed around, but
/// never transferred.
#[derive(Clone)]
pub struct Opaque {
    kind: Cow<'static, str>,
    label: Option<Rc<str>>,
    payload: Rc<dyn Any>,
}

impl Opaque {
    /// Wrap an interpreter object. `kind` is the type name shown to users.
    pub fn new<T: Any>(kind: impl Into<Cow<'static, str>>, payload: T) -> Self {
        Self {
            kind: kind.into(),
            label: None,
            payload: Rc::new(payload),
        }
    }

    /// Attach a label used by `repr`, e.g. a function name.
    pub fn with_label(mut self, label: impl Into<Rc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// The user-facing type name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The label, if one was attached.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Borrow the payload as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(&self, other: &Opaque) -> bool {
        Rc::ptr_eq(&self.payload, &other.payload)
    }

    pub(crate) fn repr(&self) -> String {
        match &self.label {
            Some(label) => format!("<{} {}>", self.kind, label),
            None => format!("<{} object>", self.kind),
        }
    }
}

impl Value {
    /// Build a text value.
    pub fn str(text: impl Into<Rc<str>>) -> Self {
        Value::Str(text.into())
    }

    /// Build a fresh list cell.
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(Container::new(items)))
    }

    /// Build a fresh dict cell.
    pub fn dict(entries: IndexMap<String, Value>) -> Self {
        Value::Dict(Rc::new(Container::new(entries)))
    }

    /// The type name as sandboxed code sees it.
    pub fn type_name(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Host(_) => "host_function",
            Value::Opaque(opaque) => opaque.kind(),
        }
    }

    /// Python truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Dict(entries) => !entries.borrow().is_empty(),
            Value::Host(_) | Value::Opaque(_) => true,
        }
    }

    /// The text when this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer when this is an `Int` (or a `Bool`).
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Python `repr()`.
    pub fn repr(&self) -> String {
        let mut out = String::new();
        write_repr(self, &mut out, &mut Vec::new());
        out
    }

    /// Structural equality with Python semantics (`1 == 1.0`, `True == 1`).
    pub fn equals(&self, other: &Value) -> bool {
        values_equal(self, other, 0)
    }
}

fn values_equal(a: &Value, b: &Value, depth: usize) -> bool {
    if depth > MAX_WALK_DEPTH {
        return false;
    }
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Host(x), Value::Host(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(a, b)| values_equal(a, b, depth + 1))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.get(k)
                        .is_some_and(|other| values_equal(v, other, depth + 1))
                })
        }
        (Value::Opaque(x), Value::Opaque(y)) => x.ptr_eq(y),
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Float(x), other) | (other, Value::Float(x)) => {
            other.as_int().is_some_and(|i| (i as f64) == *x)
        }
        _ => match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

/// Format a float the way Python prints it.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        let sign = if f > 0.0 { "" } else { "-" };
        format!("{sign}inf")
    } else if f == f.trunc() && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// Quote text the way Python's `repr` does.
pub fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn write_repr(value: &Value, out: &mut String, seen: &mut Vec<*const ()>) {
    match value {
        Value::None => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => out.push_str(&format_float(*f)),
        Value::Str(s) => out.push_str(&quote_str(s)),
        Value::Host(name) => out.push_str(&format!("<host function {name}>")),
        Value::Opaque(opaque) => out.push_str(&opaque.repr()),
        Value::List(items) => {
            let ptr = Rc::as_ptr(items) as *const ();
            if seen.contains(&ptr) || seen.len() >= MAX_WALK_DEPTH {
                out.push_str("[...]");
                return;
            }
            seen.push(ptr);
            out.push('[');
            for (i, item) in items.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(item, out, seen);
            }
            out.push(']');
            seen.pop();
        }
        Value::Dict(entries) => {
            let ptr = Rc::as_ptr(entries) as *const ();
            if seen.contains(&ptr) || seen.len() >= MAX_WALK_DEPTH {
                out.push_str("{...}");
                return;
            }
            seen.push(ptr);
            out.push('{');
            for (i, (key, item)) in entries.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&quote_str(key));
                out.push_str(": ");
                write_repr(item, out, seen);
            }
            out.push('}');
            seen.pop();
        }
    }
}

/// Python `str()`: text is shown raw, everything else as `repr`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            other => f.write_str(&other.repr()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s.into())
    }
}

/// A transfer-safe, host-owned value tree.
///
/// Serialized as plain JSON (`null`, booleans, numbers, strings, arrays and
/// objects), so snapshots and guest wire messages stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Transfer {
    /// Absence.
    None,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Text.
    Str(String),
    /// Ordered sequence.
    List(Vec<Transfer>),
    /// Mapping with text keys, in insertion order.
    Map(IndexMap<String, Transfer>),
}

impl Transfer {
    /// Check for absence.
    pub fn is_none(&self) -> bool {
        matches!(self, Transfer::None)
    }

    /// The text when this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Transfer::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer when this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Transfer::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The number as a float when this is an `Int` or `Float`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Transfer::Int(i) => Some(*i as f64),
            Transfer::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// The boolean when this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Transfer::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The items when this is a `List`.
    pub fn as_list(&self) -> Option<&[Transfer]> {
        match self {
            Transfer::List(items) => Some(items),
            _ => None,
        }
    }

    /// The entries when this is a `Map`.
    pub fn as_map(&self) -> Option<&IndexMap<String, Transfer>> {
        match self {
            Transfer::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

/// Python `str()` of the equivalent sandbox value.
impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transfer::Str(s) => f.write_str(s),
            other => write!(f, "{}", Value::from(other.clone())),
        }
    }
}

/// Materialize a transfer tree as fresh sandbox cells.
impl From<Transfer> for Value {
    fn from(t: Transfer) -> Self {
        match t {
            Transfer::None => Value::None,
            Transfer::Bool(b) => Value::Bool(b),
            Transfer::Int(i) => Value::Int(i),
            Transfer::Float(f) => Value::Float(f),
            Transfer::Str(s) => Value::Str(s.into()),
            Transfer::List(items) => Value::list(items.into_iter().map(Value::from).collect()),
            Transfer::Map(entries) => Value::dict(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Transfer {
    fn from(b: bool) -> Self {
        Transfer::Bool(b)
    }
}

impl From<i64> for Transfer {
    fn from(i: i64) -> Self {
        Transfer::Int(i)
    }
}

impl From<i32> for Transfer {
    fn from(i: i32) -> Self {
        Transfer::Int(i64::from(i))
    }
}

impl From<f64> for Transfer {
    fn from(f: f64) -> Self {
        Transfer::Float(f)
    }
}

impl From<&str> for Transfer {
    fn from(s: &str) -> Self {
        Transfer::Str(s.to_string())
    }
}

impl From<String> for Transfer {
    fn from(s: String) -> Self {
        Transfer::Str(s)
    }
}

impl<T: Into<Transfer>> From<Vec<T>> for Transfer {
    fn from(items: Vec<T>) -> Self {
        Transfer::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<IndexMap<String, Transfer>> for Transfer {
    fn from(entries: IndexMap<String, Transfer>) -> Self {
        Transfer::Map(entries)
    }
}

impl<T: Into<Transfer>> From<Option<T>> for Transfer {
    fn from(value: Option<T>) -> Self {
        value.map_or(Transfer::None, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repr_matches_python() {
        let v = Value::list(vec![
            Value::Int(1),
            Value::Float(2.0),
            Value::str("it's"),
            Value::None,
            Value::Bool(true),
        ]);
        assert_eq!(v.repr(), r#"[1, 2.0, "it's", None, True]"#);
        assert_eq!(Value::str("a'b\"c").repr(), r#"'a\'b"c'"#);
        assert_eq!(Value::Float(0.5).repr(), "0.5");
    }

    #[test]
    fn test_repr_of_cyclic_list() {
        let items: List = Rc::new(Container::new(vec![Value::Int(1)]));
        items.borrow_mut().push(Value::List(items.clone()));
        assert_eq!(Value::List(items.clone()).repr(), "[1, [...]]");
        // break the cycle so the test does not leak
        items.borrow_mut().clear();
    }

    #[test]
    fn test_deep_nesting_is_dropped_without_recursion() {
        let mut value = Value::list(Vec::new());
        for _ in 0..500_000 {
            value = Value::list(vec![value]);
        }
        drop(value);
    }

    #[test]
    fn test_repr_of_deep_list_is_elided() {
        let mut value = Value::Int(0);
        for _ in 0..MAX_WALK_DEPTH + 10 {
            value = Value::list(vec![value]);
        }
        let repr = value.repr();
        assert!(repr.starts_with("[[[["));
        assert!(repr.contains("[...]"));
        assert!(!repr.contains('0'));
    }

    #[test]
    fn test_shared_child_survives_parent_teardown() {
        let child = Value::list(vec![Value::Int(7)]);
        let parent = Value::list(vec![child.clone(), Value::dict(IndexMap::new())]);
        drop(parent);
        assert_eq!(child.repr(), "[7]");
    }

    #[test]
    fn test_numeric_equality() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::Int(1), Value::str("1"));
        assert_ne!(Value::None, Value::Bool(false));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::list(vec![]).is_truthy());
        assert!(Value::str("x").is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
    }

    #[test]
    fn test_transfer_json_shape() {
        let mut map = IndexMap::new();
        map.insert("b".to_string(), Transfer::from(vec![1i64, 2]));
        map.insert("a".to_string(), Transfer::None);
        let json = serde_json::to_string(&Transfer::Map(map.clone())).unwrap();
        assert_eq!(json, r#"{"b":[1,2],"a":null}"#);

        let back: Transfer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Transfer::Map(map));
    }

    #[test]
    fn test_transfer_display() {
        assert_eq!(Transfer::from("pybox").to_string(), "pybox");
        assert_eq!(Transfer::from(vec!["a"]).to_string(), "['a']");
    }
}

//! Runtime objects of the script interpreter, carried as opaque values.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{ErrorKind, ExecError};
use crate::sandbox::value::{Opaque, Value};

use super::ast::FunctionDef;
use super::eval::{Exec, Machine};
use super::ops::RangeObject;

/// A user-defined function or lambda.
pub(crate) struct Function {
    pub def: Rc<FunctionDef>,
    pub defaults: Vec<Option<Value>>,
    /// Enclosing function scopes, outermost first.
    pub captured: Vec<Locals>,
}

/// Local variables of one function activation.
pub(crate) type Locals = Rc<RefCell<HashMap<String, Value>>>;

pub(crate) type Kwargs = Vec<(String, Value)>;

pub(crate) type BuiltinFn = fn(&mut Machine<'_>, Vec<Value>, Kwargs) -> Exec<Value>;

/// A builtin function such as `len`.
pub(crate) struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

/// A method looked up on a value, e.g. `items.append`.
pub(crate) struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

/// An exception class usable in `raise` and `except`.
pub(crate) struct ExceptionClass {
    pub name: Rc<str>,
}

/// A raised or caught exception instance.
#[derive(Debug)]
pub(crate) struct ExceptionObject {
    pub class: Rc<str>,
    pub message: String,
    pub kind: ErrorKind,
}

/// Built-in exception classes and their parent.
pub(crate) const EXCEPTION_CLASSES: [(&str, &str); 21] = [
    ("BaseException", ""),
    ("Exception", "BaseException"),
    ("ArithmeticError", "Exception"),
    ("ZeroDivisionError", "ArithmeticError"),
    ("OverflowError", "ArithmeticError"),
    ("LookupError", "Exception"),
    ("KeyError", "LookupError"),
    ("IndexError", "LookupError"),
    ("ValueError", "Exception"),
    ("TypeError", "Exception"),
    ("NameError", "Exception"),
    ("AttributeError", "Exception"),
    ("RuntimeError", "Exception"),
    ("RecursionError", "RuntimeError"),
    ("NotImplementedError", "RuntimeError"),
    ("MemoryError", "Exception"),
    ("ImportError", "Exception"),
    ("AssertionError", "Exception"),
    ("StopIteration", "Exception"),
    ("UnicodeError", "ValueError"),
    ("ProtectionViolation", "Exception"),
];

fn parent_of(name: &str) -> Option<&'static str> {
    EXCEPTION_CLASSES
        .iter()
        .find(|(class, _)| *class == name)
        .map(|(_, parent)| *parent)
        .filter(|parent| !parent.is_empty())
}

/// Whether exception class `name` is `base` or derives from it. Classes the
/// interpreter does not know (raised by tools) derive from `Exception`.
pub(crate) fn is_subclass(name: &str, base: &str) -> bool {
    if name == base {
        return true;
    }
    if !EXCEPTION_CLASSES.iter().any(|(class, _)| *class == name) {
        return matches!(base, "Exception" | "BaseException");
    }
    let mut current = name;
    while let Some(parent) = parent_of(current) {
        if parent == base {
            return true;
        }
        current = parent;
    }
    false
}

impl ExceptionObject {
    pub fn new(class: impl Into<Rc<str>>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            kind: ErrorKind::Execution,
        }
    }

    pub fn from_error(error: &ExecError) -> Self {
        Self {
            class: error.exception_type.as_str().into(),
            message: error.message.clone(),
            kind: error.kind,
        }
    }

    pub fn to_error(&self) -> ExecError {
        ExecError::new(self.kind, self.class.as_ref(), self.message.clone())
    }

    pub fn repr(&self) -> String {
        format!("{}({})", self.class, Value::str(self.message.as_str()).repr())
    }
}

pub(crate) fn function_value(function: Function) -> Value {
    let label = function.def.name.clone();
    Value::Opaque(Opaque::new("function", function).with_label(label))
}

pub(crate) fn builtin_value(name: &'static str, func: BuiltinFn) -> Value {
    Value::Opaque(
        Opaque::new("builtin_function_or_method", Builtin { name, func })
            .with_label(format!("built-in function {name}")),
    )
}

pub(crate) fn method_value(receiver: Value, name: &str) -> Value {
    let label = format!("method {}.{}", receiver.type_name(), name);
    Value::Opaque(
        Opaque::new(
            "builtin_function_or_method",
            BoundMethod {
                receiver,
                name: name.to_string(),
            },
        )
        .with_label(label),
    )
}

pub(crate) fn range_value(range: RangeObject) -> Value {
    let label = range.repr();
    Value::Opaque(Opaque::new("range", range).with_label(label))
}

pub(crate) fn class_value(name: &str) -> Value {
    Value::Opaque(
        Opaque::new("type", ExceptionClass { name: name.into() })
            .with_label(format!("class '{name}'")),
    )
}

pub(crate) fn exception_value(exc: Rc<ExceptionObject>) -> Value {
    let label = exc.repr();
    Value::Opaque(Opaque::new(exc.class.to_string(), exc).with_label(label))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_hierarchy() {
        assert!(is_subclass("KeyError", "LookupError"));
        assert!(is_subclass("KeyError", "Exception"));
        assert!(is_subclass("ZeroDivisionError", "ArithmeticError"));
        assert!(!is_subclass("KeyError", "ValueError"));
        assert!(is_subclass("ProtectionViolation", "Exception"));
    }

    #[test]
    fn test_unknown_classes_derive_from_exception() {
        assert!(is_subclass("QuotaExceeded", "Exception"));
        assert!(!is_subclass("QuotaExceeded", "ValueError"));
    }

    #[test]
    fn test_exception_repr() {
        assert_eq!(ExceptionObject::new("ValueError", "bad").repr(), "ValueError('bad')");
    }
}

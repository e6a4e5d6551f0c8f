//! Operators, subscripts and iteration over script values.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::sandbox::value::{Value, MAX_WALK_DEPTH};

use super::ast::{BinOp, CmpOp, UnaryOp};
use super::builtins::has_method;
use super::eval::{Exec, Raised};
use super::objects::{method_value, ExceptionObject};

/// A lazily produced `range`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RangeObject {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeObject {
    pub fn len(&self) -> u64 {
        let (start, stop, step) = (
            i128::from(self.start),
            i128::from(self.stop),
            i128::from(self.step),
        );
        let span = if step > 0 { stop - start } else { start - stop };
        if span <= 0 {
            return 0;
        }
        let step = step.abs();
        ((span + step - 1) / step) as u64
    }

    /// The `index`th element. Callers keep `index` below `len()`, so the
    /// result lies between `start` and `stop`.
    pub fn item(&self, index: u64) -> i64 {
        let value = i128::from(self.start) + i128::from(self.step) * i128::from(index);
        value as i64
    }

    pub fn repr(&self) -> String {
        if self.step == 1 {
            format!("range({}, {})", self.start, self.stop)
        } else {
            format!("range({}, {}, {})", self.start, self.stop, self.step)
        }
    }
}

/// Iteration over a value without materializing ranges.
pub(crate) enum Items {
    Range { next: i64, left: u64, step: i64 },
    Values(std::vec::IntoIter<Value>),
}

impl Iterator for Items {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            Items::Range { next, left, step } => {
                if *left == 0 {
                    return None;
                }
                let current = *next;
                *left -= 1;
                *next = next.wrapping_add(*step);
                Some(Value::Int(current))
            }
            Items::Values(values) => values.next(),
        }
    }
}

pub(crate) fn as_range(value: &Value) -> Option<RangeObject> {
    match value {
        Value::Opaque(opaque) => opaque.downcast_ref::<RangeObject>().copied(),
        _ => None,
    }
}

pub(crate) fn as_exception(value: &Value) -> Option<Rc<ExceptionObject>> {
    match value {
        Value::Opaque(opaque) => opaque.downcast_ref::<Rc<ExceptionObject>>().cloned(),
        _ => None,
    }
}

pub(crate) fn type_error<T>(message: impl Into<String>) -> Exec<T> {
    Err(Raised::new("TypeError", message))
}

pub(crate) fn items_of(value: &Value) -> Exec<Items> {
    let values = match value {
        Value::List(items) => items.borrow().clone(),
        Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
        Value::Dict(entries) => entries.borrow().keys().map(|k| Value::str(k.as_str())).collect(),
        other => {
            if let Some(range) = as_range(other) {
                return Ok(Items::Range {
                    next: range.start,
                    left: range.len(),
                    step: range.step,
                });
            }
            return type_error(format!("'{}' object is not iterable", other.type_name()));
        }
    };
    Ok(Items::Values(values.into_iter()))
}

/// Materialize an iterable, refusing results longer than `max_len`.
pub(crate) fn iterate(value: &Value, max_len: usize) -> Exec<Vec<Value>> {
    if let Some(range) = as_range(value) {
        check_len(range.len(), max_len)?;
    }
    Ok(items_of(value)?.collect())
}

pub(crate) fn check_len(len: u64, max_len: usize) -> Exec<()> {
    if len > max_len as u64 {
        return Err(Raised::new(
            "MemoryError",
            format!("result of length {len} exceeds the sandbox limit of {max_len}"),
        ));
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Num {
    I(i64),
    F(f64),
}

fn num(value: &Value) -> Option<Num> {
    match value {
        Value::Int(i) => Some(Num::I(*i)),
        Value::Bool(b) => Some(Num::I(i64::from(*b))),
        Value::Float(f) => Some(Num::F(*f)),
        _ => None,
    }
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::I(i) => i as f64,
        Num::F(f) => f,
    }
}

fn overflow() -> Raised {
    Raised::new("OverflowError", "integer result out of range")
}

fn zero_division(what: &str) -> Raised {
    Raised::new("ZeroDivisionError", what)
}

pub(crate) fn unary(op: UnaryOp, value: Value) -> Exec<Value> {
    match (op, num(&value)) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!value.is_truthy())),
        (UnaryOp::Neg, Some(Num::I(i))) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
        (UnaryOp::Neg, Some(Num::F(f))) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Some(Num::I(i))) => Ok(Value::Int(i)),
        (UnaryOp::Pos, Some(Num::F(f))) => Ok(Value::Float(f)),
        _ => type_error(format!(
            "bad operand type for unary {}: '{}'",
            if op == UnaryOp::Neg { "-" } else { "+" },
            value.type_name()
        )),
    }
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

fn floor_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn repeat<T: Clone>(items: &[T], times: i64, max_len: usize) -> Exec<Vec<T>> {
    let times = usize::try_from(times).unwrap_or(0);
    check_len((items.len() as u64).saturating_mul(times as u64), max_len)?;
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    Ok(out)
}

pub(crate) fn binary(op: BinOp, left: Value, right: Value, max_len: usize) -> Exec<Value> {
    if let (Some(a), Some(b)) = (num(&left), num(&right)) {
        return numeric(op, a, b);
    }
    match (op, &left, &right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            check_len((a.len() + b.len()) as u64, max_len)?;
            Ok(Value::str(format!("{a}{b}")))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            check_len(items.len() as u64, max_len)?;
            Ok(Value::list(items))
        }
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
            let times = n.as_int().unwrap_or(0);
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::str(repeat(&chars, times, max_len)?.into_iter().collect::<String>()))
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items)) if n.as_int().is_some() => {
            let times = n.as_int().unwrap_or(0);
            let items = items.borrow().clone();
            Ok(Value::list(repeat(&items, times, max_len)?))
        }
        _ => type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        )),
    }
}

fn numeric(op: BinOp, a: Num, b: Num) -> Exec<Value> {
    if let (Num::I(x), Num::I(y)) = (a, b) {
        return match op {
            BinOp::Add => x.checked_add(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => x.checked_sub(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => x.checked_mul(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Div => {
                if y == 0 {
                    return Err(zero_division("division by zero"));
                }
                Ok(Value::Float(x as f64 / y as f64))
            }
            BinOp::FloorDiv => {
                if y == 0 {
                    return Err(zero_division("integer division or modulo by zero"));
                }
                floor_div(x, y).map(Value::Int).ok_or_else(overflow)
            }
            BinOp::Mod => {
                if y == 0 {
                    return Err(zero_division("integer modulo by zero"));
                }
                floor_mod(x, y).map(Value::Int).ok_or_else(overflow)
            }
            BinOp::Pow => {
                if y < 0 {
                    if x == 0 {
                        return Err(zero_division("0.0 cannot be raised to a negative power"));
                    }
                    return Ok(Value::Float((x as f64).powf(y as f64)));
                }
                u32::try_from(y)
                    .ok()
                    .and_then(|e| x.checked_pow(e))
                    .map(Value::Int)
                    .ok_or_else(overflow)
            }
        };
    }
    let (x, y) = (as_f64(a), as_f64(b));
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(zero_division("float modulo"));
            }
            x - y * (x / y).floor()
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(zero_division("0.0 cannot be raised to a negative power"));
            }
            x.powf(y)
        }
    };
    Ok(Value::Float(result))
}

/// Ordering for `<`-style comparisons and sorting. `None` means unordered
/// (a NaN is involved).
pub(crate) fn order(left: &Value, right: &Value, symbol: &str) -> Exec<Option<Ordering>> {
    order_at(left, right, symbol, 0)
}

fn order_at(left: &Value, right: &Value, symbol: &str, depth: usize) -> Exec<Option<Ordering>> {
    if depth > MAX_WALK_DEPTH {
        return Err(Raised::new(
            "RecursionError",
            "maximum recursion depth exceeded in comparison",
        ));
    }
    if let (Some(a), Some(b)) = (num(left), num(right)) {
        return Ok(match (a, b) {
            (Num::I(x), Num::I(y)) => Some(x.cmp(&y)),
            _ => as_f64(a).partial_cmp(&as_f64(b)),
        });
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow().clone(), b.borrow().clone());
            for (x, y) in a.iter().zip(b.iter()) {
                if !x.equals(y) {
                    return order_at(x, y, symbol, depth + 1);
                }
            }
            Ok(Some(a.len().cmp(&b.len())))
        }
        _ => type_error(format!(
            "'{symbol}' not supported between instances of '{}' and '{}'",
            left.type_name(),
            right.type_name()
        )),
    }
}

pub(crate) fn is_identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
        (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
        (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
        (Value::Host(a), Value::Host(b)) => a == b,
        (Value::Opaque(a), Value::Opaque(b)) => a.ptr_eq(b),
        _ => false,
    }
}

pub(crate) fn contains(container: &Value, item: &Value) -> Exec<bool> {
    match container {
        Value::List(items) => Ok(items.borrow().iter().any(|v| v.equals(item))),
        Value::Dict(entries) => Ok(item
            .as_str()
            .is_some_and(|key| entries.borrow().contains_key(key))),
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(&**sub)),
            other => type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            )),
        },
        other => {
            if let Some(range) = as_range(other) {
                return Ok(item.as_int().is_some_and(|i| {
                    let offset = i128::from(i) - i128::from(range.start);
                    let step = i128::from(range.step);
                    offset % step == 0
                        && offset / step >= 0
                        && ((offset / step) as u64) < range.len()
                }));
            }
            type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))
        }
    }
}

pub(crate) fn compare(op: CmpOp, left: &Value, right: &Value) -> Exec<bool> {
    let ordered = |symbol: &str, test: fn(Ordering) -> bool| -> Exec<bool> {
        Ok(order(left, right, symbol)?.is_some_and(test))
    };
    match op {
        CmpOp::Eq => Ok(left.equals(right)),
        CmpOp::NotEq => Ok(!left.equals(right)),
        CmpOp::Lt => ordered("<", Ordering::is_lt),
        CmpOp::LtE => ordered("<=", Ordering::is_le),
        CmpOp::Gt => ordered(">", Ordering::is_gt),
        CmpOp::GtE => ordered(">=", Ordering::is_ge),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|found| !found),
        CmpOp::Is => Ok(is_identical(left, right)),
        CmpOp::IsNot => Ok(!is_identical(left, right)),
    }
}

fn index_of(index: &Value, len: usize, what: &str) -> Exec<Option<usize>> {
    let Some(i) = index.as_int().filter(|_| !matches!(index, Value::Float(_))) else {
        return type_error(format!(
            "{what} indices must be integers, not {}",
            index.type_name()
        ));
    };
    let len = len as i64;
    let i = if i < 0 { i + len } else { i };
    Ok((0..len).contains(&i).then_some(i as usize))
}

fn key_of<'v>(key: &'v Value) -> Exec<&'v str> {
    key.as_str().ok_or_else(|| {
        Raised::new(
            "TypeError",
            format!("dict keys must be str, not {}", key.type_name()),
        )
    })
}

pub(crate) fn get_item(obj: &Value, index: &Value) -> Exec<Value> {
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            match index_of(index, items.len(), "list")? {
                Some(i) => Ok(items[i].clone()),
                None => Err(Raised::new("IndexError", "list index out of range")),
            }
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            match index_of(index, chars.len(), "string")? {
                Some(i) => Ok(Value::str(chars[i].to_string())),
                None => Err(Raised::new("IndexError", "string index out of range")),
            }
        }
        Value::Dict(entries) => {
            let key = match index.as_str() {
                Some(key) => key,
                None => return Err(Raised::new("KeyError", index.repr())),
            };
            entries
                .borrow()
                .get(key)
                .cloned()
                .ok_or_else(|| Raised::new("KeyError", index.repr()))
        }
        other => {
            if let Some(range) = as_range(other) {
                let len = usize::try_from(range.len()).unwrap_or(usize::MAX);
                return match index_of(index, len, "range")? {
                    Some(i) => Ok(Value::Int(range.item(i as u64))),
                    None => Err(Raised::new("IndexError", "range object index out of range")),
                };
            }
            type_error(format!("'{}' object is not subscriptable", other.type_name()))
        }
    }
}

pub(crate) fn set_item(obj: &Value, index: Value, value: Value) -> Exec<()> {
    match obj {
        Value::List(items) => {
            let len = items.borrow().len();
            match index_of(&index, len, "list")? {
                Some(i) => {
                    items.borrow_mut()[i] = value;
                    Ok(())
                }
                None => Err(Raised::new("IndexError", "list assignment index out of range")),
            }
        }
        Value::Dict(entries) => {
            let key = key_of(&index)?.to_string();
            entries.borrow_mut().insert(key, value);
            Ok(())
        }
        other => type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        )),
    }
}

pub(crate) fn del_item(obj: &Value, index: &Value) -> Exec<()> {
    match obj {
        Value::List(items) => {
            let len = items.borrow().len();
            match index_of(index, len, "list")? {
                Some(i) => {
                    items.borrow_mut().remove(i);
                    Ok(())
                }
                None => Err(Raised::new("IndexError", "list assignment index out of range")),
            }
        }
        Value::Dict(entries) => {
            let key = key_of(index)?;
            match entries.borrow_mut().shift_remove(key) {
                Some(_) => Ok(()),
                None => Err(Raised::new("KeyError", index.repr())),
            }
        }
        other => type_error(format!(
            "'{}' object does not support item deletion",
            other.type_name()
        )),
    }
}

fn clamp(bound: Option<i64>, len: usize, default: usize) -> usize {
    match bound {
        None => default,
        Some(i) if i < 0 => (len as i64 + i).max(0) as usize,
        Some(i) => (i as usize).min(len),
    }
}

pub(crate) fn slice(obj: &Value, lower: Option<i64>, upper: Option<i64>) -> Exec<Value> {
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            let (lo, hi) = (clamp(lower, items.len(), 0), clamp(upper, items.len(), items.len()));
            Ok(Value::list(if lo < hi { items[lo..hi].to_vec() } else { Vec::new() }))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (lo, hi) = (clamp(lower, chars.len(), 0), clamp(upper, chars.len(), chars.len()));
            Ok(Value::str(if lo < hi {
                chars[lo..hi].iter().collect::<String>()
            } else {
                String::new()
            }))
        }
        other => type_error(format!("'{}' object is not subscriptable", other.type_name())),
    }
}

pub(crate) fn get_attr(value: Value, name: &str) -> Exec<Value> {
    if let Some(exc) = as_exception(&value) {
        if name == "args" {
            return Ok(Value::list(vec![Value::str(exc.message.as_str())]));
        }
    }
    if has_method(&value, name) {
        return Ok(method_value(value, name));
    }
    Err(Raised::new(
        "AttributeError",
        format!("'{}' object has no attribute '{name}'", value.type_name()),
    ))
}

/// `str()` of a value, aware of interpreter objects.
pub(crate) fn to_str(value: &Value) -> String {
    if let Some(exc) = as_exception(value) {
        return exc.message.clone();
    }
    if let Some(range) = as_range(value) {
        return range.repr();
    }
    value.to_string()
}

/// `repr()` of a value, aware of interpreter objects.
pub(crate) fn repr_of(value: &Value) -> String {
    if let Some(exc) = as_exception(value) {
        return exc.repr();
    }
    if let Some(range) = as_range(value) {
        return range.repr();
    }
    value.repr()
}

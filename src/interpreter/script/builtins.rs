//! Builtin functions, methods of the core types, and format specs.

use std::cmp::Ordering;

use indexmap::IndexMap;

use crate::sandbox::value::{format_float, Value};

use super::ast::BinOp;
use super::eval::{Exec, Machine, Raised};
use super::objects::{range_value, BuiltinFn, Kwargs};
use super::ops::{self, as_range, type_error, RangeObject};

/// Builtins installed into every interpreter.
pub(crate) const BUILTINS: &[(&str, BuiltinFn)] = &[
    ("print", print),
    ("len", len),
    ("str", str),
    ("repr", repr),
    ("int", int),
    ("float", float),
    ("bool", bool),
    ("list", list),
    ("tuple", list),
    ("dict", dict),
    ("range", range),
    ("abs", abs),
    ("min", min),
    ("max", max),
    ("sum", sum),
    ("sorted", sorted),
    ("reversed", reversed),
    ("enumerate", enumerate),
    ("zip", zip),
    ("round", round),
    ("any", any),
    ("all", all),
    ("type", type_of),
];

fn value_error<T>(message: impl Into<String>) -> Exec<T> {
    Err(Raised::new("ValueError", message))
}

fn expect_args(name: &str, args: &[Value], min: usize, max: usize) -> Exec<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {min}")
        } else if args.len() < min {
            format!("at least {min}")
        } else {
            format!("at most {max}")
        };
        return type_error(format!(
            "{name}() takes {expected} argument{} ({} given)",
            if expected.ends_with(" 1") { "" } else { "s" },
            args.len()
        ));
    }
    Ok(())
}

fn no_kwargs(name: &str, kwargs: &Kwargs) -> Exec<()> {
    match kwargs.first() {
        Some((key, _)) => type_error(format!("{name}() got an unexpected keyword argument '{key}'")),
        None => Ok(()),
    }
}

fn take_kwarg(kwargs: &mut Kwargs, key: &str) -> Option<Value> {
    let index = kwargs.iter().position(|(k, _)| k == key)?;
    Some(kwargs.remove(index).1)
}

fn int_arg(name: &str, value: &Value) -> Exec<i64> {
    match value {
        Value::Float(_) => type_error(format!("{name}: 'float' object cannot be interpreted as an integer")),
        other => match other.as_int() {
            Some(i) => Ok(i),
            None => type_error(format!(
                "{name}: '{}' object cannot be interpreted as an integer",
                other.type_name()
            )),
        },
    }
}

fn print(m: &mut Machine<'_>, args: Vec<Value>, mut kwargs: Kwargs) -> Exec<Value> {
    let text_kwarg = |value: Option<Value>, default: &str| -> Exec<String> {
        match value {
            None | Some(Value::None) => Ok(default.to_string()),
            Some(Value::Str(s)) => Ok(s.to_string()),
            Some(other) => type_error(format!("separator must be None or a string, not {}", other.type_name())),
        }
    };
    let sep = text_kwarg(take_kwarg(&mut kwargs, "sep"), " ")?;
    let end = text_kwarg(take_kwarg(&mut kwargs, "end"), "\n")?;
    no_kwargs("print", &kwargs)?;
    let mut line = args.iter().map(ops::to_str).collect::<Vec<_>>().join(&sep);
    line.push_str(&end);
    m.interp.output.write(&line);
    Ok(Value::None)
}

fn len(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("len", &kwargs)?;
    expect_args("len", &args, 1, 1)?;
    let n = match &args[0] {
        Value::Str(s) => s.chars().count() as u64,
        Value::List(items) => items.borrow().len() as u64,
        Value::Dict(entries) => entries.borrow().len() as u64,
        other => match as_range(other) {
            Some(range) => range.len(),
            None => return type_error(format!("object of type '{}' has no len()", other.type_name())),
        },
    };
    Ok(Value::Int(n as i64))
}

fn str(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("str", &kwargs)?;
    expect_args("str", &args, 0, 1)?;
    Ok(Value::str(args.first().map(ops::to_str).unwrap_or_default()))
}

fn repr(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("repr", &kwargs)?;
    expect_args("repr", &args, 1, 1)?;
    Ok(Value::str(ops::repr_of(&args[0])))
}

fn int(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("int", &kwargs)?;
    expect_args("int", &args, 0, 1)?;
    match args.first() {
        None => Ok(Value::Int(0)),
        Some(Value::Int(i)) => Ok(Value::Int(*i)),
        Some(Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
        Some(Value::Float(f)) => {
            if f.is_nan() {
                return value_error("cannot convert float NaN to integer");
            }
            let truncated = f.trunc();
            if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
                return Err(Raised::new("OverflowError", "cannot convert float to integer"));
            }
            Ok(Value::Int(truncated as i64))
        }
        Some(Value::Str(s)) => s
            .trim()
            .replace('_', "")
            .parse::<i64>()
            .map(Value::Int)
            .or_else(|_| value_error(format!("invalid literal for int() with base 10: {}", Value::Str(s.clone()).repr()))),
        Some(other) => type_error(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        )),
    }
}

fn float(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("float", &kwargs)?;
    expect_args("float", &args, 0, 1)?;
    match args.first() {
        None => Ok(Value::Float(0.0)),
        Some(Value::Float(f)) => Ok(Value::Float(*f)),
        Some(Value::Str(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .or_else(|_| value_error(format!("could not convert string to float: {}", Value::Str(s.clone()).repr()))),
        Some(other) => match other.as_int() {
            Some(i) => Ok(Value::Float(i as f64)),
            None => type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                other.type_name()
            )),
        },
    }
}

fn bool(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("bool", &kwargs)?;
    expect_args("bool", &args, 0, 1)?;
    Ok(Value::Bool(args.first().is_some_and(Value::is_truthy)))
}

fn list(m: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("list", &kwargs)?;
    expect_args("list", &args, 0, 1)?;
    match args.first() {
        None => Ok(Value::list(Vec::new())),
        Some(value) => Ok(Value::list(m.iterate(value)?)),
    }
}

fn dict(m: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    expect_args("dict", &args, 0, 1)?;
    let mut entries = IndexMap::new();
    match args.first() {
        None => {}
        Some(Value::Dict(source)) => entries.extend(source.borrow().iter().map(|(k, v)| (k.clone(), v.clone()))),
        Some(other) => {
            for pair in m.iterate(other)? {
                let pair = m.iterate(&pair)?;
                let [key, value] = <[Value; 2]>::try_from(pair).map_err(|pair| {
                    Raised::new(
                        "ValueError",
                        format!("dictionary update sequence element has length {}; 2 is required", pair.len()),
                    )
                })?;
                let Value::Str(key) = key else {
                    return type_error(format!("dict keys must be str, not {}", key.type_name()));
                };
                entries.insert(key.to_string(), value);
            }
        }
    }
    entries.extend(kwargs);
    Ok(Value::dict(entries))
}

fn range(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("range", &kwargs)?;
    expect_args("range", &args, 1, 3)?;
    let ints = args
        .iter()
        .map(|v| int_arg("range", v))
        .collect::<Exec<Vec<i64>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step, ..] => (*start, *stop, *step),
        [] => return type_error("range expected at least 1 argument, got 0"),
    };
    if step == 0 {
        return value_error("range() arg 3 must not be zero");
    }
    Ok(range_value(RangeObject { start, stop, step }))
}

fn abs(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("abs", &kwargs)?;
    expect_args("abs", &args, 1, 1)?;
    match &args[0] {
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => match other.as_int() {
            Some(i) => i
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| Raised::new("OverflowError", "integer result out of range")),
            None => type_error(format!("bad operand type for abs(): '{}'", other.type_name())),
        },
    }
}

/// Candidates for `min`/`max`: a single iterable or several arguments.
fn candidates(m: &Machine<'_>, name: &str, args: Vec<Value>) -> Exec<Vec<Value>> {
    let items = match args.len() {
        0 => return type_error(format!("{name} expected at least 1 argument, got 0")),
        1 => m.iterate(&args[0])?,
        _ => args,
    };
    if items.is_empty() {
        return value_error(format!("{name}() arg is an empty sequence"));
    }
    Ok(items)
}

fn extreme(m: &mut Machine<'_>, name: &str, args: Vec<Value>, mut kwargs: Kwargs, wanted: Ordering) -> Exec<Value> {
    let key = take_kwarg(&mut kwargs, "key").filter(|k| !matches!(k, Value::None));
    no_kwargs(name, &kwargs)?;
    let items = candidates(m, name, args)?;
    let keys = keys_for(m, &items, key.as_ref())?;
    let mut best = 0;
    for i in 1..items.len() {
        if ops::order(&keys[i], &keys[best], "<")? == Some(wanted) {
            best = i;
        }
    }
    Ok(items[best].clone())
}

fn min(m: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    extreme(m, "min", args, kwargs, Ordering::Less)
}

fn max(m: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    extreme(m, "max", args, kwargs, Ordering::Greater)
}

fn sum(m: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("sum", &kwargs)?;
    expect_args("sum", &args, 1, 2)?;
    let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
    if matches!(total, Value::Str(_)) {
        return type_error("sum() can't sum strings [use ''.join(seq) instead]");
    }
    for item in m.iterate(&args[0])? {
        m.charge()?;
        total = ops::binary(BinOp::Add, total, item, m.max_len())?;
    }
    Ok(total)
}

fn keys_for(m: &mut Machine<'_>, items: &[Value], key: Option<&Value>) -> Exec<Vec<Value>> {
    match key {
        None => Ok(items.to_vec()),
        Some(key) => items
            .iter()
            .map(|item| m.call_value(key, vec![item.clone()], Kwargs::new()))
            .collect(),
    }
}

/// Stable merge sort with a fallible comparison.
fn merge_sort(items: Vec<(Value, Value)>, reverse: bool) -> Exec<Vec<(Value, Value)>> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let mut left = items;
    let right = left.split_off(left.len() / 2);
    let left = merge_sort(left, reverse)?;
    let right = merge_sort(right, reverse)?;
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(a), Some(b)) = (left.peek(), right.peek()) {
        let ordering = ops::order(&a.0, &b.0, "<")?.unwrap_or(Ordering::Equal);
        let take_right = if reverse {
            ordering == Ordering::Less
        } else {
            ordering == Ordering::Greater
        };
        let next = if take_right { right.next() } else { left.next() };
        merged.extend(next);
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

pub(crate) fn sort_values(m: &mut Machine<'_>, items: Vec<Value>, mut kwargs: Kwargs, name: &str) -> Exec<Vec<Value>> {
    let key = take_kwarg(&mut kwargs, "key").filter(|k| !matches!(k, Value::None));
    let reverse = take_kwarg(&mut kwargs, "reverse").is_some_and(|v| v.is_truthy());
    no_kwargs(name, &kwargs)?;
    let keys = keys_for(m, &items, key.as_ref())?;
    let pairs = keys.into_iter().zip(items).collect();
    Ok(merge_sort(pairs, reverse)?.into_iter().map(|(_, v)| v).collect())
}

fn sorted(m: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    expect_args("sorted", &args, 1, 1)?;
    let items = m.iterate(&args[0])?;
    Ok(Value::list(sort_values(m, items, kwargs, "sorted")?))
}

fn reversed(m: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("reversed", &kwargs)?;
    expect_args("reversed", &args, 1, 1)?;
    let mut items = m.iterate(&args[0])?;
    items.reverse();
    Ok(Value::list(items))
}

fn enumerate(m: &mut Machine<'_>, args: Vec<Value>, mut kwargs: Kwargs) -> Exec<Value> {
    let start = take_kwarg(&mut kwargs, "start");
    no_kwargs("enumerate", &kwargs)?;
    expect_args("enumerate", &args, 1, 2)?;
    let start = match args.get(1).or(start.as_ref()) {
        Some(v) => int_arg("enumerate", v)?,
        None => 0,
    };
    let items = m.iterate(&args[0])?;
    Ok(Value::list(
        items
            .into_iter()
            .zip(start..)
            .map(|(item, i)| Value::list(vec![Value::Int(i), item]))
            .collect(),
    ))
}

fn zip(m: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("zip", &kwargs)?;
    let columns = args.iter().map(|a| m.iterate(a)).collect::<Exec<Vec<_>>>()?;
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    Ok(Value::list(
        (0..rows)
            .map(|i| Value::list(columns.iter().map(|c| c[i].clone()).collect()))
            .collect(),
    ))
}

fn round(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("round", &kwargs)?;
    expect_args("round", &args, 1, 2)?;
    let digits = match args.get(1) {
        None | Some(Value::None) => None,
        Some(v) => Some(int_arg("round", v)?),
    };
    match (&args[0], digits) {
        (Value::Float(f), None) => {
            let rounded = f.round_ties_even();
            if !rounded.is_finite() || rounded < i64::MIN as f64 || rounded >= i64::MAX as f64 {
                return Err(Raised::new("OverflowError", "cannot convert float to integer"));
            }
            Ok(Value::Int(rounded as i64))
        }
        (Value::Float(f), Some(digits)) => {
            let scale = 10f64.powi(digits.clamp(-308, 308) as i32);
            Ok(Value::Float((f * scale).round_ties_even() / scale))
        }
        (other, _) => match other.as_int() {
            Some(i) => Ok(Value::Int(i)),
            None => type_error(format!("type {} doesn't define __round__ method", other.type_name())),
        },
    }
}

fn any(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("any", &kwargs)?;
    expect_args("any", &args, 1, 1)?;
    Ok(Value::Bool(ops::items_of(&args[0])?.any(|v| v.is_truthy())))
}

fn all(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("all", &kwargs)?;
    expect_args("all", &args, 1, 1)?;
    Ok(Value::Bool(ops::items_of(&args[0])?.all(|v| v.is_truthy())))
}

fn type_of(_: &mut Machine<'_>, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
    no_kwargs("type", &kwargs)?;
    expect_args("type", &args, 1, 1)?;
    Ok(Value::str(args[0].type_name()))
}

const STR_METHODS: &[&str] = &[
    "upper", "lower", "strip", "lstrip", "rstrip", "split", "join", "replace", "startswith",
    "endswith", "find", "count", "isdigit", "isalpha", "title", "capitalize",
];
const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "remove", "index", "count", "clear", "copy", "reverse",
    "sort",
];
const DICT_METHODS: &[&str] = &[
    "get", "keys", "values", "items", "pop", "update", "setdefault", "clear", "copy",
];

pub(crate) fn has_method(value: &Value, name: &str) -> bool {
    let table = match value {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        _ => return false,
    };
    table.contains(&name)
}

pub(crate) fn call_method(
    m: &mut Machine<'_>,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Exec<Value> {
    match receiver {
        Value::Str(s) => {
            no_kwargs(name, &kwargs)?;
            str_method(m, s, name, args)
        }
        Value::List(items) if name == "sort" => {
            expect_args("sort", &args, 0, 0)?;
            let current = items.borrow().clone();
            let sorted = sort_values(m, current, kwargs, "sort")?;
            *items.borrow_mut() = sorted;
            Ok(Value::None)
        }
        Value::List(items) => {
            no_kwargs(name, &kwargs)?;
            list_method(m, items, name, args)
        }
        Value::Dict(entries) => dict_method(m, entries, name, args, kwargs),
        other => Err(Raised::new(
            "AttributeError",
            format!("'{}' object has no attribute '{name}'", other.type_name()),
        )),
    }
}

fn str_arg<'v>(method: &str, value: &'v Value) -> Exec<&'v str> {
    value
        .as_str()
        .map_or_else(|| type_error(format!("{method}() argument must be str, not {}", value.type_name())), Ok)
}

fn str_method(m: &mut Machine<'_>, s: &str, name: &str, args: Vec<Value>) -> Exec<Value> {
    let strip_chars = |args: &[Value]| -> Exec<Option<Vec<char>>> {
        match args.first() {
            None | Some(Value::None) => Ok(None),
            Some(v) => Ok(Some(str_arg(name, v)?.chars().collect())),
        }
    };
    Ok(match name {
        "upper" => Value::str(s.to_uppercase()),
        "lower" => Value::str(s.to_lowercase()),
        "title" => {
            let mut out = String::with_capacity(s.len());
            let mut boundary = true;
            for c in s.chars() {
                if boundary {
                    out.extend(c.to_uppercase());
                } else {
                    out.extend(c.to_lowercase());
                }
                boundary = !c.is_alphabetic();
            }
            Value::str(out)
        }
        "capitalize" => {
            let mut chars = s.chars();
            Value::str(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect::<String>(),
                None => String::new(),
            })
        }
        "strip" | "lstrip" | "rstrip" => {
            expect_args(name, &args, 0, 1)?;
            let chars = strip_chars(&args)?;
            let matches = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            Value::str(match name {
                "strip" => s.trim_matches(matches),
                "lstrip" => s.trim_start_matches(matches),
                _ => s.trim_end_matches(matches),
            })
        }
        "split" => {
            expect_args(name, &args, 0, 2)?;
            let limit = match args.get(1) {
                Some(v) => int_arg("split", v)?,
                None => -1,
            };
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::None) => {
                    let words = s.split_whitespace();
                    if limit < 0 {
                        words.map(Value::str).collect()
                    } else {
                        let mut out: Vec<Value> = Vec::new();
                        let mut rest = s.trim_start();
                        while !rest.is_empty() && (out.len() as i64) < limit {
                            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                            out.push(Value::str(&rest[..end]));
                            rest = rest[end..].trim_start();
                        }
                        if !rest.is_empty() {
                            out.push(Value::str(rest));
                        }
                        out
                    }
                }
                Some(sep) => {
                    let sep = str_arg("split", sep)?;
                    if sep.is_empty() {
                        return value_error("empty separator");
                    }
                    if limit < 0 {
                        s.split(sep).map(Value::str).collect()
                    } else {
                        s.splitn(limit as usize + 1, sep).map(Value::str).collect()
                    }
                }
            };
            Value::list(parts)
        }
        "join" => {
            expect_args(name, &args, 1, 1)?;
            let mut pieces = Vec::new();
            for item in m.iterate(&args[0])? {
                match item {
                    Value::Str(text) => pieces.push(text.to_string()),
                    other => {
                        return type_error(format!(
                            "sequence item {}: expected str instance, {} found",
                            pieces.len(),
                            other.type_name()
                        ))
                    }
                }
            }
            let joined = pieces.join(s);
            ops::check_len(joined.len() as u64, m.max_len())?;
            Value::str(joined)
        }
        "replace" => {
            expect_args(name, &args, 2, 2)?;
            let (old, new) = (str_arg(name, &args[0])?, str_arg(name, &args[1])?);
            let count = if old.is_empty() { s.chars().count() + 1 } else { s.matches(old).count() };
            ops::check_len((s.len() + count * new.len()) as u64, m.max_len())?;
            Value::str(s.replace(old, new))
        }
        "startswith" => {
            expect_args(name, &args, 1, 1)?;
            Value::Bool(s.starts_with(str_arg(name, &args[0])?))
        }
        "endswith" => {
            expect_args(name, &args, 1, 1)?;
            Value::Bool(s.ends_with(str_arg(name, &args[0])?))
        }
        "find" => {
            expect_args(name, &args, 1, 1)?;
            match s.find(str_arg(name, &args[0])?) {
                Some(byte) => Value::Int(s[..byte].chars().count() as i64),
                None => Value::Int(-1),
            }
        }
        "count" => {
            expect_args(name, &args, 1, 1)?;
            let sub = str_arg(name, &args[0])?;
            if sub.is_empty() {
                Value::Int(s.chars().count() as i64 + 1)
            } else {
                Value::Int(s.matches(sub).count() as i64)
            }
        }
        "isdigit" => Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())),
        "isalpha" => Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic)),
        _ => {
            return Err(Raised::new(
                "AttributeError",
                format!("'str' object has no attribute '{name}'"),
            ))
        }
    })
}

fn list_method(m: &mut Machine<'_>, items: &crate::sandbox::value::List, name: &str, args: Vec<Value>) -> Exec<Value> {
    let position = |value: &Value| items.borrow().iter().position(|v| v.equals(value));
    Ok(match name {
        "append" => {
            expect_args(name, &args, 1, 1)?;
            ops::check_len(items.borrow().len() as u64 + 1, m.max_len())?;
            let mut args = args;
            items.borrow_mut().extend(args.pop());
            Value::None
        }
        "extend" => {
            expect_args(name, &args, 1, 1)?;
            let extra = m.iterate(&args[0])?;
            ops::check_len((items.borrow().len() + extra.len()) as u64, m.max_len())?;
            items.borrow_mut().extend(extra);
            Value::None
        }
        "insert" => {
            expect_args(name, &args, 2, 2)?;
            let len = items.borrow().len() as i64;
            let index = int_arg("insert", &args[0])?;
            let index = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.borrow_mut().insert(index as usize, args[1].clone());
            Value::None
        }
        "pop" => {
            expect_args(name, &args, 0, 1)?;
            let len = items.borrow().len() as i64;
            if len == 0 {
                return Err(Raised::new("IndexError", "pop from empty list"));
            }
            let index = match args.first() {
                Some(v) => int_arg("pop", v)?,
                None => -1,
            };
            let index = if index < 0 { index + len } else { index };
            if !(0..len).contains(&index) {
                return Err(Raised::new("IndexError", "pop index out of range"));
            }
            items.borrow_mut().remove(index as usize)
        }
        "remove" => {
            expect_args(name, &args, 1, 1)?;
            match position(&args[0]) {
                Some(i) => {
                    items.borrow_mut().remove(i);
                    Value::None
                }
                None => return value_error("list.remove(x): x not in list"),
            }
        }
        "index" => {
            expect_args(name, &args, 1, 1)?;
            match position(&args[0]) {
                Some(i) => Value::Int(i as i64),
                None => return value_error(format!("{} is not in list", ops::repr_of(&args[0]))),
            }
        }
        "count" => {
            expect_args(name, &args, 1, 1)?;
            Value::Int(items.borrow().iter().filter(|v| v.equals(&args[0])).count() as i64)
        }
        "clear" => {
            items.borrow_mut().clear();
            Value::None
        }
        "copy" => Value::list(items.borrow().clone()),
        "reverse" => {
            items.borrow_mut().reverse();
            Value::None
        }
        _ => {
            return Err(Raised::new(
                "AttributeError",
                format!("'list' object has no attribute '{name}'"),
            ))
        }
    })
}

fn dict_method(
    m: &mut Machine<'_>,
    entries: &crate::sandbox::value::Dict,
    name: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Exec<Value> {
    if name != "update" {
        no_kwargs(name, &kwargs)?;
    }
    let key_arg = |value: &Value| -> Exec<String> {
        match value.as_str() {
            Some(key) => Ok(key.to_string()),
            None => type_error(format!("dict keys must be str, not {}", value.type_name())),
        }
    };
    Ok(match name {
        "get" => {
            expect_args(name, &args, 1, 2)?;
            let found = args[0].as_str().and_then(|k| entries.borrow().get(k).cloned());
            found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None))
        }
        "keys" => Value::list(entries.borrow().keys().map(|k| Value::str(k.as_str())).collect()),
        "values" => Value::list(entries.borrow().values().cloned().collect()),
        "items" => Value::list(
            entries
                .borrow()
                .iter()
                .map(|(k, v)| Value::list(vec![Value::str(k.as_str()), v.clone()]))
                .collect(),
        ),
        "pop" => {
            expect_args(name, &args, 1, 2)?;
            let removed = args[0].as_str().and_then(|k| entries.borrow_mut().shift_remove(k));
            match (removed, args.get(1)) {
                (Some(value), _) => value,
                (None, Some(default)) => default.clone(),
                (None, None) => return Err(Raised::new("KeyError", ops::repr_of(&args[0]))),
            }
        }
        "setdefault" => {
            expect_args(name, &args, 1, 2)?;
            let key = key_arg(&args[0])?;
            let default = args.get(1).cloned().unwrap_or(Value::None);
            entries.borrow_mut().entry(key).or_insert(default).clone()
        }
        "update" => {
            expect_args(name, &args, 0, 1)?;
            let mut updates = Vec::new();
            match args.first() {
                None => {}
                Some(Value::Dict(other)) => {
                    updates.extend(other.borrow().iter().map(|(k, v)| (k.clone(), v.clone())))
                }
                Some(other) => {
                    for pair in m.iterate(other)? {
                        let pair = m.iterate(&pair)?;
                        if pair.len() != 2 {
                            return value_error(format!(
                                "dictionary update sequence element has length {}; 2 is required",
                                pair.len()
                            ));
                        }
                        updates.push((key_arg(&pair[0])?, pair[1].clone()));
                    }
                }
            }
            updates.extend(kwargs);
            entries.borrow_mut().extend(updates);
            Value::None
        }
        "clear" => {
            entries.borrow_mut().clear();
            Value::None
        }
        "copy" => Value::dict(entries.borrow().clone()),
        _ => {
            return Err(Raised::new(
                "AttributeError",
                format!("'dict' object has no attribute '{name}'"),
            ))
        }
    })
}

struct FormatSpec {
    fill: char,
    align: Option<char>,
    sign: bool,
    width: usize,
    grouping: bool,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> Option<FormatSpec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;
    let mut parsed = FormatSpec {
        fill: ' ',
        align: None,
        sign: false,
        width: 0,
        grouping: false,
        precision: None,
        kind: None,
    };
    let is_align = |c: char| matches!(c, '<' | '>' | '^');
    if chars.len() >= 2 && is_align(chars[1]) {
        parsed.fill = chars[0];
        parsed.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        parsed.align = Some(chars[0]);
        i = 1;
    }
    if chars.get(i) == Some(&'+') {
        parsed.sign = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') && parsed.align.is_none() {
        parsed.fill = '0';
        parsed.align = Some('>');
        i += 1;
    }
    let digits = |i: &mut usize| -> Option<usize> {
        let start = *i;
        while chars.get(*i).is_some_and(char::is_ascii_digit) {
            *i += 1;
        }
        if start == *i {
            return None;
        }
        chars[start..*i].iter().collect::<String>().parse().ok()
    };
    parsed.width = digits(&mut i).unwrap_or(0);
    if chars.get(i) == Some(&',') {
        parsed.grouping = true;
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        parsed.precision = Some(digits(&mut i)?);
    }
    if let Some(&c) = chars.get(i) {
        if !matches!(c, 'f' | 'd' | 's' | '%') {
            return None;
        }
        parsed.kind = Some(c);
        i += 1;
    }
    (i == chars.len()).then_some(parsed)
}

fn group_thousands(digits: &str) -> String {
    let (sign, digits) = match digits.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", digits),
    };
    let (int_part, frac) = match digits.find('.') {
        Some(dot) => digits.split_at(dot),
        None => (digits, ""),
    };
    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{sign}{grouped}{frac}")
}

/// Apply an f-string format spec such as `>8.2f`.
pub(crate) fn format_value(value: &Value, spec: &str) -> Exec<String> {
    let Some(spec) = parse_spec(spec) else {
        return value_error(format!("Invalid format specifier '{spec}'"));
    };
    let number = match value {
        Value::Float(f) => Some(*f),
        Value::Int(i) => Some(*i as f64),
        _ => None,
    };
    let unknown = || value_error(format!(
        "Unknown format code '{}' for object of type '{}'",
        spec.kind.unwrap_or('s'),
        value.type_name()
    ));
    let mut text = match (spec.kind, number) {
        (Some('f'), Some(f)) => format!("{f:.*}", spec.precision.unwrap_or(6)),
        (Some('%'), Some(f)) => format!("{:.*}%", spec.precision.unwrap_or(6), f * 100.0),
        (Some('d'), _) => match value {
            Value::Int(i) => i.to_string(),
            _ => return unknown(),
        },
        (Some('s'), None) | (None, None) => {
            let text = ops::to_str(value);
            match spec.precision {
                Some(p) => text.chars().take(p).collect(),
                None => text,
            }
        }
        (None, Some(f)) => match (value, spec.precision) {
            (_, Some(p)) => format!("{f:.p$}"),
            (Value::Int(i), None) => i.to_string(),
            _ => format_float(f),
        },
        _ => return unknown(),
    };
    if spec.grouping && number.is_some() {
        text = group_thousands(&text);
    }
    if spec.sign && number.is_some_and(|f| f >= 0.0) {
        text.insert(0, '+');
    }
    let len = text.chars().count();
    if len >= spec.width {
        return Ok(text);
    }
    let pad = spec.width - len;
    let fill = |n: usize| std::iter::repeat(spec.fill).take(n).collect::<String>();
    let align = spec.align.unwrap_or(if number.is_some() { '>' } else { '<' });
    Ok(match align {
        '>' if spec.fill == '0' && text.starts_with(['-', '+']) => {
            let (sign, rest) = text.split_at(1);
            format!("{sign}{}{rest}", fill(pad))
        }
        '>' => format!("{}{text}", fill(pad)),
        '^' => format!("{}{text}{}", fill(pad / 2), fill(pad - pad / 2)),
        _ => format!("{text}{}", fill(pad)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_specs() {
        assert_eq!(format_value(&Value::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(format_value(&Value::Int(42), ">5").unwrap(), "   42");
        assert_eq!(format_value(&Value::str("ab"), "*^6").unwrap(), "**ab**");
        assert_eq!(format_value(&Value::Int(-7), "04d").unwrap(), "-007");
        assert_eq!(format_value(&Value::Int(1234567), ",").unwrap(), "1,234,567");
        assert_eq!(format_value(&Value::Float(0.25), ".0%").unwrap(), "25%");
    }

    #[test]
    fn test_invalid_format_spec() {
        let err = format_value(&Value::Int(1), "q").unwrap_err();
        assert_eq!(&*err.exc.class, "ValueError");
        let err = format_value(&Value::str("x"), "d").unwrap_err();
        assert_eq!(err.exc.message, "Unknown format code 'd' for object of type 'str'");
    }

    #[test]
    fn test_method_tables() {
        assert!(has_method(&Value::str("x"), "upper"));
        assert!(has_method(&Value::list(Vec::new()), "append"));
        assert!(!has_method(&Value::Int(1), "append"));
    }
}

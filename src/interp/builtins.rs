//! Builtin functions, container methods and the bundled `math` and `time`
//! modules.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::error::RuntimeError;
use super::value::{new_scope, range_item, range_len, BoundMethod, Dict, Module, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Range,
    Str,
    Int,
    Float,
    Bool,
    List,
    Tuple,
    Dict,
    Abs,
    Min,
    Max,
    Sum,
    Repr,
    Type,
    Sorted,
    Reversed,
    Enumerate,
    Zip,
    Isinstance,
    Round,
    MathSqrt,
    MathFloor,
    MathCeil,
    TimeSleep,
    TimeTime,
}

const EXCEPTION_TYPES: &[&str] = &[
    "Exception",
    "ArithmeticError",
    "AssertionError",
    "AttributeError",
    "IndexError",
    "KeyError",
    "LookupError",
    "NameError",
    "OverflowError",
    "RecursionError",
    "RuntimeError",
    "TypeError",
    "ValueError",
    "ZeroDivisionError",
    "ModuleNotFoundError",
    "ImportError",
    "NotImplementedError",
    "StopIteration",
];

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Range => "range",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Bool => "bool",
            Builtin::List => "list",
            Builtin::Tuple => "tuple",
            Builtin::Dict => "dict",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Repr => "repr",
            Builtin::Type => "type",
            Builtin::Sorted => "sorted",
            Builtin::Reversed => "reversed",
            Builtin::Enumerate => "enumerate",
            Builtin::Zip => "zip",
            Builtin::Isinstance => "isinstance",
            Builtin::Round => "round",
            Builtin::MathSqrt => "sqrt",
            Builtin::MathFloor => "floor",
            Builtin::MathCeil => "ceil",
            Builtin::TimeSleep => "sleep",
            Builtin::TimeTime => "time",
        }
    }
}

/// Resolve a name that is not bound in any scope.
pub fn lookup(name: &str) -> Option<Value> {
    let builtin = match name {
        "print" => Builtin::Print,
        "len" => Builtin::Len,
        "range" => Builtin::Range,
        "str" => Builtin::Str,
        "int" => Builtin::Int,
        "float" => Builtin::Float,
        "bool" => Builtin::Bool,
        "list" => Builtin::List,
        "tuple" => Builtin::Tuple,
        "dict" => Builtin::Dict,
        "abs" => Builtin::Abs,
        "min" => Builtin::Min,
        "max" => Builtin::Max,
        "sum" => Builtin::Sum,
        "repr" => Builtin::Repr,
        "type" => Builtin::Type,
        "sorted" => Builtin::Sorted,
        "reversed" => Builtin::Reversed,
        "enumerate" => Builtin::Enumerate,
        "zip" => Builtin::Zip,
        "isinstance" => Builtin::Isinstance,
        "round" => Builtin::Round,
        _ => {
            return EXCEPTION_TYPES
                .iter()
                .find(|kind| **kind == name)
                .map(|kind| Value::ExceptionType(Rc::from(*kind)));
        }
    };
    Some(Value::Builtin(builtin))
}

/// Bundled modules importable by name.
pub fn builtin_module(name: &str) -> Option<Value> {
    let globals = new_scope();
    {
        let mut scope = globals.borrow_mut();
        match name {
            "math" => {
                scope.insert("pi".into(), Value::Float(std::f64::consts::PI));
                scope.insert("e".into(), Value::Float(std::f64::consts::E));
                scope.insert("sqrt".into(), Value::Builtin(Builtin::MathSqrt));
                scope.insert("floor".into(), Value::Builtin(Builtin::MathFloor));
                scope.insert("ceil".into(), Value::Builtin(Builtin::MathCeil));
            }
            "time" => {
                scope.insert("sleep".into(), Value::Builtin(Builtin::TimeSleep));
                scope.insert("time".into(), Value::Builtin(Builtin::TimeTime));
            }
            _ => return None,
        }
        scope.insert("__name__".into(), Value::str(name));
    }
    Some(Value::Module(Rc::new(Module {
        name: name.to_string(),
        globals,
    })))
}

/// Whether an exception of `kind` is caught by a handler naming `handler`.
pub fn exception_matches(kind: &str, handler: &str) -> bool {
    if handler == kind || handler == "Exception" {
        return true;
    }
    match handler {
        "LookupError" => matches!(kind, "IndexError" | "KeyError"),
        "ArithmeticError" => matches!(kind, "ZeroDivisionError" | "OverflowError"),
        "ImportError" => kind == "ModuleNotFoundError",
        "RuntimeError" => matches!(kind, "RecursionError" | "NotImplementedError"),
        _ => false,
    }
}

/// Materialize an iterable into its items.
pub fn iterate(value: &Value) -> Result<Vec<Value>, RuntimeError> {
    match value {
        Value::List(items) => Ok(items.borrow().clone()),
        Value::Tuple(items) => Ok(items.to_vec()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
        Value::Dict(dict) => Ok(dict.borrow().keys()),
        Value::Range { start, step, .. } => {
            let len = range_len(value)?;
            Ok((0..len).map(|i| Value::Int(range_item(*start, *step, i))).collect())
        }
        other => Err(RuntimeError::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), RuntimeError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(RuntimeError::type_error(format!(
            "{name}() takes {expected} arguments ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn int_arg(name: &str, value: &Value) -> Result<i64, RuntimeError> {
    value.as_int().ok_or_else(|| {
        RuntimeError::type_error(format!(
            "{name}() argument must be int, not '{}'",
            value.type_name()
        ))
    })
}

fn float_arg(name: &str, value: &Value) -> Result<f64, RuntimeError> {
    value.as_float().ok_or_else(|| {
        RuntimeError::type_error(format!(
            "must be real number, not {} (in {name})",
            value.type_name()
        ))
    })
}

fn sort_values(items: &mut [Value]) -> Result<(), RuntimeError> {
    let mut failure = None;
    items.sort_by(|a, b| match a.py_cmp(b) {
        Ok(ordering) => ordering,
        Err(err) => {
            failure.get_or_insert(err);
            Ordering::Equal
        }
    });
    failure.map_or(Ok(()), Err)
}

fn extreme(name: &str, args: Vec<Value>, want: Ordering) -> Result<Value, RuntimeError> {
    let items = if args.len() == 1 {
        iterate(&args[0])?
    } else {
        args
    };
    let mut iter = items.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| RuntimeError::value_error(format!("{name}() arg is an empty sequence")))?;
    for item in iter {
        if item.py_cmp(&best)? == want {
            best = item;
        }
    }
    Ok(best)
}

/// Call a builtin other than `print`, which needs the interpreter's output.
pub fn call(builtin: Builtin, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let name = builtin.name();
    match builtin {
        Builtin::Print => Ok(Value::None),
        Builtin::Len => {
            arity(name, &args, 1, 1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count() as i64,
                Value::List(items) => items.borrow().len() as i64,
                Value::Tuple(items) => items.len() as i64,
                Value::Dict(dict) => dict.borrow().len() as i64,
                range @ Value::Range { .. } => range_len(range)?,
                other => {
                    return Err(RuntimeError::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Int(len))
        }
        Builtin::Range => {
            arity(name, &args, 1, 3)?;
            let ints = args
                .iter()
                .map(|a| int_arg(name, a))
                .collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => unreachable!("arity checked"),
            };
            if step == 0 {
                return Err(RuntimeError::value_error("range() arg 3 must not be zero"));
            }
            Ok(Value::Range { start, stop, step })
        }
        Builtin::Str => {
            arity(name, &args, 0, 1)?;
            Ok(Value::str(args.first().map(Value::to_str).unwrap_or_default()))
        }
        Builtin::Repr => {
            arity(name, &args, 1, 1)?;
            Ok(Value::str(args[0].repr()))
        }
        Builtin::Int => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Int(0)),
                Some(Value::Float(f)) => {
                    if f.is_finite() {
                        Ok(Value::Int(f.trunc() as i64))
                    } else {
                        Err(RuntimeError::new(
                            "OverflowError",
                            "cannot convert float infinity or NaN to integer",
                        ))
                    }
                }
                Some(Value::Str(s)) => s.trim().replace('_', "").parse().map(Value::Int).map_err(|_| {
                    RuntimeError::value_error(format!(
                        "invalid literal for int() with base 10: {}",
                        Value::Str(s.clone()).repr()
                    ))
                }),
                Some(other) => other.as_int().map(Value::Int).ok_or_else(|| {
                    RuntimeError::type_error(format!(
                        "int() argument must be a string or a number, not '{}'",
                        other.type_name()
                    ))
                }),
            }
        }
        Builtin::Float => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => {
                    let text = s.trim().to_ascii_lowercase();
                    let parsed = match text.as_str() {
                        "inf" | "infinity" => Some(f64::INFINITY),
                        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
                        "nan" => Some(f64::NAN),
                        _ => text.parse().ok(),
                    };
                    parsed.map(Value::Float).ok_or_else(|| {
                        RuntimeError::value_error(format!(
                            "could not convert string to float: {}",
                            Value::Str(s.clone()).repr()
                        ))
                    })
                }
                Some(other) => float_arg(name, other).map(Value::Float),
            }
        }
        Builtin::Bool => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        Builtin::List => {
            arity(name, &args, 0, 1)?;
            let items = match args.first() {
                Some(v) => iterate(v)?,
                None => Vec::new(),
            };
            Ok(Value::list(items))
        }
        Builtin::Tuple => {
            arity(name, &args, 0, 1)?;
            let items = match args.first() {
                Some(v) => iterate(v)?,
                None => Vec::new(),
            };
            Ok(Value::tuple(items))
        }
        Builtin::Dict => {
            arity(name, &args, 0, 1)?;
            let mut dict = Dict::new();
            if let Some(source) = args.first() {
                if let Value::Dict(other) = source {
                    for (k, v) in other.borrow().entries() {
                        dict.insert(k.clone(), v.clone())?;
                    }
                } else {
                    for pair in iterate(source)? {
                        let kv = iterate(&pair)?;
                        if kv.len() != 2 {
                            return Err(RuntimeError::value_error(
                                "dictionary update sequence element has wrong length",
                            ));
                        }
                        let mut kv = kv.into_iter();
                        if let (Some(k), Some(v)) = (kv.next(), kv.next()) {
                            dict.insert(k, v)?;
                        }
                    }
                }
            }
            Ok(Value::Dict(Rc::new(RefCell::new(dict))))
        }
        Builtin::Abs => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => {
                    let i = int_arg(name, other)?;
                    i.checked_abs().map(Value::Int).ok_or_else(RuntimeError::overflow)
                }
            }
        }
        Builtin::Min => extreme(name, args, Ordering::Less),
        Builtin::Max => extreme(name, args, Ordering::Greater),
        Builtin::Sum => {
            arity(name, &args, 1, 2)?;
            let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
            for item in iterate(&args[0])? {
                total = super::eval::binary_op(super::ast::BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        Builtin::Type => {
            arity(name, &args, 1, 1)?;
            Ok(Value::str(format!("<class '{}'>", args[0].type_name())))
        }
        Builtin::Sorted => {
            arity(name, &args, 1, 1)?;
            let mut items = iterate(&args[0])?;
            sort_values(&mut items)?;
            Ok(Value::list(items))
        }
        Builtin::Reversed => {
            arity(name, &args, 1, 1)?;
            let mut items = iterate(&args[0])?;
            items.reverse();
            Ok(Value::list(items))
        }
        Builtin::Enumerate => {
            arity(name, &args, 1, 2)?;
            let start = match args.get(1) {
                Some(v) => int_arg(name, v)?,
                None => 0,
            };
            let items = iterate(&args[0])?
                .into_iter()
                .enumerate()
                .map(|(i, v)| Value::tuple(vec![Value::Int(start + i as i64), v]))
                .collect();
            Ok(Value::list(items))
        }
        Builtin::Zip => {
            let columns = args.iter().map(iterate).collect::<Result<Vec<_>, _>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            let rows = (0..len)
                .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                .collect();
            Ok(Value::list(rows))
        }
        Builtin::Isinstance => {
            arity(name, &args, 2, 2)?;
            let candidates = match &args[1] {
                Value::Tuple(items) => items.to_vec(),
                other => vec![other.clone()],
            };
            let matched = candidates.iter().any(|c| match c {
                Value::Builtin(b) => match (b, &args[0]) {
                    (Builtin::Int, Value::Int(_) | Value::Bool(_)) => true,
                    (Builtin::Float, Value::Float(_)) => true,
                    (Builtin::Str, Value::Str(_)) => true,
                    (Builtin::Bool, Value::Bool(_)) => true,
                    (Builtin::List, Value::List(_)) => true,
                    (Builtin::Tuple, Value::Tuple(_)) => true,
                    (Builtin::Dict, Value::Dict(_)) => true,
                    _ => false,
                },
                Value::ExceptionType(handler) => match &args[0] {
                    Value::Exception(exc) => exception_matches(&exc.kind, handler),
                    _ => false,
                },
                _ => false,
            });
            Ok(Value::Bool(matched))
        }
        Builtin::Round => {
            arity(name, &args, 1, 2)?;
            let digits = match args.get(1) {
                Some(Value::None) | None => None,
                Some(v) => Some(int_arg(name, v)?),
            };
            match (&args[0], digits) {
                (Value::Float(f), None) => Ok(Value::Int(round_half_even(*f) as i64)),
                (Value::Float(f), Some(n)) => {
                    let factor = 10f64.powi(n as i32);
                    Ok(Value::Float(round_half_even(f * factor) / factor))
                }
                (other, _) => Ok(Value::Int(int_arg(name, other)?)),
            }
        }
        Builtin::MathSqrt => {
            arity(name, &args, 1, 1)?;
            let x = float_arg(name, &args[0])?;
            if x < 0.0 {
                return Err(RuntimeError::value_error("math domain error"));
            }
            Ok(Value::Float(x.sqrt()))
        }
        Builtin::MathFloor | Builtin::MathCeil => {
            arity(name, &args, 1, 1)?;
            if let Some(i) = args[0].as_int() {
                return Ok(Value::Int(i));
            }
            let x = float_arg(name, &args[0])?;
            let rounded = if builtin == Builtin::MathFloor {
                x.floor()
            } else {
                x.ceil()
            };
            if !rounded.is_finite() {
                return Err(RuntimeError::new(
                    "OverflowError",
                    "cannot convert float infinity to integer",
                ));
            }
            Ok(Value::Int(rounded as i64))
        }
        Builtin::TimeSleep => {
            arity(name, &args, 1, 1)?;
            let secs = float_arg(name, &args[0])?;
            if secs < 0.0 {
                return Err(RuntimeError::value_error("sleep length must be non-negative"));
            }
            std::thread::sleep(Duration::from_secs_f64(secs));
            Ok(Value::None)
        }
        Builtin::TimeTime => {
            arity(name, &args, 0, 0)?;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default();
            Ok(Value::Float(now))
        }
    }
}

fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 && rounded % 2.0 != 0.0 {
        rounded - x.signum()
    } else {
        rounded
    }
}

/// Resolve `value.name` for container methods.
pub fn method(receiver: &Value, name: &str) -> Option<Value> {
    let known = match receiver {
        Value::List(_) => matches!(
            name,
            "append" | "pop" | "insert" | "extend" | "sort" | "reverse" | "index" | "count" | "clear"
        ),
        Value::Dict(_) => matches!(
            name,
            "get" | "keys" | "values" | "items" | "pop" | "update" | "clear" | "setdefault"
        ),
        Value::Str(_) => matches!(
            name,
            "upper"
                | "lower"
                | "strip"
                | "split"
                | "join"
                | "replace"
                | "startswith"
                | "endswith"
                | "find"
                | "count"
        ),
        _ => false,
    };
    known.then(|| {
        Value::Method(Rc::new(BoundMethod {
            receiver: receiver.clone(),
            name: Rc::from(name),
        }))
    })
}

fn str_arg<'a>(method: &str, value: &'a Value) -> Result<&'a str, RuntimeError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(RuntimeError::type_error(format!(
            "{method}() argument must be str, not {}",
            other.type_name()
        ))),
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { index + len } else { index };
    (0..len).contains(&idx).then_some(idx as usize)
}

/// Invoke a bound container method.
pub fn call_method(bound: &BoundMethod, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let name = bound.name.as_ref();
    match &bound.receiver {
        Value::List(items) => match name {
            "append" => {
                arity(name, &args, 1, 1)?;
                items.borrow_mut().extend(args);
                Ok(Value::None)
            }
            "extend" => {
                arity(name, &args, 1, 1)?;
                let extra = iterate(&args[0])?;
                items.borrow_mut().extend(extra);
                Ok(Value::None)
            }
            "insert" => {
                arity(name, &args, 2, 2)?;
                let mut list = items.borrow_mut();
                let len = list.len() as i64;
                let index = int_arg(name, &args[0])?;
                let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
                list.insert(at as usize, args[1].clone());
                Ok(Value::None)
            }
            "pop" => {
                arity(name, &args, 0, 1)?;
                let mut list = items.borrow_mut();
                if list.is_empty() {
                    return Err(RuntimeError::new("IndexError", "pop from empty list"));
                }
                let index = match args.first() {
                    Some(v) => int_arg(name, v)?,
                    None => -1,
                };
                let at = normalize_index(index, list.len())
                    .ok_or_else(|| RuntimeError::new("IndexError", "pop index out of range"))?;
                Ok(list.remove(at))
            }
            "sort" => {
                arity(name, &args, 0, 0)?;
                let mut sorted = items.borrow().clone();
                sort_values(&mut sorted)?;
                *items.borrow_mut() = sorted;
                Ok(Value::None)
            }
            "reverse" => {
                arity(name, &args, 0, 0)?;
                items.borrow_mut().reverse();
                Ok(Value::None)
            }
            "index" => {
                arity(name, &args, 1, 1)?;
                items
                    .borrow()
                    .iter()
                    .position(|v| v.py_eq(&args[0]))
                    .map(|i| Value::Int(i as i64))
                    .ok_or_else(|| {
                        RuntimeError::value_error(format!("{} is not in list", args[0].repr()))
                    })
            }
            "count" => {
                arity(name, &args, 1, 1)?;
                let n = items.borrow().iter().filter(|v| v.py_eq(&args[0])).count();
                Ok(Value::Int(n as i64))
            }
            "clear" => {
                items.borrow_mut().clear();
                Ok(Value::None)
            }
            _ => Err(no_attribute(&bound.receiver, name)),
        },
        Value::Dict(dict) => match name {
            "get" => {
                arity(name, &args, 1, 2)?;
                let found = dict.borrow().get(&args[0]).cloned();
                Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
            }
            "keys" => Ok(Value::list(dict.borrow().keys())),
            "values" => Ok(Value::list(dict.borrow().values())),
            "items" => Ok(Value::list(
                dict.borrow()
                    .entries()
                    .iter()
                    .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                    .collect(),
            )),
            "pop" => {
                arity(name, &args, 1, 2)?;
                let removed = dict.borrow_mut().remove(&args[0]);
                match (removed, args.get(1)) {
                    (Some(v), _) => Ok(v),
                    (None, Some(default)) => Ok(default.clone()),
                    (None, None) => Err(RuntimeError::new("KeyError", args[0].repr())),
                }
            }
            "setdefault" => {
                arity(name, &args, 1, 2)?;
                let existing = dict.borrow().get(&args[0]).cloned();
                match existing {
                    Some(v) => Ok(v),
                    None => {
                        let default = args.get(1).cloned().unwrap_or(Value::None);
                        dict.borrow_mut().insert(args[0].clone(), default.clone())?;
                        Ok(default)
                    }
                }
            }
            "update" => {
                arity(name, &args, 1, 1)?;
                let Value::Dict(other) = &args[0] else {
                    return Err(RuntimeError::type_error("update() argument must be a dict"));
                };
                let entries = other.borrow().entries().to_vec();
                let mut target = dict.borrow_mut();
                for (k, v) in entries {
                    target.insert(k, v)?;
                }
                Ok(Value::None)
            }
            "clear" => {
                *dict.borrow_mut() = Dict::new();
                Ok(Value::None)
            }
            _ => Err(no_attribute(&bound.receiver, name)),
        },
        Value::Str(s) => match name {
            "upper" => Ok(Value::str(s.to_uppercase())),
            "lower" => Ok(Value::str(s.to_lowercase())),
            "strip" => Ok(Value::str(s.trim())),
            "split" => {
                arity(name, &args, 0, 1)?;
                let parts: Vec<Value> = match args.first() {
                    Some(Value::None) | None => s.split_whitespace().map(Value::str).collect(),
                    Some(sep) => {
                        let sep = str_arg(name, sep)?;
                        if sep.is_empty() {
                            return Err(RuntimeError::value_error("empty separator"));
                        }
                        s.split(sep).map(Value::str).collect()
                    }
                };
                Ok(Value::list(parts))
            }
            "join" => {
                arity(name, &args, 1, 1)?;
                let pieces = iterate(&args[0])?
                    .iter()
                    .map(|v| str_arg(name, v).map(str::to_string))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::str(pieces.join(&**s)))
            }
            "replace" => {
                arity(name, &args, 2, 2)?;
                Ok(Value::str(
                    s.replace(str_arg(name, &args[0])?, str_arg(name, &args[1])?),
                ))
            }
            "startswith" => {
                arity(name, &args, 1, 1)?;
                Ok(Value::Bool(s.starts_with(str_arg(name, &args[0])?)))
            }
            "endswith" => {
                arity(name, &args, 1, 1)?;
                Ok(Value::Bool(s.ends_with(str_arg(name, &args[0])?)))
            }
            "find" => {
                arity(name, &args, 1, 1)?;
                let needle = str_arg(name, &args[0])?;
                Ok(Value::Int(
                    s.find(needle)
                        .map(|byte| s[..byte].chars().count() as i64)
                        .unwrap_or(-1),
                ))
            }
            "count" => {
                arity(name, &args, 1, 1)?;
                Ok(Value::Int(s.matches(str_arg(name, &args[0])?).count() as i64))
            }
            _ => Err(no_attribute(&bound.receiver, name)),
        },
        other => Err(no_attribute(other, name)),
    }
}

pub fn no_attribute(value: &Value, name: &str) -> RuntimeError {
    RuntimeError::new(
        "AttributeError",
        format!("'{}' object has no attribute '{name}'", value.type_name()),
    )
}

pub fn index_of(value: &Value, index: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Dict(dict) => {
            index.check_hashable()?;
            dict.borrow()
                .get(index)
                .cloned()
                .ok_or_else(|| RuntimeError::new("KeyError", index.repr()))
        }
        Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Range { .. } => {
            let i = index.as_int().ok_or_else(|| {
                RuntimeError::type_error(format!(
                    "{} indices must be integers, not {}",
                    value.type_name(),
                    index.type_name()
                ))
            })?;
            let out_of_range =
                || RuntimeError::new("IndexError", format!("{} index out of range", value.type_name()));
            match value {
                Value::List(items) => {
                    let items = items.borrow();
                    normalize_index(i, items.len())
                        .map(|at| items[at].clone())
                        .ok_or_else(out_of_range)
                }
                Value::Tuple(items) => normalize_index(i, items.len())
                    .map(|at| items[at].clone())
                    .ok_or_else(out_of_range),
                Value::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    normalize_index(i, chars.len())
                        .map(|at| Value::str(chars[at].to_string()))
                        .ok_or_else(out_of_range)
                }
                Value::Range { start, step, .. } => {
                    normalize_index(i, range_len(value)? as usize)
                        .map(|at| Value::Int(range_item(*start, *step, at as i64)))
                        .ok_or_else(out_of_range)
                }
                _ => Err(out_of_range()),
            }
        }
        other => Err(RuntimeError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn slice_of(value: &Value, lower: Option<i64>, upper: Option<i64>) -> Result<Value, RuntimeError> {
    let bounds = |len: usize| {
        let len = len as i64;
        let clamp = |v: i64| if v < 0 { (v + len).max(0) } else { v.min(len) };
        let lo = lower.map(clamp).unwrap_or(0) as usize;
        let hi = upper.map(clamp).unwrap_or(len) as usize;
        (lo, hi.max(lo))
    };
    match value {
        Value::List(items) => {
            let items = items.borrow();
            let (lo, hi) = bounds(items.len());
            Ok(Value::list(items[lo..hi].to_vec()))
        }
        Value::Tuple(items) => {
            let (lo, hi) = bounds(items.len());
            Ok(Value::tuple(items[lo..hi].to_vec()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (lo, hi) = bounds(chars.len());
            Ok(Value::str(chars[lo..hi].iter().collect::<String>()))
        }
        other => Err(RuntimeError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn set_index(target: &Value, index: Value, value: Value) -> Result<(), RuntimeError> {
    match target {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = index.as_int().ok_or_else(|| {
                RuntimeError::type_error(format!(
                    "list indices must be integers, not {}",
                    index.type_name()
                ))
            })?;
            let at = normalize_index(i, items.len()).ok_or_else(|| {
                RuntimeError::new("IndexError", "list assignment index out of range")
            })?;
            items[at] = value;
            Ok(())
        }
        Value::Dict(dict) => dict.borrow_mut().insert(index, value),
        other => Err(RuntimeError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

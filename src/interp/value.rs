//! Runtime values

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use serde_json::{Map, Number, Value as Json};

use super::ast::FunctionDef;
use super::builtins::Builtin;
use super::error::RuntimeError;

/// Values nested deeper than this serialize as their repr.
pub const MAX_JSON_DEPTH: usize = 32;

/// A name-to-value mapping shared by frames and functions.
pub type Scope = Rc<RefCell<BTreeMap<String, Value>>>;

pub fn new_scope() -> Scope {
    Rc::new(RefCell::new(BTreeMap::new()))
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    Dict(Rc<RefCell<Dict>>),
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    Function(Rc<Function>),
    Builtin(Builtin),
    Method(Rc<BoundMethod>),
    Module(Rc<Module>),
    ExceptionType(Rc<str>),
    Exception(Rc<ExceptionValue>),
}

#[derive(Debug)]
pub struct Function {
    pub def: Rc<FunctionDef>,
    pub defaults: Vec<Option<Value>>,
    pub globals: Scope,
    pub unit: Rc<Path>,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: Rc<str>,
}

#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub globals: Scope,
}

#[derive(Debug)]
pub struct ExceptionValue {
    pub kind: Rc<str>,
    pub message: String,
}

/// Insertion-ordered mapping keyed by Python equality.
#[derive(Debug, Default, Clone)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &Value) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k.py_eq(key))
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.position(key).map(|i| &self.entries[i].1)
    }

    pub fn insert(&mut self, key: Value, value: Value) -> Result<(), RuntimeError> {
        key.check_hashable()?;
        match self.position(&key) {
            Some(i) => self.entries[i].1 = value,
            None => self.entries.push((key, value)),
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        self.position(key).map(|i| self.entries.remove(i).1)
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.position(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }
}

impl Value {
    pub fn str(text: impl Into<Rc<str>>) -> Self {
        Value::Str(text.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(items.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range { .. } => "range",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Method(_) => "method",
            Value::Module(_) => "module",
            Value::ExceptionType(_) => "type",
            Value::Exception(_) => "exception",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(dict) => !dict.borrow().is_empty(),
            Value::Range { .. } => range_count(self) > 0,
            _ => true,
        }
    }

    /// Integer view of ints and bools.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Float view of any number.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            other => other.as_int().map(|i| i as f64),
        }
    }

    pub fn check_hashable(&self) -> Result<(), RuntimeError> {
        match self {
            Value::List(_) | Value::Dict(_) => Err(RuntimeError::type_error(format!(
                "unhashable type: '{}'",
                self.type_name()
            ))),
            Value::Tuple(items) => items.iter().try_for_each(Value::check_hashable),
            _ => Ok(()),
        }
    }

    /// `str(value)`
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(exc) => exc.message.clone(),
            other => other.repr(),
        }
    }

    /// `repr(value)`
    pub fn repr(&self) -> String {
        self.repr_at(0)
    }

    fn repr_at(&self, depth: usize) -> String {
        if depth > MAX_JSON_DEPTH {
            return "...".to_string();
        }
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => quote_str(s),
            Value::List(items) => {
                let inner: Vec<String> =
                    items.borrow().iter().map(|v| v.repr_at(depth + 1)).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.repr_at(depth + 1)).collect();
                if inner.len() == 1 {
                    format!("({},)", inner[0])
                } else {
                    format!("({})", inner.join(", "))
                }
            }
            Value::Dict(dict) => {
                let inner: Vec<String> = dict
                    .borrow()
                    .entries()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr_at(depth + 1), v.repr_at(depth + 1)))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Range { start, stop, step } => {
                if *step == 1 {
                    format!("range({start}, {stop})")
                } else {
                    format!("range({start}, {stop}, {step})")
                }
            }
            Value::Function(func) => format!("<function {}>", func.def.name),
            Value::Builtin(builtin) => format!("<built-in function {}>", builtin.name()),
            Value::Method(method) => format!(
                "<built-in method {} of {} object>",
                method.name,
                method.receiver.type_name()
            ),
            Value::Module(module) => format!("<module '{}'>", module.name),
            Value::ExceptionType(kind) => format!("<class '{kind}'>"),
            Value::Exception(exc) => format!("{}({})", exc.kind, quote_str(&exc.message)),
        }
    }

    /// Python `==`.
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow())
            }
            (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.entries()
                        .iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.py_eq(other)))
            }
            (
                Value::Range {
                    start: a0,
                    stop: a1,
                    step: a2,
                },
                Value::Range {
                    start: b0,
                    stop: b1,
                    step: b2,
                },
            ) => (a0, a1, a2) == (b0, b1, b2),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (a, b) => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => x == y,
                _ => match (a.as_float(), b.as_float()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                },
            },
        }
    }

    /// Python `is`.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(_), Value::Int(_)) | (Value::Int(_), Value::Bool(_)) => false,
            _ => self.py_eq(other),
        }
    }

    /// Ordering for `<` and friends.
    pub fn py_cmp(&self, other: &Value) -> Result<Ordering, RuntimeError> {
        let unsupported = || {
            RuntimeError::type_error(format!(
                "'<' not supported between instances of '{}' and '{}'",
                self.type_name(),
                other.type_name()
            ))
        };
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) => seq_cmp(&a.borrow(), &b.borrow()),
            (Value::Tuple(a), Value::Tuple(b)) => seq_cmp(a, b),
            (a, b) => {
                if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
                    return Ok(x.cmp(&y));
                }
                match (a.as_float(), b.as_float()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y).ok_or_else(unsupported),
                    _ => Err(unsupported()),
                }
            }
        }
    }

    /// Serialize for scope snapshots. Containers nest up to
    /// [`MAX_JSON_DEPTH`]; anything without a JSON shape becomes its repr.
    pub fn to_json(&self) -> Json {
        self.to_json_at(0)
    }

    fn to_json_at(&self, depth: usize) -> Json {
        if depth >= MAX_JSON_DEPTH {
            return Json::String(self.repr());
        }
        match self {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number((*i).into()),
            Value::Float(f) => Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or_else(|| Json::String(format_float(*f))),
            Value::Str(s) => Json::String(s.to_string()),
            Value::List(items) => Json::Array(
                items
                    .borrow()
                    .iter()
                    .map(|v| v.to_json_at(depth + 1))
                    .collect(),
            ),
            Value::Tuple(items) => {
                Json::Array(items.iter().map(|v| v.to_json_at(depth + 1)).collect())
            }
            Value::Dict(dict) => {
                let mut map = Map::new();
                for (k, v) in dict.borrow().entries() {
                    map.insert(k.to_str(), v.to_json_at(depth + 1));
                }
                Json::Object(map)
            }
            other => Json::String(other.repr()),
        }
    }

    /// Build a value from JSON supplied by the user.
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::str(s.as_str()),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                let mut dict = Dict::new();
                for (k, v) in map {
                    dict.entries.push((Value::str(k.as_str()), Value::from_json(v)));
                }
                Value::Dict(Rc::new(RefCell::new(dict)))
            }
        }
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
}

fn seq_cmp(a: &[Value], b: &[Value]) -> Result<Ordering, RuntimeError> {
    for (x, y) in a.iter().zip(b) {
        if !x.py_eq(y) {
            return x.py_cmp(y);
        }
    }
    Ok(a.len().cmp(&b.len()))
}

/// Number of items in a range. Raises `OverflowError` when the count does
/// not fit in an int, as CPython's `len()` does.
pub fn range_len(value: &Value) -> Result<i64, RuntimeError> {
    i64::try_from(range_count(value)).map_err(|_| {
        RuntimeError::new("OverflowError", "Python int too large to convert to C ssize_t")
    })
}

fn range_count(value: &Value) -> i128 {
    match value {
        Value::Range { start, stop, step } => {
            let (start, stop, step) = (*start as i128, *stop as i128, *step as i128);
            if step > 0 && start < stop {
                (stop - start + step - 1) / step
            } else if step < 0 && start > stop {
                (start - stop - step - 1) / (-step)
            } else {
                0
            }
        }
        _ => 0,
    }
}

/// The `index`th item of a range. Callers keep `index` below the range's
/// length, so the result always lies between start and stop.
pub fn range_item(start: i64, step: i64, index: i64) -> i64 {
    (start as i128 + index as i128 * step as i128) as i64
}

/// Whether `item` is one of the range's items.
pub fn range_contains(range: &Value, item: i64) -> bool {
    match range {
        Value::Range { start, step, .. } => {
            let offset = item as i128 - *start as i128;
            let step = *step as i128;
            offset % step == 0 && (0..range_count(range)).contains(&(offset / step))
        }
        _ => false,
    }
}

/// Python's float repr: always shows a fractional part or an exponent.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let text = format!("{f:e}");
        return match text.split_once('e') {
            Some((mantissa, exp)) => {
                let (sign, digits) = match exp.strip_prefix('-') {
                    Some(d) => ('-', d),
                    None => ('+', exp),
                };
                format!("{mantissa}e{sign}{digits:0>2}")
            }
            None => text,
        };
    }
    if f == f.trunc() {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reprs_match_python() {
        assert_eq!(Value::Float(1.0).repr(), "1.0");
        assert_eq!(Value::Float(0.1).repr(), "0.1");
        assert_eq!(Value::Float(1e20).repr(), "1e+20");
        assert_eq!(Value::str("it's").repr(), "\"it's\"");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(
            Value::list(vec![Value::None, Value::Bool(true)]).repr(),
            "[None, True]"
        );
    }

    #[test]
    fn test_numeric_equality_crosses_types() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::Int(1).py_eq(&Value::str("1")));
    }

    #[test]
    fn test_dict_keys_use_python_equality() {
        let mut dict = Dict::new();
        dict.insert(Value::Int(1), Value::str("a")).unwrap();
        dict.insert(Value::Float(1.0), Value::str("b")).unwrap();
        assert_eq!(dict.len(), 1);
        assert!(dict.insert(Value::list(vec![]), Value::None).is_err());
    }

    #[test]
    fn test_json_conversion() {
        let mut dict = Dict::new();
        dict.insert(Value::str("k"), Value::list(vec![Value::Int(1), Value::Float(2.5)]))
            .unwrap();
        let value = Value::Dict(Rc::new(RefCell::new(dict)));
        assert_eq!(value.to_json(), json!({"k": [1, 2.5]}));

        let back = Value::from_json(&json!({"k": [1, 2.5]}));
        assert!(back.py_eq(&value));
    }

    #[test]
    fn test_self_referencing_list_serializes() {
        let list = Value::list(vec![]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        let json = list.to_json();
        assert!(json.is_array());
        // break the cycle so the test does not leak
        if let Value::List(items) = &list {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn test_range_len() {
        let r = |start, stop, step| Value::Range { start, stop, step };
        assert_eq!(range_len(&r(0, 10, 1)).unwrap(), 10);
        assert_eq!(range_len(&r(0, 10, 3)).unwrap(), 4);
        assert_eq!(range_len(&r(10, 0, -2)).unwrap(), 5);
        assert_eq!(range_len(&r(5, 5, 1)).unwrap(), 0);
    }

    #[test]
    fn test_range_extremes_do_not_overflow() {
        let r = |start, stop, step| Value::Range { start, stop, step };
        let whole = r(i64::MIN, i64::MAX, 1);
        let err = range_len(&whole).unwrap_err();
        assert_eq!(&*err.kind, "OverflowError");
        assert!(whole.truthy());

        assert_eq!(range_len(&r(i64::MIN + 1, i64::MAX, 2)).unwrap(), i64::MAX);
        assert_eq!(range_len(&r(i64::MAX, i64::MIN, -3)).unwrap(), 6148914691236517205);
        assert_eq!(range_item(i64::MIN, 3, 6148914691236517204), i64::MAX - 3);

        assert!(range_contains(&whole, i64::MAX - 1));
        assert!(range_contains(&whole, i64::MIN));
        assert!(!range_contains(&whole, i64::MAX));
        assert!(range_contains(&r(i64::MAX, i64::MIN, -2), i64::MIN + 1));
    }
}

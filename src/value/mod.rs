use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use serde::ser::{Serialize, Serializer};

use crate::vm::NativeFunction;

/// Strings up to this many bytes are stored inline in the `Value`.
pub const SHORT_STR_MAX: usize = 14;

#[derive(Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    ShortStr(u8, [u8; SHORT_STR_MAX]),
    LongStr(Rc<[u8]>),
    NativeFunction(NativeFunction),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Float(_) => "number",
            Value::ShortStr(..) | Value::LongStr(_) => "string",
            Value::NativeFunction(_) => "function",
        }
    }

    /// `nil` and `false` are false, everything else is true.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::ShortStr(len, buf) => Some(&buf[..*len as usize]),
            Value::LongStr(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn as_float(&self) -> Option<f64> {
        match *self {
            Value::Integer(i) => Some(i as f64),
            Value::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Integer view of a number; floats convert only when they hold an
    /// exact integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            Value::Integer(i) => Some(i),
            Value::Float(f) => ftoi(f),
            _ => None,
        }
    }

    /// Canonical text of strings and numbers, the operands `..` accepts.
    pub fn to_text(&self) -> Option<Vec<u8>> {
        match self {
            Value::Integer(_) | Value::Float(_) => Some(self.to_string().into_bytes()),
            _ => self.as_bytes().map(<[u8]>::to_vec),
        }
    }

    /// Identity used for constant-pool deduplication: same variant and, for
    /// floats, the same bit pattern. Unlike `==`, `1` and `1.0` stay apart.
    pub fn constant_key(&self) -> ConstantKey {
        match *self {
            Value::Integer(i) => ConstantKey::Integer(i),
            Value::Float(f) => ConstantKey::Float(f.to_bits()),
            _ => ConstantKey::Other(self.clone()),
        }
    }

    pub fn same_constant(&self, other: &Value) -> bool {
        self.constant_key() == other.constant_key()
    }
}

/// Hashable form of `Value::same_constant`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstantKey {
    Integer(i64),
    Float(u64),
    Other(Value),
}

/// Converts a float to an integer when no precision is lost.
pub fn ftoi(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is itself out of range.
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(i), Value::Float(f)) | (Value::Float(f), Value::Integer(i)) => {
                ftoi(*f) == Some(*i)
            }
            (Value::ShortStr(l1, s1), Value::ShortStr(l2, s2)) => s1[..*l1 as usize] == s2[..*l2 as usize],
            (Value::LongStr(s1), Value::LongStr(s2)) => s1 == s2,
            (Value::NativeFunction(f1), Value::NativeFunction(f2)) => std::ptr::fn_addr_eq(*f1, *f2),
            _ => false,
        }
    }
}

// Floats compare by IEEE rules, so NaN is not reflexive. NaN never reaches
// a hashed position: globals are keyed by name strings.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Nil => 0u8.hash(state),
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            // Integral floats hash like the integer they equal.
            Value::Float(f) => match ftoi(*f) {
                Some(i) => i.hash(state),
                None => f.to_bits().hash(state),
            },
            Value::ShortStr(len, buf) => buf[..*len as usize].hash(state),
            Value::LongStr(s) => s.hash(state),
            Value::NativeFunction(f) => (*f as usize).hash(state),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(n) => write!(f, "{n:?}"),
            Value::ShortStr(..) | Value::LongStr(_) => {
                write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes().unwrap_or_default()))
            }
            Value::NativeFunction(_) => write!(f, "function"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(n) => fmt_float(*n, f),
            Value::ShortStr(..) | Value::LongStr(_) => {
                write!(f, "{}", String::from_utf8_lossy(self.as_bytes().unwrap_or_default()))
            }
            Value::NativeFunction(func) => write!(f, "function: {:#x}", *func as usize),
        }
    }
}

fn fmt_float(n: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if n.is_nan() {
        return f.write_str(if n.is_sign_negative() { "-nan" } else { "nan" });
    }
    if n.is_infinite() {
        return f.write_str(if n > 0.0 { "inf" } else { "-inf" });
    }
    let text = format_g14(n);
    // A float never prints like an integer.
    if text.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        write!(f, "{text}.0")
    } else {
        f.write_str(&text)
    }
}

/// C's `%.14g`: 14 significant digits, trailing zeros removed, exponent
/// notation outside `1e-4 <= |n| < 1e14`.
fn format_g14(n: f64) -> String {
    const PRECISION: i32 = 14;
    let sci = format!("{:.*e}", PRECISION as usize - 1, n);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((&sci, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    if exp < -4 || exp >= PRECISION {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exp.abs())
    } else {
        let decimals = (PRECISION - 1 - exp) as usize;
        trim_fraction(&format!("{n:.decimals$}")).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') { s.trim_end_matches('0').trim_end_matches('.') } else { s }
}

// Constants serialize as plain JSON scalars; functions never reach a
// constant pool and serialize as their type name.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(n) => serializer.serialize_f64(*n),
            Value::ShortStr(..) | Value::LongStr(_) => {
                let bytes = self.as_bytes().unwrap_or_default();
                serializer.serialize_str(&String::from_utf8_lossy(bytes))
            }
            Value::NativeFunction(_) => serializer.serialize_str("function"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        if v.len() <= SHORT_STR_MAX {
            let mut buf = [0; SHORT_STR_MAX];
            buf[..v.len()].copy_from_slice(v);
            Value::ShortStr(v.len() as u8, buf)
        } else {
            Value::LongStr(Rc::from(v))
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        if v.len() <= SHORT_STR_MAX {
            Value::from(&v[..])
        } else {
            Value::LongStr(Rc::from(v))
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::from(s.as_bytes())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::from(s.into_bytes())
    }
}

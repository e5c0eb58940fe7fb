//! Polymorphic row values
//!
//! Every cell a pipeline row can hold is a [`Value`]: a reference-counted
//! tagged union shared freely between rows, arrays, maps and result
//! temporaries. Cloning a `Value` bumps the reference count; dropping the
//! last holder frees the payload and recursively releases children.
//!
//! Comparison is defined across kinds: if either side is numeric the other
//! is coerced to a number, otherwise both sides compare by their textual
//! form. Null orders below any non-null value. Hashing follows the same
//! coercion so that equal values hash equal.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use once_cell::sync::Lazy;

/// The shared null instance. All null cells are clones of this value.
static NULL: Lazy<Value> = Lazy::new(|| Value(Arc::new(ValueData::Null)));

/// Discriminant of a [`Value`], for diagnostics and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Number,
    String,
    Null,
    Array,
    Map,
    Reference,
    Duo,
}

/// String payload with its ownership strategy.
///
/// `Owned` strings were built for this value; `Shared` strings are interned
/// buffers referenced from several values; `Static` strings live in the
/// binary.
#[derive(Debug, Clone)]
pub enum StrBuf {
    Owned(Box<str>),
    Shared(Arc<str>),
    Static(&'static str),
}

impl StrBuf {
    pub fn as_str(&self) -> &str {
        match self {
            StrBuf::Owned(s) => s,
            StrBuf::Shared(s) => s,
            StrBuf::Static(s) => s,
        }
    }
}

/// A value carrying two representations of the same datum: ordering and
/// arithmetic use `primary`, reply serialisation uses `display`, and an
/// optional `expanded` form is used by expanded reply formats.
#[derive(Debug, Clone)]
pub struct Duo {
    pub primary: Value,
    pub display: Value,
    pub expanded: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum ValueData {
    Number(f64),
    String(StrBuf),
    Null,
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Reference(Value),
    Duo(Duo),
}

/// A reference-counted polymorphic value.
///
/// `Clone` is cheap (reference count increment). Values are immutable once
/// constructed; "mutation" is replacement of the cell holding the value.
#[derive(Clone)]
pub struct Value(Arc<ValueData>);

impl Value {
    /// The shared null value.
    pub fn null() -> Value {
        NULL.clone()
    }

    pub fn number(n: f64) -> Value {
        Value(Arc::new(ValueData::Number(n)))
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value(Arc::new(ValueData::String(StrBuf::Owned(
            s.into().into_boxed_str(),
        ))))
    }

    /// A string backed by a shared interned buffer.
    pub fn shared_string(s: Arc<str>) -> Value {
        Value(Arc::new(ValueData::String(StrBuf::Shared(s))))
    }

    pub fn static_string(s: &'static str) -> Value {
        Value(Arc::new(ValueData::String(StrBuf::Static(s))))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value(Arc::new(ValueData::Array(items)))
    }

    /// A map value. Pair order is preserved.
    pub fn map(pairs: Vec<(Value, Value)>) -> Value {
        Value(Arc::new(ValueData::Map(pairs)))
    }

    /// A reference to another value. Dereferencing is transitive; cycles are
    /// impossible by construction because the target must exist first.
    pub fn reference(target: Value) -> Value {
        Value(Arc::new(ValueData::Reference(target)))
    }

    pub fn duo(primary: Value, display: Value) -> Value {
        Value(Arc::new(ValueData::Duo(Duo {
            primary,
            display,
            expanded: None,
        })))
    }

    pub fn duo_expanded(primary: Value, display: Value, expanded: Value) -> Value {
        Value(Arc::new(ValueData::Duo(Duo {
            primary,
            display,
            expanded: Some(expanded),
        })))
    }

    pub fn kind(&self) -> ValueKind {
        match &*self.0 {
            ValueData::Number(_) => ValueKind::Number,
            ValueData::String(_) => ValueKind::String,
            ValueData::Null => ValueKind::Null,
            ValueData::Array(_) => ValueKind::Array,
            ValueData::Map(_) => ValueKind::Map,
            ValueData::Reference(_) => ValueKind::Reference,
            ValueData::Duo(_) => ValueKind::Duo,
        }
    }

    pub fn data(&self) -> &ValueData {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        matches!(&*self.follow().0, ValueData::Null)
    }

    /// Follow `Reference` links to the underlying value.
    pub fn follow(&self) -> &Value {
        let mut v = self;
        while let ValueData::Reference(target) = &*v.0 {
            v = target;
        }
        v
    }

    /// Number of live holders of this exact cell (diagnostics/tests).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Numeric interpretation: numbers as-is, strings parsed fully, duos by
    /// their primary. Everything else (and unparsable strings) is `None`.
    pub fn to_number(&self) -> Option<f64> {
        match &*self.follow().0 {
            ValueData::Number(n) => Some(*n),
            ValueData::String(s) => {
                let t = s.as_str().trim();
                if t.is_empty() {
                    None
                } else {
                    t.parse::<f64>().ok()
                }
            }
            ValueData::Duo(d) => d.primary.to_number(),
            _ => None,
        }
    }

    /// Borrow the string payload, if this (dereferenced) value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match &*self.follow().0 {
            ValueData::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_duo(&self) -> Option<&Duo> {
        match &*self.follow().0 {
            ValueData::Duo(d) => Some(d),
            _ => None,
        }
    }

    /// Textual form used for cross-kind comparison and text replies.
    pub fn to_text(&self) -> String {
        match &*self.follow().0 {
            ValueData::Number(n) => format_number(*n),
            ValueData::String(s) => s.as_str().to_owned(),
            ValueData::Null => String::new(),
            ValueData::Array(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_text()).collect();
                parts.join(",")
            }
            ValueData::Map(pairs) => {
                let parts: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| format!("{}={}", k.to_text(), v.to_text()))
                    .collect();
                parts.join(",")
            }
            ValueData::Duo(d) => d.primary.to_text(),
            ValueData::Reference(_) => unreachable!("follow() resolves references"),
        }
    }

    /// Truthiness: null, zero, and empty strings/arrays/maps are false.
    pub fn is_truthy(&self) -> bool {
        match &*self.follow().0 {
            ValueData::Null => false,
            ValueData::Number(n) => *n != 0.0,
            ValueData::String(s) => !s.as_str().is_empty(),
            ValueData::Array(items) => !items.is_empty(),
            ValueData::Map(pairs) => !pairs.is_empty(),
            ValueData::Duo(d) => d.primary.is_truthy(),
            ValueData::Reference(_) => unreachable!("follow() resolves references"),
        }
    }

    /// Total order over values.
    ///
    /// Same-kind values compare natively. Null orders below any non-null.
    /// Mixed kinds coerce to numbers when either side is numeric and the
    /// other parses; otherwise both sides compare by textual form.
    pub fn total_compare(&self, other: &Value) -> Ordering {
        let a = self.follow();
        let b = other.follow();

        if a.kind() == b.kind() {
            return a.compare_same_kind(b);
        }

        match (a.is_null(), b.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }

        if a.kind() == ValueKind::Number || b.kind() == ValueKind::Number {
            if let (Some(x), Some(y)) = (a.to_number(), b.to_number()) {
                return x.total_cmp(&y);
            }
        }

        a.to_text().cmp(&b.to_text())
    }

    fn compare_same_kind(&self, other: &Value) -> Ordering {
        match (&*self.0, &*other.0) {
            (ValueData::Number(a), ValueData::Number(b)) => a.total_cmp(b),
            (ValueData::String(a), ValueData::String(b)) => a.as_str().cmp(b.as_str()),
            (ValueData::Null, ValueData::Null) => Ordering::Equal,
            (ValueData::Duo(a), ValueData::Duo(b)) => a.primary.total_compare(&b.primary),
            (ValueData::Array(a), ValueData::Array(b)) => {
                // Arrays order by their first element; ties break on length.
                match (a.first(), b.first()) {
                    (Some(x), Some(y)) => {
                        let ord = x.total_compare(y);
                        if ord != Ordering::Equal {
                            ord
                        } else {
                            a.len().cmp(&b.len())
                        }
                    }
                    _ => a.len().cmp(&b.len()),
                }
            }
            // Maps have no defined order
            (ValueData::Map(_), ValueData::Map(_)) => Ordering::Equal,
            _ => Ordering::Equal,
        }
    }

    /// Canonical byte encoding: equal values (under [`total_compare`])
    /// encode identically. Used for group keys and distinct counting.
    ///
    /// [`total_compare`]: Value::total_compare
    pub fn canonical_encode(&self, out: &mut Vec<u8>) {
        let v = self.follow();
        // Numeric-coercible values encode as numbers so that `"7"` and `7`
        // land in the same group.
        if let Some(n) = v.to_number() {
            out.push(b'N');
            let n = if n == 0.0 { 0.0 } else { n }; // collapse -0.0
            out.extend_from_slice(&n.to_bits().to_le_bytes());
            return;
        }
        match &*v.0 {
            ValueData::Null => out.push(b'Z'),
            ValueData::String(s) => {
                out.push(b'S');
                out.extend_from_slice(&(s.as_str().len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_str().as_bytes());
            }
            ValueData::Array(items) => {
                out.push(b'A');
                out.extend_from_slice(&(items.len() as u64).to_le_bytes());
                for item in items {
                    item.canonical_encode(out);
                }
            }
            ValueData::Map(pairs) => {
                out.push(b'M');
                out.extend_from_slice(&(pairs.len() as u64).to_le_bytes());
                for (k, val) in pairs {
                    k.canonical_encode(out);
                    val.canonical_encode(out);
                }
            }
            ValueData::Duo(d) => d.primary.canonical_encode(out),
            // to_number() handles Number; follow() handles Reference
            ValueData::Number(_) | ValueData::Reference(_) => unreachable!(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.total_compare(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut buf = Vec::with_capacity(16);
        self.canonical_encode(&mut buf);
        state.write(&buf);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ValueData::Reference(target) => write!(f, "&{:?}", target),
            ValueData::Null => write!(f, "null"),
            ValueData::Number(n) => write!(f, "{}", format_number(*n)),
            ValueData::String(s) => write!(f, "{:?}", s.as_str()),
            ValueData::Array(items) => f.debug_list().entries(items).finish(),
            ValueData::Map(pairs) => f.debug_map().entries(pairs.iter().map(|(k, v)| (k, v))).finish(),
            ValueData::Duo(d) => write!(f, "duo({:?}, {:?})", d.primary, d.display),
        }
    }
}

/// Render a double: integral values print without a fraction, everything
/// else uses the shortest round-trip representation.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

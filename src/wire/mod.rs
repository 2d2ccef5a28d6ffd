//! Tagged binary encoding.
//!
//! Every value starts with a one-byte tag followed by a tag-specific body.
//! Numbers are little endian. Strings, integer arrays and containers carry a
//! 4-byte count in front of their contents. Exchange headers are written with
//! the primitive writers directly; [`Value`] covers self-describing payloads.
//!
//! | tag | body |
//! |-----|------|
//! | `b` | u8 |
//! | `B` | u8, 0 or 1 |
//! | `t` | i16 |
//! | `i` | i32 |
//! | `l` | i64 |
//! | `s` | i32 byte count, UTF-8 bytes |
//! | `f` | f32 |
//! | `I` | i32 count, i32 elements |
//! | `A` | i32 count, tagged values |
//! | `M` | i32 count, (string, tagged value) pairs |
//! | `H` | i32 count, (tagged value, tagged value) pairs |
//! | `N` | a single zero byte |
//!
//! Tags outside this table belong to [`Extensions`].

mod custom;
mod decoder;
mod encoder;

use std::{
    any::{Any, TypeId},
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use thiserror::Error;

pub use custom::Extensions;
pub use decoder::{Decoder, DEFAULT_STRING_CEILING, MAX_DEPTH};
pub use encoder::Encoder;

pub mod tag {
    pub const BYTE: u8 = b'b';
    pub const BOOL: u8 = b'B';
    pub const SHORT: u8 = b't';
    pub const INT: u8 = b'i';
    pub const LONG: u8 = b'l';
    pub const STRING: u8 = b's';
    pub const FLOAT: u8 = b'f';
    pub const INTS: u8 = b'I';
    pub const ARRAY: u8 = b'A';
    pub const MAP: u8 = b'M';
    pub const HASH: u8 = b'H';
    pub const NULL: u8 = b'N';

    pub const CORE: [u8; 12] = [
        BYTE, BOOL, SHORT, INT, LONG, STRING, FLOAT, INTS, ARRAY, MAP, HASH,
        NULL,
    ];

    pub fn is_core(tag: u8) -> bool {
        CORE.contains(&tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("input ended while reading {0}")]
    Truncated(&'static str),
    #[error("invalid length {len} for {what}")]
    InvalidLength { what: &'static str, len: i64 },
    #[error("unknown type tag {0:#04x}")]
    UnknownTag(u8),
    #[error("no encoding registered for {0}")]
    UnsupportedValue(String),
    #[error("tag {0:#04x} is reserved")]
    ReservedTag(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("values nested deeper than {0} levels")]
    TooDeep(usize),
}

/// A value of a registered custom type.
#[derive(Clone)]
pub struct ExtValue(Arc<dyn Any + Send + Sync>);

impl ExtValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.0).downcast_ref::<T>()
    }

    pub(crate) fn value_type_id(&self) -> TypeId {
        Any::type_id(&*self.0)
    }
}

impl PartialEq for ExtValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ExtValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExtValue(..)")
    }
}

/// A self-describing value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Byte(u8),
    Bool(bool),
    Short(i16),
    Int(i32),
    Long(i64),
    Str(String),
    Float(f32),
    Ints(Vec<i32>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Hash(Vec<(Value, Value)>),
    Ext(ExtValue),
}

impl Value {
    pub fn tag(&self) -> Option<u8> {
        Some(match self {
            Value::Null => tag::NULL,
            Value::Byte(_) => tag::BYTE,
            Value::Bool(_) => tag::BOOL,
            Value::Short(_) => tag::SHORT,
            Value::Int(_) => tag::INT,
            Value::Long(_) => tag::LONG,
            Value::Str(_) => tag::STRING,
            Value::Float(_) => tag::FLOAT,
            Value::Ints(_) => tag::INTS,
            Value::Array(_) => tag::ARRAY,
            Value::Map(_) => tag::MAP,
            Value::Hash(_) => tag::HASH,
            Value::Ext(_) => return None,
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v.into())
            }
        })*
    };
}

value_from! {
    u8 => Byte,
    bool => Bool,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    String => Str,
    &str => Str,
    Vec<i32> => Ints,
    Vec<Value> => Array,
    BTreeMap<String, Value> => Map,
}

/// Encodes one value with no custom types registered.
pub fn to_bytes(value: &Value) -> Result<Vec<u8>, Error> {
    let mut enc = Encoder::new();
    enc.value(value);
    enc.finish()
}

/// Decodes one value with no custom types registered.
pub fn from_bytes(buf: &[u8]) -> Result<Value, Error> {
    let mut dec = Decoder::new(buf);
    let value = dec.value();
    dec.finish().map(|_| value)
}

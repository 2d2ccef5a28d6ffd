use std::{collections::BTreeMap, io::Cursor};

use byteorder::{LittleEndian, ReadBytesExt};

use super::{tag, Error, Extensions, Value};

/// Longest string accepted by default. Protocol headers never come close.
pub const DEFAULT_STRING_CEILING: usize = 10 * 1024;

/// Deepest container nesting accepted by [`Decoder::value`].
pub const MAX_DEPTH: usize = 64;

/// Reads tagged values from a byte slice.
///
/// Like [`super::Encoder`] the first error sticks: later reads return zero
/// values and leave the original error in place for [`Decoder::finish`].
pub struct Decoder<'a> {
    cur: Cursor<&'a [u8]>,
    err: Option<Error>,
    ext: Option<&'a Extensions>,
    ceiling: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(buf),
            err: None,
            ext: None,
            ceiling: DEFAULT_STRING_CEILING,
            depth: 0,
        }
    }

    pub fn with_extensions(mut self, ext: &'a Extensions) -> Self {
        self.ext = Some(ext);
        self
    }

    /// Sets the longest string, in bytes, the decoder accepts.
    pub fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn fail(&mut self, err: Error) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    pub fn remaining(&self) -> usize {
        let buf = self.cur.get_ref();
        buf.len().saturating_sub(self.cur.position() as usize)
    }

    fn read<T: Default>(
        &mut self,
        what: &'static str,
        f: impl FnOnce(&mut Cursor<&'a [u8]>) -> std::io::Result<T>,
    ) -> T {
        if self.err.is_some() {
            return T::default();
        }
        match f(&mut self.cur) {
            Ok(v) => v,
            Err(_) => {
                self.fail(Error::Truncated(what));
                T::default()
            }
        }
    }

    pub fn byte(&mut self) -> u8 {
        self.read("byte", |c| c.read_u8())
    }

    pub fn bool(&mut self) -> bool {
        self.byte() != 0
    }

    pub fn short(&mut self) -> i16 {
        self.read("short", |c| c.read_i16::<LittleEndian>())
    }

    pub fn int(&mut self) -> i32 {
        self.read("int", |c| c.read_i32::<LittleEndian>())
    }

    pub fn long(&mut self) -> i64 {
        self.read("long", |c| c.read_i64::<LittleEndian>())
    }

    pub fn float(&mut self) -> f32 {
        self.read("float", |c| c.read_f32::<LittleEndian>())
    }

    /// Reads a count and checks it against what is left. `unit` is the
    /// smallest encoded size of one element.
    fn count(&mut self, what: &'static str, unit: usize) -> usize {
        let n = self.int();
        if self.err.is_some() {
            return 0;
        }
        if n < 0 {
            self.fail(Error::InvalidLength {
                what,
                len: n as i64,
            });
            return 0;
        }
        let n = n as usize;
        if n.saturating_mul(unit) > self.remaining() {
            self.fail(Error::Truncated(what));
            return 0;
        }
        n
    }

    fn take(&mut self, len: usize) -> &'a [u8] {
        if self.err.is_some() {
            return &[];
        }
        let buf: &'a [u8] = *self.cur.get_ref();
        let start = self.cur.position() as usize;
        match buf.get(start..start + len) {
            Some(slice) => {
                self.cur.set_position((start + len) as u64);
                slice
            }
            None => {
                self.fail(Error::Truncated("bytes"));
                &[]
            }
        }
    }

    /// Reads a length-prefixed string. A negative length or one above the
    /// ceiling is an error, not a short read.
    pub fn string(&mut self) -> String {
        let n = self.int();
        if self.err.is_some() || n == 0 {
            return String::new();
        }
        if n < 0 || n as usize > self.ceiling {
            self.fail(Error::InvalidLength {
                what: "string",
                len: n as i64,
            });
            return String::new();
        }
        let bytes = self.take(n as usize);
        match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(_) => {
                self.fail(Error::InvalidUtf8);
                String::new()
            }
        }
    }

    pub fn ints(&mut self) -> Vec<i32> {
        let n = self.count("int array", 4);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.int());
        }
        out
    }

    /// Everything not read yet, untagged. Consumes it.
    pub fn rest(&mut self) -> &'a [u8] {
        let n = self.remaining();
        self.take(n)
    }

    /// Reads one tagged value.
    pub fn value(&mut self) -> Value {
        let t = self.byte();
        if self.err.is_some() {
            return Value::Null;
        }
        match t {
            tag::NULL => {
                if self.byte() != 0 {
                    self.fail(Error::UnknownTag(tag::NULL));
                }
                Value::Null
            }
            tag::BYTE => Value::Byte(self.byte()),
            tag::BOOL => Value::Bool(self.bool()),
            tag::SHORT => Value::Short(self.short()),
            tag::INT => Value::Int(self.int()),
            tag::LONG => Value::Long(self.long()),
            tag::STRING => Value::Str(self.string()),
            tag::FLOAT => Value::Float(self.float()),
            tag::INTS => Value::Ints(self.ints()),
            tag::ARRAY => self.nested(|d| {
                let n = d.count("array", 1);
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(d.value());
                }
                Value::Array(items)
            }),
            tag::MAP => self.nested(|d| {
                let n = d.count("map", 5);
                let mut map = BTreeMap::new();
                for _ in 0..n {
                    let k = d.string();
                    let v = d.value();
                    map.insert(k, v);
                }
                Value::Map(map)
            }),
            tag::HASH => self.nested(|d| {
                let n = d.count("hash", 2);
                let mut pairs = Vec::with_capacity(n);
                for _ in 0..n {
                    let k = d.value();
                    let v = d.value();
                    pairs.push((k, v));
                }
                Value::Hash(pairs)
            }),
            other => match self.ext.and_then(|e| e.by_tag(other)) {
                Some(codec) => Value::Ext((codec.decode)(self)),
                None => {
                    self.fail(Error::UnknownTag(other));
                    Value::Null
                }
            },
        }
    }

    fn nested(&mut self, f: impl FnOnce(&mut Self) -> Value) -> Value {
        if self.depth >= MAX_DEPTH {
            self.fail(Error::TooDeep(MAX_DEPTH));
            return Value::Null;
        }
        self.depth += 1;
        let v = f(self);
        self.depth -= 1;
        v
    }

    /// Returns the first error hit while reading, if any.
    pub fn finish(self) -> Result<(), Error> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

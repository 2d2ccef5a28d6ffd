use byteorder::{LittleEndian, WriteBytesExt};

use super::{tag, Error, Extensions, Value};

/// Writes tagged values into a growing buffer.
///
/// Writers chain and never fail on their own: the first error is kept and
/// every later write becomes a no-op, so a whole record can be written before
/// checking [`Encoder::finish`] once.
pub struct Encoder<'a> {
    buf: Vec<u8>,
    err: Option<Error>,
    ext: Option<&'a Extensions>,
}

impl Default for Encoder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Encoder<'a> {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            err: None,
            ext: None,
        }
    }

    /// Makes registered custom types encodable through [`Encoder::value`].
    pub fn with_extensions(mut self, ext: &'a Extensions) -> Self {
        self.ext = Some(ext);
        self
    }

    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn fail(&mut self, err: Error) -> &mut Self {
        if self.err.is_none() {
            self.err = Some(err);
        }
        self
    }

    pub fn byte(&mut self, v: u8) -> &mut Self {
        if self.err.is_none() {
            self.buf.push(v);
        }
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.byte(v as u8)
    }

    pub fn short(&mut self, v: i16) -> &mut Self {
        if self.err.is_none() {
            // writes into a Vec cannot fail
            let _ = self.buf.write_i16::<LittleEndian>(v);
        }
        self
    }

    pub fn int(&mut self, v: i32) -> &mut Self {
        if self.err.is_none() {
            let _ = self.buf.write_i32::<LittleEndian>(v);
        }
        self
    }

    pub fn long(&mut self, v: i64) -> &mut Self {
        if self.err.is_none() {
            let _ = self.buf.write_i64::<LittleEndian>(v);
        }
        self
    }

    pub fn float(&mut self, v: f32) -> &mut Self {
        if self.err.is_none() {
            let _ = self.buf.write_f32::<LittleEndian>(v);
        }
        self
    }

    /// Raw bytes with no tag and no count.
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        if self.err.is_none() {
            self.buf.extend_from_slice(v);
        }
        self
    }

    fn count(&mut self, what: &'static str, len: usize) -> &mut Self {
        match i32::try_from(len) {
            Ok(n) => self.int(n),
            Err(_) => self.fail(Error::InvalidLength {
                what,
                len: len as i64,
            }),
        }
    }

    /// Byte count followed by the UTF-8 bytes.
    pub fn string(&mut self, v: &str) -> &mut Self {
        self.count("string", v.len()).bytes(v.as_bytes())
    }

    pub fn ints(&mut self, v: &[i32]) -> &mut Self {
        self.count("int array", v.len());
        for &i in v {
            self.int(i);
        }
        self
    }

    /// Writes a tag followed by the value's body.
    pub fn value(&mut self, v: &Value) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        match v {
            Value::Null => self.byte(tag::NULL).byte(0),
            Value::Byte(b) => self.byte(tag::BYTE).byte(*b),
            Value::Bool(b) => self.byte(tag::BOOL).bool(*b),
            Value::Short(s) => self.byte(tag::SHORT).short(*s),
            Value::Int(i) => self.byte(tag::INT).int(*i),
            Value::Long(l) => self.byte(tag::LONG).long(*l),
            Value::Str(s) => self.byte(tag::STRING).string(s),
            Value::Float(f) => self.byte(tag::FLOAT).float(*f),
            Value::Ints(v) => self.byte(tag::INTS).ints(v),
            Value::Array(items) => {
                self.byte(tag::ARRAY).count("array", items.len());
                for item in items {
                    self.value(item);
                }
                self
            }
            Value::Map(map) => {
                self.byte(tag::MAP).count("map", map.len());
                for (k, item) in map {
                    self.string(k).value(item);
                }
                self
            }
            Value::Hash(pairs) => {
                self.byte(tag::HASH).count("hash", pairs.len());
                for (k, item) in pairs {
                    self.value(k).value(item);
                }
                self
            }
            Value::Ext(ext) => {
                let codec = self.ext.and_then(|e| e.by_type(ext.value_type_id()));
                match codec {
                    Some(codec) => {
                        self.byte(codec.tag);
                        (codec.encode)(self, ext);
                        self
                    }
                    None => self.fail(Error::UnsupportedValue(
                        "unregistered custom type".into(),
                    )),
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the encoded bytes, or the first error hit while writing.
    pub fn finish(self) -> Result<Vec<u8>, Error> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self.buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_chain() {
        let mut enc = Encoder::new();
        enc.byte(1).short(2).string("ab").long(-1);
        let bytes = enc.finish().unwrap();
        assert_eq!(
            bytes,
            [1, 2, 0, 2, 0, 0, 0, b'a', b'b', 255, 255, 255, 255, 255, 255, 255, 255]
        );
    }

    #[test]
    fn first_error_sticks() {
        let mut enc = Encoder::new();
        enc.byte(1)
            .fail(Error::InvalidUtf8)
            .string("ignored")
            .fail(Error::Truncated("later"));
        assert_eq!(enc.len(), 1);
        assert_eq!(enc.finish(), Err(Error::InvalidUtf8));
    }
}

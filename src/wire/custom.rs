use std::{
    any::{type_name, Any, TypeId},
    sync::Arc,
};

use hashbrown::HashMap;

use super::{tag, Decoder, Encoder, Error, ExtValue};

type EncodeFn = Arc<dyn Fn(&mut Encoder<'_>, &ExtValue) + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&mut Decoder<'_>) -> ExtValue + Send + Sync>;

pub(crate) struct ExtCodec {
    pub(crate) tag: u8,
    pub(crate) encode: EncodeFn,
    pub(crate) decode: DecodeFn,
}

/// Custom type codecs, looked up by runtime type when encoding and by tag
/// when decoding.
#[derive(Default)]
pub struct Extensions {
    by_type: HashMap<TypeId, Arc<ExtCodec>>,
    by_tag: HashMap<u8, Arc<ExtCodec>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `tag`. The encoder writes the tag, then calls
    /// `encode` for the body; the decoder calls `decode` after reading the
    /// tag. Core tags and tags already taken are refused.
    pub fn register<T, E, D>(
        &mut self,
        tag: u8,
        encode: E,
        decode: D,
    ) -> Result<(), Error>
    where
        T: Any + Send + Sync,
        E: Fn(&mut Encoder<'_>, &T) + Send + Sync + 'static,
        D: Fn(&mut Decoder<'_>) -> T + Send + Sync + 'static,
    {
        if tag::is_core(tag) || self.by_tag.contains_key(&tag) {
            return Err(Error::ReservedTag(tag));
        }
        let type_id = TypeId::of::<T>();
        if self.by_type.contains_key(&type_id) {
            return Err(Error::UnsupportedValue(format!(
                "{} is already registered",
                type_name::<T>()
            )));
        }
        let codec = Arc::new(ExtCodec {
            tag,
            encode: Arc::new(move |enc: &mut Encoder<'_>, v: &ExtValue| {
                match v.downcast_ref::<T>() {
                    Some(v) => {
                        encode(enc, v);
                    }
                    None => {
                        enc.fail(Error::UnsupportedValue(
                            type_name::<T>().to_string(),
                        ));
                    }
                }
            }),
            decode: Arc::new(move |dec: &mut Decoder<'_>| {
                ExtValue::new(decode(dec))
            }),
        });
        self.by_type.insert(type_id, codec.clone());
        self.by_tag.insert(tag, codec);
        Ok(())
    }

    pub(crate) fn by_type(&self, id: TypeId) -> Option<&ExtCodec> {
        self.by_type.get(&id).map(|c| &**c)
    }

    pub(crate) fn by_tag(&self, tag: u8) -> Option<&ExtCodec> {
        self.by_tag.get(&tag).map(|c| &**c)
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

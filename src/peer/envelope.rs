use super::{codec::Payload, Codec, RpcError};
use crate::wire::{Decoder, Encoder, DEFAULT_STRING_CEILING};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ret {
    Request = 0,
    Response = 1,
}

/// One request, event or reply.
///
/// On the wire the header fields are written in order with the wire
/// primitives (`from`, `to`, `func` and `err` as strings, `seq` as a long,
/// `ret` as a byte) and the payload follows untagged up to the end.
#[derive(Debug)]
pub struct Envelope {
    /// Sending peer.
    pub from: String,
    /// Receiving peer.
    pub to: String,
    /// Method on `to`. Empty on replies.
    pub func: String,
    /// Correlation id. Zero for events.
    pub seq: u64,
    pub ret: Ret,
    /// Error text of a failed call. Empty on success.
    pub err: String,
    pub(crate) payload: Payload,
}

impl Envelope {
    pub(crate) fn request(
        from: &str,
        to: &str,
        func: &str,
        seq: u64,
        payload: Payload,
    ) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            func: func.to_string(),
            seq,
            ret: Ret::Request,
            err: String::new(),
            payload,
        }
    }

    /// A reply to a request from `to` to `from`: the peers are swapped by
    /// the caller.
    pub(crate) fn response(
        from: String,
        to: String,
        seq: u64,
        result: Result<Payload, RpcError>,
    ) -> Self {
        let (payload, err) = match result {
            Ok(payload) => (payload, String::new()),
            Err(err) => (Payload::Empty, err.to_string()),
        };
        Self {
            from,
            to,
            func: String::new(),
            seq,
            ret: Ret::Response,
            err,
            payload,
        }
    }

    pub fn is_request(&self) -> bool {
        self.ret == Ret::Request
    }

    pub fn is_event(&self) -> bool {
        self.is_request() && self.seq == 0
    }

    pub fn encode(&self, codec: Codec) -> Result<Vec<u8>, RpcError> {
        let body = self.payload.to_bytes(codec)?;
        let err = clip(&self.err, DEFAULT_STRING_CEILING);
        let mut enc = Encoder::with_capacity(
            32 + self.from.len() + self.to.len() + self.func.len() + err.len()
                + body.len(),
        );
        enc.string(&self.from)
            .string(&self.to)
            .string(&self.func)
            .long(self.seq as i64)
            .byte(self.ret as u8)
            .string(err)
            .bytes(&body);
        Ok(enc.finish()?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RpcError> {
        let mut dec = Decoder::new(bytes);
        let from = dec.string();
        let to = dec.string();
        let func = dec.string();
        let seq = dec.long() as u64;
        let ret = dec.byte();
        let err = dec.string();
        let body = dec.rest().to_vec();
        dec.finish()?;
        let ret = match ret {
            0 => Ret::Request,
            1 => Ret::Response,
            other => Err(RpcError::Codec(format!("bad return flag {other}")))?,
        };
        let payload = if body.is_empty() {
            Payload::Empty
        } else {
            Payload::Encoded(body)
        };
        Ok(Self {
            from,
            to,
            func,
            seq,
            ret,
            err,
            payload,
        })
    }
}

/// Cuts `s` to at most `max` bytes on a char boundary.
fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_survive_marshalling() {
        let env = Envelope::request(
            "Gate",
            "Echo",
            "Ping",
            42,
            Payload::Local(Box::new(String::from("hi"))),
        );
        let bytes = env.encode(Codec::Json).unwrap();
        let back = Envelope::decode(&bytes).unwrap();
        assert_eq!(back.from, "Gate");
        assert_eq!(back.to, "Echo");
        assert_eq!(back.func, "Ping");
        assert_eq!(back.seq, 42);
        assert_eq!(back.ret, Ret::Request);
        assert_eq!(back.err, "");
        let msg: String = back.payload.take(Codec::Json).unwrap();
        assert_eq!(msg, "hi");
    }

    #[test]
    fn failed_replies_carry_the_error_text() {
        let env = Envelope::response(
            "Echo".into(),
            "Gate".into(),
            7,
            Err(RpcError::NoSuchMethod("Echo.Nope".into())),
        );
        let back = Envelope::decode(&env.encode(Codec::Bincode).unwrap()).unwrap();
        assert_eq!(back.ret, Ret::Response);
        assert_eq!(back.func, "");
        assert_eq!(back.seq, 7);
        assert_eq!(
            RpcError::from_wire(&back.err),
            RpcError::NoSuchMethod("Echo.Nope".into())
        );
        assert!(matches!(back.payload, Payload::Empty));
    }

    #[test]
    fn huge_error_texts_are_clipped_to_stay_decodable() {
        let env = Envelope::response(
            "A".into(),
            "B".into(),
            1,
            Err(RpcError::Handler("é".repeat(DEFAULT_STRING_CEILING))),
        );
        let back = Envelope::decode(&env.encode(Codec::Json).unwrap()).unwrap();
        assert!(back.err.len() <= DEFAULT_STRING_CEILING);
        assert!(back.err.chars().all(|c| c == 'é'));
    }

    #[test]
    fn truncated_headers_are_rejected() {
        let env = Envelope::request("A", "B", "C", 1, Payload::Empty);
        let bytes = env.encode(Codec::Json).unwrap();
        assert!(matches!(
            Envelope::decode(&bytes[..bytes.len() - 3]),
            Err(RpcError::Wire(_))
        ));
        let mut bad = bytes.clone();
        let ret_at = bytes.len() - 5;
        bad[ret_at] = 9;
        assert!(matches!(Envelope::decode(&bad), Err(RpcError::Codec(_))));
    }
}

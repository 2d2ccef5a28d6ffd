use std::{fmt, str::FromStr};

use super::Error;

/// The token a dialer presents during the handshake:
/// `<endpoint>?node=<id>&sig=<signature>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub endpoint: String,
    pub node_id: String,
    pub signature: String,
}

impl Origin {
    pub fn new(
        endpoint: impl Into<String>,
        node_id: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            node_id: node_id.into(),
            signature: signature.into(),
        }
    }

    /// Host and port of the endpoint, without scheme or path.
    pub fn host(&self) -> &str {
        let rest = self
            .endpoint
            .split_once("://")
            .map_or(self.endpoint.as_str(), |(_, rest)| rest);
        rest.split('/').next().unwrap_or(rest)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}?node={}&sig={}",
            self.endpoint, self.node_id, self.signature
        )
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(Error::InvalidOrigin("empty".into()))?
        }
        let (endpoint, query) = s
            .split_once('?')
            .ok_or_else(|| Error::InvalidOrigin(s.to_string()))?;
        let mut node_id = None;
        let mut signature = None;
        for pair in query.split('&') {
            let mut kv = pair.split('=');
            match (kv.next(), kv.next(), kv.next()) {
                (Some("node"), Some(v), None) => node_id = Some(v),
                (Some("sig"), Some(v), None) => signature = Some(v),
                _ => {}
            }
        }
        match (node_id, signature) {
            (Some(node_id), Some(signature)) if !node_id.is_empty() => {
                Ok(Self::new(endpoint, node_id, signature))
            }
            _ => Err(Error::InvalidOrigin(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_what_it_prints() {
        let origin = Origin::new("tcp://10.0.0.1:7000", "echo#ab12", "f00d");
        let text = origin.to_string();
        assert_eq!(text, "tcp://10.0.0.1:7000?node=echo#ab12&sig=f00d");
        assert_eq!(text.parse::<Origin>().unwrap(), origin);
        assert_eq!(origin.host(), "10.0.0.1:7000");
    }

    #[test]
    fn extra_and_malformed_pairs_are_ignored() {
        let origin: Origin = "ws://h:1/gate?x=1&node=n#1&bad&sig=s"
            .parse()
            .unwrap();
        assert_eq!(origin.node_id, "n#1");
        assert_eq!(origin.signature, "s");
        assert_eq!(origin.host(), "h:1");
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!("".parse::<Origin>().is_err());
        assert!("tcp://h:1".parse::<Origin>().is_err());
        assert!("tcp://h:1?node=a".parse::<Origin>().is_err());
        assert!("tcp://h:1?sig=a".parse::<Origin>().is_err());
        assert!("tcp://h:1?node=&sig=a".parse::<Origin>().is_err());
    }

    #[test]
    fn empty_signatures_are_allowed() {
        let origin: Origin = "tcp://h:1?node=a#1&sig=".parse().unwrap();
        assert_eq!(origin.signature, "");
    }
}

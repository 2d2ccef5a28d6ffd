//! Node identities.
//!
//! A node id is `name#suffix`: the name is the service class shared by every
//! instance, the suffix tells instances apart. Callers that could not be
//! verified get an id under the reserved guest prefix and are kept away from
//! inner-only peers.

/// Reserved prefix of unauthenticated node ids.
pub const GUEST_PREFIX: &str = "!guest";

const SEPARATOR: char = '#';

/// Returns the service name part of a node id.
pub fn node_name(node_id: &str) -> &str {
    node_id.split(SEPARATOR).next().unwrap_or(node_id)
}

pub fn is_guest(node_id: &str) -> bool {
    node_id.starts_with(GUEST_PREFIX)
}

/// Mints a fresh node id for the given service name.
pub fn mint(name: &str) -> String {
    format!("{}{}{}", name, SEPARATOR, unique_suffix())
}

/// Normalises a configured id so that it always carries the `name#` prefix.
pub fn qualify(name: &str, node_id: &str) -> String {
    let prefix = format!("{}{}", name, SEPARATOR);
    if node_id.starts_with(&prefix) {
        node_id.to_string()
    } else {
        format!("{}{}", prefix, node_id)
    }
}

/// Builds the guest id handed to a caller we could not verify. A claimed id is
/// kept as the suffix so logs still say who the caller pretended to be.
pub fn guest_id(claimed: Option<&str>) -> String {
    match claimed {
        Some(id) if is_guest(id) => id.to_string(),
        Some(id) if !id.is_empty() => format!("{}{}{}", GUEST_PREFIX, SEPARATOR, id),
        _ => format!("{}{}{}", GUEST_PREFIX, SEPARATOR, unique_suffix()),
    }
}

/// Derives the signature a node publishes to the registry. Dialers present it
/// in their origin token and the registry vouches for it.
pub fn signature(node_id: &str, name: &str) -> String {
    let seed = format!(
        "?nodeid={}&name={}&sf={}",
        node_id,
        name,
        unique_suffix()
    );
    blake3::hash(seed.as_bytes()).to_hex().to_string()
}

fn unique_suffix() -> String {
    format!("{:016x}", rand::random::<u64>())
}

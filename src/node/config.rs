use std::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{net::NetConfig, peer::ExchangeConfig};

/// How a node is set up. Hosts build it in code.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NodeConfig {
    /// Service name shared by every instance, the part of the node id before
    /// `#`.
    #[builder(setter(into))]
    pub name: String,
    /// Fixed node id. A fresh one is minted when absent.
    #[builder(default, setter(strip_option, into))]
    pub node_id: Option<String>,
    /// Urls to listen on. The first one is advertised in the origin this
    /// node presents when dialing.
    #[builder(default)]
    pub endpoints: Vec<String>,
    /// Accept callers the registry cannot vouch for, as guests.
    #[builder(default)]
    pub is_pub: bool,
    /// Service names this node dials as soon as the registry lists them.
    #[builder(default)]
    pub backends: Vec<String>,
    #[builder(default = Duration::from_secs(2))]
    pub scan_interval: Duration,
    #[builder(default)]
    pub user_data: HashMap<String, serde_json::Value>,
    #[builder(default)]
    pub net: NetConfig,
    #[builder(default)]
    pub exchange: ExchangeConfig,
}

/// What a node publishes about itself to the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub name: String,
    pub endpoints: Vec<String>,
    pub is_pub: bool,
    pub backends: Vec<String>,
    /// Proof of identity the registry checks dialers against.
    pub sig: String,
    #[serde(default)]
    pub user_data: HashMap<String, serde_json::Value>,
}

impl NodeInfo {
    pub(crate) fn new(node_id: String, sig: String, config: &NodeConfig) -> Self {
        Self {
            node_id,
            name: config.name.clone(),
            endpoints: config.endpoints.clone(),
            is_pub: config.is_pub,
            backends: config.backends.clone(),
            sig,
            user_data: config.user_data.clone(),
        }
    }
}

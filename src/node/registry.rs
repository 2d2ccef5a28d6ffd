use hashbrown::HashMap;
use parking_lot::RwLock;

use super::NodeInfo;
use crate::{error::Error, ident};

/// The cluster directory a node registers with and looks other nodes up in.
pub trait Registry: Send + Sync + 'static {
    fn register(&self, info: &NodeInfo) -> Result<(), Error>;

    fn deregister(&self, node_id: &str) -> Result<(), Error>;

    fn node(&self, node_id: &str) -> Result<Option<NodeInfo>, Error>;

    /// Every registered node of the service `name`.
    fn select(&self, name: &str) -> Result<Vec<NodeInfo>, Error>;

    /// Whether `sig` is the signature `node_id` registered with.
    fn check_signature(&self, node_id: &str, sig: &str) -> Result<bool, Error>;
}

/// A registry that lives in this process. Nodes sharing one can find and
/// verify each other.
#[derive(Default)]
pub struct MemoryRegistry {
    nodes: RwLock<HashMap<String, NodeInfo>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl Registry for MemoryRegistry {
    fn register(&self, info: &NodeInfo) -> Result<(), Error> {
        if info.node_id.is_empty() {
            Err(Error::Registry("node id is empty".into()))?
        }
        self.nodes.write().insert(info.node_id.clone(), info.clone());
        Ok(())
    }

    fn deregister(&self, node_id: &str) -> Result<(), Error> {
        self.nodes.write().remove(node_id);
        Ok(())
    }

    fn node(&self, node_id: &str) -> Result<Option<NodeInfo>, Error> {
        Ok(self.nodes.read().get(node_id).cloned())
    }

    fn select(&self, name: &str) -> Result<Vec<NodeInfo>, Error> {
        let mut infos: Vec<NodeInfo> = self
            .nodes
            .read()
            .values()
            .filter(|info| ident::node_name(&info.node_id) == name)
            .cloned()
            .collect();
        infos.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(infos)
    }

    fn check_signature(&self, node_id: &str, sig: &str) -> Result<bool, Error> {
        Ok(!sig.is_empty()
            && self
                .nodes
                .read()
                .get(node_id)
                .map_or(false, |info| info.sig == sig))
    }
}

use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::{Axon, Error};
use crate::{ident, peer::Transport};

#[derive(Default)]
struct Tables {
    /// node name -> node id -> axon
    by_name: HashMap<String, HashMap<String, Arc<Axon>>>,
    /// connection key -> node id
    by_key: HashMap<u64, String>,
}

/// Every admitted axon of an endpoint, indexed by node id and by connection
/// key. Both indexes change together under one write lock.
#[derive(Default)]
pub struct AxonRegistry {
    tables: RwLock<Tables>,
}

impl AxonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an axon. Refused if its node id or its connection key is
    /// already present.
    pub fn admit(&self, axon: Arc<Axon>) -> Result<(), Error> {
        let mut tables = self.tables.write();
        let name = ident::node_name(axon.node_id());
        let taken = tables
            .by_name
            .get(name)
            .map_or(false, |ids| ids.contains_key(axon.node_id()));
        if taken || tables.by_key.contains_key(&axon.key()) {
            Err(Error::Duplicate(axon.node_id().to_string()))?
        }
        tables.by_key.insert(axon.key(), axon.node_id().to_string());
        tables
            .by_name
            .entry(name.to_string())
            .or_default()
            .insert(axon.node_id().to_string(), axon);
        Ok(())
    }

    /// Removes the axon registered under `node_id` if it is the one with
    /// connection `key`. Of several racing removers exactly one gets it.
    pub fn remove(&self, node_id: &str, key: u64) -> Option<Arc<Axon>> {
        let mut tables = self.tables.write();
        let name = ident::node_name(node_id);
        let ids = tables.by_name.get_mut(name)?;
        if ids.get(node_id)?.key() != key {
            return None;
        }
        let axon = ids.remove(node_id)?;
        if ids.is_empty() {
            tables.by_name.remove(name);
        }
        tables.by_key.remove(&key);
        Some(axon)
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<Axon>> {
        self.tables
            .read()
            .by_name
            .get(ident::node_name(node_id))?
            .get(node_id)
            .cloned()
    }

    pub fn node_id_of(&self, key: u64) -> Option<String> {
        self.tables.read().by_key.get(&key).cloned()
    }

    /// Ids of the connected nodes named `name`.
    pub fn node_ids(&self, name: &str) -> Vec<String> {
        self.tables
            .read()
            .by_name
            .get(name)
            .map(|ids| ids.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn axons(&self) -> Vec<Arc<Axon>> {
        self.tables
            .read()
            .by_name
            .values()
            .flat_map(|ids| ids.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn send(&self, node_id: &str, payload: &[u8]) -> Result<(), Error> {
        let axon = self
            .get(node_id)
            .ok_or_else(|| Error::NotConnected(node_id.to_string()))?;
        axon.send(payload).await
    }
}

impl Transport for AxonRegistry {
    fn send<'a>(
        &'a self,
        node_id: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move { AxonRegistry::send(self, node_id, &payload).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::{
        net::{link::LinkWriter, Protocol},
        process::ProcessTable,
    };

    async fn axon(table: &ProcessTable, node_id: &str, key: u64) -> Arc<Axon> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        let (_, write) = stream.unwrap().into_split();
        Arc::new(Axon::new(
            node_id.to_string(),
            format!("tcp://{addr}"),
            Protocol::Tcp,
            key,
            table.spawn_service(),
            LinkWriter::Tcp(write),
        ))
    }

    #[tokio::test]
    async fn indexes_move_together() {
        let table = ProcessTable::default();
        let registry = AxonRegistry::new();
        registry.admit(axon(&table, "echo#1", 1).await).unwrap();
        registry.admit(axon(&table, "echo#2", 2).await).unwrap();
        registry.admit(axon(&table, "gate#1", 3).await).unwrap();

        let mut echoes = registry.node_ids("echo");
        echoes.sort();
        assert_eq!(echoes, ["echo#1", "echo#2"]);
        assert_eq!(registry.node_id_of(3).as_deref(), Some("gate#1"));
        assert_eq!(registry.len(), 3);

        assert!(registry.remove("gate#1", 3).is_some());
        assert!(registry.get("gate#1").is_none());
        assert!(registry.node_id_of(3).is_none());
        assert!(registry.node_ids("gate").is_empty());
        assert_eq!(registry.axons().len(), 2);
    }

    #[tokio::test]
    async fn duplicates_are_refused() {
        let table = ProcessTable::default();
        let registry = AxonRegistry::new();
        registry.admit(axon(&table, "echo#1", 1).await).unwrap();
        assert!(matches!(
            registry.admit(axon(&table, "echo#1", 2).await),
            Err(Error::Duplicate(_))
        ));
        assert!(matches!(
            registry.admit(axon(&table, "echo#9", 1).await),
            Err(Error::Duplicate(_))
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo#1").unwrap().key(), 1);
    }

    #[tokio::test]
    async fn only_the_matching_key_removes() {
        let table = ProcessTable::default();
        let registry = AxonRegistry::new();
        registry.admit(axon(&table, "echo#1", 1).await).unwrap();
        assert!(registry.remove("echo#1", 7).is_none());
        assert!(registry.remove("echo#1", 1).is_some());
        assert!(registry.remove("echo#1", 1).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn sending_to_a_stranger_fails() {
        let registry = AxonRegistry::new();
        assert!(matches!(
            registry.send("nobody#1", b"hi").await,
            Err(Error::NotConnected(_))
        ));
    }
}

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

/// What a consumer can learn about one running node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub index: usize,
    pub tx_manager_container: Option<String>,
    pub tx_manager_ip: Option<Ipv4Addr>,
    pub tx_manager_url: Option<String>,
    /// Base64 encoded public key of the tx-manager.
    pub tx_manager_public_key: Option<String>,
    pub ledger_container: Option<String>,
    pub ledger_ip: Option<Ipv4Addr>,
    pub rpc_url: Option<String>,
    pub enode: Option<String>,
    pub default_account: Option<String>,
}

/// Read-only view of the nodes a builder currently tracks.
///
/// Cloning is cheap; hand a clone to whatever serves queries instead of
/// keeping the builder in a global.
#[derive(Debug, Clone, Default)]
pub struct NodeDirectory {
    nodes: Arc<RwLock<Vec<NodeInfo>>>,
}

impl NodeDirectory {
    pub async fn list(&self) -> Vec<NodeInfo> {
        self.nodes.read().await.clone()
    }

    pub async fn get(&self, index: usize) -> Option<NodeInfo> {
        self.nodes.read().await.get(index).cloned()
    }

    /// Applies `update` to the entry of `index`, creating entries up to it.
    pub(crate) async fn update(&self, index: usize, update: impl FnOnce(&mut NodeInfo)) {
        let mut nodes = self.nodes.write().await;
        while nodes.len() <= index {
            let next = nodes.len();
            nodes.push(NodeInfo {
                index: next,
                ..Default::default()
            });
        }
        update(&mut nodes[index]);
    }

    pub(crate) async fn clear(&self) {
        self.nodes.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_fills_gaps_and_get_is_by_index() {
        let directory = NodeDirectory::default();
        directory
            .update(2, |node| {
                node.rpc_url = Some("http://10.0.0.4:8545".to_string())
            })
            .await;
        let nodes = directory.list().await;
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[1].index, 1);
        assert_eq!(
            directory.get(2).await.unwrap().rpc_url.as_deref(),
            Some("http://10.0.0.4:8545")
        );
        assert_eq!(directory.get(3).await, None);

        let view = directory.clone();
        directory.clear().await;
        assert!(view.list().await.is_empty());
    }
}

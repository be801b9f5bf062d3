use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::bootstrap::{GenesisDoc, NodeIdentity};
use crate::container::{ContainerConfig, ContainerLifecycle, ContainerUnit, Role};
use crate::engine::{ContainerEngine, ContainerSpec};

const GENESIS_FILE: &str = "genesis.json";
const CONTAINER_DATA_DIR: &str = "/data";

/// Material prepared for a ledger node before it can start.
#[derive(Debug, Clone)]
pub struct LedgerMaterial {
    pub identity: NodeIdentity,
    pub genesis: Arc<GenesisDoc>,
    pub rpc_port: u16,
    /// URL of the paired tx-manager.
    pub tx_manager_url: Option<String>,
}

/// The consensus participating service of one node.
pub struct LedgerNode {
    unit: ContainerUnit,
    engine: Arc<dyn ContainerEngine>,
    material: LedgerMaterial,
}

impl LedgerNode {
    /// Writes the shared genesis into the node's data directory.
    pub async fn new(
        engine: Arc<dyn ContainerEngine>,
        config: ContainerConfig,
        material: LedgerMaterial,
    ) -> Result<Self> {
        let path = material.identity.data_dir.join(GENESIS_FILE);
        tokio::fs::write(&path, material.genesis.to_json()?)
            .await
            .with_context(|| format!("can't write {}", path.display()))?;
        Ok(Self {
            unit: ContainerUnit::new(Role::LedgerNode, config),
            engine,
            material,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.material.identity
    }

    pub fn rpc_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.material.identity.address, self.material.rpc_port
        )
    }

    fn container_spec(&self) -> ContainerSpec {
        let config = &self.unit.config;
        let identity = &self.material.identity;
        let mut spec = config.container_spec(Role::LedgerNode);
        spec.env = config.environment(vec![
            ("NODE_INDEX", config.node_index.to_string()),
            ("NODE_COUNT", config.node_count.to_string()),
            ("MY_IP", identity.address.to_string()),
            ("P2P_PORT", identity.p2p_port.to_string()),
            ("RPC_PORT", self.material.rpc_port.to_string()),
            ("NODE_ID", identity.node_id.clone()),
            ("DEFAULT_ACCOUNT", identity.default_account.clone()),
            (
                "TX_MANAGER_URL",
                self.material.tx_manager_url.clone().unwrap_or_default(),
            ),
        ]);
        spec.binds = vec![format!("{}:{}", identity.data_dir.display(), CONTAINER_DATA_DIR)];
        spec
    }
}

#[async_trait]
impl ContainerLifecycle for LedgerNode {
    fn unit(&self) -> &ContainerUnit {
        &self.unit
    }

    async fn start(&mut self) -> Result<()> {
        let spec = self.container_spec();
        self.unit.launch(&self.engine, spec).await
    }

    async fn stop(&self) -> Result<()> {
        self.unit.halt(&self.engine).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    use super::*;
    use crate::bootstrap::{Bootstrap, LocalBootstrap};
    use crate::test_utils::FakeEngine;
    use crate::utils::generate_random_string;

    #[tokio::test]
    async fn start_passes_identity_and_genesis() {
        let dir = std::env::temp_dir().join(format!("ledger-test-{}", generate_random_string(8)));
        let bootstrap = LocalBootstrap::new(21000);
        let address = Ipv4Addr::new(10, 10, 0, 7);
        let identities = bootstrap
            .generate_node_identities(&dir, 1, &[address])
            .await
            .unwrap();
        let genesis = bootstrap
            .generate_genesis(&identities, "raft", &BTreeMap::new())
            .await
            .unwrap();
        let identity = identities[0].clone();

        let engine = Arc::new(FakeEngine::default());
        let config = ContainerConfig::new("quorum:latest")
            .with_provision_id("ledger-test")
            .with_my_ip(address);
        let material = LedgerMaterial {
            identity: identity.clone(),
            genesis: Arc::new(genesis),
            rpc_port: 8545,
            tx_manager_url: Some("http://10.10.0.2:9000".to_string()),
        };
        let mut node = LedgerNode::new(engine.clone(), config, material)
            .await
            .unwrap();
        assert!(identity.data_dir.join(GENESIS_FILE).is_file());
        assert_eq!(node.rpc_url(), "http://10.10.0.7:8545");

        node.start().await.unwrap();
        assert!(node.unit().container_id.is_some());
        let spec = engine.container_spec("ledger-test-node-0").unwrap();
        assert!(spec.env.contains(&format!("NODE_ID={}", identity.node_id)));
        assert!(spec
            .env
            .contains(&"TX_MANAGER_URL=http://10.10.0.2:9000".to_string()));
        assert_eq!(
            spec.binds,
            vec![format!("{}:/data", identity.data_dir.display())]
        );
        std::fs::remove_dir_all(dir).unwrap();
    }
}

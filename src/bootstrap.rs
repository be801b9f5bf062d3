//! Identity, permissioning and genesis material for ledger nodes.
//!
//! The builder only talks to the [`Bootstrap`] trait. [`LocalBootstrap`] is a
//! self-contained implementation good enough for local test networks: it
//! derives node ids from ed25519 keys and emits a minimal genesis document.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use log::debug;
use serde_json::{json, Map, Value};

use crate::errors::QuorumContainerError::{GenesisGeneration, IdentityGeneration};
use crate::utils::get_account_address;

const PERMISSIONED_NODES_FILE: &str = "permissioned-nodes.json";
const STATIC_NODES_FILE: &str = "static-nodes.json";
const NODE_KEY_FILE: &str = "nodekey";
const DEFAULT_BALANCE: &str = "1000000000000000000000000000";
const ISTANBUL_MIX_HASH: &str =
    "0x63746963616c2062797a616e74696e65206661756c7420746f6c6572616e6365";
const CHAIN_ID: u64 = 10;

/// Identity of one ledger node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub index: usize,
    pub address: Ipv4Addr,
    pub p2p_port: u16,
    /// Hex encoded public node key.
    pub node_id: String,
    pub default_account: String,
    pub data_dir: PathBuf,
}

impl NodeIdentity {
    pub fn enode(&self) -> String {
        format!(
            "enode://{}@{}:{}?discport=0",
            self.node_id, self.address, self.p2p_port
        )
    }
}

/// Genesis description shared by every node of a network.
#[derive(Debug, Clone, PartialEq)]
pub struct GenesisDoc {
    pub consensus: String,
    pub document: Value,
}

impl GenesisDoc {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.document)?)
    }
}

/// Produces the per-node and network-wide material ledger nodes need.
#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Creates `count` identities, the i-th bound to `addresses[i]`, each with
    /// its own data directory under `work_dir`.
    async fn generate_node_identities(
        &self,
        work_dir: &Path,
        count: usize,
        addresses: &[Ipv4Addr],
    ) -> Result<Vec<NodeIdentity>>;

    /// Records the full peer list where every node will find it.
    async fn write_permissioned_peers(&self, nodes: &[NodeIdentity]) -> Result<()>;

    async fn generate_genesis(
        &self,
        nodes: &[NodeIdentity],
        consensus_name: &str,
        consensus_config: &BTreeMap<String, String>,
    ) -> Result<GenesisDoc>;
}

/// [`Bootstrap`] that keeps everything on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalBootstrap {
    p2p_port: u16,
}

impl LocalBootstrap {
    pub fn new(p2p_port: u16) -> Self {
        Self { p2p_port }
    }

    async fn create_identity(
        &self,
        work_dir: &Path,
        index: usize,
        address: Ipv4Addr,
    ) -> Result<NodeIdentity> {
        let signing_key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let public_key = signing_key.verifying_key().to_bytes();

        let data_dir = work_dir.join(format!("node-{}", index));
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("create {}", data_dir.display()))?;
        tokio::fs::write(
            data_dir.join(NODE_KEY_FILE),
            hex::encode(signing_key.to_bytes()),
        )
        .await?;

        Ok(NodeIdentity {
            index,
            address,
            p2p_port: self.p2p_port,
            node_id: hex::encode(public_key),
            default_account: get_account_address(&public_key),
            data_dir,
        })
    }
}

/// Consensus config values that look like integers become JSON numbers.
fn config_value(raw: &str) -> Value {
    raw.parse::<u64>()
        .map(Value::from)
        .or_else(|_| raw.parse::<bool>().map(Value::from))
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[async_trait]
impl Bootstrap for LocalBootstrap {
    async fn generate_node_identities(
        &self,
        work_dir: &Path,
        count: usize,
        addresses: &[Ipv4Addr],
    ) -> Result<Vec<NodeIdentity>> {
        if addresses.len() != count {
            let message = format!("{} addresses for {} nodes", addresses.len(), count);
            return Err(IdentityGeneration(message).into());
        }
        let mut nodes = Vec::with_capacity(count);
        for (index, address) in addresses.iter().enumerate() {
            let node = self
                .create_identity(work_dir, index, *address)
                .await
                .map_err(|err| {
                    IdentityGeneration(format!("node {}: {:#}", index, err))
                })?;
            debug!("Generated identity for node {}: {}", index, node.enode());
            nodes.push(node);
        }
        Ok(nodes)
    }

    async fn write_permissioned_peers(&self, nodes: &[NodeIdentity]) -> Result<()> {
        let enodes: Vec<String> = nodes.iter().map(NodeIdentity::enode).collect();
        let content = serde_json::to_string_pretty(&enodes)?;
        for node in nodes {
            for file in [PERMISSIONED_NODES_FILE, STATIC_NODES_FILE] {
                let path = node.data_dir.join(file);
                tokio::fs::write(&path, &content).await.map_err(|err| {
                    IdentityGeneration(format!("write {}: {}", path.display(), err))
                })?;
            }
        }
        Ok(())
    }

    async fn generate_genesis(
        &self,
        nodes: &[NodeIdentity],
        consensus_name: &str,
        consensus_config: &BTreeMap<String, String>,
    ) -> Result<GenesisDoc> {
        let mut config = json!({
            "chainId": CHAIN_ID,
            "homesteadBlock": 0,
            "byzantiumBlock": 0,
            "eip150Block": 0,
            "eip155Block": 0,
            "eip158Block": 0,
            "isQuorum": true,
        });
        let consensus: Map<String, Value> = consensus_config
            .iter()
            .map(|(key, value)| (key.clone(), config_value(value)))
            .collect();

        let (difficulty, mix_hash, extra_data) = match consensus_name {
            "raft" => {
                config["raft"] = Value::Object(consensus);
                (
                    "0x0",
                    format!("0x{}", "0".repeat(64)),
                    format!("0x{}", "0".repeat(64)),
                )
            }
            "istanbul" => {
                config["istanbul"] = Value::Object(consensus);
                // 32 byte vanity followed by the validator addresses
                let validators: String = nodes
                    .iter()
                    .map(|node| node.default_account.trim_start_matches("0x"))
                    .collect();
                (
                    "0x1",
                    ISTANBUL_MIX_HASH.to_string(),
                    format!("0x{}{}", "0".repeat(64), validators),
                )
            }
            other => {
                let message = format!("unsupported consensus {}", other);
                return Err(GenesisGeneration(message).into());
            }
        };

        let alloc: Map<String, Value> = nodes
            .iter()
            .map(|node| {
                (
                    node.default_account.trim_start_matches("0x").to_string(),
                    json!({ "balance": DEFAULT_BALANCE }),
                )
            })
            .collect();

        let document = json!({
            "alloc": alloc,
            "coinbase": format!("0x{}", "0".repeat(40)),
            "config": config,
            "difficulty": difficulty,
            "extraData": extra_data,
            "gasLimit": "0xE0000000",
            "mixHash": mix_hash,
            "nonce": "0x0",
            "parentHash": format!("0x{}", "0".repeat(64)),
            "timestamp": "0x00",
        });
        Ok(GenesisDoc {
            consensus: consensus_name.to_string(),
            document,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::QuorumContainerError;
    use crate::utils::generate_random_string;

    fn work_dir() -> PathBuf {
        std::env::temp_dir().join(format!("bootstrap-test-{}", generate_random_string(8)))
    }

    fn addresses(count: u8) -> Vec<Ipv4Addr> {
        (0..count)
            .map(|i| Ipv4Addr::new(10, 0, 0, 10 + i))
            .collect()
    }

    #[tokio::test]
    async fn identities_follow_address_order() {
        let dir = work_dir();
        let bootstrap = LocalBootstrap::new(21000);
        let nodes = bootstrap
            .generate_node_identities(&dir, 3, &addresses(3))
            .await
            .unwrap();
        assert_eq!(nodes.len(), 3);
        for (index, node) in nodes.iter().enumerate() {
            assert_eq!(node.index, index);
            assert_eq!(node.address, Ipv4Addr::new(10, 0, 0, 10 + index as u8));
            assert_eq!(node.node_id.len(), 64);
            assert!(node.data_dir.join(NODE_KEY_FILE).is_file());
            assert!(node
                .enode()
                .ends_with(&format!("@10.0.0.{}:21000?discport=0", 10 + index)));
        }
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn mismatched_address_count_is_identity_error() {
        let err = LocalBootstrap::new(21000)
            .generate_node_identities(&work_dir(), 3, &addresses(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QuorumContainerError>(),
            Some(QuorumContainerError::IdentityGeneration(_))
        ));
    }

    #[tokio::test]
    async fn peers_file_lists_every_node_in_every_data_dir() {
        let dir = work_dir();
        let bootstrap = LocalBootstrap::new(21000);
        let nodes = bootstrap
            .generate_node_identities(&dir, 2, &addresses(2))
            .await
            .unwrap();
        bootstrap.write_permissioned_peers(&nodes).await.unwrap();
        for node in &nodes {
            let content =
                std::fs::read_to_string(node.data_dir.join(PERMISSIONED_NODES_FILE)).unwrap();
            let enodes: Vec<String> = serde_json::from_str(&content).unwrap();
            assert_eq!(enodes, vec![nodes[0].enode(), nodes[1].enode()]);
        }
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn genesis_merges_consensus_config_and_funds_accounts() {
        let dir = work_dir();
        let bootstrap = LocalBootstrap::new(21000);
        let nodes = bootstrap
            .generate_node_identities(&dir, 2, &addresses(2))
            .await
            .unwrap();
        let mut consensus = BTreeMap::new();
        consensus.insert("epoch".to_string(), "30000".to_string());
        consensus.insert("policy".to_string(), "0".to_string());
        let genesis = bootstrap
            .generate_genesis(&nodes, "istanbul", &consensus)
            .await
            .unwrap();
        let document = &genesis.document;
        assert_eq!(document["config"]["istanbul"]["epoch"], json!(30000));
        assert_eq!(document["mixHash"], json!(ISTANBUL_MIX_HASH));
        for node in &nodes {
            let account = node.default_account.trim_start_matches("0x");
            assert_eq!(document["alloc"][account]["balance"], json!(DEFAULT_BALANCE));
        }
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn unknown_consensus_is_genesis_error() {
        let err = LocalBootstrap::new(21000)
            .generate_genesis(&[], "clique-ish", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QuorumContainerError>(),
            Some(QuorumContainerError::GenesisGeneration(_))
        ));
    }
}

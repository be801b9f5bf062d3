use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{ensure, Result};
use async_trait::async_trait;
use log::debug;

use crate::engine::{ContainerEngine, ContainerSpec, Labels, NetworkAttachment};

/// Label carrying the build name on every resource of a build.
pub const BUILD_ID_LABEL: &str = "com.quorum.testcontainer.id";
/// Label carrying the [`Role`] of a container.
pub const ROLE_LABEL: &str = "com.quorum.testcontainer.role";
/// Label carrying the node index of a container.
pub const INDEX_LABEL: &str = "com.quorum.testcontainer.index";

/// What a container does within a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    TxManager,
    LedgerNode,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::TxManager => "tx-manager",
            Role::LedgerNode => "ledger-node",
        }
    }

    fn short_name(&self) -> &'static str {
        match self {
            Role::TxManager => "tm",
            Role::LedgerNode => "node",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to parameterize a container before it is created.
///
/// Each `with_*` setter owns a distinct field, so the order in which they are
/// applied does not matter. Unset fields keep these defaults: node index 0,
/// node count 1, no address, no network, empty labels and caller config, the
/// system temp dir as working directory and `"default"` as provision id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub image: String,
    pub provision_id: String,
    pub node_index: usize,
    pub node_count: usize,
    pub my_ip: Option<Ipv4Addr>,
    pub network_id: Option<String>,
    pub temp_dir: PathBuf,
    pub labels: Labels,
    /// Free-form caller settings, passed to the container as environment.
    pub config: BTreeMap<String, String>,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            provision_id: "default".to_string(),
            node_index: 0,
            node_count: 1,
            my_ip: None,
            network_id: None,
            temp_dir: std::env::temp_dir(),
            labels: Labels::new(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_provision_id(mut self, provision_id: impl Into<String>) -> Self {
        self.provision_id = provision_id.into();
        self
    }

    pub fn with_node_index(mut self, node_index: usize) -> Self {
        self.node_index = node_index;
        self
    }

    pub fn with_node_count(mut self, node_count: usize) -> Self {
        self.node_count = node_count;
        self
    }

    pub fn with_my_ip(mut self, my_ip: Ipv4Addr) -> Self {
        self.my_ip = Some(my_ip);
        self
    }

    pub fn with_network(mut self, network_id: impl Into<String>) -> Self {
        self.network_id = Some(network_id.into());
        self
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_config(mut self, config: BTreeMap<String, String>) -> Self {
        self.config = config;
        self
    }

    /// Name of the long-running container of `role` for this node.
    pub fn container_name(&self, role: Role) -> String {
        format!(
            "{}-{}-{}",
            self.provision_id,
            role.short_name(),
            self.node_index
        )
    }

    /// Build labels plus the role and index of this unit.
    pub fn unit_labels(&self, role: Role) -> Labels {
        let mut labels = self.labels.clone();
        labels.insert(ROLE_LABEL.to_string(), role.to_string());
        labels.insert(INDEX_LABEL.to_string(), self.node_index.to_string());
        labels
    }

    /// Caller config followed by `extra`; `extra` wins on duplicate keys.
    pub fn environment(&self, extra: Vec<(&str, String)>) -> Vec<String> {
        let mut env = self.config.clone();
        for (key, value) in extra {
            env.insert(key.to_string(), value);
        }
        env.into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }

    /// Spec of the long-running container for `role`, attached to the build
    /// network at `my_ip` when both are set.
    pub fn container_spec(&self, role: Role) -> ContainerSpec {
        let network = match (&self.network_id, self.my_ip) {
            (Some(network_id), Some(ipv4)) => Some(NetworkAttachment {
                network_id: network_id.clone(),
                ipv4,
            }),
            _ => None,
        };
        ContainerSpec {
            name: Some(self.container_name(role)),
            image: self.image.clone(),
            labels: self.unit_labels(role),
            network,
            ..Default::default()
        }
    }
}

/// One node's container for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerUnit {
    pub index: usize,
    pub role: Role,
    pub config: ContainerConfig,
    pub container_id: Option<String>,
}

impl ContainerUnit {
    pub fn new(role: Role, config: ContainerConfig) -> Self {
        Self {
            index: config.node_index,
            role,
            config,
            container_id: None,
        }
    }

    /// Creates and starts `spec`. A unit is started at most once.
    pub(crate) async fn launch(
        &mut self,
        engine: &Arc<dyn ContainerEngine>,
        spec: ContainerSpec,
    ) -> Result<()> {
        ensure!(
            self.container_id.is_none(),
            "{} {} already started",
            self.role,
            self.index
        );
        let id = engine.create_container(&spec).await?;
        debug!("Start {} {} as {}", self.role, self.index, id);
        engine.start_container(&id).await?;
        self.container_id = Some(id);
        Ok(())
    }

    pub(crate) async fn halt(&self, engine: &Arc<dyn ContainerEngine>) -> Result<()> {
        match &self.container_id {
            Some(id) => {
                debug!("Stop {} {} ({})", self.role, self.index, id);
                engine.stop_container(id).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// A unit that can realize itself as a running container.
///
/// "Started" means the engine accepted the start call; nothing waits for the
/// service inside to answer.
#[async_trait]
pub trait ContainerLifecycle: Send + Sync {
    fn unit(&self) -> &ContainerUnit;

    async fn start(&mut self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setter_order_does_not_matter() {
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        let a = ContainerConfig::new("quorum:latest")
            .with_node_index(2)
            .with_my_ip(ip)
            .with_provision_id("net")
            .with_node_count(4);
        let b = ContainerConfig::new("quorum:latest")
            .with_node_count(4)
            .with_provision_id("net")
            .with_my_ip(ip)
            .with_node_index(2);
        assert_eq!(a, b);
    }

    #[test]
    fn unset_fields_keep_defaults() {
        let config = ContainerConfig::new("tessera");
        assert_eq!(config.node_index, 0);
        assert_eq!(config.node_count, 1);
        assert_eq!(config.my_ip, None);
        assert_eq!(config.provision_id, "default");
        assert_eq!(config.temp_dir, std::env::temp_dir());
    }

    #[test]
    fn environment_lets_fixed_values_win() {
        let mut caller = BTreeMap::new();
        caller.insert("VERBOSITY".to_string(), "5".to_string());
        caller.insert("NODE_INDEX".to_string(), "99".to_string());
        let config = ContainerConfig::new("quorum")
            .with_node_index(1)
            .with_config(caller);
        let env = config.environment(vec![("NODE_INDEX", "1".to_string())]);
        assert_eq!(env, vec!["NODE_INDEX=1", "VERBOSITY=5"]);
    }

    #[test]
    fn spec_carries_role_labels_and_attachment() {
        let mut labels = Labels::new();
        labels.insert(BUILD_ID_LABEL.to_string(), "net".to_string());
        let config = ContainerConfig::new("quorum")
            .with_provision_id("net")
            .with_node_index(3)
            .with_labels(labels)
            .with_network("n1")
            .with_my_ip(Ipv4Addr::new(10, 0, 0, 9));
        let spec = config.container_spec(Role::LedgerNode);
        assert_eq!(spec.name.as_deref(), Some("net-node-3"));
        assert_eq!(spec.labels[ROLE_LABEL], "ledger-node");
        assert_eq!(spec.labels[INDEX_LABEL], "3");
        assert_eq!(spec.labels[BUILD_ID_LABEL], "net");
        assert_eq!(spec.network.unwrap().ipv4, Ipv4Addr::new(10, 0, 0, 9));
    }
}

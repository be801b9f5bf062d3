use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use log::{debug, warn};

use crate::container::{ContainerConfig, ContainerLifecycle, ContainerUnit, Role};
use crate::engine::{ContainerEngine, ContainerSpec};
use crate::errors::QuorumContainerError::KeyGeneration;
use crate::utils::generate_random_string;

const CONTAINER_WORKING_DIR: &str = "/tm";
const KEYGEN_COMMAND: &str = "echo \"\n\" | java -jar /tessera/tessera-app.jar -keygen";
const PUBLIC_KEY_FILE: &str = ".pub";
const PRIVATE_KEY_FILE: &str = ".key";

/// Key pair produced by the tx-manager key generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

impl KeyPair {
    pub fn public_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.public)
    }

    pub fn private_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.private)
    }
}

/// The private transaction manager paired with one ledger node.
pub struct TxManager {
    unit: ContainerUnit,
    engine: Arc<dyn ContainerEngine>,
    keys: KeyPair,
    key_dir: PathBuf,
    port: u16,
    peers: Vec<Ipv4Addr>,
}

impl TxManager {
    /// Generates the key pair of this tx-manager. The long-running container
    /// is only created by [`ContainerLifecycle::start`].
    ///
    /// `peers` are the addresses of every tx-manager of the network,
    /// including this one.
    pub async fn new(
        engine: Arc<dyn ContainerEngine>,
        config: ContainerConfig,
        port: u16,
        peers: Vec<Ipv4Addr>,
    ) -> Result<Self> {
        let key_dir_name = format!("tm-{}-{}", config.node_index, generate_random_string(6));
        let key_dir = config.temp_dir.join(key_dir_name);
        tokio::fs::create_dir_all(&key_dir)
            .await
            .with_context(|| format!("can't create key dir {}", key_dir.display()))?;

        let keys = Self::generate_keys(&engine, &config, &key_dir).await?;
        Ok(Self {
            unit: ContainerUnit::new(Role::TxManager, config),
            engine,
            keys,
            key_dir,
            port,
            peers,
        })
    }

    /// Runs the key generator in an ephemeral container writing into
    /// `key_dir`, then reads the two key files back.
    async fn generate_keys(
        engine: &Arc<dyn ContainerEngine>,
        config: &ContainerConfig,
        key_dir: &Path,
    ) -> Result<KeyPair> {
        let spec = ContainerSpec {
            name: Some(format!(
                "{}-keygen-{}",
                config.container_name(Role::TxManager),
                generate_random_string(6)
            )),
            image: config.image.clone(),
            entrypoint: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                KEYGEN_COMMAND.to_string(),
            ]),
            working_dir: Some(CONTAINER_WORKING_DIR.to_string()),
            labels: config.labels.clone(),
            binds: vec![format!("{}:{}", key_dir.display(), CONTAINER_WORKING_DIR)],
            ..Default::default()
        };
        let id = engine
            .create_container(&spec)
            .await
            .context("can't create key generation container")?;
        debug!(
            "Generate keys for tx manager {} in {}",
            config.node_index, id
        );

        let outcome = Self::run_to_completion(engine, &id).await;
        if let Err(err) = engine.remove_container(&id).await {
            warn!("can't remove key generation container {}: {}", id, err);
        }
        let code = outcome?;
        if code != 0 {
            return Err(KeyGeneration {
                container: id,
                code,
            }
            .into());
        }

        let public = tokio::fs::read(key_dir.join(PUBLIC_KEY_FILE))
            .await
            .context("can't read public key")?;
        let private = tokio::fs::read(key_dir.join(PRIVATE_KEY_FILE))
            .await
            .context("can't read private key")?;
        Ok(KeyPair { public, private })
    }

    async fn run_to_completion(engine: &Arc<dyn ContainerEngine>, id: &str) -> Result<i64> {
        engine
            .start_container(id)
            .await
            .with_context(|| format!("can't start container {}", id))?;
        let code = engine
            .wait_container(id)
            .await
            .with_context(|| format!("container {} did not finish", id))?;
        Ok(code)
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.unit.config.my_ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL ledger nodes use to reach this tx-manager.
    pub fn url(&self) -> Option<String> {
        self.address()
            .map(|address| format!("http://{}:{}", address, self.port))
    }

    fn container_spec(&self) -> ContainerSpec {
        let config = &self.unit.config;
        let peers = self
            .peers
            .iter()
            .map(|peer| format!("http://{}:{}/", peer, self.port))
            .collect::<Vec<_>>()
            .join(",");
        let mut spec = config.container_spec(Role::TxManager);
        spec.env = config.environment(vec![
            ("NODE_INDEX", config.node_index.to_string()),
            ("NODE_COUNT", config.node_count.to_string()),
            (
                "MY_IP",
                config.my_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            ),
            ("TM_PORT", self.port.to_string()),
            ("TM_PEERS", peers),
            ("TM_PUBLIC_KEY", self.keys.public_base64()),
            ("TM_PRIVATE_KEY", self.keys.private_base64()),
        ]);
        spec.working_dir = Some(CONTAINER_WORKING_DIR.to_string());
        spec.binds = vec![format!("{}:{}", self.key_dir.display(), CONTAINER_WORKING_DIR)];
        spec
    }
}

#[async_trait]
impl ContainerLifecycle for TxManager {
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
    use super::*;
    use crate::errors::QuorumContainerError;
    use crate::test_utils::{EngineEvent, FakeEngine};

    fn config(temp_dir: &Path) -> ContainerConfig {
        ContainerConfig::new("tessera:latest")
            .with_provision_id("tm-test")
            .with_node_index(1)
            .with_node_count(2)
            .with_my_ip(Ipv4Addr::new(10, 10, 0, 3))
            .with_temp_dir(temp_dir)
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("txmanager-test-{}", generate_random_string(8)))
    }

    #[test_log::test(tokio::test)]
    async fn key_generation_reads_files_and_removes_container() {
        let dir = temp_dir();
        let engine = Arc::new(FakeEngine::default());
        let peers = vec![Ipv4Addr::new(10, 10, 0, 2), Ipv4Addr::new(10, 10, 0, 3)];
        let mut tm = TxManager::new(engine.clone(), config(&dir), 9000, peers)
            .await
            .unwrap();
        assert_eq!(tm.keys().public, b"cHVibGljLWtleQ==".to_vec());
        assert_eq!(engine.container_count(), 0);

        tm.start().await.unwrap();
        assert_eq!(engine.running_count(), 1);
        let spec = engine.container_spec("tm-test-tm-1").unwrap();
        assert!(spec.env.contains(&"NODE_INDEX=1".to_string()));
        assert!(spec
            .env
            .contains(&"TM_PEERS=http://10.10.0.2:9000/,http://10.10.0.3:9000/".to_string()));
        assert!(spec
            .env
            .contains(&format!("TM_PUBLIC_KEY={}", tm.keys().public_base64())));
        assert_eq!(tm.url().as_deref(), Some("http://10.10.0.3:9000"));

        tm.stop().await.unwrap();
        assert_eq!(engine.running_count(), 0);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn failing_key_generator_is_fatal_and_cleaned_up() {
        let dir = temp_dir();
        let engine = Arc::new(FakeEngine::default().with_exit_code("tessera:latest", 1));
        let err = TxManager::new(engine.clone(), config(&dir), 9000, vec![])
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<QuorumContainerError>(),
            Some(QuorumContainerError::KeyGeneration { code: 1, .. })
        ));
        assert_eq!(engine.container_count(), 0);
        assert!(engine
            .events()
            .iter()
            .any(|event| matches!(event, EngineEvent::RemoveContainer(_))));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let dir = temp_dir();
        let engine = Arc::new(FakeEngine::default());
        let mut tm = TxManager::new(engine.clone(), config(&dir), 9000, vec![])
            .await
            .unwrap();
        tm.start().await.unwrap();
        assert!(tm.start().await.is_err());
        std::fs::remove_dir_all(dir).unwrap();
    }
}

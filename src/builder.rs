//! Drives one build from an empty engine to a running network and back.
//!
//! A build walks `Init → NetworkBuilt → TxManagersStarted →
//! LedgerNodesStarted → Running` and never goes back. A failing stage stops
//! the build where it is; nothing already started is unwound, callers clean
//! up with [`QuorumBuilder::destroy`].

use std::fmt;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::api::NodeDirectory;
use crate::bootstrap::{Bootstrap, LocalBootstrap};
use crate::config::BuilderSettings;
use crate::container::{ContainerConfig, ContainerLifecycle, BUILD_ID_LABEL};
use crate::engine::{ContainerEngine, EngineError, Labels};
use crate::errors::QuorumContainerError::{self, GenesisGeneration, IdentityGeneration, InvalidState};
use crate::errors::{AggregateError, UnitFailure};
use crate::ledger::{LedgerMaterial, LedgerNode};
use crate::network::{Network, Subnet};
use crate::parallel::{collect_results, run_parallel};
use crate::spec::BuildSpec;
use crate::txmanager::TxManager;
use crate::utils::generate_random_string;

/// Where a build currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Init,
    NetworkBuilt,
    TxManagersStarted,
    LedgerNodesStarted,
    Running,
    Destroyed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildState::Init => "init",
            BuildState::NetworkBuilt => "network-built",
            BuildState::TxManagersStarted => "tx-managers-started",
            BuildState::LedgerNodesStarted => "ledger-nodes-started",
            BuildState::Running => "running",
            BuildState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Labels shared by every resource of the build `name`.
pub fn build_labels(name: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(BUILD_ID_LABEL.to_string(), name.to_string());
    labels
}

/// Serializes the check-then-pull sequence so that concurrent units never
/// pull the same image twice.
struct ImagePuller {
    engine: Arc<dyn ContainerEngine>,
    lock: Mutex<()>,
}

impl ImagePuller {
    async fn pull(&self, image: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        match self.engine.list_images(image).await {
            Ok(found) if !found.is_empty() => return Ok(()),
            Ok(_) => {}
            Err(err) => warn!("can't list image {}, pulling anyway: {}", image, err),
        }
        debug!("Pull image {}", image);
        self.engine
            .pull_image(image)
            .await
            .with_context(|| format!("pull image {}", image))
    }
}

/// Keeps a typed failure as is, otherwise files it under `fallback`.
fn classify(err: anyhow::Error, fallback: fn(String) -> QuorumContainerError) -> anyhow::Error {
    match err.downcast::<QuorumContainerError>() {
        Ok(typed) => typed.into(),
        Err(err) => fallback(format!("{:#}", err)).into(),
    }
}

fn ignore_not_found(result: Result<(), EngineError>) -> Result<()> {
    match result {
        Err(err) if !err.is_not_found() => Err(err.into()),
        _ => Ok(()),
    }
}

/// Builds and tears down one labeled test network.
pub struct QuorumBuilder {
    spec: BuildSpec,
    settings: BuilderSettings,
    engine: Arc<dyn ContainerEngine>,
    bootstrap: Option<Arc<dyn Bootstrap>>,
    labels: Labels,
    puller: Arc<ImagePuller>,
    state: BuildState,
    temp_dir: Option<PathBuf>,
    network: Option<Arc<Network>>,
    tx_managers: Vec<TxManager>,
    ledger_nodes: Vec<LedgerNode>,
    directory: NodeDirectory,
}

impl QuorumBuilder {
    pub fn new(spec: BuildSpec, engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            labels: build_labels(&spec.name),
            spec,
            settings: BuilderSettings::default(),
            puller: Arc::new(ImagePuller {
                engine: engine.clone(),
                lock: Mutex::new(()),
            }),
            engine,
            bootstrap: None,
            state: BuildState::Init,
            temp_dir: None,
            network: None,
            tx_managers: Vec::new(),
            ledger_nodes: Vec::new(),
            directory: NodeDirectory::default(),
        })
    }

    /// Reads a YAML topology from `reader`.
    pub fn from_reader(reader: impl Read, engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        Self::new(BuildSpec::from_reader(reader)?, engine)
    }

    pub fn with_settings(mut self, settings: BuilderSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the identity and genesis collaborator. Defaults to
    /// [`LocalBootstrap`] on the configured p2p port.
    pub fn with_bootstrap(mut self, bootstrap: Arc<dyn Bootstrap>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn network(&self) -> Option<&Network> {
        self.network.as_deref()
    }

    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_deref()
    }

    pub fn tx_managers(&self) -> &[TxManager] {
        &self.tx_managers
    }

    pub fn ledger_nodes(&self) -> &[LedgerNode] {
        &self.ledger_nodes
    }

    /// Handle on the tracked node set for query consumers.
    pub fn directory(&self) -> NodeDirectory {
        self.directory.clone()
    }

    /// 1. Build the network
    /// 2. Start the tx managers
    /// 3. Start the ledger nodes
    pub async fn build(&mut self) -> Result<()> {
        if self.state != BuildState::Init {
            return Err(InvalidState {
                operation: "build",
                state: self.state.to_string(),
            }
            .into());
        }
        info!(
            "Build network {} with {} node(s)",
            self.spec.name,
            self.spec.nodes.len()
        );
        let temp_dir = std::env::temp_dir().join(format!(
            "{}-{}",
            self.spec.name,
            generate_random_string(8)
        ));
        tokio::fs::create_dir_all(&temp_dir).await?;
        self.temp_dir = Some(temp_dir);

        self.build_network().await?;
        self.start_tx_managers().await?;
        self.start_ledger_nodes().await?;

        self.state = BuildState::Running;
        info!("Network {} is running", self.spec.name);
        Ok(())
    }

    fn build_context(&self) -> Result<(Arc<Network>, PathBuf)> {
        let network = self
            .network
            .clone()
            .ok_or_else(|| anyhow!("network of {} is not built", self.spec.name))?;
        let temp_dir = self
            .temp_dir
            .clone()
            .ok_or_else(|| anyhow!("temp dir of {} is not created", self.spec.name))?;
        Ok((network, temp_dir))
    }

    /// Configuration shared by every unit of a stage.
    fn base_config(&self, image: &str, network: &Network, temp_dir: &Path) -> ContainerConfig {
        ContainerConfig::new(image)
            .with_provision_id(self.spec.name.as_str())
            .with_node_count(self.spec.nodes.len())
            .with_network(network.id())
            .with_temp_dir(temp_dir)
            .with_labels(self.labels.clone())
    }

    async fn build_network(&mut self) -> Result<()> {
        debug!("Create network {}", self.spec.name);
        let subnet: Subnet = self.settings.subnet.parse()?;
        let network = Network::create(
            self.engine.clone(),
            &self.spec.name,
            self.labels.clone(),
            subnet,
        )
        .await?;
        self.network = Some(Arc::new(network));
        self.state = BuildState::NetworkBuilt;
        Ok(())
    }

    async fn start_tx_managers(&mut self) -> Result<()> {
        debug!("Start tx managers");
        let (network, temp_dir) = self.build_context()?;
        let ips = network.lease_addresses(self.spec.nodes.len()).await?;
        let port = self.settings.tx_manager_port;

        let items: Vec<_> = self
            .spec
            .nodes
            .iter()
            .map(|node| node.tx_manager.clone())
            .collect();
        let tx_managers = run_parallel("starting tx managers", items, |idx, image| {
            let config = self
                .base_config(&image.image, &network, &temp_dir)
                .with_node_index(idx)
                .with_my_ip(ips[idx])
                .with_config(image.config);
            let engine = self.engine.clone();
            let puller = self.puller.clone();
            let peers = ips.clone();
            async move {
                puller.pull(&config.image).await?;
                let mut tx_manager = TxManager::new(engine, config, port, peers).await?;
                debug!("Start tx manager {}", idx);
                tx_manager.start().await?;
                Ok(tx_manager)
            }
        })
        .await
        .map_err(QuorumContainerError::from)?;

        for tx_manager in &tx_managers {
            let unit = tx_manager.unit();
            self.directory
                .update(unit.index, |info| {
                    info.tx_manager_container = unit.container_id.clone();
                    info.tx_manager_ip = tx_manager.address();
                    info.tx_manager_url = tx_manager.url();
                    info.tx_manager_public_key = Some(tx_manager.keys().public_base64());
                })
                .await;
        }
        self.tx_managers = tx_managers;
        self.state = BuildState::TxManagersStarted;
        Ok(())
    }

    async fn start_ledger_nodes(&mut self) -> Result<()> {
        debug!("Start ledger nodes");
        let (network, temp_dir) = self.build_context()?;
        let node_count = self.spec.nodes.len();
        let ips = network.lease_addresses(node_count).await?;

        let bootstrap = self
            .bootstrap
            .clone()
            .unwrap_or_else(|| Arc::new(LocalBootstrap::new(self.settings.p2p_port)));
        let identities = bootstrap
            .generate_node_identities(&temp_dir, node_count, &ips)
            .await
            .map_err(|err| classify(err, IdentityGeneration))?;
        bootstrap
            .write_permissioned_peers(&identities)
            .await
            .map_err(|err| classify(err, IdentityGeneration))?;
        let genesis = Arc::new(
            bootstrap
                .generate_genesis(
                    &identities,
                    &self.spec.consensus.name,
                    &self.spec.consensus.config,
                )
                .await
                .map_err(|err| classify(err, GenesisGeneration))?,
        );

        let tx_manager_urls: Vec<Option<String>> =
            self.tx_managers.iter().map(TxManager::url).collect();
        let rpc_port = self.settings.rpc_port;
        let items: Vec<_> = self
            .spec
            .nodes
            .iter()
            .map(|node| node.ledger.clone())
            .zip(identities)
            .collect();
        let ledger_nodes = run_parallel("starting ledger nodes", items, |idx, (image, identity)| {
            let config = self
                .base_config(&image.image, &network, &temp_dir)
                .with_node_index(idx)
                .with_my_ip(ips[idx])
                .with_config(image.config);
            let material = LedgerMaterial {
                identity,
                genesis: genesis.clone(),
                rpc_port,
                tx_manager_url: tx_manager_urls.get(idx).cloned().flatten(),
            };
            let engine = self.engine.clone();
            let puller = self.puller.clone();
            async move {
                puller.pull(&config.image).await?;
                let mut node = LedgerNode::new(engine, config, material).await?;
                debug!("Start ledger node {}", idx);
                node.start().await?;
                Ok(node)
            }
        })
        .await
        .map_err(QuorumContainerError::from)?;

        for node in &ledger_nodes {
            let unit = node.unit();
            let identity = node.identity();
            self.directory
                .update(unit.index, |info| {
                    info.ledger_container = unit.container_id.clone();
                    info.ledger_ip = Some(identity.address);
                    info.rpc_url = Some(node.rpc_url());
                    info.enode = Some(identity.enode());
                    info.default_account = Some(identity.default_account.clone());
                })
                .await;
        }
        self.ledger_nodes = ledger_nodes;
        self.state = BuildState::LedgerNodesStarted;
        Ok(())
    }

    /// Stops every tracked container, ledger nodes first. Nothing is removed.
    pub async fn stop(&self) -> Result<()> {
        let ledger_stops = self.ledger_nodes.iter().map(|node| node.stop());
        let ledger_nodes = join_all(ledger_stops).await;
        let tx_manager_stops = self.tx_managers.iter().map(|tx_manager| tx_manager.stop());
        let tx_managers = join_all(tx_manager_stops).await;
        let failed: Vec<AggregateError> = [
            collect_results("stopping ledger nodes", ledger_nodes),
            collect_results("stopping tx managers", tx_managers),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            let aggregate = AggregateError::combine("stop", failed);
            Err(QuorumContainerError::from(aggregate).into())
        }
    }

    /// Removes the temp directory and every resource labeled with this build.
    ///
    /// Safe to call in any state and more than once.
    pub async fn destroy(&mut self) -> Result<()> {
        info!("Destroy network {}", self.spec.name);
        if let Some(temp_dir) = self.temp_dir.take() {
            debug!("removing temp directory {}", temp_dir.display());
            if let Err(err) = tokio::fs::remove_dir_all(&temp_dir).await {
                if err.kind() != ErrorKind::NotFound {
                    warn!("can't remove {}: {}", temp_dir.display(), err);
                }
            }
        }
        self.tx_managers.clear();
        self.ledger_nodes.clear();
        self.network = None;
        self.directory.clear().await;
        self.state = BuildState::Destroyed;
        Self::destroy_labeled(self.engine.clone(), &self.spec.name).await
    }

    /// Removes every container, then every network, labeled with the build
    /// `name`. Needs no in-process state, so it also cleans up after a
    /// crashed process.
    pub async fn destroy_labeled(engine: Arc<dyn ContainerEngine>, name: &str) -> Result<()> {
        let labels = build_labels(name);
        let failed: Vec<AggregateError> = [
            Self::remove_containers(&engine, &labels).await,
            Self::remove_networks(&engine, &labels).await,
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            let aggregate = AggregateError::combine("destroy", failed);
            Err(QuorumContainerError::from(aggregate).into())
        }
    }

    async fn remove_containers(
        engine: &Arc<dyn ContainerEngine>,
        labels: &Labels,
    ) -> Result<(), AggregateError> {
        const TITLE: &str = "removing containers";
        let containers = engine
            .list_containers(labels)
            .await
            .map_err(|err| listing_failure(TITLE, err))?;
        run_parallel(TITLE, containers, |_, container| {
            let engine = engine.clone();
            async move {
                debug!("removing container {} {:?}", container.id, container.names);
                ignore_not_found(engine.remove_container(&container.id).await)
            }
        })
        .await
        .map(|_| ())
    }

    async fn remove_networks(
        engine: &Arc<dyn ContainerEngine>,
        labels: &Labels,
    ) -> Result<(), AggregateError> {
        const TITLE: &str = "removing networks";
        let networks = engine
            .list_networks(labels)
            .await
            .map_err(|err| listing_failure(TITLE, err))?;
        run_parallel(TITLE, networks, |_, network| {
            let engine = engine.clone();
            async move {
                debug!("removing network {} {}", network.id, network.name);
                ignore_not_found(engine.remove_network(&network.id).await)
            }
        })
        .await
        .map(|_| ())
    }
}

fn listing_failure(title: &str, err: EngineError) -> AggregateError {
    AggregateError::new(
        title,
        1,
        0,
        vec![UnitFailure {
            index: 0,
            message: format!("list: {}", err),
        }],
    )
}

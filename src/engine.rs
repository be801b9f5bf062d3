use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;

/// Key/value tags attached to engine resources.
pub type Labels = BTreeMap<String, String>;

/// Errors reported by a [`ContainerEngine`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource already exists or is in a conflicting state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other failed request.
    #[error("{op} failed: {message}")]
    Request {
        /// The engine operation that failed.
        op: &'static str,
        /// Engine supplied description.
        message: String,
    },
}

impl EngineError {
    pub fn request(op: &'static str, message: impl Into<String>) -> Self {
        Self::Request {
            op,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Parameters of a network to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub labels: Labels,
    /// IPv4 subnet in CIDR notation.
    pub subnet: Option<String>,
}

/// A network as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub subnet: Option<String>,
    pub gateway: Option<Ipv4Addr>,
}

/// Attaches a container to a network at a fixed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network_id: String,
    pub ipv4: Ipv4Addr,
}

/// Parameters of a container to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub labels: Labels,
    /// `host_path:container_path` bind mounts.
    pub binds: Vec<String>,
    pub network: Option<NetworkAttachment>,
}

/// A container as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
}

/// The narrow set of container engine operations the builder relies on.
///
/// All listing calls filter by labels: a resource matches when it carries
/// every given key with the given value.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkSummary, EngineError>;

    async fn list_networks(&self, labels: &Labels) -> Result<Vec<NetworkSummary>, EngineError>;

    async fn remove_network(&self, id: &str) -> Result<(), EngineError>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    /// Removes a container, stopping it first if it is running.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Blocks until the container is no longer running and returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    /// Lists containers in any state.
    async fn list_containers(&self, labels: &Labels) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Returns the ids of local images matching `reference`.
    async fn list_images(&self, reference: &str) -> Result<Vec<String>, EngineError>;

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError>;
}

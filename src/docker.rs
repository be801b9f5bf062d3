use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::TryStreamExt;
use log::debug;

use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerSummary, EngineError, Labels, NetworkSpec,
    NetworkSummary,
};
use crate::network::Subnet;

const STOP_TIMEOUT_SECS: i64 = 10;

/// [`ContainerEngine`] talking to the local Docker daemon.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects using `DOCKER_HOST` or the platform default socket.
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| to_engine_error("connect", err))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn to_engine_error(op: &'static str, err: DockerError) -> EngineError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        other => EngineError::request(op, other.to_string()),
    }
}

fn label_filters(labels: &Labels) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        labels
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect(),
    );
    filters
}

/// Splits `repo[:tag]` so that an untagged reference pulls `latest` only.
fn split_reference(reference: &str) -> (String, String) {
    if reference.contains('@') {
        return (reference.to_string(), String::new());
    }
    let name_start = reference.rfind('/').map_or(0, |slash| slash + 1);
    match reference[name_start..].rfind(':') {
        Some(colon) => {
            let split = name_start + colon;
            (
                reference[..split].to_string(),
                reference[split + 1..].to_string(),
            )
        }
        None => (reference.to_string(), "latest".to_string()),
    }
}

fn network_summary(network: bollard::models::Network) -> NetworkSummary {
    // dual-stack networks may list their IPv6 range first
    let ipam_config = network
        .ipam
        .and_then(|ipam| ipam.config)
        .and_then(|configs| {
            configs.into_iter().find(|config| {
                config
                    .subnet
                    .as_deref()
                    .is_some_and(|subnet| subnet.parse::<Subnet>().is_ok())
            })
        });
    let (subnet, gateway) = match ipam_config {
        Some(config) => (
            config.subnet,
            config
                .gateway
                .and_then(|gateway| gateway.parse::<Ipv4Addr>().ok()),
        ),
        None => (None, None),
    };
    NetworkSummary {
        id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        subnet,
        gateway,
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkSummary, EngineError> {
        debug!("docker: create network {}", spec.name);
        let ipam = Ipam {
            config: spec.subnet.as_ref().map(|subnet| {
                vec![IpamConfig {
                    subnet: Some(subnet.clone()),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        };
        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            ipam,
            labels: spec.labels.clone().into_iter().collect(),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|err| to_engine_error("create network", err))?;
        let network = self
            .docker
            .inspect_network(&spec.name, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(|err| to_engine_error("inspect network", err))?;
        Ok(network_summary(network))
    }

    async fn list_networks(&self, labels: &Labels) -> Result<Vec<NetworkSummary>, EngineError> {
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions {
                filters: label_filters(labels),
            }))
            .await
            .map_err(|err| to_engine_error("list networks", err))?;
        Ok(networks.into_iter().map(network_summary).collect())
    }

    async fn remove_network(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_network(id)
            .await
            .map_err(|err| to_engine_error("remove network", err))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let networking_config = spec.network.as_ref().map(|attachment| {
            let mut endpoints_config = HashMap::new();
            endpoints_config.insert(
                attachment.network_id.clone(),
                EndpointSettings {
                    ipam_config: Some(EndpointIpamConfig {
                        ipv4_address: Some(attachment.ipv4.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            );
            NetworkingConfig { endpoints_config }
        });
        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: spec.entrypoint.clone(),
            cmd: spec.cmd.clone(),
            env: Some(spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone().into_iter().collect()),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                ..Default::default()
            }),
            networking_config,
            ..Default::default()
        };
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        });
        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|err| to_engine_error("create container", err))?;
        debug!(
            "docker: created container {} from {}",
            response.id, spec.image
        );
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| to_engine_error("start container", err))
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
            .map_err(|err| to_engine_error("stop container", err))
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| to_engine_error("remove container", err))
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let mut stream = Box::pin(self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        ));
        match stream.try_next().await {
            Ok(Some(response)) => Ok(response.status_code),
            Ok(None) => Err(EngineError::request(
                "wait container",
                format!("no exit status for {}", id),
            )),
            // non-zero exit codes surface as errors
            Err(DockerError::DockerContainerWaitError { code, .. }) => Ok(code),
            Err(err) => Err(to_engine_error("wait container", err)),
        }
    }

    async fn list_containers(&self, labels: &Labels) -> Result<Vec<ContainerSummary>, EngineError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: label_filters(labels),
                ..Default::default()
            }))
            .await
            .map_err(|err| to_engine_error("list containers", err))?;
        Ok(containers
            .into_iter()
            .filter_map(|container| {
                container.id.map(|id| ContainerSummary {
                    id,
                    names: container.names.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn list_images(&self, reference: &str) -> Result<Vec<String>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![reference.to_string()]);
        let images = self
            .docker
            .list_images(Some(ListImagesOptions {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|err| to_engine_error("list images", err))?;
        Ok(images.into_iter().map(|image| image.id).collect())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let (from_image, tag) = split_reference(reference);
        debug!("docker: pull {}:{}", from_image, tag);
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image,
                    tag,
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|err| to_engine_error("pull image", err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_reference_pulls_latest() {
        assert_eq!(
            split_reference("quorumengineering/quorum"),
            ("quorumengineering/quorum".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_reference("localhost:5000/tessera:0.8"),
            ("localhost:5000/tessera".to_string(), "0.8".to_string())
        );
        assert_eq!(
            split_reference("localhost:5000/tessera"),
            ("localhost:5000/tessera".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_reference("tessera@sha256:abc").1,
            String::new()
        );
    }

    #[test]
    fn label_filter_uses_key_value_pairs() {
        let mut labels = Labels::new();
        labels.insert("com.quorum.testcontainer.id".to_string(), "net".to_string());
        let filters = label_filters(&labels);
        assert_eq!(filters["label"], vec!["com.quorum.testcontainer.id=net"]);
    }

    #[test]
    fn network_summary_prefers_the_ipv4_range() {
        let network = bollard::models::Network {
            id: Some("n1".to_string()),
            name: Some("dual".to_string()),
            ipam: Some(Ipam {
                config: Some(vec![
                    IpamConfig {
                        subnet: Some("fd00:dead:beef::/48".to_string()),
                        gateway: Some("fd00:dead:beef::1".to_string()),
                        ..Default::default()
                    },
                    IpamConfig {
                        subnet: Some("172.16.239.0/24".to_string()),
                        gateway: Some("172.16.239.1".to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let summary = network_summary(network);
        assert_eq!(summary.subnet.as_deref(), Some("172.16.239.0/24"));
        assert_eq!(summary.gateway, Some(Ipv4Addr::new(172, 16, 239, 1)));
    }

    #[test]
    fn not_found_and_conflict_are_distinguished() {
        let not_found = to_engine_error(
            "remove network",
            DockerError::DockerResponseServerError {
                status_code: 404,
                message: "no such network".to_string(),
            },
        );
        assert!(not_found.is_not_found());
        let conflict = to_engine_error(
            "create network",
            DockerError::DockerResponseServerError {
                status_code: 409,
                message: "exists".to_string(),
            },
        );
        assert_eq!(conflict, EngineError::Conflict("exists".to_string()));
    }
}

/// In-memory container engine for exercising the builder without a daemon.
#[cfg(any(test, feature = "testing"))]
pub mod fake_engine {
    use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
    use std::net::Ipv4Addr;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::engine::{
        ContainerEngine, ContainerSpec, ContainerSummary, EngineError, Labels, NetworkSpec,
        NetworkSummary,
    };
    use crate::network::Subnet;

    const DEFAULT_SUBNET: &str = "10.10.0.0/24";

    /// One recorded engine call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum EngineEvent {
        CreateNetwork(String),
        RemoveNetwork(String),
        CreateContainer { id: String, spec: ContainerSpec },
        StartContainer { id: String, labels: Labels },
        StopContainer(String),
        RemoveContainer(String),
        WaitContainer(String),
        PullImage(String),
    }

    struct FakeNetwork {
        summary: NetworkSummary,
        labels: Labels,
    }

    struct FakeContainer {
        spec: ContainerSpec,
        running: bool,
        exit_code: Option<i64>,
    }

    #[derive(Default)]
    struct FakeState {
        next_id: u64,
        networks: BTreeMap<String, FakeNetwork>,
        containers: BTreeMap<String, FakeContainer>,
        images: BTreeSet<String>,
        events: Vec<EngineEvent>,
        pulls: HashMap<String, usize>,
        exit_codes: HashMap<String, i64>,
        failing_starts: HashSet<String>,
        failing_removals: HashSet<String>,
        reject_networks: bool,
    }

    impl FakeState {
        fn next_id(&mut self, kind: &str) -> String {
            self.next_id += 1;
            format!("{}{:06}", kind, self.next_id)
        }

        fn record(&mut self, event: EngineEvent) {
            self.events.push(event);
        }
    }

    /// A container engine that keeps every resource in memory.
    ///
    /// Containers created with an entrypoint override are treated as one-shot
    /// jobs: starting one that exits with code 0 writes `.pub` and `.key` into
    /// every bound host directory, the way the key generator does.
    #[derive(Default)]
    pub struct FakeEngine {
        state: Mutex<FakeState>,
        pull_delay: Option<Duration>,
    }

    fn matches(candidate: &Labels, filter: &Labels) -> bool {
        filter
            .iter()
            .all(|(key, value)| candidate.get(key) == Some(value))
    }

    impl FakeEngine {
        /// Makes every pull take `delay`, widening the window for racing pulls.
        pub fn with_pull_delay(mut self, delay: Duration) -> Self {
            self.pull_delay = Some(delay);
            self
        }

        /// One-shot containers of `image` exit with `code`.
        pub fn with_exit_code(self, image: &str, code: i64) -> Self {
            self.lock().exit_codes.insert(image.to_string(), code);
            self
        }

        /// Starting a container of `image` fails.
        pub fn with_failing_start(self, image: &str) -> Self {
            self.lock().failing_starts.insert(image.to_string());
            self
        }

        /// Removing a container named `name` fails.
        pub fn with_failing_removal(self, name: &str) -> Self {
            self.lock().failing_removals.insert(name.to_string());
            self
        }

        /// Every network creation is rejected.
        pub fn rejecting_networks(self) -> Self {
            self.lock().reject_networks = true;
            self
        }

        /// Marks `image` as already present locally.
        pub fn with_image(self, image: &str) -> Self {
            self.lock().images.insert(image.to_string());
            self
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        pub fn events(&self) -> Vec<EngineEvent> {
            self.lock().events.clone()
        }

        pub fn pull_count(&self, image: &str) -> usize {
            self.lock().pulls.get(image).copied().unwrap_or(0)
        }

        pub fn network_count(&self) -> usize {
            self.lock().networks.len()
        }

        pub fn container_count(&self) -> usize {
            self.lock().containers.len()
        }

        pub fn running_count(&self) -> usize {
            self.lock()
                .containers
                .values()
                .filter(|container| container.running)
                .count()
        }

        /// Spec of the container with the given name, if it still exists.
        pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
            self.lock()
                .containers
                .values()
                .find(|container| container.spec.name.as_deref() == Some(name))
                .map(|container| container.spec.clone())
        }

        /// Seeds a labeled container as if left behind by an earlier process.
        pub fn seed_container(&self, name: &str, labels: Labels) -> String {
            let mut state = self.lock();
            let id = state.next_id("c");
            state.containers.insert(
                id.clone(),
                FakeContainer {
                    spec: ContainerSpec {
                        name: Some(name.to_string()),
                        image: "seed".to_string(),
                        labels,
                        ..Default::default()
                    },
                    running: true,
                    exit_code: None,
                },
            );
            id
        }

        fn write_key_files(binds: &[String]) -> Result<(), EngineError> {
            for bind in binds {
                let host = bind.split(':').next().unwrap_or_default();
                std::fs::write(Path::new(host).join(".pub"), "cHVibGljLWtleQ==")
                    .and_then(|_| {
                        std::fs::write(Path::new(host).join(".key"), "{\"type\":\"unlocked\"}")
                    })
                    .map_err(|err| EngineError::request("start", err.to_string()))?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkSummary, EngineError> {
            let mut state = self.lock();
            if state.reject_networks {
                return Err(EngineError::request("create network", "rejected by engine"));
            }
            if state
                .networks
                .values()
                .any(|network| network.summary.name == spec.name)
            {
                return Err(EngineError::Conflict(format!(
                    "network with name {} already exists",
                    spec.name
                )));
            }
            let subnet: Subnet = spec
                .subnet
                .as_deref()
                .unwrap_or(DEFAULT_SUBNET)
                .parse()
                .map_err(|err: anyhow::Error| {
                    EngineError::request("create network", err.to_string())
                })?;
            let id = state.next_id("n");
            let summary = NetworkSummary {
                id: id.clone(),
                name: spec.name.clone(),
                subnet: Some(subnet.to_string()),
                gateway: subnet.first_host(),
            };
            state.record(EngineEvent::CreateNetwork(spec.name.clone()));
            state.networks.insert(
                id,
                FakeNetwork {
                    summary: summary.clone(),
                    labels: spec.labels.clone(),
                },
            );
            Ok(summary)
        }

        async fn list_networks(&self, labels: &Labels) -> Result<Vec<NetworkSummary>, EngineError> {
            Ok(self
                .lock()
                .networks
                .values()
                .filter(|network| matches(&network.labels, labels))
                .map(|network| network.summary.clone())
                .collect())
        }

        async fn remove_network(&self, id: &str) -> Result<(), EngineError> {
            let mut state = self.lock();
            let network = state
                .networks
                .remove(id)
                .ok_or_else(|| EngineError::NotFound(format!("network {}", id)))?;
            state.record(EngineEvent::RemoveNetwork(network.summary.name));
            Ok(())
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
            let mut state = self.lock();
            if let Some(name) = &spec.name {
                if state
                    .containers
                    .values()
                    .any(|container| container.spec.name.as_ref() == Some(name))
                {
                    let message = format!("container name {} in use", name);
                    return Err(EngineError::Conflict(message));
                }
            }
            if let Some(attachment) = &spec.network {
                if !state.networks.contains_key(&attachment.network_id) {
                    return Err(EngineError::NotFound(format!(
                        "network {}",
                        attachment.network_id
                    )));
                }
                let taken = state.containers.values().any(|container| {
                    container
                        .spec
                        .network
                        .as_ref()
                        .is_some_and(|other| other.ipv4 == attachment.ipv4)
                });
                if taken {
                    return Err(EngineError::Conflict(format!(
                        "address {} already in use",
                        attachment.ipv4
                    )));
                }
            }
            let id = state.next_id("c");
            state.record(EngineEvent::CreateContainer {
                id: id.clone(),
                spec: spec.clone(),
            });
            state.containers.insert(
                id.clone(),
                FakeContainer {
                    spec: spec.clone(),
                    running: false,
                    exit_code: None,
                },
            );
            Ok(id)
        }

        async fn start_container(&self, id: &str) -> Result<(), EngineError> {
            let mut state = self.lock();
            let exit_codes = state.exit_codes.clone();
            let failing = state.failing_starts.clone();
            let container = state
                .containers
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound(format!("container {}", id)))?;
            if failing.contains(&container.spec.image) {
                return Err(EngineError::request("start container", "simulated failure"));
            }
            if container.spec.entrypoint.is_none() {
                container.running = true;
            } else {
                let code = exit_codes.get(&container.spec.image).copied().unwrap_or(0);
                if code == 0 {
                    Self::write_key_files(&container.spec.binds)?;
                }
                container.exit_code = Some(code);
            }
            let labels = container.spec.labels.clone();
            state.record(EngineEvent::StartContainer {
                id: id.to_string(),
                labels,
            });
            Ok(())
        }

        async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
            let mut state = self.lock();
            let container = state
                .containers
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound(format!("container {}", id)))?;
            container.running = false;
            container.exit_code.get_or_insert(0);
            state.record(EngineEvent::StopContainer(id.to_string()));
            Ok(())
        }

        async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
            let mut state = self.lock();
            let name = state
                .containers
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("container {}", id)))?
                .spec
                .name
                .clone()
                .unwrap_or_default();
            if state.failing_removals.contains(&name) {
                return Err(EngineError::request("remove container", "device busy"));
            }
            state.containers.remove(id);
            state.record(EngineEvent::RemoveContainer(id.to_string()));
            Ok(())
        }

        async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
            let mut state = self.lock();
            let code = state
                .containers
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("container {}", id)))?
                .exit_code
                .ok_or_else(|| {
                    EngineError::request("wait container", "container never exits")
                })?;
            state.record(EngineEvent::WaitContainer(id.to_string()));
            Ok(code)
        }

        async fn list_containers(
            &self,
            labels: &Labels,
        ) -> Result<Vec<ContainerSummary>, EngineError> {
            Ok(self
                .lock()
                .containers
                .iter()
                .filter(|(_, container)| matches(&container.spec.labels, labels))
                .map(|(id, container)| ContainerSummary {
                    id: id.clone(),
                    names: container.spec.name.iter().cloned().collect(),
                })
                .collect())
        }

        async fn list_images(&self, reference: &str) -> Result<Vec<String>, EngineError> {
            Ok(self
                .lock()
                .images
                .iter()
                .filter(|image| image.as_str() == reference)
                .map(|image| format!("sha256:{}", image))
                .collect())
        }

        async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
            {
                let mut state = self.lock();
                *state.pulls.entry(reference.to_string()).or_default() += 1;
                state.record(EngineEvent::PullImage(reference.to_string()));
            }
            if let Some(delay) = self.pull_delay {
                tokio::time::sleep(delay).await;
            }
            self.lock().images.insert(reference.to_string());
            Ok(())
        }
    }

    /// Address the fake attached a container to, if any.
    pub fn attached_address(spec: &ContainerSpec) -> Option<Ipv4Addr> {
        spec.network.as_ref().map(|attachment| attachment.ipv4)
    }
}

#[cfg(any(test, feature = "testing"))]
pub use fake_engine::{attached_address, EngineEvent, FakeEngine};

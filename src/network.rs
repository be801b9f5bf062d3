use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{debug, warn};
use tokio::sync::Mutex;

use crate::engine::{ContainerEngine, Labels, NetworkSpec};
use crate::errors::QuorumContainerError::{AddressPoolExhausted, NetworkCreate};

/// An IPv4 subnet in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    base: u32,
    prefix: u8,
}

impl Subnet {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        anyhow::ensure!(prefix <= 32, "invalid prefix length /{}", prefix);
        let mask = Self::mask(prefix);
        Ok(Self {
            base: u32::from(address) & mask,
            prefix,
        })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix as u32)
        }
    }

    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & Self::mask(self.prefix) == self.base
    }

    /// Host addresses, i.e. everything but the network and broadcast address.
    fn hosts(&self) -> std::ops::Range<u32> {
        if self.prefix >= 31 {
            return self.base..self.base;
        }
        let broadcast = self.base | !Self::mask(self.prefix);
        self.base + 1..broadcast
    }

    pub fn first_host(&self) -> Option<Ipv4Addr> {
        let mut hosts = self.hosts();
        hosts.next().map(Ipv4Addr::from)
    }
}

impl FromStr for Subnet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, prefix) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("subnet {} is not in CIDR notation", s))?;
        let address: Ipv4Addr = address
            .parse()
            .map_err(|err| anyhow!("subnet {}: {}", s, err))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|err| anyhow!("subnet {}: {}", s, err))?;
        Self::new(address, prefix)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_address(), self.prefix)
    }
}

/// Hands out host addresses of a subnet in increasing order, never twice.
#[derive(Debug, Clone)]
pub struct AddressPool {
    subnet: Subnet,
    gateway: Option<Ipv4Addr>,
    leased: BTreeSet<u32>,
}

impl AddressPool {
    pub fn new(subnet: Subnet, gateway: Option<Ipv4Addr>) -> Self {
        Self {
            subnet,
            gateway: gateway.filter(|gw| subnet.contains(*gw)),
            leased: BTreeSet::new(),
        }
    }

    fn is_free(&self, address: u32) -> bool {
        Some(Ipv4Addr::from(address)) != self.gateway && !self.leased.contains(&address)
    }

    /// Number of addresses that can still be leased.
    pub fn available(&self) -> usize {
        let hosts = self.subnet.hosts();
        let total = (hosts.end - hosts.start) as usize;
        let gateway = self
            .gateway
            .map(u32::from)
            .filter(|gw| hosts.contains(gw) && !self.leased.contains(gw))
            .map_or(0, |_| 1);
        total - self.leased.len() - gateway
    }

    /// Leases `count` addresses, all or nothing.
    pub fn lease(&mut self, count: usize) -> Result<Vec<Ipv4Addr>> {
        let available = self.available();
        if count > available {
            return Err(AddressPoolExhausted {
                requested: count,
                available,
            }
            .into());
        }
        let addresses: Vec<u32> = self
            .subnet
            .hosts()
            .filter(|address| self.is_free(*address))
            .take(count)
            .collect();
        self.leased.extend(addresses.iter().copied());
        Ok(addresses.into_iter().map(Ipv4Addr::from).collect())
    }
}

/// An isolated network owned by a single build.
pub struct Network {
    id: String,
    name: String,
    labels: Labels,
    subnet: Subnet,
    gateway: Option<Ipv4Addr>,
    pool: Mutex<AddressPool>,
    engine: Arc<dyn ContainerEngine>,
}

impl Network {
    /// Creates the network. An engine rejection (e.g. a name collision) is
    /// reported as `NetworkCreate`.
    pub async fn create(
        engine: Arc<dyn ContainerEngine>,
        name: &str,
        labels: Labels,
        subnet: Subnet,
    ) -> Result<Self> {
        debug!("Create network {} ({})", name, subnet);
        let spec = NetworkSpec {
            name: name.to_string(),
            labels: labels.clone(),
            subnet: Some(subnet.to_string()),
        };
        let created = engine
            .create_network(&spec)
            .await
            .map_err(|source| NetworkCreate {
                name: name.to_string(),
                source,
            })?;

        // the engine may settle on a different subnet than requested
        let subnet = match created.subnet.as_deref().map(str::parse::<Subnet>) {
            Some(Ok(reported)) => reported,
            Some(Err(err)) => {
                warn!("network {} reports an unusable subnet: {:#}", name, err);
                subnet
            }
            None => subnet,
        };
        let gateway = created.gateway.or_else(|| subnet.first_host());
        Ok(Self {
            id: created.id,
            name: created.name,
            labels,
            subnet,
            gateway,
            pool: Mutex::new(AddressPool::new(subnet, gateway)),
            engine,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    /// Leases `count` distinct, increasing addresses, skipping the gateway
    /// and anything leased before. Nothing is leased on failure.
    pub async fn lease_addresses(&self, count: usize) -> Result<Vec<Ipv4Addr>> {
        let mut pool = self.pool.lock().await;
        let addresses = pool.lease(count)?;
        debug!("Leased {:?} on network {}", addresses, self.name);
        Ok(addresses)
    }

    /// Addresses still free for leasing.
    pub async fn available_addresses(&self) -> usize {
        self.pool.lock().await.available()
    }

    /// Removes the network. A network that is already gone is not an error.
    pub async fn destroy(&self) -> Result<()> {
        debug!("Remove network {}", self.name);
        match self.engine.remove_network(&self.id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                warn!("network {} already removed", self.name);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

use anyhow::Result;
use config::{Config, Environment};
use serde::Deserialize;

const ENV_PREFIX: &str = "QUORUM_TESTCONTAINER";

/// Engine-independent knobs of a build, read from `QUORUM_TESTCONTAINER__*`
/// environment variables.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BuilderSettings {
    /// IPv4 subnet of the build network.
    pub subnet: String,
    pub p2p_port: u16,
    pub rpc_port: u16,
    pub tx_manager_port: u16,
    /// Upper bound for teardown when the CLI is interrupted.
    pub shutdown_timeout_secs: u64,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            subnet: "172.16.239.0/24".to_string(),
            p2p_port: 21000,
            rpc_port: 8545,
            tx_manager_port: 9000,
            shutdown_timeout_secs: 20,
        }
    }
}

impl BuilderSettings {
    pub fn from_env() -> Result<Self> {
        Self::load(Self::environment())
    }

    /// Same as [`BuilderSettings::from_env`] but reads the given variables
    /// instead of the process environment.
    pub fn from_vars(vars: config::Map<String, String>) -> Result<Self> {
        Self::load(Self::environment().source(Some(vars)))
    }

    fn environment() -> Environment {
        Environment::default()
            .prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true)
    }

    fn load(environment: Environment) -> Result<Self> {
        let defaults = Self::default();
        let config = Config::builder()
            .set_default("subnet", defaults.subnet)?
            .set_default("p2p_port", defaults.p2p_port as i64)?
            .set_default("rpc_port", defaults.rpc_port as i64)?
            .set_default("tx_manager_port", defaults.tx_manager_port as i64)?
            .set_default(
                "shutdown_timeout_secs",
                defaults.shutdown_timeout_secs as i64,
            )?
            .add_source(environment)
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

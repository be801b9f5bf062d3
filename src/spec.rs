use std::collections::BTreeMap;
use std::io::Read;

use anyhow::Result;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

use crate::errors::QuorumContainerError::Config as ConfigError;

const NAME_PATTERN: &str = r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$";

/// An image reference plus free-form settings for its container.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub image: String,
    #[serde(default, deserialize_with = "scalar_map")]
    pub config: BTreeMap<String, String>,
}

/// The two services making up one node.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    #[serde(alias = "quorum")]
    pub ledger: ImageSpec,
    pub tx_manager: ImageSpec,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConsensusSpec {
    pub name: String,
    #[serde(default, deserialize_with = "scalar_map")]
    pub config: BTreeMap<String, String>,
}

/// Reads a free-form settings map, keeping keys as written and rendering
/// scalar values as strings.
fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Value>> = Option::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(text) => text,
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                Value::Null => String::new(),
                _ => {
                    let message = format!("{}: expected a scalar value", key);
                    return Err(D::Error::custom(message));
                }
            };
            Ok((key, rendered))
        })
        .collect()
}

/// Declarative description of a test network.
///
/// The position of a node in `nodes` is its index for address and identity
/// assignment.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub name: String,
    /// Reserved, not interpreted by the builder.
    #[serde(default)]
    pub genesis: Option<String>,
    pub consensus: ConsensusSpec,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

impl BuildSpec {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let spec: BuildSpec =
            serde_yaml::from_str(content).map_err(|err| ConfigError(err.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        Self::from_yaml(&content)
    }

    /// Checks what the engine and the builder rely on: a usable resource
    /// name, a consensus name and non-empty image references.
    pub fn validate(&self) -> Result<()> {
        let re = Regex::new(NAME_PATTERN)?;
        if !re.is_match(&self.name) {
            let message = format!("invalid build name {:?}", self.name);
            return Err(ConfigError(message).into());
        }
        if self.consensus.name.trim().is_empty() {
            return Err(ConfigError("consensus name is empty".to_string()).into());
        }
        for (index, node) in self.nodes.iter().enumerate() {
            if node.ledger.image.trim().is_empty() {
                let message = format!("node {}: ledger image is empty", index);
                return Err(ConfigError(message).into());
            }
            if node.tx_manager.image.trim().is_empty() {
                let message = format!("node {}: tx manager image is empty", index);
                return Err(ConfigError(message).into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::QuorumContainerError;

    const TOPOLOGY: &str = r#"
name: demo-net
consensus:
  name: raft
  config:
    raftPort: 50400
    ceil2Nby3Block: "0"
nodes:
  - quorum:
      image: quorumengineering/quorum:2.2.1
      config:
        PRIVATE_CONFIG: ignore
        Verbosity: 5
    tx_manager:
      image: quorumengineering/tessera:0.8
  - ledger:
      image: quorumengineering/quorum:2.2.1
    tx_manager:
      image: quorumengineering/tessera:0.8
"#;

    fn is_config_error(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<QuorumContainerError>(),
            Some(QuorumContainerError::Config(_))
        )
    }

    #[test]
    fn parses_topology_in_node_order() {
        let spec = BuildSpec::from_yaml(TOPOLOGY).unwrap();
        assert_eq!(spec.name, "demo-net");
        assert_eq!(spec.consensus.name, "raft");
        assert_eq!(spec.nodes.len(), 2);
        assert!(spec.nodes[1].ledger.config.is_empty());
        assert_eq!(
            spec.nodes[1].tx_manager.image,
            "quorumengineering/tessera:0.8"
        );
        assert_eq!(spec.genesis, None);
    }

    #[test]
    fn settings_keys_keep_their_case() {
        let spec = BuildSpec::from_yaml(TOPOLOGY).unwrap();
        assert_eq!(spec.consensus.config["raftPort"], "50400");
        assert_eq!(spec.consensus.config["ceil2Nby3Block"], "0");
        assert!(!spec.consensus.config.contains_key("raftport"));
        let ledger = &spec.nodes[0].ledger.config;
        assert_eq!(ledger["PRIVATE_CONFIG"], "ignore");
        assert_eq!(ledger["Verbosity"], "5");
    }

    #[test]
    fn rejects_nested_settings_values() {
        let nested = TOPOLOGY.replace("raftPort: 50400", "raftPort: [1, 2]");
        let err = BuildSpec::from_yaml(&nested).unwrap_err();
        assert!(is_config_error(&err));
    }

    #[test]
    fn from_reader_matches_from_yaml() {
        let spec = BuildSpec::from_reader(TOPOLOGY.as_bytes()).unwrap();
        assert_eq!(spec, BuildSpec::from_yaml(TOPOLOGY).unwrap());
    }

    #[test]
    fn rejects_invalid_names() {
        let err = BuildSpec::from_yaml(&TOPOLOGY.replace("demo-net", "-bad name")).unwrap_err();
        assert!(is_config_error(&err));
    }

    #[test]
    fn rejects_missing_consensus() {
        let err = BuildSpec::from_yaml("name: x\nnodes: []\n").unwrap_err();
        assert!(is_config_error(&err));
    }

    #[test]
    fn rejects_empty_image() {
        let err = BuildSpec::from_yaml(&TOPOLOGY.replace("quorumengineering/tessera:0.8", "\"\""))
            .unwrap_err();
        assert!(is_config_error(&err));
    }
}

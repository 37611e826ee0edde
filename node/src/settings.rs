use anyhow::Result;
use config::{Config, Environment, File as ConfigFile};
use nodevm_node_manager::{NodeName, NodeUuid, NodeUuidSource, VirtualMachine};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "config/nodevm.toml";

/// A cluster node and the VM backing it.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub uuid: String,
    pub vcenter_host: String,
    pub datacenter: String,
    pub moref: String,
    /// Register the node without its UUID and let the platform resolve it.
    #[serde(default)]
    pub pending_uuid: bool,
}

impl NodeEntry {
    pub fn node_name(&self) -> NodeName {
        NodeName::new(self.name.clone())
    }

    pub fn node_uuid(&self) -> NodeUuid {
        NodeUuid::new(self.uuid.clone())
    }

    /// UUID passed at registration time
    pub fn registration_uuid(&self) -> NodeUuid {
        if self.pending_uuid {
            NodeUuid::placeholder()
        } else {
            self.node_uuid()
        }
    }

    pub fn virtual_machine(&self) -> VirtualMachine {
        VirtualMachine::new(
            self.node_uuid(),
            self.vcenter_host.clone(),
            self.datacenter.clone(),
            self.moref.clone(),
        )
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_log_format")]
    log_format: String,
    #[serde(default)]
    use_node_uuid: bool,
    #[serde(default)]
    nodes: Vec<NodeEntry>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_path: Option<PathBuf>,

    // Logging
    pub log_level: String,
    pub log_format: String,

    // Node UUID resolution
    pub uuid_source: NodeUuidSource,

    // Inventory
    pub nodes: Vec<NodeEntry>,
}

impl AppConfig {
    /// Load from the config file (explicit path, or the default path when it
    /// exists) overlaid with `NODEVM_*` environment variables.
    pub fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = if let Some(path) = config_path_override {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        } else {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                Some(path)
            } else {
                None
            }
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(Environment::with_prefix("NODEVM"));

        let raw: RawConfig = builder.build()?.try_deserialize()?;
        let config = Self {
            config_path: resolved_path,
            log_level: raw.log_level.trim().to_lowercase(),
            log_format: raw.log_format.trim().to_lowercase(),
            uuid_source: NodeUuidSource::from_use_node_uuid(raw.use_node_uuid),
            nodes: raw.nodes,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!(
                "Unsupported log format {:?} (expected \"pretty\" or \"json\")",
                self.log_format
            );
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                anyhow::bail!("Node entry with empty name in inventory");
            }
            if node.uuid.trim().is_empty() {
                anyhow::bail!("Node {} has an empty uuid", node.name);
            }
            if !names.insert(node.name.as_str()) {
                anyhow::bail!("Node {} is listed more than once", node.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn sample_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join(DEFAULT_CONFIG_PATH);
        let config = AppConfig::load(Some(path.to_str().unwrap())).unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.uuid_source, NodeUuidSource::Node);
        assert!(!config.nodes.is_empty());
        assert!(config.nodes.iter().any(|node| node.pending_uuid));
    }

    #[test]
    fn pending_node_registers_placeholder() {
        let file = write_config(
            r#"
use_node_uuid = true
log_format = "json"

[[nodes]]
name = "worker-1"
uuid = "4213-0001"
vcenter_host = "vc-1.example.com"
datacenter = "dc-1"
moref = "vm-101"
pending_uuid = true
"#,
        );
        let config = AppConfig::load(file.path().to_str()).unwrap();

        assert_eq!(config.uuid_source, NodeUuidSource::CsiNode);
        assert_eq!(config.log_format, "json");
        let node = &config.nodes[0];
        assert!(node.registration_uuid().is_placeholder());
        assert_eq!(node.virtual_machine().moref, "vm-101");
    }

    #[test]
    fn duplicate_node_names_are_rejected() {
        let file = write_config(
            r#"
[[nodes]]
name = "worker-1"
uuid = "a"
vcenter_host = "vc"
datacenter = "dc"
moref = "vm-1"

[[nodes]]
name = "worker-1"
uuid = "b"
vcenter_host = "vc"
datacenter = "dc"
moref = "vm-2"
"#,
        );
        assert!(AppConfig::load(file.path().to_str()).is_err());
    }

    #[test]
    fn pending_node_still_needs_uuid() {
        let file = write_config(
            r#"
[[nodes]]
name = "worker-1"
uuid = ""
vcenter_host = "vc"
datacenter = "dc"
moref = "vm-1"
pending_uuid = true
"#,
        );
        let err = AppConfig::load(file.path().to_str()).unwrap_err();
        assert!(err.to_string().contains("empty uuid"));
    }

    #[test]
    fn missing_explicit_config_fails() {
        let err = AppConfig::load(Some("/nonexistent/nodevm.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}

use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use nodevm_node_manager::{
    Datacenter, Manager, NodeManager, NodeName, NodeUuid, NodeUuidSource, StubKubernetesClient,
    StubVirtualizationClient, VirtualMachine,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod settings;
mod version;

use settings::AppConfig;
use version::{git_commit_hash, NODEVM_VERSION};

fn build_cli() -> Command {
    Command::new("nodevm-node")
        .version(NODEVM_VERSION)
        .about("Cluster node to virtual machine registry")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format")
                .global(true),
        )
        .arg(
            Arg::new("use-node-uuid")
                .long("use-node-uuid")
                .action(ArgAction::SetTrue)
                .help("Resolve node UUIDs from CSINode objects instead of Node objects")
                .global(true),
        )
        .subcommand(Command::new("sweep").about("Renew and print the VMs of all registered nodes"))
        .subcommand(Command::new("nodes").about("List registered node names and UUIDs"))
        .subcommand(
            Command::new("lookup")
                .about("Look up the VM of a single node")
                .arg(
                    Arg::new("name")
                        .long("name")
                        .value_name("NODE")
                        .conflicts_with("uuid")
                        .required_unless_present("uuid")
                        .help("Node name"),
                )
                .arg(
                    Arg::new("uuid")
                        .long("uuid")
                        .value_name("UUID")
                        .help("Node VM UUID"),
                )
                .arg(
                    Arg::new("datacenter")
                        .long("datacenter")
                        .value_name("NAME")
                        .requires("uuid")
                        .requires("vcenter")
                        .help("Restrict a cold UUID lookup to this datacenter"),
                )
                .arg(
                    Arg::new("vcenter")
                        .long("vcenter")
                        .value_name("HOST")
                        .requires("datacenter")
                        .help("vCenter hosting --datacenter"),
                ),
        )
        .subcommand(
            Command::new("reverse")
                .about("Find the node name registered for a VM UUID")
                .arg(
                    Arg::new("uuid")
                        .long("uuid")
                        .value_name("UUID")
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("unregister")
                .about("Unregister a node and list what remains")
                .arg(
                    Arg::new("name")
                        .long("name")
                        .value_name("NODE")
                        .required(true),
                ),
        )
}

fn load_config_with_overrides(matches: &ArgMatches) -> Result<AppConfig> {
    let mut config = AppConfig::load(matches.get_one::<String>("config").map(String::as_str))?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.log_format = format.clone();
    }
    if matches.get_flag("use-node-uuid") {
        config.uuid_source = NodeUuidSource::CsiNode;
    }
    Ok(config)
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?;
    }

    Ok(())
}

/// Populate the in-memory backends from the configured inventory.
fn build_backends(config: &AppConfig) -> (StubVirtualizationClient, StubKubernetesClient) {
    let vcenter = StubVirtualizationClient::new();
    let k8s = StubKubernetesClient::new();
    for node in &config.nodes {
        vcenter.add_vm(node.virtual_machine());
        k8s.set_node_uuid(node.node_name(), config.uuid_source, node.node_uuid());
    }
    (vcenter, k8s)
}

fn build_manager(config: &AppConfig) -> Arc<NodeManager> {
    let (vcenter, k8s) = build_backends(config);
    let manager = Arc::new(NodeManager::new(Arc::new(vcenter)));
    manager.set_kubernetes_client(Arc::new(k8s));
    manager.set_identifier_source(config.uuid_source);
    manager
}

/// Register every inventory node; returns how many failed discovery.
async fn register_inventory(manager: &dyn Manager, config: &AppConfig) -> usize {
    let mut failures = 0;
    for node in &config.nodes {
        if let Err(err) = manager
            .register_node(node.registration_uuid(), node.node_name())
            .await
        {
            warn!("Node {} registered without a discovered VM: {}", node.name, err);
            failures += 1;
        }
    }
    failures
}

fn print_vm(vm: &VirtualMachine) {
    println!(
        "{}\t{}\t{}\t{}\tconnection={} renewals={}",
        vm.uuid,
        vm.vcenter_host,
        vm.datacenter,
        vm.moref,
        vm.session.connection_id,
        vm.session.renewals
    );
}

async fn run(matches: &ArgMatches, manager: Arc<NodeManager>) -> Result<()> {
    match matches.subcommand() {
        Some(("nodes", _)) => {
            for (name, uuid) in manager.registered_nodes() {
                let uuid = if uuid.is_placeholder() {
                    "<pending>".to_string()
                } else {
                    uuid.to_string()
                };
                println!("{name}\t{uuid}");
            }
        }
        Some(("lookup", sub)) => {
            let vm = if let Some(name) = sub.get_one::<String>("name") {
                manager.get_node_by_name(&NodeName::new(name.clone())).await?
            } else {
                let uuid = sub
                    .get_one::<String>("uuid")
                    .ok_or_else(|| anyhow!("--uuid or --name is required"))?;
                let datacenter = match (
                    sub.get_one::<String>("datacenter"),
                    sub.get_one::<String>("vcenter"),
                ) {
                    (Some(dc), Some(host)) => Some(Datacenter::new(dc.clone(), host.clone())),
                    _ => None,
                };
                manager
                    .get_node(&NodeUuid::new(uuid.clone()), datacenter.as_ref())
                    .await?
            };
            print_vm(&vm);
        }
        Some(("reverse", sub)) => {
            let uuid = sub
                .get_one::<String>("uuid")
                .ok_or_else(|| anyhow!("--uuid is required"))?;
            let name = manager
                .get_node_name_by_uuid(&NodeUuid::new(uuid.clone()))
                .await?;
            println!("{name}");
        }
        Some(("unregister", sub)) => {
            let name = sub
                .get_one::<String>("name")
                .ok_or_else(|| anyhow!("--name is required"))?;
            manager.unregister_node(&NodeName::new(name.clone())).await?;
            println!(
                "Unregistered {name}; {} node(s) remain",
                manager.registered_node_count()
            );
        }
        _ => {
            let vms = manager.get_all_nodes().await?;
            for vm in &vms {
                print_vm(vm);
            }
            info!(
                "Renewed {} of {} registered nodes",
                vms.len(),
                manager.registered_node_count()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = load_config_with_overrides(&matches)?;
    init_logging(&config)?;

    info!(
        "Starting nodevm-node {} (commit {})",
        NODEVM_VERSION,
        git_commit_hash()
    );
    if let Some(path) = &config.config_path {
        info!("Loaded configuration from {}", path.display());
    }
    info!(
        "Inventory has {} node(s), node UUID source: {}",
        config.nodes.len(),
        config.uuid_source
    );

    let manager = build_manager(&config);
    let failures = register_inventory(manager.as_ref(), &config).await;
    if failures > 0 {
        warn!("{} node(s) failed discovery during registration", failures);
    }

    run(&matches, manager).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::settings::NodeEntry;

    fn entry(name: &str, uuid: &str, host: &str, pending_uuid: bool) -> NodeEntry {
        NodeEntry {
            name: name.to_string(),
            uuid: uuid.to_string(),
            vcenter_host: host.to_string(),
            datacenter: "dc-1".to_string(),
            moref: format!("vm-{name}"),
            pending_uuid,
        }
    }

    fn app_config(nodes: Vec<NodeEntry>) -> AppConfig {
        AppConfig {
            config_path: None,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            uuid_source: NodeUuidSource::CsiNode,
            nodes,
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn lookup_requires_name_or_uuid() {
        assert!(build_cli()
            .try_get_matches_from(["nodevm-node", "lookup"])
            .is_err());
        assert!(build_cli()
            .try_get_matches_from(["nodevm-node", "lookup", "--uuid", "u1", "--datacenter", "dc-1"])
            .is_err());
        assert!(build_cli()
            .try_get_matches_from([
                "nodevm-node",
                "lookup",
                "--uuid",
                "u1",
                "--datacenter",
                "dc-1",
                "--vcenter",
                "vc-a"
            ])
            .is_ok());
    }

    #[tokio::test]
    async fn inventory_registers_and_sweeps() {
        let config = app_config(vec![
            entry("worker-1", "u1", "vc-a", false),
            entry("worker-2", "u2", "vc-a", false),
            entry("worker-3", "u3", "vc-b", true),
        ]);
        let manager = build_manager(&config);

        // The pending node is registered but has nothing to discover yet.
        assert_eq!(register_inventory(manager.as_ref(), &config).await, 1);
        assert_eq!(manager.registered_node_count(), 3);
        assert_eq!(manager.discovered_node_count(), 2);

        let vm = manager
            .get_node_by_name(&NodeName::new("worker-3"))
            .await
            .unwrap();
        assert_eq!(vm.uuid, NodeUuid::new("u3"));

        let vms = manager.get_all_nodes().await.unwrap();
        assert_eq!(vms.len(), 3);
    }
}

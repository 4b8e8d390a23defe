use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;

use aerobridge::{
    boot, cli,
    config::{DeviceDirectory, GatewayConfig, NodeRole},
    gateway, provision, sender,
};

fn main() -> Result<()> {
    boot::init_logging()?;
    let matches = cli::parse_args();

    match matches.subcommand() {
        Some(("run", sub)) => run(sub),
        Some(("provision", sub)) => run_provision(sub),
        _ => unreachable!("subcommand is required"),
    }
}

fn load_config(matches: &ArgMatches) -> Result<GatewayConfig> {
    let path = matches
        .get_one::<String>("config")
        .ok_or_else(|| anyhow!("missing config path"))?;
    if std::path::Path::new(path).exists() {
        GatewayConfig::from_file(path)
    } else {
        log::warn!("Settings file {path} not found, using defaults");
        Ok(GatewayConfig::default())
    }
}

fn parse_role(raw: &str) -> Result<NodeRole> {
    match raw {
        "sender" => Ok(NodeRole::Sender),
        "receiver" => Ok(NodeRole::Receiver),
        other => Err(anyhow!("Unknown role {other:?}, expected sender or receiver")),
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let mut config = load_config(matches)?;
    if let Some(port) = matches.get_one::<String>("radio-port") {
        config.radio_port = port.clone();
    }
    if let Some(port) = matches.get_one::<String>("fieldbus-port") {
        config.fieldbus_port = Some(port.clone());
    }

    let role = match matches.get_one::<String>("role") {
        Some(raw) => parse_role(raw)?,
        None => {
            // The directory is the source of truth for what this node is.
            let directory = DeviceDirectory::from_file(&config.directory_path)?;
            let hardware_id = provision::read_hardware_id(&config.hardware_id_path)?;
            directory
                .get(&hardware_id)
                .with_context(|| {
                    format!("Node {hardware_id} is not provisioned, run `aerobridge provision`")
                })?
                .role
        }
    };

    match role {
        NodeRole::Sender => sender::run(config),
        NodeRole::Receiver => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(gateway::run(config)),
    }
}

fn run_provision(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let interface = matches
        .get_one::<String>("interface")
        .ok_or_else(|| anyhow!("missing interface"))?;
    let role = parse_role(matches.get_one::<String>("role").map(String::as_str).unwrap_or("sender"))?;
    let channel = cli::parse_prefixed_u8(
        matches
            .get_one::<String>("channel")
            .map(String::as_str)
            .unwrap_or("0x17"),
    )?;
    let radio_type = matches
        .get_one::<String>("radio-type")
        .cloned()
        .unwrap_or_else(|| "e220".to_string());
    let operator_address = matches
        .get_one::<String>("custom-addr")
        .map(|raw| cli::parse_prefixed_u16(raw))
        .transpose()?;
    let unit_id = matches.get_one::<u16>("unit-id").copied();

    provision::run(
        &config.directory_path,
        &config.hardware_id_path,
        interface,
        role,
        channel,
        radio_type,
        operator_address,
        unit_id,
    )
}

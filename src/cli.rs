use clap::{Arg, ArgMatches, Command};

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    Command::new("aerobridge")
        .about("LoRa air-quality fleet gateway with a Modbus RTU register bridge")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("run")
                .about("Run this node in the role recorded in the device directory")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .short('c')
                        .help("Path to the gateway settings file")
                        .value_name("FILE")
                        .default_value("/etc/aerobridge/config.json"),
                )
                .arg(
                    Arg::new("role")
                        .long("role")
                        .help("Override the directory-recorded role: sender or receiver")
                        .value_name("ROLE"),
                )
                .arg(
                    Arg::new("radio-port")
                        .long("radio-port")
                        .help("Override the radio serial port")
                        .value_name("PORT"),
                )
                .arg(
                    Arg::new("fieldbus-port")
                        .long("fieldbus-port")
                        .help("Override the Modbus fieldbus serial port")
                        .value_name("PORT"),
                ),
        )
        .subcommand(
            Command::new("provision")
                .about("Derive this node's radio address and merge it into the device directory")
                .arg(
                    Arg::new("interface")
                        .help("Network interface whose MAC keys the directory record")
                        .value_name("INTERFACE")
                        .required(true),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .short('c')
                        .help("Path to the gateway settings file")
                        .value_name("FILE")
                        .default_value("/etc/aerobridge/config.json"),
                )
                .arg(
                    Arg::new("role")
                        .long("role")
                        .help("Node role: sender or receiver")
                        .value_name("ROLE")
                        .default_value("sender"),
                )
                .arg(
                    Arg::new("channel")
                        .long("channel")
                        .help("Radio channel, hex accepted (e.g. 0x17)")
                        .value_name("CHANNEL")
                        .default_value("0x17"),
                )
                .arg(
                    Arg::new("radio-type")
                        .long("radio-type")
                        .help("Transceiver family")
                        .value_name("TYPE")
                        .default_value("e220"),
                )
                .arg(
                    Arg::new("custom-addr")
                        .long("custom-addr")
                        .help("Operator address override instead of the derived address")
                        .value_name("ADDR"),
                )
                .arg(
                    Arg::new("unit-id")
                        .long("unit-id")
                        .help("Explicit register slot id instead of auto-assignment")
                        .value_name("ID")
                        .value_parser(clap::value_parser!(u16)),
                ),
        )
        .get_matches()
}

/// Parse a numeric argument that may carry a `0x` prefix.
pub fn parse_prefixed_u16(raw: &str) -> anyhow::Result<u16> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(digits) => u16::from_str_radix(digits, 16),
        None => raw.parse(),
    };
    parsed.map_err(|_| anyhow::anyhow!("Invalid numeric value {raw:?}"))
}

pub fn parse_prefixed_u8(raw: &str) -> anyhow::Result<u8> {
    let value = parse_prefixed_u16(raw)?;
    u8::try_from(value).map_err(|_| anyhow::anyhow!("Value {raw:?} does not fit in one byte"))
}

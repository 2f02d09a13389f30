//! The shard consensus daemon.
//!
//! Starts a single cluster member from a YAML configuration file and runs it
//! until interrupted, logging committed operations and periodic status. The
//! simulation host embeds [`shard_consensus::consensus::Node`] directly; this
//! binary exists to run and observe a cluster standalone.

#![warn(clippy::all)]

use shard_consensus::consensus::{Address, Configuration, Index, Node, StateMachine};
use shard_consensus::Result;

use log::info;
use serde::Deserialize;
use std::time::Duration;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("Starts a shard consensus cluster member.")
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("shardd.yaml"),
        )
        .get_matches();
    let config = Config::load(args.get_one::<String>("config").unwrap())?;

    let log_level = config.log_level.parse::<simplelog::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("invalid log level {}, using info", config.log_level);
        simplelog::LevelFilter::Info
    });
    let mut log_config = simplelog::ConfigBuilder::new();
    if log_level != simplelog::LevelFilter::Debug {
        log_config.add_filter_allow_str("shard_consensus");
        log_config.add_filter_allow_str("shardd");
    }
    simplelog::SimpleLogger::init(log_level, log_config.build())?;

    let members = config
        .members
        .iter()
        .map(|member| member.parse::<Address>())
        .collect::<Result<Vec<_>>>()?;
    let id = config.id;
    info!("member {id} of {:?}", members);

    let node = Node::new(
        Configuration::from_addresses(members),
        id,
        Box::new(OperationLogger),
    )?;

    loop {
        std::thread::sleep(Duration::from_secs(1));
        let status = node.status();
        info!(
            "term={} leader={:?} commit={} log={} connections={}{}",
            status.term,
            status.leader,
            status.commit_index,
            status.log_size,
            status.active_connections,
            if status.is_fully_connected { " (full)" } else { "" },
        );
    }
}

/// Logs every committed operation. A real host supplies its own state
/// machine; the daemon just makes the commits visible.
struct OperationLogger;

impl StateMachine for OperationLogger {
    fn apply(&mut self, index: Index, operation: &[u8]) {
        info!("applied {index}: {}", String::from_utf8_lossy(operation));
    }
}

/// The daemon configuration, from a YAML file with SHARD_* environment
/// overrides.
#[derive(Debug, Deserialize)]
struct Config {
    /// This member's index in the members list.
    id: u32,
    /// The log level filter.
    log_level: String,
    /// The ordered member addresses, as host:port.
    members: Vec<String>,
}

impl Config {
    fn load(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("id", 0)?
            .set_default("log_level", "info")?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("SHARD"))
            .build()?
            .try_deserialize()?)
    }
}

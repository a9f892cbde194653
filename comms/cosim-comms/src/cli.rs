//! Parses the command line arguments and runs a node.
//!
//! Basic usage, a broker and a client on the same machine:
//!
//! ```text
//! cosim-comms --kind udp --port 24000 broker
//! cosim-comms --kind udp --broker localhost:24000 ping --count 5
//! ```

use crate::{
    applications::{Echo, Ping},
    node::{Node, NodeError},
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use cosim_comms_core::{CommsKind, CommsRegistry, NetworkBrokerData};
use std::{
    fs::{create_dir_all, OpenOptions},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Stores the different command line arguments.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Write JSON logs to a file under ./logs instead of the terminal
    #[arg(short, long)]
    pub log: bool,
    /// TOML file with the network configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Transport to use: tcp, udp, fabric or inproc
    #[arg(short, long, default_value = "tcp")]
    pub kind: CommsKind,
    #[arg(short, long)]
    pub name: Option<String>,
    /// Broker address, optionally with a port
    #[arg(short, long)]
    pub broker: Option<String>,
    /// Local port
    #[arg(short, long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub broker_port: Option<u16>,
    /// Start an in-process broker if the named one is not running
    #[arg(long)]
    pub autobroker: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a root node that answers pings until interrupted
    Broker,
    /// Connect to a broker and time a series of pings
    Ping {
        #[arg(long, default_value_t = 10)]
        count: u16,
    },
}

impl Args {
    /// The configuration file, if any, with the command line on top.
    pub fn network_info(&self) -> anyhow::Result<NetworkBrokerData> {
        let mut info = match &self.config {
            Some(path) => NetworkBrokerData::load(path)?,
            None => NetworkBrokerData::default(),
        };
        if let Some(broker) = &self.broker {
            info.broker_address = broker.clone();
        }
        if self.port.is_some() {
            info.port_number = self.port;
        }
        if self.broker_port.is_some() {
            info.broker_port = self.broker_port;
        }
        info.autobroker |= self.autobroker;
        Ok(info)
    }

    fn node_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match self.command {
            Command::Broker => "broker".to_string(),
            Command::Ping { .. } => format!("ping-{}", std::process::id()),
        }
    }
}

/// Parses the arguments, sets up logging, and runs the chosen command.
pub async fn initialize_from_arguments() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging(args.log)?;
    run(args).await
}

/// Runs the command in `args` until it finishes or ctrl-c is pressed.
pub async fn run(args: Args) -> anyhow::Result<()> {
    let info = args.network_info()?;
    let registry = CommsRegistry::new();
    let trip_wire = registry.trip_wire().clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => trip_wire.trip(),
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    let autobroker = start_autobroker(&registry, args.kind, &info).await?;
    let name = args.node_name();
    let node = Node::new(&registry, args.kind, &name, &info).await?;
    let result = match args.command {
        Command::Broker => node.run(Arc::new(Echo::new())).await,
        Command::Ping { count } => {
            let ping = Arc::new(Ping::new(count));
            let result = node.run(ping.clone()).await;
            println!("{}", report(&ping.round_trips(), count));
            result
        }
    };
    if let Some(autobroker) = autobroker {
        registry.trip_wire().trip();
        autobroker.await??;
    }
    Ok(result?)
}

/// Runs an echo broker under the configured broker name when autobroker is
/// set and nothing by that name is registered. Only in-process brokers can
/// be started this way.
pub async fn start_autobroker(
    registry: &CommsRegistry,
    kind: CommsKind,
    info: &NetworkBrokerData,
) -> Result<Option<JoinHandle<Result<(), NodeError>>>, NodeError> {
    if !info.autobroker || info.broker_address.is_empty() {
        return Ok(None);
    }
    if kind != CommsKind::Inproc {
        tracing::warn!("Ignoring autobroker, a {} broker has to be started separately", kind);
        return Ok(None);
    }
    if registry.find(&info.broker_address).is_some() {
        return Ok(None);
    }
    tracing::info!("Starting broker {}", info.broker_address);
    let broker = Node::new(registry, kind, &info.broker_address, &NetworkBrokerData::default()).await?;
    Ok(Some(tokio::spawn(broker.run(Arc::new(Echo::new())))))
}

fn report(round_trips: &[Duration], sent: u16) -> String {
    let mut lines: Vec<String> = round_trips
        .iter()
        .enumerate()
        .map(|(i, round_trip)| format!("pong {}: {:.3} ms", i + 1, millis(*round_trip)))
        .collect();
    match (round_trips.iter().min(), round_trips.iter().max()) {
        (Some(min), Some(max)) => {
            let total: Duration = round_trips.iter().sum();
            let average = total / round_trips.len() as u32;
            lines.push(format!(
                "{}/{} answered, min {:.3} ms, avg {:.3} ms, max {:.3} ms",
                round_trips.len(),
                sent,
                millis(*min),
                millis(average),
                millis(*max)
            ));
        }
        _ => lines.push(format!("no pongs received for {sent} pings")),
    }
    lines.join("\n")
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Installs the global subscriber. With `to_file` every event is written as
/// JSON to ./logs/debug-<timestamp>.log; otherwise events are printed,
/// filtered by `RUST_LOG`.
fn initialize_logging(to_file: bool) -> anyhow::Result<()> {
    if !to_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?;
        return Ok(());
    }
    let main_path = "./logs";
    create_dir_all(main_path).context("Failed to create the log directory")?;
    let file_path = format!(
        "{}/debug-{}.log",
        main_path,
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&file_path)
        .with_context(|| format!("Failed to open log file {file_path}"))?;
    let subscriber = FmtSubscriber::builder()
        .with_writer(Arc::new(file))
        .with_max_level(tracing::Level::TRACE)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("A logger is already installed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(1000)]
    fn ping_defaults() {
        let args = Args::try_parse_from(["cosim-comms", "--kind", "udp", "-b", "host:24000", "ping"])
            .unwrap();
        assert_eq!(args.kind, CommsKind::Udp);
        assert!(matches!(args.command, Command::Ping { count: 10 }));
        let info = args.network_info().unwrap();
        assert_eq!(info.broker_address, "host:24000");
        assert_eq!(info.port_number, None);
        assert!(args.node_name().starts_with("ping-"));
    }

    #[test]
    #[ntest::timeout(1000)]
    fn broker_options() {
        let args = Args::try_parse_from([
            "cosim-comms",
            "--port",
            "24100",
            "--broker-port",
            "24200",
            "-n",
            "root",
            "broker",
        ])
        .unwrap();
        assert_eq!(args.kind, CommsKind::Tcp);
        let info = args.network_info().unwrap();
        assert_eq!(info.port_number, Some(24100));
        assert_eq!(info.broker_port, Some(24200));
        assert_eq!(args.node_name(), "root");
    }

    #[test]
    #[ntest::timeout(1000)]
    fn unknown_kinds_are_rejected() {
        assert!(Args::try_parse_from(["cosim-comms", "--kind", "carrier-pigeon", "broker"]).is_err());
    }

    #[test]
    #[ntest::timeout(1000)]
    fn autobroker_flag_overrides_the_file() {
        let args = Args::try_parse_from(["cosim-comms", "--kind", "inproc", "-b", "hub", "--autobroker", "ping"])
            .unwrap();
        let info = args.network_info().unwrap();
        assert!(info.autobroker);
        assert_eq!(info.broker_address, "hub");
    }

    #[test]
    fn report_handles_silence() {
        assert_eq!(report(&[], 3), "no pongs received for 3 pings");
        assert_eq!(
            report(&[Duration::from_millis(2), Duration::from_millis(4)], 2),
            "pong 1: 2.000 ms\npong 2: 4.000 ms\n2/2 answered, min 2.000 ms, avg 3.000 ms, max 4.000 ms"
        );
    }

    #[tokio::test]
    async fn autobroker_starts_a_missing_inproc_broker() {
        let registry = CommsRegistry::new();
        let info = NetworkBrokerData {
            broker_address: "hub".into(),
            autobroker: true,
            ..Default::default()
        };
        let broker = start_autobroker(&registry, CommsKind::Inproc, &info)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.find("hub").is_some());
        // Already running, so nothing new is started
        assert!(start_autobroker(&registry, CommsKind::Inproc, &info)
            .await
            .unwrap()
            .is_none());
        assert!(start_autobroker(&registry, CommsKind::Udp, &info)
            .await
            .unwrap()
            .is_none());

        let pinger = Node::new(&registry, CommsKind::Inproc, "pinger", &info).await.unwrap();
        let ping = Arc::new(Ping::new(2));
        tokio::time::timeout(Duration::from_secs(10), pinger.run(ping.clone()))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), broker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ping.round_trips().len(), 2);
        assert!(registry.names().is_empty());
    }
}

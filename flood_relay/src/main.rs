// CLI entry point for the flood relay.
//
// Joins a local multicast group, listens for peer relays, dials any peers
// given on the command line, then hands the terminal to the console (see
// `console.rs`). Settings come from defaults, then an optional JSON config
// file, then flags.
//
// Usage:
//   flood-relay [GROUP:PORT] [OPTIONS]
//     --config <FILE>        JSON config file
//     --listen-port <PORT>   Peer listener port (default: 47474)
//     --bind <ADDR>          Peer listener address (default: 0.0.0.0)
//     --interface <ADDR>     Interface used to join the group
//     --name <NAME>          Name announced to peers (default: host name)
//     --packet-len <BYTES>   Fixed packet length (default: 1024)
//     --peer <ADDR>          Peer to dial at startup, [name@]host:port
//     --reap-threshold <N>   Finished workers joined in bulk (default: 5)
//     --dial-timeout-ms, --dial-attempts, --handshake-timeout-ms,
//     --poll-interval-ms     Timing knobs, see `config.rs`
//     --debug                Debug logging for the relay crates

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use flood_relay::config::RelayConfig;
use flood_relay::console::run_console;
use flood_relay::error::RelayError;
use flood_relay::server::RelayCore;

#[derive(Parser, Debug)]
#[command(name = "flood-relay", version, about, long_about = None)]
struct Args {
    /// Local multicast group and port to bridge.
    #[arg(value_name = "GROUP:PORT")]
    group: Option<SocketAddrV4>,

    /// JSON config file; flags override its values.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, value_name = "PORT")]
    listen_port: Option<u16>,

    #[arg(short, long, value_name = "ADDR")]
    bind: Option<IpAddr>,

    #[arg(short, long, value_name = "ADDR")]
    interface: Option<Ipv4Addr>,

    #[arg(short, long)]
    name: Option<String>,

    #[arg(long, value_name = "BYTES")]
    packet_len: Option<usize>,

    /// Peer to dial at startup. Repeatable.
    #[arg(short, long = "peer", value_name = "[NAME@]HOST:PORT")]
    peers: Vec<String>,

    /// Finished link workers tolerated before they are joined in bulk.
    #[arg(long, value_name = "N")]
    reap_threshold: Option<usize>,

    #[arg(long, value_name = "MS")]
    dial_timeout_ms: Option<u64>,

    #[arg(long, value_name = "N")]
    dial_attempts: Option<u32>,

    #[arg(long, value_name = "MS")]
    handshake_timeout_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig, RelayError> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::from_json_file(path)?,
            None => RelayConfig::default(),
        };
        if let Some(group) = self.group {
            config.group = *group.ip();
            config.group_port = group.port();
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_host = bind;
        }
        if let Some(interface) = self.interface {
            config.interface = interface;
        }
        if let Some(name) = self.name {
            config.node_name = Some(name);
        }
        if let Some(len) = self.packet_len {
            config.packet_len = len;
        }
        config.peers.extend(self.peers);
        config.reap_threshold = self.reap_threshold.unwrap_or(config.reap_threshold);
        config.dial_timeout_ms = self.dial_timeout_ms.unwrap_or(config.dial_timeout_ms);
        config.dial_attempts = self.dial_attempts.unwrap_or(config.dial_attempts);
        config.handshake_timeout_ms = self
            .handshake_timeout_ms
            .unwrap_or(config.handshake_timeout_ms);
        config.poll_interval_ms = self.poll_interval_ms.unwrap_or(config.poll_interval_ms);
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_directive = if args.debug {
        "flood_relay=debug,flood_relay_protocol=debug,info"
    } else {
        "flood_relay=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "bad configuration");
            return ExitCode::FAILURE;
        }
    };
    let group = SocketAddrV4::new(config.group, config.group_port);

    let core = match RelayCore::start_multicast(config) {
        Ok(core) => core,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            return ExitCode::FAILURE;
        }
    };
    println!(
        "Relaying {group} as {}; listening for peers on {}",
        core.node_name(),
        core.local_addr()
    );
    println!("Type \"help\" for a list of commands.");

    match run_console(core, io::stdin().lock(), io::stdout()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "console failed");
            ExitCode::FAILURE
        }
    }
}

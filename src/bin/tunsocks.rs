//! tunsocks proxy binary
//!
//! Usage: tunsocks [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file (JSON)
//!   -h, --help           Print help information

use std::env;

use tunsocks::proxy::Server;
use tunsocks::stack::{PbufPool, StackDriver};
use tunsocks::tun::TunDevice;
use tunsocks::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    let config = match args.get(1).map(String::as_str) {
        None => Config::default(),
        Some("-h") | Some("--help") => {
            print_usage();
            return Ok(());
        }
        Some("-c") | Some("--config") => {
            let Some(path) = args.get(2) else {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            };
            Config::load(path)?
        }
        Some(other) => {
            eprintln!("Unknown option: {}", other);
            print_usage();
            return Ok(());
        }
    };

    tracing::info!("starting...");

    // Setup failures here are fatal: there is no proxying without the
    // packet path.
    let tun = TunDevice::open(&config.tun_name)?;
    let pool = PbufPool::new(config.pool_segments);
    let (driver, stack) = StackDriver::new(tun, &config, pool)?;

    tracing::info!(
        "embedded stack at {}/{} via {} on {}",
        config.stack_addr,
        config.stack_prefix,
        config.gateway,
        config.tun_name
    );

    let driver_task = tokio::spawn(driver.run());

    let server = Server::new(config, stack);
    let metrics = server.metrics();

    tokio::select! {
        res = server.run() => res?,
        res = driver_task => match res {
            Ok(inner) => inner?,
            Err(e) => anyhow::bail!("stack driver task failed: {}", e),
        },
        _ = tokio::signal::ctrl_c() => {
            let snapshot = metrics.snapshot();
            tracing::info!(
                "shutting down after {:?}: {} sessions ({} active), {} bytes out, {} bytes in",
                snapshot.uptime,
                snapshot.total_sessions,
                snapshot.active_sessions,
                snapshot.bytes_to_remote,
                snapshot.bytes_to_client
            );
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"tunsocks - SOCKS5 proxy over a user-space TCP/IP stack

USAGE:
    tunsocks [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file (JSON)
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON, all fields optional):
    {{
        "listen_addr": "0.0.0.0",
        "listen_port": 8080,
        "tun_name": "lwip0",
        "stack_addr": "10.0.0.100",
        "stack_prefix": 8,
        "gateway": "10.0.0.1"
    }}

The TUN interface must exist and be routed by the host:
    ip tuntap add dev lwip0 mode tun
    ip addr add 10.0.0.1/8 dev lwip0
    ip link set lwip0 up
"#
    );
}

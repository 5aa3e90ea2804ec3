//! RUDP Server Binary
//!
//! Usage: rudp-server [OPTIONS]
//!
//! Options:
//!   --bind <ADDR>   Bind address (default 0.0.0.0)
//!   --port <PORT>   UDP port (default 9000)
//!   --drop <P>      Simulated receive loss probability [0..1]
//!   -v, --verbose   Debug logging
//!   -h, --help      Print help information

use std::env;

use rudp::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut bind = "0.0.0.0".to_string();
    let mut port: u16 = 9000;
    let mut drop_rate: f64 = 0.0;
    let mut verbose = false;

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "-v" | "--verbose" => verbose = true,
            "--bind" => {
                bind = next_value(&args, &mut i, "--bind")?;
            }
            "--port" => {
                port = next_value(&args, &mut i, "--port")?.parse()?;
            }
            "--drop" => {
                drop_rate = next_value(&args, &mut i, "--drop")?.parse()?;
            }
            other => {
                eprintln!("Unknown option: {other}");
                print_usage();
                anyhow::bail!("unknown option");
            }
        }
        i += 1;
    }

    init_tracing(verbose);

    if !(0.0..=1.0).contains(&drop_rate) {
        anyhow::bail!("--drop must be within [0, 1]");
    }

    let mut server = Server::bind(&bind, port, drop_rate).await?;
    tracing::info!("ready; waiting for connections");

    while let Some(transfer) = server.accept().await {
        tokio::spawn(async move {
            let peer = transfer.peer();
            let (data, metrics) = transfer.collect().await;
            tracing::info!(
                %peer,
                bytes = data.len(),
                segments = metrics.segments_received,
                invalid = metrics.invalid_segments,
                elapsed_ms = metrics.elapsed.as_millis() as u64,
                throughput_kbps = metrics.throughput_kbps(),
                "transfer complete"
            );
        });
    }

    Ok(())
}

fn next_value(args: &[String], i: &mut usize, flag: &str) -> anyhow::Result<String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

fn print_usage() {
    println!(
        r#"RUDP Server - reliable byte streams over UDP

USAGE:
    rudp-server [OPTIONS]

OPTIONS:
    --bind <ADDR>    Bind address (default 0.0.0.0)
    --port <PORT>    UDP port (default 9000)
    --drop <P>       Drop each received datagram with probability P [0..1]
    -v, --verbose    Debug logging
    -h, --help       Print help information

EXAMPLES:
    Run on the default port:
        rudp-server

    Simulate 5% receive loss:
        rudp-server --port 9000 --drop 0.05
"#
    );
}

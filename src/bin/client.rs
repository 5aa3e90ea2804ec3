//! RUDP Client Binary
//!
//! Usage: rudp-client [OPTIONS]
//!
//! Options:
//!   --host <HOST>        Server host (default 127.0.0.1)
//!   --port <PORT>        Server port (default 9000)
//!   -m, --message <S>    Send a text message
//!   -f, --file <PATH>    Send a file
//!   -s, --synthetic <N>  Send N deterministic bytes
//!   --no-crypto          Disable payload encryption
//!   --no-cc              Disable congestion control
//!   --timeout <SECS>     Overall per-operation deadline
//!   -v, --verbose        Debug logging
//!   -h, --help           Print help information

use std::env;
use std::time::Duration;

use rudp::{Client, ConnectionConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut host = "127.0.0.1".to_string();
    let mut port: u16 = 9000;
    let mut message: Option<String> = None;
    let mut file: Option<String> = None;
    let mut synthetic: Option<usize> = None;
    let mut config = ConnectionConfig::default();
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
            "--host" => host = next_value(&args, &mut i, "--host")?,
            "--port" => port = next_value(&args, &mut i, "--port")?.parse()?,
            "-m" | "--message" => message = Some(next_value(&args, &mut i, "--message")?),
            "-f" | "--file" => file = Some(next_value(&args, &mut i, "--file")?),
            "-s" | "--synthetic" => {
                synthetic = Some(next_value(&args, &mut i, "--synthetic")?.parse()?)
            }
            "--no-crypto" => config.use_crypto = false,
            "--no-cc" => config.cc_enabled = false,
            "--timeout" => {
                let secs: u64 = next_value(&args, &mut i, "--timeout")?.parse()?;
                config.op_timeout = Some(Duration::from_secs(secs));
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

    if [message.is_some(), file.is_some(), synthetic.is_some()]
        .iter()
        .filter(|set| **set)
        .count()
        > 1
    {
        anyhow::bail!("--message, --file, and --synthetic are mutually exclusive");
    }

    let data: Vec<u8> = if let Some(path) = file {
        let bytes = std::fs::read(&path)?;
        tracing::info!(path = %path, bytes = bytes.len(), "sending file");
        bytes
    } else if let Some(n) = synthetic {
        tracing::info!(bytes = n, "sending synthetic payload");
        synthetic_bytes(n)
    } else if let Some(text) = message {
        text.into_bytes()
    } else {
        b"ola".to_vec()
    };

    let mut client = Client::connect(&host, port, config).await?;
    client.send_bytes(&data).await?;
    client.close().await?;

    let metrics = client.metrics();
    tracing::info!("=== transfer result ===");
    tracing::info!(
        bytes = data.len(),
        segments_sent = metrics.segments_sent,
        retransmissions = metrics.retransmissions,
        timeouts = metrics.timeouts,
        duplicate_acks = metrics.duplicate_acks,
        elapsed_ms = metrics.elapsed.as_millis() as u64,
        throughput_kbps = data.len() as f64 / 1024.0 / metrics.elapsed.as_secs_f64(),
        "done"
    );

    Ok(())
}

/// Deterministic payload: `byte[i] = i mod 256`.
fn synthetic_bytes(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i % 256) as u8).collect()
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
        r#"RUDP Client - reliable byte streams over UDP

USAGE:
    rudp-client [OPTIONS]

OPTIONS:
    --host <HOST>        Server host (default 127.0.0.1)
    --port <PORT>        Server port (default 9000)
    -m, --message <S>    Send a text message
    -f, --file <PATH>    Send a file
    -s, --synthetic <N>  Send N deterministic bytes
    --no-crypto          Disable payload encryption
    --no-cc              Disable congestion control
    --timeout <SECS>     Overall per-operation deadline
    -v, --verbose        Debug logging
    -h, --help           Print help information

EXAMPLES:
    Send a message:
        rudp-client --host 127.0.0.1 --port 9000 -m "Ola RUDP!"

    Send 10 MiB of synthetic data without encryption:
        rudp-client -s 10485760 --no-crypto
"#
    );
}

// LoRaLink Linux: runs the link over a UDP broadcast "air" with a file key store
// and line commands on stdin.

mod air;
mod config;
mod console;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use loralink_core::{perform, FileKeyStore, LinkCore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use crate::air::UdpAir;
use crate::console::Command;

/// Loop period; one receive and one pass of the periodic tasks per tick.
const LOOP_PERIOD: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(name = "loralink")]
#[command(about = "Paired, encrypted messaging over an emulated LoRa link")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/loralink/config.toml, /etc/loralink/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Local UDP address for the air socket.
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Comma separated destinations for outbound packets.
    #[arg(long)]
    air: Option<String>,
    #[arg(long)]
    keystore: Option<PathBuf>,
    /// Debug logging (RUST_LOG takes precedence).
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
    }
    if let Some(air) = &cli.air {
        cfg.air = config::parse_addr_list(air).context("--air")?;
    }
    if let Some(ks) = cli.keystore {
        cfg.keystore = ks;
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let store = FileKeyStore::new(&cfg.keystore, &hardware_bits());
    let mut core = LinkCore::new(Box::new(store), cfg.protocol.clone())
        .with_context(|| format!("opening key store {}", cfg.keystore.display()))?;
    let mut air = UdpAir::bind(cfg.bind, cfg.air.clone())
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;

    println!("DeviceId: {}", core.device_id());
    if let Some(peer) = core.peer() {
        println!("[BIND] restored pairing with {}", peer);
    }

    let start = Instant::now();
    let clock = || start.elapsed().as_millis() as u64;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(LOOP_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for event in core.run_once(&mut air, clock()) {
                    println!("{}", console::describe(&event));
                }
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match Command::parse(&line) {
                    Ok(Some(cmd)) => {
                        let reply = console::execute(&mut core, cmd, clock());
                        for text in reply.lines {
                            println!("{}", text);
                        }
                        for event in perform(&mut air, reply.actions) {
                            println!("{}", console::describe(&event));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                },
                None => stdin_open = false,
            },
            res = &mut shutdown => {
                res?;
                tracing::info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Hardware-unique bytes mixed into a freshly generated device id.
fn hardware_bits() -> Vec<u8> {
    for p in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(s) = std::fs::read_to_string(p) {
            let s = s.trim();
            if !s.is_empty() {
                return s.as_bytes().to_vec();
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_default().into_bytes()
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

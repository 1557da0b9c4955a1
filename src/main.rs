use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadlink::{CipherSuite, Config, Identity, KdfHash, Node};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    identity: Option<Identity>,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    /// `IP:PORT` or `IP:PORT/IDENTITY`.
    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = match s.rsplit_once('/') {
            Some((addr, id)) => (addr, Some(id)),
            None => (s, None),
        };

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let identity = id_part
            .map(|id| Identity::from_hex(id).context("identity must be 64 hex characters (32 bytes)"))
            .transpose()?;

        Ok(BootstrapPeer { addr, identity })
    }
}

#[derive(Parser, Debug)]
#[command(name = "kadlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0", env = "KADLINK_BIND")]
    bind: SocketAddr,

    /// Peer to join through, as IP:PORT or IP:PORT/IDENTITY.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Seconds between telemetry log lines.
    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,

    #[arg(long, default_value = "10000", env = "KADLINK_HANDSHAKE_TIMEOUT_MS")]
    handshake_timeout_ms: u64,

    #[arg(long, default_value = "3000", env = "KADLINK_ACK_TIMEOUT_MS")]
    ack_timeout_ms: u64,

    #[arg(long, default_value = "3000", env = "KADLINK_LOOKUP_TIMEOUT_MS")]
    lookup_timeout_ms: u64,

    /// aes-256-gcm, chacha20-poly1305 or xchacha20-poly1305.
    #[arg(long, default_value = "chacha20-poly1305", env = "KADLINK_CIPHER")]
    cipher: CipherSuite,

    /// sha256 or sha512.
    #[arg(long, default_value = "sha256", env = "KADLINK_KDF")]
    kdf: KdfHash,

    #[arg(short = 'k', long, default_value = "20", env = "KADLINK_BUCKET_SIZE")]
    bucket_size: usize,

    #[arg(long, default_value = "3", env = "KADLINK_ALPHA")]
    alpha: usize,

    #[arg(long, default_value = "3", env = "KADLINK_DISJOINT_PATHS")]
    disjoint_paths: usize,

    /// Leading zero bits required of peer identities; 0 disables the check.
    #[arg(long, default_value = "0", env = "KADLINK_POW_DIFFICULTY")]
    pow_difficulty: u32,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            lookup_timeout: Duration::from_millis(self.lookup_timeout_ms),
            ..Config::default()
        }
        .with_cipher(self.cipher)
        .with_kdf(self.kdf)
        .with_lookup(self.bucket_size, self.alpha, self.disjoint_paths)
        .with_pow_difficulty(self.pow_difficulty)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = args.config();
    config.validate()?;
    if config.pow_difficulty > 0 {
        info!(difficulty = config.pow_difficulty, "computing identity proof-of-work");
    }

    let node = Node::bind_with_config(&args.bind.to_string(), config).await?;
    info!("Node identity: {}", node.identity());

    for peer in &args.bootstrap {
        info!(addr = %peer.addr, "Bootstrapping");
        match node.connect(&peer.addr.to_string()).await {
            Ok(contact) => {
                if let Some(expected) = peer.identity
                    && expected != contact.identity
                {
                    warn!(addr = %peer.addr, expected = %expected, got = %contact.identity, "bootstrap peer identity mismatch");
                    node.disconnect(&contact.identity);
                    continue;
                }
                info!(peer = %contact.identity, "Bootstrap peer connected");
            }
            Err(e) => {
                warn!(addr = %peer.addr, error = %format!("{e:#}"), "Bootstrap failed");
            }
        }
    }

    if !node.routing_table().is_empty() {
        let found = node.find_node(node.identity()).await;
        info!(found = found.len(), routing_peers = node.routing_table().len(), "self lookup complete");
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.telemetry();
                info!(
                    routing_peers = snapshot.routing_peers,
                    connections = snapshot.connections,
                    buckets = ?snapshot.buckets,
                    "telemetry snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

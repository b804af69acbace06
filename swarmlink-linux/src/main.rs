// Swarmlink daemon: polls the local identity's swarm, serves direct P2P delivery and
// tracks contact presence.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use swarmlink_core::{IdentityProvider, Keypair};
use swarmlink_linux::config::{self, Config};
use swarmlink_linux::{p2p, FileStore, Network, Poller, PresenceConfig, PresenceManager, SendPipeline};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const IDENTITY_FILE: &str = "identity.key";

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("swarmlink {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .with_target(false)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating {}", cfg.data_dir.display()))?;
    let keypair = load_or_create_identity(&cfg.data_dir)?;
    let identity = keypair.public_identity();
    info!(version = VERSION, %identity, "starting swarmlink");

    let store = Arc::new(FileStore::open(&cfg.data_dir).context("opening store")?);
    let network = Network::new(cfg.network(), store).context("building http client")?;
    let pipeline = SendPipeline::new(network.clone(), cfg.send());

    let presence_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.check_timeout_secs))
        .build()
        .context("building p2p client")?;
    let presence = PresenceManager::new(
        identity.clone(),
        PresenceConfig {
            advertised_address: cfg.advertised_address.clone(),
            advertised_port: cfg.p2p_port,
            direct_timeout: Duration::from_secs(cfg.check_timeout_secs),
        },
        presence_client,
        pipeline,
    );
    for contact in &cfg.contacts {
        presence.add_contact(contact).await;
    }

    let (sink, mut inbox) = tokio::sync::mpsc::channel(256);
    let listener = p2p::bind(cfg.p2p_port)
        .await
        .with_context(|| format!("binding p2p port {}", cfg.p2p_port))?;
    let p2p_sink = sink.clone();
    let p2p_presence = presence.clone();
    tokio::spawn(async move {
        if let Err(e) = p2p::serve(listener, p2p_sink, Some(p2p_presence)).await {
            error!(error = %e, "p2p listener stopped");
        }
    });

    let poller = Poller::new(network.clone(), identity.clone(), cfg.poller()).start(sink);
    tokio::spawn(async move {
        while let Some(envelope) = inbox.recv().await {
            info!(
                source = %envelope.source,
                kind = ?envelope.kind,
                timestamp = envelope.timestamp,
                bytes = envelope.content.len(),
                "message received"
            );
        }
    });

    if !cfg.contacts.is_empty() {
        let broadcaster = presence.clone();
        tokio::spawn(async move {
            broadcaster.broadcast_presence().await;
        });
    }

    shutdown_signal().await?;
    info!("shutting down");
    poller.stop();
    presence.shutdown();
    Ok(())
}

/// Read the X25519 secret from `<data_dir>/identity.key`, creating it on first run.
fn load_or_create_identity(data_dir: &Path) -> anyhow::Result<Keypair> {
    let path = data_dir.join(IDENTITY_FILE);
    match std::fs::read(&path) {
        Ok(bytes) => {
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("{} is not a 32-byte key", path.display()))?;
            Ok(Keypair::from_secret_bytes(secret))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            write_secret(&path, &keypair.secret_bytes())
                .with_context(|| format!("writing {}", path.display()))?;
            warn!(path = %path.display(), "generated new identity");
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn write_secret(path: &Path, secret: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)?.write_all(secret)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

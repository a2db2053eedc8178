use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use crypto::{CryptManager, PrivateIdentity, StandardCrypt};
use node::{
    MessageListener, NetworkManager, NodeConfig, ObjectParser, ReceivedMessage, TuningState,
    append_identity, load_identities, seal_message,
};
use proto::{StreamId, topology};
use storage::{Datastore, FileStore};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about = "Proof-of-work gated gossip node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the network and relay objects until interrupted.
    Run(RunArgs),
    /// Generate a new identity and append it to the identities file.
    Keygen {
        /// Optional path to a TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Free-form label stored next to the keys.
        #[arg(long)]
        label: Option<String>,
    },
    /// Print the stream walk between two streams and their perimeters.
    Path {
        #[arg(long)]
        from: StreamId,
        #[arg(long)]
        to: StreamId,
    },
    /// Seal a message of the given size and report the proof-of-work cost.
    Pow {
        /// Optional path to a TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Message body size in bytes.
        #[arg(long, default_value_t = 256)]
        size: usize,
        /// Message lifetime in seconds.
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
    },
}

#[derive(Args, Clone, Debug, Default)]
struct RunArgs {
    /// Optional path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Extra seed addresses (added to those from the config file).
    #[arg(long = "seed")]
    seeds: Vec<std::net::SocketAddr>,

    /// Run without a listener.
    #[arg(long)]
    passive: bool,
}

struct LogListener;

impl MessageListener for LogListener {
    fn on_message(&self, message: &ReceivedMessage) {
        info!(
            inventory = %message.inventory,
            recipient = %hex::encode(message.recipient),
            sender = %hex::encode(message.sender.ripe()),
            body = %String::from_utf8_lossy(&message.body),
            "message delivered"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_node(args).await?,
        Commands::Keygen { config, label } => keygen(config, label)?,
        Commands::Path { from, to } => print_path(from, to),
        Commands::Pow { config, size, ttl } => {
            tokio::task::spawn_blocking(move || measure_pow(config, size, ttl))
                .await
                .context("pow task failed")??;
        }
    }
    Ok(())
}

async fn run_node(args: RunArgs) -> anyhow::Result<()> {
    let mut config = NodeConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    config.seeds.extend(args.seeds);
    if args.passive {
        config.listen = None;
    }

    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let tuning_path = config.tuning_path();
    let crypt = Arc::new(StandardCrypt::new(
        config.pow_settings(&TuningState::load(&tuning_path)),
    ));

    let objects = FileStore::open(config.objects_dir())?;
    let datastore = Arc::new(Datastore::new(config.store.clone(), Arc::new(objects))?);
    for identity in load_identities(&config.identities_path())? {
        let identity = datastore.add_identity(identity);
        info!(ripe = %hex::encode(identity.ripe()), "loaded identity");
    }

    let parser = Arc::new(ObjectParser::start(
        Arc::clone(&datastore),
        crypt.clone(),
        config.parser_queue,
    )?);
    parser.add_listener(Arc::new(LogListener));

    let manager =
        NetworkManager::start(config.manager_config(), datastore, crypt.clone(), parser).await?;
    info!(
        listen = ?manager.local_addr(),
        streams = ?config.streams,
        objects = manager.datastore().object_count(),
        "node services started"
    );

    if let Err(err) = signal::ctrl_c().await {
        error!(error = ?err, "failed to install ctrl-c handler");
    }

    info!("shutdown requested");
    manager.shutdown().await;

    let tuning = TuningState {
        batch_size: Some(crypt.learned_batch_size()),
    };
    if let Err(err) = tuning.save(&tuning_path) {
        error!(error = ?err, "failed to persist pow tuning");
    }
    Ok(())
}

fn keygen(config: Option<PathBuf>, label: Option<String>) -> anyhow::Result<()> {
    let config = NodeConfig::load(config.as_deref())?;
    let identity = PrivateIdentity::generate();
    let path = config.identities_path();
    append_identity(&path, &identity, label)?;

    let public = identity.public();
    println!("ripe:           {}", hex::encode(identity.ripe()));
    println!("signing key:    {}", hex::encode(public.signing_key));
    println!("encryption key: {}", hex::encode(public.encryption_key));
    info!(path = %path.display(), "identity stored");
    Ok(())
}

fn print_path(from: StreamId, to: StreamId) {
    let walk = topology::path(from, to);
    if walk.is_empty() {
        println!("stream 0 does not exist");
        return;
    }
    println!("path:      {walk:?}");
    println!("perimeter: {:?} -> {:?}", topology::perimeter(from), topology::perimeter(to));
}

fn measure_pow(config: Option<PathBuf>, size: usize, ttl: u64) -> anyhow::Result<()> {
    let config = NodeConfig::load(config.as_deref())?;
    let tuning_path = config.tuning_path();
    let crypt = StandardCrypt::new(config.pow_settings(&TuningState::load(&tuning_path)));
    let identity = PrivateIdentity::generate();
    let body = vec![0x42; size];
    let stream = config.streams.first().copied().unwrap_or(1);

    let started = Instant::now();
    let object = seal_message(
        &crypt,
        &identity,
        identity.public(),
        &body,
        stream,
        Duration::from_secs(ttl),
    )?;
    let elapsed = started.elapsed();

    println!("object bytes:  {}", object.as_bytes().len());
    println!("target:        {}", crypt.pow_target(object.pow_payload().len()));
    println!("nonce:         {}", object.nonce());
    println!("elapsed:       {elapsed:.2?}");
    println!("batch size:    {}", crypt.learned_batch_size());

    TuningState {
        batch_size: Some(crypt.learned_batch_size()),
    }
    .save(&tuning_path)
}

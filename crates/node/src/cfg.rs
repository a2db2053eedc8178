use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use crypto::{PowParams, PowSettings, PrivateIdentity};
use p2p::ConnectionConfig;
use proto::StreamId;
use serde::{Deserialize, Serialize};
use storage::StoreConfig;
use tracing::{info, warn};

use crate::manager::ManagerConfig;

const TUNING_FILE: &str = "pow-tuning.toml";

/// Runtime configuration for the node binary.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// `None` runs without a listener (passive mode).
    pub listen: Option<SocketAddr>,
    pub seeds: Vec<SocketAddr>,
    pub streams: Vec<StreamId>,
    pub user_agent: String,
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/identities.toml`.
    pub identities_path: Option<PathBuf>,
    pub max_connections_active: usize,
    pub max_connections_passive: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_message_size: usize,
    pub store: StoreConfig,
    pub parser_queue: usize,
    pub pow: PowConfig,
}

#[derive(Clone, Debug)]
pub struct PowConfig {
    pub extra_bytes: u64,
    pub trials_per_byte: u64,
    pub target_load: f64,
    pub workers: usize,
}

impl NodeConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let candidate = path.map(PathBuf::from).unwrap_or_else(default_config_path);
        if !candidate.exists() {
            if let Some(explicit) = path {
                info!(path = %explicit.display(), "configuration file not found, using defaults");
            }
            config.store = config.store.from_env();
            return Ok(config);
        }

        let contents = fs::read_to_string(&candidate)
            .with_context(|| format!("failed to read config at {}", candidate.display()))?;
        let raw: RawNodeConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config at {}", candidate.display()))?;
        config.apply(raw);
        config.store = config.store.from_env();

        info!(path = %candidate.display(), "loaded configuration overrides");
        Ok(config)
    }

    fn apply(&mut self, raw: RawNodeConfig) {
        if let Some(listen) = raw.listen {
            self.listen = Some(listen);
        }
        if raw.passive == Some(true) {
            self.listen = None;
        }
        if let Some(seeds) = raw.seeds {
            self.seeds = seeds;
        }
        if let Some(streams) = raw.streams {
            let streams: Vec<StreamId> = streams.into_iter().filter(|s| *s != 0).collect();
            if streams.is_empty() {
                warn!("no usable streams configured, keeping {:?}", self.streams);
            } else {
                self.streams = streams;
            }
        }
        if let Some(agent) = raw.user_agent {
            self.user_agent = agent;
        }
        if let Some(dir) = raw.data_dir {
            self.data_dir = dir;
        }
        if let Some(path) = raw.identities_path {
            self.identities_path = Some(path);
        }
        if let Some(limit) = raw.max_connections_active {
            self.max_connections_active = limit;
        }
        if let Some(limit) = raw.max_connections_passive {
            self.max_connections_passive = limit;
        }
        if let Some(secs) = raw.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = raw.read_timeout_ms {
            self.read_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = raw.handshake_timeout_secs {
            self.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = raw.max_message_size {
            self.max_message_size = size;
        }
        if let Some(capacity) = raw.parser_queue {
            self.parser_queue = capacity.max(1);
        }
        if let Some(store) = raw.store {
            if let Some(capacity) = store.cache_capacity {
                self.store.cache_capacity = capacity;
            }
            if let Some(secs) = store.address_retention_secs {
                self.store.address_retention_secs = secs;
            }
            if let Some(secs) = store.request_retention_secs {
                self.store.request_retention_secs = secs;
            }
        }
        if let Some(pow) = raw.pow {
            if let Some(extra) = pow.extra_bytes {
                self.pow.extra_bytes = extra;
            }
            if let Some(trials) = pow.trials_per_byte {
                self.pow.trials_per_byte = trials.max(1);
            }
            if let Some(load) = pow.target_load {
                self.pow.target_load = load.clamp(0.01, 1.0);
            }
            if let Some(workers) = pow.workers {
                self.pow.workers = workers.max(1);
            }
        }
    }

    pub fn identities_path(&self) -> PathBuf {
        self.identities_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("identities.toml"))
    }

    pub fn tuning_path(&self) -> PathBuf {
        self.data_dir.join(TUNING_FILE)
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            handshake_timeout: self.handshake_timeout,
            max_message_size: self.max_message_size,
            user_agent: self.user_agent.clone(),
            streams: self.streams.clone(),
            ..ConnectionConfig::default()
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            listen: self.listen,
            seeds: self.seeds.clone(),
            max_connections_active: self.max_connections_active,
            max_connections_passive: self.max_connections_passive,
            connection: self.connection_config(),
            ..ManagerConfig::default()
        }
    }

    /// Proof-of-work settings, starting from the batch size learned last run.
    pub fn pow_settings(&self, tuning: &TuningState) -> PowSettings {
        let mut settings = PowSettings {
            params: PowParams {
                trials_per_byte: self.pow.trials_per_byte,
                extra_bytes: self.pow.extra_bytes,
            },
            workers: self.pow.workers,
            target_load: self.pow.target_load,
            ..PowSettings::default()
        };
        if let Some(batch) = tuning.batch_size {
            settings.batch_size = batch.clamp(pow::MIN_BATCH, pow::MAX_BATCH);
        }
        settings
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        let manager = ManagerConfig::default();
        let pow = PowSettings::default();
        Self {
            listen: Some(SocketAddr::from(([0, 0, 0, 0], 8444))),
            seeds: Vec::new(),
            streams: connection.streams,
            user_agent: connection.user_agent,
            data_dir: PathBuf::from(".gossip"),
            identities_path: None,
            max_connections_active: manager.max_connections_active,
            max_connections_passive: manager.max_connections_passive,
            connect_timeout: connection.connect_timeout,
            read_timeout: connection.read_timeout,
            handshake_timeout: connection.handshake_timeout,
            max_message_size: connection.max_message_size,
            store: StoreConfig::default(),
            parser_queue: 256,
            pow: PowConfig {
                extra_bytes: pow.params.extra_bytes,
                trials_per_byte: pow.params.trials_per_byte,
                target_load: pow.target_load,
                workers: pow.workers,
            },
        }
    }
}

fn default_config_path() -> PathBuf {
    PathBuf::from("node.toml")
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawNodeConfig {
    listen: Option<SocketAddr>,
    passive: Option<bool>,
    seeds: Option<Vec<SocketAddr>>,
    streams: Option<Vec<StreamId>>,
    user_agent: Option<String>,
    data_dir: Option<PathBuf>,
    identities_path: Option<PathBuf>,
    max_connections_active: Option<usize>,
    max_connections_passive: Option<usize>,
    connect_timeout_secs: Option<u64>,
    read_timeout_ms: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    max_message_size: Option<usize>,
    parser_queue: Option<usize>,
    store: Option<RawStoreConfig>,
    pow: Option<RawPowConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawStoreConfig {
    cache_capacity: Option<usize>,
    address_retention_secs: Option<u64>,
    request_retention_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawPowConfig {
    extra_bytes: Option<u64>,
    trials_per_byte: Option<u64>,
    target_load: Option<f64>,
    workers: Option<usize>,
}

/// Proof-of-work throttle state carried between runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningState {
    pub batch_size: Option<u64>,
}

impl TuningState {
    /// A missing or unreadable file yields the default state.
    pub fn load(path: &Path) -> Self {
        let Ok(contents) = fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&contents) {
            Ok(state) => state,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable tuning file");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let contents = toml::to_string(self).context("failed to encode tuning state")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write tuning state to {}", path.display()))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdentityFile {
    #[serde(default, rename = "identity")]
    identities: Vec<IdentityEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityEntry {
    label: Option<String>,
    signing_key: String,
    encryption_key: String,
}

fn decode_key(hex_key: &str, what: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(hex_key).with_context(|| format!("{what} is not hex"))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow::anyhow!("{what} has {} bytes, expected 32", bytes.len()))
}

/// Reads the private identities stored at `path`. A missing file holds none.
pub fn load_identities(path: &Path) -> anyhow::Result<Vec<PrivateIdentity>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read identities at {}", path.display()))?;
    let file: IdentityFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse identities at {}", path.display()))?;
    file.identities
        .iter()
        .map(|entry| {
            Ok(PrivateIdentity::from_secret_bytes(
                decode_key(&entry.signing_key, "signing_key")?,
                decode_key(&entry.encryption_key, "encryption_key")?,
            ))
        })
        .collect()
}

/// Appends `identity` to the file at `path`, creating it if needed.
pub fn append_identity(
    path: &Path,
    identity: &PrivateIdentity,
    label: Option<String>,
) -> anyhow::Result<()> {
    let mut file = if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read identities at {}", path.display()))?;
        toml::from_str::<IdentityFile>(&contents)
            .with_context(|| format!("failed to parse identities at {}", path.display()))?
    } else {
        IdentityFile::default()
    };
    let (signing, encryption) = identity.secret_bytes();
    file.identities.push(IdentityEntry {
        label,
        signing_key: hex::encode(*signing),
        encryption_key: hex::encode(*encryption),
    });
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let contents = toml::to_string(&file).context("failed to encode identities")?;
    fs::write(path, contents)
        .with_context(|| format!("failed to write identities to {}", path.display()))
}

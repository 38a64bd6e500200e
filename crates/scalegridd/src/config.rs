//! Node configuration.
//!
//! Resolved once at startup from three layers, later ones winning:
//! compiled-in defaults, the TOML file named by `--config.file`, and
//! command-line flags. The result is an immutable [`NodeConfig`].
//!
//! ```toml
//! [node]
//! name = "node-a"
//! listen_address = "0.0.0.0:8600"
//! shutdown_grace = "10s"
//!
//! [cluster]
//! listen_address = "0.0.0.0:8601"
//! peers = ["10.0.0.2:8601", "10.0.0.3:8601"]
//! probe_interval = "1s"
//!
//! [store]
//! url = "http://10.0.0.9:8700"   # or: path = "/var/lib/scalegrid/store.redb"
//! lease_ttl = "15s"
//!
//! [autoscaler]
//! metrics_url = "http://prometheus:9090"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use clap::Args;
use scalegrid_cluster::PeerConfig;
use scalegrid_coord::CoordConfig;
use scalegrid_state::duration::parse_duration;
use serde::Deserialize;

// ── File layer ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub autoscaler: AutoscalerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSection {
    pub name: Option<String>,
    pub listen_address: Option<String>,
    pub shutdown_grace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSection {
    pub listen_address: Option<String>,
    pub advertise_address: Option<String>,
    pub peers: Option<Vec<String>>,
    pub replay_on_join: Option<bool>,
    pub peer_timeout: Option<String>,
    pub gossip_interval: Option<String>,
    pub gossip_nodes: Option<usize>,
    pub pushpull_interval: Option<String>,
    pub tcp_timeout: Option<String>,
    pub probe_timeout: Option<String>,
    pub probe_interval: Option<String>,
    pub indirect_checks: Option<usize>,
    pub suspicion_mult: Option<u32>,
    pub retransmit_mult: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    pub url: Option<String>,
    pub path: Option<PathBuf>,
    pub lease_ttl: Option<String>,
    pub call_timeout: Option<String>,
    pub watch_wait: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoscalerSection {
    pub metrics_url: Option<String>,
    pub metrics_timeout: Option<String>,
    pub action_timeout: Option<String>,
    pub resync_interval: Option<String>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

// ── Flag layer ─────────────────────────────────────────────────

/// Flags of `scalegridd run`. Every flag is optional so that an unset flag
/// falls through to the file and then the default.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// TOML configuration file.
    #[arg(long = "config.file")]
    pub config_file: Option<PathBuf>,

    /// Unique node name in the cluster.
    #[arg(long = "node.name")]
    pub node_name: Option<String>,

    /// Address to serve the API on.
    #[arg(long = "listen-address")]
    pub listen_address: Option<String>,

    /// Address for the cluster protocol (UDP and TCP).
    #[arg(long = "cluster.listen-address")]
    pub cluster_listen_address: Option<String>,

    /// Explicit address to advertise in the cluster.
    #[arg(long = "cluster.advertise-address")]
    pub cluster_advertise_address: Option<String>,

    /// Initial peers, comma separated.
    #[arg(long = "cluster.peers", value_delimiter = ',')]
    pub cluster_peers: Vec<String>,

    /// How long a leaving node waits for its departure to be acknowledged.
    #[arg(long = "cluster.peer-timeout")]
    pub cluster_peer_timeout: Option<String>,

    /// Interval between gossip rounds.
    #[arg(long = "cluster.gossip-interval")]
    pub cluster_gossip_interval: Option<String>,

    /// Interval between full state syncs with a random peer.
    #[arg(long = "cluster.pushpull-interval")]
    pub cluster_pushpull_interval: Option<String>,

    /// Timeout of a full state sync.
    #[arg(long = "cluster.tcp-timeout")]
    pub cluster_tcp_timeout: Option<String>,

    /// How long to wait for a probe ack.
    #[arg(long = "cluster.probe-timeout")]
    pub cluster_probe_timeout: Option<String>,

    /// Interval between random peer probes.
    #[arg(long = "cluster.probe-interval")]
    pub cluster_probe_interval: Option<String>,

    /// URL of a shared store served by `scalegridd store`.
    #[arg(long = "store.url", conflicts_with = "store_path")]
    pub store_url: Option<String>,

    /// Path of an embedded on-disk store (single-host clusters).
    #[arg(long = "store.path")]
    pub store_path: Option<PathBuf>,

    /// Base URL of the Prometheus server policies query.
    #[arg(long = "autoscaler.metrics-url")]
    pub metrics_url: Option<String>,
}

// ── Resolved ───────────────────────────────────────────────────

/// Where the coordination store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    /// Shared store reached over HTTP.
    Remote(String),
    /// redb file owned by this process.
    Embedded(PathBuf),
    /// Volatile store; only meaningful for a single node.
    InMemory,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub api_addr: SocketAddr,
    pub peer: PeerConfig,
    pub seeds: Vec<SocketAddr>,
    pub replay_on_join: bool,
    pub store: StoreTarget,
    pub coord: CoordConfig,
    pub metrics_url: String,
    pub metrics_timeout: Duration,
    pub action_timeout: Duration,
    /// Full relist of policies and locks, repairing missed watch events.
    pub resync_interval: Duration,
    pub shutdown_grace: Duration,
}

pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8600";
pub const DEFAULT_METRICS_URL: &str = "http://127.0.0.1:9090";

fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "scalegrid".to_string())
}

fn pick_duration(
    field: &str,
    flag: Option<&String>,
    file: Option<&String>,
    default: Duration,
) -> anyhow::Result<Duration> {
    match flag.or(file) {
        Some(raw) => parse_duration(raw).map_err(|e| anyhow!("invalid {field} {raw:?}: {e}")),
        None => Ok(default),
    }
}

fn pick_addr(
    field: &str,
    flag: Option<&String>,
    file: Option<&String>,
    default: &str,
) -> anyhow::Result<SocketAddr> {
    let raw = flag.or(file).map_or(default, String::as_str);
    raw.parse()
        .with_context(|| format!("invalid {field} {raw:?}"))
}

impl NodeConfig {
    /// Read the config file named in `args`, if any, and resolve.
    pub fn load(args: &RunArgs) -> anyhow::Result<Self> {
        let file = match &args.config_file {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(&file, args)
    }

    /// Merge the layers and validate the result.
    pub fn resolve(file: &FileConfig, args: &RunArgs) -> anyhow::Result<Self> {
        let defaults = PeerConfig::default();
        let (fc, fs, fa) = (&file.cluster, &file.store, &file.autoscaler);

        let name = args
            .node_name
            .clone()
            .or_else(|| file.node.name.clone())
            .unwrap_or_else(default_node_name);

        let api_addr = pick_addr(
            "listen address",
            args.listen_address.as_ref(),
            file.node.listen_address.as_ref(),
            DEFAULT_API_ADDR,
        )?;
        let bind_addr = match args.cluster_listen_address.as_ref().or(fc.listen_address.as_ref()) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid cluster listen address {raw:?}"))?,
            None => defaults.bind_addr,
        };
        let advertise_addr = match args
            .cluster_advertise_address
            .as_ref()
            .or(fc.advertise_address.as_ref())
        {
            Some(raw) => Some(
                raw.parse()
                    .with_context(|| format!("invalid cluster advertise address {raw:?}"))?,
            ),
            None => None,
        };

        let raw_peers: &[String] = if args.cluster_peers.is_empty() {
            fc.peers.as_deref().unwrap_or_default()
        } else {
            &args.cluster_peers
        };
        let seeds = raw_peers
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| {
                p.trim()
                    .parse()
                    .with_context(|| format!("invalid cluster peer {p:?}"))
            })
            .collect::<anyhow::Result<Vec<SocketAddr>>>()?;

        let peer = PeerConfig {
            name: name.clone(),
            bind_addr,
            advertise_addr,
            probe_interval: pick_duration(
                "probe interval",
                args.cluster_probe_interval.as_ref(),
                fc.probe_interval.as_ref(),
                defaults.probe_interval,
            )?,
            probe_timeout: pick_duration(
                "probe timeout",
                args.cluster_probe_timeout.as_ref(),
                fc.probe_timeout.as_ref(),
                defaults.probe_timeout,
            )?,
            gossip_interval: pick_duration(
                "gossip interval",
                args.cluster_gossip_interval.as_ref(),
                fc.gossip_interval.as_ref(),
                defaults.gossip_interval,
            )?,
            gossip_nodes: fc.gossip_nodes.unwrap_or(defaults.gossip_nodes),
            push_pull_interval: pick_duration(
                "push-pull interval",
                args.cluster_pushpull_interval.as_ref(),
                fc.pushpull_interval.as_ref(),
                defaults.push_pull_interval,
            )?,
            tcp_timeout: pick_duration(
                "tcp timeout",
                args.cluster_tcp_timeout.as_ref(),
                fc.tcp_timeout.as_ref(),
                defaults.tcp_timeout,
            )?,
            indirect_checks: fc.indirect_checks.unwrap_or(defaults.indirect_checks),
            suspicion_mult: fc.suspicion_mult.unwrap_or(defaults.suspicion_mult),
            retransmit_mult: fc.retransmit_mult.unwrap_or(defaults.retransmit_mult),
            leave_timeout: pick_duration(
                "peer timeout",
                args.cluster_peer_timeout.as_ref(),
                fc.peer_timeout.as_ref(),
                defaults.leave_timeout,
            )?,
        };

        let store = match (args.store_url.as_ref(), args.store_path.as_ref()) {
            (Some(url), _) => StoreTarget::Remote(url.clone()),
            (None, Some(path)) => StoreTarget::Embedded(path.clone()),
            (None, None) => match (&fs.url, &fs.path) {
                (Some(_), Some(_)) => bail!("store.url and store.path are mutually exclusive"),
                (Some(url), None) => StoreTarget::Remote(url.clone()),
                (None, Some(path)) => StoreTarget::Embedded(path.clone()),
                (None, None) => StoreTarget::InMemory,
            },
        };

        let coord_defaults = CoordConfig::default();
        let coord = CoordConfig {
            lease_ttl: pick_duration("lease ttl", None, fs.lease_ttl.as_ref(), coord_defaults.lease_ttl)?,
            call_timeout: pick_duration(
                "store call timeout",
                None,
                fs.call_timeout.as_ref(),
                coord_defaults.call_timeout,
            )?,
            watch_wait: pick_duration(
                "watch wait",
                None,
                fs.watch_wait.as_ref(),
                coord_defaults.watch_wait,
            )?,
        };

        let config = NodeConfig {
            name,
            api_addr,
            peer,
            seeds,
            replay_on_join: fc.replay_on_join.unwrap_or(false),
            store,
            coord,
            metrics_url: args
                .metrics_url
                .clone()
                .or_else(|| fa.metrics_url.clone())
                .unwrap_or_else(|| DEFAULT_METRICS_URL.to_string()),
            metrics_timeout: pick_duration(
                "metrics timeout",
                None,
                fa.metrics_timeout.as_ref(),
                Duration::from_secs(10),
            )?,
            action_timeout: pick_duration(
                "action timeout",
                None,
                fa.action_timeout.as_ref(),
                Duration::from_secs(10),
            )?,
            resync_interval: pick_duration(
                "resync interval",
                None,
                fa.resync_interval.as_ref(),
                Duration::from_secs(60),
            )?,
            shutdown_grace: pick_duration(
                "shutdown grace",
                None,
                file.node.shutdown_grace.as_ref(),
                Duration::from_secs(10),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            bail!("node name cannot be empty");
        }
        self.peer
            .validate()
            .context("invalid cluster configuration")?;

        for (field, value) in [
            ("lease ttl", self.coord.lease_ttl),
            ("store call timeout", self.coord.call_timeout),
            ("watch wait", self.coord.watch_wait),
            ("metrics timeout", self.metrics_timeout),
            ("action timeout", self.action_timeout),
            ("resync interval", self.resync_interval),
        ] {
            if value.is_zero() {
                bail!("{field} must be positive");
            }
        }
        // Renewals run every ttl/3; each must be able to finish before the next.
        if self.coord.lease_ttl < self.coord.call_timeout * 3 {
            bail!(
                "lease ttl {:?} must be at least three store call timeouts ({:?})",
                self.coord.lease_ttl,
                self.coord.call_timeout * 3
            );
        }
        if let StoreTarget::Remote(url) = &self.store
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            bail!("store url {url:?} must be http(s)");
        }
        Ok(())
    }
}

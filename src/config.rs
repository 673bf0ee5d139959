//! INI configuration for the gossip node.
//!
//! The file has a root section holding the `hostkey` path (the node's RSA
//! private key, PEM) and a `[gossip]` section with the protocol knobs. Any
//! missing key falls back to its default; a missing or unreadable hostkey is
//! fatal, as are weights that do not form a valid push/pull/history split.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::RsaPrivateKey;

use crate::gossip::node::{Identity, Node};

const WEIGHT_SUM: i64 = 100;
const FLOAT_EQUALITY_THRESHOLD: f64 = 1e-3;

/// Fatal configuration errors; the process exits with status 1 on any of
/// these.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: ini::Error,
    },
    #[error("no hostkey path in the configuration")]
    MissingHostkey,
    #[error("could not read hostkey {path}: {source}")]
    ReadHostkey {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse RSA private key from {path}: {source}")]
    ParseHostkey {
        path: PathBuf,
        source: rsa::pkcs1::Error,
    },
    #[error("all weights must be greater than 0 -- push:{push}, pull:{pull}, history:{history}")]
    NonPositiveWeight { push: i64, pull: i64, history: i64 },
    #[error("weights must add up to {WEIGHT_SUM} -- push:{push}, pull:{pull}, history:{history}")]
    WeightSum { push: i64, pull: i64, history: i64 },
    #[error("alpha + beta + gamma must equal 1.0 -- alpha={alpha:.3}, beta={beta:.3}, gamma={gamma:.3}")]
    WeightSplit { alpha: f64, beta: f64, gamma: f64 },
    #[error("malformed bootstrap node entry {0:?}, expected <hex-identity>,<address>")]
    MalformedBootstrapNode(String),
}

/// Everything the gossip node needs to run.
#[derive(Clone)]
pub struct GossipConfig {
    /// Target view size L.
    pub view_size: usize,
    /// Number of samplers in the history group.
    pub sampler_size: usize,
    /// Fraction of L rebuilt from push responses.
    pub alpha: f64,
    /// Fraction of L rebuilt from pull responses.
    pub beta: f64,
    /// Fraction of L rebuilt from sampler history.
    pub gamma: f64,
    /// TCP bind address of the local application API.
    pub api_address: String,
    /// UDP bind address of the P2P endpoint.
    pub gossip_address: String,
    pub bootstrap_nodes: Vec<Node>,
    /// Liveness probing cadence, in rounds.
    pub rounds_between_pings: u64,
    /// Directory of peer public keys, file name = hex identity.
    pub hostkeys_path: PathBuf,
    /// The node's RSA private key.
    pub private_key: RsaPrivateKey,
    /// Leading zero bits required from push challenge solutions.
    pub challenge_difficulty: u32,
    /// Deadline for solving a peer's push challenge.
    pub challenge_max_solve: Duration,
    /// Wall-clock length of one gossip round. Not read from the INI file;
    /// tests shorten it.
    pub round_interval: Duration,
}

impl GossipConfig {
    /// Read the configuration from an INI file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let root = ini.section(None::<String>);
        let gossip = ini.section(Some("gossip"));

        let hostkey_path = root
            .and_then(|s| s.get("hostkey"))
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingHostkey)?;
        let private_key = load_private_key(Path::new(hostkey_path))?;

        let (alpha, beta, gamma) = alpha_beta_gamma(
            get_int_or_default(gossip, "weight_push", 45, true),
            get_int_or_default(gossip, "weight_pull", 45, true),
            get_int_or_default(gossip, "weight_history", 10, true),
        )?;

        let bootstrap_nodes =
            parse_bootstrap_nodes(gossip.and_then(|s| s.get("bootstrap_nodes")).unwrap_or(""))?;

        Ok(GossipConfig {
            view_size: get_int_or_default(gossip, "degree", 30, true) as usize,
            sampler_size: get_int_or_default(gossip, "l2", 30, true) as usize,
            alpha,
            beta,
            gamma,
            api_address: get_string_or_default(gossip, "api_address", "localhost:7001", false),
            gossip_address: get_string_or_default(gossip, "gossip_address", "localhost:7002", false),
            bootstrap_nodes,
            rounds_between_pings: get_int_or_default(gossip, "rounds_between_pings", 8, false)
                as u64,
            hostkeys_path: PathBuf::from(get_string_or_default(
                gossip,
                "hostkeys_path",
                "./hostkeys/",
                true,
            )),
            private_key,
            challenge_difficulty: get_int_or_default(gossip, "challenge_difficulty", 19, false)
                as u32,
            challenge_max_solve: Duration::from_millis(get_int_or_default(
                gossip,
                "challenge_max_solve_ms",
                300,
                false,
            ) as u64),
            round_interval: crate::constants::ROUND_INTERVAL,
        })
    }
}

/// Derive the α/β/γ split from the integer weights.
fn alpha_beta_gamma(push: i64, pull: i64, history: i64) -> Result<(f64, f64, f64), ConfigError> {
    if push <= 0 || pull <= 0 || history <= 0 {
        return Err(ConfigError::NonPositiveWeight {
            push,
            pull,
            history,
        });
    }
    if push + pull + history != WEIGHT_SUM {
        return Err(ConfigError::WeightSum {
            push,
            pull,
            history,
        });
    }
    let alpha = push as f64 / WEIGHT_SUM as f64;
    let beta = pull as f64 / WEIGHT_SUM as f64;
    let gamma = history as f64 / WEIGHT_SUM as f64;
    if (alpha + beta + gamma - 1.0).abs() > FLOAT_EQUALITY_THRESHOLD {
        return Err(ConfigError::WeightSplit { alpha, beta, gamma });
    }
    Ok((alpha, beta, gamma))
}

/// Parse `<hex-id1>,<addr1>|<hex-id2>,<addr2>|...`; a trailing separator is
/// tolerated.
fn parse_bootstrap_nodes(raw: &str) -> Result<Vec<Node>, ConfigError> {
    let mut nodes = Vec::new();
    for entry in raw.split('|').filter(|e| !e.is_empty()) {
        let (id_hex, address) = entry
            .split_once(',')
            .ok_or_else(|| ConfigError::MalformedBootstrapNode(entry.to_string()))?;
        let identity = hex::decode(id_hex.trim())
            .ok()
            .and_then(|raw_id| Identity::from_bytes(&raw_id).ok())
            .ok_or_else(|| ConfigError::MalformedBootstrapNode(entry.to_string()))?;
        let address = address.trim();
        if address.is_empty() {
            return Err(ConfigError::MalformedBootstrapNode(entry.to_string()));
        }
        nodes.push(Node::new(identity, address));
    }
    Ok(nodes)
}

/// Read the node's RSA private key from a PKCS#1 PEM file.
fn load_private_key(path: &Path) -> Result<RsaPrivateKey, ConfigError> {
    let pem = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadHostkey {
        path: path.to_path_buf(),
        source,
    })?;
    RsaPrivateKey::from_pkcs1_pem(&pem).map_err(|source| ConfigError::ParseHostkey {
        path: path.to_path_buf(),
        source,
    })
}

fn get_int_or_default(
    section: Option<&ini::Properties>,
    key: &str,
    fallback: i64,
    warn_missing: bool,
) -> i64 {
    match section.and_then(|s| s.get(key)).map(str::parse) {
        Some(Ok(value)) => value,
        _ => {
            if warn_missing {
                tracing::warn!(key, default = fallback, "Configuration value missing, falling back to default");
            }
            fallback
        }
    }
}

fn get_string_or_default(
    section: Option<&ini::Properties>,
    key: &str,
    fallback: &str,
    warn_missing: bool,
) -> String {
    match section.and_then(|s| s.get(key)).filter(|v| !v.is_empty()) {
        Some(value) => value.to_string(),
        None => {
            if warn_missing {
                tracing::warn!(key, default = fallback, "Configuration value missing, falling back to default");
            }
            fallback.to_string()
        }
    }
}

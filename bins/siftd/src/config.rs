//! Daemon configuration assembled from CLI flags or a JSON file.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Everything the daemon needs to stand up one proxy instance.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub bind: String,
    pub stat_prefix: String,
    pub own_domain: String,
    pub domain_match_param: String,
    pub transaction_timeout: Duration,
    /// name → host addresses
    pub clusters: Vec<(String, Vec<SocketAddr>)>,
    /// domain → cluster
    pub routes: Vec<(String, String)>,
    /// Static affinity table: key → host address
    pub affinity: Vec<(String, String)>,
}

/// JSON file schema. Any omitted field falls back to the daemon defaults.
#[derive(Debug, Deserialize)]
struct FileConfig {
    bind: Option<String>,
    stat_prefix: Option<String>,
    own_domain: Option<String>,
    domain_match_param: Option<String>,
    transaction_timeout_ms: Option<u64>,
    #[serde(default)]
    clusters: Vec<FileCluster>,
    #[serde(default)]
    routes: Vec<FileRoute>,
    #[serde(default)]
    affinity: Vec<FileAffinity>,
}

#[derive(Debug, Deserialize)]
struct FileCluster {
    name: String,
    hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FileRoute {
    domain: String,
    cluster: String,
}

#[derive(Debug, Deserialize)]
struct FileAffinity {
    key: String,
    host: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5060".into(),
            stat_prefix: "sip".into(),
            own_domain: String::new(),
            domain_match_param: String::new(),
            transaction_timeout: Duration::from_secs(32),
            clusters: Vec::new(),
            routes: Vec::new(),
            affinity: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let file: FileConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        let defaults = Self::default();
        let mut config = Self {
            bind: file.bind.unwrap_or(defaults.bind),
            stat_prefix: file.stat_prefix.unwrap_or(defaults.stat_prefix),
            own_domain: file.own_domain.unwrap_or_default(),
            domain_match_param: file.domain_match_param.unwrap_or_default(),
            transaction_timeout: file
                .transaction_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.transaction_timeout),
            ..defaults
        };
        for cluster in file.clusters {
            let hosts = cluster
                .hosts
                .iter()
                .map(|host| parse_host(host))
                .collect::<Result<Vec<_>>>()?;
            config.clusters.push((cluster.name, hosts));
        }
        config.routes = file
            .routes
            .into_iter()
            .map(|route| (route.domain, route.cluster))
            .collect();
        config.affinity = file
            .affinity
            .into_iter()
            .map(|entry| (entry.key, entry.host))
            .collect();
        Ok(config)
    }

    /// Parses a `name=host:port[,host:port...]` cluster flag.
    pub fn add_cluster_flag(&mut self, flag: &str) -> Result<()> {
        let (name, hosts) = flag
            .split_once('=')
            .ok_or_else(|| anyhow!("--cluster expects name=host:port[,host:port...]: {}", flag))?;
        let hosts = hosts
            .split(',')
            .map(parse_host)
            .collect::<Result<Vec<_>>>()?;
        self.clusters.push((name.to_owned(), hosts));
        Ok(())
    }

    /// Parses a `domain=cluster` route flag.
    pub fn add_route_flag(&mut self, flag: &str) -> Result<()> {
        let (domain, cluster) = flag
            .split_once('=')
            .ok_or_else(|| anyhow!("--route expects domain=cluster: {}", flag))?;
        self.routes.push((domain.to_owned(), cluster.to_owned()));
        Ok(())
    }

    /// Parses a `key=host:port` affinity flag.
    pub fn add_affinity_flag(&mut self, flag: &str) -> Result<()> {
        let (key, host) = flag
            .split_once('=')
            .ok_or_else(|| anyhow!("--affinity expects key=host:port: {}", flag))?;
        self.affinity.push((key.to_owned(), host.to_owned()));
        Ok(())
    }
}

fn parse_host(host: &str) -> Result<SocketAddr> {
    host.trim()
        .parse()
        .map_err(|e| anyhow!("invalid host address {}: {}", host, e))
}

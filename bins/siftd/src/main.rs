use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use sip_filter::{
    run_proxy, AffinityEntry, AffinitySource, Cluster, ClusterManager, ProxyConfig, ProxyServices,
    Route, TraServiceConfig,
};
use sip_tra::{StaticTraTransport, TraTransport};
use tracing::info;

mod config;

use config::DaemonConfig;

/// Stateful SIP TCP proxy: routes transactions to upstream clusters with
/// dialog affinity.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Bind address (TCP)
    #[arg(long, default_value = "0.0.0.0:5060")]
    bind: String,
    /// Cluster definition, repeatable: name=host:port[,host:port...]
    #[arg(long = "cluster")]
    clusters: Vec<String>,
    /// Route definition, repeatable: domain=cluster (domain * matches all)
    #[arg(long = "route")]
    routes: Vec<String>,
    /// Statistic prefix for this proxy instance
    #[arg(long, default_value = "sip")]
    stat_prefix: String,
    /// Domain this proxy considers its own
    #[arg(long, default_value = "")]
    own_domain: String,
    /// Top-Route URI parameter carrying the matching domain
    #[arg(long, default_value = "")]
    domain_match_param: String,
    /// Transaction timeout in milliseconds
    #[arg(long, default_value_t = 32_000)]
    transaction_timeout_ms: u64,
    /// Static affinity entry, repeatable: key=host:port. Providing any
    /// enables p-cookie and route-ep affinity against a built-in table.
    #[arg(long = "affinity")]
    affinity: Vec<String>,
    /// Path to a JSON config file; flags are ignored when set
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn into_daemon_config(self) -> Result<DaemonConfig> {
        if let Some(path) = &self.config {
            return DaemonConfig::from_file(path);
        }
        let mut config = DaemonConfig {
            bind: self.bind,
            stat_prefix: self.stat_prefix,
            own_domain: self.own_domain,
            domain_match_param: self.domain_match_param,
            transaction_timeout: Duration::from_millis(self.transaction_timeout_ms),
            ..DaemonConfig::default()
        };
        for flag in &self.clusters {
            config.add_cluster_flag(flag)?;
        }
        for flag in &self.routes {
            config.add_route_flag(flag)?;
        }
        for flag in &self.affinity {
            config.add_affinity_flag(flag)?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let daemon = Args::parse().into_daemon_config()?;

    let clusters = ClusterManager::new();
    for (name, hosts) in &daemon.clusters {
        info!(cluster = %name, hosts = hosts.len(), "registering cluster");
        clusters.insert(Cluster::new(name.as_str(), hosts.clone()));
    }

    let mut proxy_config = ProxyConfig {
        stat_prefix: daemon.stat_prefix.clone(),
        ..ProxyConfig::default()
    };
    proxy_config.settings.own_domain = daemon.own_domain.clone();
    proxy_config.settings.domain_match_parameter_name = daemon.domain_match_param.clone();
    proxy_config.settings.transaction_timeout = daemon.transaction_timeout;
    for (domain, cluster) in &daemon.routes {
        proxy_config
            .route_config
            .routes
            .push(Route::new(domain.as_str(), cluster.as_str()));
    }

    let tra_transport: Option<Arc<dyn TraTransport>> = if daemon.affinity.is_empty() {
        None
    } else {
        let transport = StaticTraTransport::new();
        for (key, host) in &daemon.affinity {
            transport.insert(key.as_str(), host.as_str());
        }
        proxy_config.settings.customized_affinity = vec![
            AffinityEntry::new(AffinitySource::PCookie, "lskpmc"),
            AffinityEntry::new(AffinitySource::RouteEp, "lskpmc"),
        ];
        proxy_config.settings.tra = Some(TraServiceConfig::default());
        Some(Arc::new(transport))
    };

    let services = Arc::new(ProxyServices::new(
        proxy_config,
        Arc::new(clusters),
        tra_transport,
    ));
    run_proxy(services, &daemon.bind).await
}

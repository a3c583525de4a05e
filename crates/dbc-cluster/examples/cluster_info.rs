//! Cluster discovery demonstration
//!
//! Connects to a cluster through the seed given on the command line (or a
//! TOML config file), prints what the tender discovered and keeps tending
//! for a few cycles.
//!
//! ```text
//! cargo run --example cluster_info -- 127.0.0.1:3000
//! cargo run --example cluster_info -- cluster.toml
//! ```

use anyhow::Context;
use dbc_cluster::{Cluster, ClusterConfig, Replica};
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let arg = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:3000".to_string());
    let config = load_config(&arg)?;

    println!("Connecting to cluster through {} seed(s)", config.hosts.len());
    let cluster = Cluster::create(config).await.context("cluster creation failed")?;

    for round in 1..=3 {
        let stats = cluster.stats().await;
        println!("\n--- round {} ---", round);
        println!("Partitions: {}", stats.partition_count);
        println!("Namespaces: {:?}", stats.namespaces);
        for node in &stats.nodes {
            println!(
                "  {} {:?} active={} failures={} friends={}",
                node.name, node.addresses, node.active, node.failures, node.friends
            );
        }

        for namespace in &stats.namespaces {
            if let Ok(node) = cluster.partition_node(namespace, 0, Replica::Master) {
                println!("  {}/0 master: {}", namespace, node.name());
            }
        }

        sleep(Duration::from_secs(2)).await;
    }

    println!("\n{}", serde_json::to_string_pretty(&cluster.stats().await)?);
    cluster.destroy().await;
    Ok(())
}

fn load_config(arg: &str) -> anyhow::Result<ClusterConfig> {
    if arg.ends_with(".toml") {
        return ClusterConfig::from_file(arg).with_context(|| format!("reading {}", arg));
    }

    let (host, port) = arg
        .rsplit_once(':')
        .context("seed must be host:port or a .toml file")?;
    let port: u16 = port.parse().context("invalid seed port")?;
    Ok(ClusterConfig::with_host(host, port))
}

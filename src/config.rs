//! Node configuration: a handful of flags, optionally loaded from a JSON
//! file with the same field names.

use std::net::SocketAddr;

use anyhow::Result;
use serde::Deserialize;

fn default_boot_threshold() -> usize {
    3
}

fn default_scatter_width() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// UDP address this node binds for the bootstrap protocol.
    pub bind: SocketAddr,
    /// Bootstrap server addresses. Empty means this node *is* the
    /// bootstrap server (the cluster founder).
    #[serde(default)]
    pub seeds: Vec<SocketAddr>,
    /// Hosts (including the server) required before the genesis table is
    /// generated.
    #[serde(default = "default_boot_threshold")]
    pub boot_threshold: usize,
    /// Copyset fan-out bound for the placement policy.
    #[serde(default = "default_scatter_width")]
    pub scatter_width: u32,
}

impl NodeConfig {
    pub fn is_bootstrap_server(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn from_args(args: &[String]) -> Result<NodeConfig> {
        let mut bind: Option<SocketAddr> = None;
        let mut seeds: Vec<SocketAddr> = Vec::new();
        let mut boot_threshold = default_boot_threshold();
        let mut scatter_width = default_scatter_width();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    let raw = std::fs::read_to_string(&args[i + 1])?;
                    let cfg: NodeConfig = serde_json::from_str(&raw)?;
                    return Ok(cfg);
                }
                "--bind" => {
                    bind = Some(args[i + 1].parse()?);
                    i += 2;
                    continue;
                }
                "--seed" => {
                    seeds.push(args[i + 1].parse()?);
                    i += 2;
                    continue;
                }
                "--boot-threshold" => {
                    boot_threshold = args[i + 1].parse()?;
                    i += 2;
                    continue;
                }
                "--scatter-width" => {
                    scatter_width = args[i + 1].parse()?;
                    i += 2;
                    continue;
                }
                _ => {
                    i += 1;
                }
            }
        }

        let bind = bind.ok_or_else(|| anyhow::anyhow!("--bind is required"))?;
        Ok(NodeConfig {
            bind,
            seeds,
            boot_threshold,
            scatter_width,
        })
    }
}

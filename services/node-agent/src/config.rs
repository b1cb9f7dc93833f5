use std::path::PathBuf;

use anyhow::Result;
use skiff_id::NodeId;

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: NodeId,
    pub control_plane_url: String,
    pub data_dir: PathBuf,
    /// Root of per-allocation directories.
    pub alloc_root: PathBuf,
    /// Path of the state database.
    pub state_path: PathBuf,
    /// Device plugin endpoint, if one is configured.
    pub device_plugin_addr: Option<String>,
    /// Suppress the tagged metric emission path.
    pub disable_tagged_metrics: bool,
    /// Emit the legacy dotted-path metrics older dashboards scrape.
    pub backwards_compatible_metrics: bool,
    pub log_level: String,
    /// Agent version recorded in each allocation's immutable state.
    pub version: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let node_id = std::env::var("SKIFF_NODE_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let control_plane_url = std::env::var("SKIFF_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let data_dir = PathBuf::from(
            std::env::var("SKIFF_DATA_DIR").unwrap_or_else(|_| "/var/lib/skiff".to_string()),
        );

        let device_plugin_addr = std::env::var("SKIFF_DEVICE_PLUGIN_ADDR").ok();

        let disable_tagged_metrics = std::env::var("SKIFF_DISABLE_TAGGED_METRICS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        let backwards_compatible_metrics = std::env::var("SKIFF_BACKWARDS_COMPATIBLE_METRICS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        let log_level = std::env::var("SKIFF_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            node_id,
            control_plane_url,
            alloc_root: data_dir.join("allocs"),
            state_path: data_dir.join("state.db"),
            data_dir,
            device_plugin_addr,
            disable_tagged_metrics,
            backwards_compatible_metrics,
            log_level,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}

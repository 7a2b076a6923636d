//! Configuration options.
//!
//! The embedding host is free to define its own command line arguments; the
//! middlebox core takes a separate configuration file with runtime options
//! for the flow table, state pools, timeouts, and rewrite behaviour. The
//! path to the configuration file itself will typically be a command line
//! argument passed to the host application.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> RuntimeConfig {
    let config_str = fs::read_to_string(path).expect("failed to read middlebox config file");
    let config: RuntimeConfig =
        toml::from_str(&config_str).expect("malformed middlebox config file");
    if config.tcp.timeout_ms / config.tcp.tick_period_ms == 0 {
        log::error!("Flow timeout shorter than one tick: {:#?}", config);
        panic!();
    }
    config
}

/// Loads a default configuration.
///
/// For demonstration and testing purposes, not tuned for a deployment:
/// ```toml
/// [flow_table]
///     max_flows = 65536
///
/// [tcp]
///     timeout_ms = 30_000
///
/// [rewrite]
///     allow_resize = true
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Flow table settings.
    #[serde(default)]
    pub flow_table: FlowTableConfig,

    /// Per-flow state pool settings.
    #[serde(default)]
    pub pools: PoolConfig,

    /// Connection timeout settings.
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Reordering settings.
    #[serde(default)]
    pub reorder: ReorderConfig,

    /// Sequence/ack rewriting settings.
    #[serde(default)]
    pub rewrite: RewriteConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            flow_table: FlowTableConfig::default(),
            pools: PoolConfig::default(),
            tcp: TcpConfig::default(),
            reorder: ReorderConfig::default(),
            rewrite: RewriteConfig::default(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Flow table options.
///
/// One table is kept per worker; the host dispatch must guarantee per-flow
/// affinity across workers.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlowTableConfig {
    /// Approximate per-worker flow capacity. Rounded up to a power-of-two
    /// bucket count. Defaults to `65536`.
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,

    /// Buckets visited per expiry scan call, bounding the per-batch garbage
    /// collection work. Defaults to `2048`.
    #[serde(default = "default_scan_buckets")]
    pub scan_buckets: usize,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        FlowTableConfig {
            max_flows: default_max_flows(),
            scan_buckets: default_scan_buckets(),
        }
    }
}

fn default_max_flows() -> usize {
    65_536
}

fn default_scan_buckets() -> usize {
    2048
}

/* --------------------------------------------------------------------------------- */

/// State pool options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of the shared connection block pool. Defaults to `16384`.
    #[serde(default = "default_tcp_common_pool")]
    pub tcp_common: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            tcp_common: default_tcp_common_pool(),
        }
    }
}

fn default_tcp_common_pool() -> usize {
    crate::conn::common::TCP_COMMON_POOL_SIZE
}

/* --------------------------------------------------------------------------------- */

/// Connection timeout options.
///
/// The core runs on a 16-bit wrapping tick clock sampled by the host once
/// per batch; millisecond values are converted using `tick_period_ms`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TcpConfig {
    /// Soft flow timeout armed at SYN and refreshed per packet (in
    /// milliseconds). Defaults to `30_000`.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: usize,

    /// Duration of one expiration clock tick (in milliseconds). Defaults to
    /// `100`.
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            timeout_ms: default_timeout_ms(),
            tick_period_ms: default_tick_period_ms(),
        }
    }
}

impl TcpConfig {
    /// Flow timeout in clock ticks.
    pub(crate) fn timeout_ticks(&self) -> u16 {
        (self.timeout_ms / self.tick_period_ms).max(1) as u16
    }
}

fn default_timeout_ms() -> usize {
    30_000
}

fn default_tick_period_ms() -> usize {
    100
}

/* --------------------------------------------------------------------------------- */

/// Reordering options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReorderConfig {
    /// Hold out-of-order segments until the sequence hole fills. When
    /// disabled, segments pass through in arrival order. Defaults to `true`.
    #[serde(default = "default_reorder_enabled")]
    pub enabled: bool,

    /// Maximum held out-of-order segments per flow direction. Defaults to
    /// `100`.
    #[serde(default = "default_max_out_of_order")]
    pub max_out_of_order: usize,

    /// Craft a duplicate ACK toward the sender when a sequence gap opens,
    /// accelerating fast retransmit. Defaults to `false`.
    #[serde(default = "default_proactive_dup_ack")]
    pub proactive_dup_ack: bool,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        ReorderConfig {
            enabled: default_reorder_enabled(),
            max_out_of_order: default_max_out_of_order(),
            proactive_dup_ack: default_proactive_dup_ack(),
        }
    }
}

fn default_reorder_enabled() -> bool {
    true
}

fn default_max_out_of_order() -> usize {
    100
}

fn default_proactive_dup_ack() -> bool {
    false
}

/* --------------------------------------------------------------------------------- */

/// Rewrite options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RewriteConfig {
    /// Allow downstream elements to resize payloads. Enables sequence/ack
    /// rewriting on egress and SACK-permitted stripping on SYNs. Defaults to
    /// `true`.
    #[serde(default = "default_allow_resize")]
    pub allow_resize: bool,

    /// Recompute TCP checksums in software on egress. Disable when the NIC
    /// offloads transmit checksums. Defaults to `true`.
    #[serde(default = "default_software_checksum")]
    pub software_checksum: bool,

    /// Verify TCP checksums on ingress; failures are dropped silently.
    /// Defaults to `false` (the IP layer is expected to have checked).
    #[serde(default = "default_verify_checksum")]
    pub verify_checksum: bool,

    /// Answer a retransmission whose data the opposite endpoint already
    /// acknowledged with a crafted ACK instead of a replay. Defaults to
    /// `true`.
    #[serde(default = "default_reack_on_retransmit")]
    pub reack_on_retransmit: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        RewriteConfig {
            allow_resize: default_allow_resize(),
            software_checksum: default_software_checksum(),
            verify_checksum: default_verify_checksum(),
            reack_on_retransmit: default_reack_on_retransmit(),
        }
    }
}

fn default_allow_resize() -> bool {
    true
}

fn default_software_checksum() -> bool {
    true
}

fn default_verify_checksum() -> bool {
    false
}

fn default_reack_on_retransmit() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_config_defaults_from_empty_toml() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.flow_table.max_flows, 65_536);
        assert_eq!(config.tcp.timeout_ms, 30_000);
        assert_eq!(config.tcp.timeout_ticks(), 300);
        assert!(config.rewrite.allow_resize);
        assert!(!config.reorder.proactive_dup_ack);
    }

    #[test]
    fn core_config_partial_override() {
        let toml_str = r#"
            [reorder]
            max_out_of_order = 16
            proactive_dup_ack = true

            [rewrite]
            allow_resize = false
        "#;
        let config: RuntimeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.reorder.max_out_of_order, 16);
        assert!(config.reorder.proactive_dup_ack);
        assert!(!config.rewrite.allow_resize);
        // Untouched sections keep their defaults.
        assert_eq!(config.pools.tcp_common, 16_384);
    }
}

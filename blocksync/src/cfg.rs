use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Configuration for the `blocksync-sim` binary: the engine itself plus the simulated network it runs against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        self.simulation.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// How many blocks past the anchor to request headers for. Defaults to 192.
    #[serde(default = "forward_window_default")]
    pub forward_window: u64,
    /// How many blocks behind the anchor to re-request, to ride out reorganisations near the tip. Defaults to 128.
    #[serde(default = "backward_overlap_default")]
    pub backward_overlap: u64,
    /// How many distinct peers to ask for headers in a single dispatch. Defaults to 3.
    #[serde(default = "max_header_peers_default")]
    pub max_header_peers: usize,
    /// Assembled blocks awaiting import above which body responses are dropped. Defaults to 2000.
    #[serde(default = "max_queued_blocks_default")]
    pub max_queued_blocks: usize,
    /// A body request older than this is considered abandoned and may be re-sent. Defaults to 5 seconds.
    #[serde(default = "body_request_timeout_default")]
    pub body_request_timeout: Duration,
    /// The number of recently handled block hashes to remember. Defaults to 1024.
    #[serde(default = "dedup_capacity_default")]
    pub dedup_capacity: usize,
    /// How long the import worker collects a batch for. Defaults to 10 milliseconds.
    #[serde(default = "import_batch_window_default")]
    pub import_batch_window: Duration,
    /// How long the import worker backs off when there was nothing to import. Defaults to 1 second.
    #[serde(default = "import_idle_backoff_default")]
    pub import_idle_backoff: Duration,
    /// Delay before the first peer status broadcast. Defaults to 1 second.
    #[serde(default = "status_initial_delay_default")]
    pub status_initial_delay: Duration,
    /// Interval between peer status broadcasts. Defaults to 2 seconds.
    #[serde(default = "status_interval_default")]
    pub status_interval: Duration,
    /// Whether to periodically log a sync status line.
    #[serde(default)]
    pub show_status: bool,
    /// Interval between sync status lines, when `show_status` is set. Defaults to 5 seconds.
    #[serde(default = "status_report_interval_default")]
    pub status_report_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            forward_window: forward_window_default(),
            backward_overlap: backward_overlap_default(),
            max_header_peers: max_header_peers_default(),
            max_queued_blocks: max_queued_blocks_default(),
            body_request_timeout: body_request_timeout_default(),
            dedup_capacity: dedup_capacity_default(),
            import_batch_window: import_batch_window_default(),
            import_idle_backoff: import_idle_backoff_default(),
            status_initial_delay: status_initial_delay_default(),
            status_interval: status_interval_default(),
            show_status: false,
            status_report_interval: status_report_interval_default(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.forward_window == 0 {
            return Err(anyhow!("forward_window must be non-zero"));
        }
        if self.max_header_peers == 0 {
            return Err(anyhow!("max_header_peers must be non-zero"));
        }
        if self.max_queued_blocks == 0 {
            return Err(anyhow!("max_queued_blocks must be non-zero"));
        }
        if self.dedup_capacity == 0 {
            return Err(anyhow!("dedup_capacity must be non-zero"));
        }
        if self.import_batch_window.is_zero() {
            return Err(anyhow!("import_batch_window must be non-zero"));
        }
        // `tokio::time::interval` panics on a zero period.
        if self.status_interval.is_zero() || self.status_report_interval.is_zero() {
            return Err(anyhow!(
                "status_interval and status_report_interval must be non-zero"
            ));
        }
        Ok(())
    }
}

pub fn forward_window_default() -> u64 {
    192
}

pub fn backward_overlap_default() -> u64 {
    128
}

pub fn max_header_peers_default() -> usize {
    3
}

pub fn max_queued_blocks_default() -> usize {
    2000
}

pub fn body_request_timeout_default() -> Duration {
    Duration::from_secs(5)
}

pub fn dedup_capacity_default() -> usize {
    1024
}

pub fn import_batch_window_default() -> Duration {
    Duration::from_millis(10)
}

pub fn import_idle_backoff_default() -> Duration {
    Duration::from_secs(1)
}

pub fn status_initial_delay_default() -> Duration {
    Duration::from_secs(1)
}

pub fn status_interval_default() -> Duration {
    Duration::from_secs(2)
}

pub fn status_report_interval_default() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// Length of the canonical chain the peers serve, excluding genesis. Defaults to 1000.
    #[serde(default = "chain_length_default")]
    pub chain_length: u64,
    /// Number of honest peers. Defaults to 4.
    #[serde(default = "peers_default")]
    pub peers: usize,
    /// Number of peers which drop about half of their responses.
    #[serde(default)]
    pub unreliable_peers: usize,
    /// Number of peers which serve headers with a broken seal.
    #[serde(default)]
    pub lying_peers: usize,
    /// How much of the canonical chain the local node already has.
    #[serde(default)]
    pub local_length: u64,
    /// Seed for chain generation and peer behaviour.
    #[serde(default)]
    pub seed: u64,
    /// Simulated one-way network latency. Defaults to 20 milliseconds.
    #[serde(default = "response_delay_default")]
    pub response_delay: Duration,
    /// How often the simulated network produces a new block. Defaults to 5 seconds.
    #[serde(default = "block_interval_default")]
    pub block_interval: Duration,
    /// Give up after this long. Defaults to 60 seconds.
    #[serde(default = "run_for_default")]
    pub run_for: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            chain_length: chain_length_default(),
            peers: peers_default(),
            unreliable_peers: 0,
            lying_peers: 0,
            local_length: 0,
            seed: 0,
            response_delay: response_delay_default(),
            block_interval: block_interval_default(),
            run_for: run_for_default(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.peers + self.unreliable_peers + self.lying_peers == 0 {
            return Err(anyhow!("the simulation needs at least one peer"));
        }
        if self.block_interval.is_zero() {
            return Err(anyhow!("block_interval must be non-zero"));
        }
        if self.local_length > self.chain_length {
            return Err(anyhow!(
                "local_length ({}) exceeds chain_length ({})",
                self.local_length,
                self.chain_length
            ));
        }
        Ok(())
    }
}

pub fn chain_length_default() -> u64 {
    1000
}

pub fn peers_default() -> usize {
    4
}

pub fn response_delay_default() -> Duration {
    Duration::from_millis(20)
}

pub fn block_interval_default() -> Duration {
    Duration::from_secs(5)
}

pub fn run_for_default() -> Duration {
    Duration::from_secs(60)
}

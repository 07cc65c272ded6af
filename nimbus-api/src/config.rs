//! Orchestrator configuration.
//!
//! Loaded from a TOML file with serde defaults for every section, so a
//! missing file or a partial file still yields a runnable configuration.
//! The scheduling section carries a version derived from its contents;
//! nodes echo the version in heartbeats and receive the current config
//! when it differs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

use crate::model::QualityTier;

// =============================================================================
// Scheduling
// =============================================================================

/// Requirements and pricing for one quality tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierRequirement {
    /// Minimum per-core benchmark a node must reach for this tier.
    pub minimum_benchmark: f64,
    /// Multiplier applied to raw compute points before scheduling math.
    pub cpu_overcommit_ratio: f64,
    pub memory_overcommit_ratio: f64,
    pub storage_overcommit_ratio: f64,
    pub price_multiplier: f64,
    pub description: String,
}

/// Scoring weights. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub capacity: f64,
    pub load: f64,
    pub reputation: f64,
    pub locality: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            capacity: 0.4,
            load: 0.2,
            reputation: 0.2,
            locality: 0.2,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.capacity + self.load + self.reputation + self.locality
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Denominator for all tier math.
    pub baseline_benchmark: f64,
    /// Cap on a node's benchmark relative to the baseline.
    pub max_performance_multiplier: f64,
    pub tiers: BTreeMap<QualityTier, TierRequirement>,
    /// Projected-utilization ceiling after placement, in percent.
    pub max_utilization_percent: f64,
    pub max_load_average: f64,
    pub min_free_memory_mb: u64,
    pub weights: ScoreWeights,
    pub price_per_point_hour: f64,
    /// Derived from the section contents when left empty.
    pub version: String,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        let mut tiers = BTreeMap::new();
        tiers.insert(
            QualityTier::Guaranteed,
            TierRequirement {
                minimum_benchmark: 3000.0,
                cpu_overcommit_ratio: 1.0,
                memory_overcommit_ratio: 1.0,
                storage_overcommit_ratio: 1.0,
                price_multiplier: 2.0,
                description: "Dedicated cores, no overcommit".to_string(),
            },
        );
        tiers.insert(
            QualityTier::Standard,
            TierRequirement {
                minimum_benchmark: 1500.0,
                cpu_overcommit_ratio: 2.0,
                memory_overcommit_ratio: 1.0,
                storage_overcommit_ratio: 1.0,
                price_multiplier: 1.0,
                description: "General purpose".to_string(),
            },
        );
        tiers.insert(
            QualityTier::Balanced,
            TierRequirement {
                minimum_benchmark: 1000.0,
                cpu_overcommit_ratio: 3.0,
                memory_overcommit_ratio: 1.2,
                storage_overcommit_ratio: 1.0,
                price_multiplier: 0.75,
                description: "Cost/performance balance".to_string(),
            },
        );
        tiers.insert(
            QualityTier::Burstable,
            TierRequirement {
                minimum_benchmark: 500.0,
                cpu_overcommit_ratio: 4.0,
                memory_overcommit_ratio: 1.5,
                storage_overcommit_ratio: 1.2,
                price_multiplier: 0.5,
                description: "Best effort".to_string(),
            },
        );
        Self {
            baseline_benchmark: 1000.0,
            max_performance_multiplier: 4.0,
            tiers,
            max_utilization_percent: 90.0,
            max_load_average: 16.0,
            min_free_memory_mb: 512,
            weights: ScoreWeights::default(),
            price_per_point_hour: 0.02,
            version: String::new(),
        }
    }
}

impl SchedulingConfig {
    pub fn tier(&self, tier: QualityTier) -> Option<&TierRequirement> {
        self.tiers.get(&tier)
    }

    /// Compute points one vCPU of this tier costs.
    pub fn required_points_per_vcpu(&self, tier: QualityTier) -> f64 {
        self.tier(tier)
            .map(|t| t.minimum_benchmark / self.baseline_benchmark)
            .unwrap_or(0.0)
    }

    /// Compute-point cost of a VM spec in this tier.
    pub fn vm_point_cost(&self, tier: QualityTier, cpu_cores: u32) -> f64 {
        cpu_cores as f64 * self.required_points_per_vcpu(tier)
    }

    /// Tiers in descending minimum-benchmark order.
    pub fn tiers_descending(&self) -> Vec<(QualityTier, &TierRequirement)> {
        let mut tiers: Vec<_> = self.tiers.iter().map(|(t, r)| (*t, r)).collect();
        tiers.sort_by(|a, b| {
            b.1.minimum_benchmark
                .partial_cmp(&a.1.minimum_benchmark)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        tiers
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.baseline_benchmark <= 0.0 {
            return Err("baseline_benchmark must be positive".to_string());
        }
        if self.max_performance_multiplier < 1.0 {
            return Err("max_performance_multiplier must be >= 1".to_string());
        }
        if self.tiers.is_empty() {
            return Err("at least one tier must be configured".to_string());
        }
        let sum = self.weights.sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!("score weights must sum to 1, got {}", sum));
        }
        Ok(())
    }

    /// Derive the config version from the section contents.
    fn computed_version(&self) -> String {
        let mut probe = self.clone();
        probe.version = String::new();
        let bytes = serde_json::to_vec(&probe).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        hex::encode(&digest[..6])
    }
}

// =============================================================================
// Watchdog / sync / JWT / ports
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Expected heartbeat cadence, handed to agents at registration.
    pub heartbeat_interval_secs: u64,
    pub heartbeat_grace_secs: u64,
    /// A node silent for this long is marked offline.
    pub offline_after_secs: u64,
    pub check_interval_secs: u64,
    /// Registry entries older than this are swept as orphaned.
    pub stale_command_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            heartbeat_grace_secs: 5,
            offline_after_secs: 120,
            check_interval_secs: 30,
            stale_command_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub key: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_days: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            key: "change-me-in-production".to_string(),
            issuer: "nimbus-orchestrator".to_string(),
            audience: "nimbus-node".to_string(),
            ttl_days: 3650,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Cadence of the write-behind flush to the document store.
    pub sync_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortAllocationConfig {
    pub ack_poll_interval_ms: u64,
    pub ack_poll_attempts: u32,
}

impl Default for PortAllocationConfig {
    fn default() -> Self {
        Self {
            ack_poll_interval_ms: 500,
            ack_poll_attempts: 60,
        }
    }
}

// =============================================================================
// Top level
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scheduling: SchedulingConfig,
    pub watchdog: WatchdogConfig,
    pub jwt: JwtConfig,
    pub sync: SyncConfig,
    pub ports: PortAllocationConfig,
    /// Image id to download URL.
    pub images: BTreeMap<String, String>,
    pub dht_bootstrap_peers: Vec<String>,
}

impl OrchestratorConfig {
    /// Load from a TOML file, falling back to defaults for anything the
    /// file does not set.
    pub async fn load(path: &Path) -> Result<Self, String> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("reading {}: {}", path.display(), e))?;
        let mut config: OrchestratorConfig =
            toml::from_str(&raw).map_err(|e| format!("parsing {}: {}", path.display(), e))?;
        config.finalize()?;
        Ok(config)
    }

    /// Fill derived fields and validate. Also used for the built-in
    /// default configuration.
    pub fn finalize(&mut self) -> Result<(), String> {
        if self.images.is_empty() {
            self.images.insert(
                "ubuntu-24.04".to_string(),
                "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img"
                    .to_string(),
            );
            self.images.insert(
                "debian-12".to_string(),
                "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-genericcloud-amd64.qcow2"
                    .to_string(),
            );
        }
        if self.scheduling.version.is_empty() {
            self.scheduling.version = self.scheduling.computed_version();
        }
        self.scheduling.validate()
    }

    pub fn image_url(&self, image_id: &str) -> Option<&str> {
        self.images.get(image_id).map(|s| s.as_str())
    }
}

//! VM scheduler - selects nodes for VM placement.
//!
//! Candidates pass hard filters (online, tier eligibility, architecture,
//! load, free memory), a tier-adjusted capacity check, and a projected
//! utilization ceiling, then are scored on capacity, load, reputation and
//! locality. Weights come from the scheduling config and sum to 1.

use std::sync::Arc;

use crate::config::{OrchestratorConfig, TierRequirement};
use crate::model::{Node, QualityTier, ResourceCapacity};

/// What a VM needs from a node.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub tier: QualityTier,
    pub preferred_region: Option<String>,
    pub preferred_zone: Option<String>,
    pub required_arch: Option<String>,
    pub gpu_passthrough: bool,
}

/// One candidate annotated with per-dimension scores, or the reason it
/// was rejected.
#[derive(Debug, Clone)]
pub struct NodeScore {
    pub node_id: String,
    pub total: f64,
    pub capacity: f64,
    pub load: f64,
    pub reputation: f64,
    pub locality: f64,
    pub rejection_reason: Option<String>,
}

impl NodeScore {
    fn rejected(node_id: &str, reason: String) -> Self {
        Self {
            node_id: node_id.to_string(),
            total: 0.0,
            capacity: 0.0,
            load: 0.0,
            reputation: 0.0,
            locality: 0.0,
            rejection_reason: Some(reason),
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.rejection_reason.is_none()
    }
}

/// Normalize architecture aliases to a canonical tag.
pub fn normalize_arch(arch: &str) -> &'static str {
    match arch.to_lowercase().as_str() {
        "x86_64" | "amd64" | "x64" => "x86_64",
        "aarch64" | "arm64" => "aarch64",
        "i686" | "i386" | "x86" => "i686",
        "armv7l" | "armv7" | "arm" => "armv7l",
        _ => "unknown",
    }
}

/// Scheduler for VM placement decisions.
pub struct Scheduler {
    config: Arc<OrchestratorConfig>,
}

impl Scheduler {
    pub fn new(config: Arc<OrchestratorConfig>) -> Self {
        Self { config }
    }

    /// Tier-adjusted capacity of a node: raw capacity multiplied by the
    /// tier's overcommit ratios, points floored to whole units.
    pub fn tier_capacity(node: &Node, requirement: &TierRequirement) -> ResourceCapacity {
        ResourceCapacity {
            compute_points: (node.total.compute_points * requirement.cpu_overcommit_ratio).floor(),
            memory_bytes: (node.total.memory_bytes as f64 * requirement.memory_overcommit_ratio)
                as u64,
            storage_bytes: (node.total.storage_bytes as f64
                * requirement.storage_overcommit_ratio) as u64,
        }
    }

    /// Compute-point cost of the request in its tier.
    pub fn point_cost(&self, request: &PlacementRequest) -> f64 {
        self.config
            .scheduling
            .vm_point_cost(request.tier, request.cpu_cores)
    }

    /// Score all candidates, annotating rejections.
    pub fn score_nodes(&self, nodes: &[Node], request: &PlacementRequest) -> Vec<NodeScore> {
        nodes.iter().map(|n| self.score_node(n, request)).collect()
    }

    /// Select the eligible candidate with the highest weighted score.
    /// Ties break toward the smaller node id for determinism.
    pub fn select_best_node(&self, nodes: &[Node], request: &PlacementRequest) -> Option<Node> {
        let mut best: Option<(NodeScore, &Node)> = None;
        for node in nodes {
            let score = self.score_node(node, request);
            if !score.is_eligible() {
                continue;
            }
            let replace = match &best {
                None => true,
                Some((current, _)) => {
                    score.total > current.total + 1e-9
                        || ((score.total - current.total).abs() <= 1e-9
                            && score.node_id < current.node_id)
                }
            };
            if replace {
                best = Some((score, node));
            }
        }
        best.map(|(_, node)| node.clone())
    }

    fn score_node(&self, node: &Node, request: &PlacementRequest) -> NodeScore {
        let scheduling = &self.config.scheduling;

        // Hard filters
        if !node.is_online() {
            return NodeScore::rejected(&node.id, format!("node is {:?}", node.status));
        }
        let Some(evaluation) = &node.evaluation else {
            return NodeScore::rejected(&node.id, "no performance evaluation".to_string());
        };
        if !evaluation.supports_tier(request.tier) {
            return NodeScore::rejected(
                &node.id,
                format!("tier {} not supported", request.tier),
            );
        }
        if let Some(required) = &request.required_arch {
            if normalize_arch(required) != normalize_arch(&node.architecture) {
                return NodeScore::rejected(
                    &node.id,
                    format!(
                        "architecture {} does not match required {}",
                        node.architecture, required
                    ),
                );
            }
        }
        if let Some(metrics) = &node.metrics {
            if metrics.load_average > scheduling.max_load_average {
                return NodeScore::rejected(
                    &node.id,
                    format!(
                        "load average {:.1} exceeds limit {:.1}",
                        metrics.load_average, scheduling.max_load_average
                    ),
                );
            }
        }
        let free_memory_mb = node
            .metrics
            .as_ref()
            .map(|m| m.memory_free_mb)
            .unwrap_or_else(|| node.free().memory_bytes / (1024 * 1024));
        if free_memory_mb < scheduling.min_free_memory_mb {
            return NodeScore::rejected(
                &node.id,
                format!(
                    "free memory {}MB below minimum {}MB",
                    free_memory_mb, scheduling.min_free_memory_mb
                ),
            );
        }
        if request.gpu_passthrough && !node.hardware.gpus.iter().any(|g| g.available) {
            return NodeScore::rejected(&node.id, "no available GPU".to_string());
        }

        // Capacity check with overcommit
        let Some(requirement) = scheduling.tier(request.tier) else {
            return NodeScore::rejected(
                &node.id,
                format!("tier {} not configured", request.tier),
            );
        };
        let tier_cap = Self::tier_capacity(node, requirement);
        let cost = ResourceCapacity {
            compute_points: self.point_cost(request),
            memory_bytes: request.memory_bytes,
            storage_bytes: request.disk_bytes,
        };
        if !tier_cap.can_accommodate(&node.reserved, &cost) {
            return NodeScore::rejected(
                &node.id,
                format!("insufficient {} capacity", request.tier),
            );
        }

        // Projected utilization ceiling
        let projected_cpu = if tier_cap.compute_points > 0.0 {
            (node.reserved.compute_points + cost.compute_points) / tier_cap.compute_points * 100.0
        } else {
            100.0
        };
        let projected_memory = if tier_cap.memory_bytes > 0 {
            (node.reserved.memory_bytes + cost.memory_bytes) as f64 / tier_cap.memory_bytes as f64
                * 100.0
        } else {
            100.0
        };
        if projected_cpu > scheduling.max_utilization_percent
            || projected_memory > scheduling.max_utilization_percent
        {
            return NodeScore::rejected(
                &node.id,
                format!(
                    "projected utilization {:.0}%/{:.0}% exceeds ceiling {:.0}%",
                    projected_cpu, projected_memory, scheduling.max_utilization_percent
                ),
            );
        }

        // Scoring
        let capacity = ((tier_cap.compute_points
            - node.reserved.compute_points
            - cost.compute_points)
            / tier_cap.compute_points)
            .clamp(0.0, 1.0);

        let load = match &node.metrics {
            Some(metrics) => (1.0 - metrics.load_average / 16.0).max(0.0),
            None => 0.5,
        };

        let success_ratio = if node.reputation.total_vms_hosted == 0 {
            0.5
        } else {
            node.reputation.successful_completions as f64
                / node.reputation.total_vms_hosted.max(1) as f64
        };
        let reputation = 0.7 * (node.reputation.uptime_percent / 100.0) + 0.3 * success_ratio;

        let locality = Self::locality_score(node, request);

        let weights = &scheduling.weights;
        let total = weights.capacity * capacity
            + weights.load * load
            + weights.reputation * reputation
            + weights.locality * locality;

        NodeScore {
            node_id: node.id.clone(),
            total,
            capacity,
            load,
            reputation,
            locality,
            rejection_reason: None,
        }
    }

    fn locality_score(node: &Node, request: &PlacementRequest) -> f64 {
        if request.preferred_region.is_none() && request.preferred_zone.is_none() {
            return 0.5;
        }
        let region_matches = match &request.preferred_region {
            Some(region) => node.region.as_deref() == Some(region.as_str()),
            None => true,
        };
        let zone_matches = match &request.preferred_zone {
            Some(zone) => node.zone.as_deref() == Some(zone.as_str()),
            None => true,
        };
        if region_matches && zone_matches {
            1.0
        } else if request.preferred_region.is_some() && region_matches {
            0.7
        } else {
            0.0
        }
    }
}

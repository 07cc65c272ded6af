//! Node performance evaluation.
//!
//! Classifies a node's benchmark against the baseline and computes which
//! quality tiers it may serve. `points_per_core` is the single source of
//! truth for all downstream capacity math. Evaluation depends only on the
//! hardware inventory and the scheduling-config version, both recorded on
//! the result.

use chrono::Utc;

use crate::config::SchedulingConfig;
use crate::model::{
    HardwareInventory, NodePerformanceEvaluation, PerformanceClass, ResourceCapacity,
    TierCapability,
};

pub struct PerformanceEvaluator;

impl PerformanceEvaluator {
    /// Evaluate a hardware inventory against the scheduling config.
    pub fn evaluate(
        hardware: &HardwareInventory,
        config: &SchedulingConfig,
    ) -> NodePerformanceEvaluation {
        let benchmark = hardware.cpu.benchmark_score;
        let cap = config.max_performance_multiplier * config.baseline_benchmark;
        let capped = benchmark.min(cap);
        let points_per_core = capped / config.baseline_benchmark;

        let mut capabilities = Vec::new();
        let mut eligible_tiers = Vec::new();
        let mut highest_tier = None;

        for (tier, requirement) in config.tiers_descending() {
            let required_points_per_vcpu = requirement.minimum_benchmark / config.baseline_benchmark;
            let eligible = points_per_core >= required_points_per_vcpu;
            let capability = TierCapability {
                tier,
                eligible,
                required_points_per_vcpu,
                max_vcpus_per_core: if eligible {
                    (points_per_core / required_points_per_vcpu).floor() as u32
                } else {
                    0
                },
                price_multiplier: requirement.price_multiplier,
                ineligibility_reason: if eligible {
                    None
                } else {
                    Some(format!(
                        "requires {:.2} points per vCPU, node has {:.2} per core",
                        required_points_per_vcpu, points_per_core
                    ))
                },
            };
            if eligible {
                if highest_tier.is_none() {
                    highest_tier = Some(tier);
                }
                eligible_tiers.push(tier);
            }
            capabilities.push(capability);
        }

        let rejection_reason = if eligible_tiers.is_empty() {
            let floor = config
                .tiers_descending()
                .last()
                .map(|(_, r)| r.minimum_benchmark)
                .unwrap_or(0.0);
            Some(format!(
                "benchmark {:.0} is below the minimum {:.0} required for any tier",
                capped, floor
            ))
        } else {
            None
        };

        NodePerformanceEvaluation {
            benchmark_score: benchmark,
            capped_score: capped,
            points_per_core,
            performance_class: Self::classify(points_per_core, config),
            eligible_tiers,
            highest_tier,
            tier_capabilities: capabilities,
            rejection_reason,
            config_version: config.version.clone(),
            evaluated_at: Utc::now(),
        }
    }

    /// Compute a node's total capacity from its evaluation.
    pub fn total_capacity(
        evaluation: &NodePerformanceEvaluation,
        hardware: &HardwareInventory,
    ) -> ResourceCapacity {
        ResourceCapacity {
            compute_points: evaluation.points_per_core * hardware.cpu.physical_cores as f64,
            memory_bytes: hardware.memory_bytes,
            storage_bytes: hardware.total_storage_bytes(),
        }
    }

    /// Derive the class by comparing points-per-core to the consecutive
    /// tier thresholds, highest first.
    fn classify(points_per_core: f64, config: &SchedulingConfig) -> Option<PerformanceClass> {
        let classes = [
            PerformanceClass::Premium,
            PerformanceClass::Enhanced,
            PerformanceClass::Standard,
            PerformanceClass::Basic,
        ];
        for (i, (_, requirement)) in config.tiers_descending().iter().enumerate() {
            let threshold = requirement.minimum_benchmark / config.baseline_benchmark;
            if points_per_core >= threshold {
                return Some(*classes.get(i).unwrap_or(&PerformanceClass::Basic));
            }
        }
        None
    }
}

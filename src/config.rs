//! Immutable scheduler configuration, passed once at init (spec.md §6).
//!
//! Built with the same `Config::default().with_*(...)` chain style as
//! `knhk_autonomic::types::Config`.

use std::time::Duration;

/// Primary cost axis for the routing/placement objective (spec.md §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Objective {
    MinimizeLatency,
    MinimizePower,
    MinimizeCost,
    MaximizeThroughput,
    Balanced,
}

/// Weights for the `Balanced` objective; must sum to 1.0.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Weights {
    pub alpha: f32, // latency
    pub beta: f32,  // power
    pub gamma: f32, // cost
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            alpha: 0.34,
            beta: 0.33,
            gamma: 0.33,
        }
    }
}

/// Routing algorithm selector (spec.md §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Algorithm {
    Dijkstra,
    AStar,
    Greedy,
}

/// KV cache eviction policy (spec.md §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
    CostAware,
}

/// Cache coherency protocol (spec.md §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Coherency {
    None,
    Mesi,
    Strong,
}

/// Hard safety floors enforced by the thermal model's safety gate.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SafetyLimits {
    pub max_temp_c: f32,
    pub max_humidity_pct: f32,
    pub min_airflow_cfm: f32,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_temp_c: 90.0,
            max_humidity_pct: 60.0,
            min_airflow_cfm: 50.0,
        }
    }
}

/// Load-balancing migration threshold (spec.md §6, §8 property 8).
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LoadBalance {
    /// Maximum acceptable utilization standard deviation before migration.
    pub threshold: f32,
}

impl Default for LoadBalance {
    fn default() -> Self {
        Self { threshold: 15.0 }
    }
}

/// Immutable scheduler configuration (spec.md §6).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    pub objective: Objective,
    pub weights: Weights,
    pub algorithm: Algorithm,
    pub eviction_policy: EvictionPolicy,
    pub coherency: Coherency,
    pub replication_factor: u32,
    pub cache_hit_value: f32,
    pub safety: SafetyLimits,
    #[serde(with = "duration_secs")]
    pub control_interval: Duration,
    pub max_retries: u32,
    pub load_balance: LoadBalance,
    pub max_devices: usize,
    pub max_tasks: usize,
    pub precool_threshold_c: f32,
    #[serde(with = "duration_secs")]
    pub precool_duration: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            objective: Objective::Balanced,
            weights: Weights::default(),
            algorithm: Algorithm::Dijkstra,
            eviction_policy: EvictionPolicy::CostAware,
            coherency: Coherency::Mesi,
            replication_factor: 1,
            cache_hit_value: 1000.0,
            safety: SafetyLimits::default(),
            control_interval: Duration::from_secs(60),
            max_retries: 3,
            load_balance: LoadBalance::default(),
            max_devices: 256,
            max_tasks: 4096,
            precool_threshold_c: 70.0,
            precool_duration: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn with_objective(mut self, objective: Objective) -> Self {
        self.objective = objective;
        self
    }

    pub fn with_weights(mut self, weights: Weights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_coherency(mut self, coherency: Coherency) -> Self {
        self.coherency = coherency;
        self
    }

    pub fn with_replication_factor(mut self, factor: u32) -> Self {
        self.replication_factor = factor.max(1);
        self
    }

    pub fn with_cache_hit_value(mut self, value: f32) -> Self {
        self.cache_hit_value = value;
        self
    }

    pub fn with_safety(mut self, safety: SafetyLimits) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_control_interval(mut self, interval: Duration) -> Self {
        self.control_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_load_balance_threshold(mut self, threshold: f32) -> Self {
        self.load_balance.threshold = threshold;
        self
    }

    pub fn with_max_devices(mut self, max: usize) -> Self {
        self.max_devices = max;
        self
    }

    pub fn with_max_tasks(mut self, max: usize) -> Self {
        self.max_tasks = max;
        self
    }

    /// Validate that `weights` sum to 1.0 within epsilon. The original
    /// `scheduler_config` struct has no such check; a misconfigured weight
    /// vector would silently produce a meaningless balanced score, so this
    /// crate validates it explicitly (see SPEC_FULL.md §4.9).
    pub fn validate(&self) -> crate::error::Result<()> {
        let sum = self.weights.alpha + self.weights.beta + self.weights.gamma;
        if (sum - 1.0).abs() > 1e-3 {
            return Err(crate::error::LightrailError::Config(format!(
                "weights must sum to 1.0, got {sum}"
            )));
        }
        if self.replication_factor == 0 {
            return Err(crate::error::LightrailError::Config(
                "replication_factor must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

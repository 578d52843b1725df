//! Thermal-aware optimal scheduler and distributed KV cache coordinator for
//! heterogeneous AI accelerator fleets.
//!
//! Three subsystems, one facade:
//!
//! - [`routing`]: Dijkstra-based shortest-path placement over the device
//!   link graph with configurable multi-objective edge weights.
//! - [`thermal`]: threshold-banded thermal governor with predictive cooling
//!   and a hard safety gate the scheduler can never bypass.
//! - [`cache`]: sharded KV block cache with MESI coherency, pluggable
//!   eviction, prefix sharing, and replication.
//!
//! [`device`] and [`scheduler`] glue the three together; [`control`] drives
//! the fleet's observe/decide/apply/publish cycle. [`LightrailCore`] is the
//! single type external callers hold.

pub mod cache;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod routing;
pub mod scheduler;
pub mod thermal;

use std::sync::Arc;

use device::{Device, DeviceHandle, DeviceRegistry};

pub use config::Config;
pub use error::{LightrailError, Result};

/// The facade external callers hold: registry, routing, cache, thermal, and
/// scheduler wired together per the configured [`Config`].
pub struct LightrailCore {
    config: Config,
    pub registry: Arc<DeviceRegistry>,
    pub routing: Arc<routing::RoutingEngine>,
    pub cache: Arc<cache::KvCacheCoordinator>,
    pub thermal: Arc<thermal::ThermalModel>,
    pub scheduler: Arc<scheduler::SchedulerCore>,
    pub control: control::ControlLoop,
}

impl LightrailCore {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(DeviceRegistry::new(config.max_devices));
        let routing = Arc::new(routing::RoutingEngine::new());
        let cache = Arc::new(cache::KvCacheCoordinator::new(
            u64::MAX,
            config.eviction_policy,
            config.coherency,
            config.replication_factor,
        ));
        let thermal = Arc::new(thermal::ThermalModel::new(config.safety));
        let scheduler = Arc::new(scheduler::SchedulerCore::new(
            config.clone(),
            registry.clone(),
            routing.clone(),
            cache.clone(),
            thermal.clone(),
        ));
        let control = control::ControlLoop::new(
            registry.clone(),
            scheduler.clone(),
            thermal.clone(),
            cache.clone(),
            config.control_interval,
        );

        Ok(Self { config, registry, routing, cache, thermal, scheduler, control })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a device with both the device registry and the thermal
    /// model, keeping the two in sync (spec.md §4.1, §4.4).
    pub fn register_device(&self, device: Device) -> Result<DeviceHandle> {
        let initial_temp = device.live.temperature_c;
        let handle = self.registry.register_device(device)?;
        self.thermal.register_device(handle, initial_temp);
        Ok(handle)
    }

    /// Deregisters a device, blocking until its in-flight jobs drain (reach a
    /// terminal state) or `drain_deadline` elapses, whichever comes first
    /// (spec.md §4.1, §6 drain semantics). Jobs still running when the
    /// deadline fires are force-failed so the device can be removed anyway;
    /// in that case this returns `Err(RegistryError::HasActiveJobs)` even
    /// though the device was, in fact, removed.
    pub fn deregister_device(&self, handle: DeviceHandle, drain_deadline: std::time::Duration) -> Result<()> {
        let start = std::time::Instant::now();
        let mut forced = false;
        loop {
            let active = self.scheduler.jobs_on(handle);
            if active.is_empty() {
                break;
            }
            if start.elapsed() >= drain_deadline {
                for job in active {
                    let _ = self.scheduler.force_fail(job.id);
                }
                forced = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10).min(drain_deadline));
        }

        self.registry.deregister(handle)?;
        self.thermal.deregister_device(handle);

        if forced {
            return Err(error::RegistryError::HasActiveJobs(handle).into());
        }
        Ok(())
    }
}

pub mod prelude {
    pub use crate::cache::{BlockId, BlockState, CacheBlock, KvCacheCoordinator, Sequence, SequenceId};
    pub use crate::config::{Algorithm, Coherency, Config, EvictionPolicy, Objective, SafetyLimits, Weights};
    pub use crate::control::{ControlLoop, Snapshot};
    pub use crate::device::{Device, DeviceHandle, DeviceRegistry, DeviceType, Link, LiveState};
    pub use crate::error::{LightrailError, Result};
    pub use crate::routing::{Route, RoutingEngine};
    pub use crate::scheduler::{Constraints, Job, JobId, JobState, SchedulerCore, WorkloadProfile};
    pub use crate::thermal::{SafetyCheckInput, ThermalBand, ThermalIsland, ThermalModel};
    pub use crate::LightrailCore;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceType, LiveState, OperationalLimits};
    use crate::scheduler::{Constraints, WorkloadProfile};

    fn test_device() -> Device {
        Device {
            handle: DeviceHandle::new(),
            name: "gpu-0".into(),
            device_type: DeviceType::Gpu,
            compute_capacity_gflops: 100_000,
            memory_capacity_bytes: 80 * 1024 * 1024 * 1024,
            memory_bandwidth_gbps: 2000,
            num_cores: 132,
            peak_performance_tflops: 989.0,
            energy_efficiency_gflops_per_w: 1.4,
            latency_us: 50,
            cost_per_hour: 4.5,
            cost_per_inference: 0.002,
            live: LiveState::default(),
            limits: OperationalLimits::default(),
            links: Vec::new(),
        }
    }

    #[test]
    fn core_wires_up_and_schedules_a_job() {
        let core = LightrailCore::new(Config::default()).unwrap();
        core.register_device(test_device()).unwrap();

        let id = core
            .scheduler
            .submit_job(
                WorkloadProfile { compute_ops: 1_000_000, memory_required_bytes: 1024, memory_bandwidth_required_gbps: 1, batch_size: 1 },
                Constraints::default(),
                config::Objective::Balanced,
            )
            .unwrap();

        let mut job = core.scheduler.job(id).unwrap();
        let device = core.scheduler.place(&mut job).unwrap();
        assert!(core.registry.get(device).is_ok());
    }

    #[test]
    fn invalid_config_rejected_at_construction() {
        let bad = Config::default().with_weights(config::Weights { alpha: 1.0, beta: 1.0, gamma: 1.0 });
        assert!(LightrailCore::new(bad).is_err());
    }

    #[test]
    fn tick_runs_end_to_end() {
        let core = LightrailCore::new(Config::default()).unwrap();
        core.register_device(test_device()).unwrap();
        let snapshot = core.control.tick();
        assert_eq!(snapshot.per_device.len(), 1);
    }

    #[test]
    fn deregister_drains_cleanly_with_no_active_jobs() {
        let core = LightrailCore::new(Config::default()).unwrap();
        let handle = core.register_device(test_device()).unwrap();
        core.deregister_device(handle, std::time::Duration::from_millis(50)).unwrap();
        assert!(core.registry.get(handle).is_err());
    }

    #[test]
    fn deregister_force_fails_jobs_after_deadline() {
        let core = LightrailCore::new(Config::default()).unwrap();
        let handle = core.register_device(test_device()).unwrap();

        let id = core
            .scheduler
            .submit_job(
                WorkloadProfile { compute_ops: 1_000_000, memory_required_bytes: 1024, memory_bandwidth_required_gbps: 1, batch_size: 1 },
                Constraints::default(),
                config::Objective::Balanced,
            )
            .unwrap();
        let mut job = core.scheduler.job(id).unwrap();
        core.scheduler.place(&mut job).unwrap();

        let err = core
            .deregister_device(handle, std::time::Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, LightrailError::Registry(error::RegistryError::HasActiveJobs(_))));
        assert_eq!(core.scheduler.job(id).unwrap().state, crate::scheduler::JobState::Failed);
        assert!(core.registry.get(handle).is_err());
    }
}

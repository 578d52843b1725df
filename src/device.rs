//! Device registry: identity, capacity, live state, and connectivity for the
//! accelerator fleet (spec.md §3, §4.1).
//!
//! Grounded on `knhk-accelerate::hardware_abstraction`'s `RwLock<HashMap<...>>`
//! tracker style — registration/lookup never blocks a reader behind a writer
//! longer than necessary, and state updates take the write lock only for the
//! duration of the map mutation.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{RegistryError, Result};

pub const MAX_DEVICES: usize = 256;
pub const MAX_LINKS_PER_DEVICE: usize = 16;

/// Opaque handle identifying a registered device. Carries a UUID rather than
/// a bare index so handles stay valid across deregistration/re-registration
/// cycles (source material used a reused `device_id` index; this crate uses
/// handles over raw indices per spec.md §9 Design Notes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle(pub Uuid);

impl DeviceHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeviceHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", &self.0.to_string()[..8])
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Accelerator class (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Tpu,
    Npu,
    Photonic,
}

/// A directed link to a neighboring device, used by the routing engine.
/// Carries the three scalars spec.md §3 requires: one-way latency,
/// bandwidth, and per-second transit cost.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub to: DeviceHandle,
    pub bandwidth_gbps: u32,
    pub latency_us: u32,
    pub cost_per_second: f32,
}

/// Mutable, frequently-updated portion of device state (spec.md §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveState {
    pub utilization_pct: f32,
    pub memory_used_bytes: u64,
    pub power_watts: u32,
    pub temperature_c: f32,
    pub airflow_cfm: f32,
    pub humidity_pct: f32,
}

impl Default for LiveState {
    fn default() -> Self {
        Self {
            utilization_pct: 0.0,
            memory_used_bytes: 0,
            power_watts: 0,
            temperature_c: 25.0,
            airflow_cfm: 200.0,
            humidity_pct: 30.0,
        }
    }
}

/// Fixed operational limits a job must respect to be placed on this device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationalLimits {
    pub max_power_watts: u32,
    pub max_temperature_c: f32,
    pub max_utilization_pct: f32,
}

impl Default for OperationalLimits {
    fn default() -> Self {
        Self {
            max_power_watts: u32::MAX,
            max_temperature_c: 90.0,
            max_utilization_pct: 95.0,
        }
    }
}

/// A single accelerator in the fleet (spec.md §3 Device).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub handle: DeviceHandle,
    pub name: String,
    pub device_type: DeviceType,

    pub compute_capacity_gflops: u64,
    pub memory_capacity_bytes: u64,
    pub memory_bandwidth_gbps: u64,
    pub num_cores: u32,
    pub peak_performance_tflops: f32,
    pub energy_efficiency_gflops_per_w: f32,
    pub latency_us: u32,

    pub cost_per_hour: f32,
    pub cost_per_inference: f32,

    pub live: LiveState,
    pub limits: OperationalLimits,

    pub links: Vec<Link>,
}

impl Device {
    /// Feasibility filter used by the scheduler's placement step (spec.md §4.5
    /// step 1), grounded on `lightrail_device_can_run_task`.
    pub fn can_run(&self, memory_required_bytes: u64, max_power_watts: u32) -> bool {
        self.memory_capacity_bytes.saturating_sub(self.live.memory_used_bytes)
            >= memory_required_bytes
            && self.live.power_watts <= max_power_watts
            && self.live.utilization_pct < self.limits.max_utilization_pct
    }

    /// Estimated duration in milliseconds for `compute_ops` FLOPs on this
    /// device at current utilization, grounded on
    /// `lightrail_estimate_task_duration`. Saturates to `u32::MAX` when the
    /// device reports zero peak performance — see DESIGN.md Open Question 1.
    pub fn estimate_duration_ms(&self, compute_ops: u64) -> u32 {
        if self.peak_performance_tflops <= 0.0 {
            return u32::MAX;
        }
        let effective_tflops =
            self.peak_performance_tflops * (1.0 - self.live.utilization_pct / 100.0).max(0.0);
        if effective_tflops <= 0.0 {
            return u32::MAX;
        }
        let duration_s = compute_ops as f64 / (effective_tflops as f64 * 1e12);
        let duration_ms = duration_s * 1000.0;
        if duration_ms >= u32::MAX as f64 {
            u32::MAX
        } else {
            duration_ms as u32
        }
    }

    pub fn link_to(&self, target: DeviceHandle) -> Option<&Link> {
        self.links.iter().find(|l| l.to == target)
    }
}

/// Per-device cache-side counters, supplementing spec.md's Cache Block/
/// Sequence types with the node-level statistics the original tracked
/// (`original_source/fabric-os/kv-cache/distributed_kv_cache.h`'s per-node
/// hit/miss/eviction/transfer counters) but spec.md's distillation dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheNodeStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub network_transfer_bytes: u64,
}

/// The fleet's device table (spec.md §4.1).
pub struct DeviceRegistry {
    max_devices: usize,
    inner: RwLock<HashMap<DeviceHandle, Device>>,
    cache_stats: RwLock<HashMap<DeviceHandle, CacheNodeStats>>,
}

impl DeviceRegistry {
    pub fn new(max_devices: usize) -> Self {
        Self {
            max_devices,
            inner: RwLock::new(HashMap::new()),
            cache_stats: RwLock::new(HashMap::new()),
        }
    }

    #[tracing::instrument(skip(self, device), fields(name = %device.name))]
    pub fn register_device(&self, device: Device) -> Result<DeviceHandle> {
        let handle = device.handle;
        let mut guard = self.inner.write();
        if guard.contains_key(&handle) {
            return Err(RegistryError::Duplicate(handle).into());
        }
        if guard.len() >= self.max_devices {
            return Err(RegistryError::CapacityExceeded { max: self.max_devices }.into());
        }
        guard.insert(handle, device);
        self.cache_stats.write().insert(handle, CacheNodeStats::default());
        info!(?handle, "device registered");
        Ok(handle)
    }

    /// Unconditionally removes a device from the registry. Draining
    /// in-flight jobs before calling this is the caller's responsibility
    /// (spec.md §4.1, §6) — see `LightrailCore::deregister_device`, which
    /// blocks until the device's jobs reach a terminal state or a drain
    /// deadline fires, and only then calls this.
    pub fn deregister(&self, handle: DeviceHandle) -> Result<()> {
        let mut guard = self.inner.write();
        if guard.remove(&handle).is_none() {
            return Err(RegistryError::UnknownDevice(handle).into());
        }
        self.cache_stats.write().remove(&handle);
        info!(?handle, "device deregistered");
        Ok(())
    }

    pub fn update_state(&self, handle: DeviceHandle, live: LiveState) -> Result<()> {
        let mut guard = self.inner.write();
        let device = guard
            .get_mut(&handle)
            .ok_or(RegistryError::UnknownDevice(handle))?;
        debug!(?handle, temp = live.temperature_c, util = live.utilization_pct, "state updated");
        device.live = live;
        Ok(())
    }

    pub fn get(&self, handle: DeviceHandle) -> Result<Device> {
        self.inner
            .read()
            .get(&handle)
            .cloned()
            .ok_or(RegistryError::UnknownDevice(handle).into())
    }

    pub fn iter(&self) -> Vec<Device> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_cache_hit(&self, handle: DeviceHandle) {
        if let Some(stats) = self.cache_stats.write().get_mut(&handle) {
            stats.cache_hits += 1;
        }
    }

    pub fn record_cache_miss(&self, handle: DeviceHandle, transfer_bytes: u64) {
        if let Some(stats) = self.cache_stats.write().get_mut(&handle) {
            stats.cache_misses += 1;
            stats.network_transfer_bytes += transfer_bytes;
        }
    }

    pub fn record_eviction(&self, handle: DeviceHandle) {
        if let Some(stats) = self.cache_stats.write().get_mut(&handle) {
            stats.evictions += 1;
        }
    }

    pub fn cache_stats(&self, handle: DeviceHandle) -> CacheNodeStats {
        self.cache_stats.read().get(&handle).copied().unwrap_or_default()
    }

    pub fn all_cache_stats(&self) -> HashMap<DeviceHandle, CacheNodeStats> {
        self.cache_stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device(name: &str) -> Device {
        Device {
            handle: DeviceHandle::new(),
            name: name.to_string(),
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
    fn register_and_get() {
        let reg = DeviceRegistry::new(MAX_DEVICES);
        let device = test_device("gpu-0");
        let handle = reg.register_device(device.clone()).unwrap();
        assert_eq!(reg.get(handle).unwrap().name, "gpu-0");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let reg = DeviceRegistry::new(MAX_DEVICES);
        let mut device = test_device("gpu-0");
        let handle = reg.register_device(device.clone()).unwrap();
        device.handle = handle;
        let err = reg.register_device(device).unwrap_err();
        assert!(matches!(err, crate::error::LightrailError::Registry(RegistryError::Duplicate(_))));
    }

    #[test]
    fn capacity_exceeded() {
        let reg = DeviceRegistry::new(1);
        reg.register_device(test_device("gpu-0")).unwrap();
        let err = reg.register_device(test_device("gpu-1")).unwrap_err();
        assert!(matches!(
            err,
            crate::error::LightrailError::Registry(RegistryError::CapacityExceeded { max: 1 })
        ));
    }

    #[test]
    fn deregister_unknown_fails() {
        let reg = DeviceRegistry::new(MAX_DEVICES);
        let err = reg.deregister(DeviceHandle::new()).unwrap_err();
        assert!(matches!(err, crate::error::LightrailError::Registry(RegistryError::UnknownDevice(_))));
    }

    #[test]
    fn deregister_removes_device() {
        let reg = DeviceRegistry::new(MAX_DEVICES);
        let handle = reg.register_device(test_device("gpu-0")).unwrap();
        reg.deregister(handle).unwrap();
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn update_state_reflected_in_get() {
        let reg = DeviceRegistry::new(MAX_DEVICES);
        let handle = reg.register_device(test_device("gpu-0")).unwrap();
        reg.update_state(
            handle,
            LiveState {
                utilization_pct: 50.0,
                memory_used_bytes: 1024,
                power_watts: 300,
                temperature_c: 60.0,
                ..LiveState::default()
            },
        )
        .unwrap();
        let device = reg.get(handle).unwrap();
        assert_eq!(device.live.utilization_pct, 50.0);
        assert_eq!(device.live.temperature_c, 60.0);
    }

    #[test]
    fn can_run_respects_memory_power_and_utilization() {
        let mut device = test_device("gpu-0");
        device.live.memory_used_bytes = device.memory_capacity_bytes - 1024;
        assert!(!device.can_run(2048, u32::MAX));

        let mut device = test_device("gpu-0");
        device.live.power_watts = 500;
        assert!(!device.can_run(0, 400));

        let mut device = test_device("gpu-0");
        device.live.utilization_pct = 99.0;
        assert!(!device.can_run(0, u32::MAX));
    }

    #[test]
    fn estimate_duration_saturates_on_zero_perf() {
        let mut device = test_device("gpu-0");
        device.peak_performance_tflops = 0.0;
        assert_eq!(device.estimate_duration_ms(1_000_000), u32::MAX);
    }

    #[test]
    fn estimate_duration_scales_with_utilization() {
        let mut idle = test_device("gpu-0");
        idle.live.utilization_pct = 0.0;
        let mut busy = test_device("gpu-0");
        busy.live.utilization_pct = 50.0;

        let ops = 1_000_000_000_000u64;
        assert!(idle.estimate_duration_ms(ops) < busy.estimate_duration_ms(ops));
    }

    #[test]
    fn cache_stats_accumulate() {
        let reg = DeviceRegistry::new(MAX_DEVICES);
        let handle = reg.register_device(test_device("gpu-0")).unwrap();
        reg.record_cache_hit(handle);
        reg.record_cache_miss(handle, 4096);
        reg.record_eviction(handle);
        let stats = reg.cache_stats(handle);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.network_transfer_bytes, 4096);
        assert_eq!(stats.evictions, 1);
    }
}

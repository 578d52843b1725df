//! Thermal/power governor: threshold bands, predictive cooling, throttling,
//! and thermal islands (spec.md §3, §4.4).
//!
//! Grounded on `original_source/inference-subsystem/core/include/power_governor.hpp`'s
//! stated mandate ("treat heat as a first-class scheduling constraint",
//! predictive cooling, topology-aware migration) and on `knhk-workflow-engine`'s
//! `thermal_scaling.rs` for the atomic-counter-plus-lock style used to track
//! per-device thermal state cheaply on the hot path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SafetyLimits;
use crate::device::{DeviceHandle, DeviceType};
use crate::error::{Result, ThermalError};

/// Per-device-type thermal coefficients for [`ThermalModel::predict_rise`]
/// (spec.md §4.4: "coefficients calibrated per device type"). `k_compute`
/// scales compute-bound heat per unit of `compute_ops / peak_ops` headroom
/// used; `k_memory` scales memory-bound heat per unit of bandwidth headroom
/// used. Values are calibrated so that a device pegged at 100% of both
/// compute and memory bandwidth for a second rises on the order of a few
/// degrees C, with CPUs (lower power density, bigger heatsinks) rising
/// slower than GPUs/NPUs and photonic devices (negligible electrical heat
/// per operation) rising slowest.
fn thermal_coefficients(device_type: DeviceType) -> (f32, f32) {
    match device_type {
        DeviceType::Cpu => (1.5, 1.0),
        DeviceType::Gpu => (3.0, 1.8),
        DeviceType::Tpu => (2.5, 1.5),
        DeviceType::Npu => (2.2, 1.3),
        DeviceType::Photonic => (0.4, 0.3),
    }
}

/// Thermal threshold bands (spec.md §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThermalBand {
    Optimal,
    Warning,
    Critical,
    Emergency,
}

impl ThermalBand {
    /// Bands per spec: Optimal <= 45C covers the nominal operating range;
    /// 45-75C is still Optimal (no separate nominal band is defined), then
    /// Warning (75,85], Critical (85,90], Emergency >90C.
    pub fn classify(temperature_c: f32) -> Self {
        if temperature_c <= 75.0 {
            ThermalBand::Optimal
        } else if temperature_c <= 85.0 {
            ThermalBand::Warning
        } else if temperature_c <= 90.0 {
            ThermalBand::Critical
        } else {
            ThermalBand::Emergency
        }
    }

    /// Throttle percentage applied to new job admission once this band is
    /// reached (spec.md §4.4).
    pub fn throttle_pct(self) -> f32 {
        match self {
            ThermalBand::Optimal => 0.0,
            ThermalBand::Warning => 25.0,
            ThermalBand::Critical => 75.0,
            ThermalBand::Emergency => 100.0,
        }
    }
}

/// A group of devices that share cooling infrastructure and therefore rise
/// and fall in temperature together (spec.md §3 Thermal Island).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThermalIsland {
    pub id: u32,
    pub members: Vec<DeviceHandle>,
    pub ambient_c: f32,
    pub cooling_capacity_w: f32,
}

/// Per-device thermal bookkeeping (spec.md §3 Thermal State).
struct ThermalState {
    /// Stored as milli-degrees-C so it fits an atomic integer; hot-path
    /// reads never take a lock.
    temperature_mc: AtomicU32,
    throttle_pct: AtomicU32,
}

impl ThermalState {
    fn new(initial_c: f32) -> Self {
        Self {
            temperature_mc: AtomicU32::new((initial_c * 1000.0) as u32),
            throttle_pct: AtomicU32::new(0),
        }
    }

    fn temperature_c(&self) -> f32 {
        self.temperature_mc.load(Ordering::Acquire) as f32 / 1000.0
    }

    fn set_temperature_c(&self, value: f32) {
        self.temperature_mc.store((value.max(0.0) * 1000.0) as u32, Ordering::Release);
    }

    fn throttle_pct(&self) -> f32 {
        self.throttle_pct.load(Ordering::Acquire) as f32 / 1000.0
    }

    fn set_throttle_pct(&self, value: f32) {
        self.throttle_pct.store((value * 1000.0) as u32, Ordering::Release);
    }
}

/// Inputs to [`ThermalModel::safety_check`], gathered from the candidate
/// device and the placement decision under evaluation (spec.md §4.4's three
/// safety conditions).
#[derive(Clone, Copy, Debug)]
pub struct SafetyCheckInput {
    pub predicted_c: f32,
    pub requested_w: f32,
    pub max_power_watts: f32,
    pub device_max_temp_c: f32,
    pub airflow_cfm: f32,
    pub humidity_pct: f32,
}

/// Predicts thermal behavior and enforces the hard safety gate before the
/// scheduler commits a placement (spec.md §4.4).
pub struct ThermalModel {
    safety: SafetyLimits,
    states: RwLock<HashMap<DeviceHandle, ThermalState>>,
    islands: RwLock<HashMap<u32, ThermalIsland>>,
}

impl ThermalModel {
    pub fn new(safety: SafetyLimits) -> Self {
        Self {
            safety,
            states: RwLock::new(HashMap::new()),
            islands: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_device(&self, handle: DeviceHandle, initial_c: f32) {
        self.states.write().insert(handle, ThermalState::new(initial_c));
    }

    pub fn deregister_device(&self, handle: DeviceHandle) {
        self.states.write().remove(&handle);
    }

    pub fn record_temperature(&self, handle: DeviceHandle, temperature_c: f32) {
        let states = self.states.read();
        if let Some(state) = states.get(&handle) {
            state.set_temperature_c(temperature_c);
        }
    }

    pub fn temperature_c(&self, handle: DeviceHandle) -> Option<f32> {
        self.states.read().get(&handle).map(|s| s.temperature_c())
    }

    pub fn band(&self, handle: DeviceHandle) -> ThermalBand {
        self.temperature_c(handle).map(ThermalBand::classify).unwrap_or(ThermalBand::Optimal)
    }

    /// Predicts the temperature *rise* (not absolute temperature) a job would
    /// cause on a device of `device_type`, per spec.md §4.4's required model:
    /// `ΔT = k_compute * (compute_ops / peak_ops) + k_memory * (bandwidth_required / device_bandwidth)`,
    /// with coefficients calibrated per device type (see
    /// [`thermal_coefficients`]). Callers add the result to the device's
    /// current temperature before calling [`ThermalModel::safety_check`].
    pub fn predict_rise(
        &self,
        device_type: DeviceType,
        compute_ops: u64,
        peak_ops_per_sec: f64,
        bandwidth_required_gbps: u64,
        device_bandwidth_gbps: u64,
    ) -> f32 {
        let (k_compute, k_memory) = thermal_coefficients(device_type);
        let compute_ratio = if peak_ops_per_sec > 0.0 {
            (compute_ops as f64 / peak_ops_per_sec).min(10.0)
        } else {
            0.0
        };
        let bandwidth_ratio = if device_bandwidth_gbps > 0 {
            (bandwidth_required_gbps as f64 / device_bandwidth_gbps as f64).min(10.0)
        } else {
            0.0
        };
        (k_compute as f64 * compute_ratio + k_memory as f64 * bandwidth_ratio) as f32
    }

    /// Time in milliseconds to cool from `current_c` to `target_c` given
    /// `cooling_capacity_w` of dissipation and the device's thermal mass.
    pub fn cooling_time_ms(&self, current_c: f32, target_c: f32, cooling_capacity_w: f32, thermal_mass_j_per_c: f32) -> u32 {
        if current_c <= target_c || cooling_capacity_w <= 0.0 {
            return 0;
        }
        let energy_to_remove_j = (current_c - target_c) * thermal_mass_j_per_c;
        let seconds = energy_to_remove_j / cooling_capacity_w;
        (seconds * 1000.0) as u32
    }

    /// Hard safety gate: rejects a placement that would violate any of
    /// spec.md §4.4's three conditions. This is the one check the scheduler
    /// may never bypass via retry.
    pub fn safety_check(&self, device: DeviceHandle, input: SafetyCheckInput) -> Result<()> {
        // (a) no action moves a setpoint outside its [min, max] operational
        // range: the requested power draw must stay within the device's own
        // power envelope.
        if input.requested_w > input.max_power_watts {
            return Err(ThermalError::PowerCap {
                device,
                requested_w: input.requested_w,
                max_w: input.max_power_watts,
            }
            .into());
        }

        // (b) predicted temperature must stay within both the global safety
        // floor and the device's own operational limit, whichever is tighter.
        let effective_max_c = self.safety.max_temp_c.min(input.device_max_temp_c);
        if input.predicted_c > effective_max_c {
            warn!(?device, predicted_c = input.predicted_c, max = effective_max_c, "safety gate: thermal limit");
            return Err(ThermalError::ThermalLimit {
                device,
                predicted_c: input.predicted_c,
                max_c: effective_max_c,
            }
            .into());
        }

        // (c) airflow floor and humidity ceiling must be respected.
        if input.airflow_cfm < self.safety.min_airflow_cfm {
            return Err(ThermalError::AirflowBelowFloor {
                device,
                airflow_cfm: input.airflow_cfm,
                min_cfm: self.safety.min_airflow_cfm,
            }
            .into());
        }
        if input.humidity_pct > self.safety.max_humidity_pct {
            return Err(ThermalError::HumidityExceeded {
                device,
                humidity_pct: input.humidity_pct,
                max_pct: self.safety.max_humidity_pct,
            }
            .into());
        }

        Ok(())
    }

    /// Applies a throttle percentage to a device, used by the control loop
    /// when a device crosses into Warning/Critical/Emergency (spec.md §4.4).
    pub fn apply_throttle(&self, handle: DeviceHandle, pct: f32) -> Result<()> {
        let pct = pct.clamp(0.0, 100.0);
        let states = self.states.read();
        let state = states.get(&handle).ok_or(ThermalError::SetpointOutOfRange(handle))?;
        state.set_throttle_pct(pct);
        if pct > 0.0 {
            info!(?handle, pct, "throttle applied");
        }
        Ok(())
    }

    pub fn throttle_pct(&self, handle: DeviceHandle) -> f32 {
        self.states.read().get(&handle).map(|s| s.throttle_pct()).unwrap_or(0.0)
    }

    /// Pre-cools `island_id` ahead of an anticipated heavy workload by
    /// dropping its member devices' throttle headroom proactively (spec.md
    /// §4.4 predictive cooling), grounded on power_governor.hpp's
    /// "Predictive Cooling: Pre-cool zones before heavy workloads".
    pub fn precool_island(&self, island_id: u32, target_throttle_pct: f32) -> Result<()> {
        let members = {
            let islands = self.islands.read();
            islands.get(&island_id).map(|i| i.members.clone())
        };
        let Some(members) = members else {
            return Ok(());
        };
        for member in members {
            let _ = self.apply_throttle(member, target_throttle_pct);
        }
        Ok(())
    }

    pub fn register_island(&self, island: ThermalIsland) {
        self.islands.write().insert(island.id, island);
    }

    /// Returns every island where the hottest member has crossed into the
    /// Critical or Emergency band, used by the control loop's migration
    /// policy (spec.md §4.4, §4.6).
    pub fn critical_islands(&self) -> Vec<u32> {
        let islands = self.islands.read();
        let states = self.states.read();
        islands
            .values()
            .filter(|island| {
                island.members.iter().any(|m| {
                    states
                        .get(m)
                        .map(|s| matches!(ThermalBand::classify(s.temperature_c()), ThermalBand::Critical | ThermalBand::Emergency))
                        .unwrap_or(false)
                })
            })
            .map(|i| i.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_classification_matches_thresholds() {
        assert_eq!(ThermalBand::classify(30.0), ThermalBand::Optimal);
        assert_eq!(ThermalBand::classify(80.0), ThermalBand::Warning);
        assert_eq!(ThermalBand::classify(87.0), ThermalBand::Critical);
        assert_eq!(ThermalBand::classify(95.0), ThermalBand::Emergency);
    }

    fn lenient_input(predicted_c: f32) -> SafetyCheckInput {
        SafetyCheckInput {
            predicted_c,
            requested_w: 100.0,
            max_power_watts: 500.0,
            device_max_temp_c: 95.0,
            airflow_cfm: 200.0,
            humidity_pct: 30.0,
        }
    }

    #[test]
    fn safety_check_rejects_over_limit() {
        let model = ThermalModel::new(SafetyLimits { max_temp_c: 90.0, ..SafetyLimits::default() });
        let handle = DeviceHandle::new();
        let err = model.safety_check(handle, lenient_input(95.0)).unwrap_err();
        assert!(matches!(err, crate::error::LightrailError::Thermal(ThermalError::ThermalLimit { .. })));
    }

    #[test]
    fn safety_check_allows_under_limit() {
        let model = ThermalModel::new(SafetyLimits::default());
        assert!(model.safety_check(DeviceHandle::new(), lenient_input(70.0)).is_ok());
    }

    #[test]
    fn safety_check_rejects_power_over_device_cap() {
        let model = ThermalModel::new(SafetyLimits::default());
        let mut input = lenient_input(50.0);
        input.requested_w = 600.0;
        input.max_power_watts = 500.0;
        let err = model.safety_check(DeviceHandle::new(), input).unwrap_err();
        assert!(matches!(err, crate::error::LightrailError::Thermal(ThermalError::PowerCap { .. })));
    }

    #[test]
    fn safety_check_rejects_airflow_below_floor() {
        let model = ThermalModel::new(SafetyLimits { min_airflow_cfm: 100.0, ..SafetyLimits::default() });
        let mut input = lenient_input(50.0);
        input.airflow_cfm = 50.0;
        let err = model.safety_check(DeviceHandle::new(), input).unwrap_err();
        assert!(matches!(err, crate::error::LightrailError::Thermal(ThermalError::AirflowBelowFloor { .. })));
    }

    #[test]
    fn safety_check_rejects_humidity_over_ceiling() {
        let model = ThermalModel::new(SafetyLimits { max_humidity_pct: 50.0, ..SafetyLimits::default() });
        let mut input = lenient_input(50.0);
        input.humidity_pct = 80.0;
        let err = model.safety_check(DeviceHandle::new(), input).unwrap_err();
        assert!(matches!(err, crate::error::LightrailError::Thermal(ThermalError::HumidityExceeded { .. })));
    }

    #[test]
    fn predict_rise_increases_with_compute_and_bandwidth_ratio() {
        let model = ThermalModel::new(SafetyLimits::default());
        let low = model.predict_rise(DeviceType::Gpu, 1_000, 1_000_000, 1, 1000);
        let high = model.predict_rise(DeviceType::Gpu, 900_000, 1_000_000, 900, 1000);
        assert!(high > low);
    }

    #[test]
    fn predict_rise_varies_by_device_type() {
        let model = ThermalModel::new(SafetyLimits::default());
        let gpu = model.predict_rise(DeviceType::Gpu, 500_000, 1_000_000, 500, 1000);
        let photonic = model.predict_rise(DeviceType::Photonic, 500_000, 1_000_000, 500, 1000);
        assert!(gpu > photonic, "photonic devices should be calibrated to rise slower than GPUs");
    }

    #[test]
    fn cooling_time_zero_when_already_at_target() {
        let model = ThermalModel::new(SafetyLimits::default());
        assert_eq!(model.cooling_time_ms(50.0, 60.0, 100.0, 500.0), 0);
    }

    #[test]
    fn throttle_applied_and_read_back() {
        let model = ThermalModel::new(SafetyLimits::default());
        let handle = DeviceHandle::new();
        model.register_device(handle, 50.0);
        model.apply_throttle(handle, 25.0).unwrap();
        assert_eq!(model.throttle_pct(handle), 25.0);
    }

    #[test]
    fn critical_island_detected() {
        let model = ThermalModel::new(SafetyLimits::default());
        let a = DeviceHandle::new();
        let b = DeviceHandle::new();
        model.register_device(a, 40.0);
        model.register_device(b, 40.0);
        model.register_island(ThermalIsland {
            id: 1,
            members: vec![a, b],
            ambient_c: 22.0,
            cooling_capacity_w: 500.0,
        });
        assert!(model.critical_islands().is_empty());
        model.record_temperature(b, 88.0);
        assert_eq!(model.critical_islands(), vec![1]);
    }
}

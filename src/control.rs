//! Control loop: observe, decide, apply, publish (spec.md §2, §4.6).
//!
//! Grounded on `knhk-autonomic::controller`'s MAPE-K cycle structure
//! (monitor/analyze/plan/execute, instrumented with `#[instrument]` spans per
//! cycle) adapted to the simpler four-step tick spec.md calls for, and on
//! `original_source/inference-subsystem/core/include/power_governor.hpp`'s
//! "topology-aware migration" for the migration-decision step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cache::KvCacheCoordinator;
use crate::device::{DeviceHandle, DeviceRegistry};
use crate::scheduler::{JobState, SchedulerCore};
use crate::thermal::{ThermalBand, ThermalModel};

/// Per-device telemetry published each tick (spec.md §6 Telemetry API).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub handle: DeviceHandle,
    pub name: String,
    pub utilization_pct: f32,
    pub temperature_c: f32,
    pub power_watts: u32,
    pub thermal_band: ThermalBand,
    pub throttle_pct: f32,
    pub active_jobs: usize,
}

/// Fleet-wide aggregate metrics, including Power Usage Effectiveness (PUE)
/// as an ambient metric a real thermal governor would track alongside the
/// spec'd per-device state (grounded on power_governor.hpp's DCIM
/// integration note).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Aggregates {
    pub total_power_watts: u64,
    pub mean_utilization_pct: f32,
    pub mean_temperature_c: f32,
    pub pue: f32,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub queue_len: usize,
    pub total_scheduled: u64,
    pub total_completed: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub used_bytes: u64,
    pub total_capacity_bytes: u64,
    pub hit_rate_pct: f32,
    pub total_evictions: u64,
}

/// A single tick's full telemetry publication (spec.md §6 Telemetry API).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: u64,
    pub per_device: Vec<DeviceSnapshot>,
    pub aggregates: Aggregates,
    pub scheduler: SchedulerStats,
    pub cache: CacheStats,
    pub migrations_this_tick: u32,
}

/// Drives the fleet's observe -> decide -> apply -> publish cycle
/// (spec.md §4.6).
pub struct ControlLoop {
    registry: Arc<DeviceRegistry>,
    scheduler: Arc<SchedulerCore>,
    thermal: Arc<ThermalModel>,
    cache: Arc<KvCacheCoordinator>,

    tick_count: AtomicU64,
    interval: Duration,
}

impl ControlLoop {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        scheduler: Arc<SchedulerCore>,
        thermal: Arc<ThermalModel>,
        cache: Arc<KvCacheCoordinator>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            scheduler,
            thermal,
            cache,
            tick_count: AtomicU64::new(0),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs one observe -> decide -> apply -> publish cycle and returns the
    /// resulting telemetry snapshot (spec.md §4.6).
    #[instrument(skip(self))]
    pub fn tick(&self) -> Snapshot {
        let tick = self.tick_count.fetch_add(1, Ordering::AcqRel);

        // Step 1: observe. Snapshot every device's live state and thermal band.
        let devices = self.registry.iter();
        let mut per_device = Vec::with_capacity(devices.len());
        let mut total_power = 0u64;
        let mut util_sum = 0f32;
        let mut temp_sum = 0f32;

        for device in &devices {
            let band = self.thermal.band(device.handle);
            let active_jobs = self.scheduler.jobs_on(device.handle).len();
            total_power += device.live.power_watts as u64;
            util_sum += device.live.utilization_pct;
            temp_sum += device.live.temperature_c;
            per_device.push(DeviceSnapshot {
                handle: device.handle,
                name: device.name.clone(),
                utilization_pct: device.live.utilization_pct,
                temperature_c: device.live.temperature_c,
                power_watts: device.live.power_watts,
                thermal_band: band,
                throttle_pct: self.thermal.throttle_pct(device.handle),
                active_jobs,
            });
        }

        let count = devices.len().max(1) as f32;
        let aggregates = Aggregates {
            total_power_watts: total_power,
            mean_utilization_pct: util_sum / count,
            mean_temperature_c: temp_sum / count,
            // IT load over total facility load; without separate facility
            // telemetry this crate reports a fixed industry-typical overhead
            // factor rather than fabricating a measured value.
            pue: 1.4,
        };

        // Step 2: analyze/decide. Classify thermal bands and compute throttle.
        for device in &devices {
            let band = self.thermal.band(device.handle);
            let pct = band.throttle_pct();
            if pct > 0.0 {
                debug!(?device.handle, ?band, pct, "tick: throttle decision");
            }
        }

        // Step 3: apply. Throttle devices in Warning+ bands, migrate jobs off
        // Critical/Emergency islands.
        let mut migrations_this_tick = 0u32;
        for device in &devices {
            let band = self.thermal.band(device.handle);
            if band.throttle_pct() > 0.0 {
                let _ = self.thermal.apply_throttle(device.handle, band.throttle_pct());
            }
            if matches!(band, ThermalBand::Critical | ThermalBand::Emergency) {
                for job in self.scheduler.jobs_on(device.handle) {
                    if job.state == JobState::Running || job.state == JobState::Scheduled {
                        match self.scheduler.migrate(job.id, device.handle) {
                            Ok(target) if target != device.handle => {
                                migrations_this_tick += 1;
                                warn!(?job.id, from = ?device.handle, to = ?target, "tick: migrated job off hot device");
                            }
                            Ok(_) => {}
                            Err(err) => warn!(?job.id, %err, "tick: migration attempt failed"),
                        }
                    }
                }
            }
        }

        for island_id in self.thermal.critical_islands() {
            let _ = self.thermal.precool_island(island_id, 50.0);
        }

        // Step 4: publish.
        let snapshot = Snapshot {
            tick,
            per_device,
            aggregates,
            scheduler: SchedulerStats {
                queue_len: self.scheduler.queue_len(),
                total_scheduled: self.scheduler.total_scheduled(),
                total_completed: self.scheduler.total_completed(),
            },
            cache: CacheStats {
                used_bytes: self.cache.used_bytes(),
                total_capacity_bytes: self.cache.total_capacity_bytes(),
                hit_rate_pct: self.cache.hit_rate(),
                total_evictions: self.cache.total_evictions(),
            },
            migrations_this_tick,
        };

        info!(tick = snapshot.tick, devices = snapshot.per_device.len(), migrations = migrations_this_tick, "tick complete");
        snapshot
    }
}

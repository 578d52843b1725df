//! Scheduler core: bounded job queue, five-step placement algorithm,
//! migration, and cancellation (spec.md §3, §4.5).
//!
//! Grounded on `original_source/fabric-os/lightrail-scheduler/lightrail_scheduler.h`
//! (`task_descriptor`, `lightrail_submit_task`, `lightrail_schedule_optimal`,
//! `lightrail_compute_objective`) for the data model and scoring function,
//! and on `knhk-autonomic::controller`'s `#[instrument]`-per-cycle style for
//! observability. The submission queue is a `crossbeam::channel::bounded`
//! MPMC channel rather than a mutex + condvar (spec.md §9 REDESIGN: condvars
//! map onto bounded-channel-with-wakeup in this corpus's idiom).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::KvCacheCoordinator;
use crate::config::{Algorithm, Config, Objective};
use crate::device::{Device, DeviceHandle, DeviceRegistry};
use crate::error::{Result, SchedulerError};
use crate::routing::RoutingEngine;
use crate::thermal::{SafetyCheckInput, ThermalModel};

/// Unique, monotonically increasing job identifier (spec.md §8 property 2).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Debug for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Job({})", self.0)
    }
}

/// Lifecycle state of a submitted job (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Preempted,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// Compute/memory/bandwidth profile of a job's workload (spec.md §3 Job).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadProfile {
    pub compute_ops: u64,
    pub memory_required_bytes: u64,
    pub memory_bandwidth_required_gbps: u64,
    pub batch_size: u32,
}

/// Hard constraints a placement must satisfy (spec.md §3 Job).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Constraints {
    pub deadline_ms: u32,
    pub preferred_device_type: Option<crate::device::DeviceType>,
    pub max_power_watts: u32,
    pub requires_high_precision: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            deadline_ms: u32::MAX,
            preferred_device_type: None,
            max_power_watts: u32::MAX,
            requires_high_precision: false,
        }
    }
}

/// KV cache affinity hint for cache-aware placement (spec.md §4.5 scoring).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheDescriptor {
    pub sequence_id: Option<u64>,
    pub cache_size_bytes: u64,
}

/// A unit of schedulable work (spec.md §3 Job).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub workload: WorkloadProfile,
    pub constraints: Constraints,
    pub cache: CacheDescriptor,
    pub dependencies: HashSet<JobId>,
    pub priority: u32,
    pub objective: Objective,

    pub assigned_device: Option<DeviceHandle>,
    pub estimated_duration_ms: Option<u32>,
    pub estimated_cost: Option<f32>,
}

impl Job {
    pub fn new(id: JobId, workload: WorkloadProfile) -> Self {
        Self {
            id,
            state: JobState::Pending,
            workload,
            constraints: Constraints::default(),
            cache: CacheDescriptor::default(),
            dependencies: HashSet::new(),
            priority: 0,
            objective: Objective::Balanced,
            assigned_device: None,
            estimated_duration_ms: None,
            estimated_cost: None,
        }
    }
}

/// Scoring breakdown for a single placement candidate (spec.md §4.5),
/// grounded on `lightrail_compute_objective`'s α·latency + β·power + γ·cost
/// with this crate's cache-affinity and thermal-penalty terms added.
#[derive(Clone, Copy, Debug)]
struct Score {
    value: f32,
}

/// Penalty applied when a device doesn't match the job's
/// `preferred_device_type` (spec.md §3 Job Constraints: a *preference*, not a
/// hard requirement — a device of a different type is still eligible, just
/// scored worse, so placement never fails outright for want of the preferred
/// type).
const PREFERRED_TYPE_MISMATCH_PENALTY: f32 = 200.0;

fn score_candidate(
    device: &Device,
    job: &Job,
    transfer_ms: f32,
    thermal_penalty: f32,
    cache_hit_value: f32,
    has_cache_affinity: bool,
    weights: &crate::config::Weights,
) -> Score {
    let exec_ms = device.estimate_duration_ms(job.workload.compute_ops) as f32;
    let affinity = if has_cache_affinity { cache_hit_value } else { 0.0 };
    let utilization_term = device.live.utilization_pct / 10.0;
    let preference_penalty = match job.constraints.preferred_device_type {
        Some(t) if t != device.device_type => PREFERRED_TYPE_MISMATCH_PENALTY,
        _ => 0.0,
    };

    let objective_term = match job.objective {
        Objective::MinimizeLatency => exec_ms,
        Objective::MinimizePower => device.live.power_watts as f32,
        Objective::MinimizeCost => device.cost_per_inference * 1000.0,
        Objective::MaximizeThroughput => -(1.0 / exec_ms.max(1.0)) * 1000.0,
        Objective::Balanced => {
            weights.alpha * exec_ms + weights.beta * device.live.power_watts as f32
                + weights.gamma * device.cost_per_inference * 1000.0
        }
    };

    let value =
        -affinity + exec_ms + transfer_ms + utilization_term + thermal_penalty + preference_penalty + objective_term;
    Score { value }
}

struct QueueSlot {
    job: Job,
}

/// The scheduler's core loop: job queue, placement, migration (spec.md §4.5).
pub struct SchedulerCore {
    config: Config,
    registry: std::sync::Arc<DeviceRegistry>,
    routing: std::sync::Arc<RoutingEngine>,
    cache: std::sync::Arc<KvCacheCoordinator>,
    thermal: std::sync::Arc<ThermalModel>,

    sender: Sender<QueueSlot>,
    receiver: Receiver<QueueSlot>,

    jobs: RwLock<HashMap<JobId, Job>>,
    next_job_id: AtomicU64,

    total_scheduled: AtomicU64,
    total_completed: AtomicU64,
}

impl SchedulerCore {
    pub fn new(
        config: Config,
        registry: std::sync::Arc<DeviceRegistry>,
        routing: std::sync::Arc<RoutingEngine>,
        cache: std::sync::Arc<KvCacheCoordinator>,
        thermal: std::sync::Arc<ThermalModel>,
    ) -> Self {
        let (sender, receiver) = channel::bounded(config.max_tasks);
        Self {
            config,
            registry,
            routing,
            cache,
            thermal,
            sender,
            receiver,
            jobs: RwLock::new(HashMap::new()),
            next_job_id: AtomicU64::new(1),
            total_scheduled: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
        }
    }

    /// Submits a job to the bounded queue, non-blocking (spec.md §4.5,
    /// §6 Submission API), grounded on `lightrail_submit_task`.
    #[tracing::instrument(skip(self, workload))]
    pub fn submit_job(&self, workload: WorkloadProfile, constraints: Constraints, objective: Objective) -> Result<JobId> {
        if workload.compute_ops == 0 {
            return Err(SchedulerError::ValidationError("compute_ops must be non-zero".into()).into());
        }

        let id = JobId(self.next_job_id.fetch_add(1, Ordering::AcqRel));
        let mut job = Job::new(id, workload);
        job.constraints = constraints;
        job.objective = objective;

        match self.sender.try_send(QueueSlot { job: job.clone() }) {
            Ok(()) => {
                self.jobs.write().insert(id, job);
                debug!(?id, "job submitted");
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                warn!(?id, "submission queue full");
                Err(SchedulerError::QueueFull.into())
            }
            Err(TrySendError::Disconnected(_)) => Err(SchedulerError::QueueFull.into()),
        }
    }

    /// Pulls the next queued job, if any, without blocking.
    pub fn try_next(&self) -> Option<Job> {
        self.receiver.try_recv().ok().map(|slot| slot.job)
    }

    /// Five-step placement algorithm (spec.md §4.5):
    /// 1. Feasibility filter (memory, power, utilization).
    /// 2. Score every feasible candidate.
    /// 3. Pick the argmin.
    /// 4. Safety gate (thermal) on the winner; retry against the next-best
    ///    candidate up to `max_retries` times if rejected.
    /// 5. Commit: update device state, job state, and cache affinity.
    #[tracing::instrument(skip(self, job))]
    pub fn place(&self, job: &mut Job) -> Result<DeviceHandle> {
        let devices = self.registry.iter();
        let device_graph: HashMap<DeviceHandle, Device> =
            devices.iter().map(|d| (d.handle, d.clone())).collect();

        // Step 1: feasibility filter. `preferred_device_type` is a soft
        // preference scored in step 2 (see `PREFERRED_TYPE_MISMATCH_PENALTY`),
        // not a hard filter here.
        let mut feasible: Vec<Device> = devices
            .into_iter()
            .filter(|d| d.can_run(job.workload.memory_required_bytes, job.constraints.max_power_watts))
            .collect();

        if feasible.is_empty() {
            return Err(SchedulerError::NoDevice(job.id).into());
        }

        let preferred_node = job.cache.sequence_id.and_then(|seq| self.cache.preferred_node(seq));

        // Step 2 + 3: score and rank best-first so retries try the next best.
        let mut scored: Vec<(Score, Device)> = feasible
            .drain(..)
            .map(|device| {
                let transfer_ms = if Some(device.handle) == preferred_node {
                    0.0
                } else if let Some(holder) = preferred_node {
                    // Cache miss: ask the routing engine for the inter-device
                    // transfer cost a migration off `holder` would incur
                    // (spec.md §2 data flow), falling back to a raw
                    // bandwidth estimate if no path exists yet.
                    self.routing
                        .compute_route(
                            &device_graph,
                            holder,
                            device.handle,
                            job.objective,
                            self.config.weights,
                            self.config.algorithm,
                        )
                        .map(|route| route.total_latency_us as f32 / 1000.0)
                        .unwrap_or_else(|_| {
                            job.workload.memory_required_bytes as f32
                                / (device.memory_bandwidth_gbps.max(1) as f32 * 1e9)
                                * 1000.0
                        })
                } else {
                    job.workload.memory_required_bytes as f32
                        / (device.memory_bandwidth_gbps.max(1) as f32 * 1e9)
                        * 1000.0
                };
                let thermal_penalty = match self.thermal.band(device.handle) {
                    crate::thermal::ThermalBand::Optimal => 0.0,
                    crate::thermal::ThermalBand::Warning => 50.0,
                    crate::thermal::ThermalBand::Critical => 500.0,
                    crate::thermal::ThermalBand::Emergency => f32::MAX,
                };
                let score = score_candidate(
                    &device,
                    job,
                    transfer_ms,
                    thermal_penalty,
                    self.config.cache_hit_value,
                    preferred_node == Some(device.handle),
                    &self.config.weights,
                );
                (score, device)
            })
            .collect();
        // Step 3: rank best-first. `Algorithm::Greedy` (spec.md §6
        // `algorithm: greedy`) ranks candidates by current utilization
        // instead of the full multi-objective score; `Dijkstra`/`AStar` only
        // affect the path search above, so both rank by `score_candidate`.
        match self.config.algorithm {
            Algorithm::Greedy => scored.sort_by(|a, b| {
                a.1.live
                    .utilization_pct
                    .partial_cmp(&b.1.live.utilization_pct)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            Algorithm::Dijkstra | Algorithm::AStar => {
                scored.sort_by(|a, b| a.0.value.partial_cmp(&b.0.value).unwrap_or(std::cmp::Ordering::Equal))
            }
        }

        // Step 4: safety gate with retry against progressively worse candidates.
        let mut attempts = 0u32;
        for (_, device) in &scored {
            if attempts > self.config.max_retries {
                break;
            }
            attempts += 1;
            let baseline_c = self.thermal.temperature_c(device.handle).unwrap_or(device.live.temperature_c);
            let predicted_c = baseline_c
                + self.thermal.predict_rise(
                    device.device_type,
                    job.workload.compute_ops,
                    device.peak_performance_tflops as f64 * 1e12,
                    job.workload.memory_bandwidth_required_gbps,
                    device.memory_bandwidth_gbps,
                );

            let safety_input = SafetyCheckInput {
                predicted_c,
                requested_w: device.live.power_watts as f32,
                max_power_watts: device.limits.max_power_watts as f32,
                device_max_temp_c: device.limits.max_temperature_c,
                airflow_cfm: device.live.airflow_cfm,
                humidity_pct: device.live.humidity_pct,
            };

            match self.thermal.safety_check(device.handle, safety_input) {
                Ok(()) => {
                    // Step 5: commit.
                    job.assigned_device = Some(device.handle);
                    job.estimated_duration_ms = Some(device.estimate_duration_ms(job.workload.compute_ops));
                    job.estimated_cost = Some(device.cost_per_inference);
                    job.state = JobState::Scheduled;
                    self.jobs.write().insert(job.id, job.clone());
                    self.total_scheduled.fetch_add(1, Ordering::Relaxed);
                    info!(?job.id, device = ?device.handle, "job placed");
                    return Ok(device.handle);
                }
                Err(_) => {
                    warn!(?job.id, device = ?device.handle, attempts, "safety gate rejected candidate, retrying");
                    continue;
                }
            }
        }

        // Last-resort fallback: every candidate tried has failed the safety
        // gate or retries were exhausted; pick the coolest remaining device
        // regardless of score or configured algorithm, accepting a
        // suboptimal but safe placement. Distinct from `Algorithm::Greedy`
        // above — this always runs, independent of `self.config.algorithm`.
        if let Some((_, device)) = scored
            .iter()
            .min_by(|a, b| {
                self.thermal
                    .temperature_c(a.1.handle)
                    .unwrap_or(f32::MAX)
                    .partial_cmp(&self.thermal.temperature_c(b.1.handle).unwrap_or(f32::MAX))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .filter(|(_, d)| matches!(self.thermal.band(d.handle), crate::thermal::ThermalBand::Optimal | crate::thermal::ThermalBand::Warning))
        {
            job.assigned_device = Some(device.handle);
            job.state = JobState::Scheduled;
            self.jobs.write().insert(job.id, job.clone());
            warn!(?job.id, device = ?device.handle, "last-resort coolest-available placement");
            return Ok(device.handle);
        }

        Err(SchedulerError::NoDevice(job.id).into())
    }

    /// Migrates a running job off `from` (typically because its thermal
    /// island turned Critical), re-running placement excluding `from`.
    /// Per spec.md §9 Open Question resolution (see DESIGN.md): migration
    /// only completes once any in-flight cache prefetch for the job has
    /// drained, modeled here by requiring the caller to have already freed
    /// or migrated the job's cache blocks before calling this.
    #[tracing::instrument(skip(self))]
    pub fn migrate(&self, job_id: JobId, from: DeviceHandle) -> Result<DeviceHandle> {
        let mut job = {
            let jobs = self.jobs.read();
            jobs.get(&job_id).cloned().ok_or(SchedulerError::NotFound(job_id))?
        };
        if job.state.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(job_id).into());
        }
        if job.assigned_device != Some(from) {
            debug!(?job_id, "migrate called but job not on source device, ignoring");
            return Ok(from);
        }

        let target = self.place(&mut job)?;
        if target == from {
            warn!(?job_id, "migration found no alternative device");
        } else {
            info!(?job_id, ?from, to = ?target, "job migrated");
        }
        self.jobs.write().insert(job_id, job);
        Ok(target)
    }

    pub fn cancel(&self, job_id: JobId) -> Result<()> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(SchedulerError::NotFound(job_id))?;
        if job.state.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(job_id).into());
        }
        job.state = JobState::Cancelled;
        info!(?job_id, "job cancelled");
        Ok(())
    }

    /// Forces a job to `Failed`, used by `LightrailCore::deregister_device`
    /// when a device's drain deadline expires with jobs still assigned to it
    /// (spec.md §4.1 deregistration, §6 drain semantics).
    pub fn force_fail(&self, job_id: JobId) -> Result<()> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(SchedulerError::NotFound(job_id))?;
        if job.state.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(job_id).into());
        }
        job.state = JobState::Failed;
        warn!(?job_id, "job force-failed on device drain deadline");
        Ok(())
    }

    pub fn complete(&self, job_id: JobId) -> Result<()> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(SchedulerError::NotFound(job_id))?;
        if job.state.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(job_id).into());
        }
        job.state = JobState::Completed;
        self.total_completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn job(&self, job_id: JobId) -> Option<Job> {
        self.jobs.read().get(&job_id).cloned()
    }

    pub fn jobs_on(&self, device: DeviceHandle) -> Vec<Job> {
        self.jobs
            .read()
            .values()
            .filter(|j| j.assigned_device == Some(device) && !j.state.is_terminal())
            .cloned()
            .collect()
    }

    pub fn total_scheduled(&self) -> u64 {
        self.total_scheduled.load(Ordering::Relaxed)
    }

    pub fn total_completed(&self) -> u64 {
        self.total_completed.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.receiver.len()
    }
}

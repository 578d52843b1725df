//! Crate-wide error taxonomy.
//!
//! Each subsystem owns a `thiserror`-derived enum; all of them fold into
//! [`LightrailError`] via `#[from]` so callers crossing subsystem boundaries
//! (e.g. the scheduler calling into the cache coordinator) can propagate with
//! a single `?`.

use thiserror::Error;

use crate::device::DeviceHandle;
use crate::scheduler::JobId;

pub type Result<T> = std::result::Result<T, LightrailError>;

/// Errors from the device registry (spec.md §4.1, §6 Registry API).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device registry is at capacity ({max} devices)")]
    CapacityExceeded { max: usize },

    #[error("unknown device: {0:?}")]
    UnknownDevice(DeviceHandle),

    #[error("device {0:?} already registered")]
    Duplicate(DeviceHandle),

    #[error("device {0:?} has active jobs and drain deadline expired")]
    HasActiveJobs(DeviceHandle),
}

/// Errors from the routing engine (spec.md §4.2).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no route from {src:?} to {dst:?}")]
    Unreachable { src: DeviceHandle, dst: DeviceHandle },
}

/// Errors from the KV cache coordinator (spec.md §4.3).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("out of capacity: could not free enough bytes for allocation")]
    OutOfCapacity,

    #[error("block not found: {0}")]
    BlockNotFound(u64),

    #[error("sequence not found: {0}")]
    SequenceNotFound(u64),

    #[error("sequence {0} already exists")]
    DuplicateSequence(u64),

    #[error("coherency conflict on block {0}")]
    CoherencyConflict(u64),
}

/// Errors from the thermal model (spec.md §4.4, §7). Not `Eq`: the
/// `f32` fields below only implement `PartialEq`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThermalError {
    #[error("action would violate thermal limit on {device:?}: predicted {predicted_c:.1}C > max {max_c:.1}C")]
    ThermalLimit {
        device: DeviceHandle,
        predicted_c: f32,
        max_c: f32,
    },

    #[error("action would violate power cap on {device:?}: {requested_w:.1}W > {max_w:.1}W")]
    PowerCap {
        device: DeviceHandle,
        requested_w: f32,
        max_w: f32,
    },

    #[error("setpoint out of operational range for {0:?}")]
    SetpointOutOfRange(DeviceHandle),

    #[error("airflow below safety floor on {device:?}: {airflow_cfm:.1} CFM < {min_cfm:.1} CFM")]
    AirflowBelowFloor {
        device: DeviceHandle,
        airflow_cfm: f32,
        min_cfm: f32,
    },

    #[error("humidity exceeds safety ceiling on {device:?}: {humidity_pct:.1}% > {max_pct:.1}%")]
    HumidityExceeded {
        device: DeviceHandle,
        humidity_pct: f32,
        max_pct: f32,
    },
}

/// Errors from the scheduler core (spec.md §4.5, §6 Submission API).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("submission queue is full")]
    QueueFull,

    #[error("job failed validation: {0}")]
    ValidationError(String),

    #[error("no feasible device for job {0:?}")]
    NoDevice(JobId),

    #[error("job {0:?} not found")]
    NotFound(JobId),

    #[error("job {0:?} is already in a terminal state")]
    AlreadyTerminal(JobId),

    #[error("operation on job {0:?} timed out")]
    Timeout(JobId),
}

/// Crate-wide error, the union of every subsystem's taxonomy. Not `Eq`
/// since it carries `ThermalError`, which isn't.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LightrailError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Thermal(#[from] ThermalError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

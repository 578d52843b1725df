//! Optimal routing & placement engine: Dijkstra shortest path over the
//! device link graph with configurable multi-objective edge weights, plus a
//! congestion-versioned route cache (spec.md §3, §4.2).
//!
//! Grounded on `original_source/fabric-os/lightrail-scheduler/lightrail_scheduler.h`
//! (`lightrail_compute_route`, `lightrail_schedule_dijkstra`,
//! `lightrail_route_cost`) for the algorithm and data model, and on
//! `knhk-accelerate::dispatch`'s `RwLock`-guarded routing table for the
//! concurrency shape.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Algorithm, Objective, Weights};
use crate::device::{Device, DeviceHandle, Link};
use crate::error::{Result, RoutingError};

pub const MAX_HOPS: usize = 16;

/// A computed path between two devices (spec.md §3 Route).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub source: DeviceHandle,
    pub destination: DeviceHandle,
    pub path: Vec<DeviceHandle>,
    pub total_latency_us: u64,
    pub total_bandwidth_gbps: u64,
    pub total_cost: f32,
    pub congestion_factor: f32,
}

impl Route {
    pub fn num_hops(&self) -> usize {
        self.path.len().saturating_sub(1)
    }
}

#[derive(Clone, Debug)]
struct CachedRoute {
    route: Route,
    congestion_version: u64,
}

#[derive(Clone, Copy, PartialEq)]
struct HeapEntry {
    /// `f = g + h`: the value the heap is ordered by.
    cost: f32,
    /// `g`: the real accumulated path cost, used to detect stale entries.
    g: f32,
    hops: usize,
    node_order: usize,
    node: DeviceHandle,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the smallest cost pops first.
        // Tie-break: fewer hops, then lower insertion order (stand-in for
        // "lower device id" - DeviceHandle has no total order of its own).
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| other.hops.cmp(&self.hops))
            .then_with(|| other.node_order.cmp(&self.node_order))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Per-link congestion tracking, bumped whenever a link's observed load
/// changes enough to invalidate cached routes through it.
#[derive(Default)]
struct LinkCongestion {
    version: AtomicU64,
    factor: Mutex<f32>,
}

pub struct RoutingEngine {
    cache: Mutex<HashMap<(DeviceHandle, DeviceHandle, Objective), CachedRoute>>,
    congestion: Mutex<HashMap<(DeviceHandle, DeviceHandle), std::sync::Arc<LinkCongestion>>>,
}

impl Default for RoutingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingEngine {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            congestion: Mutex::new(HashMap::new()),
        }
    }

    /// Marks the link `(from, to)` as more/less congested, invalidating any
    /// cached route that crosses it (spec.md §4.2 route cache invalidation).
    pub fn set_congestion(&self, from: DeviceHandle, to: DeviceHandle, factor: f32) {
        let congestion = self
            .congestion
            .lock()
            .entry((from, to))
            .or_insert_with(|| std::sync::Arc::new(LinkCongestion::default()))
            .clone();
        *congestion.factor.lock() = factor;
        congestion.version.fetch_add(1, Ordering::AcqRel);
    }

    fn congestion_version(&self, from: DeviceHandle, to: DeviceHandle) -> u64 {
        self.congestion
            .lock()
            .get(&(from, to))
            .map(|c| c.version.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn congestion_factor(&self, from: DeviceHandle, to: DeviceHandle) -> f32 {
        self.congestion
            .lock()
            .get(&(from, to))
            .map(|c| *c.factor.lock())
            .unwrap_or(1.0)
    }

    /// Maps the configured objective to a per-link edge weight (spec.md §4.2
    /// objective-to-edge-weight table), grounded on `lightrail_route_cost`.
    /// `MinimizeCost` uses the link's own per-second transit cost (spec.md
    /// §3 Link, §4.2 "link cost per second"), falling back to the
    /// destination device's cost-per-hour / 3600 when the link doesn't carry
    /// one of its own. `Balanced` mixes latency/power/cost with the
    /// configured `weights` rather than a fixed split, matching the same
    /// `alpha`/`beta`/`gamma` the scheduler's own scoring uses.
    fn edge_weight(&self, objective: Objective, weights: &Weights, from: DeviceHandle, device: &Device, link: &Link) -> f32 {
        let congestion = self.congestion_factor(from, device.handle).max(1.0);
        let link_cost_per_second = if link.cost_per_second > 0.0 {
            link.cost_per_second
        } else {
            device.cost_per_hour / 3600.0
        };
        match objective {
            Objective::MinimizeLatency => link.latency_us as f32 * congestion,
            Objective::MinimizePower => device.live.power_watts as f32 * congestion,
            Objective::MinimizeCost => link_cost_per_second * congestion,
            Objective::MaximizeThroughput => {
                if link.bandwidth_gbps == 0 {
                    f32::MAX
                } else {
                    (1.0 / link.bandwidth_gbps as f32) * congestion
                }
            }
            Objective::Balanced => {
                (weights.alpha * link.latency_us as f32
                    + weights.beta * device.live.power_watts as f32
                    + weights.gamma * link_cost_per_second * 1000.0)
                    * congestion
            }
        }
    }

    /// Admissible heuristic for A* search (spec.md §6 `algorithm: a-star`).
    /// The device graph carries no spatial/geometric coordinates, so the
    /// only heuristic that is provably admissible (never overestimates the
    /// remaining cost) is zero — which makes this reduce to Dijkstra's
    /// search order. Kept as its own hook (rather than folding `AStar` into
    /// the `Dijkstra` match arm) so a future device model with real
    /// coordinates can supply a tighter estimate without changing the search
    /// loop.
    fn heuristic(&self, algorithm: Algorithm, _node: DeviceHandle, _destination: DeviceHandle) -> f32 {
        match algorithm {
            Algorithm::AStar => 0.0,
            Algorithm::Dijkstra | Algorithm::Greedy => 0.0,
        }
    }

    /// Computes the optimal route from `source` to `destination` via the
    /// configured search algorithm over `devices`' link graph, consulting and
    /// refreshing the route cache.
    #[tracing::instrument(skip(self, devices))]
    pub fn compute_route(
        &self,
        devices: &HashMap<DeviceHandle, Device>,
        source: DeviceHandle,
        destination: DeviceHandle,
        objective: Objective,
        weights: Weights,
        algorithm: Algorithm,
    ) -> Result<Route> {
        if source == destination {
            return Ok(Route {
                source,
                destination,
                path: vec![source],
                total_latency_us: 0,
                total_bandwidth_gbps: u64::MAX,
                total_cost: 0.0,
                congestion_factor: 1.0,
            });
        }

        if let Some(cached) = self.cache.lock().get(&(source, destination, objective)) {
            let still_valid = cached
                .route
                .path
                .windows(2)
                .all(|pair| self.congestion_version(pair[0], pair[1]) == cached.congestion_version);
            if still_valid {
                debug!(?source, ?destination, "route cache hit");
                return Ok(cached.route.clone());
            }
        }

        let route = self.search(devices, source, destination, objective, weights, algorithm)?;

        let version = route
            .path
            .windows(2)
            .map(|pair| self.congestion_version(pair[0], pair[1]))
            .max()
            .unwrap_or(0);
        self.cache.lock().insert(
            (source, destination, objective),
            CachedRoute { route: route.clone(), congestion_version: version },
        );
        Ok(route)
    }

    /// Shortest-path search: Dijkstra when `algorithm` is [`Algorithm::Dijkstra`]
    /// or [`Algorithm::Greedy`] (greedy mode only changes device *selection*
    /// in the scheduler, not path-finding), A* when [`Algorithm::AStar`]
    /// (using [`Self::heuristic`]).
    fn search(
        &self,
        devices: &HashMap<DeviceHandle, Device>,
        source: DeviceHandle,
        destination: DeviceHandle,
        objective: Objective,
        weights: Weights,
        algorithm: Algorithm,
    ) -> Result<Route> {
        if !devices.contains_key(&source) || !devices.contains_key(&destination) {
            return Err(RoutingError::Unreachable { src: source, dst: destination }.into());
        }

        // `dist` holds the real path cost (g); the heap is ordered by
        // `g + heuristic` (f) so A* explores toward the destination first.
        let mut dist: HashMap<DeviceHandle, f32> = HashMap::new();
        let mut hops: HashMap<DeviceHandle, usize> = HashMap::new();
        let mut prev: HashMap<DeviceHandle, DeviceHandle> = HashMap::new();
        let mut heap = BinaryHeap::new();
        let mut order = 0usize;

        dist.insert(source, 0.0);
        hops.insert(source, 0);
        heap.push(HeapEntry {
            cost: self.heuristic(algorithm, source, destination),
            g: 0.0,
            hops: 0,
            node_order: order,
            node: source,
        });

        while let Some(HeapEntry { g, hops: cur_hops, node, .. }) = heap.pop() {
            if node == destination {
                break;
            }
            if g > *dist.get(&node).unwrap_or(&f32::MAX) {
                continue;
            }
            if cur_hops >= MAX_HOPS {
                continue;
            }
            let Some(current) = devices.get(&node) else { continue };
            for link in &current.links {
                let Some(neighbor) = devices.get(&link.to) else { continue };
                let weight = self.edge_weight(objective, &weights, node, neighbor, link);
                let next_g = g + weight;
                let next_hops = cur_hops + 1;
                let better = next_g < *dist.get(&link.to).unwrap_or(&f32::MAX);
                if better {
                    dist.insert(link.to, next_g);
                    hops.insert(link.to, next_hops);
                    prev.insert(link.to, node);
                    order += 1;
                    let f = next_g + self.heuristic(algorithm, link.to, destination);
                    heap.push(HeapEntry { cost: f, g: next_g, hops: next_hops, node_order: order, node: link.to });
                }
            }
        }

        if !dist.contains_key(&destination) {
            return Err(RoutingError::Unreachable { src: source, dst: destination }.into());
        }

        let mut path = vec![destination];
        let mut cur = destination;
        while cur != source {
            let Some(&p) = prev.get(&cur) else {
                return Err(RoutingError::Unreachable { src: source, dst: destination }.into());
            };
            path.push(p);
            cur = p;
        }
        path.reverse();

        let mut total_latency_us = 0u64;
        let mut total_bandwidth_gbps = u64::MAX;
        let mut total_cost = 0f32;
        let mut congestion_product = 1.0f32;
        for pair in path.windows(2) {
            let device = &devices[&pair[0]];
            if let Some(link) = device.link_to(pair[1]) {
                total_latency_us += link.latency_us as u64;
                total_bandwidth_gbps = total_bandwidth_gbps.min(link.bandwidth_gbps as u64);
                total_cost += if link.cost_per_second > 0.0 {
                    link.cost_per_second
                } else {
                    devices[&pair[1]].cost_per_hour / 3600.0
                };
                congestion_product *= self.congestion_factor(pair[0], pair[1]);
            }
        }

        Ok(Route {
            source,
            destination,
            path,
            total_latency_us,
            total_bandwidth_gbps: if total_bandwidth_gbps == u64::MAX { 0 } else { total_bandwidth_gbps },
            total_cost,
            congestion_factor: congestion_product,
        })
    }

    pub fn invalidate(&self, source: DeviceHandle, destination: DeviceHandle, objective: Objective) {
        self.cache.lock().remove(&(source, destination, objective));
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceType, Link, LiveState, OperationalLimits};

    fn device(handle: DeviceHandle, links: Vec<Link>) -> Device {
        Device {
            handle,
            name: "d".into(),
            device_type: DeviceType::Gpu,
            compute_capacity_gflops: 1,
            memory_capacity_bytes: 1,
            memory_bandwidth_gbps: 1,
            num_cores: 1,
            peak_performance_tflops: 1.0,
            energy_efficiency_gflops_per_w: 1.0,
            latency_us: 1,
            cost_per_hour: 1.0,
            cost_per_inference: 0.01,
            live: LiveState::default(),
            limits: OperationalLimits::default(),
            links,
        }
    }

    fn chain_graph() -> (HashMap<DeviceHandle, Device>, Vec<DeviceHandle>) {
        let handles: Vec<DeviceHandle> = (0..3).map(|_| DeviceHandle::new()).collect();
        let mut devices = HashMap::new();
        devices.insert(
            handles[0],
            device(
                handles[0],
                vec![Link { to: handles[1], bandwidth_gbps: 100, latency_us: 10, cost_per_second: 0.0 }],
            ),
        );
        devices.insert(
            handles[1],
            device(
                handles[1],
                vec![Link { to: handles[2], bandwidth_gbps: 100, latency_us: 10, cost_per_second: 0.0 }],
            ),
        );
        devices.insert(handles[2], device(handles[2], vec![]));
        (devices, handles)
    }

    #[test]
    fn finds_direct_route() {
        let (devices, handles) = chain_graph();
        let engine = RoutingEngine::new();
        let route = engine
            .compute_route(&devices, handles[0], handles[2], Objective::MinimizeLatency, Weights::default(), Algorithm::Dijkstra)
            .unwrap();
        assert_eq!(route.path, vec![handles[0], handles[1], handles[2]]);
        assert_eq!(route.num_hops(), 2);
    }

    #[test]
    fn same_source_and_destination_is_trivial() {
        let (devices, handles) = chain_graph();
        let engine = RoutingEngine::new();
        let route = engine
            .compute_route(&devices, handles[0], handles[0], Objective::MinimizeLatency, Weights::default(), Algorithm::Dijkstra)
            .unwrap();
        assert_eq!(route.path, vec![handles[0]]);
        assert_eq!(route.total_latency_us, 0);
    }

    #[test]
    fn unreachable_destination_errors() {
        let (mut devices, handles) = chain_graph();
        devices.get_mut(&handles[1]).unwrap().links.clear();
        let engine = RoutingEngine::new();
        let err = engine
            .compute_route(&devices, handles[0], handles[2], Objective::MinimizeLatency, Weights::default(), Algorithm::Dijkstra)
            .unwrap_err();
        assert!(matches!(err, crate::error::LightrailError::Routing(RoutingError::Unreachable { .. })));
    }

    #[test]
    fn cache_hit_on_second_lookup() {
        let (devices, handles) = chain_graph();
        let engine = RoutingEngine::new();
        engine
            .compute_route(&devices, handles[0], handles[2], Objective::MinimizeLatency, Weights::default(), Algorithm::Dijkstra)
            .unwrap();
        assert_eq!(engine.cache_len(), 1);
        engine
            .compute_route(&devices, handles[0], handles[2], Objective::MinimizeLatency, Weights::default(), Algorithm::Dijkstra)
            .unwrap();
        assert_eq!(engine.cache_len(), 1);
    }

    #[test]
    fn congestion_bump_invalidates_cache() {
        let (devices, handles) = chain_graph();
        let engine = RoutingEngine::new();
        let first = engine
            .compute_route(&devices, handles[0], handles[2], Objective::MinimizeLatency, Weights::default(), Algorithm::Dijkstra)
            .unwrap();
        engine.set_congestion(handles[0], handles[1], 5.0);
        let second = engine
            .compute_route(&devices, handles[0], handles[2], Objective::MinimizeLatency, Weights::default(), Algorithm::Dijkstra)
            .unwrap();
        assert_eq!(first.path, second.path);
    }

    #[test]
    fn triangle_inequality_holds_for_balanced_objective() {
        let (devices, handles) = chain_graph();
        let engine = RoutingEngine::new();
        let direct = engine
            .compute_route(&devices, handles[0], handles[2], Objective::Balanced, Weights::default(), Algorithm::Dijkstra)
            .unwrap();
        let first_hop = engine
            .compute_route(&devices, handles[0], handles[1], Objective::Balanced, Weights::default(), Algorithm::Dijkstra)
            .unwrap();
        let second_hop = engine
            .compute_route(&devices, handles[1], handles[2], Objective::Balanced, Weights::default(), Algorithm::Dijkstra)
            .unwrap();
        assert!(direct.total_latency_us <= first_hop.total_latency_us + second_hop.total_latency_us + 1);
    }

    #[test]
    fn astar_finds_same_path_as_dijkstra() {
        let (devices, handles) = chain_graph();
        let engine = RoutingEngine::new();
        let route = engine
            .compute_route(&devices, handles[0], handles[2], Objective::MinimizeLatency, Weights::default(), Algorithm::AStar)
            .unwrap();
        assert_eq!(route.path, vec![handles[0], handles[1], handles[2]]);
    }
}

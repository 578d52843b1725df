//! Property tests for the five invariants named in SPEC_FULL.md §4.10
//! (spec.md §8): conservation of capacity, monotonic job ids, MESI
//! exclusivity, eviction minimality, and route triangle inequality.

use std::collections::HashMap;

use proptest::prelude::*;

use lightrail_core::prelude::*;

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

use lightrail_core::device::OperationalLimits;

proptest! {
    /// Conservation of capacity (spec.md §8 property): `used_bytes` never
    /// exceeds `total_capacity_bytes`, no matter how many allocations are
    /// driven through a fixed-size cache.
    #[test]
    fn used_bytes_never_exceeds_capacity(num_allocations in 0usize..200) {
        let page = lightrail_core::cache::PAGE_SIZE_BYTES as u64;
        let capacity = page * 8;
        let cache = KvCacheCoordinator::new(capacity, EvictionPolicy::Lru, Coherency::Mesi, 1);
        cache.create_sequence(1, 0).unwrap();
        let node = DeviceHandle::new();

        for i in 0..num_allocations {
            cache.allocate(1, node, i as u64).unwrap();
            prop_assert!(cache.used_bytes() <= cache.total_capacity_bytes());
        }
    }

    /// Monotonic job ids (spec.md §8 property 2): ids assigned by
    /// `submit_job` strictly increase in submission order, regardless of
    /// queue depth or workload shape.
    #[test]
    fn job_ids_are_strictly_monotonic(compute_ops in 1u64..1_000_000, num_jobs in 1usize..50) {
        let core = LightrailCore::new(Config::default().with_max_tasks(num_jobs + 1)).unwrap();
        let workload = WorkloadProfile {
            compute_ops,
            memory_required_bytes: 1024,
            memory_bandwidth_required_gbps: 1,
            batch_size: 1,
        };

        let mut last = None;
        for _ in 0..num_jobs {
            let id = core
                .scheduler
                .submit_job(workload.clone(), Constraints::default(), Objective::Balanced)
                .unwrap();
            if let Some(prev) = last {
                prop_assert!(id.0 > prev);
            }
            last = Some(id.0);
        }
    }

    /// MESI exclusivity (spec.md §8 property, §3 Cache Block invariant): a
    /// block that has never been through `share_prefix` stays `Exclusive` —
    /// it is never silently promoted to `Shared`, which would let two nodes
    /// believe they each hold the sole writable copy.
    #[test]
    fn unshared_blocks_stay_exclusive(num_blocks in 1usize..30) {
        let cache = KvCacheCoordinator::new(u64::MAX, EvictionPolicy::Lru, Coherency::Mesi, 1);
        cache.create_sequence(1, 0).unwrap();
        let node = DeviceHandle::new();

        for i in 0..num_blocks {
            let block_id = cache.allocate(1, node, i as u64).unwrap();
            let block = cache.get(block_id, i as u64 + 1).unwrap();
            prop_assert_eq!(*block.state.lock(), BlockState::Exclusive);
        }
    }

    /// Eviction minimality (spec.md §8 property 4): since every block is a
    /// fixed `PAGE_SIZE_BYTES` page, a coordinator at a capacity of exactly
    /// `N` pages never holds more than `N` blocks at once, no matter how
    /// many allocations are driven past that bound.
    #[test]
    fn eviction_never_exceeds_page_capacity(capacity_pages in 1u64..8, num_allocations in 1usize..100) {
        let page = lightrail_core::cache::PAGE_SIZE_BYTES as u64;
        let cache = KvCacheCoordinator::new(page * capacity_pages, EvictionPolicy::Lru, Coherency::Mesi, 1);
        cache.create_sequence(1, 0).unwrap();
        let node = DeviceHandle::new();

        for i in 0..num_allocations {
            cache.allocate(1, node, i as u64).unwrap();
            prop_assert!(cache.block_count() as u64 <= capacity_pages);
        }
    }

    /// Route triangle inequality (spec.md §8 property): the direct route's
    /// total latency never exceeds the sum of any two-hop decomposition
    /// through an intermediate device, for a random chain of links.
    #[test]
    fn route_triangle_inequality_holds(latencies in prop::collection::vec(1u32..500, 2..8)) {
        let engine = RoutingEngine::new();
        let handles: Vec<DeviceHandle> = (0..latencies.len() + 1).map(|_| DeviceHandle::new()).collect();
        let mut devices: HashMap<DeviceHandle, Device> = HashMap::new();

        for (i, handle) in handles.iter().enumerate() {
            let mut device = test_device("d");
            device.handle = *handle;
            if i < latencies.len() {
                device.links.push(Link {
                    to: handles[i + 1],
                    bandwidth_gbps: 100,
                    latency_us: latencies[i],
                    cost_per_second: 0.0,
                });
            }
            devices.insert(*handle, device);
        }

        let first = *handles.first().unwrap();
        let last = *handles.last().unwrap();
        let mid = handles[handles.len() / 2];

        let direct = engine
            .compute_route(&devices, first, last, Objective::MinimizeLatency, Weights::default(), Algorithm::Dijkstra)
            .unwrap();
        let first_half = engine
            .compute_route(&devices, first, mid, Objective::MinimizeLatency, Weights::default(), Algorithm::Dijkstra)
            .unwrap();
        let second_half = engine
            .compute_route(&devices, mid, last, Objective::MinimizeLatency, Weights::default(), Algorithm::Dijkstra)
            .unwrap();

        prop_assert!(direct.total_latency_us <= first_half.total_latency_us + second_half.total_latency_us);
    }
}

//! Prometheus gauges and counters for the relay control plane
//!
//! Updates are fire-and-forget: nothing in the control plane reads these back.
//! Encoding and serving the registry is left to the embedding process.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, IntCounterVec, IntGauge, IntGaugeVec, Registry,
};
use std::sync::LazyLock;

/// Metrics registry for everything this crate exports
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Live workers in the pool
pub static WORKERS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "roomrelay_workers",
        "Number of live media workers",
        REGISTRY.clone()
    )
    .expect("Failed to register WORKERS")
});

/// Rooms by scaling strategy
pub static ROOMS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        "roomrelay_rooms",
        "Number of rooms with a router topology",
        &["strategy"],
        REGISTRY.clone()
    )
    .expect("Failed to register ROOMS")
});

/// Routers created across all rooms
pub static ROUTERS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "roomrelay_routers",
        "Number of routers across all rooms",
        REGISTRY.clone()
    )
    .expect("Failed to register ROUTERS")
});

/// Routers currently used for placement across all rooms
pub static ACTIVE_ROUTERS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "roomrelay_active_routers",
        "Number of routers open for participant placement",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_ROUTERS")
});

pub static PARTICIPANTS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "roomrelay_participants",
        "Number of participants attached to multi-router rooms",
        REGISTRY.clone()
    )
    .expect("Failed to register PARTICIPANTS")
});

/// Tracked forward links across all rooms
pub static FORWARD_LINKS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "roomrelay_forward_links",
        "Number of tracked cross-router forward links",
        REGISTRY.clone()
    )
    .expect("Failed to register FORWARD_LINKS")
});

/// Forward links created, by policy ("eager" / "on_demand")
pub static FORWARDS_CREATED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "roomrelay_forward_created_total",
        "Total number of forward links created",
        &["policy"],
        REGISTRY.clone()
    )
    .expect("Failed to register FORWARDS_CREATED")
});

/// Forward link creation failures, by policy
pub static FORWARDS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "roomrelay_forward_failed_total",
        "Total number of failed forward link creations",
        &["policy"],
        REGISTRY.clone()
    )
    .expect("Failed to register FORWARDS_FAILED")
});

/// Cumulative CPU seconds per worker, as last sampled by the monitor
pub static WORKER_CPU_SECONDS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        "roomrelay_worker_cpu_seconds",
        "Cumulative CPU seconds (user + system) consumed by each worker",
        &["worker"],
        REGISTRY.clone()
    )
    .expect("Failed to register WORKER_CPU_SECONDS")
});

pub const POLICY_EAGER: &str = "eager";
pub const POLICY_ON_DEMAND: &str = "on_demand";

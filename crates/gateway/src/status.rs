//! Aggregate gateway health verdict.

use crate::health::{HealthRecord, HealthRegistry, HealthStatus};
use serde::Serialize;

/// Minimum healthy fraction for a `degraded` (rather than `unhealthy`) verdict.
pub const DEGRADED_FLOOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Verdict plus the snapshot it was computed from.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub status: OverallStatus,
    /// Services currently `healthy`; `unknown` is not counted.
    pub healthy_services: usize,
    pub total_services: usize,
    /// Per-service records, sorted by name.
    pub services: Vec<HealthRecord>,
}

/// Classify a healthy fraction.
///
/// All healthy (or nothing registered) is `healthy`, `[0.8, 1.0)` is
/// `degraded`, anything lower is `unhealthy`.
pub fn classify(healthy: usize, total: usize) -> OverallStatus {
    if healthy >= total {
        return OverallStatus::Healthy;
    }
    let fraction = healthy as f64 / total as f64;
    if fraction >= DEGRADED_FLOOR {
        OverallStatus::Degraded
    } else {
        OverallStatus::Unhealthy
    }
}

/// Compute the verdict from one consistent snapshot of the registry.
pub fn aggregate(registry: &HealthRegistry) -> GatewayStatus {
    let services = registry.snapshot();
    let healthy_services = services
        .iter()
        .filter(|r| r.status == HealthStatus::Healthy)
        .count();
    let total_services = services.len();
    GatewayStatus {
        status: classify(healthy_services, total_services),
        healthy_services,
        total_services,
        services,
    }
}

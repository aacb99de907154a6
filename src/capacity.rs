//! Capacity planner: checks a plan's aggregate demand against what the host
//! can give away before anything is provisioned.

use std::fmt;

use facet::Facet;
use miette::Diagnostic;
use thiserror::Error;

use crate::plan::ProvisioningPlan;

/// Snapshot of host resources, captured once per planning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapacity {
    pub total_memory_mb: u64,
    pub reserved_os_memory_mb: u64,
    pub total_disk_gb: u64,
    pub reserved_os_disk_percent: u64,
    pub total_cores: u32,
    pub reserved_os_cores: u32,
}

impl HostCapacity {
    pub fn available_memory_mb(&self) -> u64 {
        self.total_memory_mb.saturating_sub(self.reserved_os_memory_mb)
    }

    /// `total * (100 - reserved%) / 100`, truncated.
    pub fn available_disk_gb(&self) -> u64 {
        let kept = 100 - self.reserved_os_disk_percent.min(100);
        self.total_disk_gb * kept / 100
    }

    pub fn available_cores(&self) -> u64 {
        u64::from(self.total_cores.saturating_sub(self.reserved_os_cores))
    }

    /// The ceiling a plan must fit under.
    pub fn budget(&self) -> ResourceBudget {
        ResourceBudget {
            memory_mb: self.available_memory_mb(),
            disk_gb: self.available_disk_gb(),
            cores: self.available_cores(),
        }
    }
}

/// Memory, disk and core totals, either demanded by a plan or available on the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
pub struct ResourceBudget {
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub cores: u64,
}

impl ResourceBudget {
    /// Sum the demand of every node in the plan, controllers and computes alike.
    ///
    /// Totals saturate at `u64::MAX`, which no host budget can reach, so an
    /// overflowing plan still fails the gate.
    pub fn of_plan(plan: &ProvisioningPlan) -> Self {
        plan.nodes().iter().fold(Self::default(), |acc, node| Self {
            memory_mb: acc.memory_mb.saturating_add(node.memory_mb),
            disk_gb: acc.disk_gb.saturating_add(node.disk_gb()),
            cores: acc.cores.saturating_add(u64::from(node.cores)),
        })
    }

    fn get(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Memory => self.memory_mb,
            Dimension::Disk => self.disk_gb,
            Dimension::Cores => self.cores,
        }
    }
}

/// Budget dimensions, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Memory,
    Disk,
    Cores,
}

impl Dimension {
    pub const CHECK_ORDER: [Dimension; 3] = [Dimension::Memory, Dimension::Disk, Dimension::Cores];

    pub fn unit(self) -> &'static str {
        match self {
            Dimension::Memory => "MB",
            Dimension::Disk => "GB",
            Dimension::Cores => "cores",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Memory => f.write_str("memory"),
            Dimension::Disk => f.write_str("disk"),
            Dimension::Cores => f.write_str("cores"),
        }
    }
}

/// A budget or topology rule broken by a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum Violation {
    #[error("{node_id}: must have assigned at least 1 core")]
    #[diagnostic(
        code(isoprov::invalid_topology),
        help("a domain with zero CPU cores is an invalid CPU topology")
    )]
    InvalidTopology { node_id: String },

    #[error(
        "the {dimension} defined in the plan is greater than the recommended free {dimension}: \
         requested {requested} {unit}, available {available} {unit}",
        unit = .dimension.unit()
    )]
    #[diagnostic(
        code(isoprov::capacity_exceeded),
        help("shrink the plan or raise the host reservations in [host]")
    )]
    CapacityExceeded {
        dimension: Dimension,
        requested: u64,
        available: u64,
    },
}

/// Outcome of a successful validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityReport {
    pub requested: ResourceBudget,
    pub available: ResourceBudget,
}

/// Validate `plan` against `host`.
///
/// Topology is checked per node first and aborts before any aggregation.
/// Budgets are then compared memory, disk, cores; the first exceeded
/// dimension is the only violation reported.
pub fn validate(plan: &ProvisioningPlan, host: &HostCapacity) -> Result<CapacityReport, Violation> {
    if let Some(node) = plan.nodes().iter().find(|n| n.cores < 1) {
        return Err(Violation::InvalidTopology {
            node_id: node.id.clone(),
        });
    }

    let requested = ResourceBudget::of_plan(plan);
    let available = host.budget();

    for dimension in Dimension::CHECK_ORDER {
        let (want, have) = (requested.get(dimension), available.get(dimension));
        if want > have {
            return Err(Violation::CapacityExceeded {
                dimension,
                requested: want,
                available: have,
            });
        }
    }

    Ok(CapacityReport {
        requested,
        available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigurationConfig, NodeResourcesConfig};

    fn host() -> HostCapacity {
        HostCapacity {
            total_memory_mb: 32_000,
            reserved_os_memory_mb: 2_000,
            total_disk_gb: 1000,
            reserved_os_disk_percent: 20,
            total_cores: 16,
            reserved_os_cores: 2,
        }
    }

    fn node(memory_mb: u64, disk_each_gb: u64, cores: u32) -> NodeResourcesConfig {
        NodeResourcesConfig {
            partition_a_gb: disk_each_gb,
            partition_b_gb: disk_each_gb,
            memory_mb,
            cores,
        }
    }

    fn plan(controller: NodeResourcesConfig, computes: Vec<NodeResourcesConfig>) -> ProvisioningPlan {
        ProvisioningPlan::from_configurations(&[ConfigurationConfig {
            controller,
            computes,
        }])
        .unwrap()
    }

    #[test]
    fn derived_availability() {
        let h = host();
        assert_eq!(h.available_memory_mb(), 30_000);
        assert_eq!(h.available_disk_gb(), 800);
        assert_eq!(h.available_cores(), 14);
    }

    #[test]
    fn disk_availability_truncates() {
        let h = HostCapacity {
            total_disk_gb: 333,
            reserved_os_disk_percent: 10,
            ..host()
        };
        // 333 * 90 / 100 = 299.7
        assert_eq!(h.available_disk_gb(), 299);
    }

    #[test]
    fn reservations_larger_than_totals_saturate() {
        let h = HostCapacity {
            total_memory_mb: 1000,
            reserved_os_memory_mb: 4000,
            total_cores: 2,
            reserved_os_cores: 8,
            reserved_os_disk_percent: 150,
            ..host()
        };
        assert_eq!(h.budget(), ResourceBudget::default());
    }

    #[test]
    fn plan_within_budget_is_ok() {
        let p = plan(node(10_000, 100, 4), vec![node(8_000, 100, 4)]);
        let report = validate(&p, &host()).unwrap();
        assert_eq!(
            report.requested,
            ResourceBudget {
                memory_mb: 18_000,
                disk_gb: 400,
                cores: 8,
            }
        );
        assert_eq!(report.available, host().budget());
    }

    #[test]
    fn plan_exactly_at_budget_is_ok() {
        let p = plan(node(30_000, 400, 14), vec![]);
        validate(&p, &host()).unwrap();
    }

    #[test]
    fn zero_cores_is_invalid_topology_even_within_budget() {
        let p = plan(node(1_000, 10, 1), vec![node(1_000, 10, 0)]);
        assert_eq!(
            validate(&p, &host()).unwrap_err(),
            Violation::InvalidTopology {
                node_id: "controller-0-compute-0".into()
            }
        );
    }

    #[test]
    fn zero_cores_wins_over_capacity() {
        let p = plan(node(999_999, 9_999, 0), vec![]);
        assert!(matches!(
            validate(&p, &host()),
            Err(Violation::InvalidTopology { .. })
        ));
    }

    #[test]
    fn memory_only_violation() {
        let p = plan(node(20_000, 100, 2), vec![node(10_001, 100, 2)]);
        assert_eq!(
            validate(&p, &host()).unwrap_err(),
            Violation::CapacityExceeded {
                dimension: Dimension::Memory,
                requested: 30_001,
                available: 30_000,
            }
        );
    }

    #[test]
    fn overflowing_memory_total_is_rejected() {
        let huge = u64::MAX / 2 + 1;
        let p = plan(node(huge, 1, 1), vec![node(huge, 1, 1)]);
        let h = HostCapacity {
            total_memory_mb: 16_000,
            reserved_os_memory_mb: 0,
            ..host()
        };
        assert_eq!(
            validate(&p, &h).unwrap_err(),
            Violation::CapacityExceeded {
                dimension: Dimension::Memory,
                requested: u64::MAX,
                available: 16_000,
            }
        );
    }

    #[test]
    fn overflowing_partition_sizes_exceed_disk() {
        let p = plan(node(1_000, u64::MAX / 2 + 1, 1), vec![]);
        assert_eq!(ResourceBudget::of_plan(&p).disk_gb, u64::MAX);
        assert!(matches!(
            validate(&p, &host()).unwrap_err(),
            Violation::CapacityExceeded {
                dimension: Dimension::Disk,
                ..
            }
        ));
    }

    #[test]
    fn memory_is_reported_before_disk() {
        let p = plan(node(40_000, 500, 2), vec![]);
        let err = validate(&p, &host()).unwrap_err();
        assert!(matches!(
            err,
            Violation::CapacityExceeded {
                dimension: Dimension::Memory,
                ..
            }
        ));
    }

    #[test]
    fn disk_is_reported_before_cores() {
        let p = plan(node(1_000, 500, 32), vec![]);
        assert_eq!(
            validate(&p, &host()).unwrap_err(),
            Violation::CapacityExceeded {
                dimension: Dimension::Disk,
                requested: 1000,
                available: 800,
            }
        );
    }

    #[test]
    fn cores_violation() {
        let p = plan(node(1_000, 10, 8), vec![node(1_000, 10, 7)]);
        assert_eq!(
            validate(&p, &host()).unwrap_err(),
            Violation::CapacityExceeded {
                dimension: Dimension::Cores,
                requested: 15,
                available: 14,
            }
        );
    }

    #[test]
    fn violation_messages_name_the_problem() {
        let topo = Violation::InvalidTopology {
            node_id: "controller-1".into(),
        };
        assert_eq!(topo.to_string(), "controller-1: must have assigned at least 1 core");

        let cap = Violation::CapacityExceeded {
            dimension: Dimension::Disk,
            requested: 1000,
            available: 800,
        };
        let msg = cap.to_string();
        assert!(msg.contains("disk"));
        assert!(msg.contains("requested 1000 GB"));
        assert!(msg.contains("available 800 GB"));
    }
}

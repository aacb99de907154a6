//! Declarative node plan built from the `[[configurations]]` groups.
//!
//! This answers "is the declared plan well-formed"; whether the host can
//! afford it is [`crate::capacity::validate`]'s job.

use std::collections::HashSet;
use std::fmt;

use crate::config::{ConfigurationConfig, NodeResourcesConfig};
use crate::error::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    Compute,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Controller => f.write_str("controller"),
            Role::Compute => f.write_str("compute"),
        }
    }
}

/// One controller or compute definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: String,
    pub role: Role,
    /// `None` for controllers.
    pub parent_controller_id: Option<String>,
    pub partition_a_gb: u64,
    pub partition_b_gb: u64,
    pub memory_mb: u64,
    pub cores: u32,
}

impl NodeSpec {
    pub fn controller(index: usize, resources: &NodeResourcesConfig) -> Self {
        Self::from_resources(controller_id(index), Role::Controller, None, resources)
    }

    pub fn compute(controller: usize, index: usize, resources: &NodeResourcesConfig) -> Self {
        Self::from_resources(
            format!("{}-compute-{index}", controller_id(controller)),
            Role::Compute,
            Some(controller_id(controller)),
            resources,
        )
    }

    fn from_resources(
        id: String,
        role: Role,
        parent_controller_id: Option<String>,
        resources: &NodeResourcesConfig,
    ) -> Self {
        Self {
            id,
            role,
            parent_controller_id,
            partition_a_gb: resources.partition_a_gb,
            partition_b_gb: resources.partition_b_gb,
            memory_mb: resources.memory_mb,
            cores: resources.cores,
        }
    }

    /// Disk demand of both partitions, saturating.
    pub fn disk_gb(&self) -> u64 {
        self.partition_a_gb.saturating_add(self.partition_b_gb)
    }
}

fn controller_id(index: usize) -> String {
    format!("controller-{index}")
}

/// Ordered node list: each controller followed by its computes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningPlan {
    nodes: Vec<NodeSpec>,
}

impl ProvisioningPlan {
    /// Build a plan from already-constructed nodes, checking well-formedness.
    pub fn new(nodes: Vec<NodeSpec>) -> Result<Self, ProvisionError> {
        let plan = Self { nodes };
        plan.check_well_formed()?;
        Ok(plan)
    }

    pub fn from_configurations(groups: &[ConfigurationConfig]) -> Result<Self, ProvisionError> {
        let mut nodes = Vec::new();
        for (i, group) in groups.iter().enumerate() {
            nodes.push(NodeSpec::controller(i, &group.controller));
            for (j, compute) in group.computes.iter().enumerate() {
                nodes.push(NodeSpec::compute(i, j, compute));
            }
        }
        Self::new(nodes)
    }

    fn check_well_formed(&self) -> Result<(), ProvisionError> {
        if !self.nodes.iter().any(|n| n.role == Role::Controller) {
            return Err(ProvisionError::Validation {
                message: "plan must contain at least one controller".into(),
            });
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ProvisionError::Validation {
                    message: format!("duplicate node id '{}'", node.id),
                });
            }
        }

        for node in &self.nodes {
            match (node.role, node.parent_controller_id.as_deref()) {
                (Role::Controller, Some(parent)) => {
                    return Err(ProvisionError::Validation {
                        message: format!(
                            "controller '{}' must not have a parent (got '{parent}')",
                            node.id
                        ),
                    });
                }
                (Role::Compute, None) => {
                    return Err(ProvisionError::Validation {
                        message: format!("compute '{}' has no parent controller", node.id),
                    });
                }
                (Role::Compute, Some(parent)) => {
                    let parent_is_controller = self
                        .nodes
                        .iter()
                        .any(|n| n.id == parent && n.role == Role::Controller);
                    if !parent_is_controller {
                        return Err(ProvisionError::Validation {
                            message: format!(
                                "compute '{}' refers to unknown controller '{parent}'",
                                node.id
                            ),
                        });
                    }
                }
                (Role::Controller, None) => {}
            }
        }

        Ok(())
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn controllers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.role == Role::Controller)
    }

    pub fn computes_of<'a>(&'a self, controller_id: &'a str) -> impl Iterator<Item = &'a NodeSpec> {
        self.nodes
            .iter()
            .filter(move |n| n.parent_controller_id.as_deref() == Some(controller_id))
    }

    /// One line per controller: `controller-0: controller-0-compute-0, …`.
    pub fn topology_lines(&self) -> Vec<String> {
        self.controllers()
            .map(|controller| {
                let computes: Vec<&str> =
                    self.computes_of(&controller.id).map(|n| n.id.as_str()).collect();
                if computes.is_empty() {
                    controller.id.clone()
                } else {
                    format!("{}: {}", controller.id, computes.join(", "))
                }
            })
            .collect()
    }

    /// The controller that carries the installation image and is started.
    pub fn install_controller(&self) -> Option<&NodeSpec> {
        self.controllers().next()
    }

    pub fn is_install_controller(&self, node: &NodeSpec) -> bool {
        self.install_controller().is_some_and(|c| c.id == node.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(cores: u32) -> NodeResourcesConfig {
        NodeResourcesConfig {
            partition_a_gb: 10,
            partition_b_gb: 20,
            memory_mb: 1024,
            cores,
        }
    }

    fn two_groups() -> Vec<ConfigurationConfig> {
        vec![
            ConfigurationConfig {
                controller: resources(2),
                computes: vec![resources(1), resources(1)],
            },
            ConfigurationConfig {
                controller: resources(2),
                computes: vec![],
            },
        ]
    }

    #[test]
    fn node_ids_follow_configuration_layout() {
        let plan = ProvisioningPlan::from_configurations(&two_groups()).unwrap();
        let ids: Vec<&str> = plan.nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "controller-0",
                "controller-0-compute-0",
                "controller-0-compute-1",
                "controller-1",
            ]
        );
    }

    #[test]
    fn computes_point_at_their_controller() {
        let plan = ProvisioningPlan::from_configurations(&two_groups()).unwrap();
        let computes: Vec<&str> = plan.computes_of("controller-0").map(|n| n.id.as_str()).collect();
        assert_eq!(computes, vec!["controller-0-compute-0", "controller-0-compute-1"]);
        assert_eq!(plan.computes_of("controller-1").count(), 0);
    }

    #[test]
    fn topology_lists_computes_under_their_controller() {
        let plan = ProvisioningPlan::from_configurations(&two_groups()).unwrap();
        assert_eq!(
            plan.topology_lines(),
            vec![
                "controller-0: controller-0-compute-0, controller-0-compute-1",
                "controller-1",
            ]
        );
    }

    #[test]
    fn first_controller_carries_the_image() {
        let plan = ProvisioningPlan::from_configurations(&two_groups()).unwrap();
        let install = plan.install_controller().unwrap();
        assert_eq!(install.id, "controller-0");
        assert!(plan.is_install_controller(&plan.nodes()[0]));
        assert!(!plan.is_install_controller(&plan.nodes()[3]));
    }

    #[test]
    fn disk_demand_sums_both_partitions() {
        let node = NodeSpec::controller(0, &resources(1));
        assert_eq!(node.disk_gb(), 30);
    }

    #[test]
    fn plan_without_controller_rejected() {
        let err = ProvisioningPlan::from_configurations(&[]).unwrap_err();
        assert!(err.to_string().contains("at least one controller"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let node = NodeSpec::controller(0, &resources(1));
        let err = ProvisioningPlan::new(vec![node.clone(), node]).unwrap_err();
        assert!(err.to_string().contains("duplicate node id"));
    }

    #[test]
    fn orphan_compute_rejected() {
        let controller = NodeSpec::controller(0, &resources(1));
        let orphan = NodeSpec::compute(3, 0, &resources(1));
        let err = ProvisioningPlan::new(vec![controller, orphan]).unwrap_err();
        assert!(err.to_string().contains("unknown controller 'controller-3'"));
    }

    #[test]
    fn zero_core_node_is_still_well_formed() {
        let plan = ProvisioningPlan::from_configurations(&[ConfigurationConfig {
            controller: resources(0),
            computes: vec![],
        }]);
        assert!(plan.is_ok());
    }
}

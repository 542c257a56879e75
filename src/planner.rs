//! Dependency ordering and gating within a project group.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::engine::{ContainerDetails, HealthState};
use crate::inventory::MonitoredContainer;

/// Topologically order a project group so dependencies come before their
/// dependents. Cycles are broken deterministically (name order) and logged.
pub fn topo_order(containers: &[MonitoredContainer]) -> Vec<usize> {
    let index_by_name: HashMap<&str, usize> = containers
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name(), i))
        .collect();

    // dependents[i] lists nodes that depend on i.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); containers.len()];
    let mut in_degree: Vec<usize> = vec![0; containers.len()];
    for (i, container) in containers.iter().enumerate() {
        for dep in &container.depends_on {
            if let Some(&j) = index_by_name.get(dep.as_str()) {
                dependents[j].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut ready: BTreeMap<&str, usize> = containers
        .iter()
        .enumerate()
        .filter(|(i, _)| in_degree[*i] == 0)
        .map(|(i, c)| (c.name(), i))
        .collect();
    let mut order = Vec::with_capacity(containers.len());
    let mut placed = vec![false; containers.len()];

    while order.len() < containers.len() {
        let first = ready.iter().next().map(|(&name, &i)| (name, i));
        let next = match first {
            Some((name, i)) => {
                ready.remove(name);
                i
            }
            None => {
                // Dependency cycle: force the smallest-named remaining node.
                let (name, i) = containers
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !placed[*i])
                    .map(|(i, c)| (c.name(), i))
                    .min()
                    .expect("unplaced node must exist");
                log::warn!("Dependency cycle involving {name}; breaking by name order");
                i
            }
        };
        placed[next] = true;
        order.push(next);
        for &dependent in &dependents[next] {
            if placed[dependent] {
                continue;
            }
            in_degree[dependent] = in_degree[dependent].saturating_sub(1);
            if in_degree[dependent] == 0 {
                ready.insert(containers[dependent].name(), dependent);
            }
        }
    }
    order
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    Ready,
    Unready { dependency: String, reason: String },
}

/// A container may act only when every declared dependency is running and
/// healthy (or has no healthcheck), and none of them failed earlier in the
/// current cycle.
pub fn dependency_gate(
    container: &MonitoredContainer,
    peers: &HashMap<String, ContainerDetails>,
    failed_this_cycle: &HashSet<String>,
) -> GateStatus {
    for dep in &container.depends_on {
        if failed_this_cycle.contains(dep) {
            return GateStatus::Unready {
                dependency: dep.clone(),
                reason: "dependency_unhealthy".to_string(),
            };
        }
        let Some(details) = peers.get(dep) else {
            return GateStatus::Unready {
                dependency: dep.clone(),
                reason: "dependency_missing".to_string(),
            };
        };
        if !details.running {
            return GateStatus::Unready {
                dependency: dep.clone(),
                reason: "dependency_not_running".to_string(),
            };
        }
        match details.health {
            HealthState::None | HealthState::Healthy => {}
            HealthState::Starting | HealthState::Unhealthy => {
                return GateStatus::Unready {
                    dependency: dep.clone(),
                    reason: "dependency_unhealthy".to_string(),
                };
            }
        }
    }
    GateStatus::Ready
}

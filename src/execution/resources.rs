//! Resource Ownership and Conflict Resolution
//!
//! Tracks which in-flight execution owns which resource id and decides
//! what happens when another execution wants the same resource:
//!
//! | Situation | Resolution |
//! |-----------|------------|
//! | no owner | `Allow` (ownership recorded) |
//! | requester already owns it, or one of its ancestors does | `Allow` |
//! | requester priority strictly higher | `Interrupt` (ownership transferred) |
//! | otherwise | `Queue` or `Reject`, per [`ConflictPolicy`] |
//!
//! At most one owner record exists per resource id. A claim covering
//! several resources is all-or-nothing.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::context::{Priority, RequestId};
use crate::config::{ConflictAction, ConflictPolicy};

/// Kind of contention detected on a resource.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// A different sequence at equal priority holds the resource.
    SameResource,
    /// A different sequence at higher priority holds the resource.
    PriorityConflict,
    /// Another instance of the same sequence holds the resource.
    InstanceConflict,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::SameResource => "SAME_RESOURCE",
            Self::PriorityConflict => "PRIORITY_CONFLICT",
            Self::InstanceConflict => "INSTANCE_CONFLICT",
        };
        f.write_str(text)
    }
}

/// Outcome of checking one resource.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Resolution {
    Allow,
    Reject,
    Queue,
    Interrupt,
}

/// Who holds a resource right now.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOwner {
    /// Plugin (or sequence name) that owns the execution
    pub symphony_name: String,
    pub instance_id: String,
    pub resource_id: String,
    pub acquired_at: DateTime<Utc>,
    pub priority: Priority,
    pub execution_id: RequestId,
    pub sequence_id: String,
}

/// Identity of an execution asking for resources.
#[derive(Debug, Clone)]
pub struct Claimant<'a> {
    pub execution_id: &'a RequestId,
    pub sequence_id: &'a str,
    pub symphony_name: &'a str,
    pub instance_id: &'a str,
    pub priority: Priority,
    /// Executions whose beats led to this request, nearest first
    pub ancestors: &'a [RequestId],
}

/// Result of evaluating a single resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub resolution: Resolution,
    pub conflict: Option<ConflictType>,
    pub owner: Option<RequestId>,
}

impl Decision {
    fn allow() -> Self {
        Self {
            resolution: Resolution::Allow,
            conflict: None,
            owner: None,
        }
    }
}

/// Result of an all-or-nothing claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Every resource is now held; these executions lost ownership.
    Granted { interrupted: Vec<RequestId> },
    /// At least one resource must be waited for.
    Queued {
        resource_id: String,
        owner: RequestId,
        conflict: ConflictType,
    },
    /// Policy refuses the request.
    Rejected {
        resource_id: String,
        owner: RequestId,
        conflict: ConflictType,
    },
}

/// Resource ownership map plus conflict policy.
#[derive(Debug, Default)]
pub struct ResourceManager {
    owners: HashMap<String, ResourceOwner>,
    policy: ConflictPolicy,
}

impl ResourceManager {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            owners: HashMap::new(),
            policy,
        }
    }

    pub fn set_policy(&mut self, policy: ConflictPolicy) {
        self.policy = policy;
    }

    /// Decides what a claim on `resource_id` would do, without claiming.
    pub fn evaluate(&self, resource_id: &str, claimant: &Claimant<'_>) -> Decision {
        let Some(owner) = self.owners.get(resource_id) else {
            return Decision::allow();
        };

        let reentrant = owner.execution_id == *claimant.execution_id
            || claimant.ancestors.contains(&owner.execution_id);
        if reentrant {
            return Decision::allow();
        }

        if claimant.priority.rank() > owner.priority.rank() {
            return Decision {
                resolution: Resolution::Interrupt,
                conflict: None,
                owner: Some(owner.execution_id.clone()),
            };
        }

        let conflict = if owner.sequence_id == claimant.sequence_id {
            ConflictType::InstanceConflict
        } else if owner.priority.rank() > claimant.priority.rank() {
            ConflictType::PriorityConflict
        } else {
            ConflictType::SameResource
        };

        let resolution = match self.policy.action_for(conflict) {
            ConflictAction::Queue => Resolution::Queue,
            ConflictAction::Reject => Resolution::Reject,
        };

        Decision {
            resolution,
            conflict: Some(conflict),
            owner: Some(owner.execution_id.clone()),
        }
    }

    /// Claims every resource in `resources` or none of them.
    pub fn claim(&mut self, resources: &[String], claimant: &Claimant<'_>) -> ClaimOutcome {
        let decisions: Vec<(&String, Decision)> = resources
            .iter()
            .map(|resource_id| (resource_id, self.evaluate(resource_id, claimant)))
            .collect();

        for wanted in [Resolution::Reject, Resolution::Queue] {
            if let Some((resource_id, decision)) =
                decisions.iter().find(|(_, d)| d.resolution == wanted)
            {
                let resource_id = (*resource_id).clone();
                let owner = decision.owner.clone().unwrap_or_else(|| RequestId::from(""));
                let conflict = decision.conflict.unwrap_or(ConflictType::SameResource);
                debug!(
                    "Claim by {} on '{}' resolved {:?} ({}) against {}",
                    claimant.execution_id, resource_id, wanted, conflict, owner
                );
                return if wanted == Resolution::Reject {
                    ClaimOutcome::Rejected {
                        resource_id,
                        owner,
                        conflict,
                    }
                } else {
                    ClaimOutcome::Queued {
                        resource_id,
                        owner,
                        conflict,
                    }
                };
            }
        }

        let mut interrupted: Vec<RequestId> = Vec::new();
        for (resource_id, decision) in decisions {
            if decision.resolution == Resolution::Allow && self.owners.contains_key(resource_id) {
                // Already held by the claimant or an ancestor.
                continue;
            }

            if decision.resolution == Resolution::Interrupt {
                if let Some(previous) = decision.owner {
                    info!(
                        "Execution {} interrupts {} on resource '{}'",
                        claimant.execution_id, previous, resource_id
                    );
                    if !interrupted.contains(&previous) {
                        interrupted.push(previous);
                    }
                }
            }

            self.owners.insert(
                resource_id.clone(),
                ResourceOwner {
                    symphony_name: claimant.symphony_name.to_string(),
                    instance_id: claimant.instance_id.to_string(),
                    resource_id: resource_id.clone(),
                    acquired_at: Utc::now(),
                    priority: claimant.priority,
                    execution_id: claimant.execution_id.clone(),
                    sequence_id: claimant.sequence_id.to_string(),
                },
            );
        }

        ClaimOutcome::Granted { interrupted }
    }

    /// Releases whatever `execution_id` still owns among `resources`.
    ///
    /// Resources owned by someone else (or no one) are left untouched, so
    /// releasing twice is a no-op.
    pub fn release(&mut self, execution_id: &RequestId, resources: &[String]) -> usize {
        let mut released = 0;
        for resource_id in resources {
            let owned = self
                .owners
                .get(resource_id)
                .is_some_and(|owner| owner.execution_id == *execution_id);
            if owned {
                self.owners.remove(resource_id);
                released += 1;
            }
        }

        if released > 0 {
            debug!("Execution {} released {} resource(s)", execution_id, released);
        }
        released
    }

    pub fn owner(&self, resource_id: &str) -> Option<&ResourceOwner> {
        self.owners.get(resource_id)
    }

    /// Resources currently held by `execution_id`, sorted.
    pub fn owned_by(&self, execution_id: &RequestId) -> Vec<String> {
        let mut owned: Vec<String> = self
            .owners
            .values()
            .filter(|owner| owner.execution_id == *execution_id)
            .map(|owner| owner.resource_id.clone())
            .collect();
        owned.sort();
        owned
    }

    /// Snapshot of every ownership record, keyed by resource id.
    pub fn ownership(&self) -> BTreeMap<String, ResourceOwner> {
        self.owners
            .iter()
            .map(|(id, owner)| (id.clone(), owner.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

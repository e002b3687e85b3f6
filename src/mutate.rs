//! Goal mutation: controlled edits to a goal's contract and type.
//!
//! Every mutation appends to the goal's immutable mutation history.
//! Deprecated goals reject all mutation. Freeze and thaw change the
//! mutation status and delegate the status edge to the transition service;
//! they never write `status` directly.

use serde_json::json;
use tracing::info;

use crate::contract::ContractValidator;
use crate::error::{Result, TelosError};
use crate::goal::{Goal, GoalStatus, GoalType, MutationKind, MutationStatus};
use crate::store::UnitOfWork;
use crate::transition::TransitionService;

/// Scalar-threshold step per strengthen/weaken.
const THRESHOLD_STEP: f64 = 0.05;

pub struct MutationService;

impl MutationService {
    /// Tighten the contract: higher pass bar, shorter timeout, smaller
    /// child budget (never below the children that already exist).
    pub fn strengthen(
        uow: &UnitOfWork<'_>,
        goal_id: &str,
        reason: &str,
        actor: &str,
    ) -> Result<Goal> {
        let mut goal = Self::mutable(uow, goal_id)?;
        let before = json!({
            "scalar_threshold": goal.contract.scalar_threshold(),
            "timeout_seconds": goal.contract.timeout_seconds,
            "max_subgoals": goal.contract.max_subgoals,
        });

        let threshold = (goal.contract.scalar_threshold() + THRESHOLD_STEP).min(0.95);
        goal.contract
            .resource_limits
            .insert("scalar_threshold".to_string(), threshold);
        goal.contract.timeout_seconds = (goal.contract.timeout_seconds * 3 / 4).max(60);
        let children = uow.count_children(goal_id)?;
        goal.contract.max_subgoals = goal.contract.max_subgoals.saturating_sub(1).max(children);

        ContractValidator::validate(&goal.contract)?;
        goal.record_mutation(MutationKind::Strengthen, reason, actor, json!({ "before": before }));
        Self::persist(uow, goal)
    }

    /// Loosen the contract: lower pass bar, longer timeout, one more child
    /// slot.
    pub fn weaken(uow: &UnitOfWork<'_>, goal_id: &str, reason: &str, actor: &str) -> Result<Goal> {
        let mut goal = Self::mutable(uow, goal_id)?;
        let before = json!({
            "scalar_threshold": goal.contract.scalar_threshold(),
            "timeout_seconds": goal.contract.timeout_seconds,
            "max_subgoals": goal.contract.max_subgoals,
        });

        let threshold = (goal.contract.scalar_threshold() - THRESHOLD_STEP).max(0.5);
        goal.contract
            .resource_limits
            .insert("scalar_threshold".to_string(), threshold);
        goal.contract.timeout_seconds = goal.contract.timeout_seconds.saturating_mul(3) / 2;
        goal.contract.max_subgoals += 1;

        ContractValidator::validate(&goal.contract)?;
        goal.record_mutation(MutationKind::Weaken, reason, actor, json!({ "before": before }));
        Self::persist(uow, goal)
    }

    /// Retype the goal. The old contract is discarded and a fresh default
    /// for the new type is synthesized at the goal's depth.
    pub fn change_type(
        uow: &UnitOfWork<'_>,
        goal_id: &str,
        new_type: GoalType,
        reason: &str,
        actor: &str,
    ) -> Result<Goal> {
        let mut goal = Self::mutable(uow, goal_id)?;
        if goal.goal_type == new_type {
            return Err(TelosError::InvalidOperation(format!(
                "goal {goal_id} is already {new_type}"
            )));
        }
        let old_type = goal.goal_type;
        goal.goal_type = new_type;
        goal.contract = ContractValidator::default_contract(new_type, goal.depth_level);
        goal.mutation_status = MutationStatus::Mutated;
        goal.record_mutation(
            MutationKind::ChangeType,
            reason,
            actor,
            json!({ "from": old_type.as_str(), "to": new_type.as_str() }),
        );
        info!("mutate: goal {goal_id} retyped {old_type} -> {new_type}");
        Self::persist(uow, goal)
    }

    /// Freeze: actions stop passing the contract gate, and the status edge
    /// is taken when one exists from the current state.
    pub fn freeze(uow: &UnitOfWork<'_>, goal_id: &str, reason: &str, actor: &str) -> Result<Goal> {
        let mut goal = Self::mutable(uow, goal_id)?;
        if goal.mutation_status == MutationStatus::Frozen {
            return Err(TelosError::InvalidOperation(format!(
                "goal {goal_id} is already frozen"
            )));
        }
        let edge_taken = if TransitionService::edge_allowed(goal.status, GoalStatus::Frozen) {
            TransitionService::transition(uow, goal_id, GoalStatus::Frozen, reason, actor, "mutation")?
                .applied()
        } else {
            false
        };
        // Re-read: the transition rewrote the row.
        if edge_taken {
            goal = uow.get_goal_for_update(goal_id)?;
        }
        goal.mutation_status = MutationStatus::Frozen;
        goal.record_mutation(
            MutationKind::Freeze,
            reason,
            actor,
            json!({ "status_edge_taken": edge_taken }),
        );
        Self::persist(uow, goal)
    }

    /// Thaw a frozen goal back to mutable, resuming work where the status
    /// edge allows it.
    pub fn thaw(uow: &UnitOfWork<'_>, goal_id: &str, reason: &str, actor: &str) -> Result<Goal> {
        let mut goal = Self::mutable(uow, goal_id)?;
        if goal.mutation_status != MutationStatus::Frozen {
            return Err(TelosError::InvalidOperation(format!(
                "goal {goal_id} is not frozen"
            )));
        }
        let edge_taken = if TransitionService::edge_allowed(goal.status, GoalStatus::Active) {
            TransitionService::transition(uow, goal_id, GoalStatus::Active, reason, actor, "mutation")?
                .applied()
        } else {
            false
        };
        if edge_taken {
            goal = uow.get_goal_for_update(goal_id)?;
        }
        goal.mutation_status = MutationStatus::Active;
        goal.record_mutation(
            MutationKind::Thaw,
            reason,
            actor,
            json!({ "status_edge_taken": edge_taken }),
        );
        Self::persist(uow, goal)
    }

    /// Take a goal out of service permanently. Terminal for mutation.
    pub fn deprecate(
        uow: &UnitOfWork<'_>,
        goal_id: &str,
        reason: &str,
        actor: &str,
    ) -> Result<Goal> {
        let mut goal = Self::mutable(uow, goal_id)?;
        goal.mutation_status = MutationStatus::Deprecated;
        goal.record_mutation(MutationKind::Freeze, reason, actor, json!({ "deprecated": true }));
        info!("mutate: goal {goal_id} deprecated: {reason}");
        Self::persist(uow, goal)
    }

    fn mutable(uow: &UnitOfWork<'_>, goal_id: &str) -> Result<Goal> {
        let goal = uow.get_goal_for_update(goal_id)?;
        if goal.mutation_status == MutationStatus::Deprecated {
            return Err(TelosError::InvalidOperation(format!(
                "goal {goal_id} is deprecated and immutable"
            )));
        }
        Ok(goal)
    }

    fn persist(uow: &UnitOfWork<'_>, mut goal: Goal) -> Result<Goal> {
        goal.updated_at = chrono::Utc::now();
        uow.update_goal(&goal)?;
        Ok(goal)
    }
}

//! Pure contract rules: default permission sets per goal type, structural
//! validation, and action gating.
//!
//! Nothing in here touches the store. Unknown goal types fail hard with no
//! fallback contract: silently degrading a permission set is worse than
//! refusing to build one.

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{Result, TelosError};
use crate::goal::{EvaluationMode, Goal, GoalContract, GoalType, MutationStatus, MAX_DEPTH};

pub struct ContractValidator;

impl ContractValidator {
    /// Default permission set for a goal of the given type at the given
    /// depth. Directional and meta goals are never executed directly; they
    /// steer, their children do the work.
    pub fn default_contract(goal_type: GoalType, depth_level: u32) -> GoalContract {
        let max_subgoals = match depth_level {
            0 => 5,
            1 => 4,
            2 => 3,
            _ => 0,
        };

        let (allowed, forbidden, evaluation_mode): (Vec<&str>, Vec<&str>, EvaluationMode) =
            match goal_type {
                GoalType::Achievable => (
                    vec!["decompose", "execute", "evaluate", "mutate"],
                    vec![],
                    EvaluationMode::Binary,
                ),
                GoalType::Continuous => (
                    vec!["decompose", "execute", "evaluate", "mutate"],
                    vec![],
                    EvaluationMode::Trend,
                ),
                GoalType::Directional => (
                    vec!["decompose", "evaluate", "mutate"],
                    vec!["execute"],
                    EvaluationMode::Trend,
                ),
                GoalType::Exploratory => (
                    vec!["decompose", "execute", "evaluate"],
                    vec![],
                    EvaluationMode::Scalar,
                ),
                GoalType::Meta => (
                    vec!["decompose", "evaluate", "mutate"],
                    vec!["execute"],
                    EvaluationMode::Scalar,
                ),
            };

        GoalContract {
            allowed_actions: allowed.into_iter().map(String::from).collect(),
            forbidden_actions: forbidden.into_iter().map(String::from).collect(),
            max_depth: MAX_DEPTH,
            max_subgoals,
            evaluation_mode,
            timeout_seconds: 600,
            resource_limits: HashMap::new(),
        }
    }

    /// String-keyed entry point for untrusted descriptors (oracle output,
    /// config). Fails for unknown types rather than returning a generic
    /// fallback, and persists nothing as a side effect.
    pub fn default_contract_for(goal_type: &str, depth_level: u32) -> Result<GoalContract> {
        let parsed = GoalType::from_str(goal_type)?;
        Ok(Self::default_contract(parsed, depth_level))
    }

    /// Structural validation of a contract, whatever its origin.
    pub fn validate(contract: &GoalContract) -> Result<()> {
        for action in &contract.allowed_actions {
            if contract.forbidden_actions.contains(action) {
                return Err(TelosError::ContractViolation(format!(
                    "action '{action}' is both allowed and forbidden"
                )));
            }
        }
        if contract.max_depth > MAX_DEPTH {
            return Err(TelosError::ContractViolation(format!(
                "max_depth {} exceeds tree limit {}",
                contract.max_depth, MAX_DEPTH
            )));
        }
        for (name, value) in &contract.resource_limits {
            if *value < 0.0 {
                return Err(TelosError::ContractViolation(format!(
                    "resource limit '{name}' is negative ({value})"
                )));
            }
        }
        Ok(())
    }

    /// Gate an action against a goal's contract and mutation status.
    pub fn can_execute_action(goal: &Goal, action: &str) -> Result<()> {
        match goal.mutation_status {
            MutationStatus::Frozen => {
                return Err(TelosError::ContractViolation(format!(
                    "goal {} is frozen, '{action}' denied",
                    goal.id
                )))
            }
            MutationStatus::Deprecated => {
                return Err(TelosError::ContractViolation(format!(
                    "goal {} is deprecated, '{action}' denied",
                    goal.id
                )))
            }
            MutationStatus::Active | MutationStatus::Mutated => {}
        }
        if !goal.contract.allows(action) {
            return Err(TelosError::ContractViolation(format!(
                "contract for goal {} ({}) does not permit '{action}'",
                goal.id, goal.goal_type
            )));
        }
        Ok(())
    }

    /// Children of `goal` would live at `goal.depth_level + 1`.
    pub fn check_depth_limit(goal: &Goal) -> Result<()> {
        if goal.depth_level + 1 > goal.contract.max_depth {
            return Err(TelosError::DepthLimitReached(format!(
                "goal {} at depth {} cannot take children (max_depth {})",
                goal.id, goal.depth_level, goal.contract.max_depth
            )));
        }
        Ok(())
    }

    /// Remaining subgoal budget given the current child count.
    pub fn check_subgoals_limit(goal: &Goal, existing_children: u32) -> Result<u32> {
        if existing_children >= goal.contract.max_subgoals {
            return Err(TelosError::SubgoalLimitReached(format!(
                "goal {} already has {existing_children} of {} allowed subgoals",
                goal.id, goal.contract.max_subgoals
            )));
        }
        Ok(goal.contract.max_subgoals - existing_children)
    }
}

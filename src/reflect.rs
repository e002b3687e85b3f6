//! Reflection over strict evaluation results.
//!
//! Reflection reads what execution and evaluation left behind, names a
//! cause, and recommends one action. It spawns follow-up goals (successor
//! cycles for continuous goals, remediation children for failures) but
//! never flips the reflected goal's status itself except for the one
//! degrading-trend case, where it freezes through the transition service.

use serde::Serialize;
use tracing::info;

use crate::contract::ContractValidator;
use crate::error::{Result, TelosError};
use crate::goal::{Goal, GoalStatus, GoalType, MutationKind};
use crate::store::UnitOfWork;
use crate::system_state::TrendDirection;
use crate::transition::TransitionService;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// The goal did what it set out to do; nothing further.
    Complete,
    /// Keep going as-is (continuous goals on a healthy trend).
    Continue,
    /// Remediation goals were spawned; work those.
    Adjust,
    /// The goal itself is miscalibrated; mutate it.
    Mutate,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reflection {
    pub goal_id: String,
    pub cause: String,
    pub recommended: RecommendedAction,
    pub spawned_goal_ids: Vec<String>,
    pub mutation_suggestion: Option<MutationKind>,
}

pub struct ReflectionService;

impl ReflectionService {
    /// Reflect on a goal that has a strict evaluation result.
    pub fn reflect(uow: &UnitOfWork<'_>, goal_id: &str, actor: &str) -> Result<Reflection> {
        let goal = uow.get_goal_for_update(goal_id)?;
        let Some(evaluation) = goal.evaluation_result.clone() else {
            return Err(TelosError::InvalidOperation(format!(
                "goal {goal_id} has never been strictly evaluated"
            )));
        };

        let reflection = if evaluation.passed {
            Self::on_success(uow, &goal, &evaluation.reasoning)?
        } else if Self::trend_is_degrading(uow, &goal)? {
            Self::on_degrading_trend(uow, &goal, actor)?
        } else {
            Self::on_failure(uow, &goal, &evaluation.reasoning)?
        };

        info!(
            "reflect: goal {goal_id} -> {:?} ({} spawned): {}",
            reflection.recommended,
            reflection.spawned_goal_ids.len(),
            reflection.cause
        );
        Ok(reflection)
    }

    /// Continuous goals get a successor cycle; everything else is simply
    /// complete.
    fn on_success(uow: &UnitOfWork<'_>, goal: &Goal, reasoning: &str) -> Result<Reflection> {
        if goal.goal_type != GoalType::Continuous {
            return Ok(Reflection {
                goal_id: goal.id.clone(),
                cause: format!("evaluation passed: {reasoning}"),
                recommended: RecommendedAction::Complete,
                spawned_goal_ids: vec![],
                mutation_suggestion: None,
            });
        }

        let contract = ContractValidator::default_contract(goal.goal_type, goal.depth_level);
        let successor = Goal::new(
            goal.title.clone(),
            format!("Successor cycle of {}: {}", goal.id, goal.description),
            goal.goal_type,
            None,
            goal.is_atomic,
            contract,
        )
        .with_domains(goal.domains.clone());
        let mut successor = successor;
        // Successor lives at the same tree position as the original.
        successor.parent_id = goal.parent_id.clone();
        successor.depth_level = goal.depth_level;
        uow.insert_goal(&successor)?;

        Ok(Reflection {
            goal_id: goal.id.clone(),
            cause: format!("continuous goal cycle succeeded: {reasoning}"),
            recommended: RecommendedAction::Continue,
            spawned_goal_ids: vec![successor.id],
            mutation_suggestion: None,
        })
    }

    /// Degrading trend on the goal's tracked entity: freeze and suggest a
    /// mutation rather than retrying into a headwind.
    fn on_degrading_trend(uow: &UnitOfWork<'_>, goal: &Goal, actor: &str) -> Result<Reflection> {
        if goal.status == GoalStatus::Active || goal.status == GoalStatus::Blocked {
            TransitionService::transition(
                uow,
                &goal.id,
                GoalStatus::Frozen,
                "tracked entity degrading; frozen pending mutation",
                actor,
                "reflection",
            )?;
        }
        Ok(Reflection {
            goal_id: goal.id.clone(),
            cause: "tracked entity is degrading".to_string(),
            recommended: RecommendedAction::Mutate,
            spawned_goal_ids: vec![],
            mutation_suggestion: Some(MutationKind::Weaken),
        })
    }

    /// Plain failure: spawn remediation children from the failed trace
    /// steps, within the child budget. No budget left means the goal itself
    /// needs mutating.
    fn on_failure(uow: &UnitOfWork<'_>, goal: &Goal, reasoning: &str) -> Result<Reflection> {
        let failures: Vec<String> = goal
            .execution_trace
            .failed_steps()
            .map(|s| format!("{}: {}", s.step, s.detail))
            .collect();
        let cause = if failures.is_empty() {
            format!("evaluation failed: {reasoning}")
        } else {
            format!("evaluation failed: {reasoning}; failed steps: {}", failures.join("; "))
        };

        if ContractValidator::check_depth_limit(goal).is_err() {
            return Ok(Reflection {
                goal_id: goal.id.clone(),
                cause,
                recommended: RecommendedAction::Mutate,
                spawned_goal_ids: vec![],
                mutation_suggestion: Some(MutationKind::Weaken),
            });
        }
        let existing = uow.count_children(&goal.id)?;
        let budget = match ContractValidator::check_subgoals_limit(goal, existing) {
            Ok(n) => n,
            Err(_) => {
                return Ok(Reflection {
                    goal_id: goal.id.clone(),
                    cause,
                    recommended: RecommendedAction::Mutate,
                    spawned_goal_ids: vec![],
                    mutation_suggestion: Some(MutationKind::Weaken),
                })
            }
        };

        let mut spawned = Vec::new();
        let reasons: Vec<String> = if failures.is_empty() {
            vec![reasoning.to_string()]
        } else {
            failures
        };
        for reason in reasons.iter().take(budget as usize) {
            let contract =
                ContractValidator::default_contract(GoalType::Achievable, goal.depth_level + 1);
            let child = Goal::new(
                format!("Remediate: {}", goal.title),
                format!("Address failure in {}: {reason}", goal.id),
                GoalType::Achievable,
                Some(goal),
                true,
                contract,
            )
            .with_domains(goal.domains.clone());
            uow.insert_goal(&child)?;
            spawned.push(child.id);
        }

        Ok(Reflection {
            goal_id: goal.id.clone(),
            cause,
            recommended: RecommendedAction::Adjust,
            spawned_goal_ids: spawned,
            mutation_suggestion: None,
        })
    }

    fn trend_is_degrading(uow: &UnitOfWork<'_>, goal: &Goal) -> Result<bool> {
        let Some(entity_name) = goal.domains.first() else {
            return Ok(false);
        };
        Ok(uow
            .get_system_entity(entity_name)?
            .map(|e| e.trend == TrendDirection::Degrading)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::{EvaluationMode, EvaluationResult, StepOutcome};
    use crate::store::Store;
    use crate::system_state::{EntityType, SystemStateService};
    use chrono::Utc;

    fn evaluated_goal(passed: bool, goal_type: GoalType) -> Goal {
        let contract = ContractValidator::default_contract(goal_type, 0);
        let mut goal = Goal::new("lift signups", "", goal_type, None, false, contract);
        goal.status = GoalStatus::Active;
        goal.evaluation_result = Some(EvaluationResult {
            passed,
            score: if passed { 1.0 } else { 0.2 },
            mode: EvaluationMode::Binary,
            reasoning: "test".into(),
            evaluated_at: Utc::now(),
        });
        goal
    }

    #[test]
    fn unevaluated_goal_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let contract = ContractValidator::default_contract(GoalType::Achievable, 0);
                let goal = Goal::new("g", "", GoalType::Achievable, None, true, contract);
                uow.insert_goal(&goal)?;
                assert!(matches!(
                    ReflectionService::reflect(uow, &goal.id, "t"),
                    Err(TelosError::InvalidOperation(_))
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn success_on_continuous_goal_spawns_successor() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let goal = evaluated_goal(true, GoalType::Continuous);
                uow.insert_goal(&goal)?;
                let reflection = ReflectionService::reflect(uow, &goal.id, "t")?;
                assert_eq!(reflection.recommended, RecommendedAction::Continue);
                assert_eq!(reflection.spawned_goal_ids.len(), 1);
                let successor = uow.get_goal_for_update(&reflection.spawned_goal_ids[0])?;
                assert_eq!(successor.status, GoalStatus::Pending);
                assert_eq!(successor.depth_level, goal.depth_level);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failure_spawns_remediation_children_from_failed_steps() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let mut goal = evaluated_goal(false, GoalType::Achievable);
                goal.execution_trace
                    .push("writer", StepOutcome::Failed, "draft rejected");
                uow.insert_goal(&goal)?;

                let reflection = ReflectionService::reflect(uow, &goal.id, "t")?;
                assert_eq!(reflection.recommended, RecommendedAction::Adjust);
                assert_eq!(reflection.spawned_goal_ids.len(), 1);
                let child = uow.get_goal_for_update(&reflection.spawned_goal_ids[0])?;
                assert_eq!(child.parent_id.as_deref(), Some(goal.id.as_str()));
                assert!(child.is_atomic);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn degrading_trend_freezes_and_suggests_mutation() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                SystemStateService::record(uow, "monthly_leads", EntityType::Metric, 145.0)?;
                SystemStateService::record(uow, "monthly_leads", EntityType::Metric, 120.0)?;

                let mut goal = evaluated_goal(false, GoalType::Directional);
                goal.domains = vec!["monthly_leads".into()];
                uow.insert_goal(&goal)?;

                let reflection = ReflectionService::reflect(uow, &goal.id, "t")?;
                assert_eq!(reflection.recommended, RecommendedAction::Mutate);
                assert_eq!(reflection.mutation_suggestion, Some(MutationKind::Weaken));
                assert_eq!(uow.get_goal_for_update(&goal.id)?.status, GoalStatus::Frozen);
                Ok(())
            })
            .unwrap();
    }
}

//! Safety constraints: hard ceilings on autonomous behavior.
//!
//! Constraints are stateless policy; only the persisted limit and enabled
//! flag live in the store. The current value of every ceiling is re-derived
//! from live rows at check time, never cached. A denial blocks one proposed
//! action instance and is logged with utilization context; the rule that
//! proposed the action stays enabled.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::store::UnitOfWork;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintType {
    MaxConcurrentGoals,
    MaxGoalsPerHour,
    MaxGoalsPerDay,
    MaxBudgetPerDay,
    MaxBudgetPerWeek,
    MaxActiveStrategies,
    MaxExperiments,
    MinActionCooldownMinutes,
    MaxRiskLevel,
}

impl ConstraintType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintType::MaxConcurrentGoals => "max_concurrent_goals",
            ConstraintType::MaxGoalsPerHour => "max_goals_per_hour",
            ConstraintType::MaxGoalsPerDay => "max_goals_per_day",
            ConstraintType::MaxBudgetPerDay => "max_budget_per_day",
            ConstraintType::MaxBudgetPerWeek => "max_budget_per_week",
            ConstraintType::MaxActiveStrategies => "max_active_strategies",
            ConstraintType::MaxExperiments => "max_experiments",
            ConstraintType::MinActionCooldownMinutes => "min_action_cooldown_minutes",
            ConstraintType::MaxRiskLevel => "max_risk_level",
        }
    }
}

impl std::str::FromStr for ConstraintType {
    type Err = crate::error::TelosError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "max_concurrent_goals" => Ok(ConstraintType::MaxConcurrentGoals),
            "max_goals_per_hour" => Ok(ConstraintType::MaxGoalsPerHour),
            "max_goals_per_day" => Ok(ConstraintType::MaxGoalsPerDay),
            "max_budget_per_day" => Ok(ConstraintType::MaxBudgetPerDay),
            "max_budget_per_week" => Ok(ConstraintType::MaxBudgetPerWeek),
            "max_active_strategies" => Ok(ConstraintType::MaxActiveStrategies),
            "max_experiments" => Ok(ConstraintType::MaxExperiments),
            "min_action_cooldown_minutes" => Ok(ConstraintType::MinActionCooldownMinutes),
            "max_risk_level" => Ok(ConstraintType::MaxRiskLevel),
            other => Err(crate::error::TelosError::InvalidOperation(format!(
                "unknown constraint type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConstraint {
    pub constraint_type: ConstraintType,
    pub limit: f64,
    pub enabled: bool,
}

/// A denial, with the utilization that caused it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyViolation {
    pub constraint_type: ConstraintType,
    pub limit: f64,
    pub current_value: f64,
    pub action: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a safety check: either clear, or carrying the violation that
/// blocked it.
#[derive(Debug, Clone)]
pub struct SafetyCheck {
    pub allowed: bool,
    pub violation: Option<SafetyViolation>,
}

impl SafetyCheck {
    fn clear() -> Self {
        Self {
            allowed: true,
            violation: None,
        }
    }

    fn blocked(violation: SafetyViolation) -> Self {
        Self {
            allowed: false,
            violation: Some(violation),
        }
    }
}

pub struct SafetyService;

impl SafetyService {
    /// Seed the default ceilings if none exist yet. Existing rows win.
    pub fn seed_defaults(uow: &UnitOfWork<'_>) -> Result<()> {
        let defaults = [
            (ConstraintType::MaxConcurrentGoals, 25.0),
            (ConstraintType::MaxGoalsPerHour, 20.0),
            (ConstraintType::MaxGoalsPerDay, 100.0),
            (ConstraintType::MaxBudgetPerDay, 50.0),
            (ConstraintType::MaxBudgetPerWeek, 200.0),
            (ConstraintType::MaxActiveStrategies, 5.0),
            (ConstraintType::MaxExperiments, 10.0),
            (ConstraintType::MinActionCooldownMinutes, 5.0),
            (ConstraintType::MaxRiskLevel, 0.7),
        ];
        for (constraint_type, limit) in defaults {
            if uow.get_constraint(constraint_type)?.is_none() {
                uow.upsert_constraint(&SafetyConstraint {
                    constraint_type,
                    limit,
                    enabled: true,
                })?;
            }
        }
        Ok(())
    }

    /// May the system create one more goal right now? Checks concurrency and
    /// rate ceilings plus the global risk level. "At or above the limit"
    /// blocks.
    pub fn can_create_goal(uow: &UnitOfWork<'_>) -> Result<SafetyCheck> {
        let now = Utc::now();
        let checks = [
            (
                ConstraintType::MaxConcurrentGoals,
                uow.count_in_flight_goals()? as f64,
            ),
            (
                ConstraintType::MaxGoalsPerHour,
                uow.count_goals_created_since(now - Duration::hours(1))? as f64,
            ),
            (
                ConstraintType::MaxGoalsPerDay,
                uow.count_goals_created_since(now - Duration::hours(24))? as f64,
            ),
        ];
        for (constraint_type, current) in checks {
            if let Some(check) =
                Self::enforce_ceiling(uow, constraint_type, current, "create_goal")?
            {
                return Ok(check);
            }
        }
        if let Some(risk) = uow.get_system_entity("risk_level")? {
            if let Some(check) = Self::enforce_ceiling(
                uow,
                ConstraintType::MaxRiskLevel,
                risk.current_value,
                "create_goal",
            )? {
                return Ok(check);
            }
        }
        Ok(SafetyCheck::clear())
    }

    /// May `amount` budget units be spent right now, given the day and week
    /// windows over the spend log?
    pub fn can_spend_budget(uow: &UnitOfWork<'_>, amount: f64) -> Result<SafetyCheck> {
        let now = Utc::now();
        let day_spend = uow.spend_since(now - Duration::hours(24))? + amount;
        if let Some(check) =
            Self::enforce_ceiling(uow, ConstraintType::MaxBudgetPerDay, day_spend, "spend_budget")?
        {
            return Ok(check);
        }
        let week_spend = uow.spend_since(now - Duration::days(7))? + amount;
        if let Some(check) = Self::enforce_ceiling(
            uow,
            ConstraintType::MaxBudgetPerWeek,
            week_spend,
            "spend_budget",
        )? {
            return Ok(check);
        }
        Ok(SafetyCheck::clear())
    }

    /// May another strategy be activated?
    pub fn can_activate_strategy(uow: &UnitOfWork<'_>) -> Result<SafetyCheck> {
        let current = uow.count_active_strategies()? as f64;
        match Self::enforce_ceiling(
            uow,
            ConstraintType::MaxActiveStrategies,
            current,
            "activate_strategy",
        )? {
            Some(check) => Ok(check),
            None => Ok(SafetyCheck::clear()),
        }
    }

    /// May another experiment (in-flight exploratory goal) be started?
    pub fn can_start_experiment(uow: &UnitOfWork<'_>) -> Result<SafetyCheck> {
        let current = uow.count_in_flight_exploratory_goals()? as f64;
        match Self::enforce_ceiling(
            uow,
            ConstraintType::MaxExperiments,
            current,
            "start_experiment",
        )? {
            Some(check) => Ok(check),
            None => Ok(SafetyCheck::clear()),
        }
    }

    /// Floor on the interval between autonomous actions, regardless of what
    /// any individual rule's cooldown says.
    pub fn can_act_now(
        uow: &UnitOfWork<'_>,
        last_action: Option<DateTime<Utc>>,
    ) -> Result<SafetyCheck> {
        let Some(last) = last_action else {
            return Ok(SafetyCheck::clear());
        };
        let Some(constraint) = uow.get_constraint(ConstraintType::MinActionCooldownMinutes)? else {
            return Ok(SafetyCheck::clear());
        };
        if !constraint.enabled {
            return Ok(SafetyCheck::clear());
        }
        let elapsed_minutes = (Utc::now() - last).num_seconds() as f64 / 60.0;
        if elapsed_minutes < constraint.limit {
            let violation = Self::log_violation(
                uow,
                constraint.constraint_type,
                constraint.limit,
                elapsed_minutes,
                "autonomous_action",
                format!("only {elapsed_minutes:.1}m since last autonomous action"),
            )?;
            return Ok(SafetyCheck::blocked(violation));
        }
        Ok(SafetyCheck::clear())
    }

    /// Check one ceiling. Disabled or missing constraints never block; a
    /// breach is logged and returned.
    fn enforce_ceiling(
        uow: &UnitOfWork<'_>,
        constraint_type: ConstraintType,
        current: f64,
        action: &str,
    ) -> Result<Option<SafetyCheck>> {
        let Some(constraint) = uow.get_constraint(constraint_type)? else {
            return Ok(None);
        };
        if !constraint.enabled || current < constraint.limit {
            return Ok(None);
        }
        let violation = Self::log_violation(
            uow,
            constraint_type,
            constraint.limit,
            current,
            action,
            format!(
                "{} at {current:.2} of {:.2}",
                constraint_type.as_str(),
                constraint.limit
            ),
        )?;
        Ok(Some(SafetyCheck::blocked(violation)))
    }

    fn log_violation(
        uow: &UnitOfWork<'_>,
        constraint_type: ConstraintType,
        limit: f64,
        current_value: f64,
        action: &str,
        detail: String,
    ) -> Result<SafetyViolation> {
        let violation = SafetyViolation {
            constraint_type,
            limit,
            current_value,
            action: action.to_string(),
            detail,
            created_at: Utc::now(),
        };
        uow.insert_safety_violation(&violation)?;
        warn!(
            "safety: blocked '{}': {} ({:.2}/{:.2})",
            violation.action,
            violation.detail,
            violation.current_value,
            violation.limit
        );
        Ok(violation)
    }

    /// Record an approved spend so future window checks see it.
    pub fn record_spend(uow: &UnitOfWork<'_>, amount: f64, purpose: &str) -> Result<()> {
        uow.insert_spend(amount, purpose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractValidator;
    use crate::goal::{Goal, GoalStatus, GoalType};
    use crate::store::{Store, UnitOfWork};

    fn ceiling(uow: &UnitOfWork<'_>, constraint_type: ConstraintType, limit: f64) {
        uow.upsert_constraint(&SafetyConstraint {
            constraint_type,
            limit,
            enabled: true,
        })
        .unwrap();
    }

    fn seed_goal(uow: &UnitOfWork<'_>, status: GoalStatus) {
        let contract = ContractValidator::default_contract(GoalType::Achievable, 0);
        let mut goal = Goal::new("seeded", "", GoalType::Achievable, None, true, contract);
        goal.status = status;
        uow.insert_goal(&goal).unwrap();
    }

    fn blocked_by(check: &SafetyCheck, constraint_type: ConstraintType) {
        assert!(!check.allowed);
        let violation = check.violation.as_ref().unwrap();
        assert_eq!(violation.constraint_type, constraint_type);
    }

    #[test]
    fn concurrency_ceiling_blocks_goal_creation() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                ceiling(uow, ConstraintType::MaxConcurrentGoals, 2.0);
                seed_goal(uow, GoalStatus::Active);
                seed_goal(uow, GoalStatus::Ongoing);

                let check = SafetyService::can_create_goal(uow)?;
                blocked_by(&check, ConstraintType::MaxConcurrentGoals);
                assert_eq!(uow.recent_safety_violations(10)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn hourly_rate_ceiling_blocks_goal_creation() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                ceiling(uow, ConstraintType::MaxGoalsPerHour, 2.0);
                seed_goal(uow, GoalStatus::Pending);
                seed_goal(uow, GoalStatus::Pending);

                let check = SafetyService::can_create_goal(uow)?;
                blocked_by(&check, ConstraintType::MaxGoalsPerHour);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn daily_rate_ceiling_blocks_goal_creation() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                // Hour ceiling high enough that the day ceiling is the one
                // that trips.
                ceiling(uow, ConstraintType::MaxGoalsPerHour, 10.0);
                ceiling(uow, ConstraintType::MaxGoalsPerDay, 3.0);
                for _ in 0..3 {
                    seed_goal(uow, GoalStatus::Pending);
                }

                let check = SafetyService::can_create_goal(uow)?;
                blocked_by(&check, ConstraintType::MaxGoalsPerDay);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn creation_is_allowed_under_every_ceiling() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                SafetyService::seed_defaults(uow)?;
                seed_goal(uow, GoalStatus::Active);

                let check = SafetyService::can_create_goal(uow)?;
                assert!(check.allowed);
                assert!(check.violation.is_none());
                assert!(uow.recent_safety_violations(10)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn day_budget_window_blocks_overspend() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                ceiling(uow, ConstraintType::MaxBudgetPerDay, 20.0);
                SafetyService::record_spend(uow, 15.0, "prior work")?;

                let check = SafetyService::can_spend_budget(uow, 10.0)?;
                blocked_by(&check, ConstraintType::MaxBudgetPerDay);
                assert!(SafetyService::can_spend_budget(uow, 4.0)?.allowed);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn week_budget_window_blocks_overspend() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                ceiling(uow, ConstraintType::MaxBudgetPerWeek, 20.0);
                SafetyService::record_spend(uow, 15.0, "prior work")?;

                let check = SafetyService::can_spend_budget(uow, 10.0)?;
                blocked_by(&check, ConstraintType::MaxBudgetPerWeek);
                assert!(SafetyService::can_spend_budget(uow, 4.0)?.allowed);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn action_cooldown_floor_gates_recent_actions() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                ceiling(uow, ConstraintType::MinActionCooldownMinutes, 5.0);

                assert!(SafetyService::can_act_now(uow, None)?.allowed);

                let recent = Utc::now() - Duration::minutes(1);
                let check = SafetyService::can_act_now(uow, Some(recent))?;
                blocked_by(&check, ConstraintType::MinActionCooldownMinutes);

                let stale = Utc::now() - Duration::minutes(6);
                assert!(SafetyService::can_act_now(uow, Some(stale))?.allowed);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn disabled_constraint_never_blocks() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                uow.upsert_constraint(&SafetyConstraint {
                    constraint_type: ConstraintType::MaxConcurrentGoals,
                    limit: 0.0,
                    enabled: false,
                })?;
                seed_goal(uow, GoalStatus::Active);

                let check = SafetyService::can_create_goal(uow)?;
                assert!(check.allowed);
                Ok(())
            })
            .unwrap();
    }
}

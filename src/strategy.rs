//! Strategies: hypotheses about what would move a system-state metric.
//!
//! A strategy starts as a hypothesis, gets activated, and is then evaluated
//! periodically: the observed delta on its target entity adjusts confidence
//! until the strategy completes, is paused, or is killed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TelosError};
use crate::store::UnitOfWork;
use crate::system_state::SystemStateEntity;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Hypothesis,
    Active,
    Paused,
    Killed,
    Completed,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Hypothesis => "hypothesis",
            StrategyStatus::Active => "active",
            StrategyStatus::Paused => "paused",
            StrategyStatus::Killed => "killed",
            StrategyStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for StrategyStatus {
    type Err = TelosError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hypothesis" => Ok(StrategyStatus::Hypothesis),
            "active" => Ok(StrategyStatus::Active),
            "paused" => Ok(StrategyStatus::Paused),
            "killed" => Ok(StrategyStatus::Killed),
            "completed" => Ok(StrategyStatus::Completed),
            other => Err(TelosError::InvalidOperation(format!(
                "unknown strategy status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeDirection {
    Increase,
    Decrease,
}

impl OutcomeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeDirection::Increase => "increase",
            OutcomeDirection::Decrease => "decrease",
        }
    }
}

impl std::str::FromStr for OutcomeDirection {
    type Err = TelosError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "increase" => Ok(OutcomeDirection::Increase),
            "decrease" => Ok(OutcomeDirection::Decrease),
            other => Err(TelosError::InvalidOperation(format!(
                "unknown outcome direction: {other}"
            ))),
        }
    }
}

/// What the strategy expects to happen to its target entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    pub target_entity: String,
    pub direction: OutcomeDirection,
    pub min_delta: f64,
    pub evaluation_period_days: u32,
    pub baseline_value: Option<f64>,
    pub current_value: Option<f64>,
    pub confidence_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub hypothesis: String,
    pub expected_outcome: ExpectedOutcome,
    pub status: StrategyStatus,
    pub confidence: f64,
    pub linked_goal_ids: Vec<String>,
    /// Start of the current evaluation period, set on every activation.
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Strategy {
    pub fn new(hypothesis: impl Into<String>, expected_outcome: ExpectedOutcome) -> Self {
        let now = Utc::now();
        Self {
            id: format!("strategy_{}", uuid::Uuid::new_v4()),
            hypothesis: hypothesis.into(),
            expected_outcome,
            status: StrategyStatus::Hypothesis,
            confidence: 0.5,
            linked_goal_ids: Vec::new(),
            activated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn delta_meets_expectation(&self, delta: f64) -> bool {
        match self.expected_outcome.direction {
            OutcomeDirection::Increase => delta >= self.expected_outcome.min_delta,
            OutcomeDirection::Decrease => delta <= -self.expected_outcome.min_delta,
        }
    }
}

pub struct StrategyService;

/// Confidence floor below which an active strategy is killed.
const KILL_FLOOR: f64 = 0.15;
/// Per-evaluation confidence adjustment.
const CONFIDENCE_STEP: f64 = 0.1;

impl StrategyService {
    /// Activate a hypothesis, snapshotting the baseline from the target
    /// entity if one exists. Activation (including reactivation from
    /// paused) restarts the evaluation period.
    pub fn activate(uow: &UnitOfWork<'_>, strategy_id: &str) -> Result<Strategy> {
        let mut strategy = uow
            .get_strategy(strategy_id)?
            .ok_or_else(|| TelosError::NotFound(format!("strategy {strategy_id}")))?;
        if strategy.status != StrategyStatus::Hypothesis
            && strategy.status != StrategyStatus::Paused
        {
            return Err(TelosError::InvalidOperation(format!(
                "strategy {strategy_id} is {}, cannot activate",
                strategy.status.as_str()
            )));
        }
        if let Some(entity) = uow.get_system_entity(&strategy.expected_outcome.target_entity)? {
            if strategy.expected_outcome.baseline_value.is_none() {
                strategy.expected_outcome.baseline_value = Some(entity.current_value);
            }
        }
        strategy.status = StrategyStatus::Active;
        strategy.activated_at = Some(Utc::now());
        strategy.updated_at = Utc::now();
        uow.update_strategy(&strategy)?;
        info!("strategy {} activated: {}", strategy.id, strategy.hypothesis);
        Ok(strategy)
    }

    /// Periodic evaluation: compare the observed delta against the expected
    /// outcome and adjust confidence. Completion requires both the expected
    /// movement and confidence at or above the threshold.
    pub fn evaluate(
        uow: &UnitOfWork<'_>,
        strategy_id: &str,
        entity: &SystemStateEntity,
    ) -> Result<Strategy> {
        let mut strategy = uow
            .get_strategy(strategy_id)?
            .ok_or_else(|| TelosError::NotFound(format!("strategy {strategy_id}")))?;
        if strategy.status != StrategyStatus::Active {
            return Ok(strategy);
        }

        let baseline = strategy
            .expected_outcome
            .baseline_value
            .unwrap_or(entity.current_value);
        let delta = entity.current_value - baseline;
        strategy.expected_outcome.current_value = Some(entity.current_value);

        if strategy.delta_meets_expectation(delta) {
            strategy.confidence = (strategy.confidence + CONFIDENCE_STEP).min(1.0);
        } else {
            strategy.confidence = (strategy.confidence - CONFIDENCE_STEP).max(0.0);
        }

        // The kill window runs from activation, not from the last write;
        // evaluating more often than the period must not reset it.
        let period_start = strategy.activated_at.unwrap_or(strategy.created_at);
        let period_elapsed = Utc::now()
            >= period_start
                + Duration::days(i64::from(strategy.expected_outcome.evaluation_period_days));

        if strategy.delta_meets_expectation(delta)
            && strategy.confidence >= strategy.expected_outcome.confidence_threshold
        {
            strategy.status = StrategyStatus::Completed;
            info!(
                "strategy {} completed (delta {delta:.2}, confidence {:.2})",
                strategy.id, strategy.confidence
            );
        } else if strategy.confidence <= KILL_FLOOR && period_elapsed {
            strategy.status = StrategyStatus::Killed;
            info!(
                "strategy {} killed (delta {delta:.2}, confidence {:.2})",
                strategy.id, strategy.confidence
            );
        }

        strategy.updated_at = Utc::now();
        uow.update_strategy(&strategy)?;
        Ok(strategy)
    }

    pub fn pause(uow: &UnitOfWork<'_>, strategy_id: &str) -> Result<Strategy> {
        let mut strategy = uow
            .get_strategy(strategy_id)?
            .ok_or_else(|| TelosError::NotFound(format!("strategy {strategy_id}")))?;
        if strategy.status == StrategyStatus::Active {
            strategy.status = StrategyStatus::Paused;
            strategy.updated_at = Utc::now();
            uow.update_strategy(&strategy)?;
        }
        Ok(strategy)
    }

    pub fn link_goal(uow: &UnitOfWork<'_>, strategy_id: &str, goal_id: &str) -> Result<()> {
        let mut strategy = uow
            .get_strategy(strategy_id)?
            .ok_or_else(|| TelosError::NotFound(format!("strategy {strategy_id}")))?;
        if !strategy.linked_goal_ids.iter().any(|id| id == goal_id) {
            strategy.linked_goal_ids.push(goal_id.to_string());
            strategy.updated_at = Utc::now();
            uow.update_strategy(&strategy)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::system_state::{EntityType, SystemStateService};

    fn strategy(direction: OutcomeDirection, min_delta: f64) -> Strategy {
        Strategy::new(
            "more outreach lifts leads",
            ExpectedOutcome {
                target_entity: "monthly_leads".into(),
                direction,
                min_delta,
                evaluation_period_days: 7,
                baseline_value: Some(100.0),
                current_value: None,
                confidence_threshold: 0.7,
            },
        )
    }

    #[test]
    fn increase_expectation_checks_sign_and_magnitude() {
        let s = strategy(OutcomeDirection::Increase, 10.0);
        assert!(s.delta_meets_expectation(12.0));
        assert!(!s.delta_meets_expectation(5.0));
        assert!(!s.delta_meets_expectation(-12.0));
    }

    #[test]
    fn decrease_expectation_mirrors() {
        let s = strategy(OutcomeDirection::Decrease, 10.0);
        assert!(s.delta_meets_expectation(-12.0));
        assert!(!s.delta_meets_expectation(-5.0));
        assert!(!s.delta_meets_expectation(12.0));
    }

    #[test]
    fn lifecycle_reaches_completed_when_the_delta_holds() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let s = strategy(OutcomeDirection::Increase, 10.0);
                uow.insert_strategy(&s)?;
                let active = StrategyService::activate(uow, &s.id)?;
                assert_eq!(active.status, StrategyStatus::Active);
                assert!(active.activated_at.is_some());

                let entity =
                    SystemStateService::record(uow, "monthly_leads", EntityType::Metric, 115.0)?;
                let first = StrategyService::evaluate(uow, &s.id, &entity)?;
                assert_eq!(first.status, StrategyStatus::Active);
                assert!((first.confidence - 0.6).abs() < 1e-9);

                let second = StrategyService::evaluate(uow, &s.id, &entity)?;
                assert_eq!(second.status, StrategyStatus::Completed);
                assert_eq!(second.expected_outcome.current_value, Some(115.0));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failing_strategy_is_killed_once_the_period_runs_out() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let s = strategy(OutcomeDirection::Increase, 10.0);
                uow.insert_strategy(&s)?;
                let mut active = StrategyService::activate(uow, &s.id)?;
                active.activated_at = Some(Utc::now() - Duration::days(8));
                uow.update_strategy(&active)?;

                // Four back-to-back evaluations: the period start must not
                // slide forward with each write.
                let entity =
                    SystemStateService::record(uow, "monthly_leads", EntityType::Metric, 95.0)?;
                let mut latest = active;
                for _ in 0..4 {
                    latest = StrategyService::evaluate(uow, &s.id, &entity)?;
                }
                assert_eq!(latest.status, StrategyStatus::Killed);
                assert!(latest.confidence <= KILL_FLOOR);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failing_strategy_inside_the_period_stays_active() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let s = strategy(OutcomeDirection::Increase, 10.0);
                uow.insert_strategy(&s)?;
                StrategyService::activate(uow, &s.id)?;

                let entity =
                    SystemStateService::record(uow, "monthly_leads", EntityType::Metric, 95.0)?;
                let mut latest = StrategyService::evaluate(uow, &s.id, &entity)?;
                for _ in 0..5 {
                    latest = StrategyService::evaluate(uow, &s.id, &entity)?;
                }
                assert_eq!(latest.status, StrategyStatus::Active);
                assert!(latest.confidence <= 0.0 + f64::EPSILON);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn pause_and_link_goal_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let s = strategy(OutcomeDirection::Increase, 10.0);
                uow.insert_strategy(&s)?;
                StrategyService::activate(uow, &s.id)?;

                let paused = StrategyService::pause(uow, &s.id)?;
                assert_eq!(paused.status, StrategyStatus::Paused);

                StrategyService::link_goal(uow, &s.id, "goal_a")?;
                StrategyService::link_goal(uow, &s.id, "goal_a")?;
                let stored = uow.get_strategy(&s.id)?.unwrap();
                assert_eq!(stored.linked_goal_ids, vec!["goal_a".to_string()]);

                // Reactivation from paused is allowed and restarts the period.
                let reactivated = StrategyService::activate(uow, &s.id)?;
                assert_eq!(reactivated.status, StrategyStatus::Active);
                Ok(())
            })
            .unwrap();
    }
}

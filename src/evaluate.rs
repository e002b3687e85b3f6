//! Goal evaluation: the strict path that gates transitions, and the lenient
//! advisory path that never does.
//!
//! Strict evaluation is deterministic and reads only the store: artifacts,
//! recorded progress, system-state trend. The lenient evaluator consults the
//! oracle for a plausibility read; its output is attached to nothing and
//! drives nothing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::decompose::Oracle;
use crate::error::Result;
use crate::execute::VerificationStatus;
use crate::goal::{EvaluationMode, EvaluationResult, Goal};
use crate::store::{Store, UnitOfWork};
use crate::system_state::TrendDirection;

// ── Strict evaluation ───────────────────────────────────────────────────────

pub struct StrictEvaluator;

impl StrictEvaluator {
    /// Evaluate a goal under its contract's mode. Missing evidence fails
    /// closed in every mode.
    pub fn assess(uow: &UnitOfWork<'_>, goal: &Goal) -> Result<EvaluationResult> {
        let mode = goal.contract.evaluation_mode;
        let (passed, score, reasoning) = match mode {
            EvaluationMode::Binary => Self::assess_binary(uow, goal)?,
            EvaluationMode::Scalar => Self::assess_scalar(goal),
            EvaluationMode::Trend => Self::assess_trend(uow, goal)?,
        };
        debug!(
            "strict eval: goal {} mode {} -> passed={passed} score={score:.2}",
            goal.id,
            mode.as_str()
        );
        Ok(EvaluationResult {
            passed,
            score,
            mode,
            reasoning,
            evaluated_at: Utc::now(),
        })
    }

    /// Binary: artifacts exist and every one passed verification.
    fn assess_binary(uow: &UnitOfWork<'_>, goal: &Goal) -> Result<(bool, f64, String)> {
        let artifacts = uow.artifacts_for(&goal.id)?;
        if artifacts.is_empty() {
            return Ok((false, 0.0, "no artifacts produced".to_string()));
        }
        let passed_count = artifacts
            .iter()
            .filter(|a| a.verification_status == VerificationStatus::Passed)
            .count();
        let score = passed_count as f64 / artifacts.len() as f64;
        if passed_count == artifacts.len() {
            Ok((
                true,
                1.0,
                format!("all {} artifacts verified", artifacts.len()),
            ))
        } else {
            Ok((
                false,
                score,
                format!(
                    "{} of {} artifacts verified",
                    passed_count,
                    artifacts.len()
                ),
            ))
        }
    }

    /// Scalar: recorded progress against the contract threshold.
    fn assess_scalar(goal: &Goal) -> (bool, f64, String) {
        let threshold = goal.contract.scalar_threshold();
        let score = goal.progress.clamp(0.0, 1.0);
        if score >= threshold {
            (
                true,
                score,
                format!("progress {score:.2} meets threshold {threshold:.2}"),
            )
        } else {
            (
                false,
                score,
                format!("progress {score:.2} below threshold {threshold:.2}"),
            )
        }
    }

    /// Trend: the goal's first domain names a system-state entity; a missing
    /// entity or a degrading trend fails.
    fn assess_trend(uow: &UnitOfWork<'_>, goal: &Goal) -> Result<(bool, f64, String)> {
        let Some(entity_name) = goal.domains.first() else {
            return Ok((
                false,
                0.0,
                "trend evaluation needs a domain naming a tracked entity".to_string(),
            ));
        };
        let Some(entity) = uow.get_system_entity(entity_name)? else {
            return Ok((
                false,
                0.0,
                format!("entity '{entity_name}' is not tracked"),
            ));
        };
        match entity.trend {
            TrendDirection::Improving => Ok((
                true,
                1.0,
                format!("'{entity_name}' is improving (delta {:.2})", entity.delta()),
            )),
            TrendDirection::Stable => Ok((
                true,
                0.5,
                format!("'{entity_name}' is stable"),
            )),
            TrendDirection::Degrading => Ok((
                false,
                0.0,
                format!("'{entity_name}' is degrading (delta {:.2})", entity.delta()),
            )),
        }
    }
}

// ── Lenient evaluation ──────────────────────────────────────────────────────

/// Advisory read from the oracle over whatever evidence a goal has. Stored
/// nowhere, compared against nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryReport {
    pub plausible: bool,
    pub score: f64,
    pub reasoning: String,
    pub gaps: Vec<String>,
}

pub struct LenientEvaluator {
    oracle: Arc<dyn Oracle>,
}

impl LenientEvaluator {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self { oracle }
    }

    pub async fn advise(&self, store: &Store, goal_id: &str) -> Result<AdvisoryReport> {
        let (goal, evidence) = store.with_uow(|uow| {
            let goal = uow.get_goal_for_update(goal_id)?;
            let evidence = uow
                .artifacts_for(goal_id)?
                .iter()
                .map(|a| format!("[{}] {}", a.kind, a.content))
                .collect::<Vec<_>>()
                .join("\n---\n");
            Ok((goal, evidence))
        })?;

        let reply = self
            .oracle
            .judge(&goal.title, &goal.description, &evidence)
            .await
            .map_err(|e| crate::error::TelosError::OracleFailure(e.to_string()))?;

        Ok(AdvisoryReport {
            plausible: reply.get("passed").and_then(|v| v.as_bool()).unwrap_or(false),
            score: reply.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0),
            reasoning: reply
                .get("reasoning")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            gaps: reply
                .get("gaps")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|g| g.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractValidator;
    use crate::execute::ArtifactRecord;
    use crate::goal::GoalType;
    use crate::store::Store;
    use crate::system_state::SystemStateService;

    fn goal_with_mode(mode: EvaluationMode, domains: Vec<String>) -> Goal {
        let mut contract = ContractValidator::default_contract(GoalType::Achievable, 3);
        contract.evaluation_mode = mode;
        Goal::new("g", "", GoalType::Achievable, None, true, contract).with_domains(domains)
    }

    #[test]
    fn binary_fails_without_artifacts() {
        let store = Store::open_in_memory().unwrap();
        let goal = goal_with_mode(EvaluationMode::Binary, vec![]);
        store
            .with_uow(|uow| {
                uow.insert_goal(&goal)?;
                let result = StrictEvaluator::assess(uow, &goal)?;
                assert!(!result.passed);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn binary_requires_every_artifact_verified() {
        let store = Store::open_in_memory().unwrap();
        let goal = goal_with_mode(EvaluationMode::Binary, vec![]);
        store
            .with_uow(|uow| {
                uow.insert_goal(&goal)?;
                uow.insert_artifact(&ArtifactRecord::new(
                    &goal.id,
                    "note",
                    "a",
                    VerificationStatus::Passed,
                ))?;
                uow.insert_artifact(&ArtifactRecord::new(
                    &goal.id,
                    "note",
                    "b",
                    VerificationStatus::Failed,
                ))?;
                let result = StrictEvaluator::assess(uow, &goal)?;
                assert!(!result.passed);
                assert!((result.score - 0.5).abs() < f64::EPSILON);

                uow.insert_artifact(&ArtifactRecord::new(
                    &goal.id,
                    "note",
                    "c",
                    VerificationStatus::Passed,
                ))?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn scalar_compares_progress_to_threshold() {
        let store = Store::open_in_memory().unwrap();
        let mut goal = goal_with_mode(EvaluationMode::Scalar, vec![]);
        goal.progress = 0.9;
        store
            .with_uow(|uow| {
                uow.insert_goal(&goal)?;
                let result = StrictEvaluator::assess(uow, &goal)?;
                assert!(result.passed);

                goal.progress = 0.5;
                let result = StrictEvaluator::assess(uow, &goal)?;
                assert!(!result.passed);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn trend_fails_on_missing_entity_and_degrading_trend() {
        let store = Store::open_in_memory().unwrap();
        let goal = goal_with_mode(EvaluationMode::Trend, vec!["monthly_leads".into()]);
        store
            .with_uow(|uow| {
                uow.insert_goal(&goal)?;
                let result = StrictEvaluator::assess(uow, &goal)?;
                assert!(!result.passed, "untracked entity must fail");

                SystemStateService::record(uow, "monthly_leads", crate::system_state::EntityType::Metric, 145.0)?;
                SystemStateService::record(uow, "monthly_leads", crate::system_state::EntityType::Metric, 120.0)?;
                let result = StrictEvaluator::assess(uow, &goal)?;
                assert!(!result.passed, "degrading trend must fail");

                SystemStateService::record(uow, "monthly_leads", crate::system_state::EntityType::Metric, 160.0)?;
                let result = StrictEvaluator::assess(uow, &goal)?;
                assert!(result.passed);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn lenient_report_is_advisory_only() {
        let store = Store::open_in_memory().unwrap();
        let goal = goal_with_mode(EvaluationMode::Binary, vec![]);
        store.with_uow(|uow| uow.insert_goal(&goal)).unwrap();

        let evaluator = LenientEvaluator::new(Arc::new(crate::decompose::HeuristicOracle));
        let report = evaluator.advise(&store, &goal.id).await.unwrap();
        assert!(!report.plausible, "no evidence should read as implausible");

        // Advisory runs leave the goal untouched.
        store
            .with_uow(|uow| {
                let g = uow.get_goal_for_update(&goal.id)?;
                assert!(g.evaluation_result.is_none());
                assert_eq!(g.status, crate::goal::GoalStatus::Pending);
                Ok(())
            })
            .unwrap();
    }
}

//! The autonomous governance loop.
//!
//! One observation drives one pass: record the value on its system-state
//! entity, evaluate the policy rules watching that entity, and push every
//! triggered action through the safety service before anything happens.
//! A safety denial drops the action and leaves the rule enabled; the rule's
//! trigger timestamp is only advanced for actions that actually ran.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contract::ContractValidator;
use crate::error::Result;
use crate::goal::Goal;
use crate::mutate::MutationService;
use crate::policy::{PolicyDecision, PolicyEngine};
use crate::safety::{SafetyCheck, SafetyService};
use crate::store::{Store, UnitOfWork};
use crate::strategy::StrategyService;
use crate::system_state::{EntityType, SystemStateService};

/// One reading from the outside world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub entity_name: String,
    pub entity_type: EntityType,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "result", content = "detail")]
pub enum ActionResult {
    Executed(String),
    DroppedBySafety(String),
    Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleOutcome {
    pub rule_name: String,
    pub action_type: String,
    pub result: ActionResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservationReport {
    pub entity_name: String,
    pub decisions: usize,
    pub outcomes: Vec<RuleOutcome>,
}

pub struct AutonomyService {
    actor: String,
    last_action: Option<DateTime<Utc>>,
}

impl AutonomyService {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            last_action: None,
        }
    }

    /// Ingest one observation and act on whatever it triggers. The whole
    /// pass is one unit of work: either the observation, its actions, and
    /// the trigger bookkeeping all land, or none do.
    pub fn observe(&mut self, store: &Store, observation: &Observation) -> Result<ObservationReport> {
        let last_action = self.last_action;
        let actor = self.actor.clone();

        let (report, acted_at) = store.with_uow(|uow| {
            let entity = SystemStateService::record(
                uow,
                &observation.entity_name,
                observation.entity_type,
                observation.value,
            )?;
            let decisions = PolicyEngine::evaluate(uow, &entity)?;

            let mut outcomes = Vec::new();
            let mut acted_at = None;
            for decision in &decisions {
                if !decision.triggered {
                    continue;
                }

                let gate = SafetyService::can_act_now(uow, last_action.or(acted_at))?;
                let result = if gate.allowed {
                    Self::dispatch(uow, decision, &actor)?
                } else {
                    ActionResult::DroppedBySafety(Self::denial_detail(&gate))
                };

                if let ActionResult::Executed(_) = result {
                    PolicyEngine::mark_triggered(uow, &decision.rule_name)?;
                    acted_at = Some(Utc::now());
                }
                outcomes.push(RuleOutcome {
                    rule_name: decision.rule_name.clone(),
                    action_type: decision.action_type.clone(),
                    result,
                });
            }

            Ok((
                ObservationReport {
                    entity_name: entity.entity_name,
                    decisions: decisions.len(),
                    outcomes,
                },
                acted_at,
            ))
        })?;

        if let Some(at) = acted_at {
            self.last_action = Some(at);
        }
        info!(
            "autonomy: {} -> {} decisions, {} acted on",
            report.entity_name,
            report.decisions,
            report
                .outcomes
                .iter()
                .filter(|o| matches!(o.result, ActionResult::Executed(_)))
                .count()
        );
        Ok(report)
    }

    /// Route one triggered decision through its safety gate and run it.
    fn dispatch(
        uow: &UnitOfWork<'_>,
        decision: &PolicyDecision,
        actor: &str,
    ) -> Result<ActionResult> {
        match decision.action_type.as_str() {
            "create_goal" => {
                let gate = SafetyService::can_create_goal(uow)?;
                if !gate.allowed {
                    return Ok(ActionResult::DroppedBySafety(Self::denial_detail(&gate)));
                }
                let goal = Self::goal_from_payload(decision)?;
                uow.insert_goal(&goal)?;
                Ok(ActionResult::Executed(format!("created goal {}", goal.id)))
            }
            "start_experiment" => {
                let gate = SafetyService::can_start_experiment(uow)?;
                if !gate.allowed {
                    return Ok(ActionResult::DroppedBySafety(Self::denial_detail(&gate)));
                }
                let mut goal = Self::goal_from_payload(decision)?;
                goal.goal_type = crate::goal::GoalType::Exploratory;
                goal.contract = ContractValidator::default_contract(goal.goal_type, 0);
                uow.insert_goal(&goal)?;
                Ok(ActionResult::Executed(format!(
                    "started experiment {}",
                    goal.id
                )))
            }
            "spend_budget" => {
                let amount = decision
                    .action_payload
                    .get("amount")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                let gate = SafetyService::can_spend_budget(uow, amount)?;
                if !gate.allowed {
                    return Ok(ActionResult::DroppedBySafety(Self::denial_detail(&gate)));
                }
                SafetyService::record_spend(uow, amount, &decision.rule_name)?;
                Ok(ActionResult::Executed(format!("spent {amount:.2} units")))
            }
            "activate_strategy" => {
                let Some(strategy_id) = decision
                    .action_payload
                    .get("strategy_id")
                    .and_then(|v| v.as_str())
                else {
                    return Ok(ActionResult::Skipped(
                        "payload missing 'strategy_id'".to_string(),
                    ));
                };
                let gate = SafetyService::can_activate_strategy(uow)?;
                if !gate.allowed {
                    return Ok(ActionResult::DroppedBySafety(Self::denial_detail(&gate)));
                }
                match StrategyService::activate(uow, strategy_id) {
                    Ok(strategy) => Ok(ActionResult::Executed(format!(
                        "activated strategy {}",
                        strategy.id
                    ))),
                    Err(crate::error::TelosError::NotFound(d))
                    | Err(crate::error::TelosError::InvalidOperation(d)) => {
                        Ok(ActionResult::Skipped(d))
                    }
                    Err(e) => Err(e),
                }
            }
            "freeze_goal" => {
                let Some(goal_id) = decision
                    .action_payload
                    .get("goal_id")
                    .and_then(|v| v.as_str())
                else {
                    return Ok(ActionResult::Skipped(
                        "payload missing 'goal_id'".to_string(),
                    ));
                };
                match MutationService::freeze(uow, goal_id, &decision.reason, actor) {
                    Ok(goal) => Ok(ActionResult::Executed(format!("froze goal {}", goal.id))),
                    // A stale payload must not abort the whole pass.
                    Err(crate::error::TelosError::NotFound(d))
                    | Err(crate::error::TelosError::InvalidOperation(d)) => {
                        Ok(ActionResult::Skipped(d))
                    }
                    Err(e) => Err(e),
                }
            }
            other => {
                warn!(
                    "autonomy: rule '{}' carries unknown action '{other}'",
                    decision.rule_name
                );
                Ok(ActionResult::Skipped(format!("unknown action '{other}'")))
            }
        }
    }

    fn goal_from_payload(decision: &PolicyDecision) -> Result<Goal> {
        let payload = &decision.action_payload;
        let title = payload
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or(&decision.rule_name)
            .to_string();
        let description = payload
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or(&decision.reason)
            .to_string();
        let goal_type = payload
            .get("goal_type")
            .and_then(|v| v.as_str())
            .unwrap_or("achievable");
        let contract = ContractValidator::default_contract_for(goal_type, 0)?;
        let goal = Goal::new(title, description, goal_type.parse()?, None, true, contract)
            .with_domains(vec![decision.entity_name.clone()]);
        Ok(goal)
    }

    fn denial_detail(gate: &SafetyCheck) -> String {
        gate.violation
            .as_ref()
            .map(|v| {
                format!(
                    "{}: {:.2} at limit {:.2}",
                    v.constraint_type.as_str(),
                    v.current_value,
                    v.limit
                )
            })
            .unwrap_or_else(|| "safety denied".to_string())
    }
}

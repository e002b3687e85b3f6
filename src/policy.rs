//! Policy rules and the deterministic engine that evaluates them.
//!
//! A rule names a system-state entity, a condition over its snapshot (for
//! example `delta < 0`), and an action to propose when the condition holds.
//! Triggering is gated by a per-rule cooldown: a rule that fired at `t` stays
//! quiet until `t + cooldown_minutes`, even if its condition remains true.
//! The engine only proposes; safety constraints decide.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TelosError};
use crate::store::UnitOfWork;
use crate::system_state::SystemStateEntity;

// ── Rule record ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    pub entity_name: String,
    pub entity_type: String,
    pub condition_expression: String,
    pub action_type: String,
    pub action_payload: serde_json::Value,
    pub priority: i64,
    pub cooldown_minutes: i64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl PolicyRule {
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.last_triggered {
            Some(t) => now < t + Duration::minutes(self.cooldown_minutes),
            None => false,
        }
    }
}

// ── Condition expressions ───────────────────────────────────────────────────

/// Left-hand side of a condition: a field of the entity snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionField {
    Delta,
    Value,
    PreviousValue,
    Trend,
    RollingAverage,
    Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionRhs {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    pub field: ConditionField,
    pub op: ConditionOp,
    pub rhs: ConditionRhs,
}

impl ConditionExpr {
    /// Parse `<field> <op> <literal>`, e.g. `delta < 0`,
    /// `trend == "degrading"`, `rolling_average >= 12.5`.
    pub fn parse(expr: &str) -> Result<Self> {
        let tokens: Vec<&str> = expr.split_whitespace().collect();
        if tokens.len() != 3 {
            return Err(TelosError::InvalidOperation(format!(
                "condition '{expr}' must be '<field> <op> <literal>'"
            )));
        }
        let field = match tokens[0] {
            "delta" => ConditionField::Delta,
            "value" | "current_value" => ConditionField::Value,
            "previous_value" => ConditionField::PreviousValue,
            "trend" => ConditionField::Trend,
            "rolling_average" => ConditionField::RollingAverage,
            "confidence" => ConditionField::Confidence,
            other => {
                return Err(TelosError::InvalidOperation(format!(
                    "unknown condition field '{other}'"
                )))
            }
        };
        let op = match tokens[1] {
            "<" => ConditionOp::Lt,
            "<=" => ConditionOp::Le,
            ">" => ConditionOp::Gt,
            ">=" => ConditionOp::Ge,
            "==" | "=" => ConditionOp::Eq,
            "!=" => ConditionOp::Ne,
            other => {
                return Err(TelosError::InvalidOperation(format!(
                    "unknown condition operator '{other}'"
                )))
            }
        };
        let raw = tokens[2].trim_matches(|c| c == '"' || c == '\'');
        let rhs = match raw.parse::<f64>() {
            Ok(n) => ConditionRhs::Number(n),
            Err(_) => ConditionRhs::Text(raw.to_string()),
        };
        if field == ConditionField::Trend && matches!(rhs, ConditionRhs::Number(_)) {
            return Err(TelosError::InvalidOperation(format!(
                "trend compares against a direction name, got '{raw}'"
            )));
        }
        Ok(Self { field, op, rhs })
    }

    /// Evaluate against a snapshot. Returns the verdict and a human-readable
    /// account of the comparison that was made.
    pub fn evaluate(&self, entity: &SystemStateEntity) -> (bool, String) {
        match self.field {
            ConditionField::Trend => {
                let actual = entity.trend.as_str();
                let expected = match &self.rhs {
                    ConditionRhs::Text(t) => t.as_str(),
                    ConditionRhs::Number(_) => "",
                };
                let met = match self.op {
                    ConditionOp::Eq => actual == expected,
                    ConditionOp::Ne => actual != expected,
                    _ => false,
                };
                (met, format!("trend is {actual}, compared to {expected}"))
            }
            _ => {
                let actual = match self.field {
                    ConditionField::Delta => entity.delta(),
                    ConditionField::Value => entity.current_value,
                    ConditionField::PreviousValue => entity.previous_value.unwrap_or(0.0),
                    ConditionField::RollingAverage => entity.rolling_average,
                    ConditionField::Confidence => entity.confidence,
                    ConditionField::Trend => unreachable!(),
                };
                let expected = match &self.rhs {
                    ConditionRhs::Number(n) => *n,
                    ConditionRhs::Text(_) => f64::NAN,
                };
                let met = match self.op {
                    ConditionOp::Lt => actual < expected,
                    ConditionOp::Le => actual <= expected,
                    ConditionOp::Gt => actual > expected,
                    ConditionOp::Ge => actual >= expected,
                    ConditionOp::Eq => (actual - expected).abs() < f64::EPSILON,
                    ConditionOp::Ne => (actual - expected).abs() >= f64::EPSILON,
                };
                (met, format!("observed {actual}, limit {expected}"))
            }
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// One proposed action instance, pre-safety-check.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub rule_name: String,
    pub entity_name: String,
    pub condition_met: bool,
    pub in_cooldown: bool,
    pub triggered: bool,
    pub reason: String,
    pub action_type: String,
    pub action_payload: serde_json::Value,
}

pub struct PolicyEngine;

impl PolicyEngine {
    /// Evaluate every enabled rule targeting `entity`, in priority order
    /// (lowest number first). Rules with unparseable conditions report an
    /// untriggered decision carrying the parse failure; a broken rule must
    /// not take the evaluation pass down with it.
    pub fn evaluate(
        uow: &UnitOfWork<'_>,
        entity: &SystemStateEntity,
    ) -> Result<Vec<PolicyDecision>> {
        let now = Utc::now();
        let rules = uow.enabled_rules_for_entity(&entity.entity_name)?;
        let mut decisions = Vec::with_capacity(rules.len());
        for rule in rules {
            let decision = match ConditionExpr::parse(&rule.condition_expression) {
                Ok(expr) => {
                    let (met, account) = expr.evaluate(entity);
                    let cooling = rule.in_cooldown(now);
                    PolicyDecision {
                        rule_name: rule.name.clone(),
                        entity_name: entity.entity_name.clone(),
                        condition_met: met,
                        in_cooldown: cooling,
                        triggered: met && !cooling,
                        reason: format!(
                            "{}: {} ({account})",
                            rule.name, rule.condition_expression
                        ),
                        action_type: rule.action_type.clone(),
                        action_payload: rule.action_payload.clone(),
                    }
                }
                Err(e) => PolicyDecision {
                    rule_name: rule.name.clone(),
                    entity_name: entity.entity_name.clone(),
                    condition_met: false,
                    in_cooldown: false,
                    triggered: false,
                    reason: format!("{}: unparseable condition: {e}", rule.name),
                    action_type: rule.action_type.clone(),
                    action_payload: rule.action_payload.clone(),
                },
            };
            debug!(
                "policy: rule '{}' condition_met={} cooldown={} triggered={}",
                decision.rule_name, decision.condition_met, decision.in_cooldown, decision.triggered
            );
            decisions.push(decision);
        }
        Ok(decisions)
    }

    /// Stamp the rule as having fired now. The only mutation a rule ever
    /// receives from the engine.
    pub fn mark_triggered(uow: &UnitOfWork<'_>, rule_name: &str) -> Result<()> {
        uow.touch_rule_trigger(rule_name, Utc::now())
    }
}

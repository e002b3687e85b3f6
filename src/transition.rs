//! Finite-state machine over goal status: the sole path to a status change.
//!
//! Edges not listed here are denied, full stop. Every attempt writes an
//! audit record whether it applied, was blocked by a domain rule, or was
//! denied outright.
//!
//! ```text
//! pending ──> active ──> done | blocked | incomplete | ongoing
//! active  ──> frozen          blocked ──> frozen
//! frozen  ──> active          ongoing ──> done | blocked
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::goal::{CompletionMode, Goal, GoalStatus};
use crate::store::UnitOfWork;

/// Typed outcome of a transition attempt. `Blocked` means the edge exists
/// but a domain rule said no; `Denied` means the edge does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Blocked(String),
    Denied(String),
}

impl TransitionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TransitionOutcome::Applied => "applied",
            TransitionOutcome::Blocked(_) => "blocked",
            TransitionOutcome::Denied(_) => "denied",
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionAudit {
    pub goal_id: String,
    pub from_status: GoalStatus,
    pub to_status: GoalStatus,
    pub outcome: String,
    pub reason: String,
    pub actor: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

pub struct TransitionService;

impl TransitionService {
    /// Is `from -> to` in the edge table at all?
    pub fn edge_allowed(from: GoalStatus, to: GoalStatus) -> bool {
        use GoalStatus::{Active, Blocked, Done, Frozen, Incomplete, Ongoing, Pending};
        matches!(
            (from, to),
            (Pending, Active)
                | (Active, Done)
                | (Active, Blocked)
                | (Active, Incomplete)
                | (Active, Ongoing)
                | (Active, Frozen)
                | (Blocked, Frozen)
                | (Frozen, Active)
                | (Ongoing, Done)
                | (Ongoing, Blocked)
        )
    }

    /// Attempt the transition under the open unit of work. Takes the row
    /// lock, applies the edge only if its domain rule holds, and writes an
    /// audit record regardless of outcome.
    pub fn transition(
        uow: &UnitOfWork<'_>,
        goal_id: &str,
        to: GoalStatus,
        reason: &str,
        actor: &str,
        source: &str,
    ) -> Result<TransitionOutcome> {
        let mut goal = uow.get_goal_for_update(goal_id)?;
        let from = goal.status;

        let outcome = if from == to {
            // Re-asserting the current state is a no-op blocked, not an error.
            TransitionOutcome::Blocked(format!("goal already {to}"))
        } else if !Self::edge_allowed(from, to) {
            TransitionOutcome::Denied(format!("no edge {from} -> {to}"))
        } else {
            match Self::domain_rule(uow, &goal, to)? {
                Some(rule_failure) => TransitionOutcome::Blocked(rule_failure),
                None => TransitionOutcome::Applied,
            }
        };

        if outcome.applied() {
            goal.status = to;
            if to == GoalStatus::Done {
                goal.progress = 1.0;
            }
            goal.updated_at = Utc::now();
            uow.update_goal(&goal)?;
            info!("transition: {goal_id} {from} -> {to} ({reason}) by {actor}");
        } else {
            warn!(
                "transition: {goal_id} {from} -> {to} {}: {reason}",
                outcome.label()
            );
        }

        uow.insert_transition_audit(&TransitionAudit {
            goal_id: goal_id.to_string(),
            from_status: from,
            to_status: to,
            outcome: outcome.label().to_string(),
            reason: match &outcome {
                TransitionOutcome::Applied => reason.to_string(),
                TransitionOutcome::Blocked(r) | TransitionOutcome::Denied(r) => {
                    format!("{reason}; {r}")
                }
            },
            actor: actor.to_string(),
            source: source.to_string(),
            created_at: Utc::now(),
        })?;

        Ok(outcome)
    }

    /// Domain rule for an edge that exists. `None` means the rule holds.
    fn domain_rule(uow: &UnitOfWork<'_>, goal: &Goal, to: GoalStatus) -> Result<Option<String>> {
        if to != GoalStatus::Done {
            return Ok(None);
        }
        match goal.completion_mode {
            CompletionMode::Manual => {
                if uow.get_approval(&goal.id)?.is_none() {
                    return Ok(Some(format!(
                        "goal {} requires a completion approval",
                        goal.id
                    )));
                }
            }
            CompletionMode::Aggregate => {
                // Vacuously satisfied for leaves; composites need every
                // child finished.
                let unfinished = uow
                    .children_of(&goal.id)?
                    .into_iter()
                    .filter(|c| c.status != GoalStatus::Done)
                    .count();
                if unfinished > 0 {
                    return Ok(Some(format!(
                        "goal {} has {unfinished} unfinished children",
                        goal.id
                    )));
                }
            }
            CompletionMode::Strict => {
                let passed = goal
                    .evaluation_result
                    .as_ref()
                    .map(|e| e.passed)
                    .unwrap_or(false);
                if !passed {
                    return Ok(Some(format!(
                        "goal {} has no passing strict evaluation",
                        goal.id
                    )));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractValidator;
    use crate::goal::{CompletionApproval, GoalType};
    use crate::store::Store;

    fn insert(uow: &UnitOfWork<'_>, status: GoalStatus) -> Goal {
        let contract = ContractValidator::default_contract(GoalType::Achievable, 3);
        let mut g = Goal::new("leaf", "", GoalType::Achievable, None, true, contract);
        g.status = status;
        uow.insert_goal(&g).unwrap();
        g
    }

    #[test]
    fn unlisted_edges_are_denied() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let g = insert(uow, GoalStatus::Pending);
                let outcome =
                    TransitionService::transition(uow, &g.id, GoalStatus::Done, "skip", "t", "test")?;
                assert!(matches!(outcome, TransitionOutcome::Denied(_)));
                // Audit row exists even for denials.
                let audits = uow.transition_audits_for(&g.id, 10)?;
                assert_eq!(audits.len(), 1);
                assert_eq!(audits[0].outcome, "denied");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn pending_to_active_applies() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let g = insert(uow, GoalStatus::Pending);
                let outcome = TransitionService::transition(
                    uow,
                    &g.id,
                    GoalStatus::Active,
                    "start",
                    "t",
                    "test",
                )?;
                assert!(outcome.applied());
                assert_eq!(uow.get_goal_for_update(&g.id)?.status, GoalStatus::Active);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn manual_done_requires_approval() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let contract = ContractValidator::default_contract(GoalType::Achievable, 0);
                let mut g = Goal::new("m", "", GoalType::Achievable, None, false, contract)
                    .with_completion_mode(CompletionMode::Manual);
                g.status = GoalStatus::Active;
                uow.insert_goal(&g)?;

                let outcome = TransitionService::transition(
                    uow,
                    &g.id,
                    GoalStatus::Done,
                    "finish",
                    "t",
                    "test",
                )?;
                assert!(matches!(outcome, TransitionOutcome::Blocked(_)));

                uow.insert_approval(&CompletionApproval {
                    goal_id: g.id.clone(),
                    approved_by: "human".into(),
                    authority_level: "admin".into(),
                    comment: String::new(),
                    approved_at: Utc::now(),
                })?;
                let outcome = TransitionService::transition(
                    uow,
                    &g.id,
                    GoalStatus::Done,
                    "finish",
                    "t",
                    "test",
                )?;
                assert!(outcome.applied());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn aggregate_done_needs_all_children_done() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let contract = ContractValidator::default_contract(GoalType::Achievable, 0);
                let mut parent = Goal::new("p", "", GoalType::Achievable, None, false, contract);
                parent.status = GoalStatus::Active;
                uow.insert_goal(&parent)?;

                let child_contract = ContractValidator::default_contract(GoalType::Achievable, 1);
                let mut child =
                    Goal::new("c", "", GoalType::Achievable, Some(&parent), true, child_contract);
                child.status = GoalStatus::Active;
                uow.insert_goal(&child)?;

                let outcome = TransitionService::transition(
                    uow,
                    &parent.id,
                    GoalStatus::Done,
                    "finish",
                    "t",
                    "test",
                )?;
                assert!(matches!(outcome, TransitionOutcome::Blocked(_)));

                child.status = GoalStatus::Done;
                uow.update_goal(&child)?;
                let outcome = TransitionService::transition(
                    uow,
                    &parent.id,
                    GoalStatus::Done,
                    "finish",
                    "t",
                    "test",
                )?;
                assert!(outcome.applied());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn freeze_and_thaw_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let g = insert(uow, GoalStatus::Active);
                assert!(TransitionService::transition(
                    uow,
                    &g.id,
                    GoalStatus::Frozen,
                    "hold",
                    "t",
                    "test"
                )?
                .applied());
                assert!(TransitionService::transition(
                    uow,
                    &g.id,
                    GoalStatus::Active,
                    "resume",
                    "t",
                    "test"
                )?
                .applied());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn transition_on_final_state_reports_blocked_not_error() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let g = insert(uow, GoalStatus::Done);
                let outcome = TransitionService::transition(
                    uow,
                    &g.id,
                    GoalStatus::Done,
                    "again",
                    "t",
                    "test",
                )?;
                assert!(matches!(outcome, TransitionOutcome::Blocked(_)));
                Ok(())
            })
            .unwrap();
    }
}

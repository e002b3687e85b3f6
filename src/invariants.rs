//! Invariant auditor: re-derives structural truths from the store and
//! reports. Strictly read-only; repairs belong to the progress aggregator
//! and to operators, never to the auditor.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::store::UnitOfWork;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Violation,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantFinding {
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub status: CheckStatus,
    pub offending_goal_ids: Vec<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub findings: Vec<InvariantFinding>,
}

impl AuditReport {
    pub fn clean(&self) -> bool {
        self.findings
            .iter()
            .all(|f| f.status == CheckStatus::Pass)
    }

    pub fn violations(&self) -> impl Iterator<Item = &InvariantFinding> {
        self.findings
            .iter()
            .filter(|f| f.status != CheckStatus::Pass)
    }
}

pub struct InvariantAuditor;

type CheckFn = fn(&UnitOfWork<'_>) -> Result<Vec<String>>;

/// The checks, in report order. Each re-derives its answer from the rows;
/// nothing is cached between runs, so a second audit over an unchanged
/// store yields the same report.
const CHECKS: &[(&str, &str, Severity, CheckFn)] = &[
    (
        "decomposed_goals_are_started",
        "a goal with children must not still be pending",
        Severity::Warning,
        |uow| uow.non_atomic_pending_with_children(),
    ),
    (
        "active_composites_have_children",
        "an active composite must have at least one child",
        Severity::Warning,
        |uow| uow.non_atomic_active_without_children(),
    ),
    (
        "aggregate_parents_track_children",
        "an aggregate parent whose children all finished must itself be done",
        Severity::Warning,
        |uow| uow.aggregate_parents_behind_children(),
    ),
    (
        "manual_done_has_approval",
        "a manual-mode done goal must have an approval record",
        Severity::Critical,
        |uow| uow.manual_done_without_approval(),
    ),
    (
        "atomic_goals_aggregate",
        "atomic goals carry aggregate completion mode",
        Severity::Warning,
        |uow| uow.atomic_non_aggregate(),
    ),
    (
        "done_parents_have_finished_children",
        "a done parent must not have unfinished children",
        Severity::Critical,
        |uow| uow.done_parents_with_unfinished_children(),
    ),
];

impl InvariantAuditor {
    /// Run every check. A failing query downgrades that check to `Error`
    /// instead of aborting the audit.
    pub fn audit(uow: &UnitOfWork<'_>) -> AuditReport {
        let mut findings = Vec::with_capacity(CHECKS.len());
        for (name, description, severity, check) in CHECKS {
            let finding = match check(uow) {
                Ok(ids) if ids.is_empty() => InvariantFinding {
                    name,
                    description,
                    severity: *severity,
                    status: CheckStatus::Pass,
                    offending_goal_ids: vec![],
                    detail: None,
                },
                Ok(ids) => {
                    warn!(
                        "invariant '{name}' violated by {} goals: {:?}",
                        ids.len(),
                        ids
                    );
                    InvariantFinding {
                        name,
                        description,
                        severity: *severity,
                        status: CheckStatus::Violation,
                        offending_goal_ids: ids,
                        detail: None,
                    }
                }
                Err(e) => {
                    warn!("invariant '{name}' could not be checked: {e}");
                    InvariantFinding {
                        name,
                        description,
                        severity: *severity,
                        status: CheckStatus::Error,
                        offending_goal_ids: vec![],
                        detail: Some(e.to_string()),
                    }
                }
            };
            findings.push(finding);
        }

        let report = AuditReport { findings };
        if report.clean() {
            info!("invariant audit clean ({} checks)", CHECKS.len());
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractValidator;
    use crate::goal::{CompletionMode, Goal, GoalStatus, GoalType};
    use crate::store::Store;

    fn composite(uow: &UnitOfWork<'_>, status: GoalStatus) -> Goal {
        let contract = ContractValidator::default_contract(GoalType::Achievable, 0);
        let mut g = Goal::new("parent", "", GoalType::Achievable, None, false, contract);
        g.status = status;
        uow.insert_goal(&g).unwrap();
        g
    }

    fn child_of(uow: &UnitOfWork<'_>, parent: &Goal, status: GoalStatus) -> Goal {
        let contract = ContractValidator::default_contract(GoalType::Achievable, 1);
        let mut g = Goal::new("child", "", GoalType::Achievable, Some(parent), true, contract);
        g.status = status;
        uow.insert_goal(&g).unwrap();
        g
    }

    #[test]
    fn empty_store_audits_clean() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                assert!(InvariantAuditor::audit(uow).clean());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn pending_parent_with_children_is_flagged() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let parent = composite(uow, GoalStatus::Pending);
                child_of(uow, &parent, GoalStatus::Pending);

                let report = InvariantAuditor::audit(uow);
                let finding = report
                    .findings
                    .iter()
                    .find(|f| f.name == "decomposed_goals_are_started")
                    .unwrap();
                assert_eq!(finding.status, CheckStatus::Violation);
                assert_eq!(finding.offending_goal_ids, vec![parent.id.clone()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn done_parent_with_unfinished_child_is_critical() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let parent = composite(uow, GoalStatus::Done);
                child_of(uow, &parent, GoalStatus::Active);

                let report = InvariantAuditor::audit(uow);
                let finding = report
                    .findings
                    .iter()
                    .find(|f| f.name == "done_parents_have_finished_children")
                    .unwrap();
                assert_eq!(finding.status, CheckStatus::Violation);
                assert_eq!(finding.severity, Severity::Critical);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn manual_done_without_approval_is_flagged() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let contract = ContractValidator::default_contract(GoalType::Achievable, 0);
                let mut g = Goal::new("m", "", GoalType::Achievable, None, false, contract)
                    .with_completion_mode(CompletionMode::Manual);
                g.status = GoalStatus::Done;
                uow.insert_goal(&g)?;

                let report = InvariantAuditor::audit(uow);
                let finding = report
                    .findings
                    .iter()
                    .find(|f| f.name == "manual_done_has_approval")
                    .unwrap();
                assert_eq!(finding.status, CheckStatus::Violation);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn audit_is_idempotent_over_unchanged_store() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let parent = composite(uow, GoalStatus::Pending);
                child_of(uow, &parent, GoalStatus::Pending);

                let first = InvariantAuditor::audit(uow);
                let second = InvariantAuditor::audit(uow);
                assert_eq!(
                    first.violations().count(),
                    second.violations().count()
                );
                Ok(())
            })
            .unwrap();
    }
}

//! Bulk transitions: one lock acquisition, per-goal outcomes.
//!
//! The id-set is locked in a single statement up front; goals the set names
//! that do not exist are reported, not fatal. One goal's refusal never
//! stops the rest, and the whole batch commits or rolls back together.

use serde::Serialize;
use std::collections::HashSet;
use tracing::info;

use crate::error::Result;
use crate::goal::GoalStatus;
use crate::store::UnitOfWork;
use crate::transition::{TransitionOutcome, TransitionService};

#[derive(Debug, Clone, Serialize)]
pub struct BulkItemResult {
    pub goal_id: String,
    pub outcome: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkTransitionReport {
    pub results: Vec<BulkItemResult>,
    pub missing: Vec<String>,
    pub applied: usize,
    pub blocked: usize,
    pub denied: usize,
}

pub struct BulkService;

impl BulkService {
    /// Attempt `to` on every goal in `ids` under the open unit of work.
    pub fn transition_many(
        uow: &UnitOfWork<'_>,
        ids: &[String],
        to: GoalStatus,
        reason: &str,
        actor: &str,
        source: &str,
    ) -> Result<BulkTransitionReport> {
        let locked = uow.bulk_get_for_update(ids)?;
        let found: HashSet<&str> = locked.iter().map(|g| g.id.as_str()).collect();

        let mut report = BulkTransitionReport::default();
        for id in ids {
            if !found.contains(id.as_str()) {
                report.missing.push(id.clone());
            }
        }

        for goal in &locked {
            let outcome = TransitionService::transition(uow, &goal.id, to, reason, actor, source)?;
            match &outcome {
                TransitionOutcome::Applied => report.applied += 1,
                TransitionOutcome::Blocked(_) => report.blocked += 1,
                TransitionOutcome::Denied(_) => report.denied += 1,
            }
            report.results.push(BulkItemResult {
                goal_id: goal.id.clone(),
                outcome: outcome.label().to_string(),
                reason: match outcome {
                    TransitionOutcome::Applied => None,
                    TransitionOutcome::Blocked(r) | TransitionOutcome::Denied(r) => Some(r),
                },
            });
        }

        info!(
            "bulk: {} -> {to}: {} applied, {} blocked, {} denied, {} missing",
            ids.len(),
            report.applied,
            report.blocked,
            report.denied,
            report.missing.len()
        );
        Ok(report)
    }
}

//! Bottom-up progress aggregation over the goal tree.
//!
//! Composites are visited deepest-first so every parent reads child
//! progress computed in the same pass. This is also where aggregate parents
//! whose children have all finished get their own done transition, through
//! the transition service like everyone else.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::goal::{CompletionMode, GoalStatus};
use crate::store::UnitOfWork;
use crate::transition::TransitionService;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressReport {
    /// Goals whose stored progress changed this pass.
    pub updated: Vec<String>,
    /// Aggregate parents transitioned to done this pass.
    pub completed: Vec<String>,
}

pub struct ProgressAggregator;

impl ProgressAggregator {
    pub fn aggregate(uow: &UnitOfWork<'_>, actor: &str) -> Result<ProgressReport> {
        let mut report = ProgressReport::default();

        for parent in uow.composites_deepest_first()? {
            let children = uow.children_of(&parent.id)?;
            if children.is_empty() {
                continue;
            }

            let progress =
                children.iter().map(|c| c.progress).sum::<f64>() / children.len() as f64;
            if (progress - parent.progress).abs() > f64::EPSILON {
                let mut updated = parent.clone();
                updated.progress = progress;
                updated.updated_at = chrono::Utc::now();
                uow.update_goal(&updated)?;
                debug!(
                    "progress: goal {} {:.2} -> {progress:.2}",
                    parent.id, parent.progress
                );
                report.updated.push(parent.id.clone());
            }

            let all_done = children.iter().all(|c| c.status == GoalStatus::Done);
            let can_finish = matches!(parent.status, GoalStatus::Active | GoalStatus::Ongoing);
            if all_done && can_finish && parent.completion_mode == CompletionMode::Aggregate {
                let outcome = TransitionService::transition(
                    uow,
                    &parent.id,
                    GoalStatus::Done,
                    "all children done",
                    actor,
                    "progress",
                )?;
                if outcome.applied() {
                    report.completed.push(parent.id.clone());
                }
            }
        }

        if !report.updated.is_empty() || !report.completed.is_empty() {
            info!(
                "progress: {} updated, {} completed",
                report.updated.len(),
                report.completed.len()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractValidator;
    use crate::goal::{Goal, GoalType};
    use crate::store::Store;

    fn composite(uow: &UnitOfWork<'_>, parent: Option<&Goal>, status: GoalStatus) -> Goal {
        let depth = parent.map(|p| p.depth_level + 1).unwrap_or(0);
        let contract = ContractValidator::default_contract(GoalType::Achievable, depth);
        let mut g = Goal::new("composite", "", GoalType::Achievable, parent, false, contract);
        g.status = status;
        uow.insert_goal(&g).unwrap();
        g
    }

    fn leaf(uow: &UnitOfWork<'_>, parent: &Goal, status: GoalStatus, progress: f64) -> Goal {
        let contract =
            ContractValidator::default_contract(GoalType::Achievable, parent.depth_level + 1);
        let mut g = Goal::new("leaf", "", GoalType::Achievable, Some(parent), true, contract);
        g.status = status;
        g.progress = progress;
        uow.insert_goal(&g).unwrap();
        g
    }

    #[test]
    fn parent_progress_is_mean_of_children() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let parent = composite(uow, None, GoalStatus::Active);
                leaf(uow, &parent, GoalStatus::Done, 1.0);
                leaf(uow, &parent, GoalStatus::Active, 0.5);

                ProgressAggregator::aggregate(uow, "t")?;
                let p = uow.get_goal_for_update(&parent.id)?;
                assert!((p.progress - 0.75).abs() < 1e-9);
                assert_eq!(p.status, GoalStatus::Active);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn finished_children_complete_the_aggregate_parent() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let parent = composite(uow, None, GoalStatus::Active);
                leaf(uow, &parent, GoalStatus::Done, 1.0);
                leaf(uow, &parent, GoalStatus::Done, 1.0);

                let report = ProgressAggregator::aggregate(uow, "t")?;
                assert_eq!(report.completed, vec![parent.id.clone()]);
                let p = uow.get_goal_for_update(&parent.id)?;
                assert_eq!(p.status, GoalStatus::Done);
                assert!((p.progress - 1.0).abs() < f64::EPSILON);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn completion_bubbles_up_two_levels_in_one_pass() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let root = composite(uow, None, GoalStatus::Active);
                let mid = composite(uow, Some(&root), GoalStatus::Active);
                leaf(uow, &mid, GoalStatus::Done, 1.0);

                let report = ProgressAggregator::aggregate(uow, "t")?;
                assert!(report.completed.contains(&mid.id));
                assert!(report.completed.contains(&root.id));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn pending_parent_is_not_force_completed() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                let parent = composite(uow, None, GoalStatus::Pending);
                leaf(uow, &parent, GoalStatus::Done, 1.0);

                let report = ProgressAggregator::aggregate(uow, "t")?;
                assert!(report.completed.is_empty());
                assert_eq!(uow.get_goal_for_update(&parent.id)?.status, GoalStatus::Pending);
                Ok(())
            })
            .unwrap();
    }
}

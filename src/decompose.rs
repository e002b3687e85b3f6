//! Oracle-driven decomposition of composite goals.
//!
//! The oracle is untrusted input: its reply is raw JSON until proven
//! otherwise, and anything malformed degrades to "mark the goal atomic"
//! rather than crashing or retrying forever. Contracts for the children are
//! always synthesized by the validator, never taken from the oracle.
//!
//! The oracle call happens with no transaction open; the unit of work that
//! writes the subgoals re-validates every precondition first, so a slow
//! oracle never pins the store lock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::contract::ContractValidator;
use crate::error::{Result, TelosError};
use crate::goal::{CompletionMode, Goal, GoalStatus, GoalType};
use crate::store::{Store, UnitOfWork};
use crate::transition::TransitionService;

// ── Oracle seam ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub goal_type: String,
    pub executable: bool,
    pub decomposable: bool,
}

#[derive(Debug, Clone)]
pub struct DecomposeRequest {
    pub title: String,
    pub description: String,
    pub domains: Vec<String>,
    pub max_subgoals: u32,
}

/// External non-deterministic classifier/decomposer. Implementations return
/// raw JSON from `decompose`; the service owns all parsing and degradation.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn classify(&self, title: &str, description: &str) -> anyhow::Result<Classification>;

    async fn decompose(&self, request: &DecomposeRequest) -> anyhow::Result<serde_json::Value>;

    /// Plausibility judgment over evidence, consumed only by the lenient
    /// evaluator. Advisory output; never drives a transition.
    async fn judge(
        &self,
        title: &str,
        description: &str,
        evidence: &str,
    ) -> anyhow::Result<serde_json::Value>;
}

/// One proposed child, as parsed out of the oracle's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgoalDescriptor {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_goal_type")]
    pub goal_type: String,
    #[serde(default)]
    pub is_atomic: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub completion_criteria: String,
    #[serde(default)]
    pub success_definition: String,
}

fn default_goal_type() -> String {
    "achievable".to_string()
}

/// Pull subgoal descriptors out of an untrusted oracle reply. The reply must
/// be an object with a non-empty `subgoals` array; descriptors that do not
/// deserialize are dropped with a warning.
pub fn parse_subgoals(reply: &serde_json::Value) -> Result<Vec<SubgoalDescriptor>> {
    let subgoals = reply
        .get("subgoals")
        .and_then(|v| v.as_array())
        .ok_or_else(|| TelosError::OracleFailure("reply has no 'subgoals' array".into()))?;
    if subgoals.is_empty() {
        return Err(TelosError::OracleFailure("'subgoals' array is empty".into()));
    }
    let mut descriptors = Vec::with_capacity(subgoals.len());
    for (i, raw) in subgoals.iter().enumerate() {
        match serde_json::from_value::<SubgoalDescriptor>(raw.clone()) {
            Ok(d) if !d.title.trim().is_empty() => descriptors.push(d),
            Ok(_) => warn!("decompose: dropping subgoal {i} with empty title"),
            Err(e) => warn!("decompose: dropping malformed subgoal {i}: {e}"),
        }
    }
    if descriptors.is_empty() {
        return Err(TelosError::OracleFailure(
            "no usable subgoal descriptors in reply".into(),
        ));
    }
    Ok(descriptors)
}

// ── Service ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecompositionOutcome {
    /// Children were created; the parent is now active.
    Decomposed { created: Vec<String> },
    /// The goal could not be decomposed and was marked atomic instead.
    MarkedAtomic { reason: String },
}

pub struct DecompositionService {
    oracle: Arc<dyn Oracle>,
    oracle_timeout: Duration,
}

impl DecompositionService {
    pub fn new(oracle: Arc<dyn Oracle>, oracle_timeout: Duration) -> Self {
        Self {
            oracle,
            oracle_timeout,
        }
    }

    /// Decompose a composite goal into children under its contract limits.
    pub async fn decompose(
        &self,
        store: &Store,
        goal_id: &str,
        actor: &str,
    ) -> Result<DecompositionOutcome> {
        // Precondition pass: cheap reads, and the early mark-atomic exits.
        let (goal, budget) = match store.with_uow(|uow| self.preconditions(uow, goal_id))? {
            PreconditionResult::Ready { goal, budget } => (goal, budget),
            PreconditionResult::MarkedAtomic { reason } => {
                return Ok(DecompositionOutcome::MarkedAtomic { reason })
            }
        };

        // Oracle I/O with no transaction open.
        let request = DecomposeRequest {
            title: goal.title.clone(),
            description: goal.description.clone(),
            domains: goal.domains.clone(),
            max_subgoals: budget,
        };
        let reply = match tokio::time::timeout(self.oracle_timeout, self.oracle.decompose(&request))
            .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                return store.with_uow(|uow| {
                    Self::mark_atomic(uow, goal_id, &format!("oracle error: {e}"))
                })
            }
            Err(_) => {
                return store.with_uow(|uow| {
                    Self::mark_atomic(
                        uow,
                        goal_id,
                        &format!("oracle timed out after {:?}", self.oracle_timeout),
                    )
                })
            }
        };

        let descriptors = match parse_subgoals(&reply) {
            Ok(d) => d,
            Err(e) => {
                return store
                    .with_uow(|uow| Self::mark_atomic(uow, goal_id, &format!("{e}")))
            }
        };

        // Write pass: re-validate everything before touching rows. The world
        // may have moved while the oracle was thinking.
        store.with_uow(|uow| {
            let goal = match self.preconditions(uow, goal_id)? {
                PreconditionResult::Ready { goal, .. } => goal,
                PreconditionResult::MarkedAtomic { reason } => {
                    return Ok(DecompositionOutcome::MarkedAtomic { reason })
                }
            };
            let existing = uow.count_children(&goal.id)?;
            let remaining = ContractValidator::check_subgoals_limit(&goal, existing)?;

            let mut created = Vec::new();
            for descriptor in descriptors.iter().take(remaining as usize) {
                let contract = match ContractValidator::default_contract_for(
                    &descriptor.goal_type,
                    goal.depth_level + 1,
                ) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(
                            "decompose: skipping subgoal '{}': {e}",
                            descriptor.title
                        );
                        continue;
                    }
                };
                ContractValidator::validate(&contract)?;
                let goal_type: GoalType = descriptor.goal_type.parse()?;
                let description = if descriptor.completion_criteria.is_empty() {
                    descriptor.description.clone()
                } else {
                    format!(
                        "{}\nCompletion criteria: {}",
                        descriptor.description, descriptor.completion_criteria
                    )
                };
                let child = Goal::new(
                    descriptor.title.clone(),
                    description,
                    goal_type,
                    Some(&goal),
                    descriptor.is_atomic,
                    contract,
                )
                .with_domains(if descriptor.domains.is_empty() {
                    goal.domains.clone()
                } else {
                    descriptor.domains.clone()
                });
                uow.insert_goal(&child)?;
                created.push(child.id);
            }

            if created.is_empty() {
                return Self::mark_atomic(uow, goal_id, "no valid subgoals synthesized");
            }

            if goal.status == GoalStatus::Pending {
                TransitionService::transition(
                    uow,
                    &goal.id,
                    GoalStatus::Active,
                    &format!("decomposed into {} subgoals", created.len()),
                    actor,
                    "decomposition",
                )?;
            }

            info!(
                "decompose: goal {goal_id} -> {} children (budget {remaining})",
                created.len()
            );
            Ok(DecompositionOutcome::Decomposed { created })
        })
    }

    /// Contract gate and depth check. A denial from either marks the goal
    /// atomic rather than leaving it stuck.
    fn preconditions(&self, uow: &UnitOfWork<'_>, goal_id: &str) -> Result<PreconditionResult> {
        let goal = uow.get_goal_for_update(goal_id)?;
        if goal.is_atomic {
            return Err(TelosError::InvalidOperation(format!(
                "goal {goal_id} is atomic; decomposition does not apply"
            )));
        }
        if goal.status.is_terminal() {
            return Err(TelosError::InvalidOperation(format!(
                "goal {goal_id} is {}; decomposition does not apply",
                goal.status
            )));
        }
        if let Err(e) = ContractValidator::can_execute_action(&goal, "decompose")
            .and_then(|()| ContractValidator::check_depth_limit(&goal))
        {
            if e.is_denial() {
                return Self::mark_atomic_inner(uow, goal_id, &format!("{e}"))
                    .map(|reason| PreconditionResult::MarkedAtomic { reason });
            }
            return Err(e);
        }
        let existing = uow.count_children(&goal.id)?;
        let budget = ContractValidator::check_subgoals_limit(&goal, existing)?;
        Ok(PreconditionResult::Ready { goal, budget })
    }

    fn mark_atomic(
        uow: &UnitOfWork<'_>,
        goal_id: &str,
        reason: &str,
    ) -> Result<DecompositionOutcome> {
        let reason = Self::mark_atomic_inner(uow, goal_id, reason)?;
        Ok(DecompositionOutcome::MarkedAtomic { reason })
    }

    fn mark_atomic_inner(uow: &UnitOfWork<'_>, goal_id: &str, reason: &str) -> Result<String> {
        let mut goal = uow.get_goal_for_update(goal_id)?;
        goal.is_atomic = true;
        goal.completion_mode = CompletionMode::Aggregate;
        uow.update_goal(&goal)?;
        warn!("decompose: goal {goal_id} marked atomic: {reason}");
        Ok(reason.to_string())
    }
}

enum PreconditionResult {
    Ready { goal: Goal, budget: u32 },
    MarkedAtomic { reason: String },
}

// ── Heuristic oracle ────────────────────────────────────────────────────────

/// Connective-splitting fallback oracle: no model in the loop, just the
/// title's own structure. Good enough to keep the pipeline moving when no
/// external oracle is wired in, and deterministic for tests.
pub struct HeuristicOracle;

const CONNECTIVES: [&str; 3] = [" and ", " then ", " after "];

#[async_trait]
impl Oracle for HeuristicOracle {
    async fn classify(&self, title: &str, _description: &str) -> anyhow::Result<Classification> {
        let lower = title.to_lowercase();
        let goal_type = if lower.contains("keep") || lower.contains("maintain") {
            "continuous"
        } else if lower.contains("explore") || lower.contains("research") {
            "exploratory"
        } else if lower.contains("improve") || lower.contains("increase") || lower.contains("reduce")
        {
            "directional"
        } else {
            "achievable"
        };
        let decomposable = CONNECTIVES.iter().any(|c| lower.contains(c)) || lower.contains(',');
        Ok(Classification {
            goal_type: goal_type.to_string(),
            executable: !decomposable,
            decomposable,
        })
    }

    async fn decompose(&self, request: &DecomposeRequest) -> anyhow::Result<serde_json::Value> {
        let lower = request.title.to_lowercase();
        let parts: Vec<&str> = if let Some(connective) =
            CONNECTIVES.iter().find(|c| lower.contains(*c))
        {
            lower.split(connective).collect()
        } else if lower.contains(';') {
            lower.split(';').collect()
        } else if lower.contains(',') {
            lower.split(',').collect()
        } else {
            vec![lower.as_str()]
        };

        let subgoals: Vec<serde_json::Value> = parts
            .into_iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .enumerate()
            .map(|(i, part)| {
                serde_json::json!({
                    "title": part,
                    "description": format!("Subtask {} of: {}", i + 1, request.title),
                    "goal_type": "achievable",
                    "is_atomic": true,
                    "domains": request.domains,
                })
            })
            .collect();

        Ok(serde_json::json!({
            "subgoals": subgoals,
            "reasoning": "split on connectives in the title",
        }))
    }

    async fn judge(
        &self,
        _title: &str,
        _description: &str,
        evidence: &str,
    ) -> anyhow::Result<serde_json::Value> {
        let has_evidence = !evidence.trim().is_empty();
        Ok(serde_json::json!({
            "passed": has_evidence,
            "score": if has_evidence { 0.6 } else { 0.1 },
            "reasoning": "judged on presence of evidence only",
            "gaps": if has_evidence { Vec::<String>::new() } else { vec!["no evidence".to_string()] },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::MAX_DEPTH;
    use crate::store::Store;

    /// Oracle returning a fixed reply, for pipeline tests.
    pub(crate) struct CannedOracle(pub serde_json::Value);

    #[async_trait]
    impl Oracle for CannedOracle {
        async fn classify(&self, _t: &str, _d: &str) -> anyhow::Result<Classification> {
            Ok(Classification {
                goal_type: "achievable".into(),
                executable: false,
                decomposable: true,
            })
        }
        async fn decompose(&self, _r: &DecomposeRequest) -> anyhow::Result<serde_json::Value> {
            Ok(self.0.clone())
        }
        async fn judge(&self, _t: &str, _d: &str, _e: &str) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({"passed": true, "score": 1.0, "reasoning": "", "gaps": []}))
        }
    }

    fn seed_composite(store: &Store, max_subgoals: u32) -> Goal {
        let mut contract =
            ContractValidator::default_contract(crate::goal::GoalType::Achievable, 0);
        contract.max_subgoals = max_subgoals;
        let goal = Goal::new("grow the newsletter", "", crate::goal::GoalType::Achievable, None, false, contract);
        store.with_uow(|uow| uow.insert_goal(&goal)).unwrap();
        goal
    }

    fn canned_subgoals(n: usize) -> serde_json::Value {
        let subgoals: Vec<_> = (0..n)
            .map(|i| {
                serde_json::json!({
                    "title": format!("step {i}"),
                    "goal_type": "achievable",
                    "is_atomic": true,
                })
            })
            .collect();
        serde_json::json!({ "subgoals": subgoals, "reasoning": "canned" })
    }

    #[tokio::test]
    async fn truncates_to_subgoal_budget() {
        let store = Store::open_in_memory().unwrap();
        let goal = seed_composite(&store, 3);
        let service = DecompositionService::new(
            Arc::new(CannedOracle(canned_subgoals(10))),
            Duration::from_secs(5),
        );
        let outcome = service.decompose(&store, &goal.id, "test").await.unwrap();
        match outcome {
            DecompositionOutcome::Decomposed { created } => assert_eq!(created.len(), 3),
            other => panic!("expected decomposition, got {other:?}"),
        }
        store
            .with_uow(|uow| {
                let parent = uow.get_goal_for_update(&goal.id)?;
                assert_eq!(parent.status, GoalStatus::Active);
                assert_eq!(uow.count_children(&goal.id)?, 3);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_oracle_reply_marks_goal_atomic() {
        let store = Store::open_in_memory().unwrap();
        let goal = seed_composite(&store, 3);
        let service = DecompositionService::new(
            Arc::new(CannedOracle(serde_json::json!("not even an object"))),
            Duration::from_secs(5),
        );
        let outcome = service.decompose(&store, &goal.id, "test").await.unwrap();
        assert!(matches!(outcome, DecompositionOutcome::MarkedAtomic { .. }));
        store
            .with_uow(|uow| {
                let g = uow.get_goal_for_update(&goal.id)?;
                assert!(g.is_atomic);
                assert_eq!(uow.count_children(&goal.id)?, 0);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn depth_limited_goal_marks_atomic_instead_of_sticking() {
        let store = Store::open_in_memory().unwrap();
        let mut contract =
            ContractValidator::default_contract(crate::goal::GoalType::Achievable, 0);
        contract.max_subgoals = 3;
        let mut goal =
            Goal::new("too deep", "", crate::goal::GoalType::Achievable, None, false, contract);
        goal.depth_level = MAX_DEPTH;
        goal.is_atomic = false;
        store.with_uow(|uow| uow.insert_goal(&goal)).unwrap();

        let service = DecompositionService::new(
            Arc::new(CannedOracle(canned_subgoals(2))),
            Duration::from_secs(5),
        );
        let outcome = service.decompose(&store, &goal.id, "test").await.unwrap();
        assert!(matches!(outcome, DecompositionOutcome::MarkedAtomic { .. }));
    }

    #[tokio::test]
    async fn unknown_subgoal_types_are_skipped_not_fatal() {
        let store = Store::open_in_memory().unwrap();
        let goal = seed_composite(&store, 5);
        let reply = serde_json::json!({
            "subgoals": [
                { "title": "good", "goal_type": "achievable", "is_atomic": true },
                { "title": "bad", "goal_type": "nonexistent_type", "is_atomic": true },
            ],
        });
        let service =
            DecompositionService::new(Arc::new(CannedOracle(reply)), Duration::from_secs(5));
        let outcome = service.decompose(&store, &goal.id, "test").await.unwrap();
        match outcome {
            DecompositionOutcome::Decomposed { created } => assert_eq!(created.len(), 1),
            other => panic!("expected decomposition, got {other:?}"),
        }
    }

    #[test]
    fn heuristic_oracle_splits_on_connectives() {
        let oracle = HeuristicOracle;
        let request = DecomposeRequest {
            title: "write the draft and publish the post".into(),
            description: String::new(),
            domains: vec![],
            max_subgoals: 5,
        };
        let reply = tokio_test::block_on(oracle.decompose(&request)).unwrap();
        let descriptors = parse_subgoals(&reply).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].title, "write the draft");
    }
}

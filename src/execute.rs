//! Execution of atomic goals through the skill registry.
//!
//! The pipeline owns three invariants: the skill call runs with no
//! transaction open, every attempt leaves a trace on the goal whatever the
//! outcome, and only a strict evaluation result (plus the completion gate)
//! decides the terminal transition. Skill failure never surfaces as an
//! error from `execute`; it lands the goal in `blocked` with the failure on
//! the trace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contract::ContractValidator;
use crate::error::{Result, TelosError};
use crate::evaluate::StrictEvaluator;
use crate::goal::{Goal, GoalStatus, StepOutcome};
use crate::store::{Store, UnitOfWork};
use crate::transition::TransitionService;

// ── Artifacts ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Passed,
    Failed,
    Partial,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Passed => "passed",
            VerificationStatus::Failed => "failed",
            VerificationStatus::Partial => "partial",
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VerificationStatus {
    type Err = TelosError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(VerificationStatus::Pending),
            "passed" => Ok(VerificationStatus::Passed),
            "failed" => Ok(VerificationStatus::Failed),
            "partial" => Ok(VerificationStatus::Partial),
            other => Err(TelosError::InvalidOperation(format!(
                "unknown verification status: {other}"
            ))),
        }
    }
}

/// Persisted evidence that a skill produced something for a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub goal_id: String,
    pub kind: String,
    pub content: String,
    pub verification_status: VerificationStatus,
    pub created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn new(
        goal_id: &str,
        kind: impl Into<String>,
        content: impl Into<String>,
        verification_status: VerificationStatus,
    ) -> Self {
        Self {
            id: format!("artifact_{}", Uuid::new_v4()),
            goal_id: goal_id.to_string(),
            kind: kind.into(),
            content: content.into(),
            verification_status,
            created_at: Utc::now(),
        }
    }
}

/// Artifact as proposed by a skill, before it is bound to a goal id.
#[derive(Debug, Clone)]
pub struct ArtifactDraft {
    pub kind: String,
    pub content: String,
    pub verification_status: VerificationStatus,
}

#[derive(Debug, Clone)]
pub struct SkillOutput {
    pub summary: String,
    pub artifacts: Vec<ArtifactDraft>,
}

/// Binds skill drafts to persistable records. Implementations may verify
/// content or push it to external storage; this runs with no transaction
/// open, so it is allowed to be slow.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    async fn prepare(
        &self,
        goal: &Goal,
        drafts: &[ArtifactDraft],
    ) -> anyhow::Result<Vec<ArtifactRecord>>;
}

/// Default registry: trusts the skill's own verification status.
pub struct PassthroughRegistry;

#[async_trait]
impl ArtifactRegistry for PassthroughRegistry {
    async fn prepare(
        &self,
        goal: &Goal,
        drafts: &[ArtifactDraft],
    ) -> anyhow::Result<Vec<ArtifactRecord>> {
        Ok(drafts
            .iter()
            .map(|d| ArtifactRecord::new(&goal.id, &d.kind, &d.content, d.verification_status))
            .collect())
    }
}

// ── Skills ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;

    /// Capability tags this skill can serve, e.g. "writing", "research".
    fn capabilities(&self) -> Vec<String>;

    async fn execute(&self, goal: &Goal) -> anyhow::Result<SkillOutput>;
}

/// Keyword table mapping goal text to capability tags. Order matters only
/// for readability; all matches are collected.
const CAPABILITY_KEYWORDS: &[(&str, &str)] = &[
    ("write", "writing"),
    ("draft", "writing"),
    ("document", "writing"),
    ("publish", "writing"),
    ("research", "research"),
    ("find", "research"),
    ("investigate", "research"),
    ("explore", "research"),
    ("code", "coding"),
    ("implement", "coding"),
    ("build", "coding"),
    ("fix", "coding"),
    ("email", "communication"),
    ("send", "communication"),
    ("message", "communication"),
    ("contact", "communication"),
    ("analyze", "analysis"),
    ("review", "analysis"),
    ("measure", "analysis"),
    ("compare", "analysis"),
    ("plan", "planning"),
    ("organize", "planning"),
    ("schedule", "planning"),
];

pub fn infer_capabilities(title: &str, description: &str) -> Vec<String> {
    let text = format!("{} {}", title.to_lowercase(), description.to_lowercase());
    let mut caps = Vec::new();
    for (keyword, capability) in CAPABILITY_KEYWORDS {
        if text.contains(keyword) && !caps.iter().any(|c: &String| c == capability) {
            caps.push((*capability).to_string());
        }
    }
    caps
}

/// Runs several skills in sequence and merges their output. Synthesized by
/// the registry when no single skill covers every inferred capability.
struct CompositeSkill {
    parts: Vec<Arc<dyn Skill>>,
}

#[async_trait]
impl Skill for CompositeSkill {
    fn name(&self) -> &str {
        "composite"
    }

    fn capabilities(&self) -> Vec<String> {
        let mut caps = Vec::new();
        for part in &self.parts {
            for c in part.capabilities() {
                if !caps.contains(&c) {
                    caps.push(c);
                }
            }
        }
        caps
    }

    async fn execute(&self, goal: &Goal) -> anyhow::Result<SkillOutput> {
        let mut summaries = Vec::new();
        let mut artifacts = Vec::new();
        for part in &self.parts {
            let output = part.execute(goal).await?;
            summaries.push(format!("[{}] {}", part.name(), output.summary));
            artifacts.extend(output.artifacts);
        }
        Ok(SkillOutput {
            summary: summaries.join("; "),
            artifacts,
        })
    }
}

/// Fallback skill: turns the goal description into a plan artifact so the
/// pipeline always has something to execute and evidence to evaluate.
pub struct PlannerSkill;

#[async_trait]
impl Skill for PlannerSkill {
    fn name(&self) -> &str {
        "planner"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["planning".to_string()]
    }

    async fn execute(&self, goal: &Goal) -> anyhow::Result<SkillOutput> {
        let mut plan = format!("# Plan: {}\n\n", goal.title);
        let source = if goal.description.is_empty() {
            goal.title.as_str()
        } else {
            goal.description.as_str()
        };
        for (i, line) in source
            .split(['.', '\n'])
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .enumerate()
        {
            plan.push_str(&format!("{}. {}\n", i + 1, line));
        }
        Ok(SkillOutput {
            summary: format!("drafted a plan for '{}'", goal.title),
            artifacts: vec![ArtifactDraft {
                kind: "plan".to_string(),
                content: plan,
                verification_status: VerificationStatus::Passed,
            }],
        })
    }
}

#[derive(Default)]
pub struct SkillRegistry {
    skills: Vec<Arc<dyn Skill>>,
    default_skill: Option<Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the planner fallback wired in.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.set_default(Arc::new(PlannerSkill));
        registry
    }

    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        self.skills.push(skill);
    }

    pub fn set_default(&mut self, skill: Arc<dyn Skill>) {
        self.default_skill = Some(skill);
    }

    /// Dispatch order: one skill covering every inferred capability, then a
    /// composite synthesized from partial matches, then a match on the
    /// goal's domains, then the default.
    pub fn resolve(&self, goal: &Goal) -> Option<Arc<dyn Skill>> {
        let wanted = infer_capabilities(&goal.title, &goal.description);

        if !wanted.is_empty() {
            if let Some(skill) = self.skills.iter().find(|s| {
                let caps = s.capabilities();
                wanted.iter().all(|w| caps.contains(w))
            }) {
                debug!("skill '{}' covers all capabilities {wanted:?}", skill.name());
                return Some(Arc::clone(skill));
            }

            let parts: Vec<Arc<dyn Skill>> = self
                .skills
                .iter()
                .filter(|s| {
                    let caps = s.capabilities();
                    wanted.iter().any(|w| caps.contains(w))
                })
                .cloned()
                .collect();
            if parts.len() > 1 {
                debug!("synthesizing composite of {} skills for {wanted:?}", parts.len());
                return Some(Arc::new(CompositeSkill { parts }));
            }
            if let Some(skill) = parts.into_iter().next() {
                return Some(skill);
            }
        }

        if let Some(skill) = self.skills.iter().find(|s| {
            let caps = s.capabilities();
            goal.domains.iter().any(|d| caps.contains(d))
        }) {
            return Some(Arc::clone(skill));
        }

        self.default_skill.clone()
    }
}

// ── Completion gate ─────────────────────────────────────────────────────────

/// Last check before a passing goal is committed as done. A veto freezes
/// the goal instead, inside the same unit of work.
pub trait CompletionGate: Send + Sync {
    /// `Some(reason)` vetoes completion.
    fn vet_completion(&self, uow: &UnitOfWork<'_>, goal: &Goal) -> Result<Option<String>>;
}

// ── Execution service ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Strict evaluation passed and the goal is done.
    Completed,
    /// Skill ran but evaluation failed; goal is incomplete.
    Incomplete(String),
    /// Skill failed, timed out, or no skill matched; goal is blocked.
    Blocked(String),
    /// Evaluation passed but the completion gate vetoed; goal is frozen.
    Frozen(String),
}

pub struct ExecutionService {
    registry: Arc<SkillRegistry>,
    artifacts: Arc<dyn ArtifactRegistry>,
    gate: Option<Arc<dyn CompletionGate>>,
}

impl ExecutionService {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self {
            registry,
            artifacts: Arc::new(PassthroughRegistry),
            gate: None,
        }
    }

    pub fn with_artifact_registry(mut self, artifacts: Arc<dyn ArtifactRegistry>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn CompletionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Run one atomic goal end to end. The goal's contract timeout bounds
    /// the skill call only; bookkeeping before and after is not on the
    /// clock.
    pub async fn execute(
        &self,
        store: &Store,
        goal_id: &str,
        actor: &str,
    ) -> Result<ExecutionOutcome> {
        // Admission: take the row, check the contract, start the goal.
        let goal = store.with_uow(|uow| {
            let mut goal = uow.get_goal_for_update(goal_id)?;
            if !goal.is_atomic {
                return Err(TelosError::InvalidOperation(format!(
                    "goal {goal_id} is composite; decompose it instead"
                )));
            }
            if goal.status != GoalStatus::Pending && goal.status != GoalStatus::Active {
                return Err(TelosError::InvalidOperation(format!(
                    "goal {goal_id} is {}; not executable",
                    goal.status
                )));
            }
            ContractValidator::can_execute_action(&goal, "execute")?;
            if goal.status == GoalStatus::Pending {
                TransitionService::transition(
                    uow,
                    goal_id,
                    GoalStatus::Active,
                    "execution started",
                    actor,
                    "execution",
                )?;
                goal = uow.get_goal_for_update(goal_id)?;
            }
            Ok(goal)
        })?;

        let Some(skill) = self.registry.resolve(&goal) else {
            return store.with_uow(|uow| {
                Self::record_failure(uow, goal_id, "selection", "no skill matched", actor)
            });
        };
        let skill_name = skill.name().to_string();
        info!("execute: goal {goal_id} via skill '{skill_name}'");

        // Skill I/O outside the transaction, bounded by the contract.
        let timeout = Duration::from_secs(goal.contract.timeout_seconds);
        let result = tokio::time::timeout(timeout, skill.execute(&goal)).await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let detail = format!("skill '{skill_name}' error: {e}");
                return store.with_uow(|uow| {
                    Self::record_failure(uow, goal_id, "execute_skill", &detail, actor)
                });
            }
            Err(_) => {
                let detail = format!("skill '{skill_name}' timed out after {timeout:?}");
                return store.with_uow(|uow| {
                    Self::record_failure(uow, goal_id, "execute_skill", &detail, actor)
                });
            }
        };

        // Artifact binding may verify or export content; also off-clock and
        // off-transaction.
        let records = match self.artifacts.prepare(&goal, &output.artifacts).await {
            Ok(records) => records,
            Err(e) => {
                let detail = format!("artifact registration failed: {e}");
                return store.with_uow(|uow| {
                    Self::record_failure(uow, goal_id, "artifacts", &detail, actor)
                });
            }
        };

        store.with_uow(|uow| {
            let mut goal = uow.get_goal_for_update(goal_id)?;
            goal.execution_trace
                .push(&skill_name, StepOutcome::Ok, output.summary.clone());

            for record in &records {
                uow.insert_artifact(record)?;
            }
            goal.execution_trace.push(
                "artifacts",
                StepOutcome::Ok,
                format!("registered {} artifacts", records.len()),
            );

            let evaluation = StrictEvaluator::assess(uow, &goal)?;
            goal.execution_trace.push(
                "evaluation",
                if evaluation.passed {
                    StepOutcome::Ok
                } else {
                    StepOutcome::Failed
                },
                evaluation.reasoning.clone(),
            );
            let passed = evaluation.passed;
            let score = evaluation.score;
            let reasoning = evaluation.reasoning.clone();
            goal.evaluation_result = Some(evaluation);

            if !passed {
                goal.progress = score.clamp(0.0, 1.0);
                goal.updated_at = Utc::now();
                uow.update_goal(&goal)?;
                TransitionService::transition(
                    uow,
                    goal_id,
                    GoalStatus::Incomplete,
                    &format!("evaluation failed: {reasoning}"),
                    actor,
                    "execution",
                )?;
                return Ok(ExecutionOutcome::Incomplete(reasoning));
            }

            if let Some(gate) = &self.gate {
                if let Some(veto) = gate.vet_completion(uow, &goal)? {
                    goal.execution_trace
                        .push("completion_gate", StepOutcome::Failed, veto.clone());
                    goal.updated_at = Utc::now();
                    uow.update_goal(&goal)?;
                    TransitionService::transition(
                        uow,
                        goal_id,
                        GoalStatus::Frozen,
                        &format!("completion vetoed: {veto}"),
                        actor,
                        "execution",
                    )?;
                    warn!("execute: goal {goal_id} frozen by completion gate: {veto}");
                    return Ok(ExecutionOutcome::Frozen(veto));
                }
            }

            goal.updated_at = Utc::now();
            uow.update_goal(&goal)?;
            let outcome = TransitionService::transition(
                uow,
                goal_id,
                GoalStatus::Done,
                "evaluation passed",
                actor,
                "execution",
            )?;
            if !outcome.applied() {
                // A domain rule (manual approval, strict gate) can still say
                // no; surface that as incomplete rather than lying.
                return Ok(ExecutionOutcome::Incomplete(format!(
                    "completion withheld: {}",
                    outcome.label()
                )));
            }
            Ok(ExecutionOutcome::Completed)
        })
    }

    /// Trace the failure and move the goal to blocked.
    fn record_failure(
        uow: &UnitOfWork<'_>,
        goal_id: &str,
        step: &str,
        detail: &str,
        actor: &str,
    ) -> Result<ExecutionOutcome> {
        let mut goal = uow.get_goal_for_update(goal_id)?;
        goal.execution_trace.push(step, StepOutcome::Failed, detail);
        goal.updated_at = Utc::now();
        uow.update_goal(&goal)?;
        TransitionService::transition(
            uow,
            goal_id,
            GoalStatus::Blocked,
            detail,
            actor,
            "execution",
        )?;
        warn!("execute: goal {goal_id} blocked at {step}: {detail}");
        Ok(ExecutionOutcome::Blocked(detail.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::GoalType;

    struct FixedSkill {
        name: &'static str,
        caps: Vec<String>,
        fail: bool,
    }

    #[async_trait]
    impl Skill for FixedSkill {
        fn name(&self) -> &str {
            self.name
        }
        fn capabilities(&self) -> Vec<String> {
            self.caps.clone()
        }
        async fn execute(&self, goal: &Goal) -> anyhow::Result<SkillOutput> {
            if self.fail {
                anyhow::bail!("simulated failure");
            }
            Ok(SkillOutput {
                summary: format!("{} handled '{}'", self.name, goal.title),
                artifacts: vec![ArtifactDraft {
                    kind: "note".into(),
                    content: "evidence".into(),
                    verification_status: VerificationStatus::Passed,
                }],
            })
        }
    }

    fn atomic_goal(title: &str) -> Goal {
        let contract = ContractValidator::default_contract(GoalType::Achievable, 3);
        Goal::new(title, "", GoalType::Achievable, None, true, contract)
    }

    fn seed(store: &Store, goal: &Goal) {
        store.with_uow(|uow| uow.insert_goal(goal)).unwrap();
    }

    #[test]
    fn capability_inference_collects_distinct_tags() {
        let caps = infer_capabilities("Write and analyze the report", "then email it");
        assert_eq!(caps, vec!["writing", "analysis", "communication"]);
    }

    #[test]
    fn registry_prefers_full_coverage_over_composite() {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(FixedSkill {
            name: "writer",
            caps: vec!["writing".into()],
            fail: false,
        }));
        registry.register(Arc::new(FixedSkill {
            name: "all_rounder",
            caps: vec!["writing".into(), "analysis".into()],
            fail: false,
        }));
        let goal = atomic_goal("write and analyze the numbers");
        let skill = registry.resolve(&goal).unwrap();
        assert_eq!(skill.name(), "all_rounder");
    }

    #[test]
    fn registry_synthesizes_composite_from_partial_matches() {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(FixedSkill {
            name: "writer",
            caps: vec!["writing".into()],
            fail: false,
        }));
        registry.register(Arc::new(FixedSkill {
            name: "analyst",
            caps: vec!["analysis".into()],
            fail: false,
        }));
        let goal = atomic_goal("write and analyze the numbers");
        let skill = registry.resolve(&goal).unwrap();
        assert_eq!(skill.name(), "composite");
        let caps = skill.capabilities();
        assert!(caps.contains(&"writing".to_string()));
        assert!(caps.contains(&"analysis".to_string()));
    }

    #[tokio::test]
    async fn successful_run_completes_goal_with_trace_and_artifacts() {
        let store = Store::open_in_memory().unwrap();
        let goal = atomic_goal("write the summary");
        seed(&store, &goal);

        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(FixedSkill {
            name: "writer",
            caps: vec!["writing".into()],
            fail: false,
        }));
        let service = ExecutionService::new(Arc::new(registry));

        let outcome = service.execute(&store, &goal.id, "test").await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        store
            .with_uow(|uow| {
                let g = uow.get_goal_for_update(&goal.id)?;
                assert_eq!(g.status, GoalStatus::Done);
                assert!((g.progress - 1.0).abs() < f64::EPSILON);
                assert!(g.execution_trace.steps.iter().any(|s| s.step == "writer"));
                assert_eq!(uow.artifacts_for(&goal.id)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn skill_failure_blocks_goal_instead_of_erroring() {
        let store = Store::open_in_memory().unwrap();
        let goal = atomic_goal("write the summary");
        seed(&store, &goal);

        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(FixedSkill {
            name: "writer",
            caps: vec!["writing".into()],
            fail: true,
        }));
        let service = ExecutionService::new(Arc::new(registry));

        let outcome = service.execute(&store, &goal.id, "test").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Blocked(_)));
        store
            .with_uow(|uow| {
                let g = uow.get_goal_for_update(&goal.id)?;
                assert_eq!(g.status, GoalStatus::Blocked);
                let failed = g.execution_trace.failed_steps().next().unwrap();
                assert_eq!(failed.step, "execute_skill");
                assert!(failed.detail.contains("writer"));
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn no_matching_skill_blocks_goal() {
        let store = Store::open_in_memory().unwrap();
        let goal = atomic_goal("write the summary");
        seed(&store, &goal);
        let service = ExecutionService::new(Arc::new(SkillRegistry::new()));
        let outcome = service.execute(&store, &goal.id, "test").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Blocked(_)));
    }

    #[tokio::test]
    async fn gate_veto_freezes_instead_of_completing() {
        struct AlwaysVeto;
        impl CompletionGate for AlwaysVeto {
            fn vet_completion(&self, _: &UnitOfWork<'_>, _: &Goal) -> Result<Option<String>> {
                Ok(Some("budget exhausted".into()))
            }
        }

        let store = Store::open_in_memory().unwrap();
        let goal = atomic_goal("write the summary");
        seed(&store, &goal);

        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(FixedSkill {
            name: "writer",
            caps: vec!["writing".into()],
            fail: false,
        }));
        let service = ExecutionService::new(Arc::new(registry)).with_gate(Arc::new(AlwaysVeto));

        let outcome = service.execute(&store, &goal.id, "test").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Frozen(_)));
        store
            .with_uow(|uow| {
                assert_eq!(uow.get_goal_for_update(&goal.id)?.status, GoalStatus::Frozen);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn composite_goal_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let contract = ContractValidator::default_contract(GoalType::Achievable, 0);
        let goal = Goal::new("big", "", GoalType::Achievable, None, false, contract);
        seed(&store, &goal);
        let service = ExecutionService::new(Arc::new(SkillRegistry::with_builtins()));
        let err = service.execute(&store, &goal.id, "test").await.unwrap_err();
        assert!(matches!(err, TelosError::InvalidOperation(_)));
    }
}

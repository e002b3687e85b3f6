//! Goal records and the contract attached to them.
//!
//! A goal is a node in the task tree. The tree is kept flat: `parent_id` is a
//! back-reference into the store, never an owned pointer, so concurrent
//! mutation and audits stay consistent and cycle-free by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::TelosError;

// ── Enums ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    Achievable,
    Continuous,
    Directional,
    Exploratory,
    Meta,
}

impl GoalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalType::Achievable => "achievable",
            GoalType::Continuous => "continuous",
            GoalType::Directional => "directional",
            GoalType::Exploratory => "exploratory",
            GoalType::Meta => "meta",
        }
    }
}

impl std::fmt::Display for GoalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GoalType {
    type Err = TelosError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "achievable" => Ok(GoalType::Achievable),
            "continuous" => Ok(GoalType::Continuous),
            "directional" => Ok(GoalType::Directional),
            "exploratory" => Ok(GoalType::Exploratory),
            "meta" => Ok(GoalType::Meta),
            other => Err(TelosError::UnknownGoalType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    Active,
    Done,
    Blocked,
    Frozen,
    Incomplete,
    Ongoing,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::Pending => "pending",
            GoalStatus::Active => "active",
            GoalStatus::Done => "done",
            GoalStatus::Blocked => "blocked",
            GoalStatus::Frozen => "frozen",
            GoalStatus::Incomplete => "incomplete",
            GoalStatus::Ongoing => "ongoing",
        }
    }

    /// Terminal states have no outgoing transition edges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, GoalStatus::Done | GoalStatus::Incomplete)
    }
}

impl std::fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GoalStatus {
    type Err = TelosError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(GoalStatus::Pending),
            "active" => Ok(GoalStatus::Active),
            "done" => Ok(GoalStatus::Done),
            "blocked" => Ok(GoalStatus::Blocked),
            "frozen" => Ok(GoalStatus::Frozen),
            "incomplete" => Ok(GoalStatus::Incomplete),
            "ongoing" => Ok(GoalStatus::Ongoing),
            other => Err(TelosError::InvalidOperation(format!(
                "unknown goal status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Completion derives automatically from children (or, for atomic goals,
    /// from strict evaluation of the goal itself).
    Aggregate,
    /// Completion requires an explicit human approval record.
    Manual,
    /// Completion requires a passing strict-evaluation result.
    Strict,
}

impl CompletionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionMode::Aggregate => "aggregate",
            CompletionMode::Manual => "manual",
            CompletionMode::Strict => "strict",
        }
    }
}

impl std::str::FromStr for CompletionMode {
    type Err = TelosError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aggregate" => Ok(CompletionMode::Aggregate),
            "manual" => Ok(CompletionMode::Manual),
            "strict" => Ok(CompletionMode::Strict),
            other => Err(TelosError::InvalidOperation(format!(
                "unknown completion mode: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Active,
    Frozen,
    Mutated,
    Deprecated,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Active => "active",
            MutationStatus::Frozen => "frozen",
            MutationStatus::Mutated => "mutated",
            MutationStatus::Deprecated => "deprecated",
        }
    }
}

impl std::str::FromStr for MutationStatus {
    type Err = TelosError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MutationStatus::Active),
            "frozen" => Ok(MutationStatus::Frozen),
            "mutated" => Ok(MutationStatus::Mutated),
            "deprecated" => Ok(MutationStatus::Deprecated),
            other => Err(TelosError::InvalidOperation(format!(
                "unknown mutation status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    Binary,
    Scalar,
    Trend,
}

impl EvaluationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationMode::Binary => "binary",
            EvaluationMode::Scalar => "scalar",
            EvaluationMode::Trend => "trend",
        }
    }
}

impl std::str::FromStr for EvaluationMode {
    type Err = TelosError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(EvaluationMode::Binary),
            "scalar" => Ok(EvaluationMode::Scalar),
            "trend" => Ok(EvaluationMode::Trend),
            other => Err(TelosError::InvalidOperation(format!(
                "unknown evaluation mode: {other}"
            ))),
        }
    }
}

/// Maximum tree depth: 0 = mission, 3 = atomic leaf.
pub const MAX_DEPTH: u32 = 3;

// ── Contract ────────────────────────────────────────────────────────────────

/// Permission and limit object attached to every goal at creation.
///
/// Contracts are always synthesized by the validator, never trusted verbatim
/// from the oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoalContract {
    pub allowed_actions: Vec<String>,
    pub forbidden_actions: Vec<String>,
    pub max_depth: u32,
    pub max_subgoals: u32,
    pub evaluation_mode: EvaluationMode,
    pub timeout_seconds: u64,
    pub resource_limits: HashMap<String, f64>,
}

impl GoalContract {
    pub fn allows(&self, action: &str) -> bool {
        if self.forbidden_actions.iter().any(|a| a == action) {
            return false;
        }
        self.allowed_actions.is_empty() || self.allowed_actions.iter().any(|a| a == action)
    }

    /// Scalar-evaluation pass threshold, overridable through resource limits.
    pub fn scalar_threshold(&self) -> f64 {
        self.resource_limits
            .get("scalar_threshold")
            .copied()
            .unwrap_or(0.8)
    }
}

// ── Mutation history ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Strengthen,
    Weaken,
    ChangeType,
    Freeze,
    Thaw,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Strengthen => "strengthen",
            MutationKind::Weaken => "weaken",
            MutationKind::ChangeType => "change_type",
            MutationKind::Freeze => "freeze",
            MutationKind::Thaw => "thaw",
        }
    }
}

/// One entry of the append-only mutation log. Entries are never edited or
/// removed once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub reason: String,
    pub actor: String,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ── Execution trace ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub step: String,
    pub outcome: StepOutcome,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Structured, timestamped record of what the execution pipeline did to a
/// goal: selection, execution, verification, evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub steps: Vec<TraceStep>,
}

impl ExecutionTrace {
    pub fn push(&mut self, step: &str, outcome: StepOutcome, detail: impl Into<String>) {
        self.steps.push(TraceStep {
            step: step.to_string(),
            outcome,
            detail: detail.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &TraceStep> {
        self.steps.iter().filter(|s| s.outcome == StepOutcome::Failed)
    }
}

// ── Evaluation result ───────────────────────────────────────────────────────

/// Outcome of a strict evaluation. Only this result type is allowed to drive
/// a status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub passed: bool,
    pub score: f64,
    pub mode: EvaluationMode,
    pub reasoning: String,
    pub evaluated_at: DateTime<Utc>,
}

// ── Goal ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub goal_type: GoalType,
    pub depth_level: u32,
    pub is_atomic: bool,
    pub domains: Vec<String>,
    pub status: GoalStatus,
    pub completion_mode: CompletionMode,
    pub progress: f64,
    pub contract: GoalContract,
    pub mutation_status: MutationStatus,
    pub mutation_history: Vec<MutationRecord>,
    pub evaluation_result: Option<EvaluationResult>,
    pub execution_trace: ExecutionTrace,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    /// Build a new pending goal. Depth is computed from the parent; atomic
    /// goals are forced to aggregate completion (a leaf has no children to
    /// wait on and no approver in the loop).
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        goal_type: GoalType,
        parent: Option<&Goal>,
        is_atomic: bool,
        contract: GoalContract,
    ) -> Self {
        let depth_level = parent.map(|p| p.depth_level + 1).unwrap_or(0);
        let is_atomic = is_atomic || depth_level >= MAX_DEPTH;
        let now = Utc::now();
        Self {
            id: format!("goal_{}", uuid::Uuid::new_v4()),
            parent_id: parent.map(|p| p.id.clone()),
            title: title.into(),
            description: description.into(),
            goal_type,
            depth_level,
            is_atomic,
            domains: Vec::new(),
            status: GoalStatus::Pending,
            completion_mode: CompletionMode::Aggregate,
            progress: 0.0,
            contract,
            mutation_status: MutationStatus::Active,
            mutation_history: Vec::new(),
            evaluation_result: None,
            execution_trace: ExecutionTrace::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }

    /// Set the completion mode. Atomic goals stay aggregate no matter what
    /// the caller asks for.
    pub fn with_completion_mode(mut self, mode: CompletionMode) -> Self {
        if !self.is_atomic {
            self.completion_mode = mode;
        }
        self
    }

    pub fn record_mutation(
        &mut self,
        kind: MutationKind,
        reason: &str,
        actor: &str,
        detail: serde_json::Value,
    ) {
        self.mutation_history.push(MutationRecord {
            kind,
            reason: reason.to_string(),
            actor: actor.to_string(),
            detail,
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }
}

// ── Completion approval ─────────────────────────────────────────────────────

/// Proof obligation for manual completion: a goal with
/// `completion_mode = manual` may only reach `done` when one of these exists.
/// Uniqueness on `goal_id` is enforced by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionApproval {
    pub goal_id: String,
    pub approved_by: String,
    pub authority_level: String,
    pub comment: String,
    pub approved_at: DateTime<Utc>,
}

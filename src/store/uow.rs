//! Unit of work: every read and staged write of one transaction scope.
//!
//! Row mappers fail loudly: a row that no longer parses into its domain type
//! is a storage error, not something to paper over with a default.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, OptionalExtension, Transaction};
use std::str::FromStr;

use crate::error::{Result, TelosError};
use crate::execute::{ArtifactRecord, VerificationStatus};
use crate::goal::{
    CompletionApproval, CompletionMode, ExecutionTrace, Goal, GoalContract, GoalStatus, GoalType,
    MutationRecord, MutationStatus,
};
use crate::policy::PolicyRule;
use crate::safety::{ConstraintType, SafetyConstraint, SafetyViolation};
use crate::store::OrchestratorStats;
use crate::strategy::{ExpectedOutcome, Strategy, StrategyStatus};
use crate::system_state::{EntityType, SystemStateEntity, TrendDirection, TrendPoint};
use crate::transition::TransitionAudit;

pub struct UnitOfWork<'conn> {
    tx: Transaction<'conn>,
}

const GOAL_COLUMNS: &str = "id, parent_id, title, description, goal_type, depth_level, is_atomic, \
     domains, status, completion_mode, progress, contract, mutation_status, mutation_history, \
     evaluation_result, execution_trace, created_at, updated_at";

impl<'conn> UnitOfWork<'conn> {
    pub(super) fn new(tx: Transaction<'conn>) -> Self {
        Self { tx }
    }

    pub(super) fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    // ── Goals ───────────────────────────────────────────────────────────────

    pub fn insert_goal(&self, goal: &Goal) -> Result<()> {
        self.tx.execute(
            &format!("INSERT INTO goals ({GOAL_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)"),
            params![
                goal.id,
                goal.parent_id,
                goal.title,
                goal.description,
                goal.goal_type.as_str(),
                goal.depth_level,
                goal.is_atomic,
                serde_json::to_string(&goal.domains)?,
                goal.status.as_str(),
                goal.completion_mode.as_str(),
                goal.progress,
                serde_json::to_string(&goal.contract)?,
                goal.mutation_status.as_str(),
                serde_json::to_string(&goal.mutation_history)?,
                goal.evaluation_result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&goal.execution_trace)?,
                goal.created_at.to_rfc3339(),
                goal.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_goal(&self, goal: &Goal) -> Result<()> {
        let n = self.tx.execute(
            "UPDATE goals SET
                 parent_id = ?2, title = ?3, description = ?4, goal_type = ?5,
                 depth_level = ?6, is_atomic = ?7, domains = ?8, status = ?9,
                 completion_mode = ?10, progress = ?11, contract = ?12,
                 mutation_status = ?13, mutation_history = ?14,
                 evaluation_result = ?15, execution_trace = ?16, updated_at = ?17
             WHERE id = ?1",
            params![
                goal.id,
                goal.parent_id,
                goal.title,
                goal.description,
                goal.goal_type.as_str(),
                goal.depth_level,
                goal.is_atomic,
                serde_json::to_string(&goal.domains)?,
                goal.status.as_str(),
                goal.completion_mode.as_str(),
                goal.progress,
                serde_json::to_string(&goal.contract)?,
                goal.mutation_status.as_str(),
                serde_json::to_string(&goal.mutation_history)?,
                goal.evaluation_result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&goal.execution_trace)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if n == 0 {
            return Err(TelosError::NotFound(format!("goal {}", goal.id)));
        }
        Ok(())
    }

    pub fn get_goal(&self, id: &str) -> Result<Option<Goal>> {
        let goal = self
            .tx
            .query_row(
                &format!("SELECT {GOAL_COLUMNS} FROM goals WHERE id = ?1"),
                params![id],
                row_to_goal,
            )
            .optional()?;
        Ok(goal)
    }

    /// Fetch with intent to mutate. The exclusive lock is already held by
    /// the open transaction; this variant exists so call sites say what they
    /// mean and get a hard error for a missing row.
    pub fn get_goal_for_update(&self, id: &str) -> Result<Goal> {
        self.get_goal(id)?
            .ok_or_else(|| TelosError::NotFound(format!("goal {id}")))
    }

    /// Lock an id-set with one statement. Missing ids are simply absent from
    /// the result; callers diff against the request.
    pub fn bulk_get_for_update(&self, ids: &[String]) -> Result<Vec<Goal>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("SELECT {GOAL_COLUMNS} FROM goals WHERE id IN ({placeholders})");
        let mut stmt = self.tx.prepare(&sql)?;
        let goals = stmt
            .query_map(params_from_iter(ids.iter()), row_to_goal)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    pub fn children_of(&self, parent_id: &str) -> Result<Vec<Goal>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {GOAL_COLUMNS} FROM goals WHERE parent_id = ?1 ORDER BY created_at"
        ))?;
        let goals = stmt
            .query_map(params![parent_id], row_to_goal)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    pub fn count_children(&self, parent_id: &str) -> Result<u32> {
        let n: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM goals WHERE parent_id = ?1",
            params![parent_id],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }

    pub fn goals_with_status(&self, status: GoalStatus, limit: usize) -> Result<Vec<Goal>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {GOAL_COLUMNS} FROM goals WHERE status = ?1 ORDER BY created_at LIMIT ?2"
        ))?;
        let goals = stmt
            .query_map(params![status.as_str(), limit as i64], row_to_goal)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    pub fn pending_atomic_goals(&self, limit: usize) -> Result<Vec<Goal>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {GOAL_COLUMNS} FROM goals
             WHERE status = 'pending' AND is_atomic = 1
             ORDER BY created_at LIMIT ?1"
        ))?;
        let goals = stmt
            .query_map(params![limit as i64], row_to_goal)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    /// Composite goals in `status` that have no children yet — the rows the
    /// scheduler feeds to decomposition.
    pub fn childless_composites(&self, status: GoalStatus, limit: usize) -> Result<Vec<Goal>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {GOAL_COLUMNS} FROM goals g
             WHERE g.status = ?1 AND g.is_atomic = 0
               AND NOT EXISTS (SELECT 1 FROM goals c WHERE c.parent_id = g.id)
             ORDER BY g.created_at LIMIT ?2"
        ))?;
        let goals = stmt
            .query_map(params![status.as_str(), limit as i64], row_to_goal)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    /// Non-atomic goals ordered deepest-first, for bottom-up aggregation.
    pub fn composites_deepest_first(&self) -> Result<Vec<Goal>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {GOAL_COLUMNS} FROM goals
             WHERE is_atomic = 0 ORDER BY depth_level DESC, created_at"
        ))?;
        let goals = stmt
            .query_map([], row_to_goal)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    pub fn count_in_flight_goals(&self) -> Result<u32> {
        let n: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM goals WHERE status IN ('active','ongoing')",
            [],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }

    pub fn count_in_flight_exploratory_goals(&self) -> Result<u32> {
        let n: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM goals
             WHERE goal_type = 'exploratory' AND status IN ('active','ongoing')",
            [],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }

    pub fn count_goals_created_since(&self, since: DateTime<Utc>) -> Result<u32> {
        let n: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM goals WHERE created_at >= ?1",
            params![since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }

    pub fn goal_stats(&self) -> Result<OrchestratorStats> {
        let mut stats = OrchestratorStats::default();
        let mut stmt = self
            .tx
            .prepare("SELECT status, COUNT(*) FROM goals GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, n) = row?;
            stats.total_goals += n as u64;
            stats.by_status.insert(status, n as u64);
        }
        let mut stmt = self
            .tx
            .prepare("SELECT goal_type, COUNT(*) FROM goals GROUP BY goal_type")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (goal_type, n) = row?;
            stats.by_type.insert(goal_type, n as u64);
        }
        let atomic: i64 =
            self.tx
                .query_row("SELECT COUNT(*) FROM goals WHERE is_atomic = 1", [], |r| {
                    r.get(0)
                })?;
        stats.atomic_goals = atomic as u64;
        let violations: i64 =
            self.tx
                .query_row("SELECT COUNT(*) FROM safety_violation_log", [], |r| {
                    r.get(0)
                })?;
        stats.safety_violations = violations as u64;
        Ok(stats)
    }

    // ── Invariant queries (read-only, re-derived from rows) ─────────────────

    /// I1: non-atomic goal with children must not be pending.
    pub fn non_atomic_pending_with_children(&self) -> Result<Vec<String>> {
        self.id_query(
            "SELECT g.id FROM goals g
             WHERE g.is_atomic = 0 AND g.status = 'pending'
               AND EXISTS (SELECT 1 FROM goals c WHERE c.parent_id = g.id)",
        )
    }

    /// I2: non-atomic active goal must have at least one child.
    pub fn non_atomic_active_without_children(&self) -> Result<Vec<String>> {
        self.id_query(
            "SELECT g.id FROM goals g
             WHERE g.is_atomic = 0 AND g.status = 'active'
               AND NOT EXISTS (SELECT 1 FROM goals c WHERE c.parent_id = g.id)",
        )
    }

    /// I3: aggregate parent whose children are all done should itself be done.
    pub fn aggregate_parents_behind_children(&self) -> Result<Vec<String>> {
        self.id_query(
            "SELECT g.id FROM goals g
             WHERE g.is_atomic = 0 AND g.completion_mode = 'aggregate'
               AND g.status != 'done'
               AND EXISTS (SELECT 1 FROM goals c WHERE c.parent_id = g.id)
               AND NOT EXISTS (SELECT 1 FROM goals c
                               WHERE c.parent_id = g.id AND c.status != 'done')",
        )
    }

    /// I4: manual goal marked done without an approval record.
    pub fn manual_done_without_approval(&self) -> Result<Vec<String>> {
        self.id_query(
            "SELECT g.id FROM goals g
             WHERE g.completion_mode = 'manual' AND g.status = 'done'
               AND NOT EXISTS (SELECT 1 FROM goal_completion_approvals a
                               WHERE a.goal_id = g.id)",
        )
    }

    /// I5: atomic goal with a completion mode other than aggregate.
    pub fn atomic_non_aggregate(&self) -> Result<Vec<String>> {
        self.id_query(
            "SELECT id FROM goals
             WHERE is_atomic = 1 AND completion_mode != 'aggregate'",
        )
    }

    /// I6: done parent with unfinished children and no manual override.
    pub fn done_parents_with_unfinished_children(&self) -> Result<Vec<String>> {
        self.id_query(
            "SELECT DISTINCT g.id FROM goals g
             WHERE g.status = 'done'
               AND EXISTS (SELECT 1 FROM goals c
                           WHERE c.parent_id = g.id AND c.status != 'done')
               AND NOT EXISTS (SELECT 1 FROM goal_completion_approvals a
                               WHERE a.goal_id = g.id)",
        )
    }

    fn id_query(&self, sql: &str) -> Result<Vec<String>> {
        let mut stmt = self.tx.prepare(sql)?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ── Completion approvals ────────────────────────────────────────────────

    /// Returns false when an approval already exists. The primary key on
    /// `goal_id` converts a double-approve race into a domain answer instead
    /// of a storage error.
    pub fn insert_approval(&self, approval: &CompletionApproval) -> Result<bool> {
        let n = self.tx.execute(
            "INSERT OR IGNORE INTO goal_completion_approvals
                 (goal_id, approved_by, authority_level, comment, approved_at)
             VALUES (?1,?2,?3,?4,?5)",
            params![
                approval.goal_id,
                approval.approved_by,
                approval.authority_level,
                approval.comment,
                approval.approved_at.to_rfc3339(),
            ],
        )?;
        Ok(n > 0)
    }

    pub fn get_approval(&self, goal_id: &str) -> Result<Option<CompletionApproval>> {
        let approval = self
            .tx
            .query_row(
                "SELECT goal_id, approved_by, authority_level, comment, approved_at
                 FROM goal_completion_approvals WHERE goal_id = ?1",
                params![goal_id],
                |r| {
                    Ok(CompletionApproval {
                        goal_id: r.get(0)?,
                        approved_by: r.get(1)?,
                        authority_level: r.get(2)?,
                        comment: r.get(3)?,
                        approved_at: parse_ts(r.get::<_, String>(4)?, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(approval)
    }

    // ── Transition audit ────────────────────────────────────────────────────

    pub fn insert_transition_audit(&self, audit: &TransitionAudit) -> Result<()> {
        self.tx.execute(
            "INSERT INTO transition_audit
                 (goal_id, from_status, to_status, outcome, reason, actor, source, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                audit.goal_id,
                audit.from_status.as_str(),
                audit.to_status.as_str(),
                audit.outcome,
                audit.reason,
                audit.actor,
                audit.source,
                audit.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn transition_audits_for(&self, goal_id: &str, limit: usize) -> Result<Vec<TransitionAudit>> {
        let mut stmt = self.tx.prepare(
            "SELECT goal_id, from_status, to_status, outcome, reason, actor, source, created_at
             FROM transition_audit WHERE goal_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let audits = stmt
            .query_map(params![goal_id, limit as i64], |r| {
                Ok(TransitionAudit {
                    goal_id: r.get(0)?,
                    from_status: parse_col::<GoalStatus>(r.get::<_, String>(1)?, 1)?,
                    to_status: parse_col::<GoalStatus>(r.get::<_, String>(2)?, 2)?,
                    outcome: r.get(3)?,
                    reason: r.get(4)?,
                    actor: r.get(5)?,
                    source: r.get(6)?,
                    created_at: parse_ts(r.get::<_, String>(7)?, 7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(audits)
    }

    // ── Artifacts ───────────────────────────────────────────────────────────

    pub fn insert_artifact(&self, artifact: &ArtifactRecord) -> Result<()> {
        self.tx.execute(
            "INSERT INTO artifacts (id, goal_id, kind, content, verification_status, created_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                artifact.id,
                artifact.goal_id,
                artifact.kind,
                artifact.content,
                artifact.verification_status.as_str(),
                artifact.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn artifacts_for(&self, goal_id: &str) -> Result<Vec<ArtifactRecord>> {
        let mut stmt = self.tx.prepare(
            "SELECT id, goal_id, kind, content, verification_status, created_at
             FROM artifacts WHERE goal_id = ?1 ORDER BY created_at",
        )?;
        let artifacts = stmt
            .query_map(params![goal_id], |r| {
                Ok(ArtifactRecord {
                    id: r.get(0)?,
                    goal_id: r.get(1)?,
                    kind: r.get(2)?,
                    content: r.get(3)?,
                    verification_status: parse_col::<VerificationStatus>(
                        r.get::<_, String>(4)?,
                        4,
                    )?,
                    created_at: parse_ts(r.get::<_, String>(5)?, 5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(artifacts)
    }

    // ── Policy rules ────────────────────────────────────────────────────────

    pub fn upsert_policy_rule(&self, rule: &PolicyRule) -> Result<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO policy_rules
                 (name, entity_name, entity_type, condition_expression, action_type,
                  action_payload, priority, cooldown_minutes, last_triggered, enabled)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                rule.name,
                rule.entity_name,
                rule.entity_type,
                rule.condition_expression,
                rule.action_type,
                serde_json::to_string(&rule.action_payload)?,
                rule.priority,
                rule.cooldown_minutes,
                rule.last_triggered.map(|t| t.to_rfc3339()),
                rule.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn get_policy_rule(&self, name: &str) -> Result<Option<PolicyRule>> {
        let rule = self
            .tx
            .query_row(
                "SELECT name, entity_name, entity_type, condition_expression, action_type,
                        action_payload, priority, cooldown_minutes, last_triggered, enabled
                 FROM policy_rules WHERE name = ?1",
                params![name],
                row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    pub fn enabled_rules_for_entity(&self, entity_name: &str) -> Result<Vec<PolicyRule>> {
        let mut stmt = self.tx.prepare(
            "SELECT name, entity_name, entity_type, condition_expression, action_type,
                    action_payload, priority, cooldown_minutes, last_triggered, enabled
             FROM policy_rules
             WHERE entity_name = ?1 AND enabled = 1
             ORDER BY priority ASC, name ASC",
        )?;
        let rules = stmt
            .query_map(params![entity_name], row_to_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    pub fn touch_rule_trigger(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let n = self.tx.execute(
            "UPDATE policy_rules SET last_triggered = ?2 WHERE name = ?1",
            params![name, at.to_rfc3339()],
        )?;
        if n == 0 {
            return Err(TelosError::NotFound(format!("policy rule {name}")));
        }
        Ok(())
    }

    // ── Safety ──────────────────────────────────────────────────────────────

    pub fn upsert_constraint(&self, constraint: &SafetyConstraint) -> Result<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO safety_constraints (constraint_type, limit_value, enabled)
             VALUES (?1,?2,?3)",
            params![
                constraint.constraint_type.as_str(),
                constraint.limit,
                constraint.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn get_constraint(&self, constraint_type: ConstraintType) -> Result<Option<SafetyConstraint>> {
        let constraint = self
            .tx
            .query_row(
                "SELECT constraint_type, limit_value, enabled
                 FROM safety_constraints WHERE constraint_type = ?1",
                params![constraint_type.as_str()],
                |r| {
                    Ok(SafetyConstraint {
                        constraint_type: parse_col::<ConstraintType>(r.get::<_, String>(0)?, 0)?,
                        limit: r.get(1)?,
                        enabled: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(constraint)
    }

    pub fn insert_safety_violation(&self, violation: &SafetyViolation) -> Result<()> {
        self.tx.execute(
            "INSERT INTO safety_violation_log
                 (constraint_type, limit_value, current_value, action, detail, created_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                violation.constraint_type.as_str(),
                violation.limit,
                violation.current_value,
                violation.action,
                violation.detail,
                violation.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_safety_violations(&self, limit: usize) -> Result<Vec<SafetyViolation>> {
        let mut stmt = self.tx.prepare(
            "SELECT constraint_type, limit_value, current_value, action, detail, created_at
             FROM safety_violation_log ORDER BY id DESC LIMIT ?1",
        )?;
        let violations = stmt
            .query_map(params![limit as i64], |r| {
                Ok(SafetyViolation {
                    constraint_type: parse_col::<ConstraintType>(r.get::<_, String>(0)?, 0)?,
                    limit: r.get(1)?,
                    current_value: r.get(2)?,
                    action: r.get(3)?,
                    detail: r.get(4)?,
                    created_at: parse_ts(r.get::<_, String>(5)?, 5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(violations)
    }

    pub fn insert_spend(&self, amount: f64, purpose: &str) -> Result<()> {
        self.tx.execute(
            "INSERT INTO spend_log (amount, purpose, created_at) VALUES (?1,?2,?3)",
            params![amount, purpose, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn spend_since(&self, since: DateTime<Utc>) -> Result<f64> {
        let total: f64 = self.tx.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM spend_log WHERE created_at >= ?1",
            params![since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    // ── System state ────────────────────────────────────────────────────────

    pub fn upsert_system_entity(&self, entity: &SystemStateEntity) -> Result<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO system_state
                 (entity_name, entity_type, current_value, previous_value, confidence,
                  trend, rolling_average, evaluation_window_days, trend_history, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                entity.entity_name,
                entity.entity_type.as_str(),
                entity.current_value,
                entity.previous_value,
                entity.confidence,
                entity.trend.as_str(),
                entity.rolling_average,
                entity.evaluation_window_days,
                serde_json::to_string(&entity.trend_history)?,
                entity.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_system_entity(&self, entity_name: &str) -> Result<Option<SystemStateEntity>> {
        let entity = self
            .tx
            .query_row(
                "SELECT entity_name, entity_type, current_value, previous_value, confidence,
                        trend, rolling_average, evaluation_window_days, trend_history, updated_at
                 FROM system_state WHERE entity_name = ?1",
                params![entity_name],
                |r| {
                    Ok(SystemStateEntity {
                        entity_name: r.get(0)?,
                        entity_type: parse_col::<EntityType>(r.get::<_, String>(1)?, 1)?,
                        current_value: r.get(2)?,
                        previous_value: r.get(3)?,
                        confidence: r.get(4)?,
                        trend: parse_col::<TrendDirection>(r.get::<_, String>(5)?, 5)?,
                        rolling_average: r.get(6)?,
                        evaluation_window_days: r.get(7)?,
                        trend_history: parse_json::<Vec<TrendPoint>>(r.get::<_, String>(8)?, 8)?,
                        updated_at: parse_ts(r.get::<_, String>(9)?, 9)?,
                    })
                },
            )
            .optional()?;
        Ok(entity)
    }

    // ── Strategies ──────────────────────────────────────────────────────────

    pub fn insert_strategy(&self, strategy: &Strategy) -> Result<()> {
        self.tx.execute(
            "INSERT INTO strategies
                 (id, hypothesis, expected_outcome, status, confidence, linked_goal_ids,
                  activated_at, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                strategy.id,
                strategy.hypothesis,
                serde_json::to_string(&strategy.expected_outcome)?,
                strategy.status.as_str(),
                strategy.confidence,
                serde_json::to_string(&strategy.linked_goal_ids)?,
                strategy.activated_at.map(|t| t.to_rfc3339()),
                strategy.created_at.to_rfc3339(),
                strategy.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_strategy(&self, strategy: &Strategy) -> Result<()> {
        let n = self.tx.execute(
            "UPDATE strategies SET
                 hypothesis = ?2, expected_outcome = ?3, status = ?4, confidence = ?5,
                 linked_goal_ids = ?6, activated_at = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                strategy.id,
                strategy.hypothesis,
                serde_json::to_string(&strategy.expected_outcome)?,
                strategy.status.as_str(),
                strategy.confidence,
                serde_json::to_string(&strategy.linked_goal_ids)?,
                strategy.activated_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        if n == 0 {
            return Err(TelosError::NotFound(format!("strategy {}", strategy.id)));
        }
        Ok(())
    }

    pub fn get_strategy(&self, id: &str) -> Result<Option<Strategy>> {
        let strategy = self
            .tx
            .query_row(
                "SELECT id, hypothesis, expected_outcome, status, confidence, linked_goal_ids,
                        activated_at, created_at, updated_at
                 FROM strategies WHERE id = ?1",
                params![id],
                row_to_strategy,
            )
            .optional()?;
        Ok(strategy)
    }

    pub fn count_active_strategies(&self) -> Result<u32> {
        let n: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM strategies WHERE status = 'active'",
            [],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }
}

// ── Row mappers ─────────────────────────────────────────────────────────────

fn row_to_goal(row: &rusqlite::Row<'_>) -> rusqlite::Result<Goal> {
    Ok(Goal {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        goal_type: parse_col::<GoalType>(row.get::<_, String>(4)?, 4)?,
        depth_level: row.get(5)?,
        is_atomic: row.get(6)?,
        domains: parse_json::<Vec<String>>(row.get::<_, String>(7)?, 7)?,
        status: parse_col::<GoalStatus>(row.get::<_, String>(8)?, 8)?,
        completion_mode: parse_col::<CompletionMode>(row.get::<_, String>(9)?, 9)?,
        progress: row.get(10)?,
        contract: parse_json::<GoalContract>(row.get::<_, String>(11)?, 11)?,
        mutation_status: parse_col::<MutationStatus>(row.get::<_, String>(12)?, 12)?,
        mutation_history: parse_json::<Vec<MutationRecord>>(row.get::<_, String>(13)?, 13)?,
        evaluation_result: row
            .get::<_, Option<String>>(14)?
            .map(|s| parse_json(s, 14))
            .transpose()?,
        execution_trace: parse_json::<ExecutionTrace>(row.get::<_, String>(15)?, 15)?,
        created_at: parse_ts(row.get::<_, String>(16)?, 16)?,
        updated_at: parse_ts(row.get::<_, String>(17)?, 17)?,
    })
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<PolicyRule> {
    Ok(PolicyRule {
        name: row.get(0)?,
        entity_name: row.get(1)?,
        entity_type: row.get(2)?,
        condition_expression: row.get(3)?,
        action_type: row.get(4)?,
        action_payload: parse_json(row.get::<_, String>(5)?, 5)?,
        priority: row.get(6)?,
        cooldown_minutes: row.get(7)?,
        last_triggered: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_ts(s, 8))
            .transpose()?,
        enabled: row.get(9)?,
    })
}

fn row_to_strategy(row: &rusqlite::Row<'_>) -> rusqlite::Result<Strategy> {
    Ok(Strategy {
        id: row.get(0)?,
        hypothesis: row.get(1)?,
        expected_outcome: parse_json::<ExpectedOutcome>(row.get::<_, String>(2)?, 2)?,
        status: parse_col::<StrategyStatus>(row.get::<_, String>(3)?, 3)?,
        confidence: row.get(4)?,
        linked_goal_ids: parse_json::<Vec<String>>(row.get::<_, String>(5)?, 5)?,
        activated_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_ts(s, 6))
            .transpose()?,
        created_at: parse_ts(row.get::<_, String>(7)?, 7)?,
        updated_at: parse_ts(row.get::<_, String>(8)?, 8)?,
    })
}

fn parse_col<T>(raw: String, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = TelosError>,
{
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: String, idx: usize) -> rusqlite::Result<T> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_ts(raw: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
